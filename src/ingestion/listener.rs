//! TCP accept loop for anchor data sources

use crate::ingestion::error::{ConnectionError, ConnectionResult};
use crate::ingestion::pipeline::FramePipeline;
use crate::ingestion::session::IngestionSession;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::Instrument;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listening socket that spawns one session task per connection
pub struct IngestionListener {
    listener: TcpListener,
    pipeline: FramePipeline,
    max_line_bytes: usize,
}

impl IngestionListener {
    pub async fn bind(address: &str, pipeline: FramePipeline, max_line_bytes: usize) -> ConnectionResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ConnectionError::BindFailed {
                address: address.to_string(),
                details: e.to_string(),
            })?;

        Ok(Self {
            listener,
            pipeline,
            max_line_bytes,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub async fn serve(self) {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(address) = self.local_addr() {
            tracing::info!("TCP server listening on {}", address);
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("ingestion listener stopped");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        let error = ConnectionError::from_accept(&e);
                        tracing::warn!("{}", error);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "failed to set TCP_NODELAY: {}", e);
        }

        let mut session = IngestionSession::new(stream, peer.to_string(), self.pipeline.clone(), self.max_line_bytes);
        let span = tracing::info_span!("session", %peer);

        tokio::spawn(
            async move {
                tracing::info!("UWB data source connected");
                match session.run().await {
                    Ok(summary) => tracing::info!(
                        bytes = summary.bytes_read,
                        frames = summary.frames_forwarded,
                        parse_errors = summary.parse_errors,
                        solved = summary.positions_solved,
                        unsolved = summary.positions_unsolved,
                        "UWB data source disconnected"
                    ),
                    Err(e) => tracing::warn!("session ended: {}", e),
                }
            }
            .instrument(span),
        );
    }
}
