//! One anchor data source connection
//!
//! A session reads its socket, feeds the bytes through its own
//! [`FrameParser`], and dispatches each decoded frame before reading again.
//! Bad records are logged and skipped; only a socket failure ends a session
//! early, and it never affects other sessions.

use crate::ingestion::error::{ConnectionError, ConnectionResult};
use crate::ingestion::pipeline::FramePipeline;
use crate::core::{MeasurementFrame, TagPosition};
use crate::processing::{FrameParser, ParseError};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_BYTES: usize = 4096;

/// Lifecycle of an ingestion session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no bytes yet
    Connected,
    /// At least one byte received
    Streaming,
    /// Peer closed, connection failed, or shut down locally
    Closed,
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub bytes_read: u64,
    pub frames_forwarded: u64,
    pub parse_errors: u64,
    pub positions_solved: u64,
    pub positions_unsolved: u64,
}

/// Ingestion state for one connection
pub struct IngestionSession<S> {
    peer: String,
    stream: S,
    parser: FrameParser,
    pipeline: FramePipeline,
    state: SessionState,
    summary: SessionSummary,
}

impl<S: AsyncRead + Unpin> IngestionSession<S> {
    pub fn new(stream: S, peer: impl Into<String>, pipeline: FramePipeline, max_line_bytes: usize) -> Self {
        Self {
            peer: peer.into(),
            stream,
            parser: FrameParser::with_max_line_bytes(max_line_bytes),
            pipeline,
            state: SessionState::Connected,
            summary: SessionSummary::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Drive the session until the peer disconnects.
    ///
    /// On a clean close, a final unterminated record is still dispatched.
    /// The session is left in [`SessionState::Closed`] either way.
    pub async fn run(&mut self) -> ConnectionResult<SessionSummary> {
        let mut buffer = [0u8; READ_BUFFER_BYTES];

        loop {
            let read = match self.stream.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    self.transition(SessionState::Closed);
                    return Err(ConnectionError::from_read(&self.peer, &e));
                }
            };

            if read == 0 {
                while let Some(result) = self.parser.finish() {
                    self.handle(result);
                }
                self.transition(SessionState::Closed);
                return Ok(self.summary);
            }

            if self.state == SessionState::Connected {
                self.transition(SessionState::Streaming);
            }
            self.summary.bytes_read += read as u64;
            self.parser.push(&buffer[..read]);

            while let Some(result) = self.parser.next_frame() {
                self.handle(result);
            }
        }
    }

    fn handle(&mut self, result: Result<MeasurementFrame, ParseError>) {
        match result {
            Ok(frame) => {
                let dispatch = self.pipeline.dispatch(&frame);
                self.summary.frames_forwarded += 1;
                match dispatch.position {
                    Some(TagPosition::Solved { .. }) => self.summary.positions_solved += 1,
                    Some(TagPosition::Unsolved) => self.summary.positions_unsolved += 1,
                    None => {}
                }
            }
            Err(e) => {
                self.summary.parse_errors += 1;
                tracing::warn!(peer = %self.peer, errors = self.summary.parse_errors, "invalid record skipped: {}", e);
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(peer = %self.peer, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::core::DEFAULT_MAX_LINE_BYTES;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    async fn run_to_end(
        mut session: IngestionSession<DuplexStream>,
    ) -> (SessionState, ConnectionResult<SessionSummary>) {
        let result = session.run().await;
        (session.state(), result)
    }

    #[tokio::test]
    async fn test_frames_forwarded_across_split_writes() {
        let hub = BroadcastHub::new(16);
        let mut client = hub.subscribe();
        let (mut source, stream) = tokio::io::duplex(64);

        let session = IngestionSession::new(stream, "test", FramePipeline::relay_only(hub.clone()), DEFAULT_MAX_LINE_BYTES);
        assert_eq!(session.state(), SessionState::Connected);
        let task = tokio::spawn(run_to_end(session));

        source.write_all(b"{\"links\":[{\"anchorId\":\"A1\",").await.unwrap();
        source.flush().await.unwrap();
        tokio::task::yield_now().await;
        source.write_all(b"\"distance\":1.25}]}\n").await.unwrap();
        drop(source);

        let (state, summary) = task.await.unwrap();
        assert_eq!(state, SessionState::Closed);
        let summary = summary.unwrap();
        assert_eq!(summary.frames_forwarded, 1);
        assert_eq!(summary.parse_errors, 0);

        let event = client.recv().await.unwrap();
        assert_eq!(event.data, json!([{"anchorId": "A1", "distance": 1.25}]));
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bad_line_does_not_stop_session() {
        let hub = BroadcastHub::new(16);
        let mut client = hub.subscribe();
        let (mut source, stream) = tokio::io::duplex(256);

        let task = tokio::spawn(run_to_end(IngestionSession::new(
            stream,
            "test",
            FramePipeline::relay_only(hub.clone()),
            DEFAULT_MAX_LINE_BYTES,
        )));

        source
            .write_all(b"{\"links\":[{\"anchorId\":\"A1\",\"distance\":1}]}\n{\"links\":[oops\n{\"links\":[{\"anchorId\":\"A2\",\"distance\":2}]}\n")
            .await
            .unwrap();
        drop(source);

        let summary = task.await.unwrap().1.unwrap();
        assert_eq!(summary.frames_forwarded, 2);
        assert_eq!(summary.parse_errors, 1);

        assert_eq!(client.recv().await.unwrap().data[0]["anchorId"], json!("A1"));
        assert_eq!(client.recv().await.unwrap().data[0]["anchorId"], json!("A2"));
    }

    #[tokio::test]
    async fn test_unterminated_last_record_flushed_on_close() {
        let hub = BroadcastHub::new(16);
        let mut client = hub.subscribe();
        let (mut source, stream) = tokio::io::duplex(256);

        let task = tokio::spawn(run_to_end(IngestionSession::new(
            stream,
            "test",
            FramePipeline::relay_only(hub.clone()),
            DEFAULT_MAX_LINE_BYTES,
        )));
        source.write_all(b"{\"links\":[]}").await.unwrap();
        drop(source);

        let summary = task.await.unwrap().1.unwrap();
        assert_eq!(summary.frames_forwarded, 1);
        assert_eq!(summary.bytes_read, 12);
        assert_eq!(client.recv().await.unwrap().data, json!([]));
    }

    #[tokio::test]
    async fn test_empty_connection_closes_cleanly() {
        let hub = BroadcastHub::new(4);
        let (source, stream) = tokio::io::duplex(16);
        drop(source);

        let mut session = IngestionSession::new(stream, "test", FramePipeline::relay_only(hub), DEFAULT_MAX_LINE_BYTES);
        let summary = session.run().await.unwrap();
        assert_eq!(summary, SessionSummary::default());
        assert_eq!(session.state(), SessionState::Closed);
    }
}
