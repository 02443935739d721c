//! # Fan-out Server
//!
//! HTTP server (Axum) through which browsers and other real-time clients
//! follow the hub.
//!
//! ## Endpoints
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws` | WebSocket; every hub event arrives as `{"event": ..., "data": ...}` |
//! | `/api/config` | Anchor layout as JSON, 404 when none is loaded |
//!
//! The origin policy comes from configuration and defaults to any origin.

use crate::broadcast::hub::{BroadcastHub, HubEvent, Subscription};
use crate::utils::{AnchorSet, ConfigError};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Shared state passed to all request handlers.
#[derive(Clone)]
struct AppState {
    hub: BroadcastHub,
    anchors: Option<Arc<AnchorSet>>,
}

/// Builds the router for the fan-out endpoints.
///
/// `cors_origin` is either `*` or a single origin such as
/// `http://localhost:5173`.
pub fn router(hub: BroadcastHub, anchors: Option<Arc<AnchorSet>>, cors_origin: &str) -> Result<Router, ConfigError> {
    let cors = cors_layer(cors_origin)?;
    let state = AppState { hub, anchors };

    Ok(Router::new()
        .route("/ws", get(handle_websocket))
        .route("/api/config", get(handle_anchor_config))
        .layer(cors)
        .with_state(state))
}

/// Serves `router` on `listener` until `shutdown` resolves.
pub async fn serve_until<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(address) = listener.local_addr() {
        tracing::info!("Server is running on port {}", address.port());
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}

fn cors_layer(origin: &str) -> Result<CorsLayer, ConfigError> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return Ok(layer.allow_origin(Any));
    }

    let value = HeaderValue::from_str(origin).map_err(|e| ConfigError::InvalidParameter {
        parameter: "CORS_ORIGIN".to_string(),
        value: origin.to_string(),
        reason: e.to_string(),
    })?;
    Ok(layer.allow_origin(value))
}

/// Handles requests to `/api/config`.
async fn handle_anchor_config(State(state): State<AppState>) -> Response {
    let Some(anchors) = &state.anchors else {
        return (StatusCode::NOT_FOUND, "no anchor layout loaded").into_response();
    };

    match anchors.layout_json() {
        Ok(layout) => Json(layout).into_response(),
        Err(e) => {
            tracing::warn!("failed to encode anchor layout: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handles WebSocket upgrade requests to `/ws`.
async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let subscription = state.hub.subscribe();
        forward_events(socket, subscription)
    })
}

/// Pumps hub events into one WebSocket until either side goes away.
async fn forward_events(mut socket: WebSocket, mut subscription: Subscription) {
    let client = subscription.handle().id();
    tracing::info!(client, "A client connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                match encode_event(&event) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break; // Client disconnected
                        }
                    }
                    Err(e) => tracing::warn!(client, "failed to encode event: {}", e),
                }
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {} // Clients only listen
            },
        }
    }

    tracing::info!(client, "client disconnected");
}

/// Wire form of a hub event on the WebSocket
pub fn encode_event(event: &HubEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AnchorPosition;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    async fn start(router: Router) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<std::io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, router, async move {
            let _ = stop_rx.await;
        }));
        (address, stop_tx, server)
    }

    async fn get(router: Router, path: &str) -> String {
        let (address, stop_tx, server) = start(router).await;

        let mut stream = TcpStream::connect(address).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nOrigin: http://example.com\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        response
    }

    fn body(response: &str) -> serde_json::Value {
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    /// Read one unmasked server frame, returning opcode and payload
    async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let opcode = stream.read_u8().await.unwrap() & 0x0f;
        let length = match stream.read_u8().await.unwrap() & 0x7f {
            126 => stream.read_u16().await.unwrap() as usize,
            127 => stream.read_u64().await.unwrap() as usize,
            short => short as usize,
        };
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await.unwrap();
        (opcode, payload)
    }

    async fn wait_for_clients(hub: &BroadcastHub, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_event_wire_format() {
        let event = HubEvent {
            event: "uwb_data".to_string(),
            data: json!([{"anchorId": "A1", "distance": 1.5}]),
        };
        let decoded: serde_json::Value = serde_json::from_str(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(decoded, json!({"event": "uwb_data", "data": [{"anchorId": "A1", "distance": 1.5}]}));
    }

    #[test]
    fn test_invalid_cors_origin_rejected() {
        let result = router(BroadcastHub::new(4), None, "bad\norigin");
        assert!(matches!(result, Err(ConfigError::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn test_anchor_config_served() {
        let anchors = AnchorSet::new(vec![
            AnchorPosition::new("A1", 0.0, 0.0),
            AnchorPosition::new("A2", 4.0, 0.0),
            AnchorPosition::new("A3", 0.0, 4.0),
        ])
        .unwrap();
        let app = router(BroadcastHub::new(4), Some(Arc::new(anchors)), "*").unwrap();

        let response = get(app, "/api/config").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));
        assert!(response.contains("\"id\":\"A2\""));
    }

    #[tokio::test]
    async fn test_anchor_config_keeps_file_shape() {
        let text = r#"[{"id":"A1","x":0,"y":0},{"id":"A2","x":4,"y":0},{"id":"A3","x":0,"y":4}]"#;
        let anchors = AnchorSet::from_json(text).unwrap();
        let app = router(BroadcastHub::new(4), Some(Arc::new(anchors)), "*").unwrap();

        let response = get(app, "/api/config").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(body(&response), serde_json::from_str::<serde_json::Value>(text).unwrap());
    }

    #[tokio::test]
    async fn test_websocket_receives_events_until_closed() {
        let hub = BroadcastHub::new(8);
        let app = router(hub.clone(), None, "*").unwrap();
        let (address, stop_tx, server) = start(app).await;

        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected handshake: {}", head);
        assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        wait_for_clients(&hub, 1).await;
        let report = hub.publish("tag_position", json!({"x": 1.0, "y": 2.0}));
        assert_eq!(report.delivered, 1);

        let (opcode, payload) = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
            .await
            .unwrap();
        assert_eq!(opcode, 0x1);
        let message: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(message, json!({"event": "tag_position", "data": {"x": 1.0, "y": 2.0}}));

        // Masked close frame with an empty body
        stream.write_all(&[0x88, 0x80, 0x01, 0x02, 0x03, 0x04]).await.unwrap();
        wait_for_clients(&hub, 0).await;

        drop(stream);
        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_anchor_config_missing() {
        let app = router(BroadcastHub::new(4), None, "*").unwrap();
        let response = get(app, "/api/config").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
