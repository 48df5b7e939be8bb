//! WebSocket transport for signaling.
//!
//! `GET /ws` upgrades to a socket carrying JSON text frames. Each socket
//! gets a `ConnectionActor` (outbound FIFO), a writer task draining it
//! into the socket, and a [`SignalingGateway`] fed by the read half.

use crate::actors::ConnectionActor;
use crate::errors::SignalingError;
use crate::signaling::gateway::{GatewayContext, SignalingGateway};
use crate::signaling::protocol::ServerEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Events buffered between the connection actor and the socket writer.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Clone)]
pub struct SignalingState {
    pub context: Arc<GatewayContext>,
    /// When set, upgrades from any other `Origin` are refused.
    pub allowed_origin: Option<String>,
    /// Parent of every connection token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    State(state): State<SignalingState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(state.allowed_origin.as_deref(), &headers) {
        warn!(
            target: "sig.gateway",
            origin = ?headers.get(header::ORIGIN),
            "Rejected upgrade from disallowed origin"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| {
        serve_socket(socket, state.context, state.shutdown.child_token())
    })
}

fn origin_allowed(allowed: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|origin| origin == allowed)
}

/// Runs one signaling socket until either side closes it.
#[instrument(skip_all, name = "sig.gateway.socket", fields(connection_id))]
async fn serve_socket(
    socket: WebSocket,
    context: Arc<GatewayContext>,
    cancel_token: CancellationToken,
) {
    let connection_id = format!("conn-{}", Uuid::new_v4());
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let (connection, connection_task) = ConnectionActor::spawn(
        connection_id.clone(),
        outbound_tx,
        cancel_token.clone(),
        Arc::clone(&context.metrics),
    );

    info!(
        target: "sig.gateway",
        connection_id = %connection_id,
        "Signaling connection opened"
    );

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match event.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "sig.gateway", error = %e, "Dropping unencodable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut gateway = SignalingGateway::new(connection.clone(), context);

    loop {
        tokio::select! {
            // Slow reader, server shutdown, or the actor stopped
            () = cancel_token.cancelled() => break,

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => gateway.handle_text(&text).await,
                Some(Ok(Message::Binary(_))) => gateway.reject(
                    "unknown",
                    &SignalingError::InvalidMessage("Binary frames are not supported".to_string()),
                ),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "sig.gateway",
                        connection_id = %connection_id,
                        error = %e,
                        "Socket read failed"
                    );
                    break;
                }
            },
        }
    }

    gateway.disconnect().await;
    connection.close("socket closed");
    let _ = connection_task.await;
    let _ = writer.await;

    info!(
        target: "sig.gateway",
        connection_id = %connection_id,
        "Signaling connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_any_origin_when_unset() {
        assert!(origin_allowed(None, &HeaderMap::new()));
    }

    #[test]
    fn test_origin_must_match_when_set() {
        let mut headers = HeaderMap::new();
        assert!(!origin_allowed(Some("https://care.example"), &headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(!origin_allowed(Some("https://care.example"), &headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://care.example"));
        assert!(origin_allowed(Some("https://care.example"), &headers));
    }
}
