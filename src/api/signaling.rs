use crate::AppState;
use crate::session::{OutboundSignal, Signal};
use async_channel::Sender;
use axum::extract::Extension;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SET_SESSION: &str = "set-session";
pub const WEBRTC_SIGNAL: &str = "webrtc-signal";

/// One signaling frame: `{"event": ..., "data": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub event: String,
    pub data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetSession {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteSignal {
    session_id: String,
    signal: Signal,
}

pub async fn signaling(ws: WebSocketUpgrade, Extension(state): Extension<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Signaling client connected");
    let (mut writer, mut reader) = socket.split();
    let (outbound_tx, outbound_rx) = async_channel::unbounded::<OutboundSignal>();

    let forward = tokio::spawn(async move {
        while let Ok(signal) = outbound_rx.recv().await {
            let envelope = Envelope {
                event: WEBRTC_SIGNAL.to_string(),
                data: signal,
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(error) => {
                    warn!(?error, "Failed to encode outbound signal");
                    continue;
                }
            };
            if writer.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // (session id, epoch) registered through this connection
    let mut registrations: Vec<(String, u64)> = Vec::new();

    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                debug!(?error, "Signaling socket error");
                break;
            }
        };

        match serde_json::from_str::<Envelope<serde_json::Value>>(text.as_str()) {
            Ok(envelope) => handle_event(&state, &outbound_tx, &mut registrations, envelope).await,
            Err(error) => warn!(%error, "Ignoring malformed signaling frame"),
        }
    }

    info!(sessions = registrations.len(), "Signaling client disconnected");
    for (session_id, epoch) in registrations {
        state.peers.close_epoch(&session_id, epoch).await;
    }
    forward.abort();
}

async fn handle_event(
    state: &AppState,
    outbound: &Sender<OutboundSignal>,
    registrations: &mut Vec<(String, u64)>,
    envelope: Envelope<serde_json::Value>,
) {
    match envelope.event.as_str() {
        SET_SESSION => {
            let SetSession { session_id } = match serde_json::from_value(envelope.data) {
                Ok(data) => data,
                Err(error) => {
                    warn!(%error, "Invalid set-session payload");
                    return;
                }
            };

            info!(%session_id, "set-session received");
            match state.peers.register(&session_id, outbound.clone()).await {
                Ok(epoch) => {
                    registrations.retain(|(id, _)| *id != session_id);
                    registrations.push((session_id, epoch));
                }
                Err(error) => warn!(%session_id, %error, "Failed to create peer session"),
            }
        }
        WEBRTC_SIGNAL => {
            let RemoteSignal { session_id, signal } = match serde_json::from_value(envelope.data) {
                Ok(data) => data,
                Err(error) => {
                    warn!(%error, "Invalid webrtc-signal payload");
                    return;
                }
            };

            if let Err(error) = state.peers.signal(&session_id, signal) {
                warn!(%session_id, %error, "Dropping signal");
            }
        }
        event => debug!(event, "Ignoring unknown signaling event"),
    }
}
