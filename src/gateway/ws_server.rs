//! Inbound WebSocket upgrade: authenticates a connecting agent and wires its
//! socket into the [`AgentManager`](super::agent_manager::AgentManager).

use super::Gateway;
use crate::envelope::{self, EnvelopeType};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn upgrade(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let agent_id = match authenticate(&gateway, &mut socket).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "agent auth handshake failed");
            let _ = socket.close().await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    gateway.agents.register(&agent_id, outbound_tx).await;
    info!(agent_id, "agent connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if bytes.is_empty() {
                // Empty payload is the superseded-connection close sentinel (see AgentManager::register).
                let _ = sink.close().await;
                break;
            }
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(bytes) => {
                gateway.agents.update_heartbeat(&agent_id).await;
                if let Err(e) = gateway.handle_inbound(&agent_id, &bytes).await {
                    warn!(agent_id, error = %e, "failed to handle inbound envelope");
                }
            }
            Message::Text(text) => {
                gateway.agents.update_heartbeat(&agent_id).await;
                if let Err(e) = gateway.handle_inbound(&agent_id, text.as_bytes()).await {
                    warn!(agent_id, error = %e, "failed to handle inbound envelope");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    gateway.agents.unregister(&agent_id).await;
    info!(agent_id, "agent disconnected");
}

/// Wait for `auth:request` within the configured deadline and validate the
/// presented API key with a constant-time comparison.
async fn authenticate(gateway: &Gateway, socket: &mut WebSocket) -> crate::Result<String> {
    let deadline = Duration::from_millis(gateway.config.tunables.ws_auth_timeout_ms);
    let frame = tokio::time::timeout(deadline, socket.recv())
        .await
        .map_err(|_| crate::MeshError::timeout("auth handshake"))?
        .ok_or_else(|| crate::MeshError::AuthFailed("connection closed before auth".into()))?
        .map_err(|e| crate::MeshError::AuthFailed(e.to_string()))?;

    let bytes = match frame {
        Message::Binary(b) => b,
        Message::Text(t) => t.as_str().as_bytes().to_vec().into(),
        _ => return Err(crate::MeshError::AuthFailed("expected auth:request".into())),
    };

    let envelope = envelope::decode(&bytes)?;
    if EnvelopeType::parse(&envelope.kind) != Some(EnvelopeType::AuthRequest) {
        return Err(crate::MeshError::AuthFailed("expected auth:request".into()));
    }
    let request: envelope::AuthRequest = envelope::decode_payload(&envelope)?;

    let ok = request.api_key.as_bytes().ct_eq(gateway.config.api_key.as_bytes()).into();
    let response = envelope::AuthResponse {
        success: ok,
        error: if ok { None } else { Some("invalid credentials".into()) },
    };
    let bytes = envelope::encode_bytes(EnvelopeType::AuthResponse, &response)?;
    socket
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| crate::MeshError::AuthFailed(e.to_string()))?;

    if !ok {
        return Err(crate::MeshError::AuthFailed("invalid api key".into()));
    }
    Ok(request.agent_id)
}
