//! Agent connection client (C8): outbound persistent connection with
//! authentication, heartbeating, and exponential-backoff reconnect behind a
//! circuit breaker.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::AgentConfig;
use crate::envelope::{self, EnvelopeType};
use crate::monitoring::{HealthThresholds, ResourceSampler};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

/// Local replay buffer for envelopes produced while disconnected (§10.4),
/// distinct from the gateway's OfflineQueue — this lives only on the agent.
struct ReplayBuffer {
    pending: Vec<Vec<u8>>,
}

impl ReplayBuffer {
    fn new() -> Self {
        Self { pending: Vec::new() }
    }
}

pub struct AgentConnection {
    config: AgentConfig,
    breaker: CircuitBreaker,
    replay: tokio::sync::Mutex<ReplayBuffer>,
    resources: ResourceSampler,
}

impl AgentConnection {
    pub fn new(config: AgentConfig) -> Self {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.tunables.circuit_breaker_max_failures,
            open_duration_ms: config.tunables.circuit_breaker_long_backoff_ms,
        });
        Self {
            config,
            breaker,
            replay: tokio::sync::Mutex::new(ReplayBuffer::new()),
            resources: ResourceSampler::new(),
        }
    }

    /// Buffer an envelope produced while no connection is live, to be
    /// replayed in order once the next connection authenticates.
    pub async fn buffer_while_offline(&self, bytes: Vec<u8>) {
        self.replay.lock().await.pending.push(bytes);
    }

    /// Run the connect/auth/heartbeat/reconnect loop forever. `outbound_rx`
    /// carries envelopes the executor wants sent; `inbound_tx` delivers
    /// frames received from the gateway to the caller (typically the
    /// executor's submit/cancel handling).
    pub async fn run(
        &self,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.should_allow().await {
                tokio::time::sleep(Duration::from_millis(
                    self.config.tunables.circuit_breaker_long_backoff_ms,
                ))
                .await;
                continue;
            }

            match self.connect_and_serve(&mut outbound_rx, &inbound_tx).await {
                Ok(()) => {
                    self.breaker.record_success().await;
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "connection lost, will reconnect");
                    self.breaker.record_failure().await;
                    let delay = backoff_delay(
                        attempt,
                        self.config.tunables.ws_reconnect_base_ms,
                        self.config.tunables.ws_reconnect_max_ms,
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_serve(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        inbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> crate::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.gateway_url).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let auth = envelope::AuthRequest {
            agent_id: self.config.agent_id.clone(),
            api_key: self.config.api_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let bytes = envelope::encode_bytes(EnvelopeType::AuthRequest, &auth)?;
        sink.send(Message::Binary(bytes)).await?;

        let deadline = Duration::from_millis(self.config.tunables.ws_auth_timeout_ms);
        let frame = tokio::time::timeout(deadline, stream.next())
            .await
            .map_err(|_| crate::MeshError::timeout("auth response"))?
            .ok_or_else(|| crate::MeshError::AuthFailed("connection closed during auth".into()))??;
        let response_bytes = match frame {
            Message::Binary(b) => b,
            Message::Text(t) => t.into_bytes(),
            _ => return Err(crate::MeshError::AuthFailed("unexpected auth reply frame".into())),
        };
        let envelope = envelope::decode(&response_bytes)?;
        let response: envelope::AuthResponse = envelope::decode_payload(&envelope)?;
        if !response.success {
            return Err(crate::MeshError::AuthFailed(
                response.error.unwrap_or_else(|| "rejected".into()),
            ));
        }
        info!(agent_id = %self.config.agent_id, "authenticated with gateway");

        // Replay anything buffered while disconnected, in order, before
        // resuming normal traffic (§10.4).
        {
            let mut replay = self.replay.lock().await;
            for bytes in replay.pending.drain(..) {
                sink.send(Message::Binary(bytes)).await?;
            }
        }

        let keepalive = Duration::from_millis(self.config.tunables.agent_keepalive_ms);
        let mut heartbeat = tokio::time::interval(keepalive);
        let mut last_pong = crate::now_ms();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let ping = envelope::HeartbeatPing { server_time: crate::now_ms() };
                    let bytes = envelope::encode_bytes(EnvelopeType::HeartbeatPing, &ping)?;
                    sink.send(Message::Binary(bytes)).await?;
                    if crate::now_ms() - last_pong > 2 * keepalive.as_millis() as i64 {
                        return Err(crate::MeshError::timeout("heartbeat pong"));
                    }
                    let snapshot = self.resources.sample();
                    let resource_status = if snapshot.degraded(&HealthThresholds::default()) {
                        "degraded"
                    } else {
                        "ok"
                    };
                    let status = envelope::AgentStatusPayload {
                        agent_id: self.config.agent_id.clone(),
                        status: crate::models::AgentStatusReport::Online,
                        active_tasks: 0,
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        resource_status: Some(resource_status.to_string()),
                    };
                    let bytes = envelope::encode_bytes(EnvelopeType::AgentStatus, &status)?;
                    sink.send(Message::Binary(bytes)).await?;
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(bytes) => sink.send(Message::Binary(bytes)).await?,
                        None => return Ok(()),
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(bytes))) => {
                            if is_heartbeat_pong(&bytes) {
                                last_pong = crate::now_ms();
                            }
                            let _ = inbound_tx.send(bytes);
                        }
                        Some(Ok(Message::Text(text))) => {
                            let bytes = text.into_bytes();
                            if is_heartbeat_pong(&bytes) {
                                last_pong = crate::now_ms();
                            }
                            let _ = inbound_tx.send(bytes);
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Only an actual `heartbeat:pong` counts as liveness: other inbound traffic
/// (tasks, progress) doesn't prove the gateway is still answering pings.
fn is_heartbeat_pong(bytes: &[u8]) -> bool {
    envelope::decode(bytes)
        .map(|e| EnvelopeType::parse(&e.kind) == Some(EnvelopeType::HeartbeatPong))
        .unwrap_or(false)
}

/// Exponential backoff with jitter in [0.5, 1.0], per §4.8.
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(max_ms);
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
