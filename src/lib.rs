//! Task-dispatch fabric: a cloud gateway that receives chat-originated work
//! and routes it to remote agent processes over persistent, authenticated
//! connections, with streaming partial results and delivery guarantees
//! across agent disconnects.
//!
//! ## Architecture
//!
//! - **Gateway**: accepts agent connections, holds the live connection
//!   registry, the task state store, and the offline queue; demultiplexes
//!   inbound envelopes and dispatches outbound ones.
//! - **Agent**: connects out to a gateway, authenticates, admits and runs
//!   tasks against a black-box LLM invocation stream, and reconnects behind
//!   a circuit breaker when the connection drops.
//! - **Envelope**: the `{id, type, payload, timestamp}` wire shape shared by
//!   both sides.
//!
//! Chat-platform integration, the LLM invocation library, persistent
//! storage, and deploy/admin tooling are external collaborators this crate
//! defines trait boundaries for but does not implement.

pub mod agent;
/// Admin/observability HTTP API
pub mod api;
/// Authentication for the admin API and the agent WebSocket handshake
pub mod auth;
/// Out-of-scope chat-platform collaborator interface and markdown rendering
pub mod chat;
/// Process configuration for the gateway and agent binaries
pub mod config;
/// Tunable defaults
pub mod constants;
/// Wire envelope codec (C1)
pub mod envelope;
/// Error types and handling
pub mod error;
pub mod gateway;
/// Core data models
pub mod models;
/// Process-resource gauges (§10.3)
pub mod monitoring;
/// Per-IP request rate limiting for the admin API
pub mod rate_limit;
/// Durable per-agent offline mailbox (C2) and its connect-triggered drain (C5)
pub mod queue;
/// Task state machine persistence boundary (C3)
pub mod task_store;
/// Input validation and sanitization for task submissions
pub mod validation;

pub use error::{MeshError, Result};

/// Current time in epoch milliseconds, used throughout for timestamps,
/// heartbeat staleness checks, and TTL expiry.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
