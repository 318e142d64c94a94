//! Tunables shared across the gateway and agent binaries.
//!
//! All are overridable via environment variables of the same name (see `config`);
//! the values here are the defaults applied when unset.

/// Per-agent concurrent task ceiling before the agent admits-with-queueing.
pub const MAX_CONCURRENT_TASKS: usize = 5;

/// Cap on auto-continuation cycles once an invocation hits its turn limit.
pub const MAX_CONTINUATIONS: u32 = 3;

/// Turn budget handed to a single LLM invocation before it must be continued.
pub const MAX_TURNS_PER_INVOCATION: u32 = 200;

/// Interval between agent heartbeat pings, ms.
pub const AGENT_KEEPALIVE_MS: u64 = 20_000;

/// Deadline for the auth:request/auth:response handshake, ms.
pub const WS_AUTH_TIMEOUT_MS: u64 = 10_000;

/// Base delay for exponential reconnect backoff, ms.
pub const WS_RECONNECT_BASE_MS: u64 = 1_000;

/// Ceiling for exponential reconnect backoff, ms.
pub const WS_RECONNECT_MAX_MS: u64 = 30_000;

/// Gateway's own heartbeat sweep interval, ms (distinct from the agent's keepalive).
pub const WS_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Consecutive reconnect failures before the circuit breaker opens.
pub const CIRCUIT_BREAKER_MAX_FAILURES: u32 = 10;

/// How long the circuit stays open once tripped, ms.
pub const CIRCUIT_BREAKER_LONG_BACKOFF_MS: u64 = 300_000;

/// Offline queue entry time-to-live, ms. Default 24h.
pub const OFFLINE_QUEUE_TTL_MS: i64 = 86_400_000;

/// StreamAccumulator flush cadence, ms.
pub const STREAM_UPDATE_INTERVAL_MS: u64 = 3_000;

/// Tail-biased truncation point for a single chat edit.
pub const STREAM_MAX_SNAPSHOT_CHARS: usize = 3_900;

/// Wall-clock ceiling for a single task, ms. Default 30 min.
pub const TASK_TIMEOUT_MS: u64 = 1_800_000;

/// Bound on in-memory task retention before the oldest terminal tasks are evicted.
pub const MAX_STORED_TASKS: usize = 10_000;

/// Retry ceiling for a pending chat edit (stream flush, progress notice, final post).
pub const CHAT_EDIT_MAX_RETRIES: u32 = 3;

/// How long a pending chat edit is retried before being abandoned, ms.
pub const CHAT_EDIT_TIMEOUT_MS: u64 = 60_000;

/// Periodic sweep interval for expired offline-queue entries, ms.
pub const QUEUE_SWEEP_INTERVAL_MS: u64 = 300_000;
