use crate::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Configuration for the cloud-side gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub allowed_origins: Vec<String>,
    pub tunables: Tunables,
}

/// Configuration for an agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub gateway_url: String,
    pub agent_id: String,
    pub api_key: String,
    /// Filesystem roots the executor is permitted to touch; every task path
    /// must normalize to a location under one of these.
    pub project_roots: Vec<PathBuf>,
    pub tunables: Tunables,
}

/// The subset of §6 tunables that are read from the environment rather than hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    pub max_concurrent_tasks: usize,
    pub max_continuations: u32,
    pub max_turns_per_invocation: u32,
    pub agent_keepalive_ms: u64,
    pub ws_auth_timeout_ms: u64,
    pub ws_reconnect_base_ms: u64,
    pub ws_reconnect_max_ms: u64,
    pub circuit_breaker_max_failures: u32,
    pub circuit_breaker_long_backoff_ms: u64,
    pub offline_queue_ttl_ms: i64,
    pub stream_update_interval_ms: u64,
    pub task_timeout_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            max_concurrent_tasks: MAX_CONCURRENT_TASKS,
            max_continuations: MAX_CONTINUATIONS,
            max_turns_per_invocation: MAX_TURNS_PER_INVOCATION,
            agent_keepalive_ms: AGENT_KEEPALIVE_MS,
            ws_auth_timeout_ms: WS_AUTH_TIMEOUT_MS,
            ws_reconnect_base_ms: WS_RECONNECT_BASE_MS,
            ws_reconnect_max_ms: WS_RECONNECT_MAX_MS,
            circuit_breaker_max_failures: CIRCUIT_BREAKER_MAX_FAILURES,
            circuit_breaker_long_backoff_ms: CIRCUIT_BREAKER_LONG_BACKOFF_MS,
            offline_queue_ttl_ms: OFFLINE_QUEUE_TTL_MS,
            stream_update_interval_ms: STREAM_UPDATE_INTERVAL_MS,
            task_timeout_ms: TASK_TIMEOUT_MS,
        }
    }
}

impl Tunables {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_tasks: env_or("MAX_CONCURRENT_TASKS", defaults.max_concurrent_tasks),
            max_continuations: env_or("MAX_CONTINUATIONS", defaults.max_continuations),
            max_turns_per_invocation: env_or(
                "MAX_TURNS_PER_INVOCATION",
                defaults.max_turns_per_invocation,
            ),
            agent_keepalive_ms: env_or("AGENT_KEEPALIVE", defaults.agent_keepalive_ms),
            ws_auth_timeout_ms: env_or("WS_AUTH_TIMEOUT", defaults.ws_auth_timeout_ms),
            ws_reconnect_base_ms: env_or("WS_RECONNECT_BASE", defaults.ws_reconnect_base_ms),
            ws_reconnect_max_ms: env_or("WS_RECONNECT_MAX", defaults.ws_reconnect_max_ms),
            circuit_breaker_max_failures: env_or(
                "CIRCUIT_BREAKER_MAX_FAILURES",
                defaults.circuit_breaker_max_failures,
            ),
            circuit_breaker_long_backoff_ms: env_or(
                "CIRCUIT_BREAKER_LONG_BACKOFF",
                defaults.circuit_breaker_long_backoff_ms,
            ),
            offline_queue_ttl_ms: env_or("OFFLINE_QUEUE_TTL", defaults.offline_queue_ttl_ms),
            stream_update_interval_ms: env_or(
                "STREAM_UPDATE_INTERVAL",
                defaults.stream_update_interval_ms,
            ),
            task_timeout_ms: env_or("TASK_TIMEOUT", defaults.task_timeout_ms),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Minimum accepted length for the admin/agent API key, enforced the same way
/// regardless of which side of the connection is presenting it.
const MIN_API_KEY_LEN: usize = 32;

fn validate_api_key(key: &str, var_name: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(MeshError::ConfigError(config::ConfigError::Message(
            format!("{var_name} cannot be blank"),
        )));
    }
    if key.len() < MIN_API_KEY_LEN {
        tracing::error!("{var_name} is too short (minimum {MIN_API_KEY_LEN} characters)");
        tracing::error!("generate one with: openssl rand -hex 32");
        return Err(MeshError::ConfigError(config::ConfigError::Message(
            format!("{var_name} must be at least {MIN_API_KEY_LEN} characters"),
        )));
    }
    Ok(())
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(?path, "loaded .env file"),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let api_key = env::var("API_KEY").map_err(|_| {
            tracing::error!("API_KEY environment variable not set");
            tracing::error!("generate one with: openssl rand -hex 32");
            MeshError::ConfigError(config::ConfigError::NotFound("API_KEY".into()))
        })?;
        validate_api_key(&api_key, "API_KEY")?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(GatewayConfig {
            host: env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("GATEWAY_PORT", 7878u16),
            api_key,
            allowed_origins,
            tunables: Tunables::from_env(),
        })
    }
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(?path, "loaded .env file"),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let api_key = env::var("AGENT_API_KEY").map_err(|_| {
            MeshError::ConfigError(config::ConfigError::NotFound("AGENT_API_KEY".into()))
        })?;
        validate_api_key(&api_key, "AGENT_API_KEY")?;

        let agent_id = env::var("AGENT_ID").map_err(|_| {
            MeshError::ConfigError(config::ConfigError::NotFound("AGENT_ID".into()))
        })?;

        let project_roots = env::var("AGENT_PROJECT_ROOTS")
            .unwrap_or_else(|_| ".".to_string())
            .split(',')
            .map(|s| PathBuf::from(s.trim()))
            .collect();

        Ok(AgentConfig {
            gateway_url: env::var("GATEWAY_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:7878/agent".to_string()),
            agent_id,
            api_key,
            project_roots,
            tunables: Tunables::from_env(),
        })
    }
}
