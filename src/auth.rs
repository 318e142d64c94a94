//! Constant-time API-key auth for the admin HTTP API. The agent WebSocket
//! handshake in `gateway::ws_server::authenticate` uses the same
//! `subtle::ConstantTimeEq` comparison against the same configured key but
//! runs over a frame rather than an HTTP header, so it is not routed through
//! this middleware.

use crate::config::GatewayConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub api_key: String,
}

impl AuthState {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            api_key: config.api_key.clone(),
        })
    }
}

pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path();
    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    if request.method() == Method::OPTIONS || path == "/health" {
        return Ok(next.run(request).await);
    }

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| unauthorized())?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| unauthorized())?;
        auth_str.strip_prefix("Bearer ").ok_or_else(unauthorized)?
    } else {
        warn!(path, client_ip, "missing API key");
        return Err(unauthorized());
    };

    use subtle::ConstantTimeEq;
    if provided_key
        .as_bytes()
        .ct_eq(auth_state.api_key.as_bytes())
        .into()
    {
        Ok(next.run(request).await)
    } else {
        warn!(path, client_ip, "rejected invalid API key");
        Err(unauthorized())
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}
