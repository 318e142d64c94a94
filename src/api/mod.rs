//! Admin/observability HTTP API (§10.1): status and control surface for the
//! gateway, layered the way the orchestration API was — rate limit, then
//! auth, then tracing, then CORS, then routes.

use crate::auth::{auth_middleware, AuthState};
use crate::gateway::Gateway;
use crate::models::{ChatOrigin, Task, TaskStatus};
use crate::rate_limit::{rate_limit_middleware, RateLimitState};
use crate::validation::TaskContentValidator;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

const SERVICE_NAME: &str = "taskmesh-gateway";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct ApiServer {
    gateway: Arc<Gateway>,
    validator: Arc<TaskContentValidator>,
    started_at: Arc<Instant>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            validator: Arc::new(TaskContentValidator::default()),
            started_at: Arc::new(Instant::now()),
        }
    }

    pub fn build_router(&self) -> Router {
        let auth_state = AuthState::new(&self.gateway.config);
        let rate_limit_state = Arc::new(RateLimitState::new());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.gateway
                    .config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        Router::new()
            .route("/health", get(health))
            .route("/agents", get(list_agents))
            .route("/agents/{agent_id}", get(get_agent))
            .route("/tasks", get(list_tasks).post(create_task))
            .route("/tasks/{task_id}", get(get_task))
            .route("/tasks/{task_id}/cancel", post(cancel_task))
            .route("/system/status", get(system_status))
            .route("/circuit-breakers", get(circuit_breakers))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        rate_limit_state,
                        rate_limit_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn list_agents(State(api): State<ApiServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "agents": api.gateway.agents.snapshot().await }))
}

async fn get_agent(
    State(api): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = api.gateway.agents.snapshot().await;
    snapshot
        .into_iter()
        .find(|a| a.agent_id == agent_id)
        .map(|a| Json(serde_json::json!(a)))
        .ok_or_else(|| not_found(format!("agent {agent_id}")))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(api): State<ApiServer>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, (StatusCode, Json<ErrorResponse>)> {
    let mut tasks = api
        .gateway
        .tasks
        .list(query.status, query.project_id.as_deref())
        .await
        .map_err(internal_error)?;
    tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
    if let Some(limit) = query.limit {
        tasks.truncate(limit);
    }
    Ok(Json(tasks))
}

async fn get_task(
    State(api): State<ApiServer>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, (StatusCode, Json<ErrorResponse>)> {
    api.gateway
        .tasks
        .get(&task_id)
        .await
        .map(Json)
        .map_err(|_| not_found(format!("task {task_id}")))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: String,
    pub agent_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub max_budget: f64,
    pub chat_origin: ChatOrigin,
    /// Filesystem root on the target agent; must resolve under one of that
    /// agent's configured project roots.
    pub local_path: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub delivered: bool,
}

async fn create_task(
    State(api): State<ApiServer>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), (StatusCode, Json<ErrorResponse>)> {
    api.validator
        .validate_bot_name(&request.bot_name)
        .map_err(validation_error)?;
    let sanitized_prompt = api
        .validator
        .validate_prompt(&request.prompt)
        .map_err(validation_error)?;

    let task = Task::new(
        request.project_id,
        request.agent_id,
        request.bot_name,
        request.command,
        sanitized_prompt,
        request.max_budget,
        request.chat_origin,
        request.local_path,
        request.system_prompt,
        request.model,
        request.allowed_tools,
    );
    let task_id = task.id.clone();

    let delivered = api.gateway.submit(task).await.map_err(internal_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateTaskResponse { task_id, delivered }),
    ))
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelTaskRequest {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled via admin API".to_string()
}

async fn cancel_task(
    State(api): State<ApiServer>,
    Path(task_id): Path<String>,
    body: Option<Json<CancelTaskRequest>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let reason = body.map(|b| b.0.reason).unwrap_or_else(default_cancel_reason);
    api.gateway
        .cancel(&task_id, &reason)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn system_status(State(api): State<ApiServer>) -> Json<serde_json::Value> {
    let agents = api.gateway.agents.snapshot().await;
    let all_tasks = api.gateway.tasks.list(None, None).await.unwrap_or_default();
    let mut by_status = std::collections::HashMap::new();
    for task in &all_tasks {
        *by_status.entry(format!("{:?}", task.status)).or_insert(0u64) += 1;
    }
    Json(serde_json::json!({
        "uptime_ms": api.started_at.elapsed().as_millis(),
        "connected_agents": agents.len(),
        "total_tasks": all_tasks.len(),
        "tasks_by_status": by_status,
    }))
}

/// Connection-derived circuit view: the agent-side breaker (C8) guards the
/// outbound reconnect loop and lives in the agent process, so the gateway
/// can only report what it observes — whether each known agent is currently
/// reachable for dispatch.
async fn circuit_breakers(State(api): State<ApiServer>) -> Json<serde_json::Value> {
    let agents = api.gateway.agents.snapshot().await;
    let breakers: Vec<_> = agents
        .iter()
        .map(|a| {
            serde_json::json!({
                "agent_id": a.agent_id,
                "state": "closed",
                "active_tasks": a.active_tasks,
            })
        })
        .collect();
    Json(serde_json::json!({ "circuit_breakers": breakers }))
}

fn not_found(what: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: what }))
}

fn validation_error(e: crate::MeshError) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = %e, "rejected invalid task submission");
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: e.to_string() }),
    )
}

fn internal_error(e: crate::MeshError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        crate::MeshError::NotFound(_) => StatusCode::NOT_FOUND,
        crate::MeshError::AgentOffline(_) => StatusCode::CONFLICT,
        crate::MeshError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}
