//! HTTP surface of the task pipeline.
//!
//! JSON throughout. Validation failures return 422 with a `detail` array;
//! an empty PATCH returns 400; storage faults surface as 5xx. Alert sends
//! ride the controller's background dispatcher, so handlers never wait on
//! the chat transport.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;

use drover_core::chat::ChatService;
use drover_core::lifecycle::{
    Core, CoreError, ExecuteOptions, TaskCreate, TaskPatch, UpsertActive,
};
use drover_core::orphan::recover_on_idle_heartbeat;
use drover_core::registry::HeartbeatRequest;
use drover_core::routing::RouteDecision;
use drover_db::models::{Runner, Task, TaskKind, TaskStatus};
use drover_db::store::{StoreError, TaskFilter};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    body: Value,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: json!({ "detail": msg.into() }),
        }
    }

    pub fn unprocessable(details: Vec<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: json!({ "detail": details }),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "detail": msg.into() }),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: json!({ "detail": "invalid or missing API token" }),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Invalid(details) => Self::unprocessable(details),
            CoreError::NotFound(what) => Self::not_found(format!("{what} not found")),
            CoreError::Store(StoreError::Unavailable(msg)) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: json!({ "error": msg }),
            },
            CoreError::Store(StoreError::Schema(msg)) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({ "error": msg }),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Evidence fields accept a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EvidenceField {
    One(String),
    Many(Vec<String>),
}

impl EvidenceField {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

fn opt_evidence(field: Option<EvidenceField>) -> Option<Vec<String>> {
    field.map(EvidenceField::into_vec)
}

#[derive(Debug, Deserialize)]
pub struct AgentTaskCreate {
    direction: String,
    task_type: String,
    #[serde(default)]
    context: Option<Map<String, Value>>,
    #[serde(default)]
    target_state: Option<String>,
    #[serde(default)]
    success_evidence: Option<EvidenceField>,
    #[serde(default)]
    abort_evidence: Option<EvidenceField>,
    #[serde(default)]
    observation_window_sec: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentTaskUpdate {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    progress_pct: Option<i64>,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    decision_prompt: Option<String>,
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    context: Option<Map<String, Value>>,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    target_state: Option<String>,
    #[serde(default)]
    success_evidence: Option<EvidenceField>,
    #[serde(default)]
    abort_evidence: Option<EvidenceField>,
    #[serde(default)]
    observation_window_sec: Option<i64>,
}

impl AgentTaskUpdate {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.output.is_none()
            && self.progress_pct.is_none()
            && self.current_step.is_none()
            && self.decision_prompt.is_none()
            && self.decision.is_none()
            && self.context.is_none()
            && self.worker_id.is_none()
            && self.target_state.is_none()
            && self.success_evidence.is_none()
            && self.abort_evidence.is_none()
            && self.observation_window_sec.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentTaskUpsertActive {
    session_key: String,
    direction: String,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    context: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct AgentRunnerHeartbeat {
    runner_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    lease_seconds: Option<i64>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    active_task_id: Option<String>,
    #[serde(default)]
    active_run_id: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    capabilities: Option<Map<String, Value>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    executor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunnersQuery {
    #[serde(default)]
    include_stale: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Task in list responses (no command/output/context payloads).
#[derive(Debug, Serialize)]
pub struct TaskListItem {
    pub id: String,
    pub direction: String,
    pub task_type: TaskKind,
    pub status: TaskStatus,
    pub model: String,
    pub progress_pct: Option<i32>,
    pub current_step: Option<String>,
    pub decision_prompt: Option<String>,
    pub decision: Option<String>,
    pub target_state: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskListItem {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            direction: task.direction.clone(),
            task_type: task.task_type,
            status: task.status,
            model: task.model.clone(),
            progress_pct: task.progress_pct,
            current_step: task.current_step.clone(),
            decision_prompt: task.decision_prompt.clone(),
            decision: task.decision.clone(),
            target_state: task.target_state.clone(),
            claimed_by: task.claimed_by.clone(),
            claimed_at: task.claimed_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AgentTaskList {
    pub tasks: Vec<TaskListItem>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub task_type: String,
    pub model: String,
    pub command_template: String,
    pub tier: String,
    pub executor: String,
    pub provider: String,
    pub billing_provider: String,
    pub is_paid_provider: bool,
}

impl From<RouteDecision> for RouteResponse {
    fn from(decision: RouteDecision) -> Self {
        Self {
            task_type: decision.task_type.to_string(),
            model: decision.model.clone(),
            command_template: decision.command_template.clone(),
            tier: decision.tier.to_string(),
            executor: decision.executor.to_string(),
            provider: decision.provider.to_string(),
            billing_provider: decision.billing_provider.to_string(),
            is_paid_provider: decision.is_paid_provider,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunnerSnapshot {
    pub runner_id: String,
    pub status: String,
    pub online: bool,
    pub host: String,
    pub pid: Option<i64>,
    pub version: String,
    pub active_task_id: String,
    pub active_run_id: String,
    pub last_error: String,
    pub lease_expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl RunnerSnapshot {
    fn build(runner: &Runner, now: DateTime<Utc>) -> Self {
        Self {
            runner_id: runner.runner_id.clone(),
            status: runner.status.to_string(),
            online: runner.online(now),
            host: runner.host.clone(),
            pid: runner.pid,
            version: runner.version.clone(),
            active_task_id: runner.active_task_id.clone(),
            active_run_id: runner.active_run_id.clone(),
            last_error: runner.last_error.clone(),
            lease_expires_at: runner.lease_expires_at,
            last_seen_at: runner.last_seen_at,
            updated_at: runner.updated_at,
            metadata: runner.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
    pub chat: Arc<ChatService>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agent/tasks", post(create_task).get(list_tasks))
        .route("/agent/tasks/attention", get(attention_tasks))
        .route("/agent/tasks/count", get(task_count))
        .route("/agent/tasks/upsert-active", post(upsert_active))
        .route("/agent/tasks/{id}", get(get_task).patch(update_task))
        .route("/agent/tasks/{id}/execute", post(execute_task))
        .route("/agent/route", get(route_task_type))
        .route("/agent/runners/heartbeat", post(runner_heartbeat))
        .route("/agent/runners", get(list_runners))
        .route("/agent/telegram/webhook", post(telegram_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    core: Arc<Core>,
    api_token: Option<String>,
    bind: &str,
    port: u16,
) -> Result<()> {
    let chat = Arc::new(ChatService::new(
        core.clone(),
        core.chat_transport(),
        core.config().chat.clone(),
    ));
    let app = build_router(AppState {
        core,
        chat,
        api_token,
    });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("drover serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn parse_kind(raw: &str) -> Result<TaskKind, AppError> {
    raw.parse().map_err(|_| {
        AppError::unprocessable(vec![format!(
            "task_type must be one of spec, test, impl, review, heal; got {raw:?}"
        )])
    })
}

fn parse_status(raw: &str) -> Result<TaskStatus, AppError> {
    raw.parse().map_err(|_| {
        AppError::unprocessable(vec![format!(
            "status must be one of pending, running, completed, failed, needs_decision; got {raw:?}"
        )])
    })
}

fn parse_limit(raw: Option<i64>, default: usize) -> Result<usize, AppError> {
    match raw {
        None => Ok(default),
        Some(v) if (1..=100).contains(&v) => Ok(v as usize),
        Some(v) => Err(AppError::unprocessable(vec![format!(
            "limit must be in [1, 100]; got {v}"
        )])),
    }
}

fn parse_offset(raw: Option<i64>) -> Result<usize, AppError> {
    match raw {
        None => Ok(0),
        Some(v) if v >= 0 => Ok(v as usize),
        Some(v) => Err(AppError::unprocessable(vec![format!(
            "offset must be >= 0; got {v}"
        )])),
    }
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<AppState>,
    Json(data): Json<AgentTaskCreate>,
) -> Result<impl IntoResponse, AppError> {
    let task_type = parse_kind(&data.task_type)?;
    let task = state
        .core
        .create_task(TaskCreate {
            direction: data.direction,
            task_type: Some(task_type),
            context: data.context,
            target_state: data.target_state,
            success_evidence: opt_evidence(data.success_evidence),
            abort_evidence: opt_evidence(data.abort_evidence),
            observation_window_sec: data.observation_window_sec,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, AppError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let task_type = query.task_type.as_deref().map(parse_kind).transpose()?;
    let filter = TaskFilter {
        status,
        task_type,
        limit: parse_limit(query.limit, 20)?,
        offset: parse_offset(query.offset)?,
    };
    let (tasks, total) = state.core.list_tasks(&filter).await?;
    Ok(Json(AgentTaskList {
        tasks: tasks.iter().map(TaskListItem::from).collect(),
        total,
    }))
}

async fn attention_tasks(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = parse_limit(query.limit, 20)?;
    let (tasks, total) = state.core.attention_tasks(limit).await?;
    Ok(Json(AgentTaskList {
        tasks: tasks.iter().map(TaskListItem::from).collect(),
        total,
    }))
}

async fn task_count(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let (total, by_status) = state.core.count_by_status().await?;
    let by_status: Map<String, Value> = by_status
        .into_iter()
        .map(|(status, count)| (status.to_string(), json!(count)))
        .collect();
    Ok(Json(json!({ "total": total, "by_status": by_status })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task = state
        .core
        .get_task(&id)
        .await?
        .ok_or_else(|| AppError::not_found("Task not found"))?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(data): Json<AgentTaskUpdate>,
) -> Result<impl IntoResponse, AppError> {
    if data.is_empty() {
        return Err(AppError::bad_request("At least one field required"));
    }
    let status = data.status.as_deref().map(parse_status).transpose()?;
    let task = state
        .core
        .update_task(
            &id,
            TaskPatch {
                status,
                output: data.output,
                progress_pct: data.progress_pct,
                current_step: data.current_step,
                decision_prompt: data.decision_prompt,
                decision: data.decision,
                context: data.context,
                worker_id: data.worker_id,
                target_state: data.target_state,
                success_evidence: opt_evidence(data.success_evidence),
                abort_evidence: opt_evidence(data.abort_evidence),
                observation_window_sec: data.observation_window_sec,
                route: None,
            },
        )
        .await?;
    Ok(Json(task))
}

async fn upsert_active(
    State(state): State<AppState>,
    Json(data): Json<AgentTaskUpsertActive>,
) -> Result<impl IntoResponse, AppError> {
    let task_type = data.task_type.as_deref().map(parse_kind).transpose()?;
    let (created, task) = state
        .core
        .upsert_active(UpsertActive {
            session_key: data.session_key,
            direction: data.direction,
            task_type,
            worker_id: data.worker_id,
            context: data.context,
        })
        .await?;
    Ok(Json(json!({ "created": created, "task": task })))
}

async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    if let Some(expected) = state.api_token.as_deref() {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if presented != expected {
            return Err(AppError::unauthorized());
        }
    }

    if state.core.get_task(&id).await?.is_none() {
        return Err(AppError::not_found("Task not found"));
    }

    // Execution (and its retries) run in the background; the caller polls
    // the task for the outcome.
    let core = state.core.clone();
    let task_id = id.clone();
    tokio::spawn(async move {
        let summary = core.execute(&task_id, ExecuteOptions::default()).await;
        tracing::info!(
            task_id = %task_id,
            ok = summary.ok,
            error = summary.error.as_deref().unwrap_or(""),
            "background execution finished"
        );
    });

    Ok(Json(json!({ "ok": true, "task_id": id, "scheduled": true })))
}

async fn route_task_type(
    State(state): State<AppState>,
    Query(query): Query<RouteQuery>,
) -> Result<impl IntoResponse, AppError> {
    let Some(raw) = query.task_type.as_deref() else {
        return Err(AppError::unprocessable(vec![
            "task_type query parameter is required".to_owned(),
        ]));
    };
    let kind = parse_kind(raw)?;
    let decision = state.core.route_preview(kind, query.executor.as_deref());
    Ok(Json(RouteResponse::from(decision)))
}

// ---------------------------------------------------------------------------
// Runner handlers
// ---------------------------------------------------------------------------

async fn runner_heartbeat(
    State(state): State<AppState>,
    Json(data): Json<AgentRunnerHeartbeat>,
) -> Result<impl IntoResponse, AppError> {
    let request = HeartbeatRequest {
        runner_id: data.runner_id,
        status: data.status.unwrap_or_else(|| "idle".to_owned()),
        lease_seconds: data.lease_seconds,
        host: data.host,
        pid: data.pid,
        version: data.version,
        active_task_id: data.active_task_id,
        active_run_id: data.active_run_id,
        last_error: data.last_error,
        capabilities: data.capabilities,
        metadata: data.metadata,
    };
    let runner = state.core.runners().heartbeat(&request).await?;

    // An idle heartbeat sweeps this runner's stale claims.
    let recovered = recover_on_idle_heartbeat(&state.core, &runner).await?;
    if !recovered.is_empty() {
        tracing::warn!(
            runner_id = %runner.runner_id,
            recovered = recovered.len(),
            "orphan tasks recovered on heartbeat"
        );
    }

    Ok(Json(RunnerSnapshot::build(&runner, state.core.runners().now())))
}

async fn list_runners(
    State(state): State<AppState>,
    Query(query): Query<RunnersQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = match query.limit {
        None => 100,
        Some(v) if (1..=500).contains(&v) => v as usize,
        Some(v) => {
            return Err(AppError::unprocessable(vec![format!(
                "limit must be in [1, 500]; got {v}"
            )]));
        }
    };
    let runners = state
        .core
        .runners()
        .list(query.include_stale.unwrap_or(false), limit)
        .await?;
    let now = state.core.runners().now();
    let snapshots: Vec<RunnerSnapshot> = runners
        .iter()
        .map(|r| RunnerSnapshot::build(r, now))
        .collect();
    let total = snapshots.len();
    Ok(Json(json!({ "runners": snapshots, "total": total })))
}

// ---------------------------------------------------------------------------
// Chat webhook
// ---------------------------------------------------------------------------

async fn telegram_webhook(
    State(state): State<AppState>,
    Json(update): Json<Value>,
) -> impl IntoResponse {
    state.chat.handle_update(&update).await;
    Json(json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    use drover_core::chat::RecordingTransport;
    use drover_core::clock::ManualClock;
    use drover_core::codex::{CodexOutput, CodexRunner};
    use drover_core::config::{ChatConfig, CoreConfig};
    use drover_core::provider::{ChatApi, ChatCompletion, ProviderError};
    use drover_core::routing::{Executor, RoutingEnv};
    use drover_db::memory::{MemoryRunnerStore, MemoryTaskStore, MemoryUsageLog};

    struct UnconfiguredChat;

    #[async_trait]
    impl ChatApi for UnconfiguredChat {
        async fn chat_completion(
            &self,
            _model: &str,
            _prompt: &str,
        ) -> Result<ChatCompletion, ProviderError> {
            Err(ProviderError::Unconfigured)
        }
    }

    struct NoCodex;

    #[async_trait]
    impl CodexRunner for NoCodex {
        async fn exec(&self, _model: &str, _prompt: &str) -> anyhow::Result<CodexOutput> {
            anyhow::bail!("unused")
        }
    }

    struct TestApp {
        state: AppState,
        transport: Arc<RecordingTransport>,
        clock: ManualClock,
    }

    fn test_app() -> TestApp {
        let clock = ManualClock::new(Utc::now());
        let transport = Arc::new(RecordingTransport::default());
        let chat_config = ChatConfig {
            bot_token: Some("test-token".to_owned()),
            chat_ids: vec!["chat-1".to_owned()],
            allowed_user_ids: vec!["100".to_owned()],
            failed_alert_window_secs: 1800,
            failed_alert_max_per_window: 10,
        };
        let core = Core::new(
            CoreConfig {
                chat: chat_config.clone(),
                ..CoreConfig::default()
            },
            RoutingEnv::fixed([Executor::Claude, Executor::Cursor, Executor::Openclaw]),
            Arc::new(clock.clone()),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryRunnerStore::new()),
            Arc::new(MemoryUsageLog::new()),
            Arc::new(UnconfiguredChat),
            Arc::new(NoCodex),
            transport.clone(),
        );
        let chat = Arc::new(ChatService::new(
            core.clone(),
            transport.clone(),
            chat_config,
        ));
        TestApp {
            state: AppState {
                core,
                chat,
                api_token: None,
            },
            transport,
            clock,
        }
    }

    async fn request(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let app = build_router(state.clone());
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_task(state: &AppState, direction: &str) -> Value {
        let resp = request(
            state,
            "POST",
            "/agent/tasks",
            Some(json!({"direction": direction, "task_type": "impl"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    // -----------------------------------------------------------------------
    // S1: create + list
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_and_list_roundtrip() {
        let app = test_app();
        let task = create_task(&app.state, "Add GET /api/projects endpoint").await;

        let id = task["id"].as_str().unwrap();
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), 21);
        assert!(id["task_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(task["status"], "pending");
        assert!(
            task["command"]
                .as_str()
                .unwrap()
                .contains("Add GET /api/projects endpoint")
        );

        let resp = request(&app.state, "GET", "/agent/tasks?task_type=impl&limit=10", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let list = body_json(resp).await;
        assert!(list["total"].as_i64().unwrap() >= 1);
        assert_eq!(list["tasks"][0]["id"], task["id"]);
        // List items omit the command.
        assert!(list["tasks"][0].get("command").is_none());
    }

    // -----------------------------------------------------------------------
    // S2: invalid inputs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn whitespace_direction_is_422() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/tasks",
            Some(json!({"direction": "   ", "task_type": "impl"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert!(body["detail"].is_array());
    }

    #[tokio::test]
    async fn invalid_task_type_is_422() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/tasks",
            Some(json!({"direction": "Do", "task_type": "invalid"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn overlong_direction_is_422() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/tasks",
            Some(json!({"direction": "x".repeat(5001), "task_type": "impl"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn empty_patch_is_400() {
        let app = test_app();
        let task = create_task(&app.state, "patch me").await;
        let resp = request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{}", task["id"].as_str().unwrap()),
            Some(json!({})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn out_of_range_progress_is_422() {
        let app = test_app();
        let task = create_task(&app.state, "progress me").await;
        let resp = request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{}", task["id"].as_str().unwrap()),
            Some(json!({"progress_pct": 150})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let app = test_app();
        let resp = request(&app.state, "GET", "/agent/tasks/task_ffffffffffffffff", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = request(
            &app.state,
            "PATCH",
            "/agent/tasks/task_ffffffffffffffff",
            Some(json!({"status": "running"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = request(
            &app.state,
            "POST",
            "/agent/tasks/task_ffffffffffffffff/execute",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn out_of_range_limit_is_422() {
        let app = test_app();
        let resp = request(&app.state, "GET", "/agent/tasks?limit=101", None).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    // -----------------------------------------------------------------------
    // S3: decision loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn decision_loop_alerts_once_then_resumes() {
        let app = test_app();
        let task = create_task(&app.state, "Deploy the service").await;
        let id = task["id"].as_str().unwrap();

        let resp = request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{id}"),
            Some(json!({"status": "needs_decision", "decision_prompt": "Approve deploy?"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        app.state.core.alerts().idle().await;
        let sent = app.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains(id));
        assert!(sent[0].1.contains("Approve deploy?"));

        // Same status again: no second alert.
        let resp = request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{id}"),
            Some(json!({
                "status": "needs_decision",
                "decision_prompt": "Approve deploy to staging?"
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        app.state.core.alerts().idle().await;
        assert_eq!(app.transport.sent().len(), 1);

        let resp = request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{id}"),
            Some(json!({"decision": "yes"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["decision"], "yes");
    }

    // -----------------------------------------------------------------------
    // Attention + count
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn attention_and_count_endpoints() {
        let app = test_app();
        let failed = create_task(&app.state, "will fail").await;
        create_task(&app.state, "still pending").await;
        let id = failed["id"].as_str().unwrap();
        request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{id}"),
            Some(json!({"status": "failed", "output": "broke"})),
        )
        .await;

        let resp = request(&app.state, "GET", "/agent/tasks/attention", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["tasks"][0]["status"], "failed");

        let resp = request(&app.state, "GET", "/agent/tasks/count", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["by_status"]["pending"], 1);
        assert_eq!(body["by_status"]["failed"], 1);
    }

    // -----------------------------------------------------------------------
    // Route endpoint
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn route_endpoint_shape() {
        let app = test_app();
        let resp = request(
            &app.state,
            "GET",
            "/agent/route?task_type=impl&executor=openclaw",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["task_type"], "impl");
        assert_eq!(body["executor"], "openclaw");
        assert_eq!(body["tier"], "openclaw");
        assert_eq!(body["provider"], "openai-codex");
        assert_eq!(body["is_paid_provider"], true);
        assert!(body["command_template"].as_str().unwrap().contains("{{direction}}"));
    }

    #[tokio::test]
    async fn route_requires_valid_task_type() {
        let app = test_app();
        let resp = request(&app.state, "GET", "/agent/route", None).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = request(&app.state, "GET", "/agent/route?task_type=nope", None).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    // -----------------------------------------------------------------------
    // Upsert-active
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn upsert_active_created_then_reconciled() {
        let app = test_app();
        let body = json!({
            "session_key": "sess-1",
            "direction": "external session",
            "task_type": "impl",
            "worker_id": "worker-a"
        });
        let resp = request(&app.state, "POST", "/agent/tasks/upsert-active", Some(body.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let first = body_json(resp).await;
        assert_eq!(first["created"], true);
        assert_eq!(first["task"]["status"], "running");

        let resp = request(&app.state, "POST", "/agent/tasks/upsert-active", Some(body)).await;
        let second = body_json(resp).await;
        assert_eq!(second["created"], false);
        assert_eq!(second["task"]["id"], first["task"]["id"]);
    }

    // -----------------------------------------------------------------------
    // Runners + orphan recovery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_and_listing() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/runners/heartbeat",
            Some(json!({
                "runner_id": "runner-1",
                "status": "idle",
                "lease_seconds": 120,
                "host": "worker-host",
                "pid": 4242
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["runner_id"], "runner-1");
        assert_eq!(body["online"], true);
        assert_eq!(body["host"], "worker-host");

        let resp = request(&app.state, "GET", "/agent/runners", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);

        // Lease expires; default listing hides the runner.
        app.clock
            .advance_async(chrono::Duration::seconds(200))
            .await;
        let resp = request(&app.state, "GET", "/agent/runners", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 0);
        let resp = request(&app.state, "GET", "/agent/runners?include_stale=true", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn heartbeat_missing_runner_id_is_422() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/runners/heartbeat",
            Some(json!({"runner_id": "  "})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    // S6 at the HTTP level: stale claimed task fails on idle heartbeat.
    #[tokio::test]
    async fn idle_heartbeat_recovers_orphan() {
        let app = test_app();
        let task = create_task(&app.state, "long runner").await;
        let id = task["id"].as_str().unwrap();
        request(
            &app.state,
            "PATCH",
            &format!("/agent/tasks/{id}"),
            Some(json!({"status": "running", "worker_id": "runner-9"})),
        )
        .await;

        app.clock
            .advance_async(chrono::Duration::seconds(3700))
            .await;
        let resp = request(
            &app.state,
            "POST",
            "/agent/runners/heartbeat",
            Some(json!({"runner_id": "runner-9", "status": "idle", "active_task_id": ""})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = request(&app.state, "GET", &format!("/agent/tasks/{id}"), None).await;
        let body = body_json(resp).await;
        assert_eq!(body["status"], "failed");
        assert!(body["output"].as_str().unwrap().starts_with("Orphan:"));
        assert_eq!(body["context"]["orphan_recovered_by_runner"], "runner-9");
        assert_eq!(body["context"]["orphan_recovered_running_seconds"], 3700);
        assert_eq!(body["context"]["orphan_recovered_threshold_seconds"], 1800);

        app.state.core.alerts().idle().await;
        let alerts: Vec<_> = app
            .transport
            .sent()
            .into_iter()
            .filter(|(_, m)| m.contains(id))
            .collect();
        assert_eq!(alerts.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Execute auth
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn execute_requires_token_when_configured() {
        let mut app = test_app();
        app.state.api_token = Some("secret".to_owned());
        let task = create_task(&app.state, "guarded").await;
        let id = task["id"].as_str().unwrap();

        let resp = request(
            &app.state,
            "POST",
            &format!("/agent/tasks/{id}/execute"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let router = build_router(app.state.clone());
        let req = Request::builder()
            .method("POST")
            .uri(format!("/agent/tasks/{id}/execute"))
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["scheduled"], true);
    }

    // -----------------------------------------------------------------------
    // Chat webhook
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn webhook_status_command_replies() {
        let app = test_app();
        create_task(&app.state, "one task").await;
        let resp = request(
            &app.state,
            "POST",
            "/agent/telegram/webhook",
            Some(json!({
                "message": {
                    "chat": {"id": 555},
                    "from": {"id": 100},
                    "text": "/status"
                }
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let sent = app.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "555");
        assert!(sent[0].1.contains("Agent status"));
    }

    #[tokio::test]
    async fn webhook_drops_non_allowlisted_user() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/telegram/webhook",
            Some(json!({
                "message": {
                    "chat": {"id": 555},
                    "from": {"id": 999},
                    "text": "/status"
                }
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(app.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn webhook_bare_text_creates_task() {
        let app = test_app();
        let resp = request(
            &app.state,
            "POST",
            "/agent/telegram/webhook",
            Some(json!({
                "message": {
                    "chat": {"id": 555},
                    "from": {"id": 100},
                    "text": "Add GET /api/projects"
                }
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let sent = app.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("✅ Task `task_"));

        let resp = request(&app.state, "GET", "/agent/tasks", None).await;
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["tasks"][0]["direction"], "Add GET /api/projects");
    }

    #[tokio::test]
    async fn webhook_unknown_command_gets_help() {
        let app = test_app();
        request(
            &app.state,
            "POST",
            "/agent/telegram/webhook",
            Some(json!({
                "message": {
                    "chat": {"id": 555},
                    "from": {"id": 100},
                    "text": "/frobnicate"
                }
            })),
        )
        .await;
        let sent = app.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("/status"));
        assert!(sent[0].1.contains("/reply"));
    }
}
