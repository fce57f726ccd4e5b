//! Lifecycle controller: the single writer for every task mutation.
//!
//! Owns the `pending → running → {completed, failed, needs_decision}` state
//! machine, the paid-provider guard, failure diagnostics, output truncation,
//! alert enqueueing, and the retry loop around the execution adapter.
//! Writes to one task are serialized through a per-task async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use drover_db::models::{Task, TaskContext, TaskKind, TaskStatus};
use drover_db::store::{StoreError, TaskFilter, TaskStore, UsageLog};

use crate::alert::AlertDispatcher;
use crate::chat::ChatTransport;
use crate::clock::{Clock, mint_task_id};
use crate::codex::CodexRunner;
use crate::config::CoreConfig;
use crate::exec::{CostBudget, ExecOutcome, ExecutionAdapter};
use crate::provider::ChatApi;
use crate::registry::RunnerRegistry;
use crate::retry::{FailureBucket, RetryPolicy, plan_retry};
use crate::routing::{RouteDecision, RoutingEnv, build_command, route};
use crate::usage::UsageRecorder;

/// The exact output stored when the paid-provider guard blocks execution.
pub const PAID_PROVIDER_BLOCKED_OUTPUT: &str =
    "Blocked: task routes to a paid provider and AGENT_ALLOW_PAID_PROVIDERS is disabled.";

const DIRECTION_MAX: usize = 5000;
const TARGET_STATE_MAX: usize = 600;
const OBSERVATION_WINDOW_MAX: i64 = 604_800;
const SESSION_KEY_MAX: usize = 200;
const TRUNCATION_SUFFIX: &str = "...[truncated]";
const TASK_CARD_REQUIRED: [&str; 5] =
    ["goal", "files_allowed", "done_when", "commands", "constraints"];
const FAILURE_HISTORY_SCAN: usize = 50;
const DIRECTION_PREFIX_MATCH: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Controller-level failures surfaced to callers (HTTP, chat, CLI).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::Invalid(vec![detail.into()])
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Validated input for task creation.
#[derive(Debug, Clone, Default)]
pub struct TaskCreate {
    pub direction: String,
    pub task_type: Option<TaskKind>,
    pub context: Option<Map<String, Value>>,
    pub target_state: Option<String>,
    pub success_evidence: Option<Vec<String>>,
    pub abort_evidence: Option<Vec<String>>,
    pub observation_window_sec: Option<i64>,
}

/// Partial update applied through [`Core::update_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub output: Option<String>,
    pub progress_pct: Option<i64>,
    pub current_step: Option<String>,
    pub decision_prompt: Option<String>,
    pub decision: Option<String>,
    pub context: Option<Map<String, Value>>,
    pub worker_id: Option<String>,
    pub target_state: Option<String>,
    pub success_evidence: Option<Vec<String>>,
    pub abort_evidence: Option<Vec<String>>,
    pub observation_window_sec: Option<i64>,
    /// Internal: a retry rewrote the route; refresh the snapshot fields.
    pub route: Option<RouteDecision>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
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
            && self.route.is_none()
    }
}

/// Input for [`Core::upsert_active`].
#[derive(Debug, Clone, Default)]
pub struct UpsertActive {
    pub session_key: String,
    pub direction: String,
    pub task_type: Option<TaskKind>,
    pub worker_id: Option<String>,
    pub context: Option<Map<String, Value>>,
}

/// Options for [`Core::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub worker_id: String,
    pub force_paid_providers: bool,
    pub budget: CostBudget,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            worker_id: "drover-worker:server".to_owned(),
            force_paid_providers: false,
            budget: CostBudget::default(),
        }
    }
}

/// Compact result of one `execute` call (including any retries it ran).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecSummary {
    pub ok: bool,
    /// Terminal status when execution actually ran; `None` when it was
    /// short-circuited (unknown task, claim failure, paid-provider block).
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_direction(raw: &str, errors: &mut Vec<String>) -> String {
    let trimmed = raw.trim().to_owned();
    if trimmed.is_empty() {
        errors.push("direction must not be empty".to_owned());
    } else if trimmed.chars().count() > DIRECTION_MAX {
        errors.push(format!("direction exceeds {DIRECTION_MAX} characters"));
    }
    trimmed
}

fn validate_target_state(raw: Option<&str>, errors: &mut Vec<String>) -> Option<String> {
    let trimmed = raw.map(str::trim)?;
    if trimmed.is_empty() {
        errors.push("target_state must not be empty".to_owned());
        return None;
    }
    if trimmed.chars().count() > TARGET_STATE_MAX {
        errors.push(format!("target_state exceeds {TARGET_STATE_MAX} characters"));
        return None;
    }
    Some(trimmed.to_owned())
}

fn validate_observation_window(raw: Option<i64>, errors: &mut Vec<String>) -> Option<i64> {
    let value = raw?;
    if !(1..=OBSERVATION_WINDOW_MAX).contains(&value) {
        errors.push(format!(
            "observation_window_sec must be in [1, {OBSERVATION_WINDOW_MAX}]"
        ));
        return None;
    }
    Some(value)
}

/// Trim entries and drop empties; evidence lists never carry blanks.
fn normalize_evidence(list: Option<Vec<String>>) -> Option<Vec<String>> {
    list.map(|items| {
        items
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_owned();
    }
    let mut truncated: String = output.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}

/// Score the task card: `1 − missing/required` over the five card fields.
fn task_card_validation(context: &TaskContext) -> Value {
    let card = context.get("task_card").and_then(Value::as_object);
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for key in TASK_CARD_REQUIRED {
        let found = card.is_some_and(|c| {
            c.get(key)
                .map(|v| match v {
                    Value::String(s) => !s.trim().is_empty(),
                    Value::Null => false,
                    Value::Array(a) => !a.is_empty(),
                    _ => true,
                })
                .unwrap_or(false)
        });
        if found {
            present.push(key);
        } else {
            missing.push(key);
        }
    }
    let score = 1.0 - missing.len() as f64 / TASK_CARD_REQUIRED.len() as f64;
    json!({
        "present": present,
        "missing": missing,
        "score": (score * 100.0).round() / 100.0,
    })
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// The lifecycle controller. All other components are pure, append-only, or
/// call back into this type.
pub struct Core {
    pub(crate) config: CoreConfig,
    pub(crate) routing: RoutingEnv,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) runners: RunnerRegistry,
    pub(crate) adapter: ExecutionAdapter,
    pub(crate) alerts: AlertDispatcher,
    pub(crate) usage: UsageRecorder,
    transport: Arc<dyn ChatTransport>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Core {
    /// Assemble the controller. Must run inside a tokio runtime (the alert
    /// worker is spawned here).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        routing: RoutingEnv,
        clock: Arc<dyn Clock>,
        tasks: Arc<dyn TaskStore>,
        runner_store: Arc<dyn drover_db::store::RunnerStore>,
        usage_log: Arc<dyn UsageLog>,
        chat_api: Arc<dyn ChatApi>,
        codex: Arc<dyn CodexRunner>,
        transport: Arc<dyn ChatTransport>,
    ) -> Arc<Self> {
        let usage = UsageRecorder::new(usage_log, clock.clone(), config.cost_per_second);
        let adapter = ExecutionAdapter::new(chat_api, codex, usage.clone());
        let alerts = AlertDispatcher::new(transport.clone(), &config.chat, clock.clone());
        let runners = RunnerRegistry::new(runner_store, clock.clone());
        Arc::new(Self {
            config,
            routing,
            clock,
            tasks,
            runners,
            adapter,
            alerts,
            usage,
            transport,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    pub fn chat_transport(&self) -> Arc<dyn ChatTransport> {
        self.transport.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn routing_env(&self) -> &RoutingEnv {
        &self.routing
    }

    async fn task_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            env_retry_max: self.config.retry_max_env,
            auto_retry_openai_override: self.config.auto_retry_openai_override,
            openai_model_override: self.config.retry_openai_model_override.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        Ok(self.tasks.get(id).await?)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<(Vec<Task>, usize), CoreError> {
        Ok(self.tasks.list(filter).await?)
    }

    /// Tasks an operator should look at: `failed` and `needs_decision`.
    pub async fn attention_tasks(&self, limit: usize) -> Result<(Vec<Task>, usize), CoreError> {
        let (tasks, _) = self
            .tasks
            .list(&TaskFilter {
                limit: usize::MAX,
                ..TaskFilter::default()
            })
            .await?;
        let mut items: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.status.needs_attention())
            .collect();
        let total = items.len();
        items.truncate(limit);
        Ok((items, total))
    }

    pub async fn count_by_status(
        &self,
    ) -> Result<(i64, std::collections::BTreeMap<TaskStatus, i64>), CoreError> {
        let by_status = self.tasks.count_by_status().await?;
        let total = by_status.values().sum();
        Ok((total, by_status))
    }

    /// Per-model usage derived from tasks, plus the current routing table.
    pub async fn usage_summary(&self) -> Result<Value, CoreError> {
        let (tasks, _) = self
            .tasks
            .list(&TaskFilter {
                limit: usize::MAX,
                ..TaskFilter::default()
            })
            .await?;
        let mut by_model: Map<String, Value> = Map::new();
        for task in &tasks {
            let entry = by_model
                .entry(task.model.clone())
                .or_insert_with(|| json!({"count": 0, "by_status": {}, "last_used": null}));
            entry["count"] = json!(entry["count"].as_i64().unwrap_or(0) + 1);
            let status = task.status.to_string();
            let prior = entry["by_status"][&status].as_i64().unwrap_or(0);
            entry["by_status"][&status] = json!(prior + 1);
            let ts = task.updated_at.unwrap_or(task.created_at).to_rfc3339();
            if entry["last_used"].as_str().is_none_or(|prev| prev < ts.as_str()) {
                entry["last_used"] = json!(ts);
            }
        }

        let mut routing = Map::new();
        for kind in [
            TaskKind::Spec,
            TaskKind::Test,
            TaskKind::Impl,
            TaskKind::Review,
            TaskKind::Heal,
        ] {
            let decision = route(&self.routing, kind, "", &TaskContext::new(), 0);
            routing.insert(
                kind.to_string(),
                json!({"model": decision.model, "tier": decision.tier.to_string()}),
            );
        }

        Ok(json!({"by_model": by_model, "routing": routing}))
    }

    /// Route preview for `GET /agent/route` and the CLI.
    pub fn route_preview(&self, kind: TaskKind, executor: Option<&str>) -> RouteDecision {
        let mut context = TaskContext::new();
        if let Some(executor) = executor.map(str::trim).filter(|e| !e.is_empty()) {
            context.set("executor", executor);
        }
        route(&self.routing, kind, "", &context, 0)
    }

    /// Count recent failed tasks with the same shape (kind + direction
    /// prefix); feeds the routing escalation heuristic.
    async fn recent_failure_count(&self, kind: TaskKind, direction: &str) -> u32 {
        let filter = TaskFilter {
            task_type: Some(kind),
            limit: FAILURE_HISTORY_SCAN,
            ..TaskFilter::default()
        };
        let Ok((tasks, _)) = self.tasks.list(&filter).await else {
            return 0;
        };
        let prefix: String = direction
            .trim()
            .to_ascii_lowercase()
            .chars()
            .take(DIRECTION_PREFIX_MATCH)
            .collect();
        if prefix.is_empty() {
            return 0;
        }
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter(|t| t.direction.trim().to_ascii_lowercase().starts_with(&prefix))
            .count() as u32
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, req: TaskCreate) -> Result<Task, CoreError> {
        let mut errors = Vec::new();
        let direction = validate_direction(&req.direction, &mut errors);
        let Some(task_type) = req.task_type else {
            errors.push("task_type must be one of spec, test, impl, review, heal".to_owned());
            return Err(CoreError::Invalid(errors));
        };
        let target_state = validate_target_state(req.target_state.as_deref(), &mut errors);
        let observation_window_sec =
            validate_observation_window(req.observation_window_sec, &mut errors);
        if !errors.is_empty() {
            return Err(CoreError::Invalid(errors));
        }

        let mut context = TaskContext(req.context.unwrap_or_default());
        let recent_failures = self.recent_failure_count(task_type, &direction).await;
        let decision = route(&self.routing, task_type, &direction, &context, recent_failures);
        let command = build_command(&decision.command_template, &direction);

        context.set("route_decision", decision.snapshot());
        context.set("executor_policy", json!({"reason": decision.reason.as_str()}));
        context.set("task_card_validation", task_card_validation(&context));

        let now = self.clock.now();
        let task = Task {
            id: mint_task_id(),
            direction,
            task_type,
            status: TaskStatus::Pending,
            model: decision.model.clone(),
            command,
            tier: decision.tier.to_string(),
            output: None,
            context,
            progress_pct: None,
            current_step: None,
            decision_prompt: None,
            decision: None,
            target_state,
            success_evidence: normalize_evidence(req.success_evidence),
            abort_evidence: normalize_evidence(req.abort_evidence),
            observation_window_sec,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: None,
            started_at: None,
        };

        self.tasks.upsert(&task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            executor = %decision.executor,
            model = %task.model,
            reason = decision.reason.as_str(),
            "task created"
        );
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Atomic read-modify-write of one task. Enqueues at most one alert when
    /// the task newly enters `failed` or `needs_decision`.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, CoreError> {
        let mut errors = Vec::new();
        if let Some(pct) = patch.progress_pct {
            if !(0..=100).contains(&pct) {
                errors.push("progress_pct must be an integer in [0, 100]".to_owned());
            }
        }
        let target_state = validate_target_state(patch.target_state.as_deref(), &mut errors);
        let observation_window_sec =
            validate_observation_window(patch.observation_window_sec, &mut errors);
        if !errors.is_empty() {
            return Err(CoreError::Invalid(errors));
        }

        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let mut task = self
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        let prior_status = task.status;
        let now = self.clock.now();

        // A decision on a waiting task resumes it.
        if let Some(decision) = patch.decision.as_deref() {
            if task.status == TaskStatus::NeedsDecision {
                task.status = TaskStatus::Running;
            }
            if task.decision.is_none() {
                task.decision = Some(decision.to_owned());
            }
        }

        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(output) = patch.output {
            task.output = Some(output);
        }
        if let Some(pct) = patch.progress_pct {
            task.progress_pct = Some(pct as i32);
        }
        if let Some(step) = patch.current_step {
            task.current_step = Some(step);
        }
        if let Some(prompt) = patch.decision_prompt {
            task.decision_prompt = Some(prompt);
        }
        if let Some(target) = target_state {
            task.target_state = Some(target);
        }
        if let Some(evidence) = normalize_evidence(patch.success_evidence) {
            task.success_evidence = Some(evidence);
        }
        if let Some(evidence) = normalize_evidence(patch.abort_evidence) {
            task.abort_evidence = Some(evidence);
        }
        if let Some(window) = observation_window_sec {
            task.observation_window_sec = Some(window);
        }
        if let Some(context_patch) = patch.context.as_ref() {
            task.context.merge(context_patch);
        }
        if let Some(worker_id) = patch.worker_id.as_deref().map(str::trim).filter(|w| !w.is_empty())
        {
            task.claimed_by = Some(worker_id.to_owned());
            task.claimed_at = Some(now);
        }
        if let Some(decision) = patch.route {
            task.model = decision.model.clone();
            task.command = build_command(&decision.command_template, &task.direction);
            task.tier = decision.tier.to_string();
            task.context.set("route_decision", decision.snapshot());
        }

        if task.status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }

        if task.status == TaskStatus::Failed && task.status != prior_status {
            self.apply_failure_diagnostics(&mut task);
        }

        if let Some(output) = task.output.as_deref() {
            let truncated = truncate_output(output, self.config.output_max_chars);
            if truncated.len() != output.len() {
                task.output = Some(truncated);
            }
        }

        task.updated_at = Some(now);
        self.tasks.upsert(&task).await?;

        if task.status.needs_attention() && task.status != prior_status {
            self.alerts.notify_transition(&task).await;
        }

        Ok(task)
    }

    /// A failed task always carries a non-empty output plus the diagnostics
    /// bookkeeping in context.
    fn apply_failure_diagnostics(&self, task: &mut Task) {
        let supplied = task
            .output
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned);
        let context_error = task.context.error().map(str::to_owned);

        let source_text = supplied
            .clone()
            .or_else(|| context_error.clone())
            .unwrap_or_default();
        let bucket = FailureBucket::classify(&source_text);

        if supplied.is_none() {
            task.output = Some(match context_error.as_deref() {
                Some(err) => format!("Task failed: {err}"),
                None => "Task failed without diagnostic output.".to_owned(),
            });
        }

        let diagnostics_source = if context_error.is_some() {
            "context.error"
        } else {
            "fallback"
        };
        task.context
            .set("failure_diagnostics_source", diagnostics_source);
        task.context.set("failure_reason_bucket", bucket.as_str());
    }

    // -----------------------------------------------------------------------
    // Upsert-active
    // -----------------------------------------------------------------------

    /// Reconcile an externally-started session. Creates a `running` task on
    /// the first call for a session key; later calls only refresh identity
    /// fields (terminal tasks are never revived).
    pub async fn upsert_active(&self, req: UpsertActive) -> Result<(bool, Task), CoreError> {
        let mut errors = Vec::new();
        let session_key = req.session_key.trim().to_owned();
        if session_key.is_empty() || session_key.chars().count() > SESSION_KEY_MAX {
            errors.push(format!("session_key must be 1..{SESSION_KEY_MAX} characters"));
        }
        let direction = validate_direction(&req.direction, &mut errors);
        if !errors.is_empty() {
            return Err(CoreError::Invalid(errors));
        }

        if let Some(found) = self.tasks.find_by_session_key(&session_key).await? {
            let lock = self.task_lock(&found.id).await;
            let _guard = lock.lock().await;
            // Re-read under the lock so the reconcile sees the latest write.
            let mut existing = self.tasks.get(&found.id).await?.unwrap_or(found);
            let now = self.clock.now();
            if let Some(worker_id) = req.worker_id.as_deref().map(str::trim).filter(|w| !w.is_empty())
            {
                existing.claimed_by = Some(worker_id.to_owned());
                existing.claimed_at = Some(now);
            }
            existing.context.set("session_last_seen_at", now.to_rfc3339());
            existing.updated_at = Some(now);
            self.tasks.upsert(&existing).await?;
            return Ok((false, existing));
        }

        let mut context = req.context.unwrap_or_default();
        context.insert("session_key".into(), json!(session_key));
        let task = self
            .create_task(TaskCreate {
                direction,
                task_type: Some(req.task_type.unwrap_or(TaskKind::Impl)),
                context: Some(context),
                ..TaskCreate::default()
            })
            .await?;

        let now = self.clock.now();
        let worker_id = req
            .worker_id
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .unwrap_or("external-session");
        let task = self
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    worker_id: Some(worker_id.to_owned()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        info!(task_id = %task.id, session_key = %session_key, started_at = %now, "active session task created");
        Ok((true, task))
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Claim and execute a task, folding the provider result back into it.
    /// Failures consult the retry policy; a granted retry re-enters the loop
    /// with an incremented depth counter.
    pub async fn execute(&self, id: &str, opts: ExecuteOptions) -> ExecSummary {
        let mut retry_depth: u32 = 0;
        let mut force_paid = opts.force_paid_providers;

        loop {
            // Claim: pending (or re-enqueued) task goes to running.
            let claimed = self
                .update_task(
                    id,
                    TaskPatch {
                        status: Some(TaskStatus::Running),
                        worker_id: Some(opts.worker_id.clone()),
                        ..TaskPatch::default()
                    },
                )
                .await;
            let task = match claimed {
                Ok(task) => task,
                Err(CoreError::NotFound(_)) => {
                    return ExecSummary {
                        ok: false,
                        status: None,
                        error: Some("task_not_found".to_owned()),
                        elapsed_ms: 0,
                        model: String::new(),
                    };
                }
                Err(err) => {
                    warn!(task_id = id, error = %err, "claim failed");
                    return ExecSummary {
                        ok: false,
                        status: None,
                        error: Some(format!("claim_failed:{err}")),
                        elapsed_ms: 0,
                        model: String::new(),
                    };
                }
            };

            let force = force_paid || task.context.force_paid_providers();
            let route_is_paid = task.context.route_is_paid();

            // Policy gate, evaluated before any provider call.
            if route_is_paid && !self.config.allow_paid_providers && !force {
                let mut context_patch = Map::new();
                context_patch.insert("error".into(), json!("paid_provider_blocked"));
                let _ = self
                    .update_task(
                        id,
                        TaskPatch {
                            status: Some(TaskStatus::Failed),
                            output: Some(PAID_PROVIDER_BLOCKED_OUTPUT.to_owned()),
                            context: Some(context_patch),
                            worker_id: Some(opts.worker_id.clone()),
                            ..TaskPatch::default()
                        },
                    )
                    .await;
                self.usage
                    .task_completion(id, &task.task_type.to_string(), &task.model, 1, false)
                    .await;
                return ExecSummary {
                    ok: false,
                    status: None,
                    error: Some("paid_provider_blocked".to_owned()),
                    elapsed_ms: 1,
                    model: task.model,
                };
            }

            let prompt = task.direction.trim().to_owned();
            let (folded, result_error) = if prompt.is_empty() {
                (
                    self.fold_failure(id, &opts.worker_id, "Empty direction".to_owned())
                        .await,
                    "Empty direction".to_owned(),
                )
            } else {
                info!(
                    task_id = id,
                    worker_id = %opts.worker_id,
                    model = %task.model,
                    retry_depth,
                    "executing task"
                );
                let outcome = self
                    .adapter
                    .run(id, &task.model, &prompt, route_is_paid, opts.budget)
                    .await;
                match outcome {
                    ExecOutcome::Success {
                        elapsed_ms,
                        content,
                        ..
                    } => {
                        let updated = self
                            .update_task(
                                id,
                                TaskPatch {
                                    status: Some(TaskStatus::Completed),
                                    output: Some(content),
                                    worker_id: Some(opts.worker_id.clone()),
                                    ..TaskPatch::default()
                                },
                            )
                            .await;
                        self.usage
                            .task_completion(
                                id,
                                &task.task_type.to_string(),
                                &task.model,
                                elapsed_ms,
                                true,
                            )
                            .await;
                        return ExecSummary {
                            ok: updated.is_ok(),
                            status: Some(TaskStatus::Completed),
                            error: None,
                            elapsed_ms,
                            model: task.model,
                        };
                    }
                    ExecOutcome::Failure { elapsed_ms, error } => {
                        let folded = self.fold_failure(id, &opts.worker_id, error.clone()).await;
                        self.usage
                            .task_completion(
                                id,
                                &task.task_type.to_string(),
                                &task.model,
                                elapsed_ms,
                                false,
                            )
                            .await;
                        (folded, error)
                    }
                }
            };

            let Some(failed_task) = folded else {
                return ExecSummary {
                    ok: false,
                    status: Some(TaskStatus::Failed),
                    error: Some(result_error),
                    elapsed_ms: 0,
                    model: task.model,
                };
            };

            // Retry policy over the failed result.
            let plan = plan_retry(
                &self.retry_policy(),
                &failed_task,
                &result_error,
                retry_depth,
                self.clock.now(),
            );

            let Some(retry) = plan.retry else {
                let _ = self
                    .update_task(
                        id,
                        TaskPatch {
                            context: Some(plan.context_patch),
                            worker_id: Some(opts.worker_id.clone()),
                            ..TaskPatch::default()
                        },
                    )
                    .await;
                return ExecSummary {
                    ok: false,
                    status: Some(TaskStatus::Failed),
                    error: Some(result_error),
                    elapsed_ms: 0,
                    model: failed_task.model,
                };
            };

            // Escalation may rewrite the route snapshot for the next attempt.
            let reroute = if plan.context_patch.contains_key("model_override")
                || plan.context_patch.contains_key("executor")
            {
                let mut context = failed_task.context.clone();
                context.merge(&plan.context_patch);
                Some(route(
                    &self.routing,
                    failed_task.task_type,
                    &failed_task.direction,
                    &context,
                    0,
                ))
            } else {
                None
            };

            let requeued = self
                .update_task(
                    id,
                    TaskPatch {
                        status: Some(TaskStatus::Pending),
                        current_step: Some(format!(
                            "retrying ({}/{})",
                            retry.attempt, retry.retry_max
                        )),
                        context: Some(plan.context_patch),
                        worker_id: Some(opts.worker_id.clone()),
                        route: reroute,
                        ..TaskPatch::default()
                    },
                )
                .await;
            if let Err(err) = requeued {
                warn!(task_id = id, error = %err, "failed to re-enqueue for retry");
                return ExecSummary {
                    ok: false,
                    status: Some(TaskStatus::Failed),
                    error: Some(result_error),
                    elapsed_ms: 0,
                    model: failed_task.model,
                };
            }

            force_paid = force_paid || retry.force_paid_providers;
            retry_depth += 1;
        }
    }

    /// Fold a failure into the task; returns the refreshed task when the
    /// write succeeded.
    async fn fold_failure(&self, id: &str, worker_id: &str, error: String) -> Option<Task> {
        match self
            .update_task(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    output: Some(error),
                    worker_id: Some(worker_id.to_owned()),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(task_id = id, error = %err, "failed to fold failure into task");
                None
            }
        }
    }
}
