//! PostgreSQL storage backends.
//!
//! Rows map one-to-one to the task fields with `context_json` holding the
//! context map as text (mirrors the JSON-file layout). The task store keeps a
//! TTL-guarded in-memory mirror for `list`; `get` always fetches the single
//! row and never reloads the table.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool};
use tokio::sync::RwLock;

use crate::models::{Runner, RunnerStatus, Task, TaskContext, TaskKind, TaskStatus, UsageEvent};
use crate::store::{
    RunnerStore, StoreError, StoreResult, TaskFilter, TaskStore, UsageLog, filter_page,
};

/// Default freshness window for the list mirror.
pub const DEFAULT_LIST_CACHE_TTL: Duration = Duration::from_secs(5);

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            // 42xxx: syntax error or access-rule violation (missing table or
            // column) -- a schema problem, not an availability problem.
            if db.code().is_some_and(|c| c.starts_with("42")) {
                StoreError::Schema(db.to_string())
            } else {
                StoreError::Unavailable(db.to_string())
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Schema(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn json_map(raw: &str) -> Map<String, Value> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn json_list(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    serde_json::from_str(raw).ok()
}

fn encode_list(list: Option<&Vec<String>>) -> Option<String> {
    list.and_then(|l| serde_json::to_string(l).ok())
}

// ---------------------------------------------------------------------------
// Task store
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct TaskRow {
    id: String,
    direction: String,
    task_type: TaskKind,
    status: TaskStatus,
    model: String,
    command: String,
    tier: String,
    output: Option<String>,
    context_json: String,
    progress_pct: Option<i32>,
    current_step: Option<String>,
    decision_prompt: Option<String>,
    decision: Option<String>,
    target_state: Option<String>,
    success_evidence_json: Option<String>,
    abort_evidence_json: Option<String>,
    observation_window_sec: Option<i64>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            direction: row.direction,
            task_type: row.task_type,
            status: row.status,
            model: row.model,
            command: row.command,
            tier: row.tier,
            output: row.output,
            context: TaskContext(json_map(&row.context_json)),
            progress_pct: row.progress_pct,
            current_step: row.current_step,
            decision_prompt: row.decision_prompt,
            decision: row.decision,
            target_state: row.target_state,
            success_evidence: json_list(row.success_evidence_json.as_deref()),
            abort_evidence: json_list(row.abort_evidence_json.as_deref()),
            observation_window_sec: row.observation_window_sec,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
        }
    }
}

struct ListMirror {
    loaded_at: Instant,
    tasks: Vec<Task>,
}

/// [`TaskStore`] backed by the `agent_tasks` table.
pub struct PgTaskStore {
    pool: PgPool,
    cache_ttl: Duration,
    mirror: RwLock<Option<ListMirror>>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_cache_ttl(pool, DEFAULT_LIST_CACHE_TTL)
    }

    pub fn with_cache_ttl(pool: PgPool, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cache_ttl,
            mirror: RwLock::new(None),
        }
    }

    async fn load_all(&self) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM agent_tasks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    /// Serve from the mirror when fresh, otherwise re-fetch the table.
    async fn snapshot(&self) -> StoreResult<Vec<Task>> {
        {
            let guard = self.mirror.read().await;
            if let Some(mirror) = guard.as_ref() {
                if mirror.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(mirror.tasks.clone());
                }
            }
        }
        let tasks = self.load_all().await?;
        *self.mirror.write().await = Some(ListMirror {
            loaded_at: Instant::now(),
            tasks: tasks.clone(),
        });
        Ok(tasks)
    }

    async fn invalidate(&self) {
        *self.mirror.write().await = None;
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM agent_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(Task::from))
    }

    async fn list(&self, filter: &TaskFilter) -> StoreResult<(Vec<Task>, usize)> {
        Ok(filter_page(self.snapshot().await?, filter))
    }

    async fn count_by_status(&self) -> StoreResult<BTreeMap<TaskStatus, i64>> {
        let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM agent_tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().collect())
    }

    async fn upsert(&self, task: &Task) -> StoreResult<()> {
        let context_json =
            serde_json::to_string(&task.context).unwrap_or_else(|_| "{}".to_owned());
        sqlx::query(
            "INSERT INTO agent_tasks (\
                 id, direction, task_type, status, model, command, tier, output, \
                 context_json, progress_pct, current_step, decision_prompt, decision, \
                 target_state, success_evidence_json, abort_evidence_json, \
                 observation_window_sec, claimed_by, claimed_at, created_at, updated_at, \
                 started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22) \
             ON CONFLICT (id) DO UPDATE SET \
                 direction = EXCLUDED.direction, \
                 task_type = EXCLUDED.task_type, \
                 status = EXCLUDED.status, \
                 model = EXCLUDED.model, \
                 command = EXCLUDED.command, \
                 tier = EXCLUDED.tier, \
                 output = EXCLUDED.output, \
                 context_json = EXCLUDED.context_json, \
                 progress_pct = EXCLUDED.progress_pct, \
                 current_step = EXCLUDED.current_step, \
                 decision_prompt = EXCLUDED.decision_prompt, \
                 decision = EXCLUDED.decision, \
                 target_state = EXCLUDED.target_state, \
                 success_evidence_json = EXCLUDED.success_evidence_json, \
                 abort_evidence_json = EXCLUDED.abort_evidence_json, \
                 observation_window_sec = EXCLUDED.observation_window_sec, \
                 claimed_by = EXCLUDED.claimed_by, \
                 claimed_at = EXCLUDED.claimed_at, \
                 updated_at = EXCLUDED.updated_at, \
                 started_at = EXCLUDED.started_at",
        )
        .bind(&task.id)
        .bind(&task.direction)
        .bind(task.task_type)
        .bind(task.status)
        .bind(&task.model)
        .bind(&task.command)
        .bind(&task.tier)
        .bind(&task.output)
        .bind(&context_json)
        .bind(task.progress_pct)
        .bind(&task.current_step)
        .bind(&task.decision_prompt)
        .bind(&task.decision)
        .bind(&task.target_state)
        .bind(encode_list(task.success_evidence.as_ref()))
        .bind(encode_list(task.abort_evidence.as_ref()))
        .bind(task.observation_window_sec)
        .bind(&task.claimed_by)
        .bind(task.claimed_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.started_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.invalidate().await;
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM agent_tasks")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        self.invalidate().await;
        Ok(())
    }

    async fn find_by_session_key(&self, session_key: &str) -> StoreResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM agent_tasks \
             WHERE context_json::jsonb ->> 'session_key' = $1 \
             ORDER BY created_at DESC \
             LIMIT 1",
        )
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(Task::from))
    }

    async fn list_running_claimed_by(&self, runner_id: &str) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM agent_tasks WHERE status = 'running' AND claimed_by = $1",
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(Task::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Runner store
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct RunnerRow {
    runner_id: String,
    status: RunnerStatus,
    host: String,
    pid: Option<i64>,
    version: String,
    active_task_id: String,
    active_run_id: String,
    last_error: String,
    metadata_json: String,
    lease_expires_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        Runner {
            runner_id: row.runner_id,
            status: row.status,
            host: row.host,
            pid: row.pid,
            version: row.version,
            active_task_id: row.active_task_id,
            active_run_id: row.active_run_id,
            last_error: row.last_error,
            metadata: json_map(&row.metadata_json),
            lease_expires_at: row.lease_expires_at,
            last_seen_at: row.last_seen_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// [`RunnerStore`] backed by the `agent_runners` table.
pub struct PgRunnerStore {
    pool: PgPool,
}

impl PgRunnerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunnerStore for PgRunnerStore {
    async fn get(&self, runner_id: &str) -> StoreResult<Option<Runner>> {
        let row =
            sqlx::query_as::<_, RunnerRow>("SELECT * FROM agent_runners WHERE runner_id = $1")
                .bind(runner_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(row.map(Runner::from))
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM agent_runners ORDER BY last_seen_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(Runner::from).collect())
    }

    async fn upsert(&self, runner: &Runner) -> StoreResult<()> {
        let metadata_json =
            serde_json::to_string(&runner.metadata).unwrap_or_else(|_| "{}".to_owned());
        sqlx::query(
            "INSERT INTO agent_runners (\
                 runner_id, status, host, pid, version, active_task_id, active_run_id, \
                 last_error, metadata_json, lease_expires_at, last_seen_at, created_at, \
                 updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (runner_id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 host = EXCLUDED.host, \
                 pid = EXCLUDED.pid, \
                 version = EXCLUDED.version, \
                 active_task_id = EXCLUDED.active_task_id, \
                 active_run_id = EXCLUDED.active_run_id, \
                 last_error = EXCLUDED.last_error, \
                 metadata_json = EXCLUDED.metadata_json, \
                 lease_expires_at = EXCLUDED.lease_expires_at, \
                 last_seen_at = EXCLUDED.last_seen_at, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&runner.runner_id)
        .bind(runner.status)
        .bind(&runner.host)
        .bind(runner.pid)
        .bind(&runner.version)
        .bind(&runner.active_task_id)
        .bind(&runner.active_run_id)
        .bind(&runner.last_error)
        .bind(&metadata_json)
        .bind(runner.lease_expires_at)
        .bind(runner.last_seen_at)
        .bind(runner.created_at)
        .bind(runner.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM agent_runners")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Usage log
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct UsageEventRow {
    event_id: String,
    source: String,
    endpoint: String,
    method: String,
    status_code: i32,
    runtime_ms: f64,
    runtime_cost_usd: f64,
    metadata_json: String,
    recorded_at: DateTime<Utc>,
}

impl From<UsageEventRow> for UsageEvent {
    fn from(row: UsageEventRow) -> Self {
        UsageEvent {
            event_id: row.event_id,
            source: row.source,
            endpoint: row.endpoint,
            method: row.method,
            status_code: row.status_code,
            runtime_ms: row.runtime_ms,
            runtime_cost_usd: row.runtime_cost_usd,
            metadata: json_map(&row.metadata_json),
            recorded_at: row.recorded_at,
        }
    }
}

/// Append-only [`UsageLog`] backed by the `usage_events` table.
pub struct PgUsageLog {
    pool: PgPool,
}

impl PgUsageLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLog for PgUsageLog {
    async fn append(&self, event: &UsageEvent) -> StoreResult<()> {
        let metadata_json =
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_owned());
        sqlx::query(
            "INSERT INTO usage_events (\
                 event_id, source, endpoint, method, status_code, runtime_ms, \
                 runtime_cost_usd, metadata_json, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(&event.endpoint)
        .bind(&event.method)
        .bind(event.status_code)
        .bind(event.runtime_ms)
        .bind(event.runtime_cost_usd)
        .bind(&metadata_json)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query_as::<_, UsageEventRow>(
            "SELECT * FROM usage_events ORDER BY recorded_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(UsageEvent::from).collect())
    }
}
