//! Storage interfaces for tasks, runners, and usage events.
//!
//! Three backends implement each trait: an in-process map (tests and
//! ephemeral deployments), a JSON file (single-node durability), and
//! PostgreSQL (shared durability). The lifecycle controller is the only
//! writer for tasks; these traits expose storage, not policy.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::models::{Runner, Task, TaskKind, TaskStatus, UsageEvent};

/// Storage-layer failures. Neither variant is retried inside a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage schema error: {0}")]
    Schema(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter and pagination for task listing. `limit`/`offset` are applied
/// after filtering; the returned total is the pre-pagination match count.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskKind>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            limit: 20,
            offset: 0,
        }
    }
}

/// Keyed persistence for [`Task`] records.
///
/// Object-safe so the controller can hold `Arc<dyn TaskStore>` and the
/// backend stays a deployment choice.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Exact lookup by id.
    async fn get(&self, id: &str) -> StoreResult<Option<Task>>;

    /// Filtered listing sorted by `created_at` descending.
    async fn list(&self, filter: &TaskFilter) -> StoreResult<(Vec<Task>, usize)>;

    /// Count of tasks per status.
    async fn count_by_status(&self) -> StoreResult<BTreeMap<TaskStatus, i64>>;

    /// Atomic insert-or-replace keyed by `task.id`.
    async fn upsert(&self, task: &Task) -> StoreResult<()>;

    /// Remove everything. Test and maintenance use only.
    async fn delete_all(&self) -> StoreResult<()>;

    /// Find the task whose `context.session_key` matches, if any.
    async fn find_by_session_key(&self, session_key: &str) -> StoreResult<Option<Task>>;

    /// All `running` tasks claimed by the given runner (orphan-recovery scan).
    async fn list_running_claimed_by(&self, runner_id: &str) -> StoreResult<Vec<Task>>;
}

/// Keyed persistence for [`Runner`] records. Lease bookkeeping and online
/// classification live in the registry service, not here.
#[async_trait]
pub trait RunnerStore: Send + Sync {
    async fn get(&self, runner_id: &str) -> StoreResult<Option<Runner>>;

    /// All runners sorted by `last_seen_at` descending.
    async fn list(&self, limit: usize) -> StoreResult<Vec<Runner>>;

    async fn upsert(&self, runner: &Runner) -> StoreResult<()>;

    async fn delete_all(&self) -> StoreResult<()>;
}

/// Append-only log of [`UsageEvent`] records.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append(&self, event: &UsageEvent) -> StoreResult<()>;

    /// Most recent events, newest first.
    async fn recent(&self, limit: usize) -> StoreResult<Vec<UsageEvent>>;
}

// Compile-time assertion: the traits must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskStore, _: &dyn RunnerStore, _: &dyn UsageLog) {}
};

/// Sort tasks newest-first by creation time, ties broken by id for a stable
/// order across backends.
pub(crate) fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

/// Apply filter + pagination to an already-materialized task list.
pub(crate) fn filter_page(mut tasks: Vec<Task>, filter: &TaskFilter) -> (Vec<Task>, usize) {
    tasks.retain(|t| {
        filter.status.is_none_or(|s| t.status == s)
            && filter.task_type.is_none_or(|k| t.task_type == k)
    });
    let total = tasks.len();
    sort_newest_first(&mut tasks);
    let items = tasks
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit)
        .collect();
    (items, total)
}
