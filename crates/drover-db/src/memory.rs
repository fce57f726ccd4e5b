//! In-process storage backends backed by `RwLock<HashMap>`.
//!
//! Used by tests and by deployments that opt out of persistence. Writes are
//! serialized by the lock; reads clone a consistent snapshot.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{Runner, Task, TaskStatus, UsageEvent};
use crate::store::{
    RunnerStore, StoreResult, TaskFilter, TaskStore, UsageLog, filter_page,
};

/// Ephemeral [`TaskStore`].
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> StoreResult<(Vec<Task>, usize)> {
        let tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        Ok(filter_page(tasks, filter))
    }

    async fn count_by_status(&self) -> StoreResult<BTreeMap<TaskStatus, i64>> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.read().await.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn upsert(&self, task: &Task) -> StoreResult<()> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.tasks.write().await.clear();
        Ok(())
    }

    async fn find_by_session_key(&self, session_key: &str) -> StoreResult<Option<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .find(|t| t.context.session_key() == Some(session_key))
            .cloned())
    }

    async fn list_running_claimed_by(&self, runner_id: &str) -> StoreResult<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.claimed_by.as_deref() == Some(runner_id)
            })
            .cloned()
            .collect())
    }
}

/// Ephemeral [`RunnerStore`].
#[derive(Default)]
pub struct MemoryRunnerStore {
    runners: RwLock<HashMap<String, Runner>>,
}

impl MemoryRunnerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnerStore for MemoryRunnerStore {
    async fn get(&self, runner_id: &str) -> StoreResult<Option<Runner>> {
        Ok(self.runners.read().await.get(runner_id).cloned())
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Runner>> {
        let mut runners: Vec<Runner> = self.runners.read().await.values().cloned().collect();
        runners.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        runners.truncate(limit);
        Ok(runners)
    }

    async fn upsert(&self, runner: &Runner) -> StoreResult<()> {
        self.runners
            .write()
            .await
            .insert(runner.runner_id.clone(), runner.clone());
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.runners.write().await.clear();
        Ok(())
    }
}

/// Ephemeral [`UsageLog`]. Append-only; `recent` returns newest first.
#[derive(Default)]
pub struct MemoryUsageLog {
    events: RwLock<Vec<UsageEvent>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLog for MemoryUsageLog {
    async fn append(&self, event: &UsageEvent) -> StoreResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<UsageEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
