//! JSON-file storage backends.
//!
//! A memory mirror serves all reads; every write rewrites the file through a
//! temp-file-then-rename so a crash mid-write never leaves a torn document.
//! Layout: `{"tasks": [...]}` / `{"runners": [...]}`; usage events are JSONL.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::models::{Runner, Task, TaskStatus, UsageEvent};
use crate::store::{
    RunnerStore, StoreError, StoreResult, TaskFilter, TaskStore, UsageLog, filter_page,
    sort_newest_first,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskDocument {
    tasks: Vec<Task>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunnerDocument {
    runners: Vec<Runner>,
}

fn io_err(err: std::io::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn decode_err(err: serde_json::Error) -> StoreError {
    StoreError::Schema(err.to_string())
}

async fn read_document<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> StoreResult<T> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => serde_json::from_str(&contents).map_err(decode_err),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(io_err(err)),
    }
}

async fn write_document<T: Serialize>(path: &Path, doc: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    let contents = serde_json::to_vec_pretty(doc)
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(&contents).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// [`TaskStore`] persisted to a single JSON file.
pub struct JsonFileTaskStore {
    path: PathBuf,
    tasks: RwLock<HashMap<String, Task>>,
}

impl JsonFileTaskStore {
    /// Open the store, loading any existing rows as the initial state.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc: TaskDocument = read_document(&path).await?;
        let tasks = doc.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    async fn persist(&self, snapshot: &HashMap<String, Task>) -> StoreResult<()> {
        let mut tasks: Vec<Task> = snapshot.values().cloned().collect();
        sort_newest_first(&mut tasks);
        write_document(&self.path, &TaskDocument { tasks }).await
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
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
        let mut guard = self.tasks.write().await;
        guard.insert(task.id.clone(), task.clone());
        self.persist(&guard).await
    }

    async fn delete_all(&self) -> StoreResult<()> {
        let mut guard = self.tasks.write().await;
        guard.clear();
        self.persist(&guard).await
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

/// [`RunnerStore`] persisted to a single JSON file.
pub struct JsonFileRunnerStore {
    path: PathBuf,
    runners: RwLock<HashMap<String, Runner>>,
}

impl JsonFileRunnerStore {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc: RunnerDocument = read_document(&path).await?;
        let runners = doc
            .runners
            .into_iter()
            .map(|r| (r.runner_id.clone(), r))
            .collect();
        Ok(Self {
            path,
            runners: RwLock::new(runners),
        })
    }

    async fn persist(&self, snapshot: &HashMap<String, Runner>) -> StoreResult<()> {
        let runners = snapshot.values().cloned().collect();
        write_document(&self.path, &RunnerDocument { runners }).await
    }
}

#[async_trait]
impl RunnerStore for JsonFileRunnerStore {
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
        let mut guard = self.runners.write().await;
        guard.insert(runner.runner_id.clone(), runner.clone());
        self.persist(&guard).await
    }

    async fn delete_all(&self) -> StoreResult<()> {
        let mut guard = self.runners.write().await;
        guard.clear();
        self.persist(&guard).await
    }
}

/// Append-only [`UsageLog`] as one JSON object per line.
pub struct JsonlUsageLog {
    path: PathBuf,
    write_lock: RwLock<()>,
}

impl JsonlUsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: RwLock::new(()),
        }
    }
}

#[async_trait]
impl UsageLog for JsonlUsageLog {
    async fn append(&self, event: &UsageEvent) -> StoreResult<()> {
        let _guard = self.write_lock.write().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut line = serde_json::to_string(event)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<UsageEvent>> {
        let _guard = self.write_lock.read().await;
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(err)),
        };
        let mut events: Vec<UsageEvent> = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Tolerate torn trailing lines from a crashed writer.
            if let Ok(event) = serde_json::from_str(line) {
                events.push(event);
            }
        }
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::{TaskContext, TaskKind};

    fn task(id: &str) -> Task {
        Task {
            id: id.to_owned(),
            direction: "persist me".to_owned(),
            task_type: TaskKind::Impl,
            status: TaskStatus::Pending,
            model: "openrouter/free".to_owned(),
            command: "aider".to_owned(),
            tier: "openrouter".to_owned(),
            output: None,
            context: TaskContext::new(),
            progress_pct: None,
            current_step: None,
            decision_prompt: None,
            decision: None,
            target_state: None,
            success_evidence: None,
            abort_evidence: None,
            observation_window_sec: None,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");

        {
            let store = JsonFileTaskStore::open(&path).await.unwrap();
            store.upsert(&task("task_1")).await.unwrap();
            store.upsert(&task("task_2")).await.unwrap();
        }

        let reopened = JsonFileTaskStore::open(&path).await.unwrap();
        let got = reopened.get("task_1").await.unwrap();
        assert!(got.is_some(), "task_1 should survive a restart");
        let (_, total) = reopened.list(&TaskFilter::default()).await.unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileTaskStore::open(dir.path().join("absent.json"))
            .await
            .unwrap();
        let (items, total) = store.list(&TaskFilter::default()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_schema_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = JsonFileTaskStore::open(&path).await.err().expect("should fail");
        assert!(matches!(err, StoreError::Schema(_)));
    }

    #[tokio::test]
    async fn jsonl_usage_log_appends_and_reads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = JsonlUsageLog::new(dir.path().join("usage.jsonl"));
        for i in 0..3 {
            let event = UsageEvent {
                event_id: format!("evt_{i}"),
                source: "worker".to_owned(),
                endpoint: "tool:codex.exec".to_owned(),
                method: "RUN".to_owned(),
                status_code: 200,
                runtime_ms: 5.0,
                runtime_cost_usd: 0.00001,
                metadata: Default::default(),
                recorded_at: Utc::now(),
            };
            log.append(&event).await.unwrap();
        }
        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].event_id, "evt_2");
    }

    #[tokio::test]
    async fn runner_store_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("runners.json");
        let now = Utc::now();
        let runner = Runner {
            runner_id: "runner-1".to_owned(),
            status: crate::models::RunnerStatus::Idle,
            host: "host-a".to_owned(),
            pid: Some(4242),
            version: "0.1.0".to_owned(),
            active_task_id: String::new(),
            active_run_id: String::new(),
            last_error: String::new(),
            metadata: Default::default(),
            lease_expires_at: now + chrono::Duration::seconds(90),
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        };

        {
            let store = JsonFileRunnerStore::open(&path).await.unwrap();
            store.upsert(&runner).await.unwrap();
        }

        let reopened = JsonFileRunnerStore::open(&path).await.unwrap();
        let got = reopened.get("runner-1").await.unwrap().expect("runner persisted");
        assert_eq!(got.host, "host-a");
        assert_eq!(got.pid, Some(4242));
    }
}
