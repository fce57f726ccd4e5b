//! Runner registry: heartbeat upserts and online classification.
//!
//! Runners are pull-based workers. A heartbeat refreshes the lease
//! (`lease_expires_at = now + lease_seconds`); a runner is online iff
//! `now < lease_expires_at`. Staleness is computed on read; nothing ever
//! writes an expiry back.

use std::sync::Arc;

use chrono::Duration;
use serde_json::{Map, Value, json};

use drover_db::models::{Runner, RunnerStatus};
use drover_db::store::RunnerStore;

use crate::clock::Clock;
use crate::lifecycle::CoreError;

const LEASE_DEFAULT_SECS: i64 = 90;
const LEASE_MIN_SECS: i64 = 10;
const LEASE_MAX_SECS: i64 = 3600;
const ID_MAX: usize = 200;
const LAST_ERROR_MAX: usize = 2000;

fn clamp(text: &str, limit: usize) -> String {
    text.trim().chars().take(limit).collect()
}

/// One heartbeat from a worker runner.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatRequest {
    pub runner_id: String,
    pub status: String,
    pub lease_seconds: Option<i64>,
    pub host: Option<String>,
    pub pid: Option<i64>,
    pub version: Option<String>,
    pub active_task_id: Option<String>,
    pub active_run_id: Option<String>,
    pub last_error: Option<String>,
    pub capabilities: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
}

/// Registry service over a [`RunnerStore`] backend.
#[derive(Clone)]
pub struct RunnerRegistry {
    store: Arc<dyn RunnerStore>,
    clock: Arc<dyn Clock>,
}

impl RunnerRegistry {
    pub fn new(store: Arc<dyn RunnerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Upsert a runner from a heartbeat and refresh its lease.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<Runner, CoreError> {
        let runner_id = clamp(&req.runner_id, ID_MAX);
        if runner_id.is_empty() {
            return Err(CoreError::invalid("runner_id is required"));
        }

        let lease_seconds = req
            .lease_seconds
            .unwrap_or(LEASE_DEFAULT_SECS)
            .clamp(LEASE_MIN_SECS, LEASE_MAX_SECS);
        let now = self.clock.now();

        let mut metadata = req.metadata.clone().unwrap_or_default();
        if let Some(capabilities) = req.capabilities.as_ref().filter(|c| !c.is_empty()) {
            metadata.insert("capabilities".into(), json!(capabilities));
        }

        let existing = self.store.get(&runner_id).await?;
        let created_at = existing.as_ref().map(|r| r.created_at).unwrap_or(now);

        let runner = Runner {
            runner_id,
            status: RunnerStatus::normalize(&req.status),
            host: clamp(req.host.as_deref().unwrap_or(""), ID_MAX),
            pid: req.pid.filter(|p| *p > 0),
            version: clamp(req.version.as_deref().unwrap_or(""), ID_MAX),
            active_task_id: clamp(req.active_task_id.as_deref().unwrap_or(""), ID_MAX),
            active_run_id: clamp(req.active_run_id.as_deref().unwrap_or(""), ID_MAX),
            last_error: clamp(req.last_error.as_deref().unwrap_or(""), LAST_ERROR_MAX),
            metadata,
            lease_expires_at: now + Duration::seconds(lease_seconds),
            last_seen_at: now,
            created_at,
            updated_at: now,
        };

        self.store.upsert(&runner).await?;
        Ok(runner)
    }

    /// List runners, newest heartbeat first. Stale runners are filtered out
    /// unless `include_stale`.
    pub async fn list(&self, include_stale: bool, limit: usize) -> Result<Vec<Runner>, CoreError> {
        let limit = limit.clamp(1, 500);
        // Over-fetch so the online filter does not starve the page.
        let mut runners = self.store.list(limit * 3).await?;
        if !include_stale {
            let now = self.clock.now();
            runners.retain(|r| r.online(now));
        }
        runners.truncate(limit);
        Ok(runners)
    }

    pub async fn get(&self, runner_id: &str) -> Result<Option<Runner>, CoreError> {
        Ok(self.store.get(runner_id).await?)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
