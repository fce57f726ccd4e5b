use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NeedsDecision,
}

impl TaskStatus {
    /// Terminal states plus `needs_decision` are the attention set surfaced
    /// to operators.
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::Failed | Self::NeedsDecision)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsDecision => "needs_decision",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "needs_decision" => Ok(Self::NeedsDecision),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of work a task represents; drives routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Spec,
    Test,
    Impl,
    Review,
    Heal,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spec => "spec",
            Self::Test => "test",
            Self::Impl => "impl",
            Self::Review => "review",
            Self::Heal => "heal",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec" => Ok(Self::Spec),
            "test" => Ok(Self::Test),
            "impl" => Ok(Self::Impl),
            "review" => Ok(Self::Review),
            "heal" => Ok(Self::Heal),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Reported status of a worker runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Running,
    Offline,
    Degraded,
}

impl RunnerStatus {
    /// Normalize a free-form status string; unrecognized values collapse to
    /// `idle` (the registry never rejects a heartbeat over a status typo).
    pub fn normalize(raw: &str) -> Self {
        raw.trim().to_ascii_lowercase().parse().unwrap_or(Self::Idle)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

impl FromStr for RunnerStatus {
    type Err = RunnerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "offline" => Ok(Self::Offline),
            "degraded" => Ok(Self::Degraded),
            other => Err(RunnerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunnerStatus`] string.
#[derive(Debug, Clone)]
pub struct RunnerStatusParseError(pub String);

impl fmt::Display for RunnerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid runner status: {:?}", self.0)
    }
}

impl std::error::Error for RunnerStatusParseError {}

// ---------------------------------------------------------------------------
// Task context
// ---------------------------------------------------------------------------

/// Free-form string→JSON context carried by every task.
///
/// Most keys pass through untouched (task-card fields, worker metadata,
/// routing snapshots). The keys the lifecycle controller itself reads get
/// typed accessors here so the rest of the core never string-types against
/// the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskContext(pub Map<String, Value>);

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow-merge `patch` into this context; patch keys win.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Read a string value, trimmed; absent, non-string, or blank → `None`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Truthy check matching the operator conventions: `true`, non-zero
    /// numbers, and the strings `1`/`true`/`yes`/`on` count as set.
    pub fn get_truthy(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
            }
            _ => false,
        }
    }

    /// Read a non-negative integer from an int, float, or digit string.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.0.get(key)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    u32::try_from(i).ok()
                } else {
                    n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u32)
                }
            }
            Value::String(s) => {
                let t = s.trim();
                if !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()) {
                    t.parse().ok()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    // Keys the controller and retry policy depend on.

    pub fn retry_count(&self) -> u32 {
        self.get_u32("retry_count").unwrap_or(0)
    }

    pub fn retry_max(&self) -> Option<u32> {
        self.get_u32("retry_max").or_else(|| self.get_u32("max_retries"))
    }

    pub fn failure_hits(&self) -> u32 {
        self.get_u32("failure_hits").unwrap_or(0)
    }

    pub fn session_key(&self) -> Option<&str> {
        self.get_str("session_key")
    }

    pub fn executor(&self) -> Option<&str> {
        self.get_str("executor")
    }

    pub fn model_override(&self) -> Option<&str> {
        self.get_str("model_override")
    }

    pub fn error(&self) -> Option<&str> {
        self.get_str("error")
    }

    pub fn question_scope(&self) -> Option<&str> {
        self.get_str("question_scope").or_else(|| self.get_str("scope"))
    }

    pub fn force_paid_providers(&self) -> bool {
        self.get_truthy("force_paid_providers")
    }

    /// The route decision snapshot stored at creation time.
    pub fn route_is_paid(&self) -> bool {
        self.0
            .get("route_decision")
            .and_then(Value::as_object)
            .and_then(|r| r.get("is_paid_provider"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task: one unit of agent work with a direction, a resolved route, and a
/// lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub direction: String,
    pub task_type: TaskKind,
    pub status: TaskStatus,
    /// Route snapshot: resolved model, concrete command, billing tier.
    pub model: String,
    pub command: String,
    pub tier: String,
    pub output: Option<String>,
    #[serde(default)]
    pub context: TaskContext,
    pub progress_pct: Option<i32>,
    pub current_step: Option<String>,
    pub decision_prompt: Option<String>,
    pub decision: Option<String>,
    pub target_state: Option<String>,
    pub success_evidence: Option<Vec<String>>,
    pub abort_evidence: Option<Vec<String>>,
    pub observation_window_sec: Option<i64>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A worker runner known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub runner_id: String,
    pub status: RunnerStatus,
    pub host: String,
    pub pid: Option<i64>,
    pub version: String,
    pub active_task_id: String,
    pub active_run_id: String,
    pub last_error: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub lease_expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Runner {
    /// Online iff the lease has not expired. Staleness is computed on read;
    /// nothing writes an expiry back.
    pub fn online(&self, now: DateTime<Utc>) -> bool {
        now < self.lease_expires_at
    }
}

/// One append-only usage record for a provider call or task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: String,
    pub source: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub runtime_ms: f64,
    pub runtime_cost_usd: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::NeedsDecision,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_serde_uses_snake_case() {
        let v = serde_json::to_value(TaskStatus::NeedsDecision).unwrap();
        assert_eq!(v, json!("needs_decision"));
    }

    #[test]
    fn task_kind_display_roundtrip() {
        let variants = [
            TaskKind::Spec,
            TaskKind::Test,
            TaskKind::Impl,
            TaskKind::Review,
            TaskKind::Heal,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_kind_invalid() {
        assert!("deploy".parse::<TaskKind>().is_err());
    }

    #[test]
    fn runner_status_normalize_unknown_is_idle() {
        assert_eq!(RunnerStatus::normalize("RUNNING"), RunnerStatus::Running);
        assert_eq!(RunnerStatus::normalize("rebooting"), RunnerStatus::Idle);
        assert_eq!(RunnerStatus::normalize(""), RunnerStatus::Idle);
    }

    #[test]
    fn context_truthy_semantics() {
        let mut ctx = TaskContext::new();
        ctx.set("a", true);
        ctx.set("b", "yes");
        ctx.set("c", 1);
        ctx.set("d", "off");
        ctx.set("e", 0);
        assert!(ctx.get_truthy("a"));
        assert!(ctx.get_truthy("b"));
        assert!(ctx.get_truthy("c"));
        assert!(!ctx.get_truthy("d"));
        assert!(!ctx.get_truthy("e"));
        assert!(!ctx.get_truthy("missing"));
    }

    #[test]
    fn context_u32_accepts_digit_strings() {
        let mut ctx = TaskContext::new();
        ctx.set("retry_count", "3");
        ctx.set("retry_max", 2);
        ctx.set("bad", "three");
        assert_eq!(ctx.retry_count(), 3);
        assert_eq!(ctx.retry_max(), Some(2));
        assert_eq!(ctx.get_u32("bad"), None);
    }

    #[test]
    fn context_merge_patch_wins() {
        let mut ctx = TaskContext::new();
        ctx.set("keep", "old");
        ctx.set("replace", "old");
        let mut patch = Map::new();
        patch.insert("replace".into(), json!("new"));
        patch.insert("added".into(), json!(42));
        ctx.merge(&patch);
        assert_eq!(ctx.get_str("keep"), Some("old"));
        assert_eq!(ctx.get_str("replace"), Some("new"));
        assert_eq!(ctx.get_u32("added"), Some(42));
    }

    #[test]
    fn context_route_is_paid_reads_snapshot() {
        let mut ctx = TaskContext::new();
        assert!(!ctx.route_is_paid());
        ctx.set("route_decision", json!({"is_paid_provider": true}));
        assert!(ctx.route_is_paid());
    }
}
