//! Retry policy: pure planning over a failed execution result.
//!
//! The controller applies the returned context patch and, when a retry is
//! granted, re-enqueues the task and re-enters execution with an incremented
//! depth counter. `retry_count` is cumulative for the life of the task.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use drover_db::models::{Task, TaskContext};

const RETRY_MAX_DEFAULT: u32 = 1;
const RETRY_MAX_CAP: u32 = 5;
const FAILURE_OUTPUT_MAX: usize = 1200;
const RETRY_HINT_MAX: usize = 900;
const FAILURE_EXCERPT_MAX: usize = 260;
const OPENAI_RETRY_MODEL_DEFAULT: &str = "gpt-5.3-codex";
const SPARK_MODEL_SUFFIX: &str = "gpt-5.3-codex-spark";
const SPARK_FALLBACK_MODEL: &str = "gpt-5.3-codex";

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Coarse failure classification stored as `context.failure_reason_bucket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBucket {
    Timeout,
    PaidProviderBlocked,
    EmptyOutput,
    Other,
}

impl FailureBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::PaidProviderBlocked => "paid_provider_blocked",
            Self::EmptyOutput => "empty_output",
            Self::Other => "other",
        }
    }

    /// Classify a failure from its output/error text.
    pub fn classify(output: &str) -> Self {
        let lower = output.trim().to_ascii_lowercase();
        if lower.is_empty() {
            Self::EmptyOutput
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("paid provider")
            || lower.contains("paid-provider")
            || lower.contains("paid_provider")
        {
            Self::PaidProviderBlocked
        } else {
            Self::Other
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Escalation applied to a granted retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEscalation {
    pub model_override: String,
    /// Which rule granted the escalation, recorded in context.
    pub source: &'static str,
}

/// A granted retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExecution {
    /// The retry attempt number (1-based).
    pub attempt: u32,
    pub retry_max: u32,
    pub force_paid_providers: bool,
}

/// Output of [`plan_retry`]: bookkeeping to persist, plus whether to go again.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub context_patch: Map<String, Value>,
    pub retry: Option<RetryExecution>,
}

/// Inputs the policy needs beyond the task itself.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Environment-level retry budget (`context.retry_max` wins).
    pub env_retry_max: Option<u32>,
    /// Paid-provider failures may escalate to a paid Codex retry.
    pub auto_retry_openai_override: bool,
    /// Escalation model for the override path.
    pub openai_model_override: Option<String>,
}

impl RetryPolicy {
    /// Resolve the effective retry budget: task context, then env, then the
    /// default of 1, capped at 5.
    pub fn resolve_retry_max(&self, context: &TaskContext) -> u32 {
        context
            .retry_max()
            .or(self.env_retry_max)
            .map(|v| v.clamp(1, RETRY_MAX_CAP))
            .unwrap_or(RETRY_MAX_DEFAULT)
    }

    fn escalation_model(&self, context: &TaskContext) -> String {
        context
            .get_str("openai_retry_model_override")
            .or_else(|| context.get_str("retry_model_override"))
            .map(str::to_owned)
            .or_else(|| self.openai_model_override.clone())
            .or_else(|| context.model_override().map(str::to_owned))
            .unwrap_or_else(|| OPENAI_RETRY_MODEL_DEFAULT.to_owned())
    }

    fn auto_override_enabled(&self, context: &TaskContext) -> bool {
        if context.get("auto_retry_openai_override").is_some() {
            context.get_truthy("auto_retry_openai_override")
        } else {
            self.auto_retry_openai_override
        }
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= limit {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(limit.saturating_sub(1)).collect();
    format!("{}...", truncated.trim_end())
}

fn clamp_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Category-aware guidance derived from the failure text.
fn retry_hint(failure_output: &str, attempt: u32) -> String {
    let lower = failure_output.to_ascii_lowercase();
    let guidance = if lower.contains("paid provider") {
        "Switch to an allowed/free provider route or run with explicit paid-provider \
         override when policy permits."
    } else if lower.contains("window budget") || lower.contains("usage blocked") {
        "Use a cheaper route, wait for budget window reset, or reduce paid-provider \
         usage before retrying."
    } else if lower.contains("execution budget exceeded") || lower.contains("cost overrun") {
        "Reduce scope/output size or raise max_cost_usd so execution stays within budget."
    } else if lower.contains("empty direction") {
        "Provide a concrete non-empty direction with an explicit goal and expected output."
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Narrow the task scope and prioritize one concrete fix for this retry."
    } else if lower.contains("claim_failed") {
        "Ensure no other worker owns the task lease before retrying."
    } else {
        "Find the root cause, make the smallest fix that addresses it, and verify with \
         a focused check."
    };
    clamp_chars(
        &format!(
            "Retry attempt {attempt}: previous failure was '{}'. Hint: {guidance}",
            excerpt(failure_output, FAILURE_EXCERPT_MAX)
        ),
        RETRY_HINT_MAX,
    )
}

fn is_paid_provider_failure(failure_output: &str, result_error: &str) -> bool {
    let lower_output = failure_output.to_ascii_lowercase();
    if ["paid provider", "paid-provider", "paid_provider"]
        .iter()
        .any(|marker| lower_output.contains(marker))
    {
        return true;
    }
    result_error.trim().eq_ignore_ascii_case("paid_provider_blocked")
}

fn is_spark_model(model: &str) -> bool {
    let normalized = model.trim().to_ascii_lowercase();
    normalized == SPARK_MODEL_SUFFIX || normalized.ends_with(&format!("/{SPARK_MODEL_SUFFIX}"))
}

/// Plan the response to a failed execution.
///
/// Always records failure bookkeeping (`failure_hits`, `last_failure_output`,
/// `last_failure_at`, `retry_max`). Grants a retry only while both the task's
/// cumulative `retry_count` and the caller's recursion depth sit below the
/// budget.
pub fn plan_retry(
    policy: &RetryPolicy,
    task: &Task,
    result_error: &str,
    retry_depth: u32,
    now: DateTime<Utc>,
) -> RetryPlan {
    let context = &task.context;
    let retry_max = policy.resolve_retry_max(context);
    let retry_count = context.retry_count();

    let failure_output = {
        let from_output = task.output.as_deref().map(str::trim).unwrap_or("");
        if !from_output.is_empty() {
            from_output.to_owned()
        } else if !result_error.trim().is_empty() {
            result_error.trim().to_owned()
        } else {
            "task_failed".to_owned()
        }
    };

    let mut patch = Map::new();
    patch.insert("failure_hits".into(), json!(context.failure_hits() + 1));
    patch.insert(
        "last_failure_output".into(),
        json!(clamp_chars(&failure_output, FAILURE_OUTPUT_MAX)),
    );
    patch.insert("last_failure_at".into(), json!(now.to_rfc3339()));
    patch.insert("retry_max".into(), json!(retry_max));

    if retry_count >= retry_max || retry_depth >= retry_max {
        return RetryPlan {
            context_patch: patch,
            retry: None,
        };
    }

    let attempt = retry_count + 1;
    patch.insert("retry_count".into(), json!(attempt));
    patch.insert("retry_hint".into(), json!(retry_hint(&failure_output, attempt)));
    patch.insert("retry_requested_at".into(), json!(now.to_rfc3339()));
    patch.insert("last_retry_source".into(), json!("auto_failure_recovery"));

    let mut force_paid = false;
    if policy.auto_override_enabled(context)
        && is_paid_provider_failure(&failure_output, result_error)
    {
        force_paid = true;
        patch.insert("force_paid_providers".into(), json!(true));
        patch.insert(
            "force_paid_override_source".into(),
            json!("auto_retry_openai_override"),
        );
        patch.insert("retry_paid_override_applied".into(), json!(true));
        patch.insert("model_override".into(), json!(policy.escalation_model(context)));
        patch.insert("executor".into(), json!("openclaw"));
    } else if is_spark_model(&task.model) && retry_count == 0 {
        // First failure on the spark model: fall back to the full Codex model.
        force_paid = true;
        patch.insert("force_paid_providers".into(), json!(true));
        patch.insert("retry_paid_override_applied".into(), json!(true));
        patch.insert("model_override".into(), json!(SPARK_FALLBACK_MODEL));
        patch.insert("executor".into(), json!("openclaw"));
        patch.insert("spark_fallback_retry_applied".into(), json!(true));
    }

    RetryPlan {
        context_patch: patch,
        retry: Some(RetryExecution {
            attempt,
            retry_max,
            force_paid_providers: force_paid,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_db::models::{TaskKind, TaskStatus};

    fn failed_task(output: &str, context: TaskContext) -> Task {
        Task {
            id: "task_1234567890abcdef".to_owned(),
            direction: "do the thing".to_owned(),
            task_type: TaskKind::Impl,
            status: TaskStatus::Failed,
            model: "openrouter/free".to_owned(),
            command: "aider".to_owned(),
            tier: "openrouter".to_owned(),
            output: Some(output.to_owned()),
            context,
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

    #[test]
    fn bucket_classification() {
        assert_eq!(FailureBucket::classify("request timed out"), FailureBucket::Timeout);
        assert_eq!(
            FailureBucket::classify("Blocked: task routes to a paid provider"),
            FailureBucket::PaidProviderBlocked
        );
        assert_eq!(FailureBucket::classify("   "), FailureBucket::EmptyOutput);
        assert_eq!(FailureBucket::classify("segfault"), FailureBucket::Other);
    }

    #[test]
    fn grants_one_retry_by_default() {
        let policy = RetryPolicy::default();
        let task = failed_task("it broke", TaskContext::new());
        let plan = plan_retry(&policy, &task, "", 0, Utc::now());
        let retry = plan.retry.expect("first failure should retry");
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.retry_max, 1);
        assert!(!retry.force_paid_providers);
        assert_eq!(plan.context_patch.get("retry_count"), Some(&json!(1)));
    }

    #[test]
    fn exhausted_budget_stops() {
        let policy = RetryPolicy::default();
        let mut ctx = TaskContext::new();
        ctx.set("retry_count", 1);
        let task = failed_task("it broke again", ctx);
        let plan = plan_retry(&policy, &task, "", 0, Utc::now());
        assert!(plan.retry.is_none());
        // Bookkeeping still recorded.
        assert_eq!(plan.context_patch.get("failure_hits"), Some(&json!(1)));
        assert!(plan.context_patch.contains_key("last_failure_output"));
    }

    #[test]
    fn depth_guard_stops_recursion() {
        let policy = RetryPolicy::default();
        let task = failed_task("boom", TaskContext::new());
        let plan = plan_retry(&policy, &task, "", 1, Utc::now());
        assert!(plan.retry.is_none());
    }

    #[test]
    fn retry_max_from_context_is_capped() {
        let policy = RetryPolicy::default();
        let mut ctx = TaskContext::new();
        ctx.set("retry_max", 99);
        assert_eq!(policy.resolve_retry_max(&ctx), 5);
        let mut ctx = TaskContext::new();
        ctx.set("retry_max", 3);
        assert_eq!(policy.resolve_retry_max(&ctx), 3);
    }

    #[test]
    fn hint_mentions_category() {
        let hint = retry_hint("provider timed out after 30s", 1);
        assert!(hint.starts_with("Retry attempt 1"));
        assert!(hint.contains("Narrow the task scope"));

        let hint = retry_hint("cost overrun: $4 > $1", 2);
        assert!(hint.contains("max_cost_usd"));
    }

    #[test]
    fn paid_block_with_override_escalates() {
        let policy = RetryPolicy {
            auto_retry_openai_override: true,
            ..RetryPolicy::default()
        };
        let task = failed_task(
            "Blocked: task routes to a paid provider and AGENT_ALLOW_PAID_PROVIDERS is disabled.",
            TaskContext::new(),
        );
        let plan = plan_retry(&policy, &task, "paid_provider_blocked", 0, Utc::now());
        let retry = plan.retry.expect("should retry");
        assert!(retry.force_paid_providers);
        assert_eq!(
            plan.context_patch.get("model_override"),
            Some(&json!("gpt-5.3-codex"))
        );
        assert_eq!(plan.context_patch.get("executor"), Some(&json!("openclaw")));
    }

    #[test]
    fn paid_block_without_override_stays_cheap() {
        let policy = RetryPolicy::default();
        let task = failed_task("paid provider blocked", TaskContext::new());
        let plan = plan_retry(&policy, &task, "paid_provider_blocked", 0, Utc::now());
        let retry = plan.retry.expect("should retry");
        assert!(!retry.force_paid_providers);
        assert!(!plan.context_patch.contains_key("model_override"));
    }

    #[test]
    fn spark_model_first_retry_falls_back() {
        let policy = RetryPolicy::default();
        let mut task = failed_task("no output produced", TaskContext::new());
        task.model = "openclaw/gpt-5.3-codex-spark".to_owned();
        let plan = plan_retry(&policy, &task, "", 0, Utc::now());
        let retry = plan.retry.expect("should retry");
        assert!(retry.force_paid_providers);
        assert_eq!(
            plan.context_patch.get("model_override"),
            Some(&json!("gpt-5.3-codex"))
        );
        assert_eq!(
            plan.context_patch.get("spark_fallback_retry_applied"),
            Some(&json!(true))
        );
    }

    #[test]
    fn excerpt_collapses_whitespace() {
        let text = "line one\n\n   line two\t\tend";
        assert_eq!(excerpt(text, 260), "line one line two end");
        let long = "x".repeat(400);
        let cut = excerpt(&long, 260);
        assert!(cut.chars().count() <= 262);
        assert!(cut.ends_with("..."));
    }
}
