//! Usage recorder: append-only telemetry for provider calls.
//!
//! Every provider round-trip emits exactly one event (200 on success, 500 on
//! error) with token counts and, for subprocess runs, a runtime-derived cost.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::warn;

use drover_db::models::UsageEvent;
use drover_db::store::UsageLog;

use crate::clock::{Clock, mint_event_id};
use crate::provider::TokenUsage;

pub const ENDPOINT_OPENROUTER: &str = "tool:openrouter.chat_completion";
pub const ENDPOINT_CODEX: &str = "tool:codex.exec";

const USAGE_JSON_MAX: usize = 2000;
const ERROR_MAX: usize = 800;
const REQUEST_ID_MAX: usize = 200;

fn clamp(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// What a single provider call looked like, for the event metadata.
#[derive(Debug, Clone)]
pub struct ToolCall<'a> {
    pub task_id: &'a str,
    pub model: &'a str,
    pub is_paid_provider: bool,
    pub elapsed_ms: u64,
}

/// Builds and appends [`UsageEvent`]s. Failures to record never fail the
/// execution that produced them.
#[derive(Clone)]
pub struct UsageRecorder {
    log: Arc<dyn UsageLog>,
    clock: Arc<dyn Clock>,
    /// USD per wall-clock second for subprocess runs.
    cost_per_second: f64,
}

impl UsageRecorder {
    pub fn new(log: Arc<dyn UsageLog>, clock: Arc<dyn Clock>, cost_per_second: f64) -> Self {
        Self {
            log,
            clock,
            cost_per_second,
        }
    }

    pub fn runtime_cost_usd(&self, elapsed_ms: u64) -> f64 {
        (elapsed_ms as f64 / 1000.0) * self.cost_per_second
    }

    async fn append(&self, endpoint: &str, status_code: i32, call: &ToolCall<'_>, cost: f64, metadata: Map<String, Value>) {
        let event = UsageEvent {
            event_id: mint_event_id(),
            source: "worker".to_owned(),
            endpoint: endpoint.to_owned(),
            method: "RUN".to_owned(),
            status_code,
            runtime_ms: call.elapsed_ms.max(1) as f64,
            runtime_cost_usd: cost,
            metadata,
            recorded_at: self.clock.now(),
        };
        if let Err(err) = self.log.append(&event).await {
            warn!(error = %err, endpoint, "failed to record usage event");
        }
    }

    fn base_metadata(call: &ToolCall<'_>, provider: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("tracking_kind".into(), json!("agent_tool_call"));
        metadata.insert("task_id".into(), json!(call.task_id));
        metadata.insert("model".into(), json!(call.model));
        metadata.insert("provider".into(), json!(provider));
        metadata.insert("is_paid_provider".into(), json!(call.is_paid_provider));
        metadata
    }

    fn usage_metadata(metadata: &mut Map<String, Value>, usage: TokenUsage) {
        metadata.insert("usage_prompt_tokens".into(), json!(usage.prompt_tokens));
        metadata.insert("usage_completion_tokens".into(), json!(usage.completion_tokens));
        metadata.insert("usage_total_tokens".into(), json!(usage.total_tokens));
        metadata.insert(
            "usage_json".into(),
            json!(clamp(&usage.to_json().to_string(), USAGE_JSON_MAX)),
        );
    }

    /// Record a successful chat-completion call.
    pub async fn chat_success(
        &self,
        call: &ToolCall<'_>,
        usage: TokenUsage,
        provider_request_id: &str,
        response_id: &str,
    ) {
        let mut metadata = Self::base_metadata(call, "openrouter");
        Self::usage_metadata(&mut metadata, usage);
        metadata.insert(
            "provider_request_id".into(),
            json!(clamp(provider_request_id, REQUEST_ID_MAX)),
        );
        metadata.insert("response_id".into(), json!(clamp(response_id, REQUEST_ID_MAX)));
        self.append(ENDPOINT_OPENROUTER, 200, call, 0.0, metadata).await;
    }

    /// Record a failed chat-completion call.
    pub async fn chat_failure(&self, call: &ToolCall<'_>, error: &str) {
        let mut metadata = Self::base_metadata(call, "openrouter");
        metadata.insert("error".into(), json!(clamp(error, ERROR_MAX)));
        self.append(ENDPOINT_OPENROUTER, 500, call, 0.0, metadata).await;
    }

    /// Record a successful codex subprocess run; cost derives from runtime.
    pub async fn codex_success(&self, call: &ToolCall<'_>, usage: TokenUsage) -> f64 {
        let cost = self.runtime_cost_usd(call.elapsed_ms);
        let mut metadata = Self::base_metadata(call, "openai-codex");
        metadata.insert("is_openai_codex".into(), json!(true));
        Self::usage_metadata(&mut metadata, usage);
        metadata.insert("runtime_cost_usd".into(), json!((cost * 1e6).round() / 1e6));
        self.append(ENDPOINT_CODEX, 200, call, cost, metadata).await;
        cost
    }

    /// Record that an execution folded into a terminal task status.
    pub async fn task_completion(
        &self,
        task_id: &str,
        task_type: &str,
        model: &str,
        elapsed_ms: u64,
        completed: bool,
    ) {
        let mut metadata = Map::new();
        metadata.insert("tracking_kind".into(), json!("agent_task_completion"));
        metadata.insert("task_id".into(), json!(task_id));
        metadata.insert("task_type".into(), json!(task_type));
        metadata.insert("model".into(), json!(model));
        metadata.insert("duration_seconds".into(), json!(elapsed_ms as f64 / 1000.0));
        metadata.insert(
            "status".into(),
            json!(if completed { "completed" } else { "failed" }),
        );
        let call = ToolCall {
            task_id,
            model,
            is_paid_provider: false,
            elapsed_ms,
        };
        self.append(
            "task:completion",
            if completed { 200 } else { 500 },
            &call,
            0.0,
            metadata,
        )
        .await;
    }

    /// Record a failed codex subprocess run.
    pub async fn codex_failure(&self, call: &ToolCall<'_>, error: &str) {
        let cost = self.runtime_cost_usd(call.elapsed_ms);
        let mut metadata = Self::base_metadata(call, "openai-codex");
        metadata.insert("is_openai_codex".into(), json!(true));
        metadata.insert("error".into(), json!(clamp(error, ERROR_MAX)));
        metadata.insert("runtime_cost_usd".into(), json!((cost * 1e6).round() / 1e6));
        self.append(ENDPOINT_CODEX, 500, call, cost, metadata).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use drover_db::memory::MemoryUsageLog;

    fn recorder(log: Arc<MemoryUsageLog>) -> UsageRecorder {
        UsageRecorder::new(log, Arc::new(SystemClock), 0.002)
    }

    #[tokio::test]
    async fn chat_success_event_shape() {
        let log = Arc::new(MemoryUsageLog::new());
        let rec = recorder(log.clone());
        let call = ToolCall {
            task_id: "task_abc",
            model: "openrouter/free",
            is_paid_provider: false,
            elapsed_ms: 1234,
        };
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        };
        rec.chat_success(&call, usage, "req-1", "resp-1").await;

        let events = log.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.endpoint, ENDPOINT_OPENROUTER);
        assert_eq!(event.method, "RUN");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.runtime_ms, 1234.0);
        assert_eq!(event.metadata["task_id"], "task_abc");
        assert_eq!(event.metadata["usage_total_tokens"], 30);
        assert_eq!(event.metadata["provider_request_id"], "req-1");
    }

    #[tokio::test]
    async fn chat_failure_records_500_and_error() {
        let log = Arc::new(MemoryUsageLog::new());
        let rec = recorder(log.clone());
        let call = ToolCall {
            task_id: "task_abc",
            model: "openrouter/free",
            is_paid_provider: false,
            elapsed_ms: 10,
        };
        rec.chat_failure(&call, "boom").await;
        let events = log.recent(10).await.unwrap();
        assert_eq!(events[0].status_code, 500);
        assert_eq!(events[0].metadata["error"], "boom");
    }

    #[tokio::test]
    async fn codex_cost_follows_runtime() {
        let log = Arc::new(MemoryUsageLog::new());
        let rec = recorder(log.clone());
        let call = ToolCall {
            task_id: "task_abc",
            model: "openclaw/gpt-5.1-codex",
            is_paid_provider: true,
            elapsed_ms: 5000,
        };
        let cost = rec.codex_success(&call, TokenUsage::default()).await;
        assert!((cost - 0.01).abs() < 1e-9);
        let events = log.recent(10).await.unwrap();
        assert_eq!(events[0].endpoint, ENDPOINT_CODEX);
        assert_eq!(events[0].runtime_cost_usd, cost);
    }
}
