//! Execution adapter: one provider round-trip per call.
//!
//! The adapter never raises into the controller; every path folds into a
//! discriminated [`ExecOutcome`]. The primary path is the chat-completion
//! client; the codex subprocess runs only for Codex-family models failing on
//! a missing OpenRouter key.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::codex::{CodexRunner, should_fallback_to_codex, underlying_model};
use crate::provider::{ChatApi, TokenUsage};
use crate::usage::{ToolCall, UsageRecorder};

/// Optional spend ceiling for a single execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostBudget {
    pub max_cost_usd: Option<f64>,
    pub estimated_cost_usd: Option<f64>,
    pub cost_slack_ratio: Option<f64>,
}

impl CostBudget {
    /// True when an observed cost breaks the ceiling (with slack applied).
    pub fn exceeded_by(&self, actual_cost_usd: f64) -> bool {
        self.max_cost_usd.is_some_and(|max| {
            let allowance = max * (1.0 + self.cost_slack_ratio.unwrap_or(0.0).max(0.0));
            actual_cost_usd > allowance
        })
    }
}

/// Discriminated result of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Success {
        elapsed_ms: u64,
        content: String,
        usage: TokenUsage,
        provider_request_id: String,
        actual_cost_usd: Option<f64>,
    },
    Failure {
        elapsed_ms: u64,
        error: String,
    },
}

impl ExecOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            Self::Success { elapsed_ms, .. } | Self::Failure { elapsed_ms, .. } => *elapsed_ms,
        }
    }
}

/// Dispatches a prompt to the provider for a model and records usage.
#[derive(Clone)]
pub struct ExecutionAdapter {
    chat: Arc<dyn ChatApi>,
    codex: Arc<dyn CodexRunner>,
    usage: UsageRecorder,
}

impl ExecutionAdapter {
    pub fn new(chat: Arc<dyn ChatApi>, codex: Arc<dyn CodexRunner>, usage: UsageRecorder) -> Self {
        Self { chat, codex, usage }
    }

    /// Run `prompt` against the provider behind `model` (a stored task model,
    /// possibly executor-prefixed). Exactly one usage event is emitted per
    /// provider call made.
    pub async fn run(
        &self,
        task_id: &str,
        model: &str,
        prompt: &str,
        route_is_paid: bool,
        budget: CostBudget,
    ) -> ExecOutcome {
        let started = Instant::now();
        let chat_model = underlying_model(model);

        match self.chat.chat_completion(&chat_model, prompt).await {
            Ok(completion) => {
                let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
                let call = ToolCall {
                    task_id,
                    model: &chat_model,
                    is_paid_provider: route_is_paid,
                    elapsed_ms,
                };
                self.usage
                    .chat_success(
                        &call,
                        completion.usage,
                        &completion.provider_request_id,
                        &completion.response_id,
                    )
                    .await;
                info!(task_id, model = %chat_model, elapsed_ms, "chat completion ok");
                ExecOutcome::Success {
                    elapsed_ms,
                    content: completion.content,
                    usage: completion.usage,
                    provider_request_id: completion.provider_request_id,
                    actual_cost_usd: None,
                }
            }
            Err(err) => {
                let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
                let error = err.to_string();
                let call = ToolCall {
                    task_id,
                    model: &chat_model,
                    is_paid_provider: route_is_paid,
                    elapsed_ms,
                };
                self.usage.chat_failure(&call, &error).await;

                if should_fallback_to_codex(model, &error) {
                    return self
                        .run_codex(task_id, model, prompt, route_is_paid, budget, started)
                        .await;
                }

                warn!(task_id, model = %chat_model, error = %error, "chat completion failed");
                ExecOutcome::Failure {
                    elapsed_ms,
                    error: format!("Execution failed (OpenRouter): {error}"),
                }
            }
        }
    }

    async fn run_codex(
        &self,
        task_id: &str,
        model: &str,
        prompt: &str,
        route_is_paid: bool,
        budget: CostBudget,
        started: Instant,
    ) -> ExecOutcome {
        match self.codex.exec(model, prompt).await {
            Ok(output) => {
                let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
                let call = ToolCall {
                    task_id,
                    model,
                    is_paid_provider: route_is_paid,
                    elapsed_ms,
                };
                let actual_cost_usd = self.usage.codex_success(&call, output.usage).await;

                if budget.exceeded_by(actual_cost_usd) {
                    let max = budget.max_cost_usd.unwrap_or(0.0);
                    warn!(task_id, actual_cost_usd, max_cost_usd = max, "codex cost overrun");
                    return ExecOutcome::Failure {
                        elapsed_ms,
                        error: format!(
                            "Execution failed (Codex): cost overrun: \
                             actual ${actual_cost_usd:.4} exceeds max_cost_usd ${max:.4}"
                        ),
                    };
                }

                info!(task_id, model, elapsed_ms, "codex exec ok");
                ExecOutcome::Success {
                    elapsed_ms,
                    content: output.content,
                    usage: output.usage,
                    provider_request_id: String::new(),
                    actual_cost_usd: Some(actual_cost_usd),
                }
            }
            Err(err) => {
                let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
                let call = ToolCall {
                    task_id,
                    model,
                    is_paid_provider: route_is_paid,
                    elapsed_ms,
                };
                let error = format!("Execution failed (Codex): {err}");
                self.usage.codex_failure(&call, &error).await;
                warn!(task_id, model, error = %error, "codex exec failed");
                ExecOutcome::Failure { elapsed_ms, error }
            }
        }
    }
}
