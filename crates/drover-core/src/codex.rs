//! Codex CLI subprocess fallback.
//!
//! Invoked only when the route resolves to a Codex-family model and the
//! primary provider reports a missing API key. The CLI writes the final
//! answer to a temp file and streams JSONL events on stdout; the
//! `turn.completed` event carries token usage.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::provider::TokenUsage;

const EXEC_DEADLINE: Duration = Duration::from_secs(300);
const DEFAULT_UNDERLYING_MODEL: &str = "gpt-5.3-codex-spark";

/// Outcome of one `codex exec` run.
#[derive(Debug, Clone)]
pub struct CodexOutput {
    pub content: String,
    pub usage: TokenUsage,
}

/// Seam for the subprocess fallback so tests can script it.
#[async_trait]
pub trait CodexRunner: Send + Sync {
    async fn exec(&self, model: &str, prompt: &str) -> anyhow::Result<CodexOutput>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn CodexRunner) {}
};

/// Strip the executor prefix from a stored model name.
pub fn underlying_model(task_model: &str) -> String {
    let cleaned = task_model.trim();
    for prefix in ["openclaw/", "clawwork/", "cursor/"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            return rest.trim().to_owned();
        }
    }
    cleaned.to_owned()
}

/// The fallback fires only for Codex-family models failing on a missing
/// OpenRouter key.
pub fn should_fallback_to_codex(model: &str, error: &str) -> bool {
    let underlying = underlying_model(model).to_ascii_lowercase();
    underlying.contains("codex") && error.contains("OPENROUTER_API_KEY is not configured")
}

/// Parse `codex exec --json` stdout for the `turn.completed` usage record.
pub fn usage_from_jsonl(stdout: &str) -> TokenUsage {
    for raw_line in stdout.lines() {
        let line = raw_line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if payload.get("type").and_then(Value::as_str) != Some("turn.completed") {
            continue;
        }
        if let Some(usage) = payload.get("usage") {
            return TokenUsage::from_json(usage);
        }
        return TokenUsage::default();
    }
    TokenUsage::default()
}

/// Production runner that shells out to the `codex` binary.
#[derive(Debug, Clone, Default)]
pub struct CodexCli {
    /// Path to the `codex` binary; defaults to `$PATH` lookup.
    binary: Option<String>,
}

impl CodexCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: Some(path.into()),
        }
    }
}

#[async_trait]
impl CodexRunner for CodexCli {
    async fn exec(&self, model: &str, prompt: &str) -> anyhow::Result<CodexOutput> {
        let resolved_model = {
            let m = underlying_model(model);
            if m.is_empty() {
                DEFAULT_UNDERLYING_MODEL.to_owned()
            } else {
                m
            }
        };

        // The CLI writes the final message here; keep the handle so the file
        // is removed even when the read fails.
        let out_file = tempfile::Builder::new()
            .prefix("codex_exec_")
            .suffix(".txt")
            .tempfile()?;
        let out_path = out_file.path().to_path_buf();

        let binary = self.binary.as_deref().unwrap_or("codex");
        debug!(model = %resolved_model, "spawning codex exec fallback");

        let child = Command::new(binary)
            .arg("exec")
            .arg(prompt)
            .arg("--model")
            .arg(&resolved_model)
            .arg("--skip-git-repo-check")
            .arg("--dangerously-bypass-approvals-and-sandbox")
            .arg("--json")
            .arg("-o")
            .arg(&out_path)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(EXEC_DEADLINE, child)
            .await
            .map_err(|_| anyhow::anyhow!("codex exec timed out after {}s", EXEC_DEADLINE.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut content = tokio::fs::read_to_string(&out_path)
            .await
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_owned()
            } else {
                stderr.trim().to_owned()
            };
            let detail: String = detail.chars().take(1000).collect();
            warn!(code = ?output.status.code(), "codex exec failed");
            anyhow::bail!("codex exec failed: {detail}");
        }

        if content.is_empty() {
            content = stdout.trim().to_owned();
        }
        if content.is_empty() {
            content = "Codex execution completed with no output.".to_owned();
        }

        Ok(CodexOutput {
            content,
            usage: usage_from_jsonl(&stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_executor_prefixes() {
        assert_eq!(underlying_model("openclaw/gpt-5.1-codex"), "gpt-5.1-codex");
        assert_eq!(underlying_model("cursor/sonnet-4"), "sonnet-4");
        assert_eq!(underlying_model("clawwork/gpt-5.3-codex"), "gpt-5.3-codex");
        assert_eq!(underlying_model("  gpt-4o "), "gpt-4o");
    }

    #[test]
    fn fallback_requires_codex_model_and_key_error() {
        assert!(should_fallback_to_codex(
            "openclaw/gpt-5.1-codex",
            "OPENROUTER_API_KEY is not configured"
        ));
        assert!(!should_fallback_to_codex(
            "openrouter/free",
            "OPENROUTER_API_KEY is not configured"
        ));
        assert!(!should_fallback_to_codex(
            "openclaw/gpt-5.1-codex",
            "rate limited"
        ));
    }

    #[test]
    fn jsonl_usage_extraction() {
        let stdout = r#"
{"type":"turn.started"}
not json at all
{"type":"item.completed","item":{}}
{"type":"turn.completed","usage":{"input_tokens":100,"output_tokens":25}}
"#;
        let usage = usage_from_jsonl(stdout);
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 25);
        assert_eq!(usage.total_tokens, 125);
    }

    #[test]
    fn jsonl_usage_defaults_without_completion_event() {
        assert_eq!(usage_from_jsonl("{\"type\":\"turn.started\"}"), TokenUsage::default());
        assert_eq!(usage_from_jsonl(""), TokenUsage::default());
    }
}
