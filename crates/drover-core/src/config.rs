//! Runtime policy configuration.
//!
//! Read once at startup from environment variables and immutable afterwards.
//! Storage backend selection lives in `drover_db::config`; routing defaults
//! live in [`crate::routing::RoutingEnv`].

use std::env;

/// Parse helpers shared across config surfaces.
pub(crate) fn env_truthy(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

pub(crate) fn env_i64(name: &str, default: i64, min: i64, max: i64) -> i64 {
    let value = env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default);
    value.clamp(min, max)
}

pub(crate) fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(default)
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Chat transport settings (Telegram).
#[derive(Debug, Clone, Default)]
pub struct ChatConfig {
    pub bot_token: Option<String>,
    pub chat_ids: Vec<String>,
    pub allowed_user_ids: Vec<String>,
    /// Rolling window for failed-alert rate limiting, seconds.
    pub failed_alert_window_secs: i64,
    /// Max failed alerts inside one window; 0 suppresses all of them.
    pub failed_alert_max_per_window: u32,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self {
            bot_token: env_string("TELEGRAM_BOT_TOKEN"),
            chat_ids: env_csv("TELEGRAM_CHAT_IDS"),
            allowed_user_ids: env_csv("TELEGRAM_ALLOWED_USER_IDS"),
            failed_alert_window_secs: env_i64(
                "TELEGRAM_FAILED_ALERT_WINDOW_SECONDS",
                1800,
                60,
                86_400,
            ),
            failed_alert_max_per_window: env_i64(
                "TELEGRAM_FAILED_ALERT_MAX_PER_WINDOW",
                1,
                0,
                100,
            ) as u32,
        }
    }

    /// Outbound alerts need both a token and at least one chat.
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && !self.chat_ids.is_empty()
    }

    /// Empty allowlist means every user may issue commands.
    pub fn user_allowed(&self, user_id: &str) -> bool {
        self.allowed_user_ids.is_empty()
            || self.allowed_user_ids.iter().any(|id| id == user_id)
    }
}

/// Core orchestration policy, read-only after startup.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default-deny gate for providers that cost money.
    pub allow_paid_providers: bool,
    /// When a failure is a paid-provider block, retry on the escalation
    /// model with the gate forced open.
    pub auto_retry_openai_override: bool,
    /// Escalation model for the auto-retry override.
    pub retry_openai_model_override: Option<String>,
    /// Environment-level retry budget; `context.retry_max` wins per task.
    pub retry_max_env: Option<u32>,
    /// Seconds a claimed task may run before an idle heartbeat reclaims it.
    pub orphan_running_sec: i64,
    /// Cap on reclaimed tasks per heartbeat.
    pub orphan_reap_max_tasks: usize,
    /// Create a heal task after orphan recovery.
    pub orphan_heal_task: bool,
    /// Stored task output cap, characters.
    pub output_max_chars: usize,
    /// Subprocess runtime pricing for usage events, USD per second.
    pub cost_per_second: f64,
    pub chat: ChatConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            allow_paid_providers: env_truthy("AGENT_ALLOW_PAID_PROVIDERS", false),
            auto_retry_openai_override: env_truthy("AGENT_AUTO_RETRY_OPENAI_OVERRIDE", false),
            retry_openai_model_override: env_string("AGENT_RETRY_OPENAI_MODEL_OVERRIDE"),
            retry_max_env: env_string("AGENT_RETRY_MAX")
                .and_then(|raw| raw.parse::<u32>().ok()),
            orphan_running_sec: env_i64("AGENT_ORPHAN_RUNNING_SEC", 1800, 60, 604_800),
            orphan_reap_max_tasks: env_i64("AGENT_ORPHAN_REAP_MAX_TASKS", 10, 1, 50) as usize,
            orphan_heal_task: env_truthy("AGENT_ORPHAN_HEAL_TASK", false),
            output_max_chars: env_i64("AGENT_TASK_OUTPUT_MAX_CHARS", 100_000, 1_000, 10_000_000)
                as usize,
            cost_per_second: env_f64("RUNTIME_COST_PER_SECOND", 0.002),
            chat: ChatConfig::from_env(),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            allow_paid_providers: false,
            auto_retry_openai_override: false,
            retry_openai_model_override: None,
            retry_max_env: None,
            orphan_running_sec: 1800,
            orphan_reap_max_tasks: 10,
            orphan_heal_task: false,
            output_max_chars: 100_000,
            cost_per_second: 0.002,
            chat: ChatConfig {
                failed_alert_window_secs: 1800,
                failed_alert_max_per_window: 1,
                ..ChatConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_allowlist_empty_allows_everyone() {
        let cfg = ChatConfig::default();
        assert!(cfg.user_allowed("12345"));
    }

    #[test]
    fn chat_allowlist_filters() {
        let cfg = ChatConfig {
            allowed_user_ids: vec!["1".to_owned(), "2".to_owned()],
            ..ChatConfig::default()
        };
        assert!(cfg.user_allowed("2"));
        assert!(!cfg.user_allowed("3"));
    }

    #[test]
    fn defaults_match_policy() {
        let cfg = CoreConfig::default();
        assert!(!cfg.allow_paid_providers);
        assert_eq!(cfg.orphan_running_sec, 1800);
        assert_eq!(cfg.orphan_reap_max_tasks, 10);
        assert_eq!(cfg.output_max_chars, 100_000);
        assert_eq!(cfg.chat.failed_alert_max_per_window, 1);
    }
}
