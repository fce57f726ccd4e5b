//! Deterministic routing: `(kind, direction, context, env) → RouteDecision`.
//!
//! The environment (which executor binaries exist, configured defaults,
//! model tables, alias map) is snapshotted into a [`RoutingEnv`] at startup,
//! which makes [`route`] a pure function: same inputs, same decision.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use drover_db::models::{TaskContext, TaskKind};

use crate::config::{env_string, env_truthy};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Executor backend invoked for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    Claude,
    Cursor,
    Openclaw,
}

impl Executor {
    /// Normalize a free-form executor name; the `codex` and `clawwork`
    /// spellings are accepted aliases for `openclaw`.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" | "aider" => Some(Self::Claude),
            "cursor" => Some(Self::Cursor),
            "openclaw" | "codex" | "clawwork" => Some(Self::Openclaw),
            _ => None,
        }
    }

    /// Binary probed on `$PATH` for availability.
    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Claude => "aider",
            Self::Cursor => "agent",
            Self::Openclaw => "codex",
        }
    }
}

impl fmt::Display for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claude => "claude",
            Self::Cursor => "cursor",
            Self::Openclaw => "openclaw",
        };
        f.write_str(s)
    }
}

impl FromStr for Executor {
    type Err = ExecutorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| ExecutorParseError(s.to_owned()))
    }
}

/// Error returned when parsing an invalid [`Executor`] string.
#[derive(Debug, Clone)]
pub struct ExecutorParseError(pub String);

impl fmt::Display for ExecutorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid executor: {:?}", self.0)
    }
}

impl std::error::Error for ExecutorParseError {}

/// Billing tier recorded on the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Openrouter,
    Cursor,
    Openclaw,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Openrouter => "openrouter",
            Self::Cursor => "cursor",
            Self::Openclaw => "openclaw",
        };
        f.write_str(s)
    }
}

/// Provider classification derived from the resolved model and command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Openrouter,
    Openai,
    OpenaiCodex,
    Claude,
    Cursor,
    Openclaw,
    Unknown,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Openrouter => "openrouter",
            Self::Openai => "openai",
            Self::OpenaiCodex => "openai-codex",
            Self::Claude => "claude",
            Self::Cursor => "cursor",
            Self::Openclaw => "openclaw",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Why routing picked the executor it picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    ExplicitExecutor,
    ExplicitExecutorUnavailable,
    RepoScopedQuestion,
    OpenQuestionDefault,
    FailureThreshold,
    CheapDefault,
}

impl RouteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitExecutor => "explicit_executor",
            Self::ExplicitExecutorUnavailable => "explicit_executor_unavailable",
            Self::RepoScopedQuestion => "repo_scoped_question",
            Self::OpenQuestionDefault => "open_question_default",
            Self::FailureThreshold => "failure_threshold",
            Self::CheapDefault => "cheap_default",
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The routing snapshot stored on a task at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub task_type: TaskKind,
    pub executor: Executor,
    pub model: String,
    pub command_template: String,
    pub tier: Tier,
    pub provider: Provider,
    pub billing_provider: Provider,
    pub is_paid_provider: bool,
    pub reason: RouteReason,
}

impl RouteDecision {
    /// JSON snapshot stored under `context.route_decision`.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "executor": self.executor.to_string(),
            "model": self.model,
            "tier": self.tier.to_string(),
            "provider": self.provider.to_string(),
            "billing_provider": self.billing_provider.to_string(),
            "is_paid_provider": self.is_paid_provider,
            "reason": self.reason.as_str(),
        })
    }
}

// ---------------------------------------------------------------------------
// Environment snapshot
// ---------------------------------------------------------------------------

/// Routing environment captured once at startup.
#[derive(Debug, Clone)]
pub struct RoutingEnv {
    pub policy_enabled: bool,
    /// Executors whose binary was found on `$PATH`.
    pub available: BTreeSet<Executor>,
    pub cheap_default: Executor,
    pub escalate_to: Executor,
    pub repo_default: Executor,
    pub open_question_default: Executor,
    /// Recent same-shaped failures needed before escalation kicks in.
    pub failure_threshold: u32,
    /// Model for the claude/aider route (an OpenRouter model name).
    pub free_model: String,
    pub cursor_model: String,
    pub cursor_review_model: String,
    pub openclaw_model: String,
    pub openclaw_review_model: String,
    /// Exact-match model alias rewrites (typo fixes), applied to every
    /// resolved or overridden model name.
    pub model_aliases: Vec<(String, String)>,
    /// Environment-level model override, weaker than `context.model_override`.
    pub model_override: Option<String>,
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

fn env_executor(name: &str, default: Executor) -> Executor {
    env_string(name)
        .and_then(|raw| Executor::normalize(&raw))
        .unwrap_or(default)
}

fn parse_alias_map(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once(':')?;
            let from = from.trim();
            let to = to.trim();
            (!from.is_empty() && !to.is_empty())
                .then(|| (from.to_owned(), to.to_owned()))
        })
        .collect()
}

impl RoutingEnv {
    pub fn from_env() -> Self {
        let available = [Executor::Claude, Executor::Cursor, Executor::Openclaw]
            .into_iter()
            .filter(|e| binary_on_path(e.binary_name()))
            .collect();

        let cheap_default = env_string("AGENT_EXECUTOR_CHEAP_DEFAULT")
            .and_then(|raw| Executor::normalize(&raw))
            .unwrap_or_else(|| env_executor("AGENT_EXECUTOR_DEFAULT", Executor::Cursor));
        let escalate_to = env_string("AGENT_EXECUTOR_ESCALATE_TO")
            .and_then(|raw| Executor::normalize(&raw))
            .unwrap_or(if cheap_default == Executor::Claude {
                Executor::Openclaw
            } else {
                Executor::Claude
            });

        let openclaw_model =
            env_string("OPENCLAW_MODEL").unwrap_or_else(|| "gpt-5.1-codex".to_owned());
        let openclaw_review_model =
            env_string("OPENCLAW_REVIEW_MODEL").unwrap_or_else(|| openclaw_model.clone());
        let cursor_model =
            env_string("CURSOR_CLI_MODEL").unwrap_or_else(|| "openrouter/free".to_owned());
        let cursor_review_model =
            env_string("CURSOR_CLI_REVIEW_MODEL").unwrap_or_else(|| cursor_model.clone());

        Self {
            policy_enabled: env_truthy("AGENT_EXECUTOR_POLICY_ENABLED", true),
            available,
            cheap_default,
            escalate_to,
            repo_default: env_executor("AGENT_EXECUTOR_REPO_DEFAULT", Executor::Cursor),
            open_question_default: env_executor(
                "AGENT_EXECUTOR_OPEN_QUESTION_DEFAULT",
                Executor::Openclaw,
            ),
            failure_threshold: env_string("AGENT_EXECUTOR_ESCALATE_FAILURE_THRESHOLD")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(3),
            free_model: env_string("OPENROUTER_FREE_MODEL")
                .unwrap_or_else(|| "openrouter/free".to_owned()),
            cursor_model,
            cursor_review_model,
            openclaw_model,
            openclaw_review_model,
            model_aliases: env_string("AGENT_MODEL_ALIAS_MAP")
                .map(|raw| parse_alias_map(&raw))
                .unwrap_or_default(),
            model_override: env_string("AGENT_MODEL_OVERRIDE"),
        }
    }

    /// Fixed environment for tests: every executor available, defaults as
    /// shipped, no aliases.
    pub fn fixed(available: impl IntoIterator<Item = Executor>) -> Self {
        Self {
            policy_enabled: true,
            available: available.into_iter().collect(),
            cheap_default: Executor::Cursor,
            escalate_to: Executor::Claude,
            repo_default: Executor::Cursor,
            open_question_default: Executor::Openclaw,
            failure_threshold: 3,
            free_model: "openrouter/free".to_owned(),
            cursor_model: "openrouter/free".to_owned(),
            cursor_review_model: "openrouter/free".to_owned(),
            openclaw_model: "gpt-5.1-codex".to_owned(),
            openclaw_review_model: "gpt-5.1-codex".to_owned(),
            model_aliases: Vec::new(),
            model_override: None,
        }
    }

    fn is_available(&self, executor: Executor) -> bool {
        self.available.contains(&executor)
    }

    /// Apply the alias map; exact matches only.
    pub fn normalize_model(&self, model: &str) -> String {
        for (from, to) in &self.model_aliases {
            if model == from {
                return to.clone();
            }
        }
        model.to_owned()
    }
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

const REPO_SCOPE_PHRASES: &[&str] = &[
    "this repo",
    "this repository",
    "codebase",
    "in repo",
    "in the repo",
    "agents.md",
    "claude.md",
    "docs/",
    "api/",
    "web/",
];

const REPO_FILE_EXTENSIONS: &[&str] = &[
    ".py", ".ts", ".tsx", ".js", ".jsx", ".md", ".json", ".toml", ".yaml", ".yml",
];

fn mentions_repo_file(lower: &str) -> bool {
    lower
        .split(|c: char| c.is_whitespace() || c == '`' || c == '(' || c == ')' || c == ',')
        .map(|token| token.trim_end_matches(|c: char| matches!(c, '.' | ';' | ':' | '?' | '!')))
        .filter(|token| !token.is_empty())
        .any(|token| {
            REPO_FILE_EXTENSIONS
                .iter()
                .any(|ext| token.ends_with(ext) && token.len() > ext.len())
        })
}

/// A direction is repo-scoped when the context says so or the text names the
/// repository or a repository file.
pub fn is_repo_scoped_question(direction: &str, context: &TaskContext) -> bool {
    if let Some(scope) = context.question_scope() {
        match scope.to_ascii_lowercase().as_str() {
            "repo" | "repository" | "codebase" => return true,
            "open" | "general" => return false,
            _ => {}
        }
    }
    let lower = direction.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return false;
    }
    REPO_SCOPE_PHRASES.iter().any(|p| lower.contains(p)) || mentions_repo_file(&lower)
}

fn is_open_question(direction: &str, context: &TaskContext) -> bool {
    if let Some(scope) = context.question_scope() {
        if matches!(scope.to_ascii_lowercase().as_str(), "open" | "general") {
            return true;
        }
    }
    // A bare question with no repository scope implied reads as open-ended.
    direction.trim_end().ends_with('?')
}

// ---------------------------------------------------------------------------
// Model and command resolution
// ---------------------------------------------------------------------------

fn model_for(env: &RoutingEnv, kind: TaskKind, executor: Executor) -> String {
    match executor {
        Executor::Claude => env.free_model.clone(),
        Executor::Cursor => match kind {
            TaskKind::Review | TaskKind::Heal => env.cursor_review_model.clone(),
            _ => env.cursor_model.clone(),
        },
        Executor::Openclaw => match kind {
            TaskKind::Review | TaskKind::Heal => env.openclaw_review_model.clone(),
            _ => env.openclaw_model.clone(),
        },
    }
}

fn command_template_for(executor: Executor, model: &str) -> String {
    match executor {
        Executor::Claude => {
            format!("aider --message \"{{{{direction}}}}\" --model {model}")
        }
        Executor::Cursor => format!("agent \"{{{{direction}}}}\" --model {model}"),
        Executor::Openclaw => format!(
            "codex exec \"{{{{direction}}}}\" --model {model} --skip-git-repo-check --json"
        ),
    }
}

/// Replace the value of an existing `--model` flag or append one.
pub fn ensure_model_flag(command: &str, model: &str) -> String {
    let model = model.trim();
    if model.is_empty() {
        return command.to_owned();
    }
    if let Some(pos) = command.find("--model") {
        let after = &command[pos + "--model".len()..];
        let value_start = after.len() - after.trim_start().len();
        let rest = after.trim_start();
        let value_len = rest.split_whitespace().next().map_or(0, str::len);
        let tail = &rest[value_len..];
        let separator = if value_start > 0 { &after[..value_start] } else { " " };
        return format!("{}--model{separator}{model}{tail}", &command[..pos]);
    }
    format!("{} --model {model}", command.trim_end())
}

/// Extract the value of a `--model` flag from a command, lowercased.
fn command_model(command: &str) -> Option<String> {
    let pos = command.find("--model")?;
    command[pos + "--model".len()..]
        .split_whitespace()
        .next()
        .map(|m| m.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Provider classification
// ---------------------------------------------------------------------------

fn looks_openai(name: &str) -> bool {
    name.starts_with("openai/")
        || name.starts_with("gpt")
        || name.starts_with("o1")
        || name.starts_with("o3")
        || name.starts_with("o4")
}

/// Classify the provider behind a resolved route.
pub fn classify_provider(executor: Executor, model: &str, command: &str) -> Provider {
    let lower_model = model.trim().to_ascii_lowercase();
    let lower_command = command.trim().to_ascii_lowercase();
    let cmd_model = command_model(&lower_command).unwrap_or_default();

    if cmd_model.contains("openrouter") || lower_model.contains("openrouter") {
        Provider::Openrouter
    } else if !cmd_model.is_empty() && looks_openai(&cmd_model) {
        if cmd_model.contains("codex") {
            Provider::OpenaiCodex
        } else {
            Provider::Openai
        }
    } else if lower_model.contains("codex") {
        Provider::OpenaiCodex
    } else if looks_openai(&lower_model) {
        Provider::Openai
    } else if lower_command.starts_with("codex ") {
        Provider::OpenaiCodex
    } else {
        match executor {
            Executor::Openclaw => Provider::Openclaw,
            Executor::Cursor => Provider::Cursor,
            Executor::Claude => Provider::Claude,
        }
    }
}

/// Paid classification. OpenRouter routes are free only on the free-model
/// names; the named commercial providers always cost money.
pub fn is_paid_provider(provider: Provider, model: &str, command: &str) -> bool {
    match provider {
        Provider::Openrouter => {
            let lower_model = model.trim().to_ascii_lowercase();
            let reference = command_model(&command.trim().to_ascii_lowercase())
                .unwrap_or(lower_model);
            !(reference.contains("openrouter/free") || reference.ends_with("/free"))
        }
        Provider::Openai | Provider::OpenaiCodex | Provider::Claude | Provider::Cursor => true,
        Provider::Openclaw | Provider::Unknown => false,
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

struct ExecutorChoice {
    executor: Executor,
    reason: RouteReason,
}

fn choose_executor(
    env: &RoutingEnv,
    direction: &str,
    context: &TaskContext,
    recent_failures: u32,
) -> ExecutorChoice {
    if let Some(raw) = context.executor() {
        let requested = Executor::normalize(raw).unwrap_or(Executor::Claude);
        if env.is_available(requested) {
            return ExecutorChoice {
                executor: requested,
                reason: RouteReason::ExplicitExecutor,
            };
        }
        let fallback = [Executor::Openclaw, Executor::Cursor, Executor::Claude]
            .into_iter()
            .find(|e| env.is_available(*e))
            .unwrap_or(env.cheap_default);
        return ExecutorChoice {
            executor: fallback,
            reason: RouteReason::ExplicitExecutorUnavailable,
        };
    }

    if !env.policy_enabled {
        return ExecutorChoice {
            executor: env.cheap_default,
            reason: RouteReason::CheapDefault,
        };
    }

    if is_repo_scoped_question(direction, context) {
        return ExecutorChoice {
            executor: env.repo_default,
            reason: RouteReason::RepoScopedQuestion,
        };
    }

    if is_open_question(direction, context) {
        return ExecutorChoice {
            executor: env.open_question_default,
            reason: RouteReason::OpenQuestionDefault,
        };
    }

    if env.failure_threshold > 0 && recent_failures >= env.failure_threshold {
        return ExecutorChoice {
            executor: env.escalate_to,
            reason: RouteReason::FailureThreshold,
        };
    }

    ExecutorChoice {
        executor: env.cheap_default,
        reason: RouteReason::CheapDefault,
    }
}

/// Compute the route for a task. Deterministic for a fixed [`RoutingEnv`].
///
/// `recent_failures` is the count of recently failed tasks with the same
/// shape (kind + direction prefix); the caller derives it from history.
pub fn route(
    env: &RoutingEnv,
    kind: TaskKind,
    direction: &str,
    context: &TaskContext,
    recent_failures: u32,
) -> RouteDecision {
    let choice = choose_executor(env, direction, context, recent_failures);
    let executor = choice.executor;

    let base_model = model_for(env, kind, executor);
    let override_model = context
        .model_override()
        .map(str::to_owned)
        .or_else(|| env.model_override.clone());
    let bare_model = env.normalize_model(override_model.as_deref().unwrap_or(&base_model));

    // Stored model names carry the executor prefix for cursor/openclaw; the
    // command flag uses the bare underlying name.
    let model = match executor {
        Executor::Claude => bare_model.clone(),
        Executor::Cursor => format!("cursor/{bare_model}"),
        Executor::Openclaw => format!("openclaw/{bare_model}"),
    };

    let template = command_template_for(executor, &bare_model);
    let command_template = ensure_model_flag(&template, &bare_model);

    let tier = match executor {
        Executor::Claude => Tier::Openrouter,
        Executor::Cursor => Tier::Cursor,
        Executor::Openclaw => Tier::Openclaw,
    };

    let provider = classify_provider(executor, &model, &command_template);
    let is_paid = is_paid_provider(provider, &model, &command_template);

    RouteDecision {
        task_type: kind,
        executor,
        model,
        command_template,
        tier,
        provider,
        billing_provider: provider,
        is_paid_provider: is_paid,
        reason: choice.reason,
    }
}

/// Fill the `{{direction}}` placeholder, escaping embedded quotes.
pub fn build_command(template: &str, direction: &str) -> String {
    template.replace("{{direction}}", &direction.replace('"', "\\\""))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
