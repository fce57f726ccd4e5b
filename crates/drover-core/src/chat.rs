//! Chat adapter: outbound transport and inbound command handling.
//!
//! The transport is a narrow seam (`send`); Telegram is the production
//! implementation. Inbound webhook updates are parsed into commands against
//! the lifecycle controller, with an allowlist in front.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use drover_db::models::{TaskKind, TaskStatus};
use drover_db::store::TaskFilter;

use crate::config::ChatConfig;
use crate::lifecycle::{Core, CoreError, TaskCreate, TaskPatch};

const MESSAGE_MAX: usize = 4096;

/// Outbound chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver `text` to `chat_id`. Implementations retry once without
    /// `parse_mode` when the transport rejects the formatting. Returns
    /// delivery success.
    async fn send(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> bool;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ChatTransport) {}
};

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Telegram Bot API transport.
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramTransport {
    const API: &str = "https://api.telegram.org";

    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(Self::API, token)
    }

    pub fn with_api_base(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
        }
    }

    async fn post_message(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> Result<(u16, String), reqwest::Error> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let mut body = Map::new();
        body.insert("chat_id".into(), Value::String(chat_id.to_owned()));
        body.insert(
            "text".into(),
            Value::String(text.chars().take(MESSAGE_MAX).collect()),
        );
        if let Some(mode) = parse_mode {
            body.insert("parse_mode".into(), Value::String(mode.to_owned()));
        }
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> bool {
        match self.post_message(chat_id, text, parse_mode).await {
            Ok((200, _)) => true,
            Ok((status, body)) => {
                // Telegram rejects broken Markdown entities; plain text still
                // gets the alert through.
                if parse_mode.is_some() && body.to_ascii_lowercase().contains("parse") {
                    match self.post_message(chat_id, text, None).await {
                        Ok((200, _)) => return true,
                        Ok((status, body)) => {
                            warn!(status, body = %body.chars().take(200).collect::<String>(), "sendMessage retry failed");
                            return false;
                        }
                        Err(err) => {
                            warn!(error = %err, "sendMessage retry error");
                            return false;
                        }
                    }
                }
                warn!(status, body = %body.chars().take(200).collect::<String>(), "sendMessage failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "sendMessage error");
                false
            }
        }
    }
}

/// Transport used when no chat is configured; drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

#[async_trait]
impl ChatTransport for NoopTransport {
    async fn send(&self, chat_id: &str, _text: &str, _parse_mode: Option<&str>) -> bool {
        tracing::debug!(chat_id = %chat_id, "chat transport not configured; message dropped");
        false
    }
}

/// In-memory transport for tests and chatless deployments.
#[derive(Default)]
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    /// When set, the first send with a parse mode is rejected with a
    /// parse-entity error, exercising the retry path.
    pub reject_parse_mode_once: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> bool {
        use std::sync::atomic::Ordering;
        if parse_mode.is_some() && self.reject_parse_mode_once.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((chat_id.to_owned(), text.to_owned()));
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Inbound parsing
// ---------------------------------------------------------------------------

/// Split `/cmd arg...` into `(cmd, arg)`. Bare text becomes an implicit
/// `direction` command.
pub fn parse_command(text: &str) -> (String, String) {
    let text = text.trim();
    if text.is_empty() {
        return (String::new(), String::new());
    }
    if let Some(rest) = text.strip_prefix('/') {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
        let arg = parts.next().unwrap_or("").trim().to_owned();
        return (cmd, arg);
    }
    ("direction".to_owned(), text.to_owned())
}

const HELP_TEXT: &str = "Commands: /status, /tasks [status], /task {id}, /reply {id} {decision}, \
                         /attention, /usage, /direction \"...\" or just type your direction";

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Handles inbound chat updates against the controller.
pub struct ChatService {
    core: Arc<Core>,
    transport: Arc<dyn ChatTransport>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(core: Arc<Core>, transport: Arc<dyn ChatTransport>, config: ChatConfig) -> Self {
        Self {
            core,
            transport,
            config,
        }
    }

    /// Process one webhook update. Always succeeds from the transport's
    /// point of view; a reply is sent when the update produced one.
    pub async fn handle_update(&self, update: &Value) -> Option<String> {
        if self.config.bot_token.is_none() {
            warn!("chat webhook received with no bot token configured");
            return None;
        }
        let message = update.get("message").or_else(|| update.get("edited_message"))?;
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .map(value_to_id)?;
        let text = message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_owned();
        let user_id = message
            .get("from")
            .and_then(|f| f.get("id"))
            .map(value_to_id);

        if let Some(user_id) = &user_id {
            if !self.config.user_allowed(user_id) {
                warn!(user_id = %user_id, "chat update from non-allowlisted user dropped");
                return None;
            }
        }

        let (cmd, arg) = parse_command(&text);
        let reply = self.reply_for(&cmd, &arg).await;
        if let Some(reply) = &reply {
            let ok = self.transport.send(&chat_id, reply, Some("Markdown")).await;
            info!(chat_id = %chat_id, cmd = %cmd, ok, "chat reply sent");
        }
        reply
    }

    async fn reply_for(&self, cmd: &str, arg: &str) -> Option<String> {
        let reply = match cmd {
            "status" => self.cmd_status().await,
            "usage" => self.cmd_usage().await,
            "tasks" => self.cmd_tasks(arg).await,
            "task" => self.cmd_task(arg).await,
            "reply" => self.cmd_reply(arg).await,
            "attention" => self.cmd_attention().await,
            "direction" => self.cmd_direction(arg).await,
            "" => return None,
            _ => Ok(HELP_TEXT.to_owned()),
        };
        Some(reply.unwrap_or_else(|err| format!("Error: {err}")))
    }

    async fn cmd_status(&self) -> Result<String, CoreError> {
        let (total, by_status) = self.core.count_by_status().await?;
        let (_, attention_total) = self.core.attention_tasks(1).await?;
        let mut reply = format!("*Agent status*\nTasks: {total}\n");
        reply.push_str(
            &by_status
                .iter()
                .map(|(status, count)| format!("  {status}: {count}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        if attention_total > 0 {
            reply.push_str(&format!("\n\n⚠️ *{attention_total} need attention*"));
        }
        Ok(reply)
    }

    async fn cmd_usage(&self) -> Result<String, CoreError> {
        let usage = self.core.usage_summary().await?;
        let mut reply = "*Usage by model*\n".to_owned();
        if let Some(by_model) = usage.get("by_model").and_then(Value::as_object) {
            for (model, entry) in by_model {
                reply.push_str(&format!(
                    "\n`{model}`: {} tasks",
                    entry.get("count").and_then(Value::as_i64).unwrap_or(0)
                ));
                if let Some(by_status) = entry.get("by_status").and_then(Value::as_object) {
                    let parts: Vec<String> = by_status
                        .iter()
                        .map(|(status, count)| format!("{status}:{count}"))
                        .collect();
                    if !parts.is_empty() {
                        reply.push(' ');
                        reply.push_str(&parts.join(", "));
                    }
                }
            }
        }
        if let Some(routing) = usage.get("routing").and_then(Value::as_object) {
            reply.push_str("\n\n*Routing*: ");
            reply.push_str(
                &routing
                    .iter()
                    .map(|(kind, entry)| {
                        format!(
                            "{kind}={}",
                            entry.get("model").and_then(Value::as_str).unwrap_or("?")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        Ok(reply)
    }

    async fn cmd_tasks(&self, arg: &str) -> Result<String, CoreError> {
        let status = arg.trim().parse::<TaskStatus>().ok();
        let filter = TaskFilter {
            status,
            limit: 10,
            ..TaskFilter::default()
        };
        let (tasks, total) = self.core.list_tasks(&filter).await?;
        let mut reply = format!("*Tasks* ({total} total)\n");
        for task in tasks {
            reply.push_str(&format!(
                "\n`{}` {} — {}...",
                task.id,
                task.status,
                excerpt(&task.direction, 50)
            ));
        }
        Ok(reply)
    }

    async fn cmd_task(&self, arg: &str) -> Result<String, CoreError> {
        let id = arg.trim();
        if id.is_empty() {
            return Ok("Usage: /task {id}".to_owned());
        }
        let Some(task) = self.core.get_task(id).await? else {
            return Ok(format!("Task `{id}` not found"));
        };
        if task.status.needs_attention() {
            return Ok(crate::alert::render_alert(&task));
        }
        Ok(format!(
            "*Task* `{}`\n{}\n{}",
            task.id,
            task.status,
            excerpt(&task.direction, 200)
        ))
    }

    async fn cmd_reply(&self, arg: &str) -> Result<String, CoreError> {
        let mut parts = arg.splitn(2, char::is_whitespace);
        let task_id = parts.next().unwrap_or("").trim();
        let decision = parts.next().unwrap_or("").trim();
        if task_id.is_empty() || decision.is_empty() {
            return Ok("Usage: /reply {task_id} {decision}".to_owned());
        }
        match self
            .core
            .update_task(
                task_id,
                TaskPatch {
                    decision: Some(decision.to_owned()),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(_) => Ok(format!("Decision recorded for `{task_id}`")),
            Err(CoreError::NotFound(_)) => Ok(format!("Task `{task_id}` not found")),
            Err(err) => Err(err),
        }
    }

    async fn cmd_attention(&self) -> Result<String, CoreError> {
        let (tasks, total) = self.core.attention_tasks(10).await?;
        let mut reply = format!("*Attention* ({total} need action)\n");
        for task in tasks {
            reply.push_str(&format!(
                "\n`{}` {} — {}...",
                task.id,
                task.status,
                excerpt(&task.direction, 40)
            ));
            if let Some(prompt) = task.decision_prompt.as_deref() {
                reply.push_str(&format!("\n  _{}_", excerpt(prompt, 60)));
            }
        }
        Ok(reply)
    }

    async fn cmd_direction(&self, arg: &str) -> Result<String, CoreError> {
        let direction = arg.trim().trim_matches('"').trim();
        if direction.is_empty() {
            return Ok("Send a direction: e.g. /direction Add GET /api/projects".to_owned());
        }
        match self
            .core
            .create_task(TaskCreate {
                direction: direction.to_owned(),
                task_type: Some(TaskKind::Impl),
                ..TaskCreate::default()
            })
            .await
        {
            Ok(task) => Ok(format!("✅ Task `{}`\n\nRun:\n`{}`", task.id, task.command)),
            Err(CoreError::Invalid(details)) => Ok(format!("Invalid direction: {}", details.join("; "))),
            Err(err) => Err(err),
        }
    }
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    text.trim().chars().take(limit).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
