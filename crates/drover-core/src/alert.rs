//! Alert dispatcher: at-most-one chat alert per task state transition.
//!
//! The controller enqueues after a successful write; a background worker
//! performs transport I/O so PATCH latency never includes the chat round
//! trip. Per-task ordering holds because a single worker drains the queue.
//!
//! Two suppression layers:
//! - per task, `last_alerted_status`: a repeat of the last alerted status
//!   never re-alerts;
//! - process-wide, a rolling window caps alerts whose rendered text begins
//!   with `Status: failed`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use drover_db::models::{Task, TaskStatus};

use crate::chat::ChatTransport;
use crate::clock::Clock;
use crate::config::ChatConfig;

const MESSAGE_MAX: usize = 4096;
const DIRECTION_MAX: usize = 80;
const OUTPUT_EXCERPT_MAX: usize = 200;

fn clamp(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Render the alert for a task entering `failed` or `needs_decision`.
///
/// First line is the status badge; the failed-alert window matches on it.
pub fn render_alert(task: &Task) -> String {
    let direction = clamp(task.direction.trim(), DIRECTION_MAX);
    let mut message = format!(
        "Status: `{}`\n\n{}\n\nTask: `{}`",
        task.status, direction, task.id
    );
    if let Some(prompt) = task.decision_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        message.push_str("\n\n");
        message.push_str(prompt.trim());
    }
    if task.status == TaskStatus::Failed {
        if let Some(output) = task.output.as_deref().filter(|o| !o.trim().is_empty()) {
            message.push_str("\n\nOutput: ");
            message.push_str(&clamp(output.trim(), OUTPUT_EXCERPT_MAX));
        }
    }
    clamp(&message, MESSAGE_MAX)
}

/// Does a rendered message announce a failed task?
fn is_failed_alert(message: &str) -> bool {
    let first = message.lines().next().unwrap_or("");
    let lower = first.trim().to_ascii_lowercase();
    lower
        .strip_prefix("status:")
        .map(|rest| rest.trim().trim_matches('`').starts_with("failed"))
        .unwrap_or(false)
}

struct DispatchState {
    transport: Arc<dyn ChatTransport>,
    clock: Arc<dyn Clock>,
    chat_ids: Vec<String>,
    window_secs: i64,
    max_per_window: u32,
    window: Mutex<VecDeque<DateTime<Utc>>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DispatchState {
    /// Admit or suppress a failed alert against the rolling window.
    async fn admit_failed(&self, now: DateTime<Utc>) -> bool {
        if self.max_per_window == 0 {
            return false;
        }
        let mut window = self.window.lock().await;
        let cutoff = now - Duration::seconds(self.window_secs);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() >= self.max_per_window as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    async fn send(&self, message: String) {
        if is_failed_alert(&message) && !self.admit_failed(self.clock.now()).await {
            warn!("failed alert suppressed by rate limit window");
            return;
        }
        for chat_id in &self.chat_ids {
            let ok = self
                .transport
                .send(chat_id, &message, Some("Markdown"))
                .await;
            if !ok {
                warn!(chat_id = %chat_id, "alert send failed");
            }
        }
    }
}

/// Handle held by the controller; cheap to clone.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::UnboundedSender<String>,
    state: Arc<DispatchState>,
    last_alerted: Arc<Mutex<HashMap<String, TaskStatus>>>,
    enabled: bool,
}

impl AlertDispatcher {
    /// Build the dispatcher and spawn its worker. Must run inside a tokio
    /// runtime.
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        config: &ChatConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let state = Arc::new(DispatchState {
            transport,
            clock,
            chat_ids: config.chat_ids.clone(),
            window_secs: config.failed_alert_window_secs,
            max_per_window: config.failed_alert_max_per_window,
            window: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        let worker_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                worker_state.send(message).await;
                if worker_state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    worker_state.drained.notify_waiters();
                }
            }
        });

        Self {
            tx,
            state,
            last_alerted: Arc::new(Mutex::new(HashMap::new())),
            enabled: config.is_configured(),
        }
    }

    /// Notify that `task` just entered `failed` or `needs_decision`.
    ///
    /// The caller guarantees the status actually changed; this layer adds the
    /// `last_alerted_status` dedupe, so a task bouncing back into the same
    /// alerted status does not re-alert.
    pub async fn notify_transition(&self, task: &Task) {
        if !task.status.needs_attention() {
            return;
        }
        {
            let mut last = self.last_alerted.lock().await;
            if last.get(&task.id) == Some(&task.status) {
                debug!(task_id = %task.id, status = %task.status, "alert deduplicated");
                return;
            }
            last.insert(task.id.clone(), task.status);
        }
        if !self.enabled {
            info!(task_id = %task.id, status = %task.status, "alert skipped: chat not configured");
            return;
        }
        let message = render_alert(task);
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("alert worker gone; dropping alert");
        }
    }

    /// Wait until the worker has drained every enqueued alert.
    pub async fn idle(&self) {
        loop {
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.state.drained.notified();
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
