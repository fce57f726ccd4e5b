//! Orphan recovery driven by idle runner heartbeats, on a manual clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use drover_db::memory::{MemoryRunnerStore, MemoryTaskStore, MemoryUsageLog};
use drover_db::models::{TaskKind, TaskStatus};

use drover_core::chat::RecordingTransport;
use drover_core::clock::ManualClock;
use drover_core::codex::{CodexOutput, CodexRunner};
use drover_core::config::{ChatConfig, CoreConfig};
use drover_core::lifecycle::{Core, TaskCreate, TaskPatch};
use drover_core::orphan::recover_on_idle_heartbeat;
use drover_core::provider::{ChatApi, ChatCompletion, ProviderError};
use drover_core::registry::HeartbeatRequest;
use drover_core::routing::{Executor, RoutingEnv};

struct UnconfiguredChat;

#[async_trait]
impl ChatApi for UnconfiguredChat {
    async fn chat_completion(
        &self,
        _model: &str,
        _prompt: &str,
    ) -> Result<ChatCompletion, ProviderError> {
        Err(ProviderError::Unconfigured)
    }
}

struct NoCodex;

#[async_trait]
impl CodexRunner for NoCodex {
    async fn exec(&self, _model: &str, _prompt: &str) -> anyhow::Result<CodexOutput> {
        anyhow::bail!("unused")
    }
}

struct Harness {
    core: Arc<Core>,
    transport: Arc<RecordingTransport>,
    clock: ManualClock,
}

fn harness(config: CoreConfig) -> Harness {
    let clock = ManualClock::new(Utc::now());
    let transport = Arc::new(RecordingTransport::default());
    let core = Core::new(
        config,
        RoutingEnv::fixed([Executor::Claude, Executor::Cursor, Executor::Openclaw]),
        Arc::new(clock.clone()),
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MemoryRunnerStore::new()),
        Arc::new(MemoryUsageLog::new()),
        Arc::new(UnconfiguredChat),
        Arc::new(NoCodex),
        transport.clone(),
    );
    Harness {
        core,
        transport,
        clock,
    }
}

fn default_config() -> CoreConfig {
    CoreConfig {
        chat: ChatConfig {
            bot_token: Some("t".to_owned()),
            chat_ids: vec!["chat-1".to_owned()],
            failed_alert_window_secs: 1800,
            failed_alert_max_per_window: 10,
            ..ChatConfig::default()
        },
        ..CoreConfig::default()
    }
}

async fn claimed_task(h: &Harness, direction: &str, runner_id: &str) -> String {
    let task = h
        .core
        .create_task(TaskCreate {
            direction: direction.to_owned(),
            task_type: Some(TaskKind::Impl),
            ..TaskCreate::default()
        })
        .await
        .unwrap();
    h.core
        .update_task(
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                worker_id: Some(runner_id.to_owned()),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();
    task.id
}

fn idle_beat(runner_id: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        runner_id: runner_id.to_owned(),
        status: "idle".to_owned(),
        ..HeartbeatRequest::default()
    }
}

#[tokio::test]
async fn stale_running_task_is_failed_on_idle_heartbeat() {
    let h = harness(default_config());
    let task_id = claimed_task(&h, "long running work", "runner-r").await;

    h.clock.advance_async(Duration::seconds(3700)).await;
    let runner = h.core.runners().heartbeat(&idle_beat("runner-r")).await.unwrap();
    let recovered = recover_on_idle_heartbeat(&h.core, &runner).await.unwrap();

    assert_eq!(recovered.len(), 1);
    let task = h.core.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let output = task.output.as_deref().unwrap();
    assert!(output.starts_with("Orphan:"), "got: {output}");
    assert!(output.contains("after 3700s"));
    assert!(output.contains("threshold 1800s"));
    assert_eq!(
        task.context.get_str("orphan_recovered_by_runner"),
        Some("runner-r")
    );
    assert_eq!(task.context.get_u32("orphan_recovered_running_seconds"), Some(3700));
    assert_eq!(
        task.context.get_u32("orphan_recovered_threshold_seconds"),
        Some(1800)
    );

    // Exactly one alert for the recovered task.
    h.core.alerts().idle().await;
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains(&task_id));
}

#[tokio::test]
async fn fresh_tasks_are_left_alone() {
    let h = harness(default_config());
    let task_id = claimed_task(&h, "short running work", "runner-r").await;

    h.clock.advance_async(Duration::seconds(600)).await;
    let runner = h.core.runners().heartbeat(&idle_beat("runner-r")).await.unwrap();
    let recovered = recover_on_idle_heartbeat(&h.core, &runner).await.unwrap();

    assert!(recovered.is_empty());
    let task = h.core.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn busy_heartbeat_does_not_recover() {
    let h = harness(default_config());
    claimed_task(&h, "still in progress", "runner-r").await;
    h.clock.advance_async(Duration::seconds(3700)).await;

    let mut beat = idle_beat("runner-r");
    beat.active_task_id = Some("task_other".to_owned());
    let runner = h.core.runners().heartbeat(&beat).await.unwrap();
    assert!(recover_on_idle_heartbeat(&h.core, &runner).await.unwrap().is_empty());

    let mut beat = idle_beat("runner-r");
    beat.status = "running".to_owned();
    let runner = h.core.runners().heartbeat(&beat).await.unwrap();
    assert!(recover_on_idle_heartbeat(&h.core, &runner).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_own_claims_are_recovered() {
    let h = harness(default_config());
    let mine = claimed_task(&h, "mine", "runner-a").await;
    let theirs = claimed_task(&h, "theirs", "runner-b").await;

    h.clock.advance_async(Duration::seconds(4000)).await;
    let runner = h.core.runners().heartbeat(&idle_beat("runner-a")).await.unwrap();
    let recovered = recover_on_idle_heartbeat(&h.core, &runner).await.unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, mine);
    let other = h.core.get_task(&theirs).await.unwrap().unwrap();
    assert_eq!(other.status, TaskStatus::Running);
}

#[tokio::test]
async fn recovery_is_capped_and_oldest_first() {
    let h = harness(CoreConfig {
        orphan_reap_max_tasks: 2,
        ..default_config()
    });

    let oldest = claimed_task(&h, "oldest", "runner-r").await;
    h.clock.advance_async(Duration::seconds(1000)).await;
    let middle = claimed_task(&h, "middle", "runner-r").await;
    h.clock.advance_async(Duration::seconds(1000)).await;
    let newest = claimed_task(&h, "newest", "runner-r").await;

    // All three exceed the threshold; only the two longest-running recover.
    h.clock.advance_async(Duration::seconds(2000)).await;
    let runner = h.core.runners().heartbeat(&idle_beat("runner-r")).await.unwrap();
    let recovered = recover_on_idle_heartbeat(&h.core, &runner).await.unwrap();

    let ids: Vec<&str> = recovered.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![oldest.as_str(), middle.as_str()]);
    let survivor = h.core.get_task(&newest).await.unwrap().unwrap();
    assert_eq!(survivor.status, TaskStatus::Running);
}

#[tokio::test]
async fn heal_task_created_when_enabled() {
    let h = harness(CoreConfig {
        orphan_heal_task: true,
        ..default_config()
    });
    let task_id = claimed_task(&h, "needs healing", "runner-r").await;

    h.clock.advance_async(Duration::seconds(3700)).await;
    let runner = h.core.runners().heartbeat(&idle_beat("runner-r")).await.unwrap();
    recover_on_idle_heartbeat(&h.core, &runner).await.unwrap();

    let (tasks, _) = h
        .core
        .list_tasks(&drover_db::store::TaskFilter {
            task_type: Some(TaskKind::Heal),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].direction.contains(&task_id));
    assert_eq!(tasks[0].context.get_str("heal_for_task"), Some(task_id.as_str()));
}
