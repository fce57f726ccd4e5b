//! Orphan recovery: reclaim running tasks whose runner went idle.
//!
//! Triggered from the heartbeat path. When a runner reports `idle` with no
//! active task while tasks it claimed are still `running` past the
//! threshold, those tasks are failed with a synthesized diagnostic; the
//! normal alert path fires once per task.

use serde_json::{Map, json};
use tracing::warn;

use drover_db::models::{Runner, RunnerStatus, Task, TaskKind, TaskStatus};

use crate::lifecycle::{Core, CoreError, TaskCreate, TaskPatch};

fn running_seconds(task: &Task, now: chrono::DateTime<chrono::Utc>) -> i64 {
    let started = task
        .started_at
        .or(task.updated_at)
        .unwrap_or(task.created_at);
    (now - started).num_seconds().max(0)
}

/// Scan for and fail stale tasks claimed by `runner`. Returns the recovered
/// tasks. A no-op unless the heartbeat is `idle` with an empty
/// `active_task_id`.
pub async fn recover_on_idle_heartbeat(
    core: &Core,
    runner: &Runner,
) -> Result<Vec<Task>, CoreError> {
    if runner.status != RunnerStatus::Idle || !runner.active_task_id.is_empty() {
        return Ok(Vec::new());
    }

    let threshold = core.config.orphan_running_sec;
    let max_recoveries = core.config.orphan_reap_max_tasks;
    let now = core.clock.now();

    let claimed = core.tasks.list_running_claimed_by(&runner.runner_id).await?;
    let mut candidates: Vec<(i64, Task)> = claimed
        .into_iter()
        .filter_map(|task| {
            let secs = running_seconds(&task, now);
            (secs >= threshold).then_some((secs, task))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.truncate(max_recoveries);

    let mut recovered = Vec::new();
    for (secs, task) in candidates {
        let output = format!(
            "Orphan: runner heartbeat reported idle/no active task; \
             auto-recovered stale running task after {secs}s (threshold {threshold}s)."
        );
        let mut context_patch = Map::new();
        context_patch.insert("orphan_recovered_at".into(), json!(now.to_rfc3339()));
        context_patch.insert(
            "orphan_recovered_by_runner".into(),
            json!(runner.runner_id),
        );
        context_patch.insert("orphan_recovered_running_seconds".into(), json!(secs));
        context_patch.insert(
            "orphan_recovered_threshold_seconds".into(),
            json!(threshold),
        );

        match core
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    output: Some(output),
                    context: Some(context_patch),
                    worker_id: Some(runner.runner_id.clone()),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(updated) => recovered.push(updated),
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "orphan recovery update failed")
            }
        }
    }

    if !recovered.is_empty() {
        warn!(
            runner_id = %runner.runner_id,
            recovered = recovered.len(),
            threshold_seconds = threshold,
            "orphan recovery applied"
        );
        if core.config.orphan_heal_task {
            for task in &recovered {
                // Never heal a heal, or the loop feeds itself.
                if task.task_type == TaskKind::Heal {
                    continue;
                }
                let direction = format!(
                    "Investigate orphaned task {}: runner {} went idle while it was running. \
                     Review the task output and decide whether to retry or abandon it.",
                    task.id, runner.runner_id
                );
                let mut context = Map::new();
                context.insert("heal_for_task".into(), json!(task.id));
                if let Err(err) = core
                    .create_task(TaskCreate {
                        direction,
                        task_type: Some(TaskKind::Heal),
                        context: Some(context),
                        ..TaskCreate::default()
                    })
                    .await
                {
                    warn!(task_id = %task.id, error = %err, "heal task creation failed");
                }
            }
        }
    }

    Ok(recovered)
}
