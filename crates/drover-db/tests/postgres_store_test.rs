//! PostgreSQL backend tests against a shared container database.

use chrono::Utc;
use serde_json::json;

use drover_db::models::{Runner, RunnerStatus, Task, TaskContext, TaskKind, TaskStatus, UsageEvent};
use drover_db::postgres::{PgRunnerStore, PgTaskStore, PgUsageLog};
use drover_db::store::{RunnerStore, TaskFilter, TaskStore, UsageLog};
use drover_test_utils::{create_test_db, drop_test_db};

fn task(id: &str, status: TaskStatus) -> Task {
    let mut context = TaskContext::new();
    context.set("route_decision", json!({"is_paid_provider": false}));
    Task {
        id: id.to_owned(),
        direction: "persisted direction".to_owned(),
        task_type: TaskKind::Impl,
        status,
        model: "openrouter/free".to_owned(),
        command: "aider --message \"persisted direction\" --model openrouter/free".to_owned(),
        tier: "openrouter".to_owned(),
        output: None,
        context,
        progress_pct: None,
        current_step: None,
        decision_prompt: None,
        decision: None,
        target_state: Some("service deployed".to_owned()),
        success_evidence: Some(vec!["green build".to_owned()]),
        abort_evidence: None,
        observation_window_sec: Some(3600),
        claimed_by: None,
        claimed_at: None,
        created_at: Utc::now(),
        updated_at: None,
        started_at: None,
    }
}

#[tokio::test]
async fn upsert_get_roundtrip_preserves_fields() {
    let (pool, db_name) = create_test_db().await;
    let store = PgTaskStore::new(pool.clone());

    let mut original = task("task_0000000000000001", TaskStatus::Pending);
    original.context.set("session_key", "sess-pg");
    store.upsert(&original).await.unwrap();

    let loaded = store
        .get("task_0000000000000001")
        .await
        .unwrap()
        .expect("task should exist");
    assert_eq!(loaded.direction, original.direction);
    assert_eq!(loaded.task_type, TaskKind::Impl);
    assert_eq!(loaded.status, TaskStatus::Pending);
    assert_eq!(loaded.target_state.as_deref(), Some("service deployed"));
    assert_eq!(loaded.success_evidence, Some(vec!["green build".to_owned()]));
    assert_eq!(loaded.observation_window_sec, Some(3600));
    assert_eq!(loaded.context.session_key(), Some("sess-pg"));
    assert!(!loaded.context.route_is_paid());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn upsert_replaces_existing_row() {
    let (pool, db_name) = create_test_db().await;
    let store = PgTaskStore::new(pool.clone());

    let mut t = task("task_0000000000000002", TaskStatus::Pending);
    store.upsert(&t).await.unwrap();
    t.status = TaskStatus::Failed;
    t.output = Some("it broke".to_owned());
    t.claimed_by = Some("runner-1".to_owned());
    store.upsert(&t).await.unwrap();

    let loaded = store.get(&t.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert_eq!(loaded.output.as_deref(), Some("it broke"));
    assert_eq!(loaded.claimed_by.as_deref(), Some("runner-1"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_filters_and_counts() {
    let (pool, db_name) = create_test_db().await;
    let store = PgTaskStore::new(pool.clone());

    for i in 0..3 {
        store
            .upsert(&task(&format!("task_000000000000001{i}"), TaskStatus::Pending))
            .await
            .unwrap();
    }
    store
        .upsert(&task("task_0000000000000020", TaskStatus::Failed))
        .await
        .unwrap();

    let (items, total) = store
        .list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            limit: 2,
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(total, 3);

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.get(&TaskStatus::Pending), Some(&3));
    assert_eq!(counts.get(&TaskStatus::Failed), Some(&1));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn session_key_and_claimed_scans() {
    let (pool, db_name) = create_test_db().await;
    let store = PgTaskStore::new(pool.clone());

    let mut with_session = task("task_0000000000000030", TaskStatus::Running);
    with_session.context.set("session_key", "sess-scan");
    with_session.claimed_by = Some("runner-scan".to_owned());
    store.upsert(&with_session).await.unwrap();
    store
        .upsert(&task("task_0000000000000031", TaskStatus::Running))
        .await
        .unwrap();

    let found = store.find_by_session_key("sess-scan").await.unwrap();
    assert_eq!(found.map(|t| t.id), Some("task_0000000000000030".to_owned()));
    assert!(store.find_by_session_key("sess-none").await.unwrap().is_none());

    let claimed = store.list_running_claimed_by("runner-scan").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "task_0000000000000030");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn restart_returns_same_snapshot() {
    let (pool, db_name) = create_test_db().await;

    {
        let store = PgTaskStore::new(pool.clone());
        store
            .upsert(&task("task_0000000000000040", TaskStatus::Completed))
            .await
            .unwrap();
    }

    // A fresh store over the same database sees the rows (restart case).
    let reopened = PgTaskStore::new(pool.clone());
    let loaded = reopened
        .get("task_0000000000000040")
        .await
        .unwrap()
        .expect("row survives the store instance");
    assert_eq!(loaded.status, TaskStatus::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn runner_store_roundtrip_and_ordering() {
    let (pool, db_name) = create_test_db().await;
    let store = PgRunnerStore::new(pool.clone());

    let now = Utc::now();
    for (i, offset) in [(1i64, 0i64), (2, 30)] {
        let at = now + chrono::Duration::seconds(offset);
        let runner = Runner {
            runner_id: format!("runner-{i}"),
            status: RunnerStatus::Idle,
            host: "host".to_owned(),
            pid: Some(100 + i),
            version: "0.1.0".to_owned(),
            active_task_id: String::new(),
            active_run_id: String::new(),
            last_error: String::new(),
            metadata: serde_json::from_value(json!({"capabilities": {"gpu": false}})).unwrap(),
            lease_expires_at: at + chrono::Duration::seconds(90),
            last_seen_at: at,
            created_at: at,
            updated_at: at,
        };
        store.upsert(&runner).await.unwrap();
    }

    let listed = store.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].runner_id, "runner-2");
    assert_eq!(listed[1].metadata["capabilities"]["gpu"], json!(false));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn usage_log_appends_and_orders() {
    let (pool, db_name) = create_test_db().await;
    let log = PgUsageLog::new(pool.clone());

    let base = Utc::now();
    for i in 0..3 {
        let event = UsageEvent {
            event_id: format!("evt_pg_{i}"),
            source: "worker".to_owned(),
            endpoint: "tool:openrouter.chat_completion".to_owned(),
            method: "RUN".to_owned(),
            status_code: 200,
            runtime_ms: 12.5,
            runtime_cost_usd: 0.0,
            metadata: serde_json::from_value(json!({"task_id": "task_x"})).unwrap(),
            recorded_at: base + chrono::Duration::seconds(i),
        };
        log.append(&event).await.unwrap();
    }

    let recent = log.recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].event_id, "evt_pg_2");
    assert_eq!(recent[0].metadata["task_id"], json!("task_x"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
