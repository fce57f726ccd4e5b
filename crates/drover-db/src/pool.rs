use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!("failed to connect to database at {}", config.database_url)
        })?;
    Ok(pool)
}

/// Ensure the target database exists, creating it if necessary.
///
/// Connects to the `postgres` maintenance database and issues
/// `CREATE DATABASE <name>` when the target database is absent.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;

    let maintenance_url = config.maintenance_url();

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&maintenance_url)
        .await
        .with_context(|| {
            format!(
                "failed to connect to maintenance database at {}",
                maintenance_url
            )
        })?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint_pool)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        // Database names cannot be parameterised in CREATE DATABASE, so we
        // validate the name to avoid SQL injection, then use string formatting.
        if !db_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "database name {:?} contains invalid characters",
                db_name
            );
        }
        let stmt = format!("CREATE DATABASE {db_name}");
        maint_pool
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    maint_pool.close().await;
    Ok(())
}

/// Create the orchestration tables when absent.
///
/// Idempotent `CREATE TABLE IF NOT EXISTS`, run at startup so a fresh
/// database needs no separate migration step. Existing rows become the
/// initial state.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS agent_tasks (\
             id TEXT PRIMARY KEY, \
             direction TEXT NOT NULL, \
             task_type TEXT NOT NULL, \
             status TEXT NOT NULL, \
             model TEXT NOT NULL, \
             command TEXT NOT NULL, \
             tier TEXT NOT NULL DEFAULT 'openrouter', \
             output TEXT, \
             context_json TEXT NOT NULL DEFAULT '{}', \
             progress_pct INTEGER, \
             current_step TEXT, \
             decision_prompt TEXT, \
             decision TEXT, \
             target_state TEXT, \
             success_evidence_json TEXT, \
             abort_evidence_json TEXT, \
             observation_window_sec BIGINT, \
             claimed_by TEXT, \
             claimed_at TIMESTAMPTZ, \
             created_at TIMESTAMPTZ NOT NULL, \
             updated_at TIMESTAMPTZ, \
             started_at TIMESTAMPTZ)",
        "CREATE INDEX IF NOT EXISTS agent_tasks_status_idx ON agent_tasks (status)",
        "CREATE INDEX IF NOT EXISTS agent_tasks_task_type_idx ON agent_tasks (task_type)",
        "CREATE INDEX IF NOT EXISTS agent_tasks_created_at_idx ON agent_tasks (created_at)",
        "CREATE INDEX IF NOT EXISTS agent_tasks_claimed_by_idx ON agent_tasks (claimed_by)",
        "CREATE TABLE IF NOT EXISTS agent_runners (\
             runner_id TEXT PRIMARY KEY, \
             status TEXT NOT NULL DEFAULT 'idle', \
             host TEXT NOT NULL DEFAULT '', \
             pid BIGINT, \
             version TEXT NOT NULL DEFAULT '', \
             active_task_id TEXT NOT NULL DEFAULT '', \
             active_run_id TEXT NOT NULL DEFAULT '', \
             last_error TEXT NOT NULL DEFAULT '', \
             metadata_json TEXT NOT NULL DEFAULT '{}', \
             lease_expires_at TIMESTAMPTZ NOT NULL, \
             last_seen_at TIMESTAMPTZ NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL)",
        "CREATE INDEX IF NOT EXISTS agent_runners_last_seen_idx ON agent_runners (last_seen_at)",
        "CREATE TABLE IF NOT EXISTS usage_events (\
             event_id TEXT PRIMARY KEY, \
             source TEXT NOT NULL, \
             endpoint TEXT NOT NULL, \
             method TEXT NOT NULL, \
             status_code INTEGER NOT NULL, \
             runtime_ms DOUBLE PRECISION NOT NULL, \
             runtime_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0, \
             metadata_json TEXT NOT NULL DEFAULT '{}', \
             recorded_at TIMESTAMPTZ NOT NULL)",
        "CREATE INDEX IF NOT EXISTS usage_events_recorded_at_idx ON usage_events (recorded_at)",
        "CREATE INDEX IF NOT EXISTS usage_events_endpoint_idx ON usage_events (endpoint)",
    ];

    for stmt in statements {
        pool.execute(stmt)
            .await
            .with_context(|| format!("failed to apply schema statement: {stmt}"))?;
    }

    info!("schema ensured");
    Ok(())
}
