mod config;
mod serve_cmd;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use drover_core::chat::{ChatTransport, NoopTransport, TelegramTransport};
use drover_core::clock::SystemClock;
use drover_core::codex::CodexCli;
use drover_core::config::CoreConfig;
use drover_core::lifecycle::Core;
use drover_core::provider::OpenRouterClient;
use drover_core::routing::RoutingEnv;
use drover_db::config::{DbConfig, StoreBackend};
use drover_db::file::{JsonFileRunnerStore, JsonFileTaskStore, JsonlUsageLog};
use drover_db::memory::{MemoryRunnerStore, MemoryTaskStore, MemoryUsageLog};
use drover_db::models::TaskKind;
use drover_db::postgres::{PgRunnerStore, PgTaskStore, PgUsageLog};
use drover_db::store::{RunnerStore, TaskFilter, TaskStore, UsageLog};
use drover_db::{pool, store};

use config::DroverConfig;

#[derive(Parser)]
#[command(name = "drover", about = "Agent task orchestration service")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestration HTTP service
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Show the route a task type would take (no persistence)
    Route {
        /// Task type: spec, test, impl, review, heal
        task_type: String,
        /// Executor override: claude, cursor, openclaw
        #[arg(long)]
        executor: Option<String>,
    },
    /// Task access against the configured store
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task from a direction
    Create {
        /// The direction text
        direction: String,
        /// Task type (default: impl)
        #[arg(long, default_value = "impl")]
        task_type: String,
    },
    /// Show one task as JSON
    Show {
        /// Task ID
        task_id: String,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Max rows
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Storage handles for the selected backend.
struct Stores {
    tasks: Arc<dyn TaskStore>,
    runners: Arc<dyn RunnerStore>,
    usage: Arc<dyn UsageLog>,
}

async fn open_stores(cli_db_url: Option<&str>) -> Result<Stores> {
    let backend = match cli_db_url {
        Some(url) => StoreBackend::Postgres(url.to_owned()),
        None => StoreBackend::from_env(),
    };

    match backend {
        StoreBackend::Memory => {
            tracing::info!("task store backend: memory");
            Ok(Stores {
                tasks: Arc::new(MemoryTaskStore::new()),
                runners: Arc::new(MemoryRunnerStore::new()),
                usage: Arc::new(MemoryUsageLog::new()),
            })
        }
        StoreBackend::File(path) => {
            tracing::info!(path = %path.display(), "task store backend: json file");
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "drover".to_owned());
            let dir = path.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
            let tasks = JsonFileTaskStore::open(&path)
                .await
                .map_err(store_open_err)?;
            let runners = JsonFileRunnerStore::open(dir.join(format!("{stem}_runners.json")))
                .await
                .map_err(store_open_err)?;
            let usage = JsonlUsageLog::new(dir.join(format!("{stem}_usage.jsonl")));
            Ok(Stores {
                tasks: Arc::new(tasks),
                runners: Arc::new(runners),
                usage: Arc::new(usage),
            })
        }
        StoreBackend::Postgres(url) => {
            tracing::info!("task store backend: postgres");
            let db_config = DbConfig::new(url);
            pool::ensure_database_exists(&db_config).await?;
            let db_pool = pool::create_pool(&db_config).await?;
            pool::ensure_schema(&db_pool).await?;
            Ok(Stores {
                tasks: Arc::new(PgTaskStore::new(db_pool.clone())),
                runners: Arc::new(PgRunnerStore::new(db_pool.clone())),
                usage: Arc::new(PgUsageLog::new(db_pool)),
            })
        }
    }
}

fn store_open_err(err: store::StoreError) -> anyhow::Error {
    anyhow::anyhow!("failed to open file-backed store: {err}")
}

/// Assemble the controller from the environment.
async fn build_core(cli_db_url: Option<&str>) -> Result<Arc<Core>> {
    let core_config = CoreConfig::from_env();
    let stores = open_stores(cli_db_url).await?;

    let transport: Arc<dyn ChatTransport> = match &core_config.chat.bot_token {
        Some(token) => Arc::new(TelegramTransport::new(token.clone())),
        None => Arc::new(NoopTransport),
    };

    Ok(Core::new(
        core_config,
        RoutingEnv::from_env(),
        Arc::new(SystemClock),
        stores.tasks,
        stores.runners,
        stores.usage,
        Arc::new(OpenRouterClient::from_env()),
        Arc::new(CodexCli::new()),
        transport,
    ))
}

/// Execute the `drover init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let api_token = config::generate_api_token();
    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            api_token: api_token.clone(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.api_token = {}...{}", &api_token[..8], &api_token[56..]);
    println!();
    println!("Next: run `drover serve` to start the service.");

    Ok(())
}

async fn cmd_route(core: &Core, task_type: &str, executor: Option<&str>) -> Result<()> {
    let kind: TaskKind = task_type
        .parse()
        .with_context(|| format!("invalid task type: {task_type}"))?;
    let decision = core.route_preview(kind, executor);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn run_task_command(core: &Core, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Create {
            direction,
            task_type,
        } => {
            let kind: TaskKind = task_type
                .parse()
                .with_context(|| format!("invalid task type: {task_type}"))?;
            let task = core
                .create_task(drover_core::lifecycle::TaskCreate {
                    direction,
                    task_type: Some(kind),
                    ..Default::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Show { task_id } => {
            match core.get_task(&task_id).await? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => anyhow::bail!("task {task_id} not found"),
            }
        }
        TaskCommands::List { status, limit } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    raw.parse()
                        .with_context(|| format!("invalid status: {raw}"))?,
                ),
                None => None,
            };
            let (tasks, total) = core
                .list_tasks(&TaskFilter {
                    status,
                    limit: limit.clamp(1, 100),
                    ..TaskFilter::default()
                })
                .await?;
            println!("{total} task(s)");
            for task in tasks {
                println!(
                    "{}  {:<14}  {:<6}  {}",
                    task.id,
                    task.status.to_string(),
                    task.task_type.to_string(),
                    task.direction.chars().take(60).collect::<String>()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::Serve { bind, port } => {
            let resolved = DroverConfig::resolve(cli.database_url.as_deref())?;
            // A CLI flag or an explicit AGENT_TASKS_USE_DB pins the resolved
            // PostgreSQL URL; otherwise the backend comes from the env alone.
            let use_db = std::env::var("AGENT_TASKS_USE_DB")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false);
            let db_override = (cli.database_url.is_some() || use_db)
                .then(|| resolved.db_config.database_url.clone());
            let core = build_core(db_override.as_deref()).await?;
            serve_cmd::run_serve(core, resolved.api_token, &bind, port).await?;
        }
        Commands::Route {
            task_type,
            executor,
        } => {
            let core = build_core(cli.database_url.as_deref()).await?;
            cmd_route(&core, &task_type, executor.as_deref()).await?;
        }
        Commands::Task { command } => {
            let core = build_core(cli.database_url.as_deref()).await?;
            run_task_command(&core, command).await?;
        }
    }

    Ok(())
}
