use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `DROVER_DATABASE_URL` environment variable (then the
/// task-store specific `AGENT_TASKS_DATABASE_URL`), falling back to
/// `postgresql://localhost:5432/drover` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/drover";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let database_url = env::var("DROVER_DATABASE_URL")
            .or_else(|_| env::var("AGENT_TASKS_DATABASE_URL"))
            .unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does not
    /// yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

fn truthy(raw: Option<String>) -> Option<bool> {
    raw.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Which storage backend the service runs on. A deployment choice, resolved
/// once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process maps; state dies with the process.
    Memory,
    /// JSON documents at the given path prefix.
    File(PathBuf),
    /// Shared PostgreSQL at the given DSN.
    Postgres(String),
}

impl StoreBackend {
    /// Resolve the backend from the environment.
    ///
    /// - `AGENT_TASKS_USE_DB` truthy (or unset with a DSN present in
    ///   `AGENT_TASKS_DATABASE_URL`/`DROVER_DATABASE_URL`) selects PostgreSQL.
    /// - otherwise `AGENT_TASKS_PERSIST` truthy selects the JSON file at
    ///   `AGENT_TASKS_PATH` (default `drover_tasks.json`).
    /// - otherwise in-memory.
    pub fn from_env() -> Self {
        let dsn = env::var("AGENT_TASKS_DATABASE_URL")
            .or_else(|_| env::var("DROVER_DATABASE_URL"))
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());

        let use_db = match truthy(env::var("AGENT_TASKS_USE_DB").ok()) {
            Some(explicit) => explicit,
            None => dsn.is_some(),
        };
        if use_db {
            if let Some(dsn) = dsn {
                return Self::Postgres(dsn);
            }
        }

        if truthy(env::var("AGENT_TASKS_PERSIST").ok()).unwrap_or(false) {
            let path = env::var("AGENT_TASKS_PATH")
                .ok()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "drover_tasks.json".to_owned());
            return Self::File(PathBuf::from(path));
        }

        Self::Memory
    }
}
