//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded bearer token required by `POST /agent/tasks/{id}/execute`.
    /// Empty disables the check.
    #[serde(default)]
    pub api_token: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token generation
// -----------------------------------------------------------------------

/// Generate a random API token: 32 random bytes, hex-encoded (64 chars).
pub fn generate_api_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub db_config: DbConfig,
    pub api_token: Option<String>,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. The config file is optional; env-only deployments
    /// (containers) never write one.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let db_config = if let Some(url) = cli_db_url {
            DbConfig::new(url)
        } else if std::env::var("DROVER_DATABASE_URL").is_ok()
            || std::env::var("AGENT_TASKS_DATABASE_URL").is_ok()
        {
            DbConfig::from_env()
        } else if let Some(file) = &file {
            DbConfig::new(&file.database.url)
        } else {
            DbConfig::from_env()
        };

        let api_token = std::env::var("DROVER_API_TOKEN")
            .ok()
            .or_else(|| file.map(|f| f.auth.api_token))
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());

        Ok(Self {
            db_config,
            api_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_api_token_is_64_hex_chars() {
        let token = generate_api_token();
        assert_eq!(token.len(), 64);
        assert!(
            token.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {token}"
        );
    }

    #[test]
    fn generate_api_token_is_random() {
        assert_ne!(generate_api_token(), generate_api_token());
    }

    #[test]
    fn config_file_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_owned(),
            },
            auth: AuthSection {
                api_token: "abc123".to_owned(),
            },
        };
        let encoded = toml::to_string_pretty(&original).unwrap();
        let decoded: ConfigFile = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.database.url, original.database.url);
        assert_eq!(decoded.auth.api_token, original.auth.api_token);
    }

    #[test]
    fn auth_section_is_optional() {
        let decoded: ConfigFile =
            toml::from_str("[database]\nurl = \"postgresql://localhost:5432/drover\"\n").unwrap();
        assert!(decoded.auth.api_token.is_empty());
    }
}
