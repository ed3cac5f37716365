use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Permanent home of merged and simple-path uploads.
    pub upload_dir: PathBuf,
    /// Transient per-task chunk directories.
    #[serde(default)]
    pub chunk_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn chunk_dir(&self) -> PathBuf {
        self.chunk_dir
            .clone()
            .unwrap_or_else(|| self.upload_dir.join("chunks"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Largest chunk accepted. `0` means one chunk sized to the whole file.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_upload_size: default_max_upload_size(),
            retention_hours: default_retention_hours(),
            progress_ttl_secs: default_progress_ttl_secs(),
        }
    }
}

impl UploadConfig {
    pub fn retention(&self) -> chrono::Duration {
        hours(self.retention_hours)
    }

    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }
}

fn default_max_upload_size() -> u64 {
    7 * 1024 * 1024 * 1024
}
fn default_retention_hours() -> u64 {
    24
}
fn default_progress_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC key for bearer tokens.
    pub secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

fn default_token_ttl_hours() -> u64 {
    24
}

impl AuthConfig {
    pub fn token_ttl(&self) -> chrono::Duration {
        hours(self.token_ttl_hours)
    }
}

/// Upper bound for every hour-valued setting (100 years).
pub const MAX_HOURS: u64 = 100 * 365 * 24;

/// Clamped to [`MAX_HOURS`]; `validate` rejects larger values up front.
fn hours(value: u64) -> chrono::Duration {
    chrono::Duration::hours(value.min(MAX_HOURS) as i64)
}

impl Config {
    /// A self-contained configuration rooted at `root`, used by tests and
    /// for quick local runs.
    pub fn rooted_at(root: &Path, bind: &str, secret: &str) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("share.sqlite"),
            },
            storage: StorageConfig {
                upload_dir: root.join("uploads"),
                chunk_dir: Some(root.join("chunks")),
            },
            upload: UploadConfig::default(),
            server: ServerConfig {
                bind: bind.to_string(),
            },
            auth: AuthConfig {
                secret: secret.to_string(),
                token_ttl_hours: default_token_ttl_hours(),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.auth.secret.trim().is_empty() {
        anyhow::bail!("auth.secret must not be empty");
    }

    if config.upload.max_upload_size == 0 {
        anyhow::bail!("upload.max_upload_size must be > 0");
    }

    if config.upload.retention_hours == 0 {
        anyhow::bail!("upload.retention_hours must be > 0");
    }

    if config.upload.retention_hours > MAX_HOURS {
        anyhow::bail!("upload.retention_hours must be <= {}", MAX_HOURS);
    }

    if config.auth.token_ttl_hours == 0 || config.auth.token_ttl_hours > MAX_HOURS {
        anyhow::bail!("auth.token_ttl_hours must be between 1 and {}", MAX_HOURS);
    }

    if config.storage.chunk_dir() == config.storage.upload_dir {
        anyhow::bail!("storage.chunk_dir must differ from storage.upload_dir");
    }

    Ok(())
}
