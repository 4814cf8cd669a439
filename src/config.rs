//! Process configuration, read from `~/.apiscope/config.yaml`
//!
//! This is host-level setup (where the database and log live, how loud the
//! log is). User-level preferences such as default headers live in the
//! stored [`Settings`](crate::models::Settings) record instead.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{APP_NAME, DATABASE_FILE, DEFAULT_SCRIPT_TIMEOUT_MS, EMBED_ORIGIN_ENV};

pub const DATA_DIR_ENV: &str = "APISCOPE_DATA_DIR";
pub const LOG_LEVEL_ENV: &str = "APISCOPE_LOG_LEVEL";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub script_timeout_ms: u64,
    /// Origin the engine runs under when embedded by a browser-style host.
    /// Only ever set from the environment.
    #[serde(skip)]
    pub embed_origin: Option<String>,
}

/// `~/.apiscope`, or `./.apiscope` without a home directory
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{}", APP_NAME))
}

impl Default for Config {
    fn default() -> Self {
        let dir = config_dir();
        Config {
            data_dir: dir.clone(),
            log_dir: dir,
            log_level: "info".to_string(),
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            embed_origin: None,
        }
    }
}

impl Config {
    /// Load the default config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file(&config_dir().join("config.yaml"))?;
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Read a YAML config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|v| !v.is_empty()) {
            self.log_level = level;
        }
        self.embed_origin = lookup(EMBED_ORIGIN_ENV).filter(|v| !v.trim().is_empty());
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}
