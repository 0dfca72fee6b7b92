//! Runtime configuration.

use actlog_core::{
    ConsultationGate, QueueWriter, StoreOptions, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_MAX_QUEUE_BYTES,
    DEFAULT_PROTECTED_TOOLS,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `data_dir`.
pub const DATA_DIR_ENV: &str = "ACTLOG_DATA_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/actlog.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/queue`.
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/gate/consulted.json`.
    #[serde(default)]
    pub gate_marker_path: Option<PathBuf>,
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_gate_ttl")]
    pub gate_ttl_secs: u64,
    #[serde(default = "default_protected_tools")]
    pub protected_tools: Vec<String>,
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("actlog")
}

fn default_drain_interval() -> u64 {
    5
}

fn default_flush_interval() -> u64 {
    10
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_gate_ttl() -> u64 {
    300
}

fn default_protected_tools() -> Vec<String> {
    DEFAULT_PROTECTED_TOOLS.iter().map(|t| t.to_string()).collect()
}

fn default_max_entry_bytes() -> usize {
    DEFAULT_MAX_ENTRY_BYTES
}

fn default_max_queue_bytes() -> u64 {
    DEFAULT_MAX_QUEUE_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            queue_dir: None,
            gate_marker_path: None,
            drain_interval_secs: default_drain_interval(),
            flush_interval_secs: default_flush_interval(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
            gate_ttl_secs: default_gate_ttl(),
            protected_tools: default_protected_tools(),
            max_entry_bytes: default_max_entry_bytes(),
            max_queue_bytes: default_max_queue_bytes(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load config from the user config directory or fall back to defaults.
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Config::default())
    }

    /// `<config dir>/actlog/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("actlog").join("config.toml"))
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    /// Config rooted at `data_dir` with everything else defaulted.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("actlog.db"))
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.queue_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("queue"))
    }

    pub fn gate_marker_path(&self) -> PathBuf {
        self.gate_marker_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("gate").join("consulted.json"))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            cache_capacity: self.cache_capacity,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    pub fn gate(&self) -> ConsultationGate {
        ConsultationGate::new(self.gate_marker_path())
            .with_ttl(Duration::from_secs(self.gate_ttl_secs))
            .with_protected_tools(self.protected_tools.iter().cloned())
    }

    pub fn queue_writer(&self) -> QueueWriter {
        QueueWriter::new(self.queue_dir()).with_limits(self.max_entry_bytes, self.max_queue_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.drain_interval_secs, 5);
        assert_eq!(config.flush_interval_secs, 10);
        assert_eq!(config.gate_ttl_secs, 300);
        assert_eq!(config.max_entry_bytes, 4096);
        assert_eq!(config.protected_tools, vec!["Glob", "Grep", "Task"]);
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = Config::for_data_dir("/var/lib/actlog");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/actlog/actlog.db"));
        assert_eq!(config.queue_dir(), PathBuf::from("/var/lib/actlog/queue"));
        assert_eq!(
            config.gate_marker_path(),
            PathBuf::from("/var/lib/actlog/gate/consulted.json")
        );
    }

    #[test]
    fn test_explicit_paths_win() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/data"
            db_path = "/fast/actlog.db"
            drain_interval_secs = 2
            protected_tools = ["WebFetch"]
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/fast/actlog.db"));
        assert_eq!(config.queue_dir(), PathBuf::from("/data/queue"));
        assert_eq!(config.drain_interval(), Duration::from_secs(2));
        assert!(config.gate().is_protected("WebFetch"));
        assert!(!config.gate().is_protected("Grep"));
    }

    #[test]
    fn test_env_overrides_data_dir() {
        let config = Config::for_data_dir("/from/file")
            .with_env_from(|key| (key == DATA_DIR_ENV).then(|| "/from/env".to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/from/env"));

        let unchanged = Config::for_data_dir("/from/file").with_env_from(|_| Some("  ".to_string()));
        assert_eq!(unchanged.data_dir, PathBuf::from("/from/file"));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config = toml::from_str("drain_interval_secs = 0\nflush_interval_secs = 0").unwrap();
        assert_eq!(config.drain_interval(), Duration::from_secs(1));
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_capacity = 7\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.store_options().cache_capacity, 7);
        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());
    }
}
