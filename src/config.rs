//! # Configuration
//!
//! Hierarchical configuration loading, merged from a base `config.toml`,
//! an optional git-ignored `config.local.toml`, and `SYNCBRIDGE_`-prefixed
//! environment variables. `Config` is the single explicit
//! parameter the lifecycle controller's constructor takes; there is no
//! global/singleton directory or logger.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub script: ScriptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Script-engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Directory beneath which named backend plug-ins are located
    ///. `None` means every `script()` load that names a
    /// driver-output backend will fail to locate it.
    #[serde(default)]
    pub backend_dir: Option<PathBuf>,

    /// Directory for the embedded database file; `None` uses an
    /// in-memory store.
    #[serde(default)]
    pub db_dir: Option<PathBuf>,

    /// Period for the upstream polling suspension point.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig {
            backend_dir: None,
            db_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Logging sink configuration, consumed by [`crate::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `trace`/`debug`/`info`/`warn`/`error`, or any `tracing_subscriber`
    /// `EnvFilter` directive string.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Newline-delimited JSON instead of the human-readable formatter.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Merge `config.toml`, `config.local.toml`, and `SYNCBRIDGE_`
    /// environment variables, in that order.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("SYNCBRIDGE_").split("__"))
            .extract()
    }

    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SYNCBRIDGE_").split("__"))
            .extract()
    }

    /// The on-disk file name the translator will open for this
    /// configuration's `db_dir` and a given whole-script hash.
    pub fn db_file_name(hash: u32) -> String {
        format!("pulley_{}.sqlite3", crate::lexhash::hash_hex(hash))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            script: ScriptConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_in_memory_database_and_one_second_poll() {
        let config = Config::default();
        assert!(config.script.db_dir.is_none());
        assert_eq!(config.script.poll_interval_ms, 1000);
    }

    #[test]
    fn db_file_name_matches_hash_hex_format() {
        assert_eq!(Config::db_file_name(0xdead_beef), "pulley_deadbeef.sqlite3");
    }
}
