//! Engine configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILCORE_CONFIG` (environment variable)
//! 2. `~/.config/mailcore/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailcore\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MailError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    /// Subject cleaning.
    pub subjects: SubjectConfig,
    /// Classifier dictionary extensions.
    pub classifier: ClassifierConfig,
    pub threading: ThreadingConfig,
    /// Outbound delivery.
    pub transport: TransportConfig,
    /// Event fan-out.
    pub events: EventsConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Extra reply/forward subject markers, e.g. `["odp", "tr"]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    pub extra_prefixes: Vec<String>,
}

/// Additions to the built-in classifier dictionaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Domains treated as free-mail providers (never internal).
    pub extra_free_mail_domains: Vec<String>,
    /// Local parts treated as role accounts (bulk senders).
    pub extra_role_accounts: Vec<String>,
    /// Subject phrases that mark a delivery failure.
    pub extra_bounce_phrases: Vec<String>,
}

/// Thread resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Record orphan references for parents not seen yet.
    pub record_orphans: bool,
}

/// Outbound transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound for one SMTP round trip, in seconds.
    pub timeout_secs: u64,
    /// Name sent in `EHLO`; the local hostname when unset.
    pub hello_name: Option<String>,
}

/// Event publication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded channel capacity.
    pub capacity: usize,
    /// Attempts before an event is dropped.
    pub publish_retries: u32,
    /// Pause between attempts, in milliseconds.
    pub retry_backoff_ms: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            record_orphans: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            hello_name: None,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            publish_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl EventsConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match load_config_from(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded config");
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load config, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Read and parse one configuration file.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| MailError::io(path, e))?;
    toml::from_str::<Config>(&contents).map_err(|e| MailError::Config(e.to_string()))
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILCORE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailcore").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailcore")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailcore.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert!(cfg.threading.record_orphans);
        assert_eq!(cfg.transport.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.events.capacity, 1024);
        assert!(cfg.subjects.extra_prefixes.is_empty());
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let mut cfg = Config::default();
        cfg.classifier.extra_free_mail_domains = vec!["mail.example".into()];
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.classifier.extra_free_mail_domains, vec!["mail.example"]);
        assert_eq!(parsed.transport.timeout_secs, cfg.transport.timeout_secs);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[subjects]
extra_prefixes = ["odp"]

[transport]
timeout_secs = 5
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.subjects.extra_prefixes, vec!["odp"]);
        assert_eq!(cfg.transport.timeout_secs, 5);
        assert_eq!(cfg.events.publish_retries, 3);
        assert_eq!(cfg.general.log_level, "warn");
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[threading]\nrecord_orphans = false\n").expect("write");
        let cfg = load_config_from(&path).expect("load");
        assert!(!cfg.threading.record_orphans);
    }

    #[test]
    fn test_load_config_from_rejects_bad_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transport\ntimeout_secs = ").expect("write");
        assert!(matches!(load_config_from(&path), Err(MailError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let cfg = TransportConfig {
            timeout_secs: 0,
            hello_name: None,
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(1));
    }
}
