//! TOML configuration and the key/value settings source.
//!
//! Configuration is layered: compiled-in defaults, then a TOML file found via
//! `MRREPORTS_CONFIG` or `/etc/mrreports/mrreports.toml`. Secrets and feature
//! flags live in the free-form `[settings]` table, and each entry can be
//! overridden by an `MRREPORTS_SETTING_<KEY>` environment variable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable that names the config file.
pub const CONFIG_ENV: &str = "MRREPORTS_CONFIG";

/// Prefix for per-setting environment overrides.
pub const SETTING_ENV_PREFIX: &str = "MRREPORTS_SETTING_";

/// Feature flag gating computed parameter defaults.
pub const ALLOW_COMPUTED_DEFAULTS: &str = "ALLOW_COMPUTED_DEFAULTS";

/// Slack a lease must leave beyond the render and email timeouts combined.
pub const LEASE_MARGIN_SECS: u64 = 30;

/// Key/value lookup for secrets and feature flags.
pub trait SettingsSource: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;

    /// Interpret a setting as a boolean flag. Unset means `false`.
    fn flag(&self, key: &str) -> bool {
        matches!(
            self.lookup(key).as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

/// In-memory settings, used by tests and embedding callers.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: HashMap<String, String>,
}

impl StaticSettings {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SettingsSource for StaticSettings {
    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the mrreports process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Reject settings under which a delivery can outlive its row lease.
    pub fn validate(&self) -> Result<()> {
        let needed = self.render.timeout_secs + self.email.timeout_secs + LEASE_MARGIN_SECS;
        if self.scheduler.lease_secs < needed {
            anyhow::bail!(
                "scheduler.lease_secs ({}) must be at least render.timeout_secs + email.timeout_secs + {} ({})",
                self.scheduler.lease_secs,
                LEASE_MARGIN_SECS,
                needed
            );
        }
        Ok(())
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `MRREPORTS_CONFIG`.
    /// 2. `/etc/mrreports/mrreports.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MRREPORTS_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/mrreports/mrreports.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

impl SettingsSource for AppConfig {
    fn lookup(&self, key: &str) -> Option<String> {
        let env_key = format!("{}{}", SETTING_ENV_PREFIX, key.to_ascii_uppercase());
        std::env::var(env_key)
            .ok()
            .or_else(|| self.settings.get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/mrreports.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Crypto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Settings key holding the passphrase for encrypted columns.
    pub passphrase_setting: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            passphrase_setting: "SECRET_KEY".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Outgoing email envelope settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Public base URL of the report site, used for links in emails.
    pub base_url: Option<String>,
    /// Sender address. Empty means "send from the recipient's own address".
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Base URL of the render service. Unset disables delivery.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 120,
        }
    }
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub api_base_url: String,
    /// Settings key holding the email API token.
    pub auth_token_setting: String,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8025".into(),
            auth_token_setting: "EMAIL_API_TOKEN".into(),
            timeout_secs: 30,
        }
    }
}

impl EmailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Row lease tuning for the subscription executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a claimed lease stays valid if its holder dies.
    pub lease_secs: u64,
    /// How long a second attempt waits for a held lease before giving up.
    pub lock_wait_secs: u64,
    /// Poll interval while waiting for a lease.
    pub lock_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_secs: 900,
            lock_wait_secs: 600,
            lock_poll_ms: 250,
        }
    }
}

impl SchedulerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `info`, `debug`, ... Overridden by `RUST_LOG`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.crypto.passphrase_setting, "SECRET_KEY");
        assert_eq!(cfg.scheduler.lease_secs, 900);
        assert!(cfg.render.base_url.is_none());
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [render]
            base_url = "http://render.local"

            [settings]
            SECRET_KEY = "abc"
            ALLOW_COMPUTED_DEFAULTS = "true"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.base_url.as_deref(), Some("http://render.local"));
        assert_eq!(cfg.render.timeout_secs, 120);
        assert_eq!(cfg.database.path, PathBuf::from("data/mrreports.db"));
        assert_eq!(cfg.lookup("SECRET_KEY").as_deref(), Some("abc"));
        assert!(cfg.flag(ALLOW_COMPUTED_DEFAULTS));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mrreports.toml");
        std::fs::write(&path, "[scheduler]\nlease_secs = 600\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.scheduler.lease(), Duration::from_secs(600));
        assert_eq!(cfg.scheduler.lock_poll_ms, 250);
    }

    #[test]
    fn test_lease_shorter_than_timeouts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mrreports.toml");
        std::fs::write(
            &path,
            "[scheduler]\nlease_secs = 60\n\n[render]\ntimeout_secs = 120\n",
        )
        .unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("lease_secs"));

        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.scheduler.lease_secs = cfg.render.timeout_secs + cfg.email.timeout_secs;
        assert!(cfg.validate().is_err());
        cfg.scheduler.lease_secs += LEASE_MARGIN_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AppConfig::load(Path::new("/nonexistent/mrreports.toml")).is_err());
    }

    #[test]
    fn test_flag_parsing() {
        let s = StaticSettings::from_pairs([("A", "Yes"), ("B", "0"), ("C", "on")]);
        assert!(s.flag("A"));
        assert!(!s.flag("B"));
        assert!(s.flag("C"));
        assert!(!s.flag("D"));
    }
}
