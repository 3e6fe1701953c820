use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "turnsync.json";
pub const DATA_DIR_ENV: &str = "TURNSYNC_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnsyncConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the per-session working directories. Empty means `<data_dir>/games`.
    #[serde(default)]
    pub games_dir: PathBuf,

    #[serde(default)]
    pub servers: Vec<ServerEntry>,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_order_prefix")]
    pub order_file_prefix: String,
    #[serde(default = "default_turn_prefix")]
    pub turn_file_prefix: String,
    #[serde(default = "default_universe_file")]
    pub universe_file: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            order_file_prefix: default_order_prefix(),
            turn_file_prefix: default_turn_prefix(),
            universe_file: default_universe_file(),
        }
    }
}

impl MonitorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    #[serde(default = "default_refresh_fraction")]
    pub refresh_fraction: f64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: default_token_lifetime(),
            refresh_fraction: default_refresh_fraction(),
            safety_margin_secs: default_safety_margin(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    /// Period of the background refresh loop.
    pub fn refresh_interval(&self) -> Duration {
        self.token_lifetime().mul_f64(self.refresh_fraction)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notification_path")]
    pub path: String,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            path: default_notification_path(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            poll_interval_secs: default_poll_interval(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl NotificationConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

// Defaults
fn default_debounce() -> u64 {
    500
}
fn default_order_prefix() -> String {
    "game.x".to_string()
}
fn default_turn_prefix() -> String {
    "game.m".to_string()
}
fn default_universe_file() -> String {
    "game.xy".to_string()
}
fn default_token_lifetime() -> u64 {
    300
}
fn default_refresh_fraction() -> f64 {
    0.8
}
fn default_safety_margin() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    30
}
fn default_notification_path() -> String {
    "/api/v1/notifications".to_string()
}
fn default_initial_backoff() -> u64 {
    5
}
fn default_max_backoff() -> u64 {
    60
}
fn default_backoff_factor() -> u32 {
    2
}
fn default_poll_interval() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    60
}
fn default_write_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}

/// `TURNSYNC_DATA_DIR`, else `~/.turnsync`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|h| h.join(".turnsync"))
        .unwrap_or_else(|| PathBuf::from(".turnsync"))
}

impl TurnsyncConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let mut config: TurnsyncConfig = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
            config.data_dir = data_dir.to_path_buf();
            config.validate()?;
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            games_dir: PathBuf::new(),
            servers: Vec::new(),
            monitor: MonitorConfig::default(),
            auth: AuthConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }

    pub fn games_dir(&self) -> PathBuf {
        if self.games_dir.as_os_str().is_empty() {
            self.data_dir.join("games")
        } else {
            self.games_dir.clone()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("turnsync.sqlite3")
    }

    pub fn server_name(&self, url: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.url == url)
            .map(|s| s.name.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.debounce_ms == 0 {
            bail!("config: monitor.debounce_ms must be positive");
        }
        if self.monitor.order_file_prefix.is_empty() {
            bail!("config: monitor.order_file_prefix must not be empty");
        }
        if self.monitor.turn_file_prefix.is_empty() || self.monitor.universe_file.is_empty() {
            bail!("config: monitor turn file names must not be empty");
        }
        if self.auth.token_lifetime_secs == 0 {
            bail!("config: auth.token_lifetime_secs must be positive");
        }
        let fraction = self.auth.refresh_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            bail!(
                "config: auth.refresh_fraction must be within (0, 1), got {}",
                fraction
            );
        }
        if self.auth.request_timeout_secs == 0 {
            bail!("config: auth.request_timeout_secs must be positive");
        }

        let n = &self.notifications;
        for (name, value) in [
            ("initial_backoff_secs", n.initial_backoff_secs),
            ("max_backoff_secs", n.max_backoff_secs),
            ("poll_interval_secs", n.poll_interval_secs),
            ("read_timeout_secs", n.read_timeout_secs),
            ("write_timeout_secs", n.write_timeout_secs),
            ("handshake_timeout_secs", n.handshake_timeout_secs),
        ] {
            if value == 0 {
                bail!("config: notifications.{} must be positive", name);
            }
        }
        if n.max_backoff_secs < n.initial_backoff_secs {
            bail!("config: notifications.max_backoff_secs is below initial_backoff_secs");
        }
        if n.backoff_factor < 1 {
            bail!("config: notifications.backoff_factor must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_written_and_reloaded() {
        let tmp = TempDir::new().unwrap();
        let config = TurnsyncConfig::load_or_default(tmp.path()).unwrap();
        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.monitor.debounce_ms, 500);
        assert_eq!(config.auth.refresh_interval(), Duration::from_secs(240));
        assert_eq!(config.games_dir(), tmp.path().join("games"));

        let reloaded = TurnsyncConfig::load_or_default(tmp.path()).unwrap();
        assert_eq!(reloaded.notifications.poll_interval_secs, 30);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"servers":[{"name":"Home","url":"http://localhost:8080"}],"monitor":{"debounce_ms":250}}"#,
        )
        .unwrap();

        let config = TurnsyncConfig::load_or_default(tmp.path()).unwrap();
        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.monitor.debounce_ms, 250);
        assert_eq!(config.monitor.order_file_prefix, "game.x");
        assert_eq!(config.monitor.universe_file, "game.xy");
        assert_eq!(config.server_name("http://localhost:8080"), Some("Home"));
        assert_eq!(config.server_name("http://elsewhere"), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let tmp = TempDir::new().unwrap();
        let mut config = TurnsyncConfig::default_with_dir(tmp.path());
        assert!(config.validate().is_ok());

        config.auth.refresh_fraction = 1.0;
        assert!(config.validate().is_err());
        config.auth.refresh_fraction = 0.8;

        config.notifications.max_backoff_secs = 1;
        assert!(config.validate().is_err());
        config.notifications.max_backoff_secs = 60;

        config.monitor.order_file_prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparsable_file_names_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        let err = TurnsyncConfig::load_or_default(tmp.path()).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("failed to parse"));
        assert!(message.contains(&path.display().to_string()));
    }
}
