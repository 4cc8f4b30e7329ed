// ABOUTME: TOML settings for both roles, with CLI overrides and validation
// ABOUTME: Converts the file sections into session, tracker and publisher configs

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::delta::Framing;
use crate::store::TableSpec;
use crate::tracker::{TrackerConfig, WatermarkStrategy};
use crate::transport::{has_wildcards, QoS, ReconnectPolicy, SessionConfig};
use crate::sync::PublisherConfig;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "mqtt-replicator.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Publisher,
    Subscriber,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publisher" => Ok(Role::Publisher),
            "subscriber" => Ok(Role::Subscriber),
            other => Err(format!(
                "unknown role '{}', expected 'publisher' or 'subscriber'",
                other
            )),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub max_packet_size: usize,
    pub qos: QoS,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "mqtt-replicator".to_string(),
            keep_alive_secs: 30,
            max_packet_size: 16 * 1024 * 1024,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl std::fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id_prefix", &self.client_id_prefix)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("max_packet_size", &self.max_packet_size)
            .field("qos", &self.qos)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub backoff_secs: u64,
    /// Unset means retry forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            backoff_secs: 3,
            max_attempts: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `postgres://...`, `sqlite://path`, a `.db`/`.sqlite` path or `:memory:`.
    pub url: Option<String>,
    pub allow_self_signed_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub strategy: WatermarkStrategy,
    pub startup_skew_secs: u64,
    pub lookback_secs: u64,
    /// Persist the watermark here between runs.
    pub state_path: Option<PathBuf>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            strategy: WatermarkStrategy::default(),
            startup_skew_secs: 60,
            lookback_secs: 0,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Publisher: file published whenever it changes.
    pub publish_path: Option<PathBuf>,
    /// Subscriber: directory for received files.
    pub save_dir: Option<PathBuf>,
}

/// Everything read from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub role: Role,
    pub topic: String,
    pub poll_interval_secs: u64,
    pub framing: Framing,
    pub broker: BrokerSettings,
    pub reconnect: ReconnectSettings,
    pub store: StoreSettings,
    pub table: TableSpec,
    pub tracker: TrackerSettings,
    pub files: FileSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::default(),
            topic: "db/sync".to_string(),
            poll_interval_secs: 12,
            framing: Framing::default(),
            broker: BrokerSettings::default(),
            reconnect: ReconnectSettings::default(),
            store: StoreSettings::default(),
            table: TableSpec::default(),
            tracker: TrackerSettings::default(),
            files: FileSettings::default(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub role: Option<Role>,
    pub topic: Option<String>,
    pub store_url: Option<String>,
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub broker_password: Option<String>,
    pub allow_self_signed_certs: bool,
}

impl Settings {
    /// Load settings from `path`, or from [`DEFAULT_CONFIG_FILE`] when no
    /// path is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(role) = overrides.role {
            self.role = role;
        }
        if let Some(topic) = overrides.topic {
            self.topic = topic;
        }
        if let Some(url) = overrides.store_url {
            self.store.url = Some(url);
        }
        if let Some(host) = overrides.broker_host {
            self.broker.host = host;
        }
        if let Some(port) = overrides.broker_port {
            self.broker.port = port;
        }
        if let Some(password) = overrides.broker_password {
            self.broker.password = Some(password);
        }
        if overrides.allow_self_signed_certs {
            self.store.allow_self_signed_certs = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!("topic cannot be empty");
        }
        if self.role == Role::Publisher && has_wildcards(&self.topic) {
            bail!(
                "publisher topic '{}' cannot contain the wildcards '+' or '#'",
                self.topic
            );
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.reconnect.backoff_secs == 0 {
            bail!("reconnect.backoff_secs must be greater than zero");
        }
        if self.reconnect.connect_timeout_secs == 0 {
            bail!("reconnect.connect_timeout_secs must be greater than zero");
        }
        if self.reconnect.max_attempts == Some(0) {
            bail!("reconnect.max_attempts must be at least 1 when set");
        }
        if self.broker.host.trim().is_empty() {
            bail!("broker.host cannot be empty");
        }
        if self.broker.client_id_prefix.trim().is_empty() {
            bail!("broker.client_id_prefix cannot be empty");
        }
        if self.broker.max_packet_size == 0 {
            bail!("broker.max_packet_size must be greater than zero");
        }
        self.table.validate().context("Invalid [table] section")?;
        Ok(())
    }

    /// The store URL; required by every command that touches a store.
    pub fn store_url(&self) -> Result<&str> {
        self.store.url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No store URL configured. Set [store] url in the config file, \
                 pass --store-url or set MQTT_REPLICATOR_STORE_URL"
            )
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.broker.host.clone(),
            port: self.broker.port,
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            client_id_prefix: self.broker.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            max_packet_size: self.broker.max_packet_size,
            qos: self.broker.qos,
            reconnect: ReconnectPolicy {
                backoff: Duration::from_secs(self.reconnect.backoff_secs),
                max_attempts: self.reconnect.max_attempts,
                connect_timeout: Duration::from_secs(self.reconnect.connect_timeout_secs),
            },
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            table: self.table.clone(),
            startup_skew: Duration::from_secs(self.tracker.startup_skew_secs),
            strategy: self.tracker.strategy,
            lookback: Duration::from_secs(self.tracker.lookback_secs),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            topic: self.topic.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            framing: self.framing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_empty_config() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.role, Role::Publisher);
        assert_eq!(settings.topic, "db/sync");
        assert_eq!(settings.poll_interval_secs, 12);
        assert_eq!(settings.framing, Framing::Envelope);
        assert_eq!(settings.broker.port, 1883);
        assert_eq!(settings.reconnect, ReconnectSettings::default());
        assert_eq!(settings.table, TableSpec::default());
        assert!(settings.store.url.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
role = "subscriber"
topic = "site/+/sync"
poll_interval_secs = 5
framing = "raw"

[broker]
host = "broker.local"
port = 8883
username = "replicator"
password = "hunter2"
qos = "exactly-once"

[reconnect]
backoff_secs = 1
max_attempts = 10

[store]
url = "sqlite://target.db"

[table]
name = "Readings"
id_column = "ReadingId"

[tracker]
strategy = "max-observed"
lookback_secs = 30
state_path = "state/watermark.json"

[files]
save_dir = "incoming"
"#;
        let settings = Settings::from_toml(toml).unwrap();
        assert_eq!(settings.role, Role::Subscriber);
        assert_eq!(settings.framing, Framing::Raw);
        assert_eq!(settings.broker.qos, QoS::ExactlyOnce);
        assert_eq!(settings.reconnect.max_attempts, Some(10));
        assert_eq!(settings.reconnect.connect_timeout_secs, 10);
        assert_eq!(settings.table.name, "Readings");
        assert_eq!(settings.table.id_column, "ReadingId");
        assert_eq!(settings.table.schema, "public");
        assert_eq!(settings.tracker.strategy, WatermarkStrategy::MaxObserved);
        assert_eq!(settings.files.save_dir, Some(PathBuf::from("incoming")));
        assert!(settings.validate().is_ok());

        let session = settings.session_config();
        assert_eq!(session.port, 8883);
        assert_eq!(session.reconnect.backoff, Duration::from_secs(1));
        let tracker = settings.tracker_config();
        assert_eq!(tracker.lookback, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        assert!(Settings::from_toml("role = \"relay\"").is_err());
        assert!(Settings::from_toml("framing = \"gzip\"").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut settings = Settings {
            topic: "db/#".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        settings.role = Role::Subscriber;
        assert!(settings.validate().is_ok());

        let settings = Settings {
            poll_interval_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            topic: "  ".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.table.name = "Rooms; DROP TABLE x".into();
        let err = settings.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("[table]"));

        let mut settings = Settings::default();
        settings.reconnect.max_attempts = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_overrides_win() {
        let mut settings = Settings::default();
        settings.apply_overrides(Overrides {
            role: Some(Role::Subscriber),
            store_url: Some("postgres://u:p@db/app".into()),
            broker_port: Some(1884),
            broker_password: Some("secret".into()),
            ..Overrides::default()
        });
        assert_eq!(settings.role, Role::Subscriber);
        assert_eq!(settings.store_url().unwrap(), "postgres://u:p@db/app");
        assert_eq!(settings.broker.port, 1884);
        assert_eq!(settings.broker.host, "localhost");
        assert!(!format!("{:?}", settings).contains("secret"));
    }

    #[test]
    fn test_store_url_is_required() {
        let err = Settings::default().store_url().unwrap_err();
        assert!(err.to_string().contains("--store-url"));
    }

    #[test]
    fn test_load_missing_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Settings::load(Some(&missing)).is_err());

        let path = dir.path().join("replicator.toml");
        std::fs::write(&path, "topic = \"plant/sync\"\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.topic, "plant/sync");
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("publisher".parse::<Role>(), Ok(Role::Publisher));
        assert_eq!("subscriber".parse::<Role>(), Ok(Role::Subscriber));
        assert!("relay".parse::<Role>().is_err());
    }
}
