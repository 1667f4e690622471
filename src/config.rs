//! Configuration system for the dispenser synchronization daemon
//!
//! Configuration is read from a TOML file. Every section except `[broker]`
//! has defaults matching the timings the dispenser firmware was tuned for.
//! Credentials are never stored in the file, only the names of the
//! environment variables that hold them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispenserConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispenser: DispenserSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// Broker section - fixed address and client identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Fixed client identity presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound for a single connection attempt
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Period of the connectivity poll
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_client_id() -> String {
    "DispenserSyncApp".to_string()
}

fn default_keep_alive() -> u64 {
    20
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            connection_timeout_secs: default_connection_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl BrokerSection {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get broker username from environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Get broker password from environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

/// Resync protocol timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSection {
    /// Pause between a connect success and the start of the resync
    #[serde(default = "default_post_connect_delay")]
    pub post_connect_delay_ms: u64,
    /// Pause after the clear-all command before doses are pushed
    #[serde(default = "default_clear_settle")]
    pub clear_settle_ms: u64,
    /// Pause after every dose configuration during the push
    #[serde(default = "default_dose_spacing")]
    pub dose_spacing_ms: u64,
    /// Publish the local clock after each supervised connect
    #[serde(default = "default_true")]
    pub sync_clock_on_connect: bool,
}

fn default_post_connect_delay() -> u64 {
    2000
}

fn default_clear_settle() -> u64 {
    500
}

fn default_dose_spacing() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            post_connect_delay_ms: default_post_connect_delay(),
            clear_settle_ms: default_clear_settle(),
            dose_spacing_ms: default_dose_spacing(),
            sync_clock_on_connect: true,
        }
    }
}

impl SyncSection {
    pub fn post_connect_delay(&self) -> Duration {
        Duration::from_millis(self.post_connect_delay_ms)
    }

    pub fn clear_settle(&self) -> Duration {
        Duration::from_millis(self.clear_settle_ms)
    }

    pub fn dose_spacing(&self) -> Duration {
        Duration::from_millis(self.dose_spacing_ms)
    }
}

/// History log bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySection {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

fn default_history_capacity() -> usize {
    100
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

/// Connection retry policy used by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Delay before the very first connect
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
    /// Delays for consecutive failed attempts
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    /// Delay once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
    /// Delay between an observed connection loss and the reconnect
    #[serde(default = "default_loss_delay")]
    pub loss_delay_ms: u64,
    /// Give up after this many failed connects in a row, the first included (None = never)
    pub max_attempts: Option<u32>,
}

fn default_startup_delay() -> u64 {
    1000
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![5000, 10000]
}

fn default_sustained_delay() -> u64 {
    10000
}

fn default_loss_delay() -> u64 {
    3000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay(),
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
            loss_delay_ms: default_loss_delay(),
            max_attempts: None,
        }
    }
}

/// Physical layout of the dispenser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispenserSection {
    /// Number of compartments, numbered from 1
    #[serde(default = "default_compartments")]
    pub compartments: u8,
}

fn default_compartments() -> u8 {
    8
}

impl Default for DispenserSection {
    fn default() -> Self {
        Self {
            compartments: default_compartments(),
        }
    }
}

/// Local persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// JSON state file; in-memory only when absent
    pub path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("dispenser-state.json")),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DispenserConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispenserConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.client_id must not be empty".to_string(),
            ));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.broker.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connection_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history.capacity must be greater than 0".to_string(),
            ));
        }
        if self.dispenser.compartments == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispenser.compartments must be greater than 0".to_string(),
            ));
        }
        if let Some(0) = self.retry.max_attempts {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be greater than 0 or omitted for unlimited".to_string(),
            ));
        }
        if self.retry.backoff_pattern_ms.is_empty() && self.retry.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry needs either backoff_pattern_ms or sustained_delay_ms > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a configuration for unit testing with zero resync delays
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
broker_url = "mqtt://localhost:1883"
client_id = "dispenser-test"

[sync]
post_connect_delay_ms = 0
clear_settle_ms = 500
dose_spacing_ms = 300

[store]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = DispenserConfig::from_toml_str(
            r#"
[broker]
broker_url = "mqtt://192.168.137.179:1883"
"#,
        )
        .unwrap();

        assert_eq!(config.broker.client_id, "DispenserSyncApp");
        assert_eq!(config.broker.keep_alive_secs, 20);
        assert_eq!(config.broker.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.broker.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.post_connect_delay(), Duration::from_secs(2));
        assert_eq!(config.sync.clear_settle(), Duration::from_millis(500));
        assert_eq!(config.sync.dose_spacing(), Duration::from_millis(300));
        assert!(config.sync.sync_clock_on_connect);
        assert_eq!(config.history.capacity, 100);
        assert_eq!(config.retry.backoff_pattern_ms, vec![5000, 10000]);
        assert_eq!(config.retry.loss_delay_ms, 3000);
        assert_eq!(config.dispenser.compartments, 8);
        assert_eq!(
            config.store.path,
            Some(PathBuf::from("dispenser-state.json"))
        );
    }

    #[test]
    fn test_missing_broker_section_fails() {
        let result = DispenserConfig::from_toml_str("[sync]\nclear_settle_ms = 1\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = DispenserConfig::from_toml_str(
            r#"
[broker]
broker_url = "mqtt://localhost:1883"

[history]
capacity = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = DispenserConfig::test_config();
        config.retry.max_attempts = Some(0);
        assert!(config.validate().is_err());

        config.retry.max_attempts = Some(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_store_section_is_memory_only() {
        let config = DispenserConfig::test_config();
        assert_eq!(config.store.path, None);
    }

    #[test]
    fn test_credentials_resolved_from_env() {
        let mut config = DispenserConfig::test_config();
        config.broker.username_env = Some("DISPENSER_TEST_MQTT_USER".to_string());
        config.broker.password_env = Some("DISPENSER_TEST_MQTT_PASS_UNSET".to_string());

        std::env::set_var("DISPENSER_TEST_MQTT_USER", "nurse");
        assert_eq!(config.broker.username(), Some("nurse".to_string()));
        assert_eq!(config.broker.password(), None);
        std::env::remove_var("DISPENSER_TEST_MQTT_USER");
    }
}
