use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Wait between reading the settings page and navigating home. The device UI
// needs this long before it accepts leaving setting mode.
pub const DEFAULT_MODE_RESET_GRACE_MS: u64 = 2_000;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_USERNAME: &str = "admin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device host is not configured")]
    MissingHost,
    #[error("device password is not configured")]
    MissingPassword,
    #[error("mqtt is enabled but no broker host is configured")]
    MissingMqttHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub fetch_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub reset_grace_ms: u64,
    pub user_agent: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: DEFAULT_USERNAME.to_string(),
            password: String::new(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            reset_grace_ms: DEFAULT_MODE_RESET_GRACE_MS,
            user_agent: "aiseg2-bridge".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn reset_grace(&self) -> Duration {
        Duration::from_millis(self.reset_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub keep_undecodable: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            keep_undecodable: false,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            topic_prefix: "aiseg2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub poll: PollConfig,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
}

impl BridgeConfig {
    pub fn sanitize(&mut self) {
        self.device.host = self.device.host.trim().to_string();
        if self.device.username.trim().is_empty() {
            self.device.username = DEFAULT_USERNAME.to_string();
        }

        self.device.fetch_timeout_ms = self.device.fetch_timeout_ms.clamp(1_000, 120_000);
        // The home-page call must never outlast the data fetch it follows.
        self.device.reset_timeout_ms = self
            .device
            .reset_timeout_ms
            .clamp(500, self.device.fetch_timeout_ms);
        self.device.reset_grace_ms = self.device.reset_grace_ms.min(30_000);

        self.poll.interval_ms = self.poll.interval_ms.max(10_000);

        let prefix = self.mqtt.topic_prefix.trim().trim_matches('/');
        self.mqtt.topic_prefix = if prefix.is_empty() {
            MqttConfig::default().topic_prefix
        } else {
            prefix.to_string()
        };
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.device.password.is_empty() {
            return Err(ConfigError::MissingPassword);
        }
        if self.mqtt.enabled && self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingMqttHost);
        }
        Ok(())
    }
}
