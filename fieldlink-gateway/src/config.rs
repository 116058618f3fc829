//! Configuration for the gateway process.
//!
//! These settings are loaded once at startup. The hot-reloadable serial and
//! device table lives in a separate document, see [`crate::document`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use fieldlink_common::{Compression, DeviceIdentity, Format, LoggingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Cloud bridge endpoint and identity
    pub cloud: CloudConfig,

    /// Token signing settings
    pub credential: CredentialConfig,

    /// Outbound sub-topic names
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Batching and encoding of outbound data
    #[serde(default)]
    pub publishing: PublishingConfig,

    /// Serial side settings
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cloud bridge connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Bridge host name
    pub host: String,

    /// Bridge port (default: 8883)
    #[serde(default = "default_cloud_port")]
    pub port: u16,

    /// MQTT keepalive in seconds (default: 60)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Registry identity of this device
    pub identity: DeviceIdentity,

    /// CA certificate (PEM) used to verify the bridge; plain TCP when absent
    #[serde(default)]
    pub ca_certs: Option<PathBuf>,
}

fn default_cloud_port() -> u16 {
    8883
}

fn default_keepalive() -> u64 {
    60
}

/// Access token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// JWT signing algorithm, e.g. "RS256" or "ES256"
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// PEM private key, or shared secret for HS* algorithms
    pub private_key_file: PathBuf,

    /// Token lifetime in minutes (default: 60)
    #[serde(default = "default_expires_minutes")]
    pub expires_minutes: u64,
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_expires_minutes() -> u64 {
    60
}

impl CredentialConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expires_minutes * 60)
    }
}

/// Outbound sub-topics below `/devices/<device>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_telemetry_topic")]
    pub telemetry: String,

    #[serde(default = "default_state_topic")]
    pub state: String,
}

fn default_telemetry_topic() -> String {
    "events".to_string()
}

fn default_state_topic() -> String {
    "state".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            telemetry: default_telemetry_topic(),
            state: default_state_topic(),
        }
    }
}

/// Outbound batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    /// A batch is sent once more than this many events are pending
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch serialization format
    #[serde(default)]
    pub format: Format,

    /// Batch compression codec
    #[serde(default)]
    pub compression: Compression,

    /// Publish queue bound
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_batch_size() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    100
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            format: Format::default(),
            compression: Compression::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Serial side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Live device document
    #[serde(default = "default_document_path")]
    pub config_path: PathBuf,

    /// Staging file for document swaps (default: `<stem>_temp.json` beside the live file)
    #[serde(default)]
    pub temp_path: Option<PathBuf>,

    /// Request queue bound
    #[serde(default = "default_queue_capacity")]
    pub request_queue_capacity: usize,

    /// Delay between consecutive task starts in milliseconds
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// Pause between stop and restart after a document update
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

fn default_document_path() -> PathBuf {
    PathBuf::from("setup_modbus.json")
}

fn default_stagger_ms() -> u64 {
    270
}

fn default_settle_delay() -> u64 {
    3
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            config_path: default_document_path(),
            temp_path: None,
            request_queue_capacity: default_queue_capacity(),
            stagger_ms: default_stagger_ms(),
            settle_delay_secs: default_settle_delay(),
        }
    }
}

impl ModbusConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cloud.host.is_empty() {
            return Err(ConfigError::Validation(
                "cloud.host cannot be empty".to_string(),
            ));
        }

        let identity = &self.cloud.identity;
        for (field, value) in [
            ("project_id", &identity.project_id),
            ("region", &identity.region),
            ("registry_id", &identity.registry_id),
            ("device_id", &identity.device_id),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "cloud.identity.{} cannot be empty",
                    field
                )));
            }
        }

        if self.credential.expires_minutes < 2 {
            return Err(ConfigError::Validation(
                "credential.expires_minutes must be at least 2".to_string(),
            ));
        }

        if self.publishing.queue_capacity == 0 || self.modbus.request_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "Queue capacities must be greater than zero".to_string(),
            ));
        }

        if self.topics.telemetry.is_empty() || self.topics.state.is_empty() {
            return Err(ConfigError::Validation(
                "Topic names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        cloud: {
            host: "mqtt.example.net",
            identity: {
                project_id: "plant",
                region: "europe-west1",
                registry_id: "gateways",
                device_id: "gw-01",
            },
        },
        credential: { private_key_file: "rsa_private.pem" },
    }"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = GatewayConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.cloud.port, 8883);
        assert_eq!(config.cloud.keepalive_secs, 60);
        assert!(config.cloud.ca_certs.is_none());
        assert_eq!(config.credential.algorithm, "RS256");
        assert_eq!(config.credential.lifetime(), Duration::from_secs(3600));
        assert_eq!(config.topics.telemetry, "events");
        assert_eq!(config.publishing.batch_size, 10);
        assert_eq!(config.publishing.compression, Compression::None);
        assert_eq!(config.modbus.config_path, PathBuf::from("setup_modbus.json"));
        assert_eq!(config.modbus.stagger(), Duration::from_millis(270));
        assert_eq!(config.modbus.settle_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            cloud: {
                host: "mqtt.example.net",
                port: 443,
                keepalive_secs: 120,
                ca_certs: "roots.pem",
                identity: {
                    project_id: "plant",
                    region: "europe-west1",
                    registry_id: "gateways",
                    device_id: "gw-01",
                },
            },
            credential: {
                algorithm: "ES256",
                private_key_file: "ec_private.pem",
                expires_minutes: 20,
            },
            topics: { telemetry: "events/modbus", state: "state" },
            publishing: { batch_size: 25, format: "cbor", compression: "lzma" },
            modbus: { config_path: "/etc/fieldlink/setup.json", stagger_ms: 100 },
            logging: { level: "debug", format: "json" },
        }"#;

        let config = GatewayConfig::parse(json).unwrap();
        assert_eq!(config.cloud.port, 443);
        assert_eq!(config.cloud.ca_certs, Some(PathBuf::from("roots.pem")));
        assert_eq!(config.credential.algorithm, "ES256");
        assert_eq!(config.publishing.format, Format::Cbor);
        assert_eq!(config.publishing.compression, Compression::Lzma);
        assert_eq!(config.publishing.queue_capacity, 100);
        assert_eq!(config.modbus.stagger_ms, 100);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_empty_identity() {
        let json = MINIMAL.replace("\"gw-01\"", "\"\"");
        let result = GatewayConfig::parse(&json);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_short_token_lifetime() {
        let json = MINIMAL.replace(
            "private_key_file: \"rsa_private.pem\"",
            "private_key_file: \"rsa_private.pem\", expires_minutes: 1",
        );
        let result = GatewayConfig::parse(&json);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
