//! The device configuration document: serial port settings plus the
//! slave/operation table the scheduler polls.
//!
//! The on-disk JSON keeps the field names used by deployed gateways
//! (`startadress`, `slaveconfig`, ...). Slaves and operations keep their
//! document order.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Baud rates accepted for the serial line.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000,
    3000000, 3500000, 4000000,
];

/// Errors produced while parsing, validating or persisting a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to access configuration document: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration document is not valid JSON: {0}")]
    Parse(serde_json::Error),
    #[error("Configuration document does not match the schema: {0}")]
    Schema(serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Timed out waiting for configuration file access")]
    LockTimeout,
    #[error("Staged document does not match the candidate: {0}")]
    Mismatch(String),
    #[error("Failed to serialize configuration document: {0}")]
    Serialize(serde_json::Error),
}

/// Complete device configuration. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    pub port_config: PortConfig,

    #[serde(rename = "slaveconfig")]
    pub slaves: IndexMap<String, SlaveSpec>,
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// OS device name, e.g. "/dev/ttyUSB0" or "COM3"
    pub port: String,

    #[serde(rename = "baudrate")]
    pub baud_rate: u32,

    #[serde(rename = "databits")]
    pub data_bits: u8,

    pub parity: Parity,

    /// 1, 1.5 or 2
    #[serde(rename = "stopbits")]
    pub stop_bits: f64,

    /// Response timeout in seconds
    #[serde(rename = "timeout_connection")]
    pub timeout_secs: f64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1.0,
            timeout_secs: 10.0,
        }
    }
}

impl PortConfig {
    /// Response timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::from_secs(10))
    }
}

impl std::fmt::Display for PortConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}{}{} timeout {}s",
            self.port,
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits,
            self.timeout_secs
        )
    }
}

/// Serial parity, written as a single letter in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
    #[serde(rename = "M")]
    Mark,
    #[serde(rename = "S")]
    Space,
}

impl Parity {
    pub fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }
}

/// One addressable device on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlaveSpec {
    pub slave_id: u16,
    pub operations: IndexMap<String, OperationSpec>,
}

/// A periodic read or write against one slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationSpec {
    #[serde(rename = "startadress")]
    pub start_address: u16,

    pub function_code: u8,

    pub display_name: String,

    /// Seconds between firings; 0 means fire once.
    pub sampling_interval: f64,

    #[serde(
        rename = "quantity_of_x",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub quantity: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_value: Option<u16>,
}

/// What a request does on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { quantity: u16 },
    Write { value: u16 },
}

impl OperationSpec {
    /// The read/write variant, if exactly one of quantity and value is set.
    pub fn access(&self) -> Option<Access> {
        match (self.quantity, self.output_value) {
            (Some(quantity), None) => Some(Access::Read { quantity }),
            (None, Some(value)) => Some(Access::Write { value }),
            _ => None,
        }
    }

    /// Firing period; `None` for one-shot operations.
    pub fn period(&self) -> Result<Option<Duration>, DocumentError> {
        if self.sampling_interval == 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f64(self.sampling_interval)
            .map(Some)
            .map_err(|e| {
                DocumentError::Validation(format!(
                    "sampling_interval {}: {}",
                    self.sampling_interval, e
                ))
            })
    }
}

impl ConfigDocument {
    /// Built-in document used when no valid document can be read.
    pub fn fallback() -> Self {
        Self {
            port_config: PortConfig::default(),
            slaves: IndexMap::new(),
        }
    }

    /// Parse and validate a document from JSON text.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(DocumentError::Parse)?;
        Self::from_value(value)
    }

    /// Check structure and ranges of an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DocumentError> {
        let document: Self = serde_json::from_value(value).map_err(DocumentError::Schema)?;
        document.validate()?;
        Ok(document)
    }

    /// Serialize for storage.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, DocumentError> {
        serde_json::to_vec_pretty(self).map_err(DocumentError::Serialize)
    }

    /// Number of scheduled operations across all slaves.
    pub fn operation_count(&self) -> usize {
        self.slaves.values().map(|s| s.operations.len()).sum()
    }

    /// Range checks on every field.
    pub fn validate(&self) -> Result<(), DocumentError> {
        validate_port(&self.port_config)?;

        for (slave_name, slave) in &self.slaves {
            if slave.slave_id > 256 {
                return Err(DocumentError::Validation(format!(
                    "slaveconfig.{}.slave_id: {} is outside [0, 256]",
                    slave_name, slave.slave_id
                )));
            }

            for (op_name, op) in &slave.operations {
                validate_operation(op).map_err(|msg| {
                    DocumentError::Validation(format!(
                        "slaveconfig.{}.operations.{}.{}",
                        slave_name, op_name, msg
                    ))
                })?;
            }
        }

        Ok(())
    }
}

fn validate_port(port: &PortConfig) -> Result<(), DocumentError> {
    if !(port.port.contains("/dev/tty") || port.port.contains("COM")) {
        return Err(DocumentError::Validation(format!(
            "port_config.port: '{}' is not a serial device name (/dev/tty* or COM*)",
            port.port
        )));
    }

    if !SUPPORTED_BAUD_RATES.contains(&port.baud_rate) {
        return Err(DocumentError::Validation(format!(
            "port_config.baudrate: {} is not a supported baud rate",
            port.baud_rate
        )));
    }

    if !(5..=8).contains(&port.data_bits) {
        return Err(DocumentError::Validation(format!(
            "port_config.databits: {} is not one of 5, 6, 7, 8",
            port.data_bits
        )));
    }

    if ![1.0, 1.5, 2.0].contains(&port.stop_bits) {
        return Err(DocumentError::Validation(format!(
            "port_config.stopbits: {} is not one of 1, 1.5, 2",
            port.stop_bits
        )));
    }

    if !(0.02..=99.9).contains(&port.timeout_secs) {
        return Err(DocumentError::Validation(format!(
            "port_config.timeout_connection: {} is outside [0.02, 99.9]",
            port.timeout_secs
        )));
    }

    Ok(())
}

fn validate_operation(op: &OperationSpec) -> Result<(), String> {
    if op.start_address > 9999 {
        return Err(format!(
            "startadress: {} is outside [0, 9999]",
            op.start_address
        ));
    }

    if op.function_code > 30 {
        return Err(format!(
            "function_code: {} is outside [0, 30]",
            op.function_code
        ));
    }

    let interval = op.sampling_interval;
    if interval != 0.0 && !(0.05..=864001.0).contains(&interval) {
        return Err(format!(
            "sampling_interval: {} is neither 0 nor within [0.05, 864001]",
            interval
        ));
    }

    match (op.quantity, op.output_value) {
        (Some(q), None) if q > 500 => Err(format!("quantity_of_x: {} is outside [0, 500]", q)),
        (None, Some(v)) if v > 500 => Err(format!("output_value: {} is outside [0, 500]", v)),
        (Some(_), Some(_)) => Err("quantity_of_x and output_value are mutually exclusive".into()),
        (None, None) => Err("one of quantity_of_x or output_value is required".into()),
        _ => Ok(()),
    }
}
