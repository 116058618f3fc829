use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One recorded outcome of a request executed against a field device.
///
/// Field names on the wire are kept short because events are shipped in
/// batches over a metered link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Operation display name from the device configuration.
    #[serde(rename = "na")]
    pub display_name: String,

    /// Register values, or an error marker.
    #[serde(rename = "res")]
    pub result: ReadingResult,

    /// Slave (unit) id the request was addressed to.
    #[serde(rename = "sl")]
    pub slave_id: u16,

    /// Unix epoch seconds (fractional) when the outcome was recorded.
    pub time: f64,
}

impl TelemetryEvent {
    /// Create a new event stamped with the current time.
    pub fn new(display_name: impl Into<String>, slave_id: u16, result: ReadingResult) -> Self {
        Self {
            display_name: display_name.into(),
            result,
            slave_id,
            time: current_timestamp_secs(),
        }
    }

    /// Whether the event records a failed request.
    pub fn is_error(&self) -> bool {
        self.result.is_error()
    }
}

/// Result of a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingResult {
    /// Values returned by the device (bits are reported as 0/1).
    Values(Vec<u16>),

    /// The request failed.
    Error { error: String },
}

impl ReadingResult {
    /// Create an error marker.
    pub fn error(message: impl Into<String>) -> Self {
        ReadingResult::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReadingResult::Error { .. })
    }
}

/// Human-readable operational status notification. Never batched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMessage(String);

impl StateMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound topic class. The transport maps each class onto a concrete topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicClass {
    /// Batched telemetry events.
    Telemetry,
    /// Rate-limited status messages.
    State,
}

impl TopicClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicClass::Telemetry => "telemetry",
            TopicClass::State => "state",
        }
    }
}

impl std::fmt::Display for TopicClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery guarantee requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qos {
    /// Best effort.
    AtMostOnce,
    /// Acknowledged delivery.
    AtLeastOnce,
}

impl Qos {
    /// Best-effort messages become acknowledged; others are unchanged.
    pub fn upgraded(self) -> Self {
        Qos::AtLeastOnce
    }
}

/// The unit actually transmitted over the cloud link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: TopicClass,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl OutboundMessage {
    /// A telemetry batch, delivered at least once.
    pub fn telemetry(payload: Vec<u8>) -> Self {
        Self {
            topic: TopicClass::Telemetry,
            payload,
            qos: Qos::AtLeastOnce,
        }
    }

    /// A status message, delivered best-effort as a JSON string.
    pub fn state(message: &StateMessage) -> Result<Self> {
        Ok(Self {
            topic: TopicClass::State,
            payload: serde_json::to_vec(message.text())?,
            qos: Qos::AtMostOnce,
        })
    }
}

/// Get the current time in fractional seconds since Unix epoch.
pub fn current_timestamp_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
