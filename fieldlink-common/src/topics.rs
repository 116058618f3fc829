use serde::{Deserialize, Serialize};

use crate::telemetry::TopicClass;

/// Identity of this gateway in the cloud device registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
}

impl DeviceIdentity {
    /// Fully qualified client id presented on connect.
    ///
    /// # Example
    /// ```
    /// use fieldlink_common::topics::DeviceIdentity;
    ///
    /// let id = DeviceIdentity {
    ///     project_id: "plant".into(),
    ///     region: "europe-west1".into(),
    ///     registry_id: "gateways".into(),
    ///     device_id: "gw-01".into(),
    /// };
    /// assert_eq!(
    ///     id.client_id(),
    ///     "projects/plant/locations/europe-west1/registries/gateways/devices/gw-01"
    /// );
    /// ```
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, self.device_id
        )
    }
}

/// Builder for the per-device cloud topics.
///
/// Topics follow the pattern `/devices/<device>/<sub_topic>`.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    device_id: String,
    telemetry_sub: String,
    state_sub: String,
}

impl TopicBuilder {
    /// Create a builder for a device with the given outbound sub-topics.
    pub fn new(
        device_id: impl Into<String>,
        telemetry_sub: impl Into<String>,
        state_sub: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            telemetry_sub: telemetry_sub.into(),
            state_sub: state_sub.into(),
        }
    }

    /// Topic an outbound message class is published on.
    ///
    /// # Example
    /// ```
    /// use fieldlink_common::topics::TopicBuilder;
    /// use fieldlink_common::telemetry::TopicClass;
    ///
    /// let topics = TopicBuilder::new("gw-01", "events", "state");
    /// assert_eq!(topics.publish_topic(TopicClass::Telemetry), "/devices/gw-01/events");
    /// assert_eq!(topics.publish_topic(TopicClass::State), "/devices/gw-01/state");
    /// ```
    pub fn publish_topic(&self, class: TopicClass) -> String {
        let sub = match class {
            TopicClass::Telemetry => &self.telemetry_sub,
            TopicClass::State => &self.state_sub,
        };
        format!("/devices/{}/{}", self.device_id, sub)
    }

    /// Topic configuration updates arrive on.
    pub fn config_topic(&self) -> String {
        format!("/devices/{}/config", self.device_id)
    }

    /// Wildcard subscription for all commands sent to this device.
    pub fn command_wildcard(&self) -> String {
        format!("/devices/{}/commands/#", self.device_id)
    }

    /// Whether a received topic belongs to the command tree.
    pub fn is_command_topic(&self, topic: &str) -> bool {
        let root = format!("/devices/{}/commands", self.device_id);
        topic == root || topic.starts_with(&format!("{}/", root))
    }
}
