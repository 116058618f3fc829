//! MQTT cloud bridge connection built on rumqttc.

use std::time::Duration;

use async_trait::async_trait;
use fieldlink_common::Qos;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CloudConfig;
use crate::error::{GatewayError, Result};
use crate::transport::{CloudConnector, CloudSession, ConnectParams, LinkEvent};

const MAX_PACKET_SIZE: usize = 256 * 1024;
const REQUEST_CAPACITY: usize = 200;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Connects to the bridge with the device token as password.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    ca: Option<Vec<u8>>,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16, keep_alive: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive,
            ca: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Build from settings, loading the CA certificate when one is configured.
    pub fn from_config(config: &CloudConfig) -> Result<Self> {
        let mut connector = Self::new(
            config.host.clone(),
            config.port,
            Duration::from_secs(config.keepalive_secs),
        );
        if let Some(path) = &config.ca_certs {
            connector.ca = Some(std::fs::read(path).map_err(|e| {
                GatewayError::connection(format!(
                    "failed to read CA certificate {}: {}",
                    path.display(),
                    e
                ))
            })?);
        }
        Ok(connector)
    }

    fn options(&self, params: &ConnectParams) -> MqttOptions {
        let mut options = MqttOptions::new(params.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(false);
        // The bridge ignores the user name and authenticates the token.
        options.set_credentials("unused", params.password.clone());
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if let Some(ca) = &self.ca {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }));
        }
        options
    }
}

#[async_trait]
impl CloudConnector for MqttConnector {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn CloudSession>> {
        let (client, mut eventloop) = AsyncClient::new(self.options(&params), REQUEST_CAPACITY);

        let connack = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match connack {
            Err(_) => {
                return Err(GatewayError::connection(format!(
                    "no CONNACK from {}:{} within {:?}",
                    self.host, self.port, self.connect_timeout
                )));
            }
            Ok(Err(e)) => return Err(GatewayError::connection(e.to_string())),
            Ok(Ok(ack)) if ack.code != ConnectReturnCode::Success => {
                return Err(GatewayError::connection(format!(
                    "connection refused: {:?}",
                    ack.code
                )));
            }
            Ok(Ok(_)) => {}
        }

        let driver = tokio::spawn(drive(eventloop, events, params.generation));
        Ok(Box::new(MqttSession { client, driver }))
    }
}

/// Pump the event loop, forwarding publishes until the connection ends.
async fn drive(mut eventloop: EventLoop, events: mpsc::Sender<LinkEvent>, generation: u64) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => LinkEvent::Disconnected {
                generation,
                reason: "disconnected by broker".to_string(),
            },
            Ok(_) => continue,
            Err(e) => LinkEvent::Disconnected {
                generation,
                reason: e.to_string(),
            },
        };

        let last = matches!(event, LinkEvent::Disconnected { .. });
        if events.send(event).await.is_err() || last {
            break;
        }
    }
    tracing::debug!(generation, "MQTT event loop ended");
}

struct MqttSession {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

#[async_trait]
impl CloudSession for MqttSession {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()> {
        self.client
            .subscribe(topic, mqtt_qos(qos))
            .await
            .map_err(|e| GatewayError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
        self.client
            .publish(topic, mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| GatewayError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect failed");
        }
        self.driver.abort();
    }
}

fn mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}
