//! Fieldlink edge gateway.
//!
//! Polls Modbus RTU devices on a serial bus and relays readings and status
//! to a cloud MQTT bridge. The device table is hot-reloadable through
//! configuration messages received from the cloud.
//!
//! - [`scheduler`] - one periodic task per configured operation
//! - [`executor`] - the serial bus master loop
//! - [`transport`] - cloud connection, reconnect and publish loop
//! - [`store`] / [`reconciler`] - crash-safe document storage and hot apply
//! - [`outbox`] - telemetry batching in front of the publish queue

pub mod backoff;
pub mod config;
pub mod credential;
pub mod document;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod master;
pub mod mqtt;
pub mod outbox;
pub mod reconciler;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

pub use config::GatewayConfig;
pub use document::{ConfigDocument, DocumentError};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, Links, Timings};
pub use runner::GatewayRunner;
