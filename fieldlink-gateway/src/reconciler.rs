//! Remote configuration updates.
//!
//! An update payload carries the marker `configuration_update_modbus`
//! somewhere and the new document between `content_start` and
//! `content_end`. A valid document that differs from the live one is
//! committed through the store, then the polling services are stopped and
//! started again. Each update ends in exactly one state message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::outbox::Outbox;
use crate::service::Service;
use crate::store::{ConfigSource, ConfigStore};
use crate::transport::ConfigUpdateHandler;

pub const UPDATE_MARKER: &str = "configuration_update_modbus";
pub const CONTENT_START: &str = "content_start";
pub const CONTENT_END: &str = "content_end";

/// How an update attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    EnvelopeMissing,
    ParseError(String),
    InvalidDocument(String),
    Unchanged,
    Applied,
    AppliedRestartFailed(String),
    WriteFailed(String),
}

impl ReconcileOutcome {
    /// Whether the live document was replaced.
    pub fn committed(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Applied | ReconcileOutcome::AppliedRestartFailed(_)
        )
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::EnvelopeMissing => {
                write!(f, "configuration update rejected: {} envelope missing", UPDATE_MARKER)
            }
            ReconcileOutcome::ParseError(e) => {
                write!(f, "configuration update rejected: content is not valid JSON: {}", e)
            }
            ReconcileOutcome::InvalidDocument(e) => {
                write!(f, "configuration update rejected: {}", e)
            }
            ReconcileOutcome::Unchanged => {
                write!(f, "configuration update ignored: configuration already in use")
            }
            ReconcileOutcome::Applied => {
                write!(f, "configuration updated, polling restarted")
            }
            ReconcileOutcome::AppliedRestartFailed(e) => {
                write!(f, "configuration updated, but restart failed: {}", e)
            }
            ReconcileOutcome::WriteFailed(e) => {
                write!(f, "configuration update failed to write: {}", e)
            }
        }
    }
}

/// The inner document of an update envelope.
pub fn extract_document(payload: &str) -> Option<&str> {
    if !payload.contains(UPDATE_MARKER) {
        return None;
    }
    let start = payload.find(CONTENT_START)? + CONTENT_START.len();
    let rest = &payload[start..];
    let end = rest.find(CONTENT_END)?;
    Some(&rest[..end])
}

pub struct ConfigReconciler {
    store: Arc<ConfigStore>,
    outbox: Arc<Outbox>,
    services: Vec<Arc<dyn Service>>,
    settle_delay: Duration,
    serial: tokio::sync::Mutex<()>,
}

impl ConfigReconciler {
    /// `services` are stopped in the given order and started in reverse.
    pub fn new(
        store: Arc<ConfigStore>,
        outbox: Arc<Outbox>,
        services: Vec<Arc<dyn Service>>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            store,
            outbox,
            services,
            settle_delay,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate, commit and apply one update payload.
    pub async fn check_configuration_message(&self, payload: &[u8]) -> ReconcileOutcome {
        let _one_at_a_time = self.serial.lock().await;

        let outcome = self.reconcile(payload).await;
        if outcome.committed() {
            tracing::info!(outcome = %outcome, "Configuration update applied");
        } else {
            tracing::warn!(outcome = %outcome, "Configuration update not applied");
        }
        self.outbox.push_state(outcome.to_string());
        outcome
    }

    async fn reconcile(&self, payload: &[u8]) -> ReconcileOutcome {
        let text = String::from_utf8_lossy(payload);
        let Some(inner) = extract_document(&text) else {
            return ReconcileOutcome::EnvelopeMissing;
        };

        let value: serde_json::Value = match serde_json::from_str(inner.trim()) {
            Ok(value) => value,
            Err(e) => return ReconcileOutcome::ParseError(e.to_string()),
        };

        let candidate = match self.store.validate(ConfigSource::Document(value)).await {
            Ok(candidate) => candidate,
            Err(e) => return ReconcileOutcome::InvalidDocument(e.to_string()),
        };

        match self.store.current().await {
            Ok(live) if live == candidate => return ReconcileOutcome::Unchanged,
            Ok(_) => {}
            Err(e) => tracing::info!(error = %e, "No valid live document, replacing it"),
        }

        if let Err(e) = self.store.execute_configuration_message(&candidate).await {
            return ReconcileOutcome::WriteFailed(e.to_string());
        }

        self.restart().await
    }

    async fn restart(&self) -> ReconcileOutcome {
        let mut failures = Vec::new();

        for service in &self.services {
            if let Err(e) = service.stopkill().await {
                failures.push(format!("stopping {}: {}", service.name(), e));
            }
        }

        tokio::time::sleep(self.settle_delay).await;

        for service in self.services.iter().rev() {
            if let Err(e) = service.startup().await {
                failures.push(format!("starting {}: {}", service.name(), e));
            }
        }

        if failures.is_empty() {
            ReconcileOutcome::Applied
        } else {
            ReconcileOutcome::AppliedRestartFailed(failures.join("; "))
        }
    }
}

#[async_trait]
impl ConfigUpdateHandler for ConfigReconciler {
    async fn handle_update(&self, payload: Vec<u8>) {
        self.check_configuration_message(&payload).await;
    }
}
