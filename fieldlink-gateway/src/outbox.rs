//! Outbound batching shared by every producer of the publish queue.
//!
//! Telemetry events accumulate until more than `batch_size` are pending,
//! then go out as a single encoded and compressed message. State messages
//! bypass the accumulator. Neither path ever blocks: a full publish queue
//! drops the message.

use fieldlink_common::{
    Compression, Format, OutboundMessage, StateMessage, TelemetryEvent, encode_compressed,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::PublishingConfig;

/// Handle producers use to reach the publish queue.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundMessage>,
    pending: Mutex<Vec<TelemetryEvent>>,
    batch_size: usize,
    format: Format,
    compression: Compression,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<OutboundMessage>, config: &PublishingConfig) -> Self {
        Self::with_encoding(tx, config.batch_size, config.format, config.compression)
    }

    pub fn with_encoding(
        tx: mpsc::Sender<OutboundMessage>,
        batch_size: usize,
        format: Format,
        compression: Compression,
    ) -> Self {
        Self {
            tx,
            pending: Mutex::new(Vec::new()),
            batch_size,
            format,
            compression,
        }
    }

    /// Add an event to the accumulator, flushing once the threshold is passed.
    pub fn push_event(&self, event: TelemetryEvent) {
        let batch = {
            let mut pending = self.pending.lock();
            pending.push(event);
            if pending.len() <= self.batch_size {
                return;
            }
            std::mem::take(&mut *pending)
        };

        match encode_compressed(&batch, self.format, self.compression) {
            Ok(payload) => {
                tracing::debug!(
                    events = batch.len(),
                    bytes = payload.len(),
                    "Telemetry batch ready"
                );
                self.offer(OutboundMessage::telemetry(payload));
            }
            Err(e) => {
                tracing::error!(
                    events = batch.len(),
                    error = %e,
                    "Failed to encode telemetry batch"
                );
            }
        }
    }

    /// Queue a status message on its own.
    pub fn push_state(&self, message: impl Into<String>) {
        let message = StateMessage::new(message);
        tracing::info!(state = %message, "State message");

        match OutboundMessage::state(&message) {
            Ok(outbound) => self.offer(outbound),
            Err(e) => tracing::error!(error = %e, "Failed to encode state message"),
        }
    }

    /// Events waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn offer(&self, message: OutboundMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!(topic = %message.topic, "Publish queue full, message dropped");
            }
            Err(TrySendError::Closed(message)) => {
                tracing::debug!(topic = %message.topic, "Publish queue closed, message dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_common::{Qos, ReadingResult, TopicClass, decode, decompress};

    fn event(i: u16) -> TelemetryEvent {
        TelemetryEvent::new(format!("reg_{}", i), 1, ReadingResult::Values(vec![i]))
    }

    #[test]
    fn test_batch_flushes_after_threshold() {
        let (tx, mut rx) = mpsc::channel(10);
        let outbox = Outbox::with_encoding(tx, 3, Format::Json, Compression::None);

        for i in 0..3 {
            outbox.push_event(event(i));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(outbox.pending(), 3);

        outbox.push_event(event(3));
        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, TopicClass::Telemetry);
        assert_eq!(message.qos, Qos::AtLeastOnce);
        assert_eq!(outbox.pending(), 0);

        let batch: Vec<TelemetryEvent> = decode(&message.payload, Format::Json).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[3].display_name, "reg_3");
    }

    #[test]
    fn test_compressed_batch() {
        let (tx, mut rx) = mpsc::channel(10);
        let outbox = Outbox::with_encoding(tx, 1, Format::Cbor, Compression::Gzip);

        outbox.push_event(event(1));
        outbox.push_event(event(2));

        let message = rx.try_recv().unwrap();
        let raw = decompress(&message.payload, Compression::Gzip).unwrap();
        let batch: Vec<TelemetryEvent> = decode(&raw, Format::Cbor).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_state_messages_are_not_batched() {
        let (tx, mut rx) = mpsc::channel(10);
        let outbox = Outbox::with_encoding(tx, 10, Format::Json, Compression::Lzma);

        outbox.push_state("first");
        outbox.push_state("second");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.topic, TopicClass::State);
        assert_eq!(first.qos, Qos::AtMostOnce);
        assert_eq!(first.payload, b"\"first\"".to_vec());
        assert_eq!(rx.try_recv().unwrap().payload, b"\"second\"".to_vec());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        let outbox = Outbox::with_encoding(tx, 0, Format::Json, Compression::None);

        for i in 0..10 {
            outbox.push_state(format!("state {}", i));
            outbox.push_event(event(i));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
