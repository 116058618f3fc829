//! The single bus master loop.
//!
//! Owns the serial line and the request queue receiver. Every request taken
//! off the queue for execution produces exactly one telemetry event, success
//! or error. Errors are weighted: a failed request costs 1, a line failure
//! costs 5 and forces a reconnect, and the line is reopened once the count
//! reaches the threshold.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_common::{ReadingResult, TelemetryEvent};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::document::PortConfig;
use crate::error::Result;
use crate::master::{MasterConnector, ProtocolMaster};
use crate::outbox::Outbox;
use crate::scheduler::RequestDescriptor;
use crate::service::Service;
use crate::store::ConfigStore;

/// Error count at which the serial line is reopened.
pub const ERROR_THRESHOLD: u32 = 10;

const PROTOCOL_ERROR_WEIGHT: u32 = 1;
const TRANSPORT_ERROR_WEIGHT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected with this many weighted errors since the last success.
    Degraded(u32),
}

#[derive(Debug, Clone)]
pub struct ExecutorTiming {
    /// Sleep after a failed open.
    pub connect_backoff: Duration,
    /// Poll interval while disabled.
    pub idle_poll: Duration,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            connect_backoff: Duration::from_secs(3),
            idle_poll: Duration::from_secs(1),
        }
    }
}

/// Shared control surface of a running executor.
#[derive(Debug)]
pub struct ExecutorHandle {
    enabled: AtomicBool,
    /// Bumped by every stop; a serving loop watches it to let go of the line.
    epoch: watch::Sender<u64>,
    state: Mutex<ExecutorState>,
}

impl ExecutorHandle {
    fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            enabled: AtomicBool::new(true),
            epoch,
            state: Mutex::new(ExecutorState::Disconnected),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl Service for ExecutorHandle {
    fn name(&self) -> &str {
        "executor"
    }

    /// Disable the executor. A pending dequeue is abandoned right away;
    /// requests queued while disabled are discarded.
    async fn stopkill(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        self.epoch.send_modify(|epoch| *epoch += 1);
        tracing::info!("Executor disabled");
        Ok(())
    }

    async fn startup(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Executor enabled");
        Ok(())
    }
}

/// Why `serve` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeExit {
    Shutdown,
    Stopped,
    LinkLost,
    Threshold,
}

pub struct ProtocolExecutor {
    handle: Arc<ExecutorHandle>,
    store: Arc<ConfigStore>,
    connector: Arc<dyn MasterConnector>,
    requests: mpsc::Receiver<RequestDescriptor>,
    outbox: Arc<Outbox>,
    timing: ExecutorTiming,
    master: Option<Box<dyn ProtocolMaster>>,
    error_count: u32,
    link_down: bool,
    announced_epoch: Option<u64>,
    /// Taken off the queue by a loop that was stopping; served next.
    carried: Option<RequestDescriptor>,
}

impl ProtocolExecutor {
    pub fn new(
        store: Arc<ConfigStore>,
        connector: Arc<dyn MasterConnector>,
        requests: mpsc::Receiver<RequestDescriptor>,
        outbox: Arc<Outbox>,
        timing: ExecutorTiming,
    ) -> Self {
        Self {
            handle: Arc::new(ExecutorHandle::new()),
            store,
            connector,
            requests,
            outbox,
            timing,
            master: None,
            error_count: 0,
            link_down: false,
            announced_epoch: None,
            carried: None,
        }
    }

    pub fn handle(&self) -> Arc<ExecutorHandle> {
        self.handle.clone()
    }

    /// Reload port settings, connect and serve until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Protocol executor running");
        // Cleared after a stop: the queue was drained while disabled and
        // whatever arrived since belongs to the restarted schedule.
        let mut flush = true;

        while !*shutdown.borrow() {
            if !self.handle.is_enabled() {
                self.set_state(ExecutorState::Disconnected);
                self.discard_while_stopped();
                flush = false;
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.idle_poll) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let epoch = self.handle.epoch();
            let announce = self.announced_epoch != Some(epoch);
            let port = self.store.read_setup(announce).await.port_config;
            self.announced_epoch = Some(epoch);

            if !self.connect(&port, flush).await {
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.connect_backoff) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            flush = true;

            match self.serve(epoch, &mut shutdown).await {
                ServeExit::Shutdown => break,
                ServeExit::Stopped => flush = false,
                ServeExit::LinkLost => {
                    self.report_link_down(format!("serial link {} lost", port.port));
                }
                ServeExit::Threshold => {
                    self.outbox.push_state(format!(
                        "serial link {} reached {} errors, reconnecting",
                        port.port, self.error_count
                    ));
                }
            }
        }

        if let Some(mut master) = self.master.take() {
            master.close().await;
        }
        self.set_state(ExecutorState::Disconnected);
        tracing::info!("Protocol executor stopped");
    }

    /// Open a fresh master. With `flush` set, requests queued while
    /// disconnected are discarded.
    async fn connect(&mut self, port: &PortConfig, flush: bool) -> bool {
        self.set_state(ExecutorState::Connecting);
        if let Some(mut old) = self.master.take() {
            old.close().await;
        }

        match self.connector.open(port).await {
            Ok(master) => {
                self.master = Some(master);
                self.error_count = 0;

                let mut flushed = 0usize;
                while flush && self.requests.try_recv().is_ok() {
                    flushed += 1;
                }

                tracing::info!(port = %port.port, flushed, "Serial link connected");
                if self.link_down {
                    self.link_down = false;
                    self.outbox
                        .push_state(format!("serial link {} restored", port.port));
                }
                self.set_state(ExecutorState::Connected);
                true
            }
            Err(e) => {
                tracing::warn!(port = %port.port, error = %e, "Failed to open serial link");
                self.report_link_down(format!("serial link {} unavailable: {}", port.port, e));
                self.set_state(ExecutorState::Disconnected);
                false
            }
        }
    }

    async fn serve(&mut self, epoch: u64, shutdown: &mut watch::Receiver<bool>) -> ServeExit {
        let mut stops = self.handle.epoch.subscribe();

        while self.error_count < ERROR_THRESHOLD - 1 {
            if *stops.borrow_and_update() != epoch {
                return ServeExit::Stopped;
            }

            let request = match self.carried.take() {
                Some(request) => request,
                None => {
                    let received = tokio::select! {
                        biased;
                        _ = shutdown.changed() => return ServeExit::Shutdown,
                        _ = stops.changed() => return ServeExit::Stopped,
                        request = self.requests.recv() => request,
                    };
                    let Some(request) = received else {
                        tracing::info!("Request queue closed");
                        return ServeExit::Shutdown;
                    };
                    request
                }
            };

            if self.handle.epoch() != epoch {
                if self.handle.is_enabled() {
                    self.carried = Some(request);
                } else {
                    self.emit(&request, ReadingResult::error("executor stopped"));
                }
                return ServeExit::Stopped;
            }

            let Some(master) = self.master.as_mut() else {
                self.emit(&request, ReadingResult::error("serial line closed"));
                return ServeExit::LinkLost;
            };

            match master.execute(&request).await {
                Ok(values) => {
                    self.error_count = 0;
                    self.set_state(ExecutorState::Connected);
                    self.emit(&request, ReadingResult::Values(values));
                }
                Err(e) => {
                    tracing::debug!(
                        slave_id = request.slave_id,
                        name = %request.display_name,
                        error = %e,
                        "Request failed"
                    );
                    self.emit(&request, ReadingResult::error(e.to_string()));

                    if e.is_transport() {
                        self.error_count += TRANSPORT_ERROR_WEIGHT;
                        self.set_state(ExecutorState::Disconnected);
                        return ServeExit::LinkLost;
                    }
                    self.error_count += PROTOCOL_ERROR_WEIGHT;
                    self.set_state(ExecutorState::Degraded(self.error_count));
                }
            }
        }

        tracing::warn!(errors = self.error_count, "Error threshold reached");
        ServeExit::Threshold
    }

    /// Drop requests offered while disabled. One taken off the queue
    /// before the stop still gets its event.
    fn discard_while_stopped(&mut self) {
        if let Some(request) = self.carried.take() {
            self.emit(&request, ReadingResult::error("executor stopped"));
        }
        let mut discarded = 0usize;
        while self.requests.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "Requests discarded while stopped");
        }
    }

    fn emit(&self, request: &RequestDescriptor, result: ReadingResult) {
        self.outbox.push_event(TelemetryEvent::new(
            request.display_name.clone(),
            request.slave_id,
            result,
        ));
    }

    fn report_link_down(&mut self, message: String) {
        if !self.link_down {
            self.link_down = true;
            self.outbox.push_state(message);
        }
    }

    fn set_state(&self, state: ExecutorState) {
        self.handle.set_state(state);
    }
}
