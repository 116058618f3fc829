//! Periodic request scheduling.
//!
//! One task per configured operation, keyed by `(slave, operation)`. Each
//! task offers a [`RequestDescriptor`] to the request queue at its period
//! and never waits for room: a full queue drops that firing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::document::{Access, ConfigDocument, OperationSpec};
use crate::error::Result;
use crate::outbox::Outbox;
use crate::service::Service;
use crate::store::ConfigStore;

/// One queued bus request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub slave_id: u16,
    pub start_address: u16,
    pub function_code: u8,
    pub display_name: String,
    pub access: Access,
}

impl RequestDescriptor {
    fn from_operation(slave_id: u16, op: &OperationSpec, access: Access) -> Self {
        Self {
            slave_id,
            start_address: op.start_address,
            function_code: op.function_code,
            display_name: op.display_name.clone(),
            access,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// Table key: slave name and operation name from the document.
pub type TaskKey = (String, String);

struct PeriodicTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owner of the periodic request tasks.
pub struct Scheduler {
    store: Arc<ConfigStore>,
    outbox: Arc<Outbox>,
    requests: mpsc::Sender<RequestDescriptor>,
    stagger: Duration,
    tasks: Mutex<HashMap<TaskKey, PeriodicTask>>,
    state: Mutex<SchedulerState>,
    stopping: watch::Sender<bool>,
    startup_lock: tokio::sync::Mutex<()>,
}

const STOP_POLL: Duration = Duration::from_millis(50);

impl Scheduler {
    pub fn new(
        store: Arc<ConfigStore>,
        outbox: Arc<Outbox>,
        requests: mpsc::Sender<RequestDescriptor>,
        stagger: Duration,
    ) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            store,
            outbox,
            requests,
            stagger,
            tasks: Mutex::new(HashMap::new()),
            state: Mutex::new(SchedulerState::Idle),
            stopping,
            startup_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Tasks still in the table whose loop has not ended.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Load the current document and start one task per operation.
    ///
    /// Starts are spaced by the stagger delay; a concurrent `stopkill`
    /// cuts the remaining starts short.
    pub async fn startup(&self) {
        let _starting = self.startup_lock.lock().await;
        let mut stop_rx = self.stopping.subscribe();
        if *stop_rx.borrow_and_update() {
            return;
        }

        *self.state.lock() = SchedulerState::Running;
        let document = self.store.read_setup(false).await;
        let mut started = 0usize;

        for (key, descriptor, period) in self.plan(&document) {
            if started > 0 && !self.stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.stagger) => {}
                    _ = stop_rx.changed() => {}
                }
            }
            if *stop_rx.borrow() {
                tracing::info!(started, "Scheduler startup interrupted");
                return;
            }

            self.spawn_task(key, descriptor, period);
            started += 1;
        }

        tracing::info!(tasks = started, "Scheduler started");
    }

    /// Stop every task and wait until all have ended.
    pub async fn stopkill(&self) {
        self.stopping.send_replace(true);
        *self.state.lock() = SchedulerState::Stopping;

        // Waits for an in-flight startup to notice the flag.
        let _starting = self.startup_lock.lock().await;

        let tasks: Vec<PeriodicTask> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.stop.send_replace(true);
        }
        while !tasks.iter().all(|task| task.handle.is_finished()) {
            tokio::time::sleep(STOP_POLL).await;
        }

        self.stopping.send_replace(false);
        *self.state.lock() = SchedulerState::Idle;
        tracing::info!(tasks = tasks.len(), "Scheduler stopped");
    }

    /// Expand the document into task definitions, in document order.
    fn plan(
        &self,
        document: &ConfigDocument,
    ) -> Vec<(TaskKey, RequestDescriptor, Option<Duration>)> {
        let mut plan = Vec::with_capacity(document.operation_count());

        for (slave_name, slave) in &document.slaves {
            for (op_name, op) in &slave.operations {
                let Some(access) = op.access() else {
                    self.outbox.push_state(format!(
                        "operation {}.{} has neither quantity nor output value, skipped",
                        slave_name, op_name
                    ));
                    continue;
                };

                let period = match op.period() {
                    Ok(period) => period,
                    Err(e) => {
                        self.outbox.push_state(format!(
                            "operation {}.{} not scheduled: {}",
                            slave_name, op_name, e
                        ));
                        continue;
                    }
                };

                plan.push((
                    (slave_name.clone(), op_name.clone()),
                    RequestDescriptor::from_operation(slave.slave_id, op, access),
                    period,
                ));
            }
        }

        plan
    }

    fn spawn_task(&self, key: TaskKey, descriptor: RequestDescriptor, period: Option<Duration>) {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_task(descriptor, period, self.requests.clone(), stop_rx));

        if let Some(previous) = self.tasks.lock().insert(key, PeriodicTask { stop, handle }) {
            previous.stop.send_replace(true);
        }
    }
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn stopkill(&self) -> Result<()> {
        Scheduler::stopkill(self).await;
        Ok(())
    }

    async fn startup(&self) -> Result<()> {
        Scheduler::startup(self).await;
        Ok(())
    }
}

async fn run_task(
    descriptor: RequestDescriptor,
    period: Option<Duration>,
    requests: mpsc::Sender<RequestDescriptor>,
    mut stop: watch::Receiver<bool>,
) {
    let Some(period) = period else {
        offer(&requests, &descriptor);
        return;
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *stop.borrow() {
                    break;
                }
                offer(&requests, &descriptor);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!(name = %descriptor.display_name, "Periodic task stopped");
}

fn offer(requests: &mpsc::Sender<RequestDescriptor>, descriptor: &RequestDescriptor) {
    match requests.try_send(descriptor.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::debug!(name = %descriptor.display_name, "Request queue full, firing dropped");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(name = %descriptor.display_name, "Request queue closed");
        }
    }
}
