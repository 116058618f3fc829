//! Wiring of the gateway components.

use std::sync::Arc;

use fieldlink_common::{OutboundMessage, TopicBuilder};
use tokio::sync::mpsc;

use crate::backoff::Backoff;
use crate::config::GatewayConfig;
use crate::credential::CredentialIssuer;
use crate::executor::{ExecutorHandle, ExecutorTiming, ProtocolExecutor};
use crate::master::MasterConnector;
use crate::outbox::Outbox;
use crate::reconciler::ConfigReconciler;
use crate::runner::GatewayRunner;
use crate::scheduler::{RequestDescriptor, Scheduler};
use crate::service::Service;
use crate::store::{ConfigStore, StoreOptions};
use crate::transport::{CloudConnector, LinkStatus, TransportManager, TransportTiming};

/// The two outside links plus the token signer.
pub struct Links {
    pub master: Arc<dyn MasterConnector>,
    pub cloud: Arc<dyn CloudConnector>,
    pub issuer: CredentialIssuer,
}

/// Timing overrides; defaults match production.
#[derive(Debug, Clone, Default)]
pub struct Timings {
    pub store: StoreOptions,
    pub executor: ExecutorTiming,
    pub transport: TransportTiming,
    pub backoff: Option<Backoff>,
}

/// Shared handles to the running components.
pub struct Gateway {
    pub outbox: Arc<Outbox>,
    pub store: Arc<ConfigStore>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<ExecutorHandle>,
    pub reconciler: Arc<ConfigReconciler>,
    pub link: Arc<LinkStatus>,
}

impl Gateway {
    /// Build every component and spawn its task on `runner`.
    pub fn launch(
        runner: &mut GatewayRunner,
        config: &GatewayConfig,
        links: Links,
        timings: Timings,
    ) -> Self {
        let (publish_tx, publish_rx) =
            mpsc::channel::<OutboundMessage>(config.publishing.queue_capacity);
        let (request_tx, request_rx) =
            mpsc::channel::<RequestDescriptor>(config.modbus.request_queue_capacity);

        let outbox = Arc::new(Outbox::new(publish_tx, &config.publishing));
        let store = Arc::new(ConfigStore::new(
            config.modbus.config_path.clone(),
            config.modbus.temp_path.clone(),
            timings.store,
            outbox.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            outbox.clone(),
            request_tx,
            config.modbus.stagger(),
        ));

        let executor = ProtocolExecutor::new(
            store.clone(),
            links.master,
            request_rx,
            outbox.clone(),
            timings.executor,
        );
        let executor_handle = executor.handle();

        let services: Vec<Arc<dyn Service>> = vec![scheduler.clone(), executor_handle.clone()];
        let reconciler = Arc::new(ConfigReconciler::new(
            store.clone(),
            outbox.clone(),
            services,
            config.modbus.settle_delay(),
        ));

        let identity = &config.cloud.identity;
        let transport = TransportManager::new(
            links.cloud,
            links.issuer,
            identity.client_id(),
            TopicBuilder::new(
                identity.device_id.clone(),
                config.topics.telemetry.clone(),
                config.topics.state.clone(),
            ),
            publish_rx,
            reconciler.clone(),
            timings.transport,
            timings.backoff.unwrap_or_default(),
        );
        let link = transport.status();

        runner.spawn(transport.run(runner.shutdown_signal()));
        runner.spawn(executor.run(runner.shutdown_signal()));

        let starting = scheduler.clone();
        runner.spawn(async move { starting.startup().await });

        let mut shutdown = runner.shutdown_signal();
        let stopping = scheduler.clone();
        runner.spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            stopping.stopkill().await;
        });

        outbox.push_state(format!(
            "{} {} started",
            runner.name(),
            env!("CARGO_PKG_VERSION")
        ));

        Self {
            outbox,
            store,
            scheduler,
            executor: executor_handle,
            reconciler,
            link,
        }
    }
}
