//! Cloud link management.
//!
//! [`TransportManager`] owns the connection: it (re)connects with backoff,
//! renews the access token before it expires, and drains the publish queue.
//! [`InboundRouter`] handles what the connection delivers: configuration
//! updates are deduplicated and handed to a [`ConfigUpdateHandler`] on their
//! own task, commands are logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_common::{OutboundMessage, Qos, TopicBuilder, TopicClass};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::credential::{Credential, CredentialIssuer};
use crate::error::Result;

/// Configuration update payloads remembered for deduplication.
pub const RECENT_UPDATES: usize = 5;

/// Something the connection's background I/O reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The connection of this generation dropped.
    Disconnected { generation: u64, reason: String },
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub client_id: String,
    pub password: String,
    /// Tag for disconnect notifications of this connection.
    pub generation: u64,
}

/// An established cloud connection.
#[async_trait]
pub trait CloudSession: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()>;

    async fn close(&self);
}

/// Establishes cloud connections.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    /// Connect and start background I/O, which reports on `events`.
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn CloudSession>>;
}

/// Receiver of inbound configuration update payloads.
#[async_trait]
pub trait ConfigUpdateHandler: Send + Sync + 'static {
    async fn handle_update(&self, payload: Vec<u8>);
}

#[derive(Debug, Clone)]
pub struct TransportTiming {
    /// Longest wait on the publish queue before flags are re-checked.
    pub queue_wait: Duration,
    /// Minimum time between a connect and a proactive reconnect.
    pub reconnect_cooldown: Duration,
    /// Span after a connect during which publishes are upgraded.
    pub grace_window: Duration,
    /// Publishing is held until this long after a connect.
    pub grace_pause: Duration,
    /// Minimum spacing between state messages.
    pub state_spacing: Duration,
    /// Reconnect once the token has less validity than this.
    pub refresh_margin: Duration,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            queue_wait: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(5),
            grace_window: Duration::from_secs(20),
            grace_pause: Duration::from_secs(5),
            state_spacing: Duration::from_secs(5),
            refresh_margin: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Link state shared between the manager and the inbound router.
#[derive(Debug)]
pub struct LinkStatus {
    state: Mutex<LinkState>,
    generation: AtomicU64,
    disconnected: AtomicBool,
    published: AtomicU64,
    connects: AtomicU64,
}

impl LinkStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Disconnected),
            generation: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            published: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Generation of the current connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether the current connection was reported as dropped.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Messages published since start.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Successful connects since start.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }
}

/// Why `publish_loop` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    Reconnect,
}

pub struct TransportManager {
    connector: Arc<dyn CloudConnector>,
    issuer: CredentialIssuer,
    client_id: String,
    topics: TopicBuilder,
    outbound: mpsc::Receiver<OutboundMessage>,
    timing: TransportTiming,
    backoff: Backoff,
    status: Arc<LinkStatus>,
    events_tx: mpsc::Sender<LinkEvent>,
    router: Option<(InboundRouter, mpsc::Receiver<LinkEvent>)>,
    session: Option<Box<dyn CloudSession>>,
    credential: Option<Credential>,
    connected_at: Option<Instant>,
    last_state_at: Option<Instant>,
}

impl TransportManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        issuer: CredentialIssuer,
        client_id: impl Into<String>,
        topics: TopicBuilder,
        outbound: mpsc::Receiver<OutboundMessage>,
        handler: Arc<dyn ConfigUpdateHandler>,
        timing: TransportTiming,
        backoff: Backoff,
    ) -> Self {
        let status = Arc::new(LinkStatus::new());
        let (events_tx, events_rx) = mpsc::channel(64);
        let router = InboundRouter::new(topics.clone(), handler, status.clone());

        Self {
            connector,
            issuer,
            client_id: client_id.into(),
            topics,
            outbound,
            timing,
            backoff,
            status,
            events_tx,
            router: Some((router, events_rx)),
            session: None,
            credential: None,
            connected_at: None,
            last_state_at: None,
        }
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.status.clone()
    }

    /// Connect, publish, reconnect; until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Some((router, events)) = self.router.take() {
            tokio::spawn(router.run(events, shutdown.clone()));
        }

        loop {
            if !self.start_new_connection(&mut shutdown).await {
                break;
            }
            if self.publish_loop(&mut shutdown).await == LoopExit::Shutdown {
                break;
            }
            if !self.back_off(&mut shutdown).await {
                break;
            }
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.status.set_state(LinkState::Disconnected);
        tracing::info!("Transport stopped");
    }

    /// Keep trying until connected. Returns false on shutdown.
    async fn start_new_connection(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }

            self.status.set_state(LinkState::Connecting);
            match self.connect().await {
                Ok(()) => {
                    self.status.set_state(LinkState::Connected);
                    self.status.connects.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "Cloud connection failed");
                    self.status.set_state(LinkState::Backoff);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    /// Wait out the backoff before rebuilding a dropped link. The delay
    /// starts over from the floor only if the link outlived the grace
    /// window. Returns false on shutdown.
    async fn back_off(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self
            .connected_at
            .is_some_and(|at| at.elapsed() >= self.timing.grace_window)
        {
            self.backoff.reset();
        }

        let delay = self.backoff.next_delay();
        tracing::info!(retry_in = ?delay, "Cloud link dropped, backing off");
        self.status.set_state(LinkState::Backoff);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if let Some(old) = self.session.take() {
            old.close().await;
        }

        let credential = self.issuer.issue()?;
        let generation = self.status.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.disconnected.store(false, Ordering::SeqCst);

        let params = ConnectParams {
            client_id: self.client_id.clone(),
            password: credential.token().to_string(),
            generation,
        };
        let session = self.connector.connect(params, self.events_tx.clone()).await?;

        let subscribed = match session
            .subscribe(&self.topics.config_topic(), Qos::AtLeastOnce)
            .await
        {
            Ok(()) => {
                session
                    .subscribe(&self.topics.command_wildcard(), Qos::AtMostOnce)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = subscribed {
            session.close().await;
            return Err(e);
        }

        tracing::info!(client_id = %self.client_id, generation, "Connected to cloud");
        self.session = Some(session);
        self.credential = Some(credential);
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    async fn publish_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> LoopExit {
        loop {
            if self.status.is_disconnected() && self.cooldown_elapsed() {
                tracing::info!("Connection reported lost, reconnecting");
                return LoopExit::Reconnect;
            }

            let received = tokio::select! {
                received = tokio::time::timeout(self.timing.queue_wait, self.outbound.recv()) => {
                    received
                }
                _ = shutdown.changed() => return LoopExit::Shutdown,
            };
            let message = match received {
                Err(_) => continue,
                Ok(None) => {
                    tracing::info!("Publish queue closed");
                    return LoopExit::Shutdown;
                }
                Ok(Some(message)) => message,
            };

            if self
                .credential
                .as_ref()
                .is_some_and(|c| c.needs_refresh(self.timing.refresh_margin))
            {
                tracing::info!("Access token near expiry, reconnecting");
                if !self.start_new_connection(shutdown).await {
                    return LoopExit::Shutdown;
                }
            }

            let mut qos = message.qos;
            if let Some(connected_at) = self.connected_at {
                let since = connected_at.elapsed();
                if since < self.timing.grace_window {
                    let pause = self.timing.grace_pause.saturating_sub(since);
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = shutdown.changed() => return LoopExit::Shutdown,
                        }
                    }
                    qos = qos.upgraded();
                }
            }

            if message.topic == TopicClass::State {
                if let Some(last) = self.last_state_at {
                    let since = last.elapsed();
                    if since < self.timing.state_spacing {
                        tokio::select! {
                            _ = tokio::time::sleep(self.timing.state_spacing - since) => {}
                            _ = shutdown.changed() => return LoopExit::Shutdown,
                        }
                    }
                }
                self.last_state_at = Some(Instant::now());
            }

            let Some(session) = self.session.as_ref() else {
                return LoopExit::Reconnect;
            };
            let topic = self.topics.publish_topic(message.topic);
            if let Err(e) = session.publish(&topic, message.payload, qos, true).await {
                tracing::warn!(topic = %topic, error = %e, "Publish failed");
                return LoopExit::Reconnect;
            }
            self.status.published.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.connected_at
            .is_none_or(|at| at.elapsed() >= self.timing.reconnect_cooldown)
    }
}

/// Dispatches inbound link events.
pub struct InboundRouter {
    topics: TopicBuilder,
    handler: Arc<dyn ConfigUpdateHandler>,
    status: Arc<LinkStatus>,
    recent: VecDeque<Vec<u8>>,
}

impl InboundRouter {
    fn new(
        topics: TopicBuilder,
        handler: Arc<dyn ConfigUpdateHandler>,
        status: Arc<LinkStatus>,
    ) -> Self {
        Self {
            topics,
            handler,
            status,
            recent: VecDeque::with_capacity(RECENT_UPDATES),
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn route(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Disconnected { generation, reason } => {
                if generation == self.status.generation() {
                    tracing::warn!(generation, reason = %reason, "Cloud connection lost");
                    self.status.disconnected.store(true, Ordering::SeqCst);
                } else {
                    tracing::debug!(generation, "Ignoring disconnect of a superseded connection");
                }
            }
            LinkEvent::Message { topic, payload } => {
                if topic == self.topics.config_topic() {
                    self.dispatch_update(payload);
                } else if self.topics.is_command_topic(&topic) {
                    tracing::info!(
                        topic = %topic,
                        payload = %String::from_utf8_lossy(&payload),
                        "Command received"
                    );
                } else {
                    tracing::debug!(topic = %topic, "Message on unexpected topic");
                }
            }
        }
    }

    fn dispatch_update(&mut self, payload: Vec<u8>) {
        if self.recent.contains(&payload) {
            tracing::debug!(bytes = payload.len(), "Duplicate configuration update ignored");
            return;
        }

        self.recent.push_back(payload.clone());
        if self.recent.len() > RECENT_UPDATES {
            self.recent.pop_front();
        }

        let handler = self.handler.clone();
        tokio::spawn(async move { handler.handle_update(payload).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ConfigUpdateHandler for Recorder {
        async fn handle_update(&self, payload: Vec<u8>) {
            self.updates.lock().push(payload);
        }
    }

    #[derive(Default)]
    struct Wire {
        published: Mutex<Vec<(String, Vec<u8>, Qos, bool, Instant)>>,
        subscribed: Mutex<Vec<(String, Qos)>>,
        connects: Mutex<Vec<ConnectParams>>,
        refuse: Mutex<u32>,
        fail_publish: Mutex<u32>,
        events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    }

    struct WireSession(Arc<Wire>);

    #[async_trait]
    impl CloudSession for WireSession {
        async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()> {
            self.0.subscribed.lock().push((topic.to_string(), qos));
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            qos: Qos,
            retain: bool,
        ) -> Result<()> {
            let mut fail = self.0.fail_publish.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(GatewayError::Publish {
                    topic: topic.to_string(),
                    message: "broken pipe".to_string(),
                });
            }
            self.0
                .published
                .lock()
                .push((topic.to_string(), payload, qos, retain, Instant::now()));
            Ok(())
        }

        async fn close(&self) {}
    }

    struct WireConnector(Arc<Wire>);

    #[async_trait]
    impl CloudConnector for WireConnector {
        async fn connect(
            &self,
            params: ConnectParams,
            events: mpsc::Sender<LinkEvent>,
        ) -> Result<Box<dyn CloudSession>> {
            self.0.connects.lock().push(params);
            let mut refuse = self.0.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(GatewayError::connection("refused"));
            }
            *self.0.events.lock() = Some(events);
            Ok(Box::new(WireSession(self.0.clone())))
        }
    }

    fn topics() -> TopicBuilder {
        TopicBuilder::new("gw-01", "events", "state")
    }

    fn issuer(lifetime: Duration) -> CredentialIssuer {
        CredentialIssuer::new("HS256", b"secret", "plant", lifetime).unwrap()
    }

    struct Fixture {
        wire: Arc<Wire>,
        recorder: Arc<Recorder>,
        status: Arc<LinkStatus>,
        outbound: mpsc::Sender<OutboundMessage>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(wire: Wire, timing: TransportTiming, lifetime: Duration) -> Fixture {
        start_with_backoff(wire, timing, lifetime, Backoff::default())
    }

    fn start_with_backoff(
        wire: Wire,
        timing: TransportTiming,
        lifetime: Duration,
        backoff: Backoff,
    ) -> Fixture {
        let wire = Arc::new(wire);
        let recorder = Arc::new(Recorder::default());
        let (outbound, outbound_rx) = mpsc::channel(16);
        let manager = TransportManager::new(
            Arc::new(WireConnector(wire.clone())),
            issuer(lifetime),
            "projects/plant/locations/eu/registries/r/devices/gw-01",
            topics(),
            outbound_rx,
            recorder.clone(),
            timing,
            backoff,
        );
        let status = manager.status();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));

        Fixture {
            wire,
            recorder,
            status,
            outbound,
            shutdown,
            task,
        }
    }

    fn no_grace() -> TransportTiming {
        TransportTiming {
            grace_window: Duration::ZERO,
            grace_pause: Duration::ZERO,
            ..TransportTiming::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn stop(f: Fixture) {
        f.shutdown.send_replace(true);
        f.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_and_publishes_retained() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(3600));
        settle().await;

        assert_eq!(f.status.state(), LinkState::Connected);
        assert_eq!(
            *f.wire.subscribed.lock(),
            vec![
                ("/devices/gw-01/config".to_string(), Qos::AtLeastOnce),
                ("/devices/gw-01/commands/#".to_string(), Qos::AtMostOnce),
            ]
        );

        f.outbound
            .send(OutboundMessage::telemetry(b"[]".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let published = f.wire.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/devices/gw-01/events");
        assert_eq!(published[0].2, Qos::AtLeastOnce);
        assert!(published[0].3);
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_refused_connects() {
        let wire = Wire::default();
        *wire.refuse.lock() = 3;
        let started = Instant::now();
        let f = start(wire, no_grace(), Duration::from_secs(3600));

        while f.status.state() != LinkState::Connected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // 2 + 4 + 8 seconds, each with under a second of jitter.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(14), "{:?}", waited);
        assert!(waited < Duration::from_secs(18), "{:?}", waited);
        assert_eq!(f.wire.connects.lock().len(), 4);
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_pauses_and_upgrades() {
        let f = start(Wire::default(), TransportTiming::default(), Duration::from_secs(3600));
        settle().await;
        let connected = Instant::now();

        let state = OutboundMessage::state(&fieldlink_common::StateMessage::new("up")).unwrap();
        f.outbound.send(state).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let published = f.wire.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/devices/gw-01/state");
        assert_eq!(published[0].2, Qos::AtLeastOnce);
        assert!(published[0].4.duration_since(connected) >= Duration::from_millis(4900));
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_messages_are_spaced() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(3600));
        settle().await;

        for text in ["one", "two", "three"] {
            let state = fieldlink_common::StateMessage::new(text);
            let message = OutboundMessage::state(&state).unwrap();
            f.outbound.send(message).await.unwrap();
        }
        f.outbound
            .send(OutboundMessage::telemetry(b"[]".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        let published = f.wire.published.lock().clone();
        assert_eq!(published.len(), 4);
        assert_eq!(published[0].2, Qos::AtMostOnce);
        assert!(published[1].4.duration_since(published[0].4) >= Duration::from_secs(5));
        assert!(published[2].4.duration_since(published[1].4) >= Duration::from_secs(5));
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_reconnects() {
        let wire = Wire::default();
        *wire.fail_publish.lock() = 1;
        let f = start(wire, no_grace(), Duration::from_secs(3600));
        settle().await;

        f.outbound
            .send(OutboundMessage::telemetry(b"[1]".to_vec()))
            .await
            .unwrap();
        f.outbound
            .send(OutboundMessage::telemetry(b"[2]".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // 2 seconds of backoff plus jitter before the link is rebuilt.
        assert_eq!(f.status.state(), LinkState::Backoff);
        assert_eq!(f.status.connects(), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(f.status.connects(), 2);
        let published = f.wire.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, b"[2]".to_vec());
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refresh_reconnects() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(120));
        settle().await;

        tokio::time::sleep(Duration::from_secs(70)).await;
        f.outbound
            .send(OutboundMessage::telemetry(b"[]".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let connects = f.wire.connects.lock().clone();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].generation, 2);
        assert_eq!(f.wire.published.lock().len(), 1);
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_flag_respects_generation() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(3600));
        settle().await;
        let events = f.wire.events.lock().clone().unwrap();

        events
            .send(LinkEvent::Disconnected {
                generation: 0,
                reason: "stale".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.status.connects(), 1);

        events
            .send(LinkEvent::Disconnected {
                generation: 1,
                reason: "keepalive timeout".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.status.state(), LinkState::Backoff);
        assert_eq!(f.status.connects(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.status.connects(), 2);
        assert!(!f.status.is_disconnected());
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_link_backs_off_longer_each_time() {
        let timing = TransportTiming {
            reconnect_cooldown: Duration::ZERO,
            grace_pause: Duration::ZERO,
            ..TransportTiming::default()
        };
        let backoff = Backoff::new(
            Duration::from_secs(2),
            Duration::from_secs(128),
            Duration::from_secs(16),
            Duration::ZERO,
        );
        let f = start_with_backoff(Wire::default(), timing, Duration::from_secs(3600), backoff);
        settle().await;

        let mut gaps = Vec::new();
        for generation in 1..=2u64 {
            let events = f.wire.events.lock().clone().unwrap();
            let dropped = Instant::now();
            events
                .send(LinkEvent::Disconnected {
                    generation,
                    reason: "connection reset".to_string(),
                })
                .await
                .unwrap();
            while f.status.connects() == generation {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            gaps.push(dropped.elapsed());
        }

        // Noticed within one queue wait, then 2s and 4s of backoff.
        assert!(gaps[0] >= Duration::from_secs(2), "{:?}", gaps);
        assert!(gaps[0] < Duration::from_millis(3100), "{:?}", gaps);
        assert!(gaps[1] >= Duration::from_secs(4), "{:?}", gaps);
        assert!(gaps[1] < Duration::from_millis(5100), "{:?}", gaps);
        stop(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_state_spacing() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(3600));
        settle().await;

        for text in ["one", "two"] {
            let state = fieldlink_common::StateMessage::new(text);
            let message = OutboundMessage::state(&state).unwrap();
            f.outbound.send(message).await.unwrap();
        }
        settle().await;
        assert_eq!(f.wire.published.lock().len(), 1);

        let stopping = Instant::now();
        stop(f).await;
        assert!(stopping.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_updates_are_deduplicated() {
        let f = start(Wire::default(), no_grace(), Duration::from_secs(3600));
        settle().await;
        let events = f.wire.events.lock().clone().unwrap();

        for payload in ["a", "b", "a", "c", "d", "e", "f", "a"] {
            events
                .send(LinkEvent::Message {
                    topic: "/devices/gw-01/config".to_string(),
                    payload: payload.as_bytes().to_vec(),
                })
                .await
                .unwrap();
        }
        events
            .send(LinkEvent::Message {
                topic: "/devices/gw-01/commands/reboot".to_string(),
                payload: b"now".to_vec(),
            })
            .await
            .unwrap();
        settle().await;

        let updates: Vec<String> = f
            .recorder
            .updates
            .lock()
            .iter()
            .map(|p| String::from_utf8(p.clone()).unwrap())
            .collect();
        // "a" is forgotten once five newer payloads have arrived.
        let mut sorted = updates.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "a", "b", "c", "d", "e", "f"]);
        stop(f).await;
    }
}
