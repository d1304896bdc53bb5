//! Impure I/O operations for the MQTT client
//!
//! `MqttClient` owns the rumqttc session. A background task drives the event
//! loop: it tracks connection state, feeds inbound publishes to the
//! [`Dispatcher`], correlates acknowledgements and applies the retry policy.
//! All public operations take `&self`, so one client can be shared behind an
//! `Arc` by startup code, ingestion and tools.

use super::connection::{
    ConnectionHandle, ConnectionState, MqttError, ReconnectConfig, RetryDecision,
    configure_mqtt_options, qos_from_u8,
};
use super::dispatcher::{Dispatcher, InboundMessage, MessageHandler};
use super::events::{AckKind, AckOutcome, AckTracker, EventRoute, route_mqtt_event};
use super::registry::HandlerRegistry;
use crate::config::{DispatchSection, MqttSection};
use crate::observability::metrics;
use crate::transport::MessageTransport;
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop, mqttbytes::QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Extra time granted to the event loop after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// State shared between the client and its event-loop task
struct SharedState {
    client: Mutex<Option<AsyncClient>>,
    acks: AckTracker,
    subscriptions: StdMutex<Vec<String>>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: StdMutex<Option<String>>,
    closing: AtomicBool,
}

impl SharedState {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "MQTT connection state changed");
        }
    }

    fn remembered_patterns(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn take_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// MQTT connection manager, subscriber and publisher
pub struct MqttClient {
    config: MqttSection,
    qos: QoS,
    dispatcher: Arc<Dispatcher>,
    shared: Arc<SharedState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("broker_url", &self.config.broker_url)
            .field("client_id", &self.config.client_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Create a disconnected client delivering inbound messages to `dispatcher`
    ///
    /// The broker URL is validated here so configuration mistakes surface
    /// before the first connection attempt.
    pub fn new(config: MqttSection, dispatcher: Arc<Dispatcher>) -> Result<Self, MqttError> {
        configure_mqtt_options(&config)?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            qos: qos_from_u8(config.qos),
            config,
            dispatcher,
            shared: Arc::new(SharedState {
                client: Mutex::new(None),
                acks: AckTracker::new(),
                subscriptions: StdMutex::new(Vec::new()),
                state_tx,
                last_error: StdMutex::new(None),
                closing: AtomicBool::new(false),
            }),
            state_rx,
            shutdown_tx: StdMutex::new(None),
            event_loop_handle: Mutex::new(None),
        })
    }

    /// Create a client with its own registry and dispatch worker pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_dispatch(config: MqttSection, dispatch: &DispatchSection) -> Result<Self, MqttError> {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::start(registry, dispatch.workers, dispatch.queue_capacity);
        Self::new(config, Arc::new(dispatcher))
    }

    pub fn config(&self) -> &MqttSection {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.dispatcher.registry()
    }

    /// Injectable read-only view of the connection state
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.state_rx.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Patterns that are re-subscribed when a session is not resumed
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.remembered_patterns()
    }

    /// Connect to the broker
    ///
    /// Without `connect_retry` the first transport error or the connect
    /// timeout fails the call. With `connect_retry` the call returns only once
    /// connected, or with an error if [`MqttClient::disconnect`] intervenes.
    ///
    /// Called while the event loop is already reconnecting, this only waits
    /// for the outcome; a timeout leaves the reconnect attempts running.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let mut handle_guard = self.event_loop_handle.lock().await;

        let running = handle_guard.as_ref().is_some_and(|h| !h.is_finished());
        let spawned = !running;
        if spawned {
            let options = configure_mqtt_options(&self.config)?;
            let client_id = options.client_id();
            let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

            *self.shared.client.lock().await = Some(client);
            self.shared.acks.clear();
            self.shared.take_error();
            self.shared.closing.store(false, Ordering::SeqCst);
            self.shared.set_state(ConnectionState::Connecting);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            *self
                .shutdown_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

            info!(
                broker = %self.config.broker_url,
                client_id = %client_id,
                clean_session = self.config.clean_session,
                "Connecting to MQTT broker"
            );
            metrics().mqtt_connection_attempt();

            let task = EventLoopTask {
                shared: Arc::clone(&self.shared),
                dispatcher: Arc::clone(&self.dispatcher),
                reconnect: ReconnectConfig::from(&self.config),
                qos: self.qos,
                ack_timeout: self.config.publish_timeout(),
            };
            let span = crate::mqtt_span!(client_id = %client_id);
            *handle_guard = Some(tokio::spawn(
                task.run(event_loop, shutdown_rx).instrument(span),
            ));
        }
        drop(handle_guard);

        let limit = (!self.config.connect_retry).then(|| self.config.connect_timeout());
        match wait_for_connection_confirmation(self.state_rx.clone(), limit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A loop that was already running belongs to the reconnect
                // policy and keeps retrying
                if spawned && matches!(e, MqttError::ConnectTimeout(_)) {
                    self.stop_event_loop().await;
                }
                let error = match (e, self.shared.take_error()) {
                    (MqttError::ConnectionFailed(_), Some(cause)) => {
                        MqttError::ConnectionFailed(cause.into())
                    }
                    (e, _) => e,
                };
                error!(broker = %self.config.broker_url, error = %error, "MQTT connection failed");
                Err(error)
            }
        }
    }

    /// Close the session gracefully; safe to call in any state
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.shared.closing.store(true, Ordering::SeqCst);

        let was_running = self
            .event_loop_handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished());

        if was_running {
            if let Some(client) = self.shared.client.lock().await.as_ref() {
                let queued =
                    tokio::time::timeout(self.config.disconnect_drain(), client.disconnect()).await;
                if !matches!(queued, Ok(Ok(()))) {
                    debug!("DISCONNECT could not be queued, closing without it");
                }
            }
        }

        self.stop_event_loop().await;
        self.shared.client.lock().await.take();

        if was_running {
            metrics().mqtt_disconnected();
            info!("MQTT client disconnected");
        }
        Ok(())
    }

    /// Let the event loop drain, then stop it and settle in `Disconnected`
    async fn stop_event_loop(&self) {
        let handle = self.event_loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.config.disconnect_drain(), &mut handle)
                .await
                .is_err()
            {
                self.signal_shutdown();
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                    Ok(Err(e)) if !e.is_cancelled() => {
                        warn!(error = %e, "Event loop task ended with error");
                    }
                    Err(_) => {
                        warn!("Event loop task didn't shut down gracefully, forcing abort");
                        handle.abort();
                    }
                    _ => {}
                }
            }
        }
        self.signal_shutdown();
        self.shared.acks.clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn signal_shutdown(&self) {
        if let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = shutdown_tx.send(true);
        }
    }

    /// Subscribe `handler` to `pattern`
    ///
    /// Waits briefly for a connection if none is up. The handler is registered
    /// before the broker is asked, so no message slips to the default handler
    /// between SubAck and registration; on failure the previous registration
    /// is restored.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MqttError> {
        self.wait_for_subscribable().await?;

        let registry = self.registry();
        let previous = registry.register(pattern, handler);

        if let Err(e) = self.request_subscribe(pattern).await {
            match previous {
                Some(previous) => {
                    registry.register(pattern, previous);
                }
                None => {
                    registry.unregister(pattern);
                }
            }
            error!(pattern = %pattern, error = %e, "Subscription failed");
            return Err(e);
        }

        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subscriptions.iter().any(|p| p == pattern) {
                subscriptions.push(pattern.to_string());
            }
        }

        info!(pattern = %pattern, "Subscribed");
        Ok(())
    }

    /// Poll for a connection up to the configured number of attempts
    async fn wait_for_subscribable(&self) -> Result<(), MqttError> {
        for attempt in 0..=self.config.subscribe_wait_attempts {
            if self.is_connected() {
                return Ok(());
            }
            if attempt < self.config.subscribe_wait_attempts {
                tokio::time::sleep(self.config.subscribe_wait_interval()).await;
            }
        }
        Err(MqttError::NotConnected {
            state: self.connection_state(),
        })
    }

    async fn request_subscribe(&self, pattern: &str) -> Result<(), MqttError> {
        let waiter = send_with_ack(&self.shared, AckKind::Subscribe, |client| {
            let pattern = pattern.to_string();
            let qos = self.qos;
            async move { client.subscribe(pattern, qos).await }
        })
        .await
        .map_err(|e| MqttError::SubscriptionFailed(e))?;

        match await_ack(waiter, AckKind::Subscribe, self.config.publish_timeout()).await {
            Err(AckError::Refused(reason)) => Err(MqttError::SubscriptionRejected {
                pattern: pattern.to_string(),
                reason,
            }),
            other => other.map_err(AckError::into_mqtt),
        }
    }

    /// Stop receiving messages for `pattern` and drop its handler
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.ensure_connected()?;

        let waiter = send_with_ack(&self.shared, AckKind::Unsubscribe, |client| {
            let pattern = pattern.to_string();
            async move { client.unsubscribe(pattern).await }
        })
        .await
        .map_err(|e| MqttError::SubscriptionFailed(e))?;

        await_ack(waiter, AckKind::Unsubscribe, self.config.publish_timeout())
            .await
            .map_err(AckError::into_mqtt)?;

        self.registry().unregister(pattern);
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p != pattern);

        info!(pattern = %pattern, "Unsubscribed");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Publish `payload` to a concrete topic and wait for the broker's ack
    ///
    /// Fails immediately when not connected; nothing is queued for later.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        let result = self.publish_inner(topic, payload, qos).await;
        match &result {
            Ok(()) => {
                metrics().publish_succeeded();
                debug!(topic = %topic, qos = ?qos, "Published");
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(topic = %topic, error = %e, "Publish failed");
            }
        }
        result
    }

    async fn publish_inner(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        self.ensure_connected()?;

        let waiter = send_with_ack(&self.shared, AckKind::Publish, |client| {
            let topic = topic.to_string();
            async move { client.publish(topic, qos, false, payload).await }
        })
        .await
        .map_err(|e| MqttError::PublishFailed(e))?;

        await_ack(waiter, AckKind::Publish, self.config.publish_timeout())
            .await
            .map_err(AckError::into_mqtt)
    }

    /// Serialize `value` as JSON and publish it at the configured QoS
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), MqttError> {
        let payload = serde_json::to_vec(value).map_err(MqttError::SerializationError)?;
        self.publish(topic, payload, self.qos).await
    }
}

/// Enqueue a request with a registered ack waiter, both under the client lock
async fn send_with_ack<F, Fut>(
    shared: &SharedState,
    kind: AckKind,
    send: F,
) -> Result<oneshot::Receiver<AckOutcome>, BoxError>
where
    F: FnOnce(AsyncClient) -> Fut,
    Fut: std::future::Future<Output = Result<(), rumqttc::v5::ClientError>>,
{
    let guard = shared.client.lock().await;
    let Some(client) = guard.as_ref() else {
        return Err("client session closed".into());
    };
    let waiter = shared.acks.register(kind);
    if let Err(e) = send(client.clone()).await {
        shared.acks.cancel_last(kind);
        return Err(Box::new(e));
    }
    Ok(waiter)
}

/// Failure modes of waiting for a broker acknowledgement
#[derive(Debug, PartialEq, Eq)]
enum AckError {
    Refused(String),
    TimedOut(AckKind, Duration),
    Closed,
}

impl AckError {
    fn into_mqtt(self) -> MqttError {
        match self {
            AckError::Refused(reason) => MqttError::PublishFailed(reason.into()),
            AckError::TimedOut(kind, timeout) => MqttError::AckTimeout {
                operation: kind.as_str(),
                timeout,
            },
            AckError::Closed => MqttError::Shutdown,
        }
    }
}

async fn await_ack(
    waiter: oneshot::Receiver<AckOutcome>,
    kind: AckKind,
    timeout: Duration,
) -> Result<(), AckError> {
    match tokio::time::timeout(timeout, waiter).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(AckError::Refused(reason)),
        Ok(Err(_)) => Err(AckError::Closed),
        Err(_) => Err(AckError::TimedOut(kind, timeout)),
    }
}

/// Wait until the state reaches `Connected`
///
/// `Disconnected` means the event loop gave up or was stopped. `None` waits
/// without a limit.
async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    limit: Option<Duration>,
) -> Result<(), MqttError> {
    let wait = async {
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(MqttError::ConnectionFailed(
                        "connection closed before ConnAck".into(),
                    ));
                }
                ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::Shutdown);
            }
        }
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .unwrap_or(Err(MqttError::ConnectTimeout(limit))),
        None => wait.await,
    }
}

/// Sleep unless shutdown is signalled first; returns false on shutdown
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Background driver of one rumqttc event loop
struct EventLoopTask {
    shared: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    reconnect: ReconnectConfig,
    qos: QoS,
    ack_timeout: Duration,
}

impl EventLoopTask {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ever_connected = false;
        let mut failures = 0u32;

        loop {
            let polled = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                    continue;
                }
                polled = event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    let route = route_mqtt_event(&event);
                    if self.shared.acks.observe(&route) {
                        continue;
                    }
                    self.handle_route(route, &mut ever_connected, &mut failures)
                        .await;
                }
                Err(e) => {
                    if self.shared.closing.load(Ordering::SeqCst) {
                        debug!(error = %e, "Connection closed during disconnect");
                        break;
                    }

                    failures += 1;
                    self.shared.record_error(e.to_string());
                    if *self.shared.state_tx.borrow() == ConnectionState::Connected {
                        metrics().mqtt_connection_lost();
                    } else {
                        metrics().mqtt_connection_failed();
                    }

                    match self.reconnect.decide(ever_connected, failures) {
                        RetryDecision::GiveUp => {
                            error!(error = %e, "MQTT connection lost, not retrying");
                            break;
                        }
                        RetryDecision::Retry(delay) => {
                            warn!(
                                error = %e,
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                "MQTT connection error, retrying"
                            );
                            self.shared.set_state(ConnectionState::Connecting);
                            if ever_connected {
                                metrics().mqtt_reconnect_scheduled();
                            }
                            if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                                break;
                            }
                            metrics().mqtt_connection_attempt();
                        }
                    }
                }
            }
        }

        self.shared.acks.clear();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("MQTT event loop stopped");
    }

    async fn handle_route(&self, route: EventRoute, ever_connected: &mut bool, failures: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                *failures = 0;
                self.shared.set_state(ConnectionState::Connected);
                metrics().mqtt_connection_established();
                info!(session_present, "Connected to MQTT broker");

                if *ever_connected && !session_present {
                    self.spawn_resubscribe();
                }
                *ever_connected = true;
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                debug!(topic = %topic, bytes = payload.len(), "Received MQTT message");
                self.dispatcher
                    .dispatch(InboundMessage {
                        topic,
                        payload,
                        retain,
                    })
                    .await;
            }
            EventRoute::Disconnected => {
                warn!("Broker closed the MQTT session");
                self.shared.set_state(ConnectionState::Disconnected);
                metrics().mqtt_connection_lost();
            }
            EventRoute::DisconnectSent => debug!("DISCONNECT sent"),
            EventRoute::Infrastructure(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            _ => {}
        }
    }

    /// Restore remembered subscriptions after a session was not resumed
    ///
    /// Runs on its own task: the subscribe requests travel through the very
    /// event loop this task is driving.
    fn spawn_resubscribe(&self) {
        let patterns = self.shared.remembered_patterns();
        if patterns.is_empty() {
            return;
        }
        info!(count = patterns.len(), "Session not resumed, re-subscribing");

        let shared = Arc::clone(&self.shared);
        let qos = self.qos;
        let ack_timeout = self.ack_timeout;
        tokio::spawn(async move {
            for pattern in patterns {
                let sent = send_with_ack(&shared, AckKind::Subscribe, |client| {
                    let pattern = pattern.clone();
                    async move { client.subscribe(pattern, qos).await }
                })
                .await;

                let outcome = match sent {
                    Ok(waiter) => await_ack(waiter, AckKind::Subscribe, ack_timeout)
                        .await
                        .map_err(|e| format!("{e:?}")),
                    Err(e) => Err(e.to_string()),
                };
                match outcome {
                    Ok(()) => debug!(pattern = %pattern, "Re-subscribed"),
                    Err(e) => error!(pattern = %pattern, error = %e, "Failed to re-subscribe"),
                }
            }
        });
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl MessageTransport for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    fn connection_state(&self) -> ConnectionState {
        MqttClient::connection_state(self)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, pattern, handler).await
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, pattern).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, qos_from_u8(qos)).await
    }
}
