//! Message dispatcher and worker pool
//!
//! The event loop pushes every inbound publish into [`Dispatcher::dispatch`].
//! Messages are sharded over a fixed set of workers by topic hash, so one
//! topic is always served by one worker in arrival order while different
//! topics proceed in parallel.
//!
//! Queues are bounded and a full queue makes the event loop wait. While it
//! waits the connection is not polled, so PubAck, SubAck and PingResp
//! packets sit unread and keep-alive pings are not sent. Handlers that stall
//! for longer than the keep-alive interval therefore cost the session; size
//! `dispatch.queue_capacity` for the expected burst instead of dropping
//! QoS 1 deliveries the broker considers handed over.
//!
//! Each handler call runs in its own task that the worker awaits. A panicking
//! handler surfaces as a `JoinError`, is logged and counted, and the worker
//! moves on to the next message.

use super::registry::HandlerRegistry;
use crate::observability::metrics;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Concrete topic, never a pattern
    pub topic: String,
    pub payload: Vec<u8>,
    /// Replayed by the broker from its retained store rather than published live
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retain: false,
        }
    }

    /// Payload as text, with invalid UTF-8 replaced
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Callback invoked for messages on a subscribed pattern
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage);
}

/// Adapter turning a synchronous closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&InboundMessage) + Send + Sync,
{
    async fn handle(&self, message: &InboundMessage) {
        (self.0)(message)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&InboundMessage) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Fallback for topics no registered pattern claims
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &InboundMessage) {
        metrics().message_unhandled();
        info!(
            topic = %message.topic,
            retain = message.retain,
            payload = %message.payload_lossy(),
            "Received message with no registered handler"
        );
    }
}

/// Resolves and invokes handlers on a bounded worker pool
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    default_handler: Arc<dyn MessageHandler>,
    queues: Vec<mpsc::Sender<InboundMessage>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("workers", &self.queues.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Spawn `workers` dispatch tasks, each with a queue of `capacity`
    ///
    /// Must be called from within a tokio runtime. Zero values are raised
    /// to one.
    pub fn start(registry: Arc<HandlerRegistry>, workers: usize, capacity: usize) -> Self {
        Self::start_with_default(registry, Arc::new(LoggingHandler), workers, capacity)
    }

    /// Like [`Dispatcher::start`] with a custom fallback handler
    pub fn start_with_default(
        registry: Arc<HandlerRegistry>,
        default_handler: Arc<dyn MessageHandler>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let worker_count = workers.max(1);
        let mut queues = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                rx,
                Arc::clone(&registry),
                Arc::clone(&default_handler),
            )));
        }

        debug!(workers = worker_count, "Dispatcher started");
        Self {
            registry,
            default_handler,
            queues,
            workers: handles,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Queue a message on the worker owning its topic
    ///
    /// Waits while that worker's queue is full. The MQTT event loop calls
    /// this inline, so the wait also holds back every packet behind the
    /// message, acknowledgements and keep-alive responses included.
    pub async fn dispatch(&self, message: InboundMessage) {
        metrics().message_received();
        let shard = shard_for(&message.topic, self.queues.len());
        if let Err(mpsc::error::SendError(message)) = self.queues[shard].send(message).await {
            error!(
                topic = %message.topic,
                worker = shard,
                "Dispatch worker unavailable, delivering inline"
            );
            deliver(&self.registry, &self.default_handler, message).await;
        }
    }

    /// Resolve and invoke the handler on the calling task
    pub async fn dispatch_now(&self, message: InboundMessage) {
        metrics().message_received();
        deliver(&self.registry, &self.default_handler, message).await;
    }

    /// Stop accepting messages and wait for queued ones to finish
    pub async fn shutdown(self) {
        let Dispatcher { queues, workers, .. } = self;
        drop(queues);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatch worker ended abnormally");
            }
        }
    }
}

/// Worker index for a topic; stable for the life of the process
pub fn shard_for(topic: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<InboundMessage>,
    registry: Arc<HandlerRegistry>,
    default_handler: Arc<dyn MessageHandler>,
) {
    while let Some(message) = rx.recv().await {
        deliver(&registry, &default_handler, message).await;
    }
    debug!(worker = index, "Dispatch worker stopped");
}

/// Resolve the handler for one message and run it in isolation
async fn deliver(
    registry: &HandlerRegistry,
    default_handler: &Arc<dyn MessageHandler>,
    message: InboundMessage,
) {
    let (pattern, handler) = match registry.resolve(&message.topic) {
        Some(resolved) => (Some(resolved.pattern), resolved.handler),
        None => (None, Arc::clone(default_handler)),
    };

    let message = Arc::new(message);
    let task_message = Arc::clone(&message);
    let started = Instant::now();
    let outcome = tokio::spawn(async move { handler.handle(&task_message).await }).await;

    match outcome {
        Ok(()) => {
            metrics().message_dispatched(started.elapsed());
            debug!(
                topic = %message.topic,
                pattern = pattern.as_deref().unwrap_or("<default>"),
                "Message dispatched"
            );
        }
        Err(e) if e.is_panic() => {
            metrics().handler_panicked();
            error!(
                topic = %message.topic,
                pattern = pattern.as_deref().unwrap_or("<default>"),
                payload = %message.payload_lossy(),
                "Message handler panicked"
            );
        }
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Message handler cancelled");
        }
    }
}
