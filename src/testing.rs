//! In-memory bus engine and test doubles.
//!
//! [`InMemoryEngine`] dispatches JSON messages to typed handlers and applies
//! the configured recoverability policy; [`InMemoryTransport`] holds named
//! queues shared by any number of endpoints, so one endpoint's sends can be
//! fed to another endpoint's `process`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hostbus::testing::{InMemoryEngine, InMemoryTransport};
//!
//! let transport = InMemoryTransport::new();
//! let engine = InMemoryEngine::new(transport.clone())
//!     .handle(|order: PlaceOrder, _ctx| async move { Ok(()) });
//! ```

use crate::config::EndpointConfiguration;
use crate::context::{ErrorContext, MessageContext, TransportTransaction};
use crate::engine::{
    message_type_of, BusEngine, MessageSession, PublishOptions, SendOptions, ServiceRegistry,
    StartedEndpoint, SubscribeOptions,
};
use crate::errors::{BoxError, BusError};
use crate::headers;
use crate::logging::{DeferredLogEntry, DeferredLogger, LogLevel, LogSink, LoggerContext};
use crate::message::{OutgoingMessage, WireMessage};
use crate::pipeline::{ErrorHandleResult, MessagePipeline};
use crate::recoverability::{self, RecoverabilityAction, RecoverabilitySettings};
use crate::transaction::{NativeTransaction, TransactionHandle, TransactionStrategy};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Message type → destination endpoint.
pub type Routes = BTreeMap<String, String>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A message scheduled for later delivery.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub queue: String,
    pub delay: Duration,
    pub message: WireMessage,
}

#[derive(Default)]
struct TransportInner {
    queues: HashMap<String, VecDeque<WireMessage>>,
    deferred: Vec<DeferredMessage>,
    subscriptions: HashMap<String, BTreeSet<String>>,
}

/// Named in-memory queues shared by endpoints.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session sending on behalf of `endpoint`.
    pub fn session(&self, endpoint: &str, routes: Routes) -> InMemorySession {
        InMemorySession {
            endpoint: endpoint.to_string(),
            routes,
            transport: self.clone(),
        }
    }

    pub fn enqueue(&self, queue: &str, message: WireMessage) {
        lock(&self.inner)
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    /// Take the oldest message from `queue`.
    pub fn receive(&self, queue: &str) -> Option<WireMessage> {
        lock(&self.inner)
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }

    pub fn len(&self, queue: &str) -> usize {
        lock(&self.inner)
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn schedule(&self, queue: &str, message: WireMessage, delay: Duration) {
        lock(&self.inner).deferred.push(DeferredMessage {
            queue: queue.to_string(),
            delay,
            message,
        });
    }

    /// Messages waiting for their delay to elapse.
    pub fn deferred(&self) -> Vec<DeferredMessage> {
        lock(&self.inner).deferred.clone()
    }

    /// Deliver every deferred message now. Returns how many were released.
    pub fn release_deferred(&self) -> usize {
        let mut inner = lock(&self.inner);
        let deferred = std::mem::take(&mut inner.deferred);
        let count = deferred.len();
        for d in deferred {
            inner.queues.entry(d.queue).or_default().push_back(d.message);
        }
        count
    }

    pub fn subscribers(&self, event_type: &str) -> Vec<String> {
        lock(&self.inner)
            .subscriptions
            .get(event_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribe(&self, event_type: &str, endpoint: &str) {
        lock(&self.inner)
            .subscriptions
            .entry(event_type.to_string())
            .or_default()
            .insert(endpoint.to_string());
    }

    fn unsubscribe(&self, event_type: &str, endpoint: &str) {
        if let Some(subs) = lock(&self.inner).subscriptions.get_mut(event_type) {
            subs.remove(endpoint);
        }
    }
}

/// Outbound operations against an [`InMemoryTransport`].
#[derive(Clone)]
pub struct InMemorySession {
    endpoint: String,
    routes: Routes,
    transport: InMemoryTransport,
}

impl InMemorySession {
    fn stamp(&self, message: &mut OutgoingMessage) {
        message
            .headers
            .insert(headers::ORIGINATING_ENDPOINT.to_string(), self.endpoint.clone());
        message
            .headers
            .entry(headers::REPLY_TO_ADDRESS.to_string())
            .or_insert_with(|| self.endpoint.clone());
    }
}

#[async_trait::async_trait]
impl MessageSession for InMemorySession {
    async fn send(
        &self,
        mut message: OutgoingMessage,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let destination = options
            .destination
            .or_else(|| self.routes.get(&message.message_type).cloned())
            .ok_or_else(|| {
                BusError::Routing(format!(
                    "no destination configured for message type {}",
                    message.message_type
                ))
            })?;

        message.headers.extend(options.headers);
        if let Some(correlation_id) = options.correlation_id {
            message
                .headers
                .insert(headers::CORRELATION_ID.to_string(), correlation_id);
        }
        if let Some(reply_to) = options.reply_to {
            message
                .headers
                .insert(headers::REPLY_TO_ADDRESS.to_string(), reply_to);
        }
        self.stamp(&mut message);

        tracing::debug!(
            endpoint = %self.endpoint,
            destination = %destination,
            message_type = %message.message_type,
            "sending message"
        );
        self.transport.enqueue(&destination, message.to_wire());
        Ok(())
    }

    async fn publish(
        &self,
        mut message: OutgoingMessage,
        options: PublishOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        message.headers.extend(options.headers);
        self.stamp(&mut message);

        let wire = message.to_wire();
        for subscriber in self.transport.subscribers(&message.message_type) {
            self.transport.enqueue(&subscriber, wire.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        event_type: &str,
        _options: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        self.transport.subscribe(event_type, &self.endpoint);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        event_type: &str,
        _options: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        self.transport.unsubscribe(event_type, &self.endpoint);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Context passed to in-memory handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    /// Session for sending follow-up messages.
    pub session: Arc<dyn MessageSession>,
}

type HandlerFn = Arc<
    dyn Fn(serde_json::Value, HandlerContext) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

/// A bus engine dispatching JSON messages to registered handlers.
#[derive(Clone)]
pub struct InMemoryEngine {
    transport: InMemoryTransport,
    handlers: HashMap<String, HandlerFn>,
    routes: Routes,
    starts: Arc<AtomicUsize>,
}

impl InMemoryEngine {
    pub fn new(transport: InMemoryTransport) -> Self {
        Self {
            transport,
            handlers: HashMap::new(),
            routes: Routes::new(),
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a handler for messages of type `M`.
    pub fn handle<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: DeserializeOwned + Send + 'static,
        F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handler: HandlerFn = Arc::new(move |body, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let message: M = serde_json::from_value(body)?;
                handler(message, ctx).await
            })
        });
        self.handlers
            .insert(message_type_of::<M>().to_string(), handler);
        self
    }

    /// Route messages of type `M` to `endpoint`.
    pub fn route<M: ?Sized>(mut self, endpoint: impl Into<String>) -> Self {
        self.routes
            .insert(message_type_of::<M>().to_string(), endpoint.into());
        self
    }

    /// Number of times the engine was started.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BusEngine for InMemoryEngine {
    async fn start(
        &self,
        configuration: &EndpointConfiguration,
        _registry: &ServiceRegistry,
        logging: &Arc<LoggerContext>,
    ) -> crate::Result<StartedEndpoint> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn MessageSession> = Arc::new(
            self.transport
                .session(&configuration.endpoint_name, self.routes.clone()),
        );

        let pipeline: Option<Arc<dyn MessagePipeline>> = if configuration.send_only {
            None
        } else {
            Some(Arc::new(InMemoryPipeline {
                endpoint: configuration.endpoint_name.clone(),
                handlers: self.handlers.clone(),
                session: session.clone(),
                transport: self.transport.clone(),
                recoverability: configuration.recoverability.clone(),
                log: logging.get_logger("hostbus.recoverability"),
            }))
        };

        Ok(StartedEndpoint { pipeline, session })
    }
}

struct InMemoryPipeline {
    endpoint: String,
    handlers: HashMap<String, HandlerFn>,
    session: Arc<dyn MessageSession>,
    transport: InMemoryTransport,
    recoverability: RecoverabilitySettings,
    log: Arc<DeferredLogger>,
}

impl InMemoryPipeline {
    fn failed_copy(ctx: &ErrorContext<'_>, extra: &[(&str, String)]) -> WireMessage {
        let mut message = WireMessage::new(ctx.body.clone()).message_id(ctx.message_id.clone());
        for (key, value) in &ctx.headers {
            message = message.property(key.clone(), value.clone());
        }
        for (key, value) in extra {
            message = message.property(*key, value.clone());
        }
        message
    }
}

#[async_trait::async_trait]
impl MessagePipeline for InMemoryPipeline {
    async fn on_message(
        &self,
        ctx: MessageContext,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let message_type = ctx
            .headers
            .get(headers::ENCLOSED_MESSAGE_TYPES)
            .cloned()
            .unwrap_or_default();
        let handler = self
            .handlers
            .get(&message_type)
            .cloned()
            .ok_or_else(|| BusError::NoHandler(message_type.clone()))?;

        let body: serde_json::Value = serde_json::from_slice(&ctx.body)?;
        let handler_ctx = HandlerContext {
            message_id: ctx.message_id,
            headers: ctx.headers,
            session: self.session.clone(),
        };
        handler(body, handler_ctx).await
    }

    async fn on_error(
        &self,
        ctx: ErrorContext<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ErrorHandleResult, BoxError> {
        let reason = ctx.error.to_string();
        match recoverability::decide(&self.recoverability, &ctx) {
            RecoverabilityAction::ImmediateRetry => {
                self.log.warn_format(
                    "Immediate retry for message {} (delivery {})",
                    &[&ctx.message_id, &ctx.delivery_count],
                );
                Ok(ErrorHandleResult::RetryRequired)
            }
            RecoverabilityAction::DelayedRetry { attempt, delay } => {
                self.log.warn_with_error(
                    format!(
                        "Delayed retry {} for message {} in {:?}",
                        attempt, ctx.message_id, delay
                    ),
                    &reason,
                );
                let copy = Self::failed_copy(
                    &ctx,
                    &[(headers::DELAYED_RETRIES, attempt.to_string())],
                );
                self.transport.schedule(&self.endpoint, copy, delay);
                Ok(ErrorHandleResult::Handled)
            }
            RecoverabilityAction::MoveToErrorQueue { queue } => {
                self.log.error_with_error(
                    format!("Moving message {} to the error queue {}", ctx.message_id, queue),
                    &reason,
                );
                let copy = Self::failed_copy(
                    &ctx,
                    &[
                        (headers::FAILED_QUEUE, self.endpoint.clone()),
                        (headers::EXCEPTION_MESSAGE, reason.clone()),
                    ],
                );
                self.transport.enqueue(&queue, copy);
                Ok(ErrorHandleResult::Handled)
            }
            RecoverabilityAction::Fail => {
                self.log.error_with_error(
                    format!(
                        "Message {} exhausted its retries and error queue routing is disabled",
                        ctx.message_id
                    ),
                    &reason,
                );
                Ok(ErrorHandleResult::RetryRequired)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording doubles
// ---------------------------------------------------------------------------

/// A log sink that keeps every entry.
#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(String, DeferredLogEntry)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, DeferredLogEntry)> {
        lock(&self.entries).clone()
    }

    /// Whether an entry at `level` contains `text` in its rendered message.
    pub fn contains(&self, level: LogLevel, text: &str) -> bool {
        lock(&self.entries)
            .iter()
            .any(|(_, e)| e.level == level && e.render().contains(text))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, logger: &str, entry: &DeferredLogEntry) {
        lock(&self.entries).push((logger.to_string(), entry.clone()));
    }
}

/// Transaction events observed by a [`RecordingStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Created(Uuid),
    Completed(Uuid),
    Committed(Uuid),
    RolledBack(Uuid),
}

type EventLog = Arc<Mutex<Vec<TransactionEvent>>>;

struct RecordingNative {
    id: OnceLock<Uuid>,
    events: EventLog,
    fail_commit: bool,
}

impl NativeTransaction for RecordingNative {
    fn commit(&self) -> Result<(), BoxError> {
        if let Some(id) = self.id.get() {
            lock(&self.events).push(TransactionEvent::Committed(*id));
        }
        if self.fail_commit {
            return Err("commit rejected".into());
        }
        Ok(())
    }

    fn rollback(&self) {
        if let Some(id) = self.id.get() {
            lock(&self.events).push(TransactionEvent::RolledBack(*id));
        }
    }
}

/// A transaction strategy recording every create/complete/commit/rollback.
#[derive(Clone, Default)]
pub struct RecordingStrategy {
    events: EventLog,
    fail_commit: bool,
}

impl RecordingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every native commit fail.
    pub fn failing_commit() -> Self {
        Self {
            fail_commit: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        lock(&self.events).clone()
    }

    pub fn created(&self) -> Vec<Uuid> {
        self.filter(|e| match e {
            TransactionEvent::Created(id) => Some(id),
            _ => None,
        })
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.filter(|e| match e {
            TransactionEvent::Completed(id) => Some(id),
            _ => None,
        })
    }

    pub fn committed(&self) -> Vec<Uuid> {
        self.filter(|e| match e {
            TransactionEvent::Committed(id) => Some(id),
            _ => None,
        })
    }

    pub fn rolled_back(&self) -> Vec<Uuid> {
        self.filter(|e| match e {
            TransactionEvent::RolledBack(id) => Some(id),
            _ => None,
        })
    }

    fn filter(&self, f: impl Fn(TransactionEvent) -> Option<Uuid>) -> Vec<Uuid> {
        self.events().into_iter().filter_map(f).collect()
    }
}

#[async_trait::async_trait]
impl TransactionStrategy for RecordingStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        let native = Arc::new(RecordingNative {
            id: OnceLock::new(),
            events: self.events.clone(),
            fail_commit: self.fail_commit,
        });
        let handle = TransactionHandle::new(native.clone());
        let _ = native.id.set(handle.id());
        lock(&self.events).push(TransactionEvent::Created(handle.id()));
        Some(handle)
    }

    fn create_transport_transaction(
        &self,
        _transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        TransportTransaction::empty()
    }

    async fn complete(
        &self,
        transaction: Option<&TransactionHandle>,
        _cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if let Some(tx) = transaction {
            lock(&self.events).push(TransactionEvent::Completed(tx.id()));
        }
        Ok(())
    }
}
