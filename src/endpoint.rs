//! Public façade for a function-hosted endpoint.
//!
//! Every operation attaches the host's logger (once per process), starts the
//! engine on first use, and then delegates: `process` to the pipeline
//! invoker, everything else to the engine's session.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostbus::{EndpointConfiguration, FunctionContext, FunctionEndpoint, WireMessage};
//! use tokio_util::sync::CancellationToken;
//!
//! let endpoint = FunctionEndpoint::builder()
//!     .configuration(EndpointConfiguration::builder().endpoint_name("sales").build()?)
//!     .engine(my_engine)
//!     .build()?;
//!
//! let ctx = FunctionContext::new("ProcessSalesMessage");
//! endpoint.process(&wire, &ctx, &CancellationToken::new()).await?;
//! ```

use crate::config::EndpointConfiguration;
use crate::engine::{
    message_type_of, BusEngine, PublishOptions, SendOptions, ServiceRegistry, SubscribeOptions,
};
use crate::errors::BusError;
use crate::lazy::{EndpointHandle, LazyEndpoint, StartState};
use crate::logging::{LogSink, LoggerContext};
use crate::message::{InboundMessage, OutgoingMessage, WireMessage};
use crate::processor::MessageProcessor;
use crate::transaction::{NoTransactionStrategy, TransactionStrategy};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Trigger metadata for one host invocation.
#[derive(Clone)]
pub struct FunctionContext {
    pub invocation_id: String,
    pub function_name: String,
    /// The host's log destination, if it provides one.
    pub logger: Option<Arc<dyn LogSink>>,
}

impl FunctionContext {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            function_name: function_name.into(),
            logger: None,
        }
    }

    pub fn invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = id.into();
        self
    }

    pub fn logger(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logger = Some(sink);
        self
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("invocation_id", &self.invocation_id)
            .field("function_name", &self.function_name)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// A bus endpoint whose receive loop is owned by the function host.
pub struct FunctionEndpoint {
    lazy: LazyEndpoint,
    logging: Arc<LoggerContext>,
}

impl FunctionEndpoint {
    /// Create a new endpoint builder.
    pub fn builder() -> FunctionEndpointBuilder {
        FunctionEndpointBuilder::new()
    }

    pub fn configuration(&self) -> &EndpointConfiguration {
        self.lazy.configuration()
    }

    pub fn logging(&self) -> &Arc<LoggerContext> {
        &self.logging
    }

    pub fn state(&self) -> StartState {
        self.lazy.state()
    }

    /// Process one host-delivered message without a native transaction.
    ///
    /// `Ok` acknowledges the message; `Err` leaves redelivery to the host.
    pub async fn process(
        &self,
        message: &WireMessage,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.process_with_strategy(message, &NoTransactionStrategy, ctx, cancel)
            .await
    }

    /// Process one host-delivered message under `strategy`.
    pub async fn process_with_strategy(
        &self,
        message: &WireMessage,
        strategy: &dyn TransactionStrategy,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.attach_logger(ctx);
        if self.configuration().send_only {
            return Err(BusError::SendOnly);
        }

        let inbound = InboundMessage::from_wire(message);
        let span = tracing::info_span!(
            "process",
            endpoint = %self.configuration().endpoint_name,
            function = %ctx.function_name,
            invocation_id = %ctx.invocation_id,
            message_id = %inbound.id(),
        );

        async {
            let handle = self.lazy.ensure_started(cancel).await?;
            handle.processor().process(&inbound, strategy, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Send `message` to a single destination.
    pub async fn send<M: Serialize>(
        &self,
        message: &M,
        options: SendOptions,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let handle = self.prepare(ctx, cancel).await?;
        let outgoing = OutgoingMessage::json(message, message_type_of::<M>())?;
        handle.session().send(outgoing, options, cancel).await
    }

    /// Publish `event` to its subscribers.
    pub async fn publish<M: Serialize>(
        &self,
        event: &M,
        options: PublishOptions,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let handle = self.prepare(ctx, cancel).await?;
        let outgoing = OutgoingMessage::json(event, message_type_of::<M>())?;
        handle.session().publish(outgoing, options, cancel).await
    }

    /// Subscribe this endpoint to `event_type`.
    pub async fn subscribe(
        &self,
        event_type: &str,
        options: SubscribeOptions,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let handle = self.prepare(ctx, cancel).await?;
        handle.session().subscribe(event_type, options, cancel).await
    }

    pub async fn unsubscribe(
        &self,
        event_type: &str,
        options: SubscribeOptions,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let handle = self.prepare(ctx, cancel).await?;
        handle.session().unsubscribe(event_type, options, cancel).await
    }

    async fn prepare(
        &self,
        ctx: &FunctionContext,
        cancel: &CancellationToken,
    ) -> crate::Result<Arc<EndpointHandle>> {
        self.attach_logger(ctx);
        self.lazy.ensure_started(cancel).await
    }

    fn attach_logger(&self, ctx: &FunctionContext) {
        if let Some(sink) = &ctx.logger {
            if !self.logging.is_attached() {
                self.logging.try_attach_sink(sink.clone());
            }
        }
    }
}

impl fmt::Debug for FunctionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEndpoint")
            .field("lazy", &self.lazy)
            .finish()
    }
}

/// Builder for [`FunctionEndpoint`].
#[derive(Default)]
pub struct FunctionEndpointBuilder {
    configuration: Option<EndpointConfiguration>,
    engine: Option<Arc<dyn BusEngine>>,
    services: ServiceRegistry,
    logging: Option<Arc<LoggerContext>>,
}

impl FunctionEndpointBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn configuration(mut self, configuration: EndpointConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn engine(mut self, engine: impl BusEngine) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Services handed to the engine when it starts.
    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Share a process-wide logger context. A private one is created
    /// otherwise.
    pub fn logging(mut self, logging: Arc<LoggerContext>) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn build(self) -> crate::Result<FunctionEndpoint> {
        let configuration = self
            .configuration
            .ok_or_else(|| BusError::Configuration("endpoint configuration is required".into()))?;
        let engine = self
            .engine
            .ok_or_else(|| BusError::Configuration("bus engine is required".into()))?;
        let logging = self.logging.unwrap_or_default();

        Ok(FunctionEndpoint {
            lazy: LazyEndpoint::new(engine, configuration, self.services, logging.clone()),
            logging,
        })
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::config::MapSource;
    use crate::logging::LogLevel;
    use crate::testing::{InMemoryEngine, InMemoryTransport, RecordingSink};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    fn config(send_only: bool) -> EndpointConfiguration {
        EndpointConfiguration::builder()
            .source(MapSource::new())
            .endpoint_name("pinger")
            .send_only(send_only)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_engine() {
        let err = FunctionEndpoint::builder()
            .configuration(config(false))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_send_only_process_never_starts_engine() {
        let engine = InMemoryEngine::new(InMemoryTransport::new());
        let endpoint = FunctionEndpoint::builder()
            .configuration(config(true))
            .engine(engine.clone())
            .build()
            .unwrap();

        let ctx = FunctionContext::new("f");
        let err = endpoint
            .process(&WireMessage::new("{}"), &ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::SendOnly));
        assert!(err.to_string().contains("send_only"));
        assert_eq!(engine.starts(), 0);
        assert_eq!(endpoint.state(), StartState::NotStarted);
    }

    #[tokio::test]
    async fn test_host_logger_attached_once() {
        let transport = InMemoryTransport::new();
        let endpoint = FunctionEndpoint::builder()
            .configuration(config(false))
            .engine(InMemoryEngine::new(transport.clone()).route::<Ping>("pong"))
            .build()
            .unwrap();

        let early = endpoint.logging().get_logger("app");
        early.info("before attach");

        let first = Arc::new(RecordingSink::new());
        let second = Arc::new(RecordingSink::new());
        let cancel = CancellationToken::new();

        endpoint
            .send(
                &Ping { n: 1 },
                SendOptions::new(),
                &FunctionContext::new("f").logger(first.clone()),
                &cancel,
            )
            .await
            .unwrap();
        endpoint
            .send(
                &Ping { n: 2 },
                SendOptions::new(),
                &FunctionContext::new("f").logger(second.clone()),
                &cancel,
            )
            .await
            .unwrap();

        assert!(first.contains(LogLevel::Info, "before attach"));
        assert!(second.entries().is_empty());
        assert_eq!(transport.len("pong"), 2);
        assert_eq!(endpoint.state(), StartState::Started);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_cold_starts_attach_quietly() {
        let transport = InMemoryTransport::new();
        let endpoint = Arc::new(
            FunctionEndpoint::builder()
                .configuration(config(false))
                .engine(InMemoryEngine::new(transport.clone()).route::<Ping>("pong"))
                .build()
                .unwrap(),
        );

        let sinks: Vec<Arc<RecordingSink>> =
            (0..16).map(|_| Arc::new(RecordingSink::new())).collect();
        let mut tasks = tokio::task::JoinSet::new();
        for (n, sink) in sinks.iter().enumerate() {
            let endpoint = endpoint.clone();
            let sink = sink.clone();
            tasks.spawn(async move {
                let ctx = FunctionContext::new("f").logger(sink);
                endpoint
                    .send(&Ping { n: n as u32 }, SendOptions::new(), &ctx, &CancellationToken::new())
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert!(endpoint.logging().is_attached());
        assert!(sinks
            .iter()
            .all(|sink| !sink.contains(LogLevel::Warn, "already attached")));
        assert_eq!(transport.len("pong"), 16);
    }
}
