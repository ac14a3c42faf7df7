//! Boundary with the bus engine.
//!
//! The engine is started against a configuration and an externally managed
//! [`ServiceRegistry`]; it returns its message pipeline (absent for
//! send-only endpoints) and a [`MessageSession`] for outbound operations.

use crate::config::EndpointConfiguration;
use crate::logging::LoggerContext;
use crate::message::OutgoingMessage;
use crate::pipeline::MessagePipeline;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

/// Services registered by the host and made available to the engine.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service`, replacing any earlier service of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outbound options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Explicit destination; otherwise the engine's routing decides.
    pub destination: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Endpoint publishing the event, for transports without native pub/sub.
    pub publisher: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(mut self, endpoint: impl Into<String>) -> Self {
        self.publisher = Some(endpoint.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Engine traits
// ---------------------------------------------------------------------------

/// Outbound operations of a started engine instance.
#[async_trait::async_trait]
pub trait MessageSession: Send + Sync {
    async fn send(
        &self,
        message: OutgoingMessage,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    async fn publish(
        &self,
        message: OutgoingMessage,
        options: PublishOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    async fn subscribe(
        &self,
        event_type: &str,
        options: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    async fn unsubscribe(
        &self,
        event_type: &str,
        options: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;
}

/// A started engine instance.
#[derive(Clone)]
pub struct StartedEndpoint {
    /// `None` when the engine was started without receive capability.
    pub pipeline: Option<Arc<dyn MessagePipeline>>,
    pub session: Arc<dyn MessageSession>,
}

impl fmt::Debug for StartedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedEndpoint")
            .field("receives", &self.pipeline.is_some())
            .finish()
    }
}

/// Starts the bus engine with an externally managed container.
#[async_trait::async_trait]
pub trait BusEngine: Send + Sync + 'static {
    async fn start(
        &self,
        configuration: &EndpointConfiguration,
        registry: &ServiceRegistry,
        logging: &Arc<LoggerContext>,
    ) -> crate::Result<StartedEndpoint>;
}

/// The message type name used for routing and the enclosed-types header:
/// the type's name without its module path.
pub fn message_type_of<M: ?Sized>() -> &'static str {
    let full = std::any::type_name::<M>();
    let base = full.split('<').next().unwrap_or(full);
    let start = base.rfind("::").map_or(0, |i| i + 2);
    &full[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderPlaced;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[test]
    fn test_message_type_strips_module_path() {
        assert_eq!(message_type_of::<OrderPlaced>(), "OrderPlaced");
        assert_eq!(message_type_of::<u32>(), "u32");
    }

    #[test]
    fn test_registry_round_trips_services() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        registry.insert(Clock(7));
        registry.insert("name".to_string());

        assert_eq!(registry.len(), 2);
        assert_eq!(*registry.get::<Clock>().unwrap(), Clock(7));
        assert_eq!(registry.get::<String>().unwrap().as_str(), "name");
        assert!(registry.get::<u8>().is_none());
    }

    #[test]
    fn test_send_options_builder() {
        let options = SendOptions::new()
            .destination("billing")
            .header("tenant", "t1")
            .correlation_id("c1");
        assert_eq!(options.destination.as_deref(), Some("billing"));
        assert_eq!(options.headers["tenant"], "t1");
        assert_eq!(options.correlation_id.as_deref(), Some("c1"));
    }
}
