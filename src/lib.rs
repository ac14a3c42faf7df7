#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::ignored_unit_patterns)]
//! # hostbus
//!
//! Run message-bus endpoints inside function hosts (AWS Lambda, queue
//! triggers) that own the receive loop. The host pushes each message in;
//! `hostbus` starts the bus engine on first use, runs the message through
//! the engine's pipeline under a per-attempt transaction, and maps the
//! engine's verdict back to "acknowledge" or "fail so the host redelivers".
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hostbus::testing::{InMemoryEngine, InMemoryTransport};
//! use hostbus::{BoxError, EndpointConfiguration, FunctionContext, FunctionEndpoint, WireMessage};
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Deserialize)]
//! struct PlaceOrder {
//!     order_id: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> hostbus::Result<()> {
//! let engine = InMemoryEngine::new(InMemoryTransport::new()).handle(
//!     |order: PlaceOrder, _ctx| async move {
//!         println!("placing {}", order.order_id);
//!         Ok::<(), BoxError>(())
//!     },
//! );
//!
//! let endpoint = FunctionEndpoint::builder()
//!     .configuration(EndpointConfiguration::builder().endpoint_name("sales").build()?)
//!     .engine(engine)
//!     .build()?;
//!
//! let wire = WireMessage::new(r#"{"order_id":"42"}"#).property("Bus.EnclosedMessageTypes", "PlaceOrder");
//! endpoint
//!     .process(&wire, &FunctionContext::new("ProcessOrders"), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lazy start**: the engine starts once, on the first invocation
//! - **Transactional processing**: pluggable [`TransactionStrategy`] per attempt
//! - **Recoverability**: immediate and delayed retries, then the error queue
//! - **Deferred logging**: loggers usable before the host's logging exists

pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod errors;
pub mod headers;
pub mod lazy;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod recoverability;
#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
pub mod transaction;

/// Host adapters for AWS Lambda and other FaaS platforms.
#[cfg(feature = "serverless-lambda")]
#[cfg_attr(docsrs, doc(cfg(feature = "serverless-lambda")))]
pub mod serverless;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use config::{
    ConfigurationSource, EndpointConfiguration, EndpointConfigurationBuilder, EnvSource, MapSource,
    TransactionMode,
};
pub use context::{ErrorContext, MessageContext, TransportTransaction};
pub use endpoint::{FunctionContext, FunctionEndpoint, FunctionEndpointBuilder};
pub use engine::{
    message_type_of, BusEngine, MessageSession, PublishOptions, SendOptions, ServiceRegistry,
    StartedEndpoint, SubscribeOptions,
};
pub use errors::{BoxError, BusError, Result};
pub use lazy::{EndpointHandle, LazyEndpoint, StartState};
pub use logging::{
    DeferredLogEntry, DeferredLogger, LogLevel, LogSink, LogSinkFactory, LoggerContext, TracingSink,
};
pub use message::{InboundMessage, OutgoingMessage, WireMessage};
pub use pipeline::{ErrorHandleResult, MessagePipeline, PipelineOutcome};
pub use processor::{MessageProcessor, PipelineInvoker};
pub use recoverability::{RecoverabilityAction, RecoverabilitySettings};
pub use transaction::{
    CompletionStep, HostTransactionStrategy, NativeTransaction, NoTransactionStrategy,
    TransactionHandle, TransactionStrategy,
};
