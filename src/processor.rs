//! Runs one externally delivered message through the engine's pipelines.
//!
//! The [`PipelineInvoker`] starts out unbound and becomes ready once it is
//! bound to the engine's pipeline (or marked send-only). Every call to
//! [`MessageProcessor::process`] then follows the same protocol:
//!
//! 1. open a transaction and run the message pipeline under it;
//! 2. on success, complete and commit that transaction;
//! 3. on failure, run the error pipeline under a *fresh* transaction;
//!    `Handled` completes and commits it, `RetryRequired` rethrows the
//!    original error so the host redelivers;
//! 4. a failing error pipeline propagates its own error;
//! 5. cancellation bypasses the error pipeline entirely.

use crate::context;
use crate::errors::{is_cancellation, BusError};
use crate::message::InboundMessage;
use crate::pipeline::{ErrorHandleResult, MessagePipeline, PipelineOutcome};
use crate::transaction::{TransactionHandle, TransactionStrategy};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Processes messages pushed in by the host.
#[async_trait::async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process one message. Returning `Ok` tells the host to acknowledge it.
    async fn process(
        &self,
        message: &InboundMessage,
        strategy: &dyn TransactionStrategy,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;
}

enum Binding<P: ?Sized> {
    Receive(Arc<P>),
    SendOnly,
}

/// The state machine bridging host invocations to the engine pipelines.
pub struct PipelineInvoker<P: MessagePipeline + ?Sized = dyn MessagePipeline> {
    binding: OnceLock<Binding<P>>,
}

impl<P: MessagePipeline + ?Sized> PipelineInvoker<P> {
    /// Create an unbound invoker.
    pub fn new() -> Self {
        Self {
            binding: OnceLock::new(),
        }
    }

    /// Create an invoker bound to `pipeline`.
    pub fn bound(pipeline: Arc<P>) -> Self {
        let invoker = Self::new();
        let _ = invoker.binding.set(Binding::Receive(pipeline));
        invoker
    }

    /// Create an invoker for an endpoint without receive capability.
    pub fn send_only() -> Self {
        let invoker = Self::new();
        let _ = invoker.binding.set(Binding::SendOnly);
        invoker
    }

    /// Bind the engine pipeline. Binding happens once.
    pub fn bind(&self, pipeline: Arc<P>) -> crate::Result<()> {
        self.binding
            .set(Binding::Receive(pipeline))
            .map_err(|_| BusError::Configuration("message processor is already bound".into()))
    }

    /// Mark the invoker send-only. Binding happens once.
    pub fn bind_send_only(&self) -> crate::Result<()> {
        self.binding
            .set(Binding::SendOnly)
            .map_err(|_| BusError::Configuration("message processor is already bound".into()))
    }

    /// Returns `true` once bound.
    pub fn is_ready(&self) -> bool {
        self.binding.get().is_some()
    }

    pub fn is_send_only(&self) -> bool {
        matches!(self.binding.get(), Some(Binding::SendOnly))
    }

    /// Run the pipelines for one message and report the outcome.
    ///
    /// `Err` is returned for cancellation, error-pipeline failures,
    /// completion/commit failures, and unusable bindings.
    pub async fn execute(
        &self,
        message: &InboundMessage,
        strategy: &dyn TransactionStrategy,
        cancel: &CancellationToken,
    ) -> crate::Result<PipelineOutcome> {
        let pipeline = match self.binding.get() {
            Some(Binding::Receive(pipeline)) => pipeline,
            Some(Binding::SendOnly) => return Err(BusError::SendOnly),
            None => return Err(BusError::NotInitialized),
        };

        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        tracing::debug!(
            message_id = %message.id(),
            delivery_count = message.delivery_count(),
            "processing message"
        );

        let transaction = strategy.create_transaction();
        let token = strategy.create_transport_transaction(transaction.as_ref());
        let ctx = context::message_context(message, token);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled),
            result = pipeline.on_message(ctx, cancel) => result,
        };

        let error = match result {
            Ok(()) => {
                commit(strategy, transaction, cancel).await?;
                tracing::debug!(message_id = %message.id(), "message processed");
                return Ok(PipelineOutcome::Success);
            }
            Err(e) if is_cancellation(e.as_ref()) => {
                return Err(BusError::Cancelled);
            }
            Err(e) => e,
        };

        // The failed attempt's transaction may be poisoned.
        drop(transaction);

        tracing::warn!(
            message_id = %message.id(),
            delivery_count = message.delivery_count(),
            error = %error,
            "message pipeline failed, invoking error pipeline"
        );

        let error_transaction = strategy.create_transaction();
        let token = strategy.create_transport_transaction(error_transaction.as_ref());
        let ctx = context::error_context(message, error.as_ref(), token);

        let decision = pipeline.on_error(ctx, cancel).await.map_err(|e| {
            tracing::error!(
                message_id = %message.id(),
                error = %e,
                "error pipeline failed"
            );
            BusError::ErrorPipeline(e)
        })?;

        match decision {
            ErrorHandleResult::Handled => {
                commit(strategy, error_transaction, cancel).await?;
                tracing::debug!(message_id = %message.id(), "failure handled by error pipeline");
                Ok(PipelineOutcome::HandledFailure)
            }
            ErrorHandleResult::RetryRequired => {
                tracing::debug!(message_id = %message.id(), "retry required, returning failure to host");
                Ok(PipelineOutcome::RetryRequired(error))
            }
        }
    }
}

async fn commit(
    strategy: &dyn TransactionStrategy,
    transaction: Option<TransactionHandle>,
    cancel: &CancellationToken,
) -> crate::Result<()> {
    strategy.complete(transaction.as_ref(), cancel).await?;
    match transaction {
        Some(tx) => tx.commit(),
        None => Ok(()),
    }
}

impl<P: MessagePipeline + ?Sized> Default for PipelineInvoker<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MessagePipeline + ?Sized> fmt::Debug for PipelineInvoker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.binding.get() {
            None => "uninitialized",
            Some(Binding::SendOnly) => "send_only",
            Some(Binding::Receive(_)) => "ready",
        };
        f.debug_struct("PipelineInvoker").field("state", &state).finish()
    }
}

#[async_trait::async_trait]
impl<P: MessagePipeline + ?Sized> MessageProcessor for PipelineInvoker<P> {
    async fn process(
        &self,
        message: &InboundMessage,
        strategy: &dyn TransactionStrategy,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        match self.execute(message, strategy, cancel).await? {
            PipelineOutcome::Success | PipelineOutcome::HandledFailure => Ok(()),
            PipelineOutcome::RetryRequired(error) => Err(BusError::Pipeline(error)),
        }
    }
}
