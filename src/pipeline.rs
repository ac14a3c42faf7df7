use crate::context::{ErrorContext, MessageContext};
use crate::errors::BoxError;
use tokio_util::sync::CancellationToken;

/// What the engine's error pipeline decided for a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The failure was dealt with (delayed retry scheduled, moved to the
    /// error queue, ...). The message counts as consumed.
    Handled,
    /// The host must redeliver the message.
    RetryRequired,
}

/// Result of running one message through the pipelines.
#[derive(Debug)]
pub enum PipelineOutcome {
    Success,
    HandledFailure,
    /// Carries the original message-pipeline error.
    RetryRequired(BoxError),
}

impl PipelineOutcome {
    /// Returns `true` when the host should acknowledge the message.
    pub fn is_consumed(&self) -> bool {
        !matches!(self, PipelineOutcome::RetryRequired(_))
    }
}

/// The two pipeline entry points supplied by the bus engine.
///
/// # Example
///
/// ```rust
/// use hostbus::pipeline::{ErrorHandleResult, MessagePipeline};
/// use hostbus::context::{ErrorContext, MessageContext};
/// use hostbus::errors::BoxError;
/// use tokio_util::sync::CancellationToken;
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl MessagePipeline for Echo {
///     async fn on_message(
///         &self,
///         ctx: MessageContext,
///         _cancel: &CancellationToken,
///     ) -> Result<(), BoxError> {
///         println!("received {}", ctx.message_id);
///         Ok(())
///     }
///
///     async fn on_error(
///         &self,
///         _ctx: ErrorContext<'_>,
///         _cancel: &CancellationToken,
///     ) -> Result<ErrorHandleResult, BoxError> {
///         Ok(ErrorHandleResult::RetryRequired)
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait MessagePipeline: Send + Sync + 'static {
    /// Run the message pipeline for one message.
    async fn on_message(
        &self,
        context: MessageContext,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;

    /// Run the error pipeline after `on_message` failed.
    async fn on_error(
        &self,
        context: ErrorContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<ErrorHandleResult, BoxError>;
}
