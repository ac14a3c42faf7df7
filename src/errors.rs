use std::error::Error as StdError;

/// A boxed, thread-safe error as produced by engine pipelines and handlers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Main error type
// ---------------------------------------------------------------------------

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The message pipeline failed and the error pipeline asked for a retry.
    ///
    /// Carries the original pipeline error unchanged.
    #[error("message pipeline failed: {0}")]
    Pipeline(#[source] BoxError),

    /// The error pipeline itself failed while handling a pipeline failure.
    #[error("error pipeline failed: {0}")]
    ErrorPipeline(#[source] BoxError),

    /// The endpoint was configured without receive capability.
    #[error(
        "endpoint cannot process messages in send-only mode; remove the `send_only` \
         setting from the endpoint configuration to receive messages"
    )]
    SendOnly,

    /// The operation was cancelled by the host.
    #[error("operation cancelled")]
    Cancelled,

    /// Starting the bus engine failed. A later call retries the start.
    #[error("endpoint start failed: {0}")]
    Startup(#[source] BoxError),

    /// The message processor was used before it was bound to a pipeline.
    #[error("message processor is not initialized")]
    NotInitialized,

    /// Completing or committing a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid or missing endpoint configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transport could not accept or deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// No handler registered for the given message type.
    #[error("no handler registered for message type: {0}")]
    NoHandler(String),

    /// No destination could be resolved for an outgoing message.
    #[error("routing error: {0}")]
    Routing(String),
}

impl BusError {
    /// Returns the original pipeline error for [`BusError::Pipeline`], or the
    /// error-pipeline error for [`BusError::ErrorPipeline`].
    ///
    /// Callers use this to downcast to their own error types.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            BusError::Pipeline(e) | BusError::ErrorPipeline(e) | BusError::Startup(e) => {
                Some(e.as_ref())
            }
            _ => None,
        }
    }

    /// Returns `true` if this error is a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BusError::Cancelled)
    }

    /// Returns `false` for static configuration contradictions that fail the
    /// same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BusError::SendOnly | BusError::Configuration(_) | BusError::Cancelled
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// Returns `true` if a boxed error is (or wraps) a [`BusError::Cancelled`].
pub(crate) fn is_cancellation(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(bus) = e.downcast_ref::<BusError>() {
            if bus.is_cancelled() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

// ---------------------------------------------------------------------------
// Result type alias
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_cause_exposes_original_error() {
        let err = BusError::Pipeline(Box::new(Boom));
        assert!(err.cause().unwrap().downcast_ref::<Boom>().is_some());
        assert_eq!(err.to_string(), "message pipeline failed: boom");
    }

    #[test]
    fn test_send_only_names_setting() {
        let err = BusError::SendOnly;
        assert!(err.to_string().contains("send_only"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_cancellation_walks_sources() {
        let direct: BoxError = Box::new(BusError::Cancelled);
        assert!(is_cancellation(direct.as_ref()));

        let wrapped = BusError::Startup(Box::new(BusError::Cancelled));
        assert!(is_cancellation(&wrapped));

        let other: BoxError = Box::new(Boom);
        assert!(!is_cancellation(other.as_ref()));
    }
}
