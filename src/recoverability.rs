use crate::context::ErrorContext;
use crate::headers;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for failed messages.
///
/// Immediate retries are performed by the host redelivering the message;
/// delayed retries are scheduled by the engine. When both are exhausted the
/// message is moved to the error queue, or, if that is disabled, the host
/// call fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverabilitySettings {
    /// Immediate retries after the first attempt.
    /// Default: 5
    #[serde(default = "default_immediate_retries")]
    pub immediate_retries: u32,

    /// Delayed retries once immediate retries are exhausted.
    /// Default: 3
    #[serde(default = "default_delayed_retries")]
    pub delayed_retries: u32,

    /// Base delay for delayed retries; the n-th retry waits `n * base`.
    /// Default: 10 seconds
    #[serde(default = "default_delayed_retry_base", with = "duration_secs")]
    pub delayed_retry_base: Duration,

    /// Queue receiving messages that exhausted all retries.
    /// Default: "error"
    #[serde(default = "default_error_queue")]
    pub error_queue: String,

    /// Whether exhausted messages are moved to the error queue.
    /// Default: true
    #[serde(default = "default_send_to_error_queue")]
    pub send_failed_messages_to_error_queue: bool,
}

impl Default for RecoverabilitySettings {
    fn default() -> Self {
        Self {
            immediate_retries: default_immediate_retries(),
            delayed_retries: default_delayed_retries(),
            delayed_retry_base: default_delayed_retry_base(),
            error_queue: default_error_queue(),
            send_failed_messages_to_error_queue: default_send_to_error_queue(),
        }
    }
}

impl RecoverabilitySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn immediate_retries(mut self, n: u32) -> Self {
        self.immediate_retries = n;
        self
    }

    pub fn delayed_retries(mut self, n: u32) -> Self {
        self.delayed_retries = n;
        self
    }

    pub fn delayed_retry_base(mut self, d: Duration) -> Self {
        self.delayed_retry_base = d;
        self
    }

    pub fn error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    /// Disable to make exhausted messages fail the host call instead of
    /// being parked in the error queue.
    pub fn send_failed_messages_to_error_queue(mut self, enabled: bool) -> Self {
        self.send_failed_messages_to_error_queue = enabled;
        self
    }
}

/// What the engine should do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverabilityAction {
    /// Let the host redeliver right away.
    ImmediateRetry,
    /// Re-enqueue after `delay`; `attempt` is the 1-based delayed retry number.
    DelayedRetry { attempt: u32, delay: Duration },
    /// Park the message in the error queue.
    MoveToErrorQueue { queue: String },
    /// Fail the host call.
    Fail,
}

/// Decide how to recover from the failure described by `ctx`.
pub fn decide(settings: &RecoverabilitySettings, ctx: &ErrorContext<'_>) -> RecoverabilityAction {
    if ctx.delivery_count <= settings.immediate_retries {
        return RecoverabilityAction::ImmediateRetry;
    }

    let delayed_done = ctx
        .headers
        .get(headers::DELAYED_RETRIES)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    if delayed_done < settings.delayed_retries {
        let attempt = delayed_done + 1;
        return RecoverabilityAction::DelayedRetry {
            attempt,
            delay: settings
                .delayed_retry_base
                .checked_mul(attempt)
                .unwrap_or(Duration::MAX),
        };
    }

    if settings.send_failed_messages_to_error_queue {
        RecoverabilityAction::MoveToErrorQueue {
            queue: settings.error_queue.clone(),
        }
    } else {
        RecoverabilityAction::Fail
    }
}

// ---------------------------------------------------------------------------
// Default value functions for serde
// ---------------------------------------------------------------------------

fn default_immediate_retries() -> u32 {
    5
}

fn default_delayed_retries() -> u32 {
    3
}

fn default_delayed_retry_base() -> Duration {
    Duration::from_secs(10)
}

fn default_error_queue() -> String {
    "error".to_string()
}

fn default_send_to_error_queue() -> bool {
    true
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
