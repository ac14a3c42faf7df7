//! AWS Lambda host adapter for SQS event source mappings.
//!
//! Lambda owns the receive loop: it polls SQS and invokes the function with
//! a batch of records. [`SqsTrigger`] converts each record into a
//! [`WireMessage`], pushes it through [`FunctionEndpoint::process`], and
//! reports partial batch failures so SQS redelivers only the records that
//! failed.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostbus::serverless::{run, SqsTrigger};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_runtime::Error> {
//!     let endpoint = Arc::new(build_endpoint()?);
//!     run(SqsTrigger::new(endpoint).function_name("sales-handler")).await
//! }
//! ```

use crate::endpoint::{FunctionContext, FunctionEndpoint};
use crate::logging::LogSink;
use crate::message::WireMessage;
use lambda_runtime::{service_fn, LambdaEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Record attribute carrying the number of receives.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// Time reserved before the invocation deadline to report the batch.
const DEADLINE_MARGIN: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// SQS event containing one or more messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<SqsMessage>,
}

/// A single SQS record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqsMessage {
    #[serde(rename = "messageId", default)]
    pub message_id: String,

    #[serde(default)]
    pub body: String,

    /// System attributes such as `ApproximateReceiveCount`.
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Attributes set by the sender; these become message headers.
    #[serde(rename = "messageAttributes", default)]
    pub message_attributes: HashMap<String, SqsMessageAttribute>,

    #[serde(rename = "receiptHandle", default)]
    pub receipt_handle: String,
}

/// A sender-supplied SQS message attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqsMessageAttribute {
    #[serde(rename = "stringValue", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    #[serde(rename = "dataType", default)]
    pub data_type: String,
}

/// Response format for SQS batch item failures.
///
/// Returning failed message IDs tells SQS to retry only those messages.
/// See: <https://docs.aws.amazon.com/lambda/latest/dg/with-sqs.html>
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqsBatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

/// Identifies a single failed message in an SQS batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Feeds SQS batches delivered by Lambda into a [`FunctionEndpoint`].
pub struct SqsTrigger {
    endpoint: Arc<FunctionEndpoint>,
    function_name: String,
    logger: Option<Arc<dyn LogSink>>,
}

impl SqsTrigger {
    pub fn new(endpoint: Arc<FunctionEndpoint>) -> Self {
        let function_name = std::env::var("AWS_LAMBDA_FUNCTION_NAME")
            .unwrap_or_else(|_| endpoint.configuration().endpoint_name.clone());
        Self {
            endpoint,
            function_name,
            logger: None,
        }
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    /// Log destination attached on the first invocation.
    pub fn logger(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logger = Some(sink);
        self
    }

    /// Convert an SQS record into the wire shape the endpoint processes.
    pub fn to_wire(record: &SqsMessage) -> WireMessage {
        let delivery_count = record
            .attributes
            .get(RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        let mut wire = WireMessage::new(record.body.as_bytes()).delivery_count(delivery_count);
        if !record.message_id.is_empty() {
            wire = wire.message_id(record.message_id.clone());
        }
        for (key, attribute) in &record.message_attributes {
            if let Some(value) = &attribute.string_value {
                wire = wire.property(key.clone(), value.clone());
            }
        }
        wire
    }

    /// Process every record of `event`.
    ///
    /// Never fails as a whole; failed records are listed in the response.
    /// Once `cancel` fires the remaining records are reported as failed
    /// without being processed.
    pub async fn handle_sqs(
        &self,
        event: SqsEvent,
        invocation_id: &str,
        cancel: &CancellationToken,
    ) -> SqsBatchResponse {
        let mut ctx = FunctionContext::new(self.function_name.clone()).invocation_id(invocation_id);
        if let Some(sink) = &self.logger {
            ctx = ctx.logger(sink.clone());
        }

        let mut failures = Vec::new();
        for record in &event.records {
            if cancel.is_cancelled() {
                failures.push(BatchItemFailure {
                    item_identifier: record.message_id.clone(),
                });
                continue;
            }

            let wire = Self::to_wire(record);
            match self.endpoint.process(&wire, &ctx, cancel).await {
                Ok(()) => {
                    tracing::debug!(message_id = %record.message_id, "record processed");
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %record.message_id,
                        error = %e,
                        "record processing failed"
                    );
                    failures.push(BatchItemFailure {
                        item_identifier: record.message_id.clone(),
                    });
                }
            }
        }

        SqsBatchResponse {
            batch_item_failures: failures,
        }
    }
}

/// Run `trigger` as the Lambda function's handler.
///
/// Each invocation gets a cancellation token that fires shortly before the
/// invocation deadline.
pub async fn run(trigger: SqsTrigger) -> Result<(), lambda_runtime::Error> {
    let trigger = Arc::new(trigger);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<SqsEvent>| {
        let trigger = trigger.clone();
        async move {
            let cancel = CancellationToken::new();
            let timer = {
                let cancel = cancel.clone();
                let remaining = time_left(event.context.deadline);
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    cancel.cancel();
                })
            };

            let response = trigger
                .handle_sqs(event.payload, &event.context.request_id, &cancel)
                .await;
            timer.abort();
            Ok::<SqsBatchResponse, lambda_runtime::Error>(response)
        }
    }))
    .await
}

fn time_left(deadline_ms: u64) -> Duration {
    let now = chrono::Utc::now().timestamp_millis();
    let left = i64::try_from(deadline_ms).unwrap_or(i64::MAX).saturating_sub(now);
    u64::try_from(left)
        .map(Duration::from_millis)
        .unwrap_or_default()
        .saturating_sub(DEADLINE_MARGIN)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
