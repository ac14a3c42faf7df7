//! Reserved header names understood by the bus engine.

pub const MESSAGE_ID: &str = "Bus.MessageId";
pub const REPLY_TO_ADDRESS: &str = "Bus.ReplyToAddress";
pub const CORRELATION_ID: &str = "Bus.CorrelationId";
pub const ENCLOSED_MESSAGE_TYPES: &str = "Bus.EnclosedMessageTypes";
pub const CONTENT_TYPE: &str = "Bus.ContentType";
pub const ORIGINATING_ENDPOINT: &str = "Bus.OriginatingEndpoint";
pub const TIME_SENT: &str = "Bus.TimeSent";

/// Number of delayed retries already performed for a message.
pub const DELAYED_RETRIES: &str = "Bus.Retries";
pub const FAILED_QUEUE: &str = "Bus.FailedQ";
pub const EXCEPTION_MESSAGE: &str = "Bus.ExceptionInfo.Message";

/// Transport-level encoding marker. Never surfaced as a message header.
pub const TRANSPORT_ENCODING: &str = "Bus.Transport.Encoding";

pub const CONTENT_TYPE_JSON: &str = "application/json";
