//! Translation of inbound messages into the context shapes the bus engine
//! expects on its success and failure paths.

use crate::headers;
use crate::message::InboundMessage;
use crate::transaction::NativeTransaction;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Transport transaction token
// ---------------------------------------------------------------------------

/// Opaque token handed to the bus engine for one message attempt.
///
/// Each token has its own identity. When the transaction strategy wraps a
/// host transaction the token also exposes it so the engine can enlist
/// outgoing operations.
#[derive(Clone)]
pub struct TransportTransaction {
    id: Uuid,
    native: Option<Arc<dyn NativeTransaction>>,
}

impl TransportTransaction {
    /// A token with no ambient transaction.
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            native: None,
        }
    }

    /// A token carrying the host transaction the attempt runs in.
    pub fn enlisted(native: Arc<dyn NativeTransaction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            native: Some(native),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The host transaction, if the attempt runs inside one.
    pub fn native(&self) -> Option<&Arc<dyn NativeTransaction>> {
        self.native.as_ref()
    }
}

impl fmt::Debug for TransportTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportTransaction")
            .field("id", &self.id)
            .field("native", &self.native.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Input to the engine's message pipeline.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub transport_transaction: TransportTransaction,
}

/// Input to the engine's error pipeline.
///
/// Borrows the error that failed the message pipeline; the bridge keeps
/// ownership so it can rethrow the original.
#[derive(Debug, Clone)]
pub struct ErrorContext<'a> {
    pub error: &'a (dyn StdError + Send + Sync + 'static),
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub transport_transaction: TransportTransaction,
    /// Number of delivery attempts, including the failed one.
    pub delivery_count: u32,
}

/// Build the success-path context.
pub fn message_context(
    message: &InboundMessage,
    transport_transaction: TransportTransaction,
) -> MessageContext {
    MessageContext {
        message_id: message.id().to_string(),
        headers: message.headers().clone(),
        body: message.body().to_vec(),
        transport_transaction,
    }
}

/// Build the failure-path context.
pub fn error_context<'a>(
    message: &InboundMessage,
    error: &'a (dyn StdError + Send + Sync + 'static),
    transport_transaction: TransportTransaction,
) -> ErrorContext<'a> {
    ErrorContext {
        error,
        message_id: message.id().to_string(),
        headers: message.headers().clone(),
        body: message.body().to_vec(),
        transport_transaction,
        delivery_count: message.delivery_count(),
    }
}

// ---------------------------------------------------------------------------
// Header translation
// ---------------------------------------------------------------------------

/// Translate wire application properties into message headers.
///
/// Every property except [`headers::TRANSPORT_ENCODING`] is kept. A
/// non-blank reply-to or correlation id is promoted into its reserved
/// header.
pub fn translate_headers(
    properties: &BTreeMap<String, serde_json::Value>,
    reply_to: Option<&str>,
    correlation_id: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = properties
        .iter()
        .filter(|(key, _)| key.as_str() != headers::TRANSPORT_ENCODING)
        .map(|(key, value)| (key.clone(), property_to_string(value)))
        .collect();

    if let Some(reply_to) = non_blank(reply_to) {
        out.insert(headers::REPLY_TO_ADDRESS.to_string(), reply_to.to_string());
    }
    if let Some(correlation_id) = non_blank(correlation_id) {
        out.insert(
            headers::CORRELATION_ID.to_string(),
            correlation_id.to_string(),
        );
    }

    out
}

/// Use the wire id, or generate a fresh one when it is missing or empty.
///
/// Generated ids are never cached: two id-less messages get two ids.
pub fn resolve_message_id(wire_id: Option<&str>) -> String {
    match wire_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn property_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessage;
    use serde_json::json;

    fn props(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_transport_encoding_is_stripped() {
        let p = props(&[
            (headers::TRANSPORT_ENCODING, json!("wcf/byte-array")),
            ("custom", json!("value")),
        ]);
        let h = translate_headers(&p, None, None);

        assert_eq!(h.len(), 1);
        assert_eq!(h.get("custom").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_reply_to_and_correlation_are_promoted() {
        let h = translate_headers(&BTreeMap::new(), Some("replies"), Some("corr-9"));
        assert_eq!(
            h.get(headers::REPLY_TO_ADDRESS).map(String::as_str),
            Some("replies")
        );
        assert_eq!(
            h.get(headers::CORRELATION_ID).map(String::as_str),
            Some("corr-9")
        );
    }

    #[test]
    fn test_blank_reply_to_is_ignored() {
        let h = translate_headers(&BTreeMap::new(), Some("   "), Some(""));
        assert!(h.is_empty());
    }

    #[test]
    fn test_non_string_properties_are_rendered() {
        let p = props(&[("n", json!(42)), ("b", json!(true)), ("z", json!(null))]);
        let h = translate_headers(&p, None, None);
        assert_eq!(h["n"], "42");
        assert_eq!(h["b"], "true");
        assert_eq!(h["z"], "");
    }

    #[test]
    fn test_missing_id_generates_fresh_ids() {
        let a = resolve_message_id(None);
        let b = resolve_message_id(Some(""));
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert_eq!(resolve_message_id(Some("native-1")), "native-1");
    }

    #[test]
    fn test_error_context_carries_delivery_count() {
        let message = InboundMessage::from_wire(&WireMessage::new("{}").delivery_count(4));
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let ctx = error_context(&message, &err, TransportTransaction::empty());

        assert_eq!(ctx.delivery_count, 4);
        assert_eq!(ctx.error.to_string(), "disk");
        assert_eq!(ctx.message_id, message.id());
    }

    #[test]
    fn test_empty_tokens_are_distinct() {
        assert_ne!(
            TransportTransaction::empty().id(),
            TransportTransaction::empty().id()
        );
    }
}
