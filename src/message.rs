use crate::context;
use crate::headers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Wire message (host trigger shape)
// ---------------------------------------------------------------------------

/// A message as delivered by the host trigger.
///
/// Every field may be absent on the wire; [`InboundMessage::from_wire`]
/// applies the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Native message identifier.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Raw message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,

    /// Application properties set by the sender.
    #[serde(rename = "applicationProperties", default)]
    pub application_properties: BTreeMap<String, serde_json::Value>,

    /// Number of delivery attempts, including this one.
    #[serde(rename = "deliveryCount", default = "default_delivery_count")]
    pub delivery_count: u32,

    /// Native reply-to address.
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Native correlation identifier.
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn default_delivery_count() -> u32 {
    1
}

impl WireMessage {
    /// Create a wire message carrying the given body and a delivery count of 1.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            delivery_count: 1,
            ..Self::default()
        }
    }

    /// Set the native message identifier.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Add an application property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Set the delivery count.
    pub fn delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = count;
        self
    }

    /// Set the native reply-to address.
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Set the native correlation identifier.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// An immutable, fully defaulted message for one host invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    id: String,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    delivery_count: u32,
}

impl InboundMessage {
    /// Translate a wire message.
    ///
    /// A missing or empty id is replaced with a freshly generated one on
    /// every call. A missing body becomes empty and the delivery count is
    /// at least 1.
    pub fn from_wire(wire: &WireMessage) -> Self {
        Self {
            id: context::resolve_message_id(wire.message_id.as_deref()),
            body: wire.body.clone().unwrap_or_default(),
            headers: context::translate_headers(
                &wire.application_properties,
                wire.reply_to.as_deref(),
                wire.correlation_id.as_deref(),
            ),
            delivery_count: wire.delivery_count.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

// ---------------------------------------------------------------------------
// Outgoing message
// ---------------------------------------------------------------------------

/// A message handed to the transport by a [`MessageSession`](crate::engine::MessageSession).
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub message_type: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Serialize `message` as JSON and stamp the standard headers.
    pub fn json<M: Serialize>(
        message: &M,
        message_type: impl Into<String>,
    ) -> crate::Result<Self> {
        let message_type = message_type.into();
        let message_id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_vec(message)?;

        let mut headers = BTreeMap::new();
        headers.insert(headers::MESSAGE_ID.to_string(), message_id.clone());
        headers.insert(
            headers::ENCLOSED_MESSAGE_TYPES.to_string(),
            message_type.clone(),
        );
        headers.insert(
            headers::CONTENT_TYPE.to_string(),
            headers::CONTENT_TYPE_JSON.to_string(),
        );
        headers.insert(headers::TIME_SENT.to_string(), chrono::Utc::now().to_rfc3339());

        Ok(Self {
            message_id,
            message_type,
            body,
            headers,
        })
    }

    /// Convert into the shape a host trigger would deliver.
    ///
    /// Reply-to and correlation headers move to their native fields.
    pub fn to_wire(&self) -> WireMessage {
        let mut properties: BTreeMap<String, serde_json::Value> = self
            .headers
            .iter()
            .filter(|(k, _)| {
                k.as_str() != headers::REPLY_TO_ADDRESS && k.as_str() != headers::CORRELATION_ID
            })
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        properties.insert(
            headers::TRANSPORT_ENCODING.to_string(),
            serde_json::Value::String("application/octet-stream".to_string()),
        );

        WireMessage {
            message_id: Some(self.message_id.clone()),
            body: Some(self.body.clone()),
            application_properties: properties,
            delivery_count: 1,
            reply_to: self.headers.get(headers::REPLY_TO_ADDRESS).cloned(),
            correlation_id: self.headers.get(headers::CORRELATION_ID).cloned(),
        }
    }
}
