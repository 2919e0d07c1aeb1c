//! External messages: the serialized wire form exchanged with brokers,
//! annotated with the source context a consumer attached.

use bytes::Bytes;

use crate::auth::AuthorizationContext;
use crate::connection::HeaderMapping;
use crate::enforcement::EnforcementFilter;
use crate::envelope::TopicPath;
use crate::headers::{Headers, CONTENT_TYPE};

/// Payload of an external message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No payload.
    Empty,
    /// Text payload only.
    Text(String),
    /// Binary payload only.
    Bytes(Bytes),
    /// Binary payload with its UTF-8 decoding.
    TextAndBytes(String, Bytes),
}

/// A message in wire form, together with the source annotations the
/// consumer worker attached before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMessage {
    /// Protocol headers, e.g. AMQP application properties.
    pub headers: Headers,
    /// The payload.
    pub payload: Payload,
    /// Wire-level address the message arrived on.
    pub source_address: Option<String>,
    /// Authorization context of the source, if inbound.
    pub authorization_context: Option<AuthorizationContext>,
    /// Enforcement filter resolved over the wire address, if configured.
    pub enforcement: Option<EnforcementFilter>,
    /// Ordered payload-mapper aliases to apply.
    pub payload_mapping: Vec<String>,
    /// Inbound header mapping of the source, applied after payload
    /// mapping.
    pub header_mapping: Option<HeaderMapping>,
    /// Whether this message is a response (outbound only).
    pub response: bool,
    /// Topic path of the signal this message was mapped from (outbound).
    pub topic_path: Option<TopicPath>,
}

impl ExternalMessage {
    /// Starts a builder with the given headers.
    #[must_use]
    pub fn builder(headers: Headers) -> ExternalMessageBuilder {
        ExternalMessageBuilder {
            message: ExternalMessage {
                headers,
                payload: Payload::Empty,
                source_address: None,
                authorization_context: None,
                enforcement: None,
                payload_mapping: Vec::new(),
                header_mapping: None,
                response: false,
                topic_path: None,
            },
        }
    }

    /// Starts a builder from an existing message.
    #[must_use]
    pub fn rebuilder(&self) -> ExternalMessageBuilder {
        ExternalMessageBuilder {
            message: self.clone(),
        }
    }

    /// The text payload, if present.
    #[must_use]
    pub fn text_payload(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) | Payload::TextAndBytes(t, _) => Some(t),
            _ => None,
        }
    }

    /// The binary payload, if present.
    #[must_use]
    pub fn byte_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Bytes(b) | Payload::TextAndBytes(_, b) => Some(b),
            _ => None,
        }
    }

    /// Whether the payload has a text form.
    #[must_use]
    pub fn is_text_message(&self) -> bool {
        matches!(
            self.payload,
            Payload::Text(_) | Payload::TextAndBytes(_, _)
        )
    }

    /// The declared content type, if any.
    #[must_use]
    pub fn find_content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)
    }
}

/// Builder for [`ExternalMessage`].
#[derive(Debug, Clone)]
pub struct ExternalMessageBuilder {
    message: ExternalMessage,
}

impl ExternalMessageBuilder {
    /// Sets a text payload.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.message.payload = Payload::Text(text.into());
        self
    }

    /// Sets a binary payload.
    #[must_use]
    pub fn with_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.message.payload = Payload::Bytes(bytes.into());
        self
    }

    /// Sets a binary payload together with its UTF-8 decoding.
    #[must_use]
    pub fn with_text_and_bytes(mut self, text: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.message.payload = Payload::TextAndBytes(text.into(), bytes.into());
        self
    }

    /// Adds one header, overwriting an existing value.
    #[must_use]
    pub fn with_additional_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.message.headers.insert(key, value);
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.message.headers = headers;
        self
    }

    /// Sets the source authorization context.
    #[must_use]
    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.message.authorization_context = Some(context);
        self
    }

    /// Sets the resolved enforcement filter.
    #[must_use]
    pub fn with_enforcement(mut self, filter: Option<EnforcementFilter>) -> Self {
        self.message.enforcement = filter;
        self
    }

    /// Sets the wire-level source address.
    #[must_use]
    pub fn with_source_address(mut self, address: impl Into<String>) -> Self {
        self.message.source_address = Some(address.into());
        self
    }

    /// Sets the payload-mapper aliases to apply.
    #[must_use]
    pub fn with_payload_mapping(mut self, aliases: Vec<String>) -> Self {
        self.message.payload_mapping = aliases;
        self
    }

    /// Sets the inbound header mapping of the source.
    #[must_use]
    pub fn with_header_mapping(mut self, mapping: Option<HeaderMapping>) -> Self {
        self.message.header_mapping = mapping;
        self
    }

    /// Marks the message as a response.
    #[must_use]
    pub fn as_response(mut self, response: bool) -> Self {
        self.message.response = response;
        self
    }

    /// Records the topic path of the originating signal.
    #[must_use]
    pub fn with_topic_path(mut self, topic: TopicPath) -> Self {
        self.message.topic_path = Some(topic);
        self
    }

    /// Finalizes the message.
    #[must_use]
    pub fn build(self) -> ExternalMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_bytes_payload() {
        let message = ExternalMessage::builder(Headers::new())
            .with_text_and_bytes("payload", Bytes::from_static(b"payload"))
            .build();
        assert!(message.is_text_message());
        assert_eq!(message.text_payload(), Some("payload"));
        assert_eq!(message.byte_payload().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn test_rebuilder_keeps_annotations() {
        let message = ExternalMessage::builder(Headers::new().with("k", "v"))
            .with_source_address("telemetry/x")
            .with_payload_mapping(vec!["status".into()])
            .build();
        let copy = message
            .rebuilder()
            .with_additional_header("k2", "v2")
            .build();
        assert_eq!(copy.source_address.as_deref(), Some("telemetry/x"));
        assert_eq!(copy.payload_mapping, vec!["status".to_string()]);
        assert_eq!(copy.headers.get("k"), Some("v"));
        assert_eq!(copy.headers.get("k2"), Some("v2"));
    }

    #[test]
    fn test_content_type_lookup() {
        let message = ExternalMessage::builder(
            Headers::new().with(CONTENT_TYPE, "application/json"),
        )
        .build();
        assert_eq!(message.find_content_type(), Some("application/json"));
    }
}
