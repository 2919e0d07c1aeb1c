//! Twin-protocol envelopes: the self-describing JSON form signals take on
//! the wire, addressed by a topic path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConnectivityError;
use crate::headers::Headers;
use crate::things::ThingId;

/// The channel a topic path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The persisted twin.
    Twin,
    /// The live device.
    Live,
}

impl Channel {
    /// Wire name of the channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twin => "twin",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The criterion segment of a topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criterion {
    /// Commands modifying or retrieving twin state.
    Commands,
    /// Events emitted after state changes.
    Events,
    /// Arbitrary live messages.
    Messages,
    /// Error responses.
    Errors,
}

impl Criterion {
    /// Wire name of the criterion.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Events => "events",
            Self::Messages => "messages",
            Self::Errors => "errors",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed topic path of a twin-protocol envelope, e.g.
/// `org.eclipse/octopus/things/twin/commands/modify`.
///
/// Only the `things` group is modeled; the segment is kept literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    /// Namespace of the addressed thing.
    pub namespace: String,
    /// Name of the addressed thing.
    pub entity_name: String,
    /// Channel segment.
    pub channel: Channel,
    /// Criterion segment.
    pub criterion: Criterion,
    /// Action (commands/events) or subject (messages), if present.
    pub action: Option<String>,
}

impl TopicPath {
    /// Parses a topic path string.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::MalformedTopicPath`] when segments are
    /// missing or unknown.
    pub fn parse(topic: &str) -> Result<Self, ConnectivityError> {
        let malformed = || ConnectivityError::MalformedTopicPath {
            topic: topic.into(),
        };
        let mut segments = topic.splitn(6, '/');
        let namespace = segments.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let entity_name = segments.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let group = segments.next().ok_or_else(malformed)?;
        if group != "things" {
            return Err(malformed());
        }
        let channel = match segments.next().ok_or_else(malformed)? {
            "twin" => Channel::Twin,
            "live" => Channel::Live,
            _ => return Err(malformed()),
        };
        let criterion = match segments.next().ok_or_else(malformed)? {
            "commands" => Criterion::Commands,
            "events" => Criterion::Events,
            "messages" => Criterion::Messages,
            "errors" => Criterion::Errors,
            _ => return Err(malformed()),
        };
        let action = segments.next().map(str::to_string);
        Ok(Self {
            namespace: namespace.to_string(),
            entity_name: entity_name.to_string(),
            channel,
            criterion,
            action,
        })
    }

    /// Builds a topic path addressing `thing_id`.
    #[must_use]
    pub fn of(
        thing_id: &ThingId,
        channel: Channel,
        criterion: Criterion,
        action: Option<&str>,
    ) -> Self {
        Self {
            namespace: thing_id.namespace().to_string(),
            entity_name: thing_id.name().to_string(),
            channel,
            criterion,
            action: action.map(str::to_string),
        }
    }

    /// The errors topic for `thing_id` on `channel`, used when mapping
    /// failures are routed back outbound.
    #[must_use]
    pub fn errors(thing_id: &ThingId, channel: Channel) -> Self {
        Self::of(thing_id, channel, Criterion::Errors, None)
    }

    /// The thing identity this topic addresses.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ThingIdInvalid`] when the segments do
    /// not form a valid identifier.
    pub fn thing_id(&self) -> Result<ThingId, ConnectivityError> {
        ThingId::parse(&format!("{}:{}", self.namespace, self.entity_name))
    }

    /// Returns a copy whose criterion is `errors` with no action, keeping
    /// namespace, name and channel.
    #[must_use]
    pub fn to_errors(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            entity_name: self.entity_name.clone(),
            channel: self.channel,
            criterion: Criterion::Errors,
            action: None,
        }
    }

    /// The action-or-subject segment used by the `topic:action-subject`
    /// placeholder.
    #[must_use]
    pub fn action_subject(&self) -> Option<&str> {
        self.action.as_deref()
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/things/{}/{}",
            self.namespace, self.entity_name, self.channel, self.criterion
        )?;
        if let Some(action) = &self.action {
            write!(f, "/{action}")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    topic: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    headers: Headers,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

/// A twin-protocol envelope: topic path, JSON pointer path, optional value
/// and status, plus protocol headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Where the envelope is addressed.
    pub topic: TopicPath,
    /// JSON pointer into the twin, e.g. `/features/lamp/properties/on`.
    pub path: String,
    /// Payload value, if any.
    pub value: Option<serde_json::Value>,
    /// Response status, present iff the envelope is a response.
    pub status: Option<u16>,
    /// Protocol headers.
    pub headers: Headers,
}

impl Envelope {
    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns a mapping failure when the JSON is malformed, or a topic
    /// path error when the `topic` field cannot be parsed.
    pub fn from_json_str(json: &str) -> Result<Self, ConnectivityError> {
        let wire: EnvelopeWire = serde_json::from_str(json)
            .map_err(|e| ConnectivityError::mapping(format!("malformed twin envelope: {e}")))?;
        Ok(Self {
            topic: TopicPath::parse(&wire.topic)?,
            path: wire.path,
            value: wire.value,
            status: wire.status,
            headers: wire.headers,
        })
    }

    /// Serializes the envelope to its JSON wire form.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        let wire = EnvelopeWire {
            topic: self.topic.to_string(),
            headers: self.headers.clone(),
            path: self.path.clone(),
            value: self.value.clone(),
            status: self.status,
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Whether the envelope is a response (carries a status).
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_topic() {
        let topic = TopicPath::parse("org.eclipse/octopus/things/twin/commands/modify").unwrap();
        assert_eq!(topic.namespace, "org.eclipse");
        assert_eq!(topic.entity_name, "octopus");
        assert_eq!(topic.channel, Channel::Twin);
        assert_eq!(topic.criterion, Criterion::Commands);
        assert_eq!(topic.action.as_deref(), Some("modify"));
    }

    #[test]
    fn test_parse_rejects_unknown_group() {
        assert!(TopicPath::parse("ns/name/policies/twin/commands/modify").is_err());
        assert!(TopicPath::parse("ns/name").is_err());
    }

    #[test]
    fn test_errors_topic_keeps_channel() {
        let topic = TopicPath::parse("Testspace/octopus/things/live/commands/retrieve").unwrap();
        let errors = topic.to_errors();
        assert_eq!(errors.to_string(), "Testspace/octopus/things/live/errors");
    }

    #[test]
    fn test_display_roundtrip() {
        let raw = "my/thing/things/twin/errors";
        let topic = TopicPath::parse(raw).unwrap();
        assert_eq!(topic.to_string(), raw);
    }

    #[test]
    fn test_message_subject() {
        let topic =
            TopicPath::parse("ns/thing/things/live/messages/some-subject").unwrap();
        assert_eq!(topic.action_subject(), Some("some-subject"));
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let json = r#"{
            "topic": "org.eclipse/octopus/things/twin/commands/modify",
            "headers": { "correlation-id": "c-7" },
            "path": "/attributes/foo",
            "value": 42
        }"#;
        let envelope = Envelope::from_json_str(json).unwrap();
        assert_eq!(envelope.path, "/attributes/foo");
        assert_eq!(envelope.headers.correlation_id(), Some("c-7"));
        assert!(!envelope.is_response());

        let reparsed = Envelope::from_json_str(&envelope.to_json_string()).unwrap();
        assert_eq!(reparsed, envelope);
    }

    #[test]
    fn test_envelope_with_status_is_response() {
        let json = r#"{
            "topic": "ns/n/things/twin/commands/modify",
            "path": "/",
            "status": 204
        }"#;
        let envelope = Envelope::from_json_str(json).unwrap();
        assert!(envelope.is_response());
    }
}
