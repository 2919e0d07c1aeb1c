//! Internal signals: the typed messages exchanged with the rest of the
//! platform, converted from and to twin-protocol envelopes.
//!
//! The runtime treats signal payloads as opaque; only the thing identity,
//! the topic path and the headers are interpreted here.

use serde_json::json;

use crate::auth::AuthorizationContext;
use crate::connection::Target;
use crate::envelope::{Channel, Criterion, Envelope, TopicPath};
use crate::error::ConnectivityError;
use crate::headers::Headers;
use crate::things::ThingId;

/// The four signal families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// A command addressed to a twin or device.
    Command,
    /// A response to a command.
    CommandResponse,
    /// An emitted event.
    Event,
    /// An error response.
    ErrorResponse,
}

/// An internal signal with its twin-protocol addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Identity of the addressed thing.
    pub thing_id: ThingId,
    /// Topic path of the signal.
    pub topic: TopicPath,
    /// JSON pointer into the twin.
    pub path: String,
    /// Payload value, if any.
    pub value: Option<serde_json::Value>,
    /// Response status, present iff the signal is a response.
    pub status: Option<u16>,
    /// Signal headers (correlation id, response flags, subjects).
    pub headers: Headers,
    /// Authorization context the signal was mapped with, after placeholder
    /// resolution.
    pub authorization_context: Option<AuthorizationContext>,
}

impl Signal {
    /// Converts a wire envelope into a signal, validating that the
    /// topic/path combination names a known signal shape.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::UnknownTopicPath`] for combinations no
    /// signal matches, or a thing-id error when the topic segments do not
    /// form a valid identity.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ConnectivityError> {
        let thing_id = envelope.topic.thing_id()?;
        if !path_matches(envelope.topic.criterion, &envelope.path) {
            return Err(ConnectivityError::UnknownTopicPath {
                topic: envelope.topic.to_string(),
                path: envelope.path,
            });
        }
        Ok(Self {
            thing_id,
            topic: envelope.topic,
            path: envelope.path,
            value: envelope.value,
            status: envelope.status,
            headers: envelope.headers,
            authorization_context: None,
        })
    }

    /// Converts the signal back into a wire envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            topic: self.topic.clone(),
            path: self.path.clone(),
            value: self.value.clone(),
            status: self.status,
            headers: self.headers.clone(),
        }
    }

    /// The signal family, derived from criterion and status.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self.topic.criterion {
            Criterion::Events => SignalKind::Event,
            Criterion::Errors => SignalKind::ErrorResponse,
            Criterion::Commands | Criterion::Messages => {
                if self.status.is_some() {
                    SignalKind::CommandResponse
                } else {
                    SignalKind::Command
                }
            }
        }
    }

    /// Whether this signal is a response of either kind.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self.kind(),
            SignalKind::CommandResponse | SignalKind::ErrorResponse
        )
    }

    /// Builds the error-response signal for `error`, addressed back at the
    /// originating thing on the channel the failure occurred on. The
    /// passed headers should carry the inbound correlation id.
    #[must_use]
    pub fn error_response(
        thing_id: &ThingId,
        channel: Channel,
        error: &ConnectivityError,
        headers: Headers,
    ) -> Self {
        let status = error.status();
        Self {
            thing_id: thing_id.clone(),
            topic: TopicPath::errors(thing_id, channel),
            path: "/".to_string(),
            value: Some(json!({
                "status": status,
                "error": error.error_code(),
                "message": error.to_string(),
            })),
            status: Some(status),
            headers,
            authorization_context: None,
        }
    }
}

/// Pairs an outbound signal with the targets it is routed to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    /// The signal leaving the platform.
    pub signal: Signal,
    /// Targets selected for this signal.
    pub targets: Vec<Target>,
}

impl OutboundSignal {
    /// Creates an outbound signal routed to `targets`.
    #[must_use]
    pub fn new(signal: Signal, targets: Vec<Target>) -> Self {
        Self { signal, targets }
    }
}

/// Whether `path` names a twin facet addressable under `criterion`.
fn path_matches(criterion: Criterion, path: &str) -> bool {
    match criterion {
        Criterion::Commands | Criterion::Events => {
            path == "/"
                || path.starts_with("/attributes")
                || path.starts_with("/features")
                || path.starts_with("/definition")
        }
        Criterion::Messages => {
            path.starts_with("/inbox") || path.starts_with("/outbox") || path.starts_with("/features")
        }
        Criterion::Errors => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::CORRELATION_ID;

    fn envelope(topic: &str, path: &str) -> Envelope {
        Envelope {
            topic: TopicPath::parse(topic).unwrap(),
            path: path.to_string(),
            value: None,
            status: None,
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_from_envelope_extracts_identity() {
        let signal =
            Signal::from_envelope(envelope("my/thing/things/twin/commands/modify", "/attributes/x"))
                .unwrap();
        assert_eq!(signal.thing_id, ThingId::parse("my:thing").unwrap());
        assert_eq!(signal.kind(), SignalKind::Command);
    }

    #[test]
    fn test_unknown_topic_path_combination() {
        let err = Signal::from_envelope(envelope(
            "Testspace/octopus/things/twin/commands/retrieve",
            "/policyId",
        ))
        .unwrap_err();
        assert!(matches!(err, ConnectivityError::UnknownTopicPath { .. }));
    }

    #[test]
    fn test_response_kind_from_status() {
        let mut envelope = envelope("my/thing/things/twin/commands/modify", "/");
        envelope.status = Some(204);
        let signal = Signal::from_envelope(envelope).unwrap();
        assert_eq!(signal.kind(), SignalKind::CommandResponse);
        assert!(signal.is_response());
    }

    #[test]
    fn test_event_kind() {
        let signal =
            Signal::from_envelope(envelope("my/thing/things/twin/events/modified", "/")).unwrap();
        assert_eq!(signal.kind(), SignalKind::Event);
    }

    #[test]
    fn test_error_response_topic_and_payload() {
        let thing = ThingId::parse("my:thing").unwrap();
        let error = ConnectivityError::IdEnforcementFailed {
            input: "some/invalid/target".into(),
        };
        let headers = Headers::new().with(CORRELATION_ID, "c-9");
        let signal = Signal::error_response(&thing, Channel::Twin, &error, headers);

        assert_eq!(signal.topic.to_string(), "my/thing/things/twin/errors");
        assert_eq!(signal.kind(), SignalKind::ErrorResponse);
        assert_eq!(signal.status, Some(403));
        assert_eq!(signal.headers.correlation_id(), Some("c-9"));
        let value = signal.value.unwrap();
        assert_eq!(
            value["error"],
            "connectivity:connection.id.enforcement.failed"
        );
    }

    #[test]
    fn test_live_message_signal() {
        let signal = Signal::from_envelope(envelope(
            "ns/thing/things/live/messages/some-subject",
            "/outbox/messages/some-subject",
        ))
        .unwrap();
        assert_eq!(signal.kind(), SignalKind::Command);
        assert_eq!(signal.topic.action_subject(), Some("some-subject"));
    }
}
