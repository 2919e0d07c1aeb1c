//! Connection configuration: the immutable snapshot a client state machine
//! owns for the lifetime of one connection.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::auth::AuthorizationContext;
use crate::error::ConnectivityError;

/// Identifier of a configured connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The protocol family a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    /// AMQP 0.9.1 (RabbitMQ style).
    #[serde(rename = "amqp-091")]
    Amqp091,
    /// AMQP 1.0.
    #[serde(rename = "amqp-10")]
    Amqp10,
    /// MQTT 3.1.1.
    #[serde(rename = "mqtt")]
    Mqtt,
    /// Apache Kafka.
    #[serde(rename = "kafka")]
    Kafka,
    /// HTTP push (outbound-only webhooks).
    #[serde(rename = "http-push")]
    HttpPush,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Amqp091 => "amqp-091",
            Self::Amqp10 => "amqp-10",
            Self::Mqtt => "mqtt",
            Self::Kafka => "kafka",
            Self::HttpPush => "http-push",
        };
        f.write_str(s)
    }
}

/// Desired lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The connection should be established.
    Open,
    /// The connection should stay down.
    Closed,
}

/// Internal topics a target subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribedTopic {
    /// Twin modification events.
    #[serde(rename = "twin-events")]
    TwinEvents,
    /// Live events emitted by devices.
    #[serde(rename = "live-events")]
    LiveEvents,
    /// Live messages addressed to or from devices.
    #[serde(rename = "live-messages")]
    LiveMessages,
    /// Live commands addressed to devices.
    #[serde(rename = "live-commands")]
    LiveCommands,
    /// Error responses.
    #[serde(rename = "errors")]
    Errors,
}

/// Identity enforcement configuration on a source.
///
/// `input` is resolved against the wire-level address of each inbound
/// message; `filters` are resolved against the thing identity of the
/// mapped signal. The message passes iff the input equals one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcement {
    /// Template yielding the value to enforce, e.g. `{{ source:address }}`.
    pub input: String,
    /// Templates yielding the accepted values.
    pub filters: Vec<String>,
}

impl Enforcement {
    /// Creates an enforcement over one input template and filter templates.
    #[must_use]
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(
        input: impl Into<String>,
        filters: I,
    ) -> Self {
        Self {
            input: input.into(),
            filters: filters.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ordered projection of output header names to value templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMapping(pub IndexMap<String, String>);

impl HeaderMapping {
    /// Whether no mappings are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(target header, value template)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderMapping {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Configuration of one payload mapper instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingContext {
    /// Name of the mapping engine, e.g. `ConnectionStatus`.
    pub mapping_engine: String,
    /// Engine-specific options; values may carry JSON.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl MappingContext {
    /// Creates a context for `engine` with no options.
    #[must_use]
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            mapping_engine: engine.into(),
            options: BTreeMap::new(),
        }
    }

    /// Builder-style option insert.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Looks up an option.
    #[must_use]
    pub fn find_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

fn one() -> usize {
    1
}

/// Inbound configuration fragment of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Wire-level subscription identifiers (queue names, topic filters).
    pub addresses: Vec<String>,
    /// Number of parallel consumers to open per address.
    #[serde(default = "one")]
    pub consumer_count: usize,
    /// Requested quality of service, where the protocol supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    /// Subjects inbound signals are authorized as.
    #[serde(default)]
    pub authorization_context: AuthorizationContext,
    /// Optional identity enforcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<Enforcement>,
    /// Optional inbound header mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mapping: Option<HeaderMapping>,
    /// Ordered payload-mapper aliases; empty means the default mapper.
    #[serde(default)]
    pub payload_mapping: Vec<String>,
    /// Stable index disambiguating otherwise-equal sources.
    #[serde(default)]
    pub index: usize,
}

impl Source {
    /// Creates a source over the given addresses with defaults.
    #[must_use]
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(addresses: I) -> Self {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            consumer_count: 1,
            qos: None,
            authorization_context: AuthorizationContext::default(),
            enforcement: None,
            header_mapping: None,
            payload_mapping: Vec::new(),
            index: 0,
        }
    }
}

/// Outbound configuration fragment of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Publish address; may contain `topic:`/`thing:`/`header:` placeholders.
    pub address: String,
    /// The unresolved address as configured, preserved for logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_address: Option<String>,
    /// Internal topics routed to this target.
    pub topics: Vec<SubscribedTopic>,
    /// Subjects outbound signals must be readable by.
    #[serde(default)]
    pub authorization_context: AuthorizationContext,
    /// Requested quality of service, where the protocol supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    /// Optional outbound header mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mapping: Option<HeaderMapping>,
    /// Ordered payload-mapper aliases; empty means the default mapper.
    #[serde(default)]
    pub payload_mapping: Vec<String>,
}

impl Target {
    /// Creates a target publishing to `address` with defaults.
    #[must_use]
    pub fn new(address: impl Into<String>, topics: Vec<SubscribedTopic>) -> Self {
        Self {
            address: address.into(),
            original_address: None,
            topics,
            authorization_context: AuthorizationContext::default(),
            qos: None,
            header_mapping: None,
            payload_mapping: Vec::new(),
        }
    }

    /// The address as originally configured.
    #[must_use]
    pub fn original_address(&self) -> &str {
        self.original_address.as_deref().unwrap_or(&self.address)
    }

    /// Returns a copy with `address` replaced and the original preserved.
    #[must_use]
    pub fn with_resolved_address(&self, resolved: impl Into<String>) -> Self {
        let mut target = self.clone();
        target.original_address = Some(self.original_address().to_string());
        target.address = resolved.into();
        target
    }
}

/// A configured long-lived link to one external messaging endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Protocol family.
    pub connection_type: ConnectionType,
    /// Desired lifecycle state.
    pub connection_status: ConnectionStatus,
    /// Whether the runtime reconnects after failures.
    #[serde(default)]
    pub failover_enabled: bool,
    /// Broker URI, e.g. `amqps://user@host:5671`.
    pub uri: String,
    /// Number of protocol clients to run (MQTT restricts this to 1).
    #[serde(default = "one")]
    pub client_count: usize,
    /// Inbound fragments.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Outbound fragments.
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Fallback authorization context when a source configures none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_authorization_context: Option<AuthorizationContext>,
    /// Payload-mapper definitions keyed by alias; aliases are unique.
    #[serde(default)]
    pub mapping_definitions: BTreeMap<String, MappingContext>,
}

impl Connection {
    /// Parses a connection from its JSON wire form.
    ///
    /// Source indices are assigned by position so that otherwise-equal
    /// sources stay distinguishable.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ConfigurationInvalid`] when the JSON
    /// does not describe a connection.
    pub fn from_json(json: &str) -> Result<Self, ConnectivityError> {
        let mut connection: Connection = serde_json::from_str(json)
            .map_err(|e| ConnectivityError::config(format!("malformed connection JSON: {e}")))?;
        for (index, source) in connection.sources.iter_mut().enumerate() {
            source.index = index;
        }
        Ok(connection)
    }

    /// The authorization context effective for `source`.
    #[must_use]
    pub fn source_authorization_context(&self, source: &Source) -> AuthorizationContext {
        if source.authorization_context.is_empty() {
            self.default_authorization_context
                .clone()
                .unwrap_or_default()
        } else {
            source.authorization_context.clone()
        }
    }

    /// Total number of consumers a connected generation runs.
    #[must_use]
    pub fn total_consumer_count(&self) -> usize {
        self.sources.iter().map(|s| s.consumer_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION_JSON: &str = r#"{
        "id": "hub-bridge",
        "connectionType": "mqtt",
        "connectionStatus": "open",
        "failoverEnabled": true,
        "uri": "tcp://broker.example.org:1883",
        "sources": [
            {
                "addresses": ["telemetry/#"],
                "qos": 1,
                "authorizationContext": ["integration:hub"],
                "enforcement": {
                    "input": "{{ source:address }}",
                    "filters": ["telemetry/{{ thing:id }}"]
                }
            },
            {
                "addresses": ["events/#"],
                "qos": 0,
                "authorizationContext": ["integration:hub"]
            }
        ],
        "targets": [
            {
                "address": "commands/{{ thing:id }}",
                "topics": ["twin-events", "live-messages"],
                "authorizationContext": ["integration:hub"],
                "qos": 1
            }
        ],
        "mappingDefinitions": {
            "status": {
                "mappingEngine": "ConnectionStatus",
                "options": { "thingId": "{{ header:device_id }}" }
            }
        }
    }"#;

    #[test]
    fn test_from_json_assigns_source_indices() {
        let connection = Connection::from_json(CONNECTION_JSON).unwrap();
        assert_eq!(connection.connection_type, ConnectionType::Mqtt);
        assert_eq!(connection.sources.len(), 2);
        assert_eq!(connection.sources[0].index, 0);
        assert_eq!(connection.sources[1].index, 1);
        assert_eq!(connection.client_count, 1);
        assert_eq!(connection.sources[0].consumer_count, 1);
    }

    #[test]
    fn test_enforcement_roundtrip() {
        let connection = Connection::from_json(CONNECTION_JSON).unwrap();
        let enforcement = connection.sources[0].enforcement.as_ref().unwrap();
        assert_eq!(enforcement.input, "{{ source:address }}");
        assert_eq!(enforcement.filters, vec!["telemetry/{{ thing:id }}"]);
    }

    #[test]
    fn test_mapping_definitions() {
        let connection = Connection::from_json(CONNECTION_JSON).unwrap();
        let ctx = &connection.mapping_definitions["status"];
        assert_eq!(ctx.mapping_engine, "ConnectionStatus");
        assert_eq!(ctx.find_option("thingId"), Some("{{ header:device_id }}"));
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let err = Connection::from_json("{").unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::ConfigurationInvalid { .. }
        ));
    }

    #[test]
    fn test_default_authorization_context_fallback() {
        let mut connection = Connection::from_json(CONNECTION_JSON).unwrap();
        connection.default_authorization_context =
            Some(AuthorizationContext::of(["integration:default"]));
        let mut source = Source::new(["queue"]);
        source.authorization_context = AuthorizationContext::default();
        let ctx = connection.source_authorization_context(&source);
        assert_eq!(ctx.first().unwrap().as_str(), "integration:default");
    }

    #[test]
    fn test_resolved_target_keeps_original_address() {
        let target = Target::new("some/topic/{{ topic:action-subject }}", vec![]);
        let resolved = target.with_resolved_address("some/topic/subject");
        assert_eq!(resolved.address, "some/topic/subject");
        assert_eq!(
            resolved.original_address(),
            "some/topic/{{ topic:action-subject }}"
        );
    }

    #[test]
    fn test_total_consumer_count() {
        let mut connection = Connection::from_json(CONNECTION_JSON).unwrap();
        connection.sources[0].consumer_count = 2;
        assert_eq!(connection.total_consumer_count(), 3);
    }

    #[test]
    fn test_connection_type_display() {
        assert_eq!(ConnectionType::Amqp091.to_string(), "amqp-091");
        assert_eq!(ConnectionType::HttpPush.to_string(), "http-push");
    }
}
