//! Connection validation run before a connection is opened or tested.
//!
//! Each protocol has a validator checking its URI scheme and its
//! source/target invariants; the shared helpers here cover the checks all
//! protocols agree on.

use url::Url;

use twinbridge_mapping::{MapperLimits, MapperRegistry};
use twinbridge_model::{
    Connection, ConnectionType, ConnectivityError, ExpressionResolver, Placeholder, Source,
    SourceAddressPlaceholder, Target, ThingId, ThingPlaceholder,
};

use crate::protocol::{amqp091, amqp10, http_push, kafka, mqtt};

/// Per-protocol configuration linter.
pub trait ProtocolValidator: Send + Sync {
    /// The connection type this validator covers.
    fn connection_type(&self) -> ConnectionType;

    /// Validates the whole connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::ConfigurationInvalid`] describing the
    /// first violation found.
    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError>;
}

/// The validator for a connection type.
#[must_use]
pub fn validator_for(connection_type: ConnectionType) -> Box<dyn ProtocolValidator> {
    match connection_type {
        ConnectionType::Amqp091 => Box::new(amqp091::Amqp091Validator),
        ConnectionType::Amqp10 => Box::new(amqp10::Amqp10Validator),
        ConnectionType::Mqtt => Box::new(mqtt::MqttValidator),
        ConnectionType::Kafka => Box::new(kafka::KafkaValidator),
        ConnectionType::HttpPush => Box::new(http_push::HttpPushValidator),
    }
}

/// Checks that the connection URI parses and uses an accepted scheme.
///
/// # Errors
///
/// Returns [`ConnectivityError::ConfigurationInvalid`] naming the
/// protocol and the accepted schemes.
pub fn validate_uri_scheme(
    connection: &Connection,
    accepted: &[&str],
    protocol_name: &str,
) -> Result<(), ConnectivityError> {
    let url = Url::parse(&connection.uri).map_err(|e| {
        ConnectivityError::config(format!(
            "connection URI '{}' is malformed: {e}",
            connection.uri
        ))
    })?;
    if !accepted.contains(&url.scheme()) {
        return Err(ConnectivityError::config(format!(
            "the URI scheme '{}' is not valid for {protocol_name} connections, accepted: {}",
            url.scheme(),
            accepted.join(", ")
        )));
    }
    if url.host_str().is_none() {
        return Err(ConnectivityError::config(format!(
            "connection URI '{}' has no host",
            connection.uri
        )));
    }
    Ok(())
}

/// Checks every source's enforcement templates against the namespaces the
/// protocol declares for inputs, and the thing namespace for filters.
///
/// # Errors
///
/// Returns [`ConnectivityError::ConfigurationInvalid`] naming the source
/// and the offending template.
pub fn validate_source_enforcements(
    connection: &Connection,
    input_placeholder: &dyn Placeholder,
) -> Result<(), ConnectivityError> {
    // Filters are checked with a stand-in identity; only the template
    // shape matters here.
    let dummy_thing = ThingId::parse("namespace:name").expect("static id is valid");
    let thing_placeholder = ThingPlaceholder::new(&dummy_thing);

    for source in &connection.sources {
        let Some(enforcement) = &source.enforcement else {
            continue;
        };
        ExpressionResolver::new(vec![input_placeholder])
            .validate(&enforcement.input)
            .map_err(|e| {
                invalid_value(&enforcement.input, "input", &source_description(source, connection))
                    .with_cause(&e)
            })?;
        for filter in &enforcement.filters {
            ExpressionResolver::new(vec![&thing_placeholder])
                .validate(filter)
                .map_err(|e| {
                    invalid_value(filter, "filters", &source_description(source, connection))
                        .with_cause(&e)
                })?;
        }
    }
    Ok(())
}

/// Checks that all payload-mapping aliases of sources and targets resolve
/// against the connection's mapping definitions, building the registry
/// once (which also validates each mapper's options).
///
/// # Errors
///
/// Returns the registry build error or the first unresolved alias.
pub fn validate_payload_mappings(connection: &Connection) -> Result<(), ConnectivityError> {
    let registry = MapperRegistry::from_definitions(
        &connection.mapping_definitions,
        MapperLimits::default(),
        None,
    )?;
    for source in &connection.sources {
        registry.validate_aliases(&source.payload_mapping)?;
    }
    for target in &connection.targets {
        registry.validate_aliases(&target.payload_mapping)?;
    }
    Ok(())
}

/// Checks every source's enforcement input against `source:address`, the
/// namespace most protocols declare for enforcement inputs.
///
/// # Errors
///
/// See [`validate_source_enforcements`].
pub fn validate_source_enforcements_default(
    connection: &Connection,
) -> Result<(), ConnectivityError> {
    let address_placeholder = SourceAddressPlaceholder::new("dummy-address");
    validate_source_enforcements(connection, &address_placeholder)
}

/// Human-readable source position for error messages.
#[must_use]
pub fn source_description(source: &Source, connection: &Connection) -> String {
    format!(
        "source {} of connection '{}'",
        source.index, connection.id
    )
}

/// Human-readable target position for error messages.
#[must_use]
pub fn target_description(target: &Target, connection: &Connection) -> String {
    format!(
        "target '{}' of connection '{}'",
        target.original_address(),
        connection.id
    )
}

/// Builds an "invalid value for configuration" error the way all
/// validators phrase it.
#[must_use]
pub fn invalid_value(value: &str, config_name: &str, location: &str) -> ConnectivityError {
    ConnectivityError::config(format!(
        "invalid value '{value}' for configuration '{config_name}' in {location}"
    ))
}

trait WithCause {
    #[must_use]
    fn with_cause(self, cause: &ConnectivityError) -> ConnectivityError;
}

impl WithCause for ConnectivityError {
    fn with_cause(self, cause: &ConnectivityError) -> ConnectivityError {
        match self {
            ConnectivityError::ConfigurationInvalid { description } => {
                ConnectivityError::config(format!("{description}: {cause}"))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_model::{ConnectionStatus, Enforcement};

    fn connection(uri: &str) -> Connection {
        Connection {
            id: "test".into(),
            connection_type: ConnectionType::Amqp091,
            connection_status: ConnectionStatus::Open,
            failover_enabled: false,
            uri: uri.to_string(),
            client_count: 1,
            sources: vec![],
            targets: vec![],
            default_authorization_context: None,
            mapping_definitions: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn test_uri_scheme_accepted() {
        let c = connection("amqp://host:5672");
        assert!(validate_uri_scheme(&c, &["amqp", "amqps"], "AMQP 0.9.1").is_ok());
    }

    #[test]
    fn test_uri_scheme_rejected() {
        let c = connection("http://host");
        let err = validate_uri_scheme(&c, &["amqp", "amqps"], "AMQP 0.9.1").unwrap_err();
        assert!(err.to_string().contains("AMQP 0.9.1"));
    }

    #[test]
    fn test_malformed_uri_rejected() {
        let c = connection("not a uri");
        assert!(validate_uri_scheme(&c, &["amqp"], "AMQP 0.9.1").is_err());
    }

    #[test]
    fn test_enforcement_templates_validated() {
        let mut c = connection("amqp://host");
        let mut source = Source::new(["queue"]);
        source.enforcement = Some(Enforcement::new(
            "{{ source:address }}",
            ["allowed/{{ thing:id }}"],
        ));
        c.sources.push(source);
        assert!(validate_source_enforcements_default(&c).is_ok());

        c.sources[0].enforcement = Some(Enforcement::new(
            "{{ header:device_id }}",
            ["allowed/{{ thing:id }}"],
        ));
        assert!(validate_source_enforcements_default(&c).is_err());

        c.sources[0].enforcement = Some(Enforcement::new(
            "{{ source:address }}",
            ["allowed/{{ thing:color }}"],
        ));
        assert!(validate_source_enforcements_default(&c).is_err());
    }

    #[test]
    fn test_payload_mapping_aliases_resolve() {
        let mut c = connection("amqp://host");
        let mut source = Source::new(["queue"]);
        source.payload_mapping = vec!["missing".to_string()];
        c.sources.push(source);
        assert!(validate_payload_mappings(&c).is_err());

        c.sources[0].payload_mapping = vec![];
        assert!(validate_payload_mappings(&c).is_ok());
    }
}
