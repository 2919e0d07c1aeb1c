//! Error taxonomy for connectivity operations.
//!
//! Errors that must travel back to the originating broker as twin-protocol
//! error envelopes expose a stable `error_code`; the mapping processor uses
//! it together with the inbound headers to synthesize the outbound payload.

use crate::things::ThingId;

/// Errors raised by the connectivity model and runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectivityError {
    /// A connection configuration failed validation.
    #[error("connection configuration invalid: {description}")]
    ConfigurationInvalid {
        /// Human-readable description of the violation.
        description: String,
    },

    /// A payload mapping produced an invalid result or failed outright.
    #[error("message mapping failed: {message}")]
    MappingFailed {
        /// What went wrong.
        message: String,
        /// Additional hint for the integrator, if any.
        description: Option<String>,
    },

    /// A mapper was instantiated with missing or invalid options.
    #[error("mapper configuration invalid: option '{option}': {message}")]
    MapperConfigurationInvalid {
        /// The offending option name.
        option: String,
        /// Why the option was rejected.
        message: String,
    },

    /// A placeholder in a template could not be resolved in strict mode.
    #[error("placeholder '{{{{ {placeholder} }}}}' could not be resolved")]
    UnresolvedPlaceholder {
        /// The `ns:name` of the offending placeholder.
        placeholder: String,
    },

    /// The enforcement input did not match any resolved filter.
    #[error("signal id enforcement failed for input '{input}'")]
    IdEnforcementFailed {
        /// The resolved enforcement input value.
        input: String,
    },

    /// A thing id did not have the `namespace:name` shape.
    #[error("thing id '{given}' is not valid")]
    ThingIdInvalid {
        /// The rejected identifier.
        given: String,
    },

    /// A twin envelope carried a topic/path combination no signal matches.
    #[error("no signal matches topic '{topic}' with path '{path}'")]
    UnknownTopicPath {
        /// The envelope topic.
        topic: String,
        /// The envelope path.
        path: String,
    },

    /// An envelope topic string could not be parsed at all.
    #[error("topic path '{topic}' is malformed")]
    MalformedTopicPath {
        /// The rejected topic string.
        topic: String,
    },

    /// A thing addressed by a downstream service was not accessible.
    #[error("thing '{thing_id}' is not accessible")]
    ThingNotAccessible {
        /// The inaccessible thing.
        thing_id: ThingId,
    },
}

impl ConnectivityError {
    /// Stable error code carried in outbound error envelopes.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigurationInvalid { .. } => "connectivity:connection.configuration.invalid",
            Self::MappingFailed { .. } => "connectivity:message.mapping.failed",
            Self::MapperConfigurationInvalid { .. } => {
                "connectivity:message.mapper.configuration.invalid"
            }
            Self::UnresolvedPlaceholder { .. } => "connectivity:placeholder.unresolved",
            Self::IdEnforcementFailed { .. } => "connectivity:connection.id.enforcement.failed",
            Self::ThingIdInvalid { .. } => "things:id.invalid",
            Self::UnknownTopicPath { .. } | Self::MalformedTopicPath { .. } => {
                "things:topic.path.unknown"
            }
            Self::ThingNotAccessible { .. } => "things:thing.notfound",
        }
    }

    /// HTTP-style status used in error envelopes.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::ThingNotAccessible { .. } => 404,
            Self::IdEnforcementFailed { .. } => 403,
            _ => 400,
        }
    }

    /// Shorthand for a [`ConnectivityError::ConfigurationInvalid`].
    pub fn config(description: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            description: description.into(),
        }
    }

    /// Shorthand for a [`ConnectivityError::MappingFailed`] without hint.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::MappingFailed {
            message: message.into(),
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let e = ConnectivityError::UnresolvedPlaceholder {
            placeholder: "header:unknown".into(),
        };
        assert_eq!(e.error_code(), "connectivity:placeholder.unresolved");
        assert_eq!(e.status(), 400);
    }

    #[test]
    fn test_display_names_the_placeholder() {
        let e = ConnectivityError::UnresolvedPlaceholder {
            placeholder: "header:unknown".into(),
        };
        assert!(e.to_string().contains("header:unknown"));
    }

    #[test]
    fn test_enforcement_failure_is_forbidden() {
        let e = ConnectivityError::IdEnforcementFailed {
            input: "some/topic".into(),
        };
        assert_eq!(e.status(), 403);
    }
}
