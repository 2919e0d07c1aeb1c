//! The payload-mapper contract.

use twinbridge_model::{ConnectivityError, Envelope, ExternalMessage, MappingContext};

/// Limits applied to the output of a single mapper invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperLimits {
    /// Maximum signals one inbound message may map to.
    pub max_mapped_inbound_messages: usize,
    /// Maximum external messages one signal may map to.
    pub max_mapped_outbound_messages: usize,
}

impl Default for MapperLimits {
    fn default() -> Self {
        Self {
            max_mapped_inbound_messages: 10,
            max_mapped_outbound_messages: 10,
        }
    }
}

/// Converts between external messages and twin-protocol envelopes.
///
/// Implementations are stateless after [`configure`](Self::configure) and
/// shared across consumers of a connection. Inbound and outbound mapping
/// both fan out: each call may produce zero or more results.
pub trait MessageMapper: Send + Sync {
    /// Applies the mapping context captured at connection start.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError::MapperConfigurationInvalid`] when a
    /// mandatory option is missing or malformed.
    fn configure(&mut self, context: &MappingContext) -> Result<(), ConnectivityError> {
        let _ = context;
        Ok(())
    }

    /// Maps an external message to zero or more envelopes.
    ///
    /// # Errors
    ///
    /// Returns a mapping failure when the payload cannot be interpreted.
    fn map_inbound(&self, message: &ExternalMessage)
        -> Result<Vec<Envelope>, ConnectivityError>;

    /// Maps an envelope to zero or more external messages.
    ///
    /// # Errors
    ///
    /// Returns a mapping failure when the envelope cannot be serialized.
    fn map_outbound(&self, envelope: &Envelope)
        -> Result<Vec<ExternalMessage>, ConnectivityError>;

    /// Content types this mapper refuses to handle.
    fn content_type_blacklist(&self) -> Vec<String> {
        Vec::new()
    }
}
