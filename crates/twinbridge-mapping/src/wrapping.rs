//! The wrapping layer applied to every payload mapper, regardless of
//! implementation: correlation-id and reply-to propagation, header
//! precedence, mapped-message limits and the response flag.

use uuid::Uuid;

use twinbridge_model::headers::{CORRELATION_ID, REPLY_TO};
use twinbridge_model::{ConnectivityError, Envelope, ExternalMessage, Headers, MappingContext};

use crate::mapper::{MapperLimits, MessageMapper};

/// Wraps a [`MessageMapper`], enforcing the invariants the processor
/// relies on even when the wrapped mapper forgets them.
pub struct WrappingMapper {
    alias: String,
    delegate: Box<dyn MessageMapper>,
    limits: MapperLimits,
}

impl WrappingMapper {
    /// Wraps `delegate` under `alias`.
    #[must_use]
    pub fn wrap(alias: impl Into<String>, delegate: Box<dyn MessageMapper>, limits: MapperLimits) -> Self {
        Self {
            alias: alias.into(),
            delegate,
            limits,
        }
    }

    /// The alias this mapper is registered under.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Content types the wrapped mapper refuses.
    #[must_use]
    pub fn content_type_blacklist(&self) -> Vec<String> {
        self.delegate.content_type_blacklist()
    }

    /// Configures the wrapped mapper.
    ///
    /// # Errors
    ///
    /// Propagates configuration errors of the wrapped mapper.
    pub fn configure(&mut self, context: &MappingContext) -> Result<(), ConnectivityError> {
        self.delegate.configure(context)
    }

    /// Maps inbound, generating a correlation id when the message has
    /// none and stamping it (plus `reply-to`) on every produced envelope.
    /// Headers set by the mapper itself win over the wrapper's.
    ///
    /// # Errors
    ///
    /// Propagates mapper failures; exceeding the inbound limit is a
    /// [`ConnectivityError::MappingFailed`].
    pub fn map_inbound(
        &self,
        message: &ExternalMessage,
    ) -> Result<Vec<Envelope>, ConnectivityError> {
        let (enhanced, correlation_id) = match message.headers.correlation_id() {
            Some(id) => (message.clone(), id.to_string()),
            None => {
                let id = Uuid::new_v4().to_string();
                let enhanced = message
                    .rebuilder()
                    .with_additional_header(CORRELATION_ID, id.clone())
                    .build();
                (enhanced, id)
            }
        };

        let mut mapped = self.delegate.map_inbound(&enhanced)?;
        self.check_limit(mapped.len(), self.limits.max_mapped_inbound_messages)?;

        for envelope in &mut mapped {
            let mut headers = Headers::new().with(CORRELATION_ID, correlation_id.clone());
            if let Some(reply_to) = message.headers.reply_to() {
                headers.insert(REPLY_TO, reply_to);
            }
            // mapper-set headers overwrite the wrapper's
            headers.extend_from(&envelope.headers);
            envelope.headers = headers;
        }
        Ok(mapped)
    }

    /// Maps outbound, propagating `reply-to` and flagging responses.
    ///
    /// # Errors
    ///
    /// Propagates mapper failures; exceeding the outbound limit is a
    /// [`ConnectivityError::MappingFailed`].
    pub fn map_outbound(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        let mapped = self.delegate.map_outbound(envelope)?;
        self.check_limit(mapped.len(), self.limits.max_mapped_outbound_messages)?;

        Ok(mapped
            .into_iter()
            .map(|message| {
                let mut builder = message.rebuilder().as_response(envelope.is_response());
                if let Some(reply_to) = envelope.headers.reply_to() {
                    builder = builder.with_additional_header(REPLY_TO, reply_to);
                }
                builder.build()
            })
            .collect())
    }

    fn check_limit(&self, produced: usize, limit: usize) -> Result<(), ConnectivityError> {
        if limit > 0 && produced > limit {
            return Err(ConnectivityError::MappingFailed {
                message: "the number of messages produced by the payload mapping exceeded the limits"
                    .to_string(),
                description: Some(format!(
                    "the payload mapping '{}' produced {produced} messages, which exceeds the limit of {limit}",
                    self.alias
                )),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for WrappingMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingMapper")
            .field("alias", &self.alias)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
