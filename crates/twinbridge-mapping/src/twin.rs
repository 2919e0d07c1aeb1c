//! The twin-protocol passthrough mapper: parses and serializes the
//! canonical JSON envelope without touching its content.

use twinbridge_model::{
    ConnectivityError, Envelope, ExternalMessage, Headers, TWIN_PROTOCOL_CONTENT_TYPE,
};

use crate::mapper::MessageMapper;

/// Default mapper for twin-protocol payloads.
///
/// Inbound: parses the UTF-8 JSON envelope. Outbound: serializes the
/// envelope and stamps the twin-protocol content type. Messages with an
/// empty content type or `application/vnd.eclipse.ditto+json` route here
/// when a source configures no mapping.
#[derive(Debug, Default, Clone)]
pub struct TwinProtocolMapper;

impl MessageMapper for TwinProtocolMapper {
    fn map_inbound(
        &self,
        message: &ExternalMessage,
    ) -> Result<Vec<Envelope>, ConnectivityError> {
        let text = message
            .text_payload()
            .ok_or_else(|| {
                ConnectivityError::mapping("twin-protocol payload is not UTF-8 text")
            })?;
        let envelope = Envelope::from_json_str(text)?;
        Ok(vec![envelope])
    }

    fn map_outbound(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        // Envelope headers double as the external protocol headers.
        let mut headers = Headers::new();
        headers.extend_from(&envelope.headers);
        headers.insert(
            twinbridge_model::headers::CONTENT_TYPE,
            TWIN_PROTOCOL_CONTENT_TYPE,
        );
        let message = ExternalMessage::builder(headers)
            .with_text(envelope.to_json_string())
            .with_topic_path(envelope.topic.clone())
            .build();
        Ok(vec![message])
    }
}
