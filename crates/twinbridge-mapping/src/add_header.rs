//! A mapper that passes twin-protocol payloads through and adds
//! configured headers on the way in and out.

use std::collections::BTreeMap;

use twinbridge_model::{ConnectivityError, Envelope, ExternalMessage, MappingContext};

use crate::mapper::MessageMapper;
use crate::twin::TwinProtocolMapper;

const OPTION_INBOUND: &str = "inboundHeaders";
const OPTION_OUTBOUND: &str = "outboundHeaders";

/// Passes the payload through the twin-protocol mapper and injects fixed
/// header pairs: `inboundHeaders` onto produced signals, `outboundHeaders`
/// onto produced external messages. Both options carry JSON objects.
#[derive(Debug, Default, Clone)]
pub struct AddHeaderMapper {
    inbound: BTreeMap<String, String>,
    outbound: BTreeMap<String, String>,
}

fn parse_header_option(
    context: &MappingContext,
    option: &str,
) -> Result<BTreeMap<String, String>, ConnectivityError> {
    match context.find_option(option) {
        None => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            ConnectivityError::MapperConfigurationInvalid {
                option: option.to_string(),
                message: format!("expected a JSON object of header pairs: {e}"),
            }
        }),
    }
}

impl MessageMapper for AddHeaderMapper {
    fn configure(&mut self, context: &MappingContext) -> Result<(), ConnectivityError> {
        self.inbound = parse_header_option(context, OPTION_INBOUND)?;
        self.outbound = parse_header_option(context, OPTION_OUTBOUND)?;
        Ok(())
    }

    fn map_inbound(
        &self,
        message: &ExternalMessage,
    ) -> Result<Vec<Envelope>, ConnectivityError> {
        let mut envelopes = TwinProtocolMapper.map_inbound(message)?;
        for envelope in &mut envelopes {
            for (k, v) in &self.inbound {
                envelope.headers.insert(k.clone(), v.clone());
            }
        }
        Ok(envelopes)
    }

    fn map_outbound(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        let messages = TwinProtocolMapper.map_outbound(envelope)?;
        Ok(messages
            .into_iter()
            .map(|message| {
                let mut builder = message.rebuilder();
                for (k, v) in &self.outbound {
                    builder = builder.with_additional_header(k.clone(), v.clone());
                }
                builder.build()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_model::Headers;

    const ENVELOPE_JSON: &str = r#"{
        "topic": "my/thing/things/twin/commands/modify",
        "path": "/attributes/foo",
        "value": 1
    }"#;

    fn configured() -> AddHeaderMapper {
        let context = MappingContext::new("AddHeader")
            .with_option(OPTION_INBOUND, r#"{"injected-in": "in-value"}"#)
            .with_option(OPTION_OUTBOUND, r#"{"injected-out": "out-value"}"#);
        let mut mapper = AddHeaderMapper::default();
        mapper.configure(&context).unwrap();
        mapper
    }

    #[test]
    fn test_inbound_header_injected() {
        let mapper = configured();
        let message = ExternalMessage::builder(Headers::new())
            .with_text(ENVELOPE_JSON)
            .build();
        let envelopes = mapper.map_inbound(&message).unwrap();
        assert_eq!(envelopes[0].headers.get("injected-in"), Some("in-value"));
    }

    #[test]
    fn test_outbound_header_injected() {
        let mapper = configured();
        let envelope = Envelope::from_json_str(ENVELOPE_JSON).unwrap();
        let messages = mapper.map_outbound(&envelope).unwrap();
        assert_eq!(messages[0].headers.get("injected-out"), Some("out-value"));
    }

    #[test]
    fn test_malformed_option_rejected() {
        let context =
            MappingContext::new("AddHeader").with_option(OPTION_INBOUND, "not-json");
        let mut mapper = AddHeaderMapper::default();
        let err = mapper.configure(&context).unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::MapperConfigurationInvalid { .. }
        ));
    }

    #[test]
    fn test_unconfigured_adds_nothing() {
        let mapper = AddHeaderMapper::default();
        let message = ExternalMessage::builder(Headers::new())
            .with_text(ENVELOPE_JSON)
            .build();
        let envelopes = mapper.map_inbound(&message).unwrap();
        assert!(envelopes[0].headers.is_empty());
    }
}
