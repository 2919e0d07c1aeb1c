//! Maps Eclipse Hono connection-status notifications to twin commands.
//!
//! Reads the `creation-time` and `ttd` headers of a device notification
//! and maintains a `ConnectionStatus` feature on the configured thing:
//! the feature's `status/readySince` and `status/readyUntil` properties
//! reflect the window in which the device is reachable.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::debug;

use twinbridge_model::headers::RESPONSE_REQUIRED;
use twinbridge_model::{
    contains_placeholder, Channel, ConnectivityError, Criterion, Envelope, ExpressionResolver,
    ExternalMessage, Headers, HeadersPlaceholder, MappingContext, ResolveMode, ThingId, TopicPath,
};

use crate::mapper::MessageMapper;

const HEADER_HONO_TTD: &str = "ttd";
const HEADER_HONO_CREATION_TIME: &str = "creation-time";

const OPTION_THING_ID: &str = "thingId";
const OPTION_FEATURE_ID: &str = "featureId";
const DEFAULT_FEATURE_ID: &str = "ConnectionStatus";

const FEATURE_DEFINITION: &str = "org.eclipse.ditto:ConnectionStatus:1.0.0";

// (unix time) 253402300799 = (ISO-8601) 9999-12-31T23:59:59
const DISTANT_FUTURE_SECONDS: i64 = 253_402_300_799;

/// Mapper maintaining a `ConnectionStatus` feature from Hono `ttd` /
/// `creation-time` headers. The `thingId` option is mandatory and may
/// contain `{{ header:* }}` placeholders; `featureId` defaults to
/// `ConnectionStatus`. Mapping failures yield an empty result rather than
/// an error so that a malformed notification never poisons the source.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStatusMapper {
    thing_id_template: String,
    feature_id_template: String,
}

impl MessageMapper for ConnectionStatusMapper {
    fn configure(&mut self, context: &MappingContext) -> Result<(), ConnectivityError> {
        let thing_id = context.find_option(OPTION_THING_ID).ok_or_else(|| {
            ConnectivityError::MapperConfigurationInvalid {
                option: OPTION_THING_ID.to_string(),
                message: "the mandatory option is missing".to_string(),
            }
        })?;
        if !contains_placeholder(thing_id) {
            ThingId::parse(thing_id).map_err(|e| {
                ConnectivityError::MapperConfigurationInvalid {
                    option: OPTION_THING_ID.to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        self.thing_id_template = thing_id.to_string();
        self.feature_id_template = context
            .find_option(OPTION_FEATURE_ID)
            .unwrap_or(DEFAULT_FEATURE_ID)
            .to_string();
        Ok(())
    }

    fn map_inbound(
        &self,
        message: &ExternalMessage,
    ) -> Result<Vec<Envelope>, ConnectivityError> {
        match self.try_map(message) {
            Ok(envelope) => Ok(vec![envelope]),
            Err(e) => {
                debug!(error = %e, "connection-status mapping skipped");
                Ok(Vec::new())
            }
        }
    }

    fn map_outbound(
        &self,
        _envelope: &Envelope,
    ) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        Ok(Vec::new())
    }
}

impl ConnectionStatusMapper {
    fn try_map(&self, message: &ExternalMessage) -> Result<Envelope, ConnectivityError> {
        let headers_placeholder = HeadersPlaceholder::new(&message.headers);
        let resolver = ExpressionResolver::new(vec![&headers_placeholder]);

        let thing_id =
            ThingId::parse(&resolver.resolve(&self.thing_id_template, ResolveMode::Strict)?)?;
        let feature_id = resolver.resolve(&self.feature_id_template, ResolveMode::Strict)?;

        let creation_time = extract_long_header(&message.headers, HEADER_HONO_CREATION_TIME)?;
        let ttd = extract_long_header(&message.headers, HEADER_HONO_TTD)?;

        if creation_time < 0 {
            return Err(ConnectivityError::mapping(format!(
                "invalid value in header '{HEADER_HONO_CREATION_TIME}': {creation_time}"
            )));
        }
        if ttd < -1 {
            return Err(ConnectivityError::mapping(format!(
                "invalid value in header '{HEADER_HONO_TTD}': {ttd}"
            )));
        }

        let ready_since = iso_from_millis(creation_time)?;
        let envelope = if ttd == 0 {
            modify_feature_property(&thing_id, &feature_id, &ready_since)
        } else if ttd == -1 {
            let ready_until = iso_from_seconds(DISTANT_FUTURE_SECONDS)?;
            modify_feature(&thing_id, &feature_id, &ready_since, &ready_until)
        } else {
            let ready_until = iso_from_millis(creation_time + ttd * 1000)?;
            modify_feature(&thing_id, &feature_id, &ready_since, &ready_until)
        };
        Ok(envelope)
    }
}

fn extract_long_header(headers: &Headers, key: &str) -> Result<i64, ConnectivityError> {
    let raw = headers
        .get(key)
        .ok_or_else(|| ConnectivityError::mapping(format!("header '{key}' is not set")))?;
    raw.parse().map_err(|_| {
        ConnectivityError::mapping(format!("header '{key}' is not convertible to an integer"))
    })
}

fn iso_from_millis(millis: i64) -> Result<String, ConnectivityError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .ok_or_else(|| ConnectivityError::mapping(format!("timestamp {millis} out of range")))
}

fn iso_from_seconds(seconds: i64) -> Result<String, ConnectivityError> {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .ok_or_else(|| ConnectivityError::mapping(format!("timestamp {seconds} out of range")))
}

fn command_headers() -> Headers {
    // The feature update is fire-and-forget.
    Headers::new().with(RESPONSE_REQUIRED, "false")
}

fn modify_feature_property(thing_id: &ThingId, feature_id: &str, ready_until: &str) -> Envelope {
    Envelope {
        topic: TopicPath::of(thing_id, Channel::Twin, Criterion::Commands, Some("modify")),
        path: format!("/features/{feature_id}/properties/status/readyUntil"),
        value: Some(json!(ready_until)),
        status: None,
        headers: command_headers(),
    }
}

fn modify_feature(
    thing_id: &ThingId,
    feature_id: &str,
    ready_since: &str,
    ready_until: &str,
) -> Envelope {
    Envelope {
        topic: TopicPath::of(thing_id, Channel::Twin, Criterion::Commands, Some("modify")),
        path: format!("/features/{feature_id}"),
        value: Some(json!({
            "definition": [FEATURE_DEFINITION],
            "properties": {
                "status": {
                    "readySince": ready_since,
                    "readyUntil": ready_until,
                }
            }
        })),
        status: None,
        headers: command_headers(),
    }
}
