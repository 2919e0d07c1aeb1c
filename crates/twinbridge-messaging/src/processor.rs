//! The message mapping processor: orchestrates payload mapping fan-out,
//! header mapping, authorization-context resolution, enforcement and
//! outbound address resolution for one connection.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use twinbridge_mapping::{apply_header_mapping, MapperRegistry};
use twinbridge_model::headers::{INBOUND_PAYLOAD_MAPPER, SOURCE_SUBJECT, THING_ID};
use twinbridge_model::{
    AuthorizationContext, Channel, ConnectionId, ConnectivityError, Envelope, ExpressionResolver,
    ExternalMessage, Headers, HeadersPlaceholder, OutboundSignal, Placeholder, ResolveMode, Signal,
    SignalKind, SourceAddressPlaceholder, SubscribedTopic, Target, ThingId, ThingPlaceholder,
    TopicPath, TopicPathPlaceholder,
};

use crate::publisher::{MappedOutbound, PublisherCommand};

/// Commands accepted by the processor worker.
#[derive(Debug)]
pub enum ProcessorCommand {
    /// An inbound external message from a consumer.
    InboundMessage(ExternalMessage),
    /// An outbound signal from the internal bus with its targets.
    OutboundSignal(OutboundSignal),
}

/// Result of processing one inbound external message.
#[derive(Debug, Default)]
pub struct InboundResult {
    /// Signals to forward to the internal bus.
    pub signals: Vec<Signal>,
    /// Error responses to route back through the outbound path.
    pub error_responses: Vec<OutboundSignal>,
}

/// Per-connection mapping processor. Stateless apart from the registry;
/// processing of one message is atomic from the caller's perspective.
pub struct MessageMappingProcessor {
    connection_id: ConnectionId,
    registry: MapperRegistry,
}

impl MessageMappingProcessor {
    /// Creates a processor over a built mapper registry.
    #[must_use]
    pub fn new(connection_id: ConnectionId, registry: MapperRegistry) -> Self {
        Self {
            connection_id,
            registry,
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Maps one external message to signals, applying the full inbound
    /// pipeline. Failures become error responses, never an `Err`.
    #[must_use]
    pub fn process_inbound(&self, message: &ExternalMessage) -> InboundResult {
        let mut result = InboundResult::default();

        // Stamp the correlation id before the fan-out so every mapper's
        // output carries the same one.
        let message = &if message.headers.correlation_id().is_none() {
            message
                .rebuilder()
                .with_additional_header(
                    twinbridge_model::headers::CORRELATION_ID,
                    Uuid::new_v4().to_string(),
                )
                .build()
        } else {
            message.clone()
        };

        let mappers = match self.registry.mappers_for(&message.payload_mapping) {
            Ok(mappers) => mappers,
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "mapper selection failed");
                result
                    .error_responses
                    .push(error_outbound(&e, &message.headers, None));
                return result;
            }
        };

        for mapper in mappers {
            if let Some(content_type) = message.find_content_type() {
                if mapper
                    .content_type_blacklist()
                    .iter()
                    .any(|blocked| blocked == content_type)
                {
                    debug!(
                        connection = %self.connection_id,
                        mapper = %mapper.alias(),
                        content_type = %content_type,
                        "content type blacklisted, mapper skipped"
                    );
                    continue;
                }
            }

            let envelopes = match mapper.map_inbound(message) {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    debug!(
                        connection = %self.connection_id,
                        mapper = %mapper.alias(),
                        error = %e,
                        "inbound payload mapping failed"
                    );
                    result
                        .error_responses
                        .push(error_outbound(&e, &message.headers, None));
                    continue;
                }
            };

            for envelope in envelopes {
                let topic_hint = envelope.topic.clone();
                let envelope_headers = envelope.headers.clone();
                match self.inbound_signal(envelope, message, mapper.alias()) {
                    Ok(signal) => result.signals.push(signal),
                    Err(e) => {
                        debug!(
                            connection = %self.connection_id,
                            error = %e,
                            "inbound signal rejected"
                        );
                        result.error_responses.push(error_outbound(
                            &e,
                            &envelope_headers,
                            Some(&topic_hint),
                        ));
                    }
                }
            }
        }
        result
    }

    /// Builds one signal from a mapped envelope: identity extraction,
    /// mapper stamping, authorization resolution, header mapping and
    /// enforcement, in that order.
    fn inbound_signal(
        &self,
        envelope: Envelope,
        message: &ExternalMessage,
        mapper_alias: &str,
    ) -> Result<Signal, ConnectivityError> {
        let mut signal = Signal::from_envelope(envelope)?;
        signal
            .headers
            .insert(INBOUND_PAYLOAD_MAPPER, mapper_alias);
        signal.headers.insert(THING_ID, signal.thing_id.to_string());

        if let Some(context) = &message.authorization_context {
            let resolved = resolve_authorization_context(context, &message.headers)?;
            if let Some(first) = resolved.first() {
                signal.headers.insert(SOURCE_SUBJECT, first.as_str());
            }
            signal.authorization_context = Some(resolved);
        }

        if let Some(mapping) = &message.header_mapping {
            let headers_placeholder = HeadersPlaceholder::new(&message.headers);
            let thing_placeholder = ThingPlaceholder::new(&signal.thing_id);
            let source_address = message.source_address.clone().unwrap_or_default();
            let source_placeholder = SourceAddressPlaceholder::new(&source_address);
            let produced = apply_header_mapping(
                mapping,
                vec![&headers_placeholder, &thing_placeholder, &source_placeholder],
            );
            signal.headers.extend_from(&produced);
        }

        if let Some(filter) = &message.enforcement {
            filter.match_thing(&signal.thing_id)?;
        }
        Ok(signal)
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Maps one outbound signal to external messages, resolving each
    /// target's address independently. Unresolvable targets are dropped
    /// and logged; siblings are unaffected.
    #[must_use]
    pub fn process_outbound(&self, outbound: &OutboundSignal) -> Vec<MappedOutbound> {
        let signal = &outbound.signal;

        // Response suppression.
        if signal.kind() == SignalKind::CommandResponse && !signal.headers.response_required() {
            debug!(
                connection = %self.connection_id,
                "response not required, suppressing outbound response"
            );
            return Vec::new();
        }

        let envelope = signal.to_envelope();
        let mut mapped_out = Vec::new();

        if outbound.targets.is_empty() {
            if signal.is_response() {
                self.map_for_target(None, &envelope, &[], &mut mapped_out);
            }
            return mapped_out;
        }

        for target in &outbound.targets {
            let resolved_address = match self.resolve_target_address(signal, target) {
                Ok(address) => address,
                Err(e) => {
                    warn!(
                        connection = %self.connection_id,
                        address = %target.original_address(),
                        error = %e,
                        "target address unresolvable, target dropped"
                    );
                    continue;
                }
            };
            let resolved = target.with_resolved_address(resolved_address);
            let aliases = resolved.payload_mapping.clone();
            self.map_for_target(Some(&resolved), &envelope, &aliases, &mut mapped_out);
        }
        mapped_out
    }

    fn map_for_target(
        &self,
        target: Option<&Target>,
        envelope: &Envelope,
        aliases: &[String],
        mapped_out: &mut Vec<MappedOutbound>,
    ) {
        let mappers = match self.registry.mappers_for(aliases) {
            Ok(mappers) => mappers,
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "mapper selection failed");
                return;
            }
        };
        for mapper in mappers {
            match mapper.map_outbound(envelope) {
                Ok(messages) => {
                    for message in messages {
                        let message = match target.and_then(|t| t.header_mapping.as_ref()) {
                            Some(mapping) => {
                                let thing_id = envelope.topic.thing_id().ok();
                                apply_outbound_header_mapping(mapping, envelope, thing_id, message)
                            }
                            None => message,
                        };
                        mapped_out.push(MappedOutbound {
                            target: target.cloned(),
                            message,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        connection = %self.connection_id,
                        mapper = %mapper.alias(),
                        error = %e,
                        "outbound payload mapping failed"
                    );
                }
            }
        }
    }

    /// Resolves a target address over topic, thing and header namespaces.
    /// Unknown namespaces stay literal; known but unresolvable ones fail
    /// the target.
    fn resolve_target_address(
        &self,
        signal: &Signal,
        target: &Target,
    ) -> Result<String, ConnectivityError> {
        let topic_placeholder = TopicPathPlaceholder::new(&signal.topic);
        let thing_placeholder = ThingPlaceholder::new(&signal.thing_id);
        let headers_placeholder = HeadersPlaceholder::new(&signal.headers);
        let resolver = ExpressionResolver::new(vec![
            &topic_placeholder,
            &thing_placeholder,
            &headers_placeholder,
        ]);
        resolver.resolve(&target.address, ResolveMode::KeepUnknown)
    }
}

fn apply_outbound_header_mapping(
    mapping: &twinbridge_model::HeaderMapping,
    envelope: &Envelope,
    thing_id: Option<ThingId>,
    message: ExternalMessage,
) -> ExternalMessage {
    let headers_placeholder = HeadersPlaceholder::new(&envelope.headers);
    let mut placeholders: Vec<&dyn Placeholder> = vec![&headers_placeholder];
    let thing_placeholder = thing_id.as_ref().map(ThingPlaceholder::new);
    if let Some(p) = &thing_placeholder {
        placeholders.push(p);
    }
    let produced = apply_header_mapping(mapping, placeholders);
    let mut headers = message.headers.clone();
    headers.extend_from(&produced);
    message.rebuilder().with_headers(headers).build()
}

/// Resolves `{{ header:* }}` placeholders in authorization subjects
/// against the external message headers.
fn resolve_authorization_context(
    context: &AuthorizationContext,
    headers: &Headers,
) -> Result<AuthorizationContext, ConnectivityError> {
    let headers_placeholder = HeadersPlaceholder::new(headers);
    let resolver = ExpressionResolver::new(vec![&headers_placeholder]);
    let subjects = context
        .iter()
        .map(|subject| resolver.resolve(subject.as_str(), ResolveMode::Strict))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AuthorizationContext::of(subjects))
}

/// Synthesizes the outbound error response for a failure, preserving the
/// correlation id of the originator and the channel of the failure site.
fn error_outbound(
    error: &ConnectivityError,
    correlation_headers: &Headers,
    topic_hint: Option<&TopicPath>,
) -> OutboundSignal {
    let (thing_id, channel) = match topic_hint {
        Some(topic) => (
            topic
                .thing_id()
                .unwrap_or_else(|_| fallback_thing_id()),
            topic.channel,
        ),
        None => (fallback_thing_id(), Channel::Twin),
    };

    let mut headers = Headers::new();
    if let Some(correlation_id) = correlation_headers.correlation_id() {
        headers.insert(twinbridge_model::headers::CORRELATION_ID, correlation_id);
    }
    if let Some(reply_to) = correlation_headers.reply_to() {
        headers.insert(twinbridge_model::headers::REPLY_TO, reply_to);
    }

    let signal = Signal::error_response(&thing_id, channel, error, headers);
    OutboundSignal::new(signal, Vec::new())
}

fn fallback_thing_id() -> ThingId {
    ThingId::parse("_:_").expect("static id is valid")
}

/// Selects the configured targets subscribed to `signal`'s topic family.
#[must_use]
pub fn targets_for_signal<'a>(signal: &Signal, targets: &'a [Target]) -> Vec<&'a Target> {
    let wanted = match (signal.kind(), signal.topic.channel) {
        (SignalKind::Event, Channel::Twin) => SubscribedTopic::TwinEvents,
        (SignalKind::Event, Channel::Live) => SubscribedTopic::LiveEvents,
        (SignalKind::ErrorResponse, _) => SubscribedTopic::Errors,
        (SignalKind::Command | SignalKind::CommandResponse, _)
            if signal.topic.criterion == twinbridge_model::Criterion::Messages =>
        {
            SubscribedTopic::LiveMessages
        }
        (SignalKind::Command | SignalKind::CommandResponse, _) => SubscribedTopic::LiveCommands,
    };
    targets
        .iter()
        .filter(|target| target.topics.contains(&wanted))
        .collect()
}

/// Running processor worker.
pub struct ProcessorHandle {
    /// Command inbox of the worker.
    pub tx: mpsc::Sender<ProcessorCommand>,
    /// Join handle of the worker task.
    pub join: JoinHandle<()>,
}

/// Spawns the processor worker: inbound signals go to `bus_tx`, mapped
/// outbound messages (including error responses) to `publisher_tx`.
#[must_use]
pub fn spawn_processor(
    processor: MessageMappingProcessor,
    bus_tx: mpsc::Sender<Signal>,
    publisher_tx: mpsc::Sender<PublisherCommand>,
) -> ProcessorHandle {
    let (tx, mut rx) = mpsc::channel::<ProcessorCommand>(64);
    let join = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ProcessorCommand::InboundMessage(message) => {
                    let result = processor.process_inbound(&message);
                    for signal in result.signals {
                        if bus_tx.send(signal).await.is_err() {
                            return;
                        }
                    }
                    for error_response in result.error_responses {
                        for mapped in processor.process_outbound(&error_response) {
                            let _ = publisher_tx
                                .send(PublisherCommand::Publish(mapped))
                                .await;
                        }
                    }
                }
                ProcessorCommand::OutboundSignal(outbound) => {
                    for mapped in processor.process_outbound(&outbound) {
                        let _ = publisher_tx.send(PublisherCommand::Publish(mapped)).await;
                    }
                }
            }
        }
    });
    ProcessorHandle { tx, join }
}
