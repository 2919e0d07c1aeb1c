//! Mapping processor behavior: placeholder resolution, enforcement,
//! error-response synthesis and response suppression.

use std::collections::BTreeMap;

use twinbridge_mapping::{MapperLimits, MapperRegistry};
use twinbridge_messaging::processor::MessageMappingProcessor;
use twinbridge_model::headers::{
    CORRELATION_ID, INBOUND_PAYLOAD_MAPPER, RESPONSE_REQUIRED, SOURCE_SUBJECT,
};
use twinbridge_model::{
    AuthorizationContext, Channel, ConnectivityError, Enforcement, EnforcementFilterFactory,
    Envelope, ExternalMessage, Headers, MappingContext, OutboundSignal, Placeholder, Signal,
    SignalKind, SubscribedTopic, Target, ThingId, TopicPath,
};

const KNOWN_THING_ID: &str = "my:thing";

fn processor() -> MessageMappingProcessor {
    let mut definitions = BTreeMap::new();
    definitions.insert(
        "header".to_string(),
        MappingContext::new("AddHeader")
            .with_option("inboundHeaders", r#"{"injected": "yes"}"#),
    );
    let registry =
        MapperRegistry::from_definitions(&definitions, MapperLimits::default(), None).unwrap();
    MessageMappingProcessor::new("testConnection".into(), registry)
}

fn modify_command_json(correlation_id: &str) -> String {
    format!(
        r#"{{
            "topic": "my/thing/things/twin/commands/modify",
            "headers": {{ "correlation-id": "{correlation_id}" }},
            "path": "/attributes/foo",
            "value": 42
        }}"#
    )
}

struct TestPlaceholder<'a>(&'a str);

impl Placeholder for TestPlaceholder<'_> {
    fn prefix(&self) -> &str {
        "test"
    }

    fn supports(&self, _name: &str) -> bool {
        true
    }

    fn resolve(&self, _name: &str) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn enforcement_filter(wire_value: &str) -> twinbridge_model::EnforcementFilter {
    let enforcement = Enforcement::new(
        "{{ test:placeholder }}",
        ["mqtt/topic/{{ thing:namespace }}/{{ thing:name }}"],
    );
    EnforcementFilterFactory::with_mqtt_matching(enforcement)
        .filter_with(&TestPlaceholder(wire_value))
        .unwrap()
}

// ── Inbound ─────────────────────────────────────────────────────────

#[test]
fn default_mapper_processes_twin_protocol_message() {
    let message = ExternalMessage::builder(Headers::new())
        .with_text(modify_command_json("c-1"))
        .with_authorization_context(AuthorizationContext::of(["integration:test"]))
        .build();

    let result = processor().process_inbound(&message);
    assert!(result.error_responses.is_empty());
    assert_eq!(result.signals.len(), 1);

    let signal = &result.signals[0];
    assert_eq!(signal.thing_id, ThingId::parse(KNOWN_THING_ID).unwrap());
    assert_eq!(signal.headers.correlation_id(), Some("c-1"));
    assert_eq!(signal.headers.get(INBOUND_PAYLOAD_MAPPER), Some("default"));
    // thing id is included in the headers for error reporting
    assert_eq!(signal.headers.get("thing-id"), Some(KNOWN_THING_ID));
}

#[test]
fn configured_mapper_stamps_its_alias_and_headers() {
    let message = ExternalMessage::builder(Headers::new())
        .with_text(modify_command_json("c-2"))
        .with_payload_mapping(vec!["header".to_string()])
        .build();

    let result = processor().process_inbound(&message);
    let signal = &result.signals[0];
    assert_eq!(signal.headers.get(INBOUND_PAYLOAD_MAPPER), Some("header"));
    assert_eq!(signal.headers.get("injected"), Some("yes"));
}

#[test]
fn generated_correlation_id_is_identical_across_mapper_fanout() {
    let payload = r#"{
        "topic": "my/thing/things/twin/commands/modify",
        "path": "/attributes/foo",
        "value": 42
    }"#;
    let message = ExternalMessage::builder(Headers::new())
        .with_text(payload)
        .with_payload_mapping(vec!["default".to_string(), "header".to_string()])
        .build();

    let result = processor().process_inbound(&message);
    assert_eq!(result.signals.len(), 2);

    let first = result.signals[0].headers.correlation_id().unwrap();
    assert!(!first.is_empty());
    assert_eq!(result.signals[1].headers.correlation_id(), Some(first));
}

#[test]
fn authorization_subject_placeholders_resolved() {
    let correlation_id = "c-4711";
    let context = AuthorizationContext::of([
        "integration:{{header:correlation-id}}:hub-{{   header:content-type   }}",
        "integration:{{header:content-type}}:hub-{{ header:correlation-id }}",
    ]);
    let message = ExternalMessage::builder(
        Headers::new()
            .with(CORRELATION_ID, correlation_id)
            .with("content-type", "application/json"),
    )
    .with_text(modify_command_json(correlation_id))
    .with_authorization_context(context)
    .build();

    let result = processor().process_inbound(&message);
    assert_eq!(result.signals.len(), 1);
    let signal = &result.signals[0];

    let expected = AuthorizationContext::of([
        format!("integration:{correlation_id}:hub-application/json"),
        format!("integration:application/json:hub-{correlation_id}"),
    ]);
    assert_eq!(signal.authorization_context.as_ref(), Some(&expected));
    assert_eq!(
        signal.headers.get(SOURCE_SUBJECT),
        Some(format!("integration:{correlation_id}:hub-application/json").as_str())
    );
}

#[test]
fn unknown_authorization_placeholder_yields_error_response() {
    let message = ExternalMessage::builder(Headers::new().with(CORRELATION_ID, "c-9"))
        .with_text(modify_command_json("c-9"))
        .with_authorization_context(AuthorizationContext::of(["integration:{{header:unknown}}"]))
        .build();

    let result = processor().process_inbound(&message);
    assert!(result.signals.is_empty());
    assert_eq!(result.error_responses.len(), 1);

    let error_signal = &result.error_responses[0].signal;
    assert_eq!(error_signal.kind(), SignalKind::ErrorResponse);
    let value = error_signal.value.as_ref().unwrap();
    assert_eq!(value["error"], "connectivity:placeholder.unresolved");
    assert!(value["message"].as_str().unwrap().contains("header:unknown"));
}

#[test]
fn enforcement_accepts_matching_identity() {
    let message = ExternalMessage::builder(Headers::new())
        .with_text(modify_command_json("c-5"))
        .with_enforcement(Some(enforcement_filter("mqtt/topic/my/thing")))
        .build();

    let result = processor().process_inbound(&message);
    assert!(result.error_responses.is_empty());
    assert_eq!(result.signals.len(), 1);
}

#[test]
fn enforcement_mismatch_yields_error_response_and_no_forward() {
    let message = ExternalMessage::builder(Headers::new())
        .with_text(modify_command_json("c-6"))
        .with_enforcement(Some(enforcement_filter("some/invalid/target")))
        .build();

    let result = processor().process_inbound(&message);
    assert!(result.signals.is_empty());
    assert_eq!(result.error_responses.len(), 1);

    let error_signal = &result.error_responses[0].signal;
    assert_eq!(error_signal.headers.correlation_id(), Some("c-6"));
    assert_eq!(
        error_signal.topic.to_string(),
        "my/thing/things/twin/errors"
    );
    let value = error_signal.value.as_ref().unwrap();
    assert_eq!(
        value["error"],
        "connectivity:connection.id.enforcement.failed"
    );
}

#[test]
fn twin_topic_path_combination_error_retains_correlation_id() {
    let correlation_id = "combo-1";
    let payload = format!(
        r#"{{
            "topic": "Testspace/octopus/things/twin/commands/retrieve",
            "path": "/policyId",
            "headers": {{ "correlation-id": "{correlation_id}" }}
        }}"#
    );
    let message = ExternalMessage::builder(Headers::new())
        .with_text(payload)
        .build();

    let processor = processor();
    let result = processor.process_inbound(&message);
    assert!(result.signals.is_empty());
    assert_eq!(result.error_responses.len(), 1);

    // route the error response outbound the way the worker does
    let mapped = processor.process_outbound(&result.error_responses[0]);
    assert_eq!(mapped.len(), 1);
    assert_eq!(
        mapped[0].message.headers.correlation_id(),
        Some(correlation_id)
    );
}

#[test]
fn live_topic_path_combination_error_retains_live_channel() {
    let payload = r#"{
        "topic": "Testspace/octopus/things/live/commands/retrieve",
        "path": "/policyId"
    }"#;
    let message = ExternalMessage::builder(Headers::new())
        .with_text(payload)
        .build();

    let processor = processor();
    let result = processor.process_inbound(&message);
    let mapped = processor.process_outbound(&result.error_responses[0]);

    let envelope = Envelope::from_json_str(mapped[0].message.text_payload().unwrap()).unwrap();
    assert_eq!(
        envelope.topic.to_string(),
        "Testspace/octopus/things/live/errors"
    );
}

// ── Outbound ────────────────────────────────────────────────────────

fn live_message_signal() -> Signal {
    Signal::from_envelope(Envelope {
        topic: TopicPath::parse("org.eclipse/octopus/things/live/messages/some-subject").unwrap(),
        path: "/outbox/messages/some-subject".to_string(),
        value: Some(serde_json::json!("payload")),
        status: None,
        headers: Headers::new().with(CORRELATION_ID, "out-1"),
    })
    .unwrap()
}

fn live_message_target(address: &str) -> Target {
    Target::new(address, vec![SubscribedTopic::LiveMessages])
}

#[test]
fn topic_placeholder_resolved_per_target_independently() {
    let signal = live_message_signal();
    let outbound = OutboundSignal::new(
        signal,
        vec![
            live_message_target("some/topic/{{ topic:action-subject }}"),
            live_message_target("some/topic/{{ eclipse:ditto }}"),
            live_message_target("fixedAddress"),
        ],
    );

    let mapped = processor().process_outbound(&outbound);
    assert_eq!(mapped.len(), 3);

    let mut addresses: Vec<(String, String)> = mapped
        .iter()
        .map(|m| {
            let target = m.target.as_ref().unwrap();
            (target.address.clone(), target.original_address().to_string())
        })
        .collect();
    addresses.sort();
    assert_eq!(
        addresses,
        vec![
            ("fixedAddress".to_string(), "fixedAddress".to_string()),
            (
                "some/topic/some-subject".to_string(),
                "some/topic/{{ topic:action-subject }}".to_string()
            ),
            (
                "some/topic/{{ eclipse:ditto }}".to_string(),
                "some/topic/{{ eclipse:ditto }}".to_string()
            ),
        ]
    );
}

#[test]
fn unresolvable_target_dropped_without_affecting_siblings() {
    // header:absent is a known namespace, so this target must fail
    let signal = live_message_signal();
    let outbound = OutboundSignal::new(
        signal,
        vec![
            live_message_target("addr/{{ header:absent }}"),
            live_message_target("fixedAddress"),
        ],
    );

    let mapped = processor().process_outbound(&outbound);
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped[0].target.as_ref().unwrap().address, "fixedAddress");
}

#[test]
fn command_response_without_response_required_is_suppressed() {
    let mut signal = Signal::from_envelope(Envelope {
        topic: TopicPath::parse("my/thing/things/twin/commands/modify").unwrap(),
        path: "/attributes/foo".to_string(),
        value: None,
        status: Some(204),
        headers: Headers::new().with(RESPONSE_REQUIRED, "false"),
    })
    .unwrap();
    signal.headers.insert(CORRELATION_ID, "suppressed");

    let outbound = OutboundSignal::new(signal, vec![]);
    assert!(processor().process_outbound(&outbound).is_empty());
}

#[test]
fn command_response_is_mapped_with_twin_content_type() {
    let signal = Signal::from_envelope(Envelope {
        topic: TopicPath::parse("my/thing/things/twin/commands/modify").unwrap(),
        path: "/attributes/foo".to_string(),
        value: None,
        status: Some(204),
        headers: Headers::new()
            .with(CORRELATION_ID, "resp-1")
            .with("reply-to", "replies"),
    })
    .unwrap();

    let mapped = processor().process_outbound(&OutboundSignal::new(signal, vec![]));
    assert_eq!(mapped.len(), 1);
    assert!(mapped[0].target.is_none());
    assert!(mapped[0].message.response);
    assert_eq!(
        mapped[0].message.find_content_type(),
        Some("application/vnd.eclipse.ditto+json")
    );
    assert_eq!(mapped[0].message.headers.correlation_id(), Some("resp-1"));
}

#[test]
fn downstream_error_response_retains_topic_and_correlation_id() {
    let thing_id = ThingId::parse(KNOWN_THING_ID).unwrap();
    let error = ConnectivityError::ThingNotAccessible {
        thing_id: thing_id.clone(),
    };
    let signal = Signal::error_response(
        &thing_id,
        Channel::Twin,
        &error,
        Headers::new().with(CORRELATION_ID, "err-7"),
    );

    let mapped = processor().process_outbound(&OutboundSignal::new(signal, vec![]));
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped[0].message.headers.correlation_id(), Some("err-7"));

    let envelope = Envelope::from_json_str(mapped[0].message.text_payload().unwrap()).unwrap();
    assert_eq!(envelope.topic.to_string(), "my/thing/things/twin/errors");
    assert_eq!(envelope.status, Some(404));
}

#[test]
fn outbound_header_mapping_applied_after_payload_mapping() {
    let signal = live_message_signal();
    let mut target = live_message_target("fixedAddress");
    target.header_mapping = Some(twinbridge_model::HeaderMapping::from([
        ("device_id", "{{ thing:id }}"),
        ("correlation", "{{ header:correlation-id }}"),
        ("missing", "{{ header:absent }}"),
    ]));

    let mapped = processor().process_outbound(&OutboundSignal::new(signal, vec![target]));
    assert_eq!(mapped.len(), 1);
    let headers = &mapped[0].message.headers;
    assert_eq!(headers.get("device_id"), Some("org.eclipse:octopus"));
    assert_eq!(headers.get("correlation"), Some("out-1"));
    assert!(!headers.contains("missing"));
}
