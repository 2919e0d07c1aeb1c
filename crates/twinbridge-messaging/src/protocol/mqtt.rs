//! MQTT 3.1.1 binding via `rumqttc`.
//!
//! One shared client per generation: the event-loop pump routes inbound
//! publishes to consumer streams by topic-filter matching and handles
//! resubscription after reconnects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use twinbridge_model::headers::CONTENT_TYPE;
use twinbridge_model::{
    Connection, ConnectionType, ConnectivityError, Headers, Source, ThingId, ThingPlaceholder,
};

use crate::consumer::{ConsumerMessage, StreamAck, WireMessage};
use crate::protocol::{payload_bytes, ProtocolFactory, StreamHandle};
use crate::publisher::{OutboundPublish, PublishHandle, PublishHandleFactory};
use crate::validation::{
    invalid_value, source_description, target_description, validate_payload_mappings,
    validate_source_enforcements_default, validate_uri_scheme, ProtocolValidator,
};

/// Header carrying the topic an inbound MQTT message arrived on.
pub const MQTT_TOPIC_HEADER: &str = "mqtt.topic";

const ACCEPTED_SCHEMES: &[&str] = &["tcp", "ssl"];

// ── Validator ───────────────────────────────────────────────────────

/// Connection validator for MQTT 3.1.1.
#[derive(Debug, Clone, Copy)]
pub struct MqttValidator;

impl ProtocolValidator for MqttValidator {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Mqtt
    }

    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        validate_uri_scheme(connection, ACCEPTED_SCHEMES, "MQTT 3.1.1")?;
        if connection.client_count > 1 {
            return Err(ConnectivityError::config(
                "client count limited to 1 for MQTT 3 connections",
            ));
        }

        for source in &connection.sources {
            let description = source_description(source, connection);
            let Some(qos) = source.qos else {
                return Err(ConnectivityError::config(format!(
                    "MQTT {description} must contain a QoS value"
                )));
            };
            if qos > 2 {
                return Err(invalid_value(&qos.to_string(), "qos", &description));
            }
            if source.header_mapping.is_some() {
                return Err(ConnectivityError::config(
                    "header mapping is not supported for MQTT sources",
                ));
            }
            if source.consumer_count > 1 {
                return Err(ConnectivityError::config(
                    "consumer count limited to 1 for MQTT 3 connections",
                ));
            }
            for address in &source.addresses {
                validate_mqtt_topic(address, true).map_err(|message| {
                    ConnectivityError::config(format!(
                        "the provided topic '{address}' is not valid: {message}"
                    ))
                })?;
            }
            validate_enforcement_filters_as_topics(connection, source)?;
        }
        validate_source_enforcements_default(connection)?;

        for target in &connection.targets {
            let description = target_description(target, connection);
            let Some(qos) = target.qos else {
                return Err(ConnectivityError::config(format!(
                    "MQTT {description} must contain a QoS value"
                )));
            };
            if qos > 2 {
                return Err(invalid_value(&qos.to_string(), "qos", &description));
            }
            if target.header_mapping.is_some() {
                return Err(ConnectivityError::config(
                    "header mapping is not supported for MQTT targets",
                ));
            }
            // wildcards are never allowed on publish targets
            if target.address.contains('+') || target.address.contains('#') {
                return Err(ConnectivityError::config(format!(
                    "the provided topic '{}' is not valid: wildcards are not allowed on targets",
                    target.address
                )));
            }
        }
        validate_payload_mappings(connection)
    }
}

/// Resolves each enforcement filter with a stand-in thing identity and
/// requires the result to be a valid MQTT topic filter.
fn validate_enforcement_filters_as_topics(
    connection: &Connection,
    source: &Source,
) -> Result<(), ConnectivityError> {
    use twinbridge_model::{ExpressionResolver, ResolveMode};

    let Some(enforcement) = &source.enforcement else {
        return Ok(());
    };
    let dummy_thing = ThingId::parse("namespace:name").expect("static id is valid");
    let thing_placeholder = ThingPlaceholder::new(&dummy_thing);
    let resolver = ExpressionResolver::new(vec![&thing_placeholder]);
    for filter in &enforcement.filters {
        let resolved = resolver
            .resolve(filter, ResolveMode::Strict)
            .map_err(|_| {
                invalid_value(filter, "filters", &source_description(source, connection))
            })?;
        validate_mqtt_topic(&resolved, true).map_err(|_| {
            invalid_value(filter, "filters", &source_description(source, connection))
        })?;
    }
    Ok(())
}

/// Checks `topic` against the MQTT topic grammar. `+` must occupy a whole
/// level; `#` must be the final level.
pub fn validate_mqtt_topic(topic: &str, wildcards_allowed: bool) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains('\0') {
        return Err("topic must not contain null characters".to_string());
    }
    let levels: Vec<&str> = topic.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if !wildcards_allowed {
                return Err("wildcards are not allowed here".to_string());
            }
            if *level != "#" || index + 1 != levels.len() {
                return Err("'#' must be the last topic level".to_string());
            }
        }
        if level.contains('+') {
            if !wildcards_allowed {
                return Err("wildcards are not allowed here".to_string());
            }
            if *level != "+" {
                return Err("'+' must occupy a whole topic level".to_string());
            }
        }
    }
    Ok(())
}

/// Maps a numeric QoS to the library level, defaulting to at-most-once.
#[must_use]
pub fn qos_level(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Bounded buffer between the shared event loop and one consumer
/// stream. Overflow evicts the oldest element so the event loop is
/// never blocked by a slow consumer.
struct RouteBuffer {
    queue: Mutex<VecDeque<WireMessage>>,
    capacity: usize,
    data_ready: Notify,
}

impl RouteBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            data_ready: Notify::new(),
        }
    }

    fn push(&self, wire: WireMessage) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                warn!(
                    topic = %wire.address,
                    capacity = self.capacity,
                    "consumer buffer full, oldest inbound message dropped"
                );
            }
            queue.push_back(wire);
        }
        self.data_ready.notify_one();
    }

    fn pop(&self) -> Option<WireMessage> {
        self.queue.lock().pop_front()
    }
}

struct Route {
    filters: Vec<String>,
    qos: QoS,
    buffer: Arc<RouteBuffer>,
}

struct MqttShared {
    client: AsyncClient,
    routes: Arc<Mutex<Vec<Route>>>,
}

/// Protocol factory for MQTT connections.
pub struct MqttFactory {
    shared: Mutex<Option<MqttShared>>,
}

impl MqttFactory {
    /// Creates an unconnected factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(None),
        }
    }
}

impl Default for MqttFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolFactory for MqttFactory {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError> {
        let options = mqtt_options(connection)?;
        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let routes: Arc<Mutex<Vec<Route>>> = Arc::new(Mutex::new(Vec::new()));
        let pump_token = CancellationToken::new();

        let pump_routes = Arc::clone(&routes);
        let pump_client = client.clone();
        let token = pump_token.clone();
        let connection_id = connection.id.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(100);
            let max_backoff = Duration::from_secs(5);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            backoff = Duration::from_millis(100);
                            route_publish(&pump_routes, &publish.topic, &publish.payload);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            backoff = Duration::from_millis(100);
                            resubscribe(&pump_client, &pump_routes).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(connection = %connection_id, error = %e, "mqtt event loop error");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(max_backoff);
                        }
                    }
                }
            }
            debug!(connection = %connection_id, "mqtt pump stopped");
        });

        *self.shared.lock() = Some(MqttShared {
            client: client.clone(),
            routes,
        });

        Ok(Box::new(MqttHandleFactory { client, pump_token }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_consumer_stream(
        &self,
        connection: &Connection,
        source: &Source,
        consumer_index: usize,
        buffer_size: usize,
        inbox: mpsc::Sender<ConsumerMessage>,
        acks: mpsc::Receiver<StreamAck>,
        kill_switch: CancellationToken,
    ) -> Result<StreamHandle, ConnectivityError> {
        let qos = qos_level(source.qos.unwrap_or(0));
        let buffer = Arc::new(RouteBuffer::new(buffer_size.max(1)));
        let client = {
            let guard = self.shared.lock();
            let shared = guard.as_ref().ok_or_else(|| {
                ConnectivityError::config("mqtt factory is not connected")
            })?;
            shared.routes.lock().push(Route {
                filters: source.addresses.clone(),
                qos,
                buffer: Arc::clone(&buffer),
            });
            shared.client.clone()
        };
        for address in &source.addresses {
            client
                .subscribe(address.clone(), qos)
                .await
                .map_err(|e| {
                    ConnectivityError::config(format!(
                        "failed to subscribe to '{address}': {e}"
                    ))
                })?;
        }
        info!(
            connection = %connection.id,
            source = source.index,
            consumer = consumer_index,
            addresses = ?source.addresses,
            "mqtt subscriptions initialized"
        );

        let join = tokio::spawn(pump_stream(inbox, buffer, kill_switch, acks));
        Ok(StreamHandle { join })
    }
}

/// Stream pump implementing the started/ack protocol with one consumer.
async fn pump_stream(
    inbox: mpsc::Sender<ConsumerMessage>,
    buffer: Arc<RouteBuffer>,
    kill_switch: CancellationToken,
    mut acks: mpsc::Receiver<StreamAck>,
) {
    if inbox.send(ConsumerMessage::StreamStarted).await.is_err() {
        return;
    }
    if acks.recv().await.is_none() {
        return;
    }

    'outer: loop {
        while let Some(wire) = buffer.pop() {
            if inbox.send(ConsumerMessage::Message(wire)).await.is_err() {
                break 'outer;
            }
            if acks.recv().await.is_none() {
                break 'outer;
            }
        }
        tokio::select! {
            () = kill_switch.cancelled() => break,
            () = buffer.data_ready.notified() => {}
        }
    }
}

fn route_publish(routes: &Arc<Mutex<Vec<Route>>>, topic: &str, payload: &[u8]) {
    let matching: Vec<Arc<RouteBuffer>> = routes
        .lock()
        .iter()
        .filter(|route| {
            route
                .filters
                .iter()
                .any(|filter| topic_matches_filter(filter, topic))
        })
        .map(|route| Arc::clone(&route.buffer))
        .collect();

    for buffer in matching {
        buffer.push(WireMessage {
            address: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            headers: Headers::new().with(MQTT_TOPIC_HEADER, topic),
        });
    }
}

async fn resubscribe(client: &AsyncClient, routes: &Arc<Mutex<Vec<Route>>>) {
    let filters: Vec<(String, QoS)> = routes
        .lock()
        .iter()
        .flat_map(|route| {
            route
                .filters
                .iter()
                .map(|filter| (filter.clone(), route.qos))
                .collect::<Vec<_>>()
        })
        .collect();
    for (filter, qos) in filters {
        if let Err(e) = client.subscribe(filter.clone(), qos).await {
            warn!(filter = %filter, error = %e, "mqtt resubscribe failed");
        }
    }
}

fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn mqtt_options(connection: &Connection) -> Result<MqttOptions, ConnectivityError> {
    let url = Url::parse(&connection.uri).map_err(|e| {
        ConnectivityError::config(format!("invalid broker URI '{}': {e}", connection.uri))
    })?;
    let host = url.host_str().ok_or_else(|| {
        ConnectivityError::config(format!("broker URI '{}' has no host", connection.uri))
    })?;
    let port = url.port().unwrap_or(match url.scheme() {
        "ssl" => 8883,
        _ => 1883,
    });

    let client_id = format!("{}-{}", connection.id, Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    if url.scheme() == "ssl" {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

// ── Publishing ──────────────────────────────────────────────────────

struct MqttHandleFactory {
    client: AsyncClient,
    pump_token: CancellationToken,
}

impl Drop for MqttHandleFactory {
    fn drop(&mut self) {
        // the generation is gone; stop the shared event loop
        self.pump_token.cancel();
    }
}

#[async_trait]
impl PublishHandleFactory for MqttHandleFactory {
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError> {
        validate_mqtt_topic(address, false)
            .map_err(|message| ConnectivityError::config(format!(
                "invalid publish topic '{address}': {message}"
            )))?;
        Ok(Box::new(MqttPublishHandle {
            client: self.client.clone(),
            topic: address.to_string(),
        }))
    }
}

struct MqttPublishHandle {
    client: AsyncClient,
    topic: String,
}

#[async_trait]
impl PublishHandle for MqttPublishHandle {
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError> {
        let payload = payload_bytes(&publish.message);
        debug!(
            topic = %self.topic,
            bytes = payload.len(),
            content_type = publish.message.headers.get(CONTENT_TYPE),
            "publishing mqtt message"
        );
        self.client
            .publish(self.topic.clone(), qos_level(publish.qos), false, payload)
            .await
            .map_err(|e| ConnectivityError::mapping(format!("mqtt publish failed: {e}")))
    }
}
