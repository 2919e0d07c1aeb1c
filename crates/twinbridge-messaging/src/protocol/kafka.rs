//! Kafka binding via `rdkafka`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as KafkaHeaders, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use twinbridge_model::{Connection, ConnectionType, ConnectivityError, Headers, Source};

use crate::consumer::{ConsumerMessage, StreamAck, WireMessage};
use crate::protocol::{payload_bytes, ProtocolFactory, StreamHandle};
use crate::publisher::{OutboundPublish, PublishHandle, PublishHandleFactory};
use crate::validation::{
    validate_payload_mappings, validate_source_enforcements_default, validate_uri_scheme,
    ProtocolValidator,
};

const ACCEPTED_SCHEMES: &[&str] = &["tcp", "ssl"];

// ── Validator ───────────────────────────────────────────────────────

/// Connection validator for Kafka.
#[derive(Debug, Clone, Copy)]
pub struct KafkaValidator;

impl ProtocolValidator for KafkaValidator {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Kafka
    }

    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        validate_uri_scheme(connection, ACCEPTED_SCHEMES, "Kafka")?;
        for source in &connection.sources {
            for address in &source.addresses {
                if address.is_empty() {
                    return Err(ConnectivityError::config(
                        "Kafka source addresses must not be empty",
                    ));
                }
            }
        }
        for target in &connection.targets {
            // "topic" or "topic/key"
            let (topic, _key) = split_target_address(&target.address);
            if topic.is_empty() {
                return Err(ConnectivityError::config(format!(
                    "Kafka target address '{}' has no topic",
                    target.address
                )));
            }
        }
        validate_source_enforcements_default(connection)?;
        validate_payload_mappings(connection)
    }
}

/// Splits a Kafka target address into topic and optional message key.
#[must_use]
pub fn split_target_address(address: &str) -> (&str, Option<&str>) {
    match address.split_once('/') {
        Some((topic, key)) if !key.is_empty() => (topic, Some(key)),
        Some((topic, _)) => (topic, None),
        None => (address, None),
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Protocol factory for Kafka connections.
pub struct KafkaFactory;

impl KafkaFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for KafkaFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn client_config(connection: &Connection) -> Result<ClientConfig, ConnectivityError> {
    let url = Url::parse(&connection.uri).map_err(|e| {
        ConnectivityError::config(format!("invalid broker URI '{}': {e}", connection.uri))
    })?;
    let host = url.host_str().ok_or_else(|| {
        ConnectivityError::config(format!("broker URI '{}' has no host", connection.uri))
    })?;
    let port = url.port().unwrap_or(9092);

    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", format!("{host}:{port}"));
    if url.scheme() == "ssl" {
        config.set("security.protocol", "ssl");
    }
    Ok(config)
}

#[async_trait]
impl ProtocolFactory for KafkaFactory {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError> {
        let producer: FutureProducer = client_config(connection)?
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| {
                ConnectivityError::config(format!("failed to create Kafka producer: {e}"))
            })?;
        Ok(Box::new(KafkaHandleFactory { producer }))
    }

    // deliveries are paced by the ack protocol; no extra buffering here
    #[allow(clippy::too_many_arguments)]
    async fn open_consumer_stream(
        &self,
        connection: &Connection,
        source: &Source,
        consumer_index: usize,
        _buffer_size: usize,
        inbox: mpsc::Sender<ConsumerMessage>,
        mut acks: mpsc::Receiver<StreamAck>,
        kill_switch: CancellationToken,
    ) -> Result<StreamHandle, ConnectivityError> {
        let consumer: StreamConsumer = client_config(connection)?
            .set("group.id", format!("{}-{}", connection.id, source.index))
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| {
                ConnectivityError::config(format!("failed to create Kafka consumer: {e}"))
            })?;

        let topics: Vec<&str> = source.addresses.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            ConnectivityError::config(format!("failed to subscribe to {topics:?}: {e}"))
        })?;
        info!(
            connection = %connection.id,
            source = source.index,
            consumer = consumer_index,
            topics = ?source.addresses,
            "kafka subscriptions initialized"
        );

        let connection_id = connection.id.clone();
        let join = tokio::spawn(async move {
            if inbox.send(ConsumerMessage::StreamStarted).await.is_err() {
                return;
            }
            if acks.recv().await.is_none() {
                return;
            }

            loop {
                let message = tokio::select! {
                    biased;
                    () = kill_switch.cancelled() => break,
                    message = consumer.recv() => message,
                };
                match message {
                    Ok(message) => {
                        let payload = message
                            .payload()
                            .map(Bytes::copy_from_slice)
                            .unwrap_or_default();
                        let wire = WireMessage {
                            address: message.topic().to_string(),
                            payload,
                            headers: extract_headers(&message),
                        };
                        if inbox.send(ConsumerMessage::Message(wire)).await.is_err() {
                            break;
                        }
                        if acks.recv().await.is_none() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "kafka consumer error");
                    }
                }
            }
            consumer.unsubscribe();
            let _ = inbox.send(ConsumerMessage::StreamEnded).await;
        });
        Ok(StreamHandle { join })
    }
}

fn extract_headers<M: Message>(message: &M) -> Headers {
    let mut headers = Headers::new();
    if let Some(kafka_headers) = message.headers() {
        for header in kafka_headers.iter() {
            if let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) {
                headers.insert(header.key, value);
            }
        }
    }
    headers
}

// ── Publishing ──────────────────────────────────────────────────────

struct KafkaHandleFactory {
    producer: FutureProducer,
}

#[async_trait]
impl PublishHandleFactory for KafkaHandleFactory {
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError> {
        let (topic, key) = split_target_address(address);
        Ok(Box::new(KafkaPublishHandle {
            producer: self.producer.clone(),
            topic: topic.to_string(),
            key: key.map(str::to_string),
        }))
    }
}

struct KafkaPublishHandle {
    producer: FutureProducer,
    topic: String,
    key: Option<String>,
}

#[async_trait]
impl PublishHandle for KafkaPublishHandle {
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError> {
        let payload = payload_bytes(&publish.message);
        let mut headers = OwnedHeaders::new();
        for (key, value) in publish.message.headers.iter() {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let delivery = match &self.key {
            Some(key) => {
                self.producer
                    .send(
                        FutureRecord::to(&self.topic)
                            .payload(&payload)
                            .key(key)
                            .headers(headers),
                        Duration::from_secs(5),
                    )
                    .await
            }
            None => {
                self.producer
                    .send(
                        FutureRecord::<(), _>::to(&self.topic)
                            .payload(&payload)
                            .headers(headers),
                        Duration::from_secs(5),
                    )
                    .await
            }
        };
        delivery
            .map(|_| ())
            .map_err(|(e, _)| ConnectivityError::mapping(format!("kafka send failed: {e}")))
    }
}
