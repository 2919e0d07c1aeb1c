//! AMQP 0.9.1 binding via `lapin`.
//!
//! Sources consume from queues; targets publish to `exchange/routingKey`
//! addresses (or the default exchange for bare addresses).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use twinbridge_model::headers::{CONTENT_TYPE, CORRELATION_ID, REPLY_TO};
use twinbridge_model::{
    Connection, ConnectionType, ConnectivityError, Headers, HeadersPlaceholder, Source,
};

use crate::consumer::{ConsumerMessage, StreamAck, WireMessage};
use crate::protocol::{payload_bytes, ProtocolFactory, StreamHandle};
use crate::publisher::{OutboundPublish, PublishHandle, PublishHandleFactory};
use crate::validation::{
    validate_payload_mappings, validate_source_enforcements, validate_uri_scheme,
    ProtocolValidator,
};

const ACCEPTED_SCHEMES: &[&str] = &["amqp", "amqps"];

// ── Validator ───────────────────────────────────────────────────────

/// Connection validator for AMQP 0.9.1.
#[derive(Debug, Clone, Copy)]
pub struct Amqp091Validator;

impl ProtocolValidator for Amqp091Validator {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Amqp091
    }

    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        validate_uri_scheme(connection, ACCEPTED_SCHEMES, "AMQP 0.9.1")?;
        // enforcement inputs come from message headers on this protocol
        let dummy_headers = Headers::new();
        let headers_placeholder = HeadersPlaceholder::new(&dummy_headers);
        validate_source_enforcements(connection, &headers_placeholder)?;
        validate_payload_mappings(connection)
    }
}

/// Splits an AMQP 0.9.1 target address into exchange and routing key.
/// Bare addresses publish to the default exchange.
#[must_use]
pub fn split_target_address(address: &str) -> (&str, &str) {
    match address.split_once('/') {
        Some((exchange, routing_key)) => (exchange, routing_key),
        None => ("", address),
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Protocol factory for AMQP 0.9.1 connections.
pub struct Amqp091Factory {
    connection: Arc<Mutex<Option<lapin::Connection>>>,
}

impl Amqp091Factory {
    /// Creates an unconnected factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for Amqp091Factory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolFactory for Amqp091Factory {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError> {
        let amqp_connection =
            lapin::Connection::connect(&connection.uri, ConnectionProperties::default())
                .await
                .map_err(|e| {
                    ConnectivityError::config(format!(
                        "failed to connect to '{}': {e}",
                        connection.uri
                    ))
                })?;
        let publish_channel = amqp_connection.create_channel().await.map_err(|e| {
            ConnectivityError::config(format!("failed to create publish channel: {e}"))
        })?;
        *self.connection.lock().await = Some(amqp_connection);
        info!(connection = %connection.id, "amqp 0.9.1 connection established");

        Ok(Box::new(Amqp091HandleFactory {
            channel: publish_channel,
        }))
    }

    // deliveries are paced by prefetch and the ack protocol
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
        let channel = {
            let guard = self.connection.lock().await;
            let amqp_connection = guard.as_ref().ok_or_else(|| {
                ConnectivityError::config("amqp 0.9.1 factory is not connected")
            })?;
            amqp_connection.create_channel().await.map_err(|e| {
                ConnectivityError::config(format!("failed to create consumer channel: {e}"))
            })?
        };
        channel
            .basic_qos(10, BasicQosOptions::default())
            .await
            .map_err(|e| ConnectivityError::config(format!("failed to set prefetch: {e}")))?;

        let mut consumers = Vec::new();
        for address in &source.addresses {
            let tag = format!(
                "twinbridge-{}-{}-{}-{}",
                connection.id,
                source.index,
                consumer_index,
                Uuid::new_v4()
            );
            let consumer = channel
                .basic_consume(
                    address,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    ConnectivityError::config(format!(
                        "failed to consume from '{address}': {e}"
                    ))
                })?;
            consumers.push((address.clone(), consumer));
        }
        info!(
            connection = %connection.id,
            source = source.index,
            consumer = consumer_index,
            addresses = ?source.addresses,
            "amqp 0.9.1 consumers registered"
        );

        let connection_id = connection.id.clone();
        let join = tokio::spawn(async move {
            if inbox.send(ConsumerMessage::StreamStarted).await.is_err() {
                return;
            }
            if acks.recv().await.is_none() {
                return;
            }

            let (wire_tx, mut wire_rx) = mpsc::channel::<(WireMessage, lapin::message::Delivery)>(16);
            let mut pumps = Vec::new();
            for (address, mut consumer) in consumers {
                let wire_tx = wire_tx.clone();
                let token = kill_switch.clone();
                let connection_id = connection_id.clone();
                pumps.push(tokio::spawn(async move {
                    loop {
                        let delivery = tokio::select! {
                            () = token.cancelled() => break,
                            delivery = consumer.next() => delivery,
                        };
                        match delivery {
                            Some(Ok(delivery)) => {
                                let wire = WireMessage {
                                    address: address.clone(),
                                    payload: Bytes::copy_from_slice(&delivery.data),
                                    headers: properties_to_headers(&delivery.properties),
                                };
                                if wire_tx.send((wire, delivery)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(
                                    connection = %connection_id,
                                    address = %address,
                                    error = %e,
                                    "amqp 0.9.1 consumer error"
                                );
                            }
                            None => break,
                        }
                    }
                }));
            }
            drop(wire_tx);

            while let Some((wire, delivery)) = wire_rx.recv().await {
                if inbox.send(ConsumerMessage::Message(wire)).await.is_err() {
                    break;
                }
                if acks.recv().await.is_none() {
                    break;
                }
                // settle with the broker only after the consumer worker
                // acknowledged the element
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(error = %e, "amqp 0.9.1 ack failed");
                }
            }
            for pump in pumps {
                pump.abort();
                let _ = pump.await;
            }
            let _ = inbox.send(ConsumerMessage::StreamEnded).await;
        });
        Ok(StreamHandle { join })
    }
}

fn properties_to_headers(properties: &BasicProperties) -> Headers {
    let mut headers = Headers::new();
    if let Some(content_type) = properties.content_type() {
        headers.insert(CONTENT_TYPE, content_type.as_str());
    }
    if let Some(correlation_id) = properties.correlation_id() {
        headers.insert(CORRELATION_ID, correlation_id.as_str());
    }
    if let Some(reply_to) = properties.reply_to() {
        headers.insert(REPLY_TO, reply_to.as_str());
    }
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                headers.insert(key.as_str(), value.to_string());
            }
        }
    }
    headers
}

// ── Publishing ──────────────────────────────────────────────────────

struct Amqp091HandleFactory {
    channel: Channel,
}

#[async_trait]
impl PublishHandleFactory for Amqp091HandleFactory {
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError> {
        let (exchange, routing_key) = split_target_address(address);
        Ok(Box::new(Amqp091PublishHandle {
            channel: self.channel.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }))
    }
}

struct Amqp091PublishHandle {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

#[async_trait]
impl PublishHandle for Amqp091PublishHandle {
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError> {
        let payload = payload_bytes(&publish.message);

        let mut table = FieldTable::default();
        for (key, value) in publish.message.headers.iter() {
            table.insert(
                ShortString::from(key.to_string()),
                AMQPValue::LongString(value.to_string().into()),
            );
        }
        let mut properties = BasicProperties::default().with_headers(table);
        if let Some(content_type) = publish.message.headers.content_type() {
            properties = properties.with_content_type(ShortString::from(content_type.to_string()));
        }
        if let Some(correlation_id) = publish.message.headers.correlation_id() {
            properties =
                properties.with_correlation_id(ShortString::from(correlation_id.to_string()));
        }

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "publishing amqp 0.9.1 message"
        );
        self.channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| ConnectivityError::mapping(format!("amqp 0.9.1 publish failed: {e}")))?
            .await
            .map(|_| ())
            .map_err(|e| ConnectivityError::mapping(format!("amqp 0.9.1 confirm failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target_address() {
        assert_eq!(split_target_address("queue"), ("", "queue"));
        assert_eq!(
            split_target_address("twin.events/things"),
            ("twin.events", "things")
        );
    }
}
