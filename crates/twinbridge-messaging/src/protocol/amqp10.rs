//! AMQP 1.0 binding via `fe2o3-amqp`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::Session;
use fe2o3_amqp_types::messaging::{
    ApplicationProperties, Body, Data, Message, MessageId, Properties,
};
use fe2o3_amqp_types::primitives::{Binary, SimpleValue, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use twinbridge_model::headers::{CONTENT_TYPE, CORRELATION_ID, REPLY_TO};
use twinbridge_model::{Connection, ConnectionType, ConnectivityError, Headers, Source};

use crate::consumer::{ConsumerMessage, StreamAck, WireMessage};
use crate::protocol::{payload_bytes, ProtocolFactory, StreamHandle};
use crate::publisher::{OutboundPublish, PublishHandle, PublishHandleFactory};
use crate::validation::{
    validate_payload_mappings, validate_source_enforcements_default, validate_uri_scheme,
    ProtocolValidator,
};

const ACCEPTED_SCHEMES: &[&str] = &["amqp", "amqps"];

// ── Validator ───────────────────────────────────────────────────────

/// Connection validator for AMQP 1.0.
#[derive(Debug, Clone, Copy)]
pub struct Amqp10Validator;

impl ProtocolValidator for Amqp10Validator {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Amqp10
    }

    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        validate_uri_scheme(connection, ACCEPTED_SCHEMES, "AMQP 1.0")?;
        for target in &connection.targets {
            // accepted shapes: bare (queue), queue://name, topic://name
            let (kind, name) = parse_target_address(&target.address);
            if name.is_empty() {
                return Err(ConnectivityError::config(format!(
                    "AMQP 1.0 target address '{}' has no {kind} name",
                    target.address
                )));
            }
        }
        validate_source_enforcements_default(connection)?;
        validate_payload_mappings(connection)
    }
}

/// Splits an AMQP 1.0 target address into its kind and link address:
/// bare addresses are queues, `queue://name` and `topic://name` are
/// explicit.
#[must_use]
pub fn parse_target_address(address: &str) -> (&'static str, &str) {
    if let Some(name) = address.strip_prefix("queue://") {
        ("queue", name)
    } else if let Some(name) = address.strip_prefix("topic://") {
        ("topic", name)
    } else {
        ("queue", address)
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Protocol factory for AMQP 1.0 connections.
///
/// The session handle is shared with publish handles behind a mutex;
/// attaching links needs exclusive access to it.
pub struct Amqp10Factory {
    session: Arc<Mutex<Option<SessionHandle<()>>>>,
    connection: Mutex<Option<ConnectionHandle<()>>>,
}

impl Amqp10Factory {
    /// Creates an unconnected factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            connection: Mutex::new(None),
        }
    }
}

impl Default for Amqp10Factory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolFactory for Amqp10Factory {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError> {
        let container_id = format!("twinbridge-{}", connection.id);
        let mut amqp_connection =
            fe2o3_amqp::Connection::open(container_id, connection.uri.as_str())
                .await
                .map_err(|e| {
                    ConnectivityError::config(format!(
                        "failed to open AMQP 1.0 connection to '{}': {e}",
                        connection.uri
                    ))
                })?;
        let session = Session::begin(&mut amqp_connection).await.map_err(|e| {
            ConnectivityError::config(format!("failed to begin AMQP 1.0 session: {e}"))
        })?;

        *self.connection.lock().await = Some(amqp_connection);
        *self.session.lock().await = Some(session);
        info!(connection = %connection.id, "amqp 1.0 session established");

        Ok(Box::new(Amqp10HandleFactory {
            session: Arc::clone(&self.session),
        }))
    }

    // deliveries are credit-based; the link paces the broker
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
        let address = source.addresses.join(";");
        let mut receivers = Vec::new();
        {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or_else(|| {
                ConnectivityError::config("amqp 1.0 factory is not connected")
            })?;
            for source_address in &source.addresses {
                let link_name = format!(
                    "twinbridge-{}-{}-{}-{}",
                    connection.id,
                    source.index,
                    consumer_index,
                    Uuid::new_v4()
                );
                let receiver = Receiver::attach(session, link_name, source_address.as_str())
                    .await
                    .map_err(|e| {
                        ConnectivityError::config(format!(
                            "failed to attach receiver to '{source_address}': {e}"
                        ))
                    })?;
                receivers.push((source_address.clone(), receiver));
            }
        }
        info!(
            connection = %connection.id,
            source = source.index,
            consumer = consumer_index,
            address = %address,
            "amqp 1.0 receivers attached"
        );

        let connection_id = connection.id.clone();
        let join = tokio::spawn(async move {
            if inbox.send(ConsumerMessage::StreamStarted).await.is_err() {
                return;
            }
            if acks.recv().await.is_none() {
                return;
            }

            // One receiver per source address, polled round-robin through
            // a single select loop.
            let (wire_tx, mut wire_rx) = mpsc::channel::<WireMessage>(16);
            let mut pumps = Vec::new();
            for (source_address, mut receiver) in receivers {
                let wire_tx = wire_tx.clone();
                let token = kill_switch.clone();
                let connection_id = connection_id.clone();
                pumps.push(tokio::spawn(async move {
                    loop {
                        let delivery = tokio::select! {
                            () = token.cancelled() => break,
                            delivery = receiver.recv::<Body<Value>>() => delivery,
                        };
                        match delivery {
                            Ok(delivery) => {
                                let wire = WireMessage {
                                    address: source_address.clone(),
                                    payload: delivery_payload(delivery.message()),
                                    headers: delivery_headers(delivery.message()),
                                };
                                if receiver.accept(&delivery).await.is_err() {
                                    break;
                                }
                                if wire_tx.send(wire).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    connection = %connection_id,
                                    address = %source_address,
                                    error = %e,
                                    "amqp 1.0 receiver error"
                                );
                                break;
                            }
                        }
                    }
                    let _ = receiver.close().await;
                }));
            }
            drop(wire_tx);

            while let Some(wire) = wire_rx.recv().await {
                if inbox.send(ConsumerMessage::Message(wire)).await.is_err() {
                    break;
                }
                if acks.recv().await.is_none() {
                    break;
                }
            }
            for pump in pumps {
                let _ = pump.await;
            }
            let _ = inbox.send(ConsumerMessage::StreamEnded).await;
        });
        Ok(StreamHandle { join })
    }
}

struct Amqp10HandleFactory {
    session: Arc<Mutex<Option<SessionHandle<()>>>>,
}

#[async_trait]
impl PublishHandleFactory for Amqp10HandleFactory {
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError> {
        let (_, link_address) = parse_target_address(address);
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| ConnectivityError::config("amqp 1.0 session is gone"))?;
        let link_name = format!("twinbridge-sender-{}", Uuid::new_v4());
        let sender = Sender::attach(session, link_name, link_address)
            .await
            .map_err(|e| {
                ConnectivityError::config(format!(
                    "failed to attach sender to '{address}': {e}"
                ))
            })?;
        Ok(Box::new(Amqp10PublishHandle {
            sender: Mutex::new(sender),
        }))
    }
}

struct Amqp10PublishHandle {
    sender: Mutex<Sender>,
}

#[async_trait]
impl PublishHandle for Amqp10PublishHandle {
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError> {
        let message = build_message(&publish.message);
        let mut sender = self.sender.lock().await;
        debug!(address = %publish.address, "publishing amqp 1.0 message");
        sender
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| ConnectivityError::mapping(format!("amqp 1.0 send failed: {e}")))
    }
}

fn build_message(external: &twinbridge_model::ExternalMessage) -> Message<Data> {
    let mut properties = Properties::default();
    if let Some(content_type) = external.headers.content_type() {
        properties.content_type = Some(content_type.into());
    }
    if let Some(correlation_id) = external.headers.correlation_id() {
        properties.correlation_id = Some(correlation_id.to_string().into());
    }
    if let Some(reply_to) = external.headers.reply_to() {
        properties.reply_to = Some(reply_to.to_string().into());
    }

    let mut application_properties = ApplicationProperties::builder();
    for (key, value) in external.headers.iter() {
        application_properties = application_properties.insert(key.to_string(), value.to_string());
    }

    Message::builder()
        .properties(properties)
        .application_properties(application_properties.build())
        .data(Binary::from(payload_bytes(external)))
        .build()
}

fn delivery_payload(message: &Message<Body<Value>>) -> Bytes {
    match &message.body {
        Body::Data(data) => data
            .iter()
            .next()
            .map(|data| Bytes::copy_from_slice(&data.0))
            .unwrap_or_default(),
        Body::Value(value) => match &value.0 {
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            Value::Binary(b) => Bytes::copy_from_slice(b),
            other => Bytes::from(format!("{other:?}")),
        },
        _ => Bytes::new(),
    }
}

fn delivery_headers(message: &Message<Body<Value>>) -> Headers {
    let mut headers = Headers::new();
    if let Some(properties) = &message.properties {
        if let Some(content_type) = &properties.content_type {
            headers.insert(CONTENT_TYPE, content_type.to_string());
        }
        if let Some(MessageId::String(correlation_id)) = &properties.correlation_id {
            headers.insert(CORRELATION_ID, correlation_id.clone());
        }
        if let Some(reply_to) = &properties.reply_to {
            headers.insert(REPLY_TO, reply_to.to_string());
        }
    }
    if let Some(application_properties) = &message.application_properties {
        for (key, value) in &application_properties.0 {
            if let SimpleValue::String(value) = value {
                headers.insert(key.clone(), value.clone());
            }
        }
    }
    headers
}
