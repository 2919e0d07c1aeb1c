//! Protocol bindings: thin adapters between the broker client libraries
//! and the generic consumer/publisher workers.
//!
//! A binding contains no mapping or enforcement logic; it subscribes
//! library streams, pumps wire messages into consumer inboxes honoring the
//! acknowledgement protocol, and exposes publish handles.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use twinbridge_model::{Connection, ConnectionType, ConnectivityError, Source};

use crate::consumer::{ConsumerMessage, StreamAck};
use crate::publisher::PublishHandleFactory;

/// AMQP 0.9.1 binding (lapin)
pub mod amqp091;

/// AMQP 1.0 binding (fe2o3-amqp)
pub mod amqp10;

/// HTTP push binding (reqwest)
pub mod http_push;

/// Kafka binding (rdkafka)
pub mod kafka;

/// MQTT 3.1.1 binding (rumqttc)
pub mod mqtt;

/// A running consumer stream of one generation.
pub struct StreamHandle {
    /// Completes when the stream pump has terminated.
    pub join: JoinHandle<()>,
}

/// Per-protocol runtime pieces created for one connection generation.
///
/// `connect` is called once per generation, before the publisher starts;
/// `open_consumer_stream` once per source and consumer index after the
/// publisher reported ready. Returning `Ok` from `open_consumer_stream`
/// is the per-stream success report the client state machine waits for.
#[async_trait]
pub trait ProtocolFactory: Send + Sync + 'static {
    /// Connects the underlying protocol client and returns the factory
    /// the publisher worker creates its handles from.
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError>;

    /// Opens one consumer stream for `source`, feeding `inbox` and
    /// reading one [`StreamAck`] per delivered element from `acks`. The
    /// stream must terminate promptly once `kill_switch` is cancelled.
    ///
    /// `buffer_size` bounds whatever buffering the binding puts between
    /// the library stream and the acknowledgement-paced pump; bindings
    /// whose library already paces deliveries may ignore it.
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
    ) -> Result<StreamHandle, ConnectivityError>;
}

/// Serializes an external message payload for a byte-oriented library
/// sink; text payloads are sent as their UTF-8 encoding.
#[must_use]
pub(crate) fn payload_bytes(message: &twinbridge_model::ExternalMessage) -> Vec<u8> {
    if let Some(bytes) = message.byte_payload() {
        bytes.to_vec()
    } else if let Some(text) = message.text_payload() {
        text.as_bytes().to_vec()
    } else {
        Vec::new()
    }
}

/// The protocol factory for a connection type.
#[must_use]
pub fn protocol_factory(connection_type: ConnectionType) -> Box<dyn ProtocolFactory> {
    match connection_type {
        ConnectionType::Amqp091 => Box::new(amqp091::Amqp091Factory::new()),
        ConnectionType::Amqp10 => Box::new(amqp10::Amqp10Factory::new()),
        ConnectionType::Mqtt => Box::new(mqtt::MqttFactory::new()),
        ConnectionType::Kafka => Box::new(kafka::KafkaFactory::new()),
        ConnectionType::HttpPush => Box::new(http_push::HttpPushFactory::new()),
    }
}
