//! The consumer worker: turns wire messages delivered by a protocol
//! stream into annotated [`ExternalMessage`]s and hands them to the
//! mapping processor, acknowledging every stream element.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use twinbridge_model::{
    AuthorizationContext, ConnectionId, ConnectivityError, EnforcementFilterFactory,
    ExternalMessage, HeaderMapping, Headers,
};

use crate::processor::ProcessorCommand;

/// One message as delivered by the protocol library.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// The wire-level address (topic, queue) the element arrived on.
    pub address: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Headers the protocol binding extracted.
    pub headers: Headers,
}

/// Acknowledgement returned to the stream pump for every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAck;

/// Messages accepted by a consumer worker.
#[derive(Debug)]
pub enum ConsumerMessage {
    /// The upstream stream attached; acknowledged like an element.
    StreamStarted,
    /// One wire message.
    Message(WireMessage),
    /// The upstream stream completed; the worker waits for shutdown.
    StreamEnded,
    /// Reply with the per-address status.
    RetrieveAddressStatus(oneshot::Sender<AddressStatus>),
}

/// Aggregated per-source status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    /// The configured source address.
    pub address: String,
    /// Elements successfully handed to the processor.
    pub consumed: u64,
    /// Elements that failed to build.
    pub failed: u64,
}

/// Static configuration of one consumer worker.
pub struct ConsumerConfig {
    /// Connection the consumer belongs to.
    pub connection_id: ConnectionId,
    /// Configured source address (joined, for logging and status).
    pub source_address: String,
    /// Authorization context attached to inbound messages.
    pub authorization_context: AuthorizationContext,
    /// Enforcement filter factory, if the source configures enforcement.
    pub enforcement: Option<EnforcementFilterFactory>,
    /// Payload-mapper aliases of the source.
    pub payload_mapping: Vec<String>,
    /// Inbound header mapping of the source.
    pub header_mapping: Option<HeaderMapping>,
    /// Whether to silently discard everything (connection test mode).
    pub dry_run: bool,
}

/// Running consumer worker.
pub struct ConsumerHandle {
    /// Inbox of the worker; protocol pumps send stream events here.
    pub tx: mpsc::Sender<ConsumerMessage>,
    /// Acknowledgement stream read by the protocol pump.
    pub ack_rx: mpsc::Receiver<StreamAck>,
    /// Join handle of the worker task.
    pub join: JoinHandle<()>,
}

/// Spawns a consumer worker feeding `processor_tx`.
///
/// The inbox is bounded by `buffer_size`; a slow processor back-pressures
/// the protocol pump through the acknowledgement protocol.
#[must_use]
pub fn spawn_consumer(
    config: ConsumerConfig,
    processor_tx: mpsc::Sender<ProcessorCommand>,
    buffer_size: usize,
) -> ConsumerHandle {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let (ack_tx, ack_rx) = mpsc::channel(buffer_size.max(1));
    let worker = ConsumerWorker {
        config,
        processor_tx,
        rx,
        ack_tx,
        consumed: 0,
        failed: 0,
    };
    let join = tokio::spawn(worker.run());
    ConsumerHandle { tx, ack_rx, join }
}

struct ConsumerWorker {
    config: ConsumerConfig,
    processor_tx: mpsc::Sender<ProcessorCommand>,
    rx: mpsc::Receiver<ConsumerMessage>,
    ack_tx: mpsc::Sender<StreamAck>,
    consumed: u64,
    failed: u64,
}

impl ConsumerWorker {
    async fn run(mut self) {
        debug!(
            connection = %self.config.connection_id,
            address = %self.config.source_address,
            "consumer started"
        );
        while let Some(message) = self.rx.recv().await {
            match message {
                ConsumerMessage::StreamStarted => self.ack().await,
                ConsumerMessage::Message(wire) => self.handle_message(wire).await,
                ConsumerMessage::StreamEnded => {
                    info!(
                        connection = %self.config.connection_id,
                        address = %self.config.source_address,
                        "underlying stream completed, waiting for shutdown"
                    );
                }
                ConsumerMessage::RetrieveAddressStatus(reply) => {
                    let _ = reply.send(AddressStatus {
                        address: self.config.source_address.clone(),
                        consumed: self.consumed,
                        failed: self.failed,
                    });
                }
            }
        }
        debug!(
            connection = %self.config.connection_id,
            address = %self.config.source_address,
            "consumer stopped"
        );
    }

    async fn handle_message(&mut self, wire: WireMessage) {
        if self.config.dry_run {
            debug!(
                connection = %self.config.connection_id,
                address = %wire.address,
                "message dropped in dry-run mode"
            );
            self.ack().await;
            return;
        }

        match self.build_external(&wire) {
            Ok(external) => {
                self.consumed += 1;
                if self
                    .processor_tx
                    .send(ProcessorCommand::InboundMessage(external))
                    .await
                    .is_err()
                {
                    debug!(
                        connection = %self.config.connection_id,
                        "processor gone, dropping message"
                    );
                }
            }
            Err(e) => {
                // Failures never tear the stream down; report and move on.
                self.failed += 1;
                warn!(
                    connection = %self.config.connection_id,
                    address = %wire.address,
                    error = %e,
                    "failed to build inbound message"
                );
            }
        }
        self.ack().await;
    }

    fn build_external(&self, wire: &WireMessage) -> Result<ExternalMessage, ConnectivityError> {
        let enforcement = self
            .config
            .enforcement
            .as_ref()
            .map(|factory| factory.filter_for_address(&wire.address))
            .transpose()?;

        let mut builder = ExternalMessage::builder(wire.headers.clone())
            .with_source_address(wire.address.clone())
            .with_authorization_context(self.config.authorization_context.clone())
            .with_enforcement(enforcement)
            .with_payload_mapping(self.config.payload_mapping.clone())
            .with_header_mapping(self.config.header_mapping.clone());

        builder = match std::str::from_utf8(&wire.payload) {
            Ok(text) => builder.with_text_and_bytes(text, wire.payload.clone()),
            Err(_) => builder.with_bytes(wire.payload.clone()),
        };
        Ok(builder.build())
    }

    async fn ack(&self) {
        // The pump may have terminated before the final ack.
        let _ = self.ack_tx.send(StreamAck).await;
    }
}
