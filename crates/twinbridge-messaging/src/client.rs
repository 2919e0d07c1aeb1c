//! The client state machine: the per-connection supervisor coordinating
//! factory creation, publisher startup, consumer startup, steady-state
//! operation, reconnection, test mode and teardown.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twinbridge_mapping::MapperRegistry;
use twinbridge_model::{
    Connection, ConnectionType, ConnectivityError, EnforcementFilterFactory, OutboundSignal,
    Signal,
};

use crate::backoff::RetryBackoff;
use crate::config::ConnectivityConfig;
use crate::consumer::{
    spawn_consumer, AddressStatus, ConsumerConfig, ConsumerMessage,
};
use crate::processor::{
    spawn_processor, targets_for_signal, MessageMappingProcessor, ProcessorCommand,
    ProcessorHandle,
};
use crate::protocol::{ProtocolFactory, StreamHandle};
use crate::publisher::{
    spawn_publisher, PublisherCommand, PublisherHandle, PublisherStatus,
};
use crate::validation::validator_for;

/// States of the per-connection client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No generation exists.
    Disconnected,
    /// A generation is being established.
    Connecting,
    /// Publisher and all consumers are running.
    Connected,
    /// The generation is being torn down.
    Disconnecting,
    /// A dry-run generation exists for a connection test.
    Testing,
}

/// Commands accepted by the client.
#[derive(Debug)]
pub enum ClientCommand {
    /// Establish a generation.
    OpenConnection,
    /// Tear the current generation down.
    CloseConnection,
    /// Establish a dry-run generation, report, and tear it down again.
    TestConnection(oneshot::Sender<Result<String, ConnectivityError>>),
    /// Reply with the aggregated status.
    RetrieveStatus(oneshot::Sender<ClientStatus>),
    /// Route an outbound signal from the internal bus.
    DispatchSignal(Signal),
}

/// Aggregated per-connection status.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Current state of the state machine.
    pub state: ClientState,
    /// Publisher status, when a generation exists.
    pub publisher: Option<PublisherStatus>,
    /// Per-consumer address statuses, when a generation exists.
    pub sources: Vec<AddressStatus>,
}

/// Handle to a running client worker.
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
    join: JoinHandle<()>,
}

impl ClientHandle {
    /// Requests connection establishment.
    pub async fn open(&self) {
        let _ = self.tx.send(ClientCommand::OpenConnection).await;
    }

    /// Requests teardown.
    pub async fn close(&self) {
        let _ = self.tx.send(ClientCommand::CloseConnection).await;
    }

    /// Runs a connection test and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the validation or connection error the test produced.
    pub async fn test(&self) -> Result<String, ConnectivityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(ClientCommand::TestConnection(reply_tx)).await;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ConnectivityError::config("client worker terminated")))
    }

    /// Queries the aggregated status.
    pub async fn retrieve_status(&self) -> Option<ClientStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(ClientCommand::RetrieveStatus(reply_tx)).await;
        reply_rx.await.ok()
    }

    /// Routes an outbound signal into the connection.
    pub async fn dispatch(&self, signal: Signal) {
        let _ = self.tx.send(ClientCommand::DispatchSignal(signal)).await;
    }

    /// Stops the worker by closing its inbox and awaits termination.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

/// Spawns the client worker for `connection`. Inbound signals are emitted
/// on `bus_tx`.
#[must_use]
pub fn spawn_client(
    connection: Connection,
    config: ConnectivityConfig,
    factory: Box<dyn ProtocolFactory>,
    bus_tx: mpsc::Sender<Signal>,
) -> ClientHandle {
    let (tx, rx) = mpsc::channel(16);
    let reconnect = RetryBackoff::new(config.backoff.clone());
    let worker = ClientWorker {
        connection,
        config,
        factory,
        bus_tx,
        state: ClientState::Disconnected,
        generation: None,
        reconnect,
        rx,
        // weak so that dropping the handle stops the worker even while a
        // reconnect timer is pending
        self_tx: tx.downgrade(),
    };
    let join = tokio::spawn(worker.run());
    ClientHandle { tx, join }
}

struct ConsumerRef {
    tx: mpsc::Sender<ConsumerMessage>,
    join: JoinHandle<()>,
}

/// Everything belonging to one connected generation. A new generation
/// gets a fresh kill switch; reconnection never mutates a generation in
/// place.
struct Generation {
    kill_switch: CancellationToken,
    publisher: PublisherHandle,
    processor: ProcessorHandle,
    consumers: Vec<ConsumerRef>,
    streams: Vec<StreamHandle>,
}

struct ClientWorker {
    connection: Connection,
    config: ConnectivityConfig,
    factory: Box<dyn ProtocolFactory>,
    bus_tx: mpsc::Sender<Signal>,
    state: ClientState,
    generation: Option<Generation>,
    reconnect: RetryBackoff,
    rx: mpsc::Receiver<ClientCommand>,
    self_tx: mpsc::WeakSender<ClientCommand>,
}

impl ClientWorker {
    async fn run(mut self) {
        info!(connection = %self.connection.id, "client started");
        while let Some(command) = self.rx.recv().await {
            match command {
                ClientCommand::OpenConnection => self.handle_open().await,
                ClientCommand::CloseConnection => self.handle_close().await,
                ClientCommand::TestConnection(reply) => self.handle_test(reply).await,
                ClientCommand::RetrieveStatus(reply) => self.handle_status(reply).await,
                ClientCommand::DispatchSignal(signal) => self.handle_dispatch(signal).await,
            }
        }
        // Inbox closed: tear down whatever generation is left.
        if let Some(generation) = self.generation.take() {
            teardown(generation, self.config.stream_termination_timeout).await;
        }
        info!(connection = %self.connection.id, "client stopped");
    }

    async fn handle_open(&mut self) {
        if self.state != ClientState::Disconnected {
            debug!(
                connection = %self.connection.id,
                state = ?self.state,
                "open ignored in current state"
            );
            return;
        }
        self.state = ClientState::Connecting;
        match self.connect(false).await {
            Ok(generation) => {
                self.generation = Some(generation);
                self.state = ClientState::Connected;
                self.reconnect.reset();
                info!(connection = %self.connection.id, "connected");
            }
            Err(e) => {
                warn!(connection = %self.connection.id, error = %e, "connection failed");
                self.state = ClientState::Disconnected;
                if self.connection.failover_enabled {
                    let delay = self.reconnect.next_backoff();
                    info!(
                        connection = %self.connection.id,
                        delay_ms = delay.as_millis(),
                        "scheduling reconnect"
                    );
                    let self_tx = self.self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(tx) = self_tx.upgrade() {
                            let _ = tx.send(ClientCommand::OpenConnection).await;
                        }
                    });
                }
            }
        }
    }

    async fn handle_close(&mut self) {
        if !matches!(self.state, ClientState::Connected | ClientState::Connecting) {
            debug!(
                connection = %self.connection.id,
                state = ?self.state,
                "close ignored in current state"
            );
            return;
        }
        self.state = ClientState::Disconnecting;
        if let Some(generation) = self.generation.take() {
            teardown(generation, self.config.stream_termination_timeout).await;
        }
        self.state = ClientState::Disconnected;
        info!(connection = %self.connection.id, "disconnected");
    }

    async fn handle_test(
        &mut self,
        reply: oneshot::Sender<Result<String, ConnectivityError>>,
    ) {
        if self.state != ClientState::Disconnected {
            let _ = reply.send(Err(ConnectivityError::config(format!(
                "connection test not possible in state {:?}",
                self.state
            ))));
            return;
        }
        self.state = ClientState::Testing;
        let outcome = match self.connect(true).await {
            Ok(generation) => {
                teardown(generation, self.config.stream_termination_timeout).await;
                Ok(format!(
                    "connection to {} established successfully",
                    self.connection.uri
                ))
            }
            Err(e) => Err(e),
        };
        self.state = ClientState::Disconnected;
        // A pending test future is completed exactly once; if the caller
        // went away the result is dropped.
        let _ = reply.send(outcome);
    }

    async fn handle_status(&mut self, reply: oneshot::Sender<ClientStatus>) {
        let mut status = ClientStatus {
            state: self.state,
            publisher: None,
            sources: Vec::new(),
        };
        if let Some(generation) = &self.generation {
            let (publisher_tx, publisher_rx) = oneshot::channel();
            let _ = generation
                .publisher
                .tx
                .send(PublisherCommand::RetrieveStatus(publisher_tx))
                .await;
            status.publisher = timeout(self.config.publisher_ready_timeout, publisher_rx)
                .await
                .ok()
                .and_then(Result::ok);

            for consumer in &generation.consumers {
                let (consumer_tx, consumer_rx) = oneshot::channel();
                let _ = consumer
                    .tx
                    .send(ConsumerMessage::RetrieveAddressStatus(consumer_tx))
                    .await;
                if let Ok(Ok(address_status)) =
                    timeout(self.config.publisher_ready_timeout, consumer_rx).await
                {
                    status.sources.push(address_status);
                }
            }
        }
        let _ = reply.send(status);
    }

    async fn handle_dispatch(&mut self, signal: Signal) {
        let Some(generation) = &self.generation else {
            debug!(connection = %self.connection.id, "not connected, outbound signal dropped");
            return;
        };
        let targets: Vec<_> = targets_for_signal(&signal, &self.connection.targets)
            .into_iter()
            .cloned()
            .collect();
        if targets.is_empty() && !signal.is_response() {
            debug!(connection = %self.connection.id, "no target subscribed, signal dropped");
            return;
        }
        let _ = generation
            .processor
            .tx
            .send(ProcessorCommand::OutboundSignal(OutboundSignal::new(
                signal, targets,
            )))
            .await;
    }

    /// Establishes a generation: validate, connect the protocol factory,
    /// start the publisher, probe its readiness, start consumers and
    /// their streams.
    async fn connect(&mut self, dry_run: bool) -> Result<Generation, ConnectivityError> {
        let connection = &self.connection;
        validator_for(connection.connection_type).validate(connection)?;

        let registry = MapperRegistry::from_definitions(
            &connection.mapping_definitions,
            self.config.mapper_limits(),
            None,
        )?;

        let handle_factory = self.factory.connect(connection).await?;
        let publisher = spawn_publisher(
            connection.id.clone(),
            handle_factory,
            self.config.backoff.clone(),
            dry_run,
        );

        // Readiness probe; a publisher that cannot answer within the
        // configured window fails the generation.
        let (probe_tx, probe_rx) = oneshot::channel();
        let _ = publisher
            .tx
            .send(PublisherCommand::RetrieveStatus(probe_tx))
            .await;
        if timeout(self.config.publisher_ready_timeout, probe_rx)
            .await
            .is_err()
        {
            publisher.join.abort();
            return Err(ConnectivityError::config(
                "publisher did not become ready in time",
            ));
        }

        let processor = spawn_processor(
            MessageMappingProcessor::new(connection.id.clone(), registry),
            self.bus_tx.clone(),
            publisher.tx.clone(),
        );

        let mut generation = Generation {
            kill_switch: CancellationToken::new(),
            publisher,
            processor,
            consumers: Vec::new(),
            streams: Vec::new(),
        };

        for source in &connection.sources {
            let enforcement = source.enforcement.clone().map(|enforcement| {
                if connection.connection_type == ConnectionType::Mqtt {
                    EnforcementFilterFactory::with_mqtt_matching(enforcement)
                } else {
                    EnforcementFilterFactory::new(enforcement)
                }
            });
            for consumer_index in 0..source.consumer_count {
                debug!(
                    connection = %connection.id,
                    source = source.index,
                    consumer = consumer_index,
                    "starting consumer"
                );
                let consumer = spawn_consumer(
                    ConsumerConfig {
                        connection_id: connection.id.clone(),
                        source_address: source.addresses.join(";"),
                        authorization_context: connection.source_authorization_context(source),
                        enforcement: enforcement.clone(),
                        payload_mapping: source.payload_mapping.clone(),
                        header_mapping: source.header_mapping.clone(),
                        dry_run,
                    },
                    generation.processor.tx.clone(),
                    self.config.source_buffer_size,
                );
                let stream = self
                    .factory
                    .open_consumer_stream(
                        connection,
                        source,
                        consumer_index,
                        self.config.source_buffer_size,
                        consumer.tx.clone(),
                        consumer.ack_rx,
                        generation.kill_switch.clone(),
                    )
                    .await;
                generation.consumers.push(ConsumerRef {
                    tx: consumer.tx,
                    join: consumer.join,
                });
                match stream {
                    Ok(stream) => generation.streams.push(stream),
                    Err(e) => {
                        teardown(generation, self.config.stream_termination_timeout).await;
                        return Err(e);
                    }
                }
            }
        }
        Ok(generation)
    }
}

/// Tears a generation down in order: trip the kill switch, join all
/// stream terminations, then stop consumers, the processor and finally
/// the publisher.
async fn teardown(generation: Generation, termination_timeout: std::time::Duration) {
    let Generation {
        kill_switch,
        publisher,
        processor,
        consumers,
        streams,
    } = generation;

    kill_switch.cancel();
    for stream in streams {
        if timeout(termination_timeout, stream.join).await.is_err() {
            warn!("consumer stream did not terminate in time");
        }
    }

    for consumer in consumers {
        drop(consumer.tx);
        let _ = timeout(termination_timeout, consumer.join).await;
    }

    drop(processor.tx);
    let _ = timeout(termination_timeout, processor.join).await;

    drop(publisher.tx);
    let _ = timeout(termination_timeout, publisher.join).await;
}
