//! The publisher worker: keeps one publish handle per resolved address,
//! publishes mapped messages and recreates handles with exponential
//! backoff after closure reports.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use twinbridge_model::{ConnectionId, ConnectivityError, ExternalMessage, Target};

use crate::backoff::RetryBackoff;
use crate::config::BackoffConfig;

/// A live handle publishing to one resolved address.
#[async_trait]
pub trait PublishHandle: Send + Sync {
    /// Publishes one message.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error when the library rejects the send.
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError>;
}

/// Creates publish handles; creation is serialized per address by the
/// worker, so implementations need no internal locking for that.
#[async_trait]
pub trait PublishHandleFactory: Send + Sync + 'static {
    /// Creates the handle for a resolved address.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error when the library cannot attach.
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError>;
}

/// One message on its way to a publish handle.
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    /// The mapped wire message.
    pub message: ExternalMessage,
    /// Resolved publish address.
    pub address: String,
    /// Quality of service for protocols that support it.
    pub qos: u8,
}

/// A mapped outbound message paired with its resolved target; `target` is
/// `None` for responses routed by `reply-to`.
#[derive(Debug, Clone)]
pub struct MappedOutbound {
    /// The resolved target, if the message was routed by configuration.
    pub target: Option<Target>,
    /// The mapped wire message.
    pub message: ExternalMessage,
}

// for targets the default is qos 0
const DEFAULT_TARGET_QOS: u8 = 0;

/// Commands accepted by the publisher worker.
#[derive(Debug)]
pub enum PublisherCommand {
    /// Publish a mapped message.
    Publish(MappedOutbound),
    /// The library reported the handle for `address` closed or failed.
    HandleClosed {
        /// The affected resolved address.
        address: String,
    },
    /// Internal: the backoff for `address` elapsed, recreate the handle.
    RecreateHandle {
        /// The affected resolved address.
        address: String,
    },
    /// Reply with the worker status; doubles as the readiness probe.
    RetrieveStatus(oneshot::Sender<PublisherStatus>),
}

/// Aggregated publisher state for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherStatus {
    /// Addresses with a live handle.
    pub open_addresses: Vec<String>,
    /// Addresses currently in backoff.
    pub backing_off_addresses: Vec<String>,
    /// Messages published since start.
    pub published: u64,
    /// Messages dropped or failed since start.
    pub failed: u64,
}

/// Running publisher worker, addressed through its command channel.
pub struct PublisherHandle {
    /// Command inbox of the worker.
    pub tx: mpsc::Sender<PublisherCommand>,
    /// Join handle of the worker task.
    pub join: JoinHandle<()>,
}

/// Spawns the publisher worker for one connection generation.
#[must_use]
pub fn spawn_publisher(
    connection_id: ConnectionId,
    factory: Box<dyn PublishHandleFactory>,
    backoff: BackoffConfig,
    dry_run: bool,
) -> PublisherHandle {
    let (tx, rx) = mpsc::channel(64);
    let worker = PublisherWorker {
        connection_id,
        factory,
        backoff_config: backoff,
        dry_run,
        handles: HashMap::new(),
        rx,
        // weak so that dropping the public sender stops the worker even
        // while a backoff timer is pending
        self_tx: tx.downgrade(),
        published: 0,
        failed: 0,
    };
    let join = tokio::spawn(worker.run());
    PublisherHandle { tx, join }
}

enum SlotState {
    Open(Box<dyn PublishHandle>),
    BackingOff,
    Closed,
}

struct HandleSlot {
    state: SlotState,
    backoff: RetryBackoff,
}

struct PublisherWorker {
    connection_id: ConnectionId,
    factory: Box<dyn PublishHandleFactory>,
    backoff_config: BackoffConfig,
    dry_run: bool,
    handles: HashMap<String, HandleSlot>,
    rx: mpsc::Receiver<PublisherCommand>,
    self_tx: mpsc::WeakSender<PublisherCommand>,
    published: u64,
    failed: u64,
}

impl PublisherWorker {
    async fn run(mut self) {
        info!(connection = %self.connection_id, "publisher started");
        while let Some(command) = self.rx.recv().await {
            match command {
                PublisherCommand::Publish(outbound) => self.handle_publish(outbound).await,
                PublisherCommand::HandleClosed { address } => self.handle_closed(&address),
                PublisherCommand::RecreateHandle { address } => {
                    self.recreate_handle(&address).await;
                }
                PublisherCommand::RetrieveStatus(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
        info!(connection = %self.connection_id, "publisher stopped");
    }

    async fn handle_publish(&mut self, outbound: MappedOutbound) {
        if self.dry_run {
            debug!(connection = %self.connection_id, "message dropped in dry-run mode");
            return;
        }

        let Some((address, qos)) = resolve_destination(&outbound) else {
            warn!(
                connection = %self.connection_id,
                "response without reply-to header dropped"
            );
            self.failed += 1;
            return;
        };

        let slot = self
            .handles
            .entry(address.clone())
            .or_insert_with(|| HandleSlot {
                state: SlotState::Closed,
                backoff: RetryBackoff::new(self.backoff_config.clone()),
            });

        if matches!(slot.state, SlotState::BackingOff) {
            warn!(
                connection = %self.connection_id,
                address = %address,
                "handle in backoff, message dropped"
            );
            self.failed += 1;
            return;
        }

        if matches!(slot.state, SlotState::Closed) {
            match self.factory.create_handle(&address).await {
                Ok(handle) => {
                    let slot = self.handles.get_mut(&address).expect("slot just inserted");
                    slot.state = SlotState::Open(handle);
                }
                Err(e) => {
                    warn!(
                        connection = %self.connection_id,
                        address = %address,
                        error = %e,
                        "handle creation failed"
                    );
                    self.failed += 1;
                    self.handle_closed(&address);
                    return;
                }
            }
        }

        let slot = self.handles.get_mut(&address).expect("slot exists");
        let SlotState::Open(handle) = &slot.state else {
            return;
        };
        let publish = OutboundPublish {
            message: outbound.message,
            address: address.clone(),
            qos,
        };
        match handle.publish(&publish).await {
            Ok(()) => {
                self.published += 1;
                slot.backoff.reset();
                debug!(
                    connection = %self.connection_id,
                    address = %address,
                    "message published"
                );
            }
            Err(e) => {
                warn!(
                    connection = %self.connection_id,
                    address = %address,
                    error = %e,
                    "publish failed"
                );
                self.failed += 1;
                self.handle_closed(&address);
            }
        }
    }

    /// Enters backoff for `address` unless one is already running; further
    /// closure reports during the backoff are dropped.
    fn handle_closed(&mut self, address: &str) {
        let slot = self
            .handles
            .entry(address.to_string())
            .or_insert_with(|| HandleSlot {
                state: SlotState::Closed,
                backoff: RetryBackoff::new(self.backoff_config.clone()),
            });

        if matches!(slot.state, SlotState::BackingOff) {
            debug!(
                connection = %self.connection_id,
                address = %address,
                "closure report during backoff ignored"
            );
            return;
        }

        slot.state = SlotState::BackingOff;
        let delay = slot.backoff.next_backoff();
        info!(
            connection = %self.connection_id,
            address = %address,
            delay_ms = delay.as_millis(),
            "handle closed, scheduling recreation"
        );

        let self_tx = self.self_tx.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(PublisherCommand::RecreateHandle { address }).await;
            }
        });
    }

    async fn recreate_handle(&mut self, address: &str) {
        let Some(slot) = self.handles.get_mut(address) else {
            return;
        };
        if !matches!(slot.state, SlotState::BackingOff) {
            return;
        }
        slot.state = SlotState::Closed;

        match self.factory.create_handle(address).await {
            Ok(handle) => {
                let slot = self.handles.get_mut(address).expect("slot exists");
                slot.state = SlotState::Open(handle);
                info!(
                    connection = %self.connection_id,
                    address = %address,
                    "handle recreated after backoff"
                );
            }
            Err(e) => {
                warn!(
                    connection = %self.connection_id,
                    address = %address,
                    error = %e,
                    "handle recreation failed"
                );
                self.handle_closed(address);
            }
        }
    }

    fn status(&self) -> PublisherStatus {
        let mut open_addresses = Vec::new();
        let mut backing_off_addresses = Vec::new();
        for (address, slot) in &self.handles {
            match slot.state {
                SlotState::Open(_) => open_addresses.push(address.clone()),
                SlotState::BackingOff => backing_off_addresses.push(address.clone()),
                SlotState::Closed => {}
            }
        }
        open_addresses.sort();
        backing_off_addresses.sort();
        PublisherStatus {
            open_addresses,
            backing_off_addresses,
            published: self.published,
            failed: self.failed,
        }
    }
}

fn resolve_destination(outbound: &MappedOutbound) -> Option<(String, u8)> {
    match &outbound.target {
        Some(target) => Some((
            target.address.clone(),
            target.qos.unwrap_or(DEFAULT_TARGET_QOS),
        )),
        None => outbound
            .message
            .headers
            .reply_to()
            .map(|reply_to| (reply_to.to_string(), DEFAULT_TARGET_QOS)),
    }
}
