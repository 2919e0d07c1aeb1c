//! # Twinbridge Messaging
//!
//! The per-connection runtime of the connectivity layer: a client state
//! machine supervising consumer and publisher workers around a message
//! mapping processor, with per-protocol bindings for AMQP 0.9.1,
//! AMQP 1.0, MQTT 3.1.1, Kafka and HTTP push.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Exponential backoff
pub mod backoff;

/// Client state machine
pub mod client;

/// Runtime configuration
pub mod config;

/// Consumer workers
pub mod consumer;

/// Message mapping processor
pub mod processor;

/// Protocol bindings
pub mod protocol;

/// Publisher worker
pub mod publisher;

/// Connection validation
pub mod validation;

pub use backoff::RetryBackoff;
pub use client::{spawn_client, ClientCommand, ClientHandle, ClientState, ClientStatus};
pub use config::{BackoffConfig, ConnectivityConfig};
pub use consumer::{
    spawn_consumer, AddressStatus, ConsumerConfig, ConsumerHandle, ConsumerMessage, StreamAck,
    WireMessage,
};
pub use processor::{
    spawn_processor, targets_for_signal, InboundResult, MessageMappingProcessor,
    ProcessorCommand, ProcessorHandle,
};
pub use protocol::{protocol_factory, ProtocolFactory, StreamHandle};
pub use publisher::{
    spawn_publisher, MappedOutbound, OutboundPublish, PublishHandle, PublishHandleFactory,
    PublisherCommand, PublisherHandle, PublisherStatus,
};
pub use validation::{validator_for, ProtocolValidator};
