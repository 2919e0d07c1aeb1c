//! # Twinbridge Connectivity Model
//!
//! Domain model shared by the connectivity runtime: connection
//! configuration, thing identifiers, the twin-protocol envelope, the
//! placeholder engine, and identity enforcement.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Authorization subjects and contexts
pub mod auth;

/// Connection configuration model
pub mod connection;

/// Identity enforcement filters
pub mod enforcement;

/// Twin-protocol envelopes and topic paths
pub mod envelope;

/// Error taxonomy for connectivity operations
pub mod error;

/// External (wire-side) messages
pub mod external;

/// Message headers
pub mod headers;

/// Placeholder templates and resolution
pub mod placeholder;

/// Internal signals mapped from and to envelopes
pub mod signal;

/// Thing identifiers
pub mod things;

pub use auth::{AuthorizationContext, AuthorizationSubject};
pub use connection::{
    Connection, ConnectionId, ConnectionStatus, ConnectionType, Enforcement, HeaderMapping,
    MappingContext, Source, SubscribedTopic, Target,
};
pub use enforcement::{EnforcementFilter, EnforcementFilterFactory, FilterMatching};
pub use envelope::{Channel, Criterion, Envelope, TopicPath};
pub use error::ConnectivityError;
pub use external::{ExternalMessage, ExternalMessageBuilder, Payload};
pub use headers::Headers;
pub use placeholder::{
    contains_placeholder, ExpressionResolver, HeadersPlaceholder, Placeholder, ResolveMode,
    SourceAddressPlaceholder, ThingPlaceholder, TopicPathPlaceholder,
};
pub use signal::{OutboundSignal, Signal, SignalKind};
pub use things::ThingId;

/// Content type of twin-protocol envelopes on the wire.
pub const TWIN_PROTOCOL_CONTENT_TYPE: &str = "application/vnd.eclipse.ditto+json";
