//! HTTP push binding via `reqwest`: outbound-only webhooks.

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use twinbridge_model::{Connection, ConnectionType, ConnectivityError, Source};

use crate::consumer::{ConsumerMessage, StreamAck};
use crate::protocol::{payload_bytes, ProtocolFactory, StreamHandle};
use crate::publisher::{OutboundPublish, PublishHandle, PublishHandleFactory};
use crate::validation::{validate_payload_mappings, validate_uri_scheme, ProtocolValidator};

const ACCEPTED_SCHEMES: &[&str] = &["http", "https"];

// ── Validator ───────────────────────────────────────────────────────

/// Connection validator for HTTP push.
#[derive(Debug, Clone, Copy)]
pub struct HttpPushValidator;

impl ProtocolValidator for HttpPushValidator {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::HttpPush
    }

    fn validate(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        validate_uri_scheme(connection, ACCEPTED_SCHEMES, "HTTP push")?;
        if !connection.sources.is_empty() {
            return Err(ConnectivityError::config(
                "HTTP push connections do not support sources",
            ));
        }
        for target in &connection.targets {
            if !target.address.starts_with('/') {
                return Err(ConnectivityError::config(format!(
                    "HTTP push target address '{}' must be an absolute path",
                    target.address
                )));
            }
        }
        validate_payload_mappings(connection)
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Protocol factory for HTTP push connections.
pub struct HttpPushFactory;

impl HttpPushFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpPushFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolFactory for HttpPushFactory {
    async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<Box<dyn PublishHandleFactory>, ConnectivityError> {
        let base = Url::parse(&connection.uri).map_err(|e| {
            ConnectivityError::config(format!("invalid base URI '{}': {e}", connection.uri))
        })?;
        let client = Client::builder().build().map_err(|e| {
            ConnectivityError::config(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Box::new(HttpPushHandleFactory { client, base }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_consumer_stream(
        &self,
        _connection: &Connection,
        _source: &Source,
        _consumer_index: usize,
        _buffer_size: usize,
        _inbox: mpsc::Sender<ConsumerMessage>,
        _acks: mpsc::Receiver<StreamAck>,
        _kill_switch: CancellationToken,
    ) -> Result<StreamHandle, ConnectivityError> {
        // the validator rejects sources; reaching this is a programming error
        Err(ConnectivityError::config(
            "HTTP push connections cannot consume",
        ))
    }
}

// ── Publishing ──────────────────────────────────────────────────────

struct HttpPushHandleFactory {
    client: Client,
    base: Url,
}

#[async_trait]
impl PublishHandleFactory for HttpPushHandleFactory {
    async fn create_handle(
        &self,
        address: &str,
    ) -> Result<Box<dyn PublishHandle>, ConnectivityError> {
        let url = self.base.join(address).map_err(|e| {
            ConnectivityError::config(format!("invalid target path '{address}': {e}"))
        })?;
        Ok(Box::new(HttpPushHandle {
            client: self.client.clone(),
            url,
        }))
    }
}

struct HttpPushHandle {
    client: Client,
    url: Url,
}

#[async_trait]
impl PublishHandle for HttpPushHandle {
    async fn publish(&self, publish: &OutboundPublish) -> Result<(), ConnectivityError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .body(payload_bytes(&publish.message));
        for (key, value) in publish.message.headers.iter() {
            request = request.header(key, value);
        }

        debug!(url = %self.url, "pushing message over HTTP");
        let response = request
            .send()
            .await
            .map_err(|e| ConnectivityError::mapping(format!("HTTP push failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ConnectivityError::mapping(format!(
                "HTTP push to '{}' answered {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}
