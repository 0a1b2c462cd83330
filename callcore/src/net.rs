//! Network ports implemented by transport and HTTP adapters.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::signaling::{InboundSignal, OutboundSignal};

/// An event produced by the signaling transport, in socket order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// The connection dropped and was re-established. Signaling state held
    /// by the server may have been lost in between.
    Reconnected,
    /// The connection was lost.
    Disconnected { reason: String },
    /// A decoded signaling event.
    Signal(InboundSignal),
}

/// A persistent, authenticated signaling channel.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Fire-and-forget send. Fails with [`TransportError::NotConnected`]
    /// while the socket is down.
    async fn emit(&self, signal: OutboundSignal) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>)>;
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A simple structure for the HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
