//! Tokio WebSocket signaling transport for peercall.
//!
//! Frames are JSON text messages of the form `{"event": ..., "data": ...}`.
//! The connection is authenticated with the user's bearer token and is
//! re-established automatically after a drop; the engine is told about both
//! the drop and the reconnect so it can end a call whose signaling state
//! may be stale.

use async_trait::async_trait;
use callcore::error::{SignalingError, TransportError};
use callcore::net::{SignalingTransport, TransportEvent, TransportFactory};
use callcore::signaling::{InboundSignal, OutboundSignal};
use callcore::types::LocalIdentity;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Backoff used after the socket drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (zero-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Connection state shared between the transport handle and its reader.
struct Shared {
    sink: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

/// WebSocket signaling transport.
pub struct WebSocketSignalingTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl SignalingTransport for WebSocketSignalingTransport {
    async fn emit(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let frame = signal
            .to_frame()
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let mut sink_guard = self.shared.sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("--> {} ({} bytes)", signal.event_name(), frame.len());
        sink.send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.shared.sink.lock().await.take()
            && let Err(e) = sink.close().await
        {
            debug!("Error closing websocket: {e}");
        }
    }
}

/// Dials the signaling endpoint with the user's credentials.
#[derive(Clone)]
struct Connector {
    url: String,
    identity: LocalIdentity,
}

impl Connector {
    fn request(&self) -> anyhow::Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&self.identity.bearer())?);
        Ok(request)
    }

    async fn dial(&self) -> anyhow::Result<RawWs> {
        let (ws, _response) = connect_async(self.request()?)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;
        Ok(ws)
    }
}

/// Factory for authenticated WebSocket signaling transports.
pub struct WebSocketSignalingFactory {
    connector: Connector,
    policy: ReconnectPolicy,
}

impl WebSocketSignalingFactory {
    pub fn new(url: impl Into<String>, identity: LocalIdentity) -> Self {
        Self {
            connector: Connector {
                url: url.into(),
                identity,
            },
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl TransportFactory for WebSocketSignalingFactory {
    async fn create_transport(
        &self,
    ) -> anyhow::Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>)> {
        info!("Dialing {}", self.connector.url);
        let (sink, stream) = self.connector.dial().await?.split();

        let shared = Arc::new(Shared {
            sink: Mutex::new(Some(sink)),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = event_tx.send(TransportEvent::Connected).await;

        tokio::task::spawn(supervise(
            shared.clone(),
            stream,
            event_tx,
            self.connector.clone(),
            self.policy,
        ));

        let transport: Arc<dyn SignalingTransport> = Arc::new(WebSocketSignalingTransport { shared });
        Ok((transport, event_rx))
    }
}

/// Pumps the socket and redials after every drop until the transport is
/// closed, the engine goes away, or the reconnect budget runs out.
async fn supervise(
    shared: Arc<Shared>,
    mut stream: WsStream,
    event_tx: mpsc::Sender<TransportEvent>,
    connector: Connector,
    policy: ReconnectPolicy,
) {
    loop {
        let reason = read_pump(&mut stream, &event_tx).await;
        shared.connected.store(false, Ordering::SeqCst);
        shared.sink.lock().await.take();

        if shared.closing.load(Ordering::SeqCst) || event_tx.is_closed() {
            break;
        }
        warn!("Signaling connection lost: {reason}");
        if event_tx
            .send(TransportEvent::Disconnected { reason })
            .await
            .is_err()
        {
            break;
        }

        let Some(ws) = redial(&connector, policy, &shared).await else {
            break;
        };
        let (sink, new_stream) = ws.split();
        *shared.sink.lock().await = Some(sink);
        shared.connected.store(true, Ordering::SeqCst);
        stream = new_stream;
        info!("Signaling connection re-established");
        if event_tx.send(TransportEvent::Reconnected).await.is_err() {
            break;
        }
    }
    trace!("Signaling supervisor exiting");
}

async fn redial(connector: &Connector, policy: ReconnectPolicy, shared: &Shared) -> Option<RawWs> {
    for attempt in 0..policy.max_attempts {
        tokio::time::sleep(policy.delay_for(attempt)).await;
        if shared.closing.load(Ordering::SeqCst) {
            return None;
        }
        match connector.dial().await {
            Ok(ws) => return Some(ws),
            Err(e) => warn!(
                "Reconnect attempt {}/{} failed: {e}",
                attempt + 1,
                policy.max_attempts
            ),
        }
    }
    error!(
        "Giving up on signaling after {} reconnect attempts",
        policy.max_attempts
    );
    None
}

/// Forwards decoded signals until the socket ends. Returns why it ended.
async fn read_pump(stream: &mut WsStream, event_tx: &mpsc::Sender<TransportEvent>) -> String {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let Some(signal) = decode(text.as_str()) else {
                    continue;
                };
                if event_tx.send(TransportEvent::Signal(signal)).await.is_err() {
                    return "event receiver dropped".to_string();
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame");
                return frame
                    .map(|f| format!("closed by server: {}", f.reason.as_str()))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(Message::Binary(data))) => {
                debug!("Ignoring {} byte binary frame", data.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                return e.to_string();
            }
            None => return "stream ended".to_string(),
        }
    }
}

fn decode(text: &str) -> Option<InboundSignal> {
    match InboundSignal::from_frame(text) {
        Ok(signal) => {
            debug!("<-- {} ({} bytes)", signal.kind(), text.len());
            Some(signal)
        }
        Err(SignalingError::UnknownEvent(event)) => {
            debug!("Ignoring unhandled event '{event}'");
            None
        }
        Err(e) => {
            warn!("Dropping malformed signaling frame: {e}");
            None
        }
    }
}
