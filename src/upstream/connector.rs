//! # Upstream Connector
//!
//! Owns the outbound WebSocket from one relay session to the realtime speech
//! service. Each connector runs as its own tokio task; the session talks to it
//! only through channels:
//!
//! - **`UpstreamHandle`** (held by the session): queue outbound JSON, read the
//!   connector state, request close
//! - **`mpsc::Receiver<InboundEvent>`** (attached to the session actor): every
//!   upstream event, in arrival order
//!
//! ## State Machine:
//! ```text
//! Dialing ──► Open ──► Configured ──► Closed
//!    │          │           │
//!    └──────────┴───────────┴──────► Error
//! ```
//! - **Dialing**: TCP/TLS connect and HTTP upgrade with the bearer credential
//! - **Open**: transport is up; waiting per `HandshakePolicy` before the
//!   `session.update` event may be sent
//! - **Configured**: `session.update` sent, audio and control flow freely
//! - **Closed / Error**: terminal, every send returns `ConnectorClosed`

use crate::audio::codec::parse_upstream_event;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ControlEvent, SessionConfiguration};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::sync::Once;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the connector needs to dial and configure one session.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: String,
    pub api_key: String,
    pub protocol_header: String,
    pub protocol_version: String,
    pub handshake: HandshakePolicy,
    pub session: SessionConfiguration,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
}

/// How long the connector stays in `Open` before sending `session.update`.
///
/// The service is unreliable when configured the instant the upgrade
/// completes, so the wait is an explicit state rather than a sleep in the
/// open handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePolicy {
    /// Wait a fixed time after the transport opens
    Delay(Duration),
    /// Wait for the service's `session.created` event, failing after the timeout
    Acknowledge(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Dialing,
    Open,
    Configured,
    Closed,
    Error,
}

impl ConnectorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectorState::Closed | ConnectorState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Dialing => "dialing",
            ConnectorState::Open => "open",
            ConnectorState::Configured => "configured",
            ConnectorState::Closed => "closed",
            ConnectorState::Error => "error",
        }
    }
}

/// Everything the connector reports back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Handshake finished; the connector is `Configured`
    Ready,
    /// An upstream event the relay understands
    Event(ControlEvent),
    /// The upstream closed the connection
    Closed { reason: Option<String> },
    /// The connection failed (handshake rejected, transport error, ...)
    Failed(RelayError),
}

/// Outcome of a send that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the connector task
    Queued,
    /// The connector is not `Configured` yet; the message was discarded
    DroppedNotReady,
    /// The outbound queue is full; the message was discarded
    DroppedBackpressure,
}

/// The session's side of an upstream connection.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct UpstreamHandle {
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectorState>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl UpstreamHandle {
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    pub fn send_event(&self, event: &ControlEvent) -> RelayResult<Delivery> {
        let text = serde_json::to_string(event)?;
        self.send_text(text)
    }

    /// Queue an already-serialized JSON message.
    ///
    /// Never waits: outbound traffic is dropped rather than buffered whenever
    /// the connector is not ready or its queue is full.
    pub fn send_text(&self, text: String) -> RelayResult<Delivery> {
        if self.close_tx.is_none() {
            return Err(RelayError::ConnectorClosed);
        }

        match self.state() {
            ConnectorState::Configured => match self.outbound.try_send(text) {
                Ok(()) => Ok(Delivery::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(Delivery::DroppedBackpressure),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::ConnectorClosed),
            },
            ConnectorState::Dialing | ConnectorState::Open => Ok(Delivery::DroppedNotReady),
            ConnectorState::Closed | ConnectorState::Error => Err(RelayError::ConnectorClosed),
        }
    }

    /// Ask the connector to close. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.state.clone()
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Test double: a handle wired to channels the test controls instead of a task.
#[cfg(test)]
pub(crate) struct DetachedUpstream {
    pub outbound: mpsc::Receiver<String>,
    pub state: watch::Sender<ConnectorState>,
    pub close: oneshot::Receiver<()>,
}

#[cfg(test)]
impl UpstreamHandle {
    pub(crate) fn detached(capacity: usize) -> (Self, DetachedUpstream) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectorState::Dialing);
        let (close_tx, close_rx) = oneshot::channel();

        let handle = Self {
            outbound: outbound_tx,
            state: state_rx,
            close_tx: Some(close_tx),
        };
        let upstream = DetachedUpstream {
            outbound: outbound_rx,
            state: state_tx,
            close: close_rx,
        };
        (handle, upstream)
    }
}

/// Installs rustls' ring provider as the process default, once.
///
/// `wss://` dials panic inside `connect_async` when no process-level
/// `CryptoProvider` can be determined.
pub fn install_crypto_provider() {
    static INIT_CRYPTO: Once = Once::new();
    INIT_CRYPTO.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("A rustls crypto provider was already installed");
        }
    });
}

/// Spawns connector tasks.
pub struct UpstreamConnector;

impl UpstreamConnector {
    /// Start dialing in the background and return immediately.
    ///
    /// The handle starts in `Dialing`; progress arrives on the returned
    /// receiver (`Ready` once configured, `Failed`/`Closed` when it ends).
    pub fn connect(settings: UpstreamSettings, session_id: Uuid) -> (UpstreamHandle, mpsc::Receiver<InboundEvent>) {
        install_crypto_provider();

        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectorState::Dialing);
        let (close_tx, close_rx) = oneshot::channel();

        let task = ConnectorTask {
            settings,
            state: state_tx,
            inbound: inbound_tx,
            outbound: outbound_rx,
            close: close_rx,
        };
        tokio::spawn(task.run().instrument(tracing::info_span!("upstream", %session_id)));

        let handle = UpstreamHandle {
            outbound: outbound_tx,
            state: state_rx,
            close_tx: Some(close_tx),
        };
        (handle, inbound_rx)
    }
}

/// Why the connector task stopped.
enum Stop {
    /// The session asked for it (or went away)
    Local,
    /// The upstream closed the connection
    Remote(Option<String>),
    Failed(RelayError),
}

impl From<RelayError> for Stop {
    fn from(err: RelayError) -> Self {
        Stop::Failed(err)
    }
}

struct ConnectorTask {
    settings: UpstreamSettings,
    state: watch::Sender<ConnectorState>,
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Receiver<String>,
    close: oneshot::Receiver<()>,
}

impl ConnectorTask {
    async fn run(mut self) {
        let stop = match self.drive().await {
            Ok(never) => match never {},
            Err(stop) => stop,
        };

        match stop {
            Stop::Local => {
                self.set_state(ConnectorState::Closed);
                info!("Upstream connection closed by session");
            }
            Stop::Remote(reason) => {
                self.set_state(ConnectorState::Closed);
                info!("Upstream closed the connection: {}", reason.as_deref().unwrap_or("no reason given"));
                let _ = self.inbound.send(InboundEvent::Closed { reason }).await;
            }
            Stop::Failed(err) => {
                self.set_state(ConnectorState::Error);
                warn!("Upstream connection failed: {}", err);
                let _ = self.inbound.send(InboundEvent::Failed(err)).await;
            }
        }
    }

    /// Terminal states are final.
    fn set_state(&self, next: ConnectorState) {
        let previous = *self.state.borrow();
        if previous == next || previous.is_terminal() {
            return;
        }
        self.state.send_replace(next);
        debug!("Upstream state {} -> {}", previous.as_str(), next.as_str());
    }

    /// Runs until something stops the connection; only ever returns `Err`.
    async fn drive(&mut self) -> Result<Infallible, Stop> {
        let request = build_request(&self.settings)?;

        let socket: UpstreamSocket = tokio::select! {
            result = connect_async(request) => result.map_err(classify_connect_error)?.0,
            _ = &mut self.close => return Err(Stop::Local),
        };

        self.set_state(ConnectorState::Open);
        let (mut sink, mut stream) = socket.split();

        if let Err(stop) = self.await_handshake(&mut stream).await {
            if matches!(stop, Stop::Local) {
                let _ = sink.send(Message::Close(None)).await;
            }
            return Err(stop);
        }

        let configure = ControlEvent::SessionUpdate {
            session: self.settings.session.clone(),
        };
        let text = serde_json::to_string(&configure).map_err(RelayError::from)?;
        sink.send(Message::Text(text)).await.map_err(connection_error)?;

        self.set_state(ConnectorState::Configured);
        info!("Upstream session configured");
        self.deliver(InboundEvent::Ready).await?;

        self.pump(&mut sink, &mut stream).await
    }

    /// The `Open` state: deliver whatever arrives while waiting for the policy
    /// to allow configuration.
    async fn await_handshake(&mut self, stream: &mut SplitStream<UpstreamSocket>) -> Result<(), Stop> {
        let (wait, needs_ack) = match self.settings.handshake {
            HandshakePolicy::Delay(delay) => (delay, false),
            HandshakePolicy::Acknowledge(timeout) => (timeout, true),
        };

        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if needs_ack {
                        return Err(Stop::Failed(RelayError::Handshake(format!(
                            "no session.created from upstream within {}ms",
                            wait.as_millis()
                        ))));
                    }
                    return Ok(());
                }
                _ = &mut self.close => return Err(Stop::Local),
                message = stream.next() => {
                    match self.read_event(message)? {
                        Some(ControlEvent::Error { error }) => {
                            return Err(Stop::Failed(RelayError::Handshake(error.to_string())));
                        }
                        Some(event) => {
                            let acknowledged = matches!(event, ControlEvent::SessionCreated { .. });
                            self.deliver(InboundEvent::Event(event)).await?;
                            if needs_ack && acknowledged {
                                return Ok(());
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// The `Configured` state: shuttle traffic both ways until something stops.
    async fn pump(
        &mut self,
        sink: &mut SplitSink<UpstreamSocket, Message>,
        stream: &mut SplitStream<UpstreamSocket>,
    ) -> Result<Infallible, Stop> {
        loop {
            tokio::select! {
                _ = &mut self.close => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(Stop::Local);
                }
                Some(text) = self.outbound.recv() => {
                    sink.send(Message::Text(text)).await.map_err(connection_error)?;
                }
                message = stream.next() => {
                    if let Some(event) = self.read_event(message)? {
                        self.deliver(InboundEvent::Event(event)).await?;
                    }
                }
            }
        }
    }

    /// Turn one transport message into an event (or nothing).
    fn read_event(&self, message: Option<Result<Message, WsError>>) -> Result<Option<ControlEvent>, Stop> {
        match message {
            None => Err(Stop::Remote(None)),
            Some(Err(err)) => Err(Stop::Failed(connection_error(err))),
            Some(Ok(Message::Text(text))) => match parse_upstream_event(&text) {
                Ok(event) => Ok(event),
                Err(err) => {
                    warn!("Dropping upstream message: {}", err);
                    Ok(None)
                }
            },
            Some(Ok(Message::Close(frame))) => {
                Err(Stop::Remote(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason))))
            }
            Some(Ok(Message::Binary(data))) => {
                debug!("Ignoring {} bytes of binary data from upstream", data.len());
                Ok(None)
            }
            Some(Ok(_)) => Ok(None),
        }
    }

    /// Hand an event to the session, giving up if the session closes first.
    async fn deliver(&mut self, event: InboundEvent) -> Result<(), Stop> {
        tokio::select! {
            sent = self.inbound.send(event) => sent.map_err(|_| Stop::Local),
            _ = &mut self.close => Err(Stop::Local),
        }
    }
}

fn build_request(settings: &UpstreamSettings) -> RelayResult<Request> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::Connection(format!("invalid upstream URL: {}", e)))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
        .map_err(|_| RelayError::Handshake("API key is not a valid header value".to_string()))?;
    let version_name = HeaderName::from_bytes(settings.protocol_header.as_bytes())
        .map_err(|_| RelayError::Handshake(format!("invalid header name {:?}", settings.protocol_header)))?;
    let version_value = HeaderValue::from_str(&settings.protocol_version)
        .map_err(|_| RelayError::Handshake(format!("invalid header value {:?}", settings.protocol_version)))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(version_name, version_value);

    Ok(request)
}

/// A refused upgrade is the service talking (bad key, unknown model); anything
/// else is the network.
fn classify_connect_error(err: WsError) -> RelayError {
    match &err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                RelayError::Handshake(format!("upstream rejected the credential ({})", status))
            } else {
                RelayError::Handshake(format!("upstream refused the upgrade ({})", status))
            }
        }
        _ => RelayError::Connection(err.to_string()),
    }
}

fn connection_error(err: WsError) -> RelayError {
    RelayError::Connection(err.to_string())
}
