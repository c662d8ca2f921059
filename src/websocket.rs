//! # Device WebSocket Handler
//!
//! One actor per connected device. The actor owns the session's `SessionRelay`
//! and is the only place that touches the device socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the device connects to the configured path (default `/`)
//! 2. **Upstream**: the actor starts the upstream connector as soon as it runs
//! 3. **Audio Streaming**: binary frames carry PCM16 mono at the device rate
//! 4. **Playback**: the device receives PCM (or WAV chunks) and an end-of-turn marker
//! 5. **Teardown**: either side closing closes the other
//!
//! ## Message Format:
//! - **Device → Relay**: binary PCM audio, or JSON control messages
//!   (`input_audio_buffer.commit`, `input_audio_buffer.clear`, `response.create`)
//! - **Relay → Device**: binary audio, plus a zero-length frame or a
//!   `{"type":"response.audio.done"}` text frame at the end of each turn

use crate::config::EndOfTurnMarker;
use crate::error::{AppError, AppResult, RelayError};
use crate::relay::{CloseCause, DeviceAction, RelaySettings, SessionRelay};
use crate::state::AppState;
use crate::upstream::{InboundEvent, UpstreamConnector, UpstreamSettings};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor bridging one device connection to its relay session.
pub struct DeviceSocket {
    session_id: Uuid,

    /// Present once the actor has started and dialed upstream
    relay: Option<SessionRelay>,

    /// Consumed by `started()`
    pending: Option<(UpstreamSettings, RelaySettings)>,

    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl DeviceSocket {
    pub fn new(state: &AppState) -> Self {
        let config = state.config();
        Self {
            session_id: Uuid::new_v4(),
            relay: None,
            pending: Some((config.upstream_settings(), RelaySettings::from(config))),
            heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.server.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    /// Any frame from the device counts as liveness.
    fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.client_timeout
    }

    fn on_binary(&mut self, data: &[u8]) {
        self.touch();
        if let Some(relay) = self.relay.as_mut() {
            relay.on_device_audio(data);
        }
    }

    fn on_text(&mut self, text: &str) {
        self.touch();
        if let Some(relay) = self.relay.as_mut() {
            relay.on_device_text(text);
        }
    }

    fn apply(&mut self, actions: Vec<DeviceAction>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                DeviceAction::Audio(bytes) => ctx.binary(bytes),
                DeviceAction::EndOfTurn(marker) => match marker {
                    EndOfTurnMarker::EmptyFrame => ctx.binary(Vec::<u8>::new()),
                    EndOfTurnMarker::Text => ctx.text(end_of_turn_text()),
                },
                DeviceAction::Close(cause) => {
                    ctx.close(Some(close_reason(&cause)));
                    ctx.stop();
                }
            }
        }
    }
}

/// Stands in for the terminal event when the connector's channel closes
/// without one (the connector task died).
fn stream_ended_event() -> InboundEvent {
    InboundEvent::Failed(RelayError::Connection("upstream connector stopped unexpectedly".to_string()))
}

fn end_of_turn_text() -> String {
    json!({ "type": "response.audio.done" }).to_string()
}

/// Close frame sent to the device when the upstream leg ends.
fn close_reason(cause: &CloseCause) -> ws::CloseReason {
    let code = match cause {
        CloseCause::UpstreamClosed(_) => ws::CloseCode::Normal,
        CloseCause::Failed(_) => ws::CloseCode::Error,
    };
    ws::CloseReason {
        code,
        description: Some(cause.describe()),
    }
}

impl Actor for DeviceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Device connected");

        if let Some((upstream, settings)) = self.pending.take() {
            let (handle, inbound) = UpstreamConnector::connect(upstream, self.session_id);
            self.relay = Some(SessionRelay::new(self.session_id, settings, handle));
            ctx.add_stream(ReceiverStream::new(inbound));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.is_timed_out(Instant::now()) {
                warn!(session_id = %act.session_id, "Device heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(relay) = self.relay.as_mut() {
            relay.on_device_closed();
        }
    }
}

/// Frames from the device.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DeviceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.on_binary(&data),
            Ok(ws::Message::Text(text)) => self.on_text(&text),
            Ok(ws::Message::Ping(data)) => {
                self.touch();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => self.touch(),
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "Device closed connection: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, "Device protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the upstream connector.
impl StreamHandler<InboundEvent> for DeviceSocket {
    fn handle(&mut self, event: InboundEvent, ctx: &mut Self::Context) {
        let actions = match self.relay.as_mut() {
            Some(relay) => relay.on_upstream(event),
            None => return,
        };
        self.apply(actions, ctx);
    }

    /// The connector always sends `Closed` or `Failed` before its channel
    /// closes; after either, the relay ignores this.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Upstream event stream ended");
        <Self as StreamHandler<InboundEvent>>::handle(self, stream_ended_event(), ctx);
    }
}

/// WebSocket endpoint for devices.
///
/// ## HTTP to WebSocket Upgrade:
/// The upgrade is validated by `ws::start`; the upstream is only dialed once the
/// actor is running, so a rejected upgrade never opens an upstream connection.
pub async fn device_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    debug!("Device connection request from {:?}", req.connection_info().peer_addr());

    ws::start(DeviceSocket::new(&state), &req, stream)
        .map_err(|e| AppError::BadRequest(format!("WebSocket upgrade failed: {}", e)))
}
