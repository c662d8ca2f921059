//! # Relay Session
//!
//! The routing rules and lifecycle of one device ↔ upstream pairing. This type
//! knows nothing about actix or sockets: the device side is represented by the
//! `DeviceAction`s it returns, the upstream side by an `UpstreamHandle`.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: device connected, upstream still dialing/configuring
//! 2. **Active**: upstream configured, audio flows both ways
//! 3. **Closing**: one side ended (or failed); the other is being released
//! 4. **Closed**: both connections released, every further input is ignored
//!
//! ## Routing Rules:
//! - Device binary → resample to the upstream rate → `input_audio_buffer.append`
//!   (dropped unless **Active**)
//! - Device text → forwarded verbatim if whitelisted, otherwise dropped
//! - `response.audio.delta` → PCM (optionally resampled, optionally WAV-wrapped) to the device
//! - `response.audio.done` → one end-of-turn marker to the device
//! - Either side closing → the other side is closed too

use crate::audio::codec::{classify_device_text, decode_audio_event, encode_audio_event};
use crate::audio::container::OutputFraming;
use crate::audio::frame::AudioFrame;
use crate::audio::resampler::resample;
use crate::config::{AppConfig, EndOfTurnMarker};
use crate::error::{RelayError, RelayResult};
use crate::protocol::ControlEvent;
use crate::upstream::{Delivery, InboundEvent, UpstreamHandle};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Per-session audio settings, copied from the configuration at connect time.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub device_sample_rate: u32,
    pub upstream_sample_rate: u32,
    pub resample_return_path: bool,
    pub output_framing: OutputFraming,
    pub end_of_turn_marker: EndOfTurnMarker,
}

impl From<&AppConfig> for RelaySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            device_sample_rate: config.audio.device_sample_rate,
            upstream_sample_rate: config.audio.upstream_sample_rate,
            resample_return_path: config.audio.resample_return_path,
            output_framing: config.audio.output_framing,
            end_of_turn_marker: config.audio.end_of_turn_marker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why the relay is closing the device connection.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseCause {
    /// The upstream hung up cleanly
    UpstreamClosed(Option<String>),
    /// The upstream leg failed (handshake rejected, transport error)
    Failed(RelayError),
}

impl CloseCause {
    /// Human-readable reason sent to the device in the close frame.
    pub fn describe(&self) -> String {
        match self {
            CloseCause::UpstreamClosed(Some(reason)) => format!("upstream closed: {}", reason),
            CloseCause::UpstreamClosed(None) => "upstream closed".to_string(),
            CloseCause::Failed(err) => err.to_string(),
        }
    }
}

/// Something the device connection must do.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    /// Send a binary audio frame
    Audio(Vec<u8>),
    /// Tell the device to stop playback
    EndOfTurn(EndOfTurnMarker),
    /// Close the device connection
    Close(CloseCause),
}

/// Diagnostics counters, logged when the session closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub device_frames_in: u64,
    pub device_bytes_in: u64,
    pub audio_frames_forwarded: u64,
    pub audio_frames_dropped: u64,
    pub control_forwarded: u64,
    pub control_dropped: u64,
    pub frame_errors: u64,
    pub upstream_events_in: u64,
    pub device_bytes_out: u64,
    pub turns_completed: u64,
}

/// One device ↔ upstream pairing.
pub struct SessionRelay {
    id: Uuid,
    state: SessionState,
    upstream: UpstreamHandle,
    settings: RelaySettings,
    stats: SessionStats,
    created_at: DateTime<Utc>,
    /// Last response whose `response.audio.done` was relayed
    finished_response: Option<String>,
    /// Audio has reached the device since the last end-of-turn marker
    turn_open: bool,
}

impl SessionRelay {
    pub fn new(id: Uuid, settings: RelaySettings, upstream: UpstreamHandle) -> Self {
        info!(session_id = %id, "Session connecting to upstream");
        Self {
            id,
            state: SessionState::Connecting,
            upstream,
            settings,
            stats: SessionStats::default(),
            created_at: Utc::now(),
            finished_response: None,
            turn_open: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    /// Binary PCM from the device.
    pub fn on_device_audio(&mut self, bytes: &[u8]) {
        if self.is_finished() {
            return;
        }

        self.stats.device_frames_in += 1;
        self.stats.device_bytes_in += bytes.len() as u64;

        if self.state != SessionState::Active {
            self.stats.audio_frames_dropped += 1;
            debug!(session_id = %self.id, "Dropping {} bytes of device audio, upstream not ready", bytes.len());
            return;
        }

        let frame = match AudioFrame::from_pcm_bytes(bytes, self.settings.device_sample_rate) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.frame_errors += 1;
                warn!(session_id = %self.id, "Dropping device audio: {}", err);
                return;
            }
        };

        let frame = resample(&frame, self.settings.upstream_sample_rate);
        let event = encode_audio_event(&frame);

        match self.upstream.send_event(&event) {
            Ok(Delivery::Queued) => self.stats.audio_frames_forwarded += 1,
            outcome => {
                self.stats.audio_frames_dropped += 1;
                self.log_undelivered("audio", outcome);
            }
        }
    }

    /// JSON control message from the device.
    pub fn on_device_text(&mut self, text: &str) {
        if self.is_finished() {
            return;
        }

        let pass = match classify_device_text(text) {
            Ok(Some(pass)) => pass,
            Ok(None) => {
                self.stats.control_dropped += 1;
                return;
            }
            Err(err) => {
                self.stats.frame_errors += 1;
                self.stats.control_dropped += 1;
                warn!(session_id = %self.id, "Dropping device control message: {}", err);
                return;
            }
        };

        match self.upstream.send_text(pass.raw) {
            Ok(Delivery::Queued) => {
                self.stats.control_forwarded += 1;
                debug!(session_id = %self.id, "Forwarded {} to upstream", pass.type_name);
            }
            outcome => {
                self.stats.control_dropped += 1;
                self.log_undelivered(&pass.type_name, outcome);
            }
        }
    }

    fn log_undelivered(&self, what: &str, outcome: RelayResult<Delivery>) {
        match outcome {
            Ok(Delivery::Queued) => {}
            Ok(Delivery::DroppedNotReady) => {
                debug!(session_id = %self.id, "Dropped {}: upstream not configured", what)
            }
            Ok(Delivery::DroppedBackpressure) => {
                warn!(session_id = %self.id, "Dropped {}: upstream queue full", what)
            }
            Err(err) => debug!(session_id = %self.id, "Dropped {}: {}", what, err),
        }
    }

    /// Something arrived from the upstream connector.
    pub fn on_upstream(&mut self, event: InboundEvent) -> Vec<DeviceAction> {
        if self.is_finished() {
            return Vec::new();
        }

        match event {
            InboundEvent::Ready => {
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Active;
                    info!(session_id = %self.id, "Session active");
                }
                Vec::new()
            }
            InboundEvent::Event(event) => {
                self.stats.upstream_events_in += 1;
                self.on_upstream_event(event).into_iter().collect()
            }
            InboundEvent::Closed { reason } => {
                info!(session_id = %self.id, "Upstream ended the session");
                self.shut_down();
                vec![DeviceAction::Close(CloseCause::UpstreamClosed(reason))]
            }
            InboundEvent::Failed(err) => {
                if err.is_fatal() {
                    error!(session_id = %self.id, "Upstream failed: {}", err);
                } else {
                    warn!(session_id = %self.id, "Upstream stopped: {}", err);
                }
                self.shut_down();
                vec![DeviceAction::Close(CloseCause::Failed(err))]
            }
        }
    }

    fn on_upstream_event(&mut self, event: ControlEvent) -> Option<DeviceAction> {
        match event {
            ControlEvent::ResponseAudioDelta { ref response_id, .. } => {
                if response_id.is_some() && *response_id == self.finished_response {
                    debug!(session_id = %self.id, "Dropping audio for a turn that already finished");
                    return None;
                }

                match self.device_audio(&event) {
                    Ok(bytes) => {
                        self.turn_open = true;
                        self.stats.device_bytes_out += bytes.len() as u64;
                        Some(DeviceAction::Audio(bytes))
                    }
                    Err(err) => {
                        self.stats.frame_errors += 1;
                        warn!(session_id = %self.id, "Dropping upstream audio: {}", err);
                        None
                    }
                }
            }
            ControlEvent::ResponseAudioDone { response_id } => {
                let repeated = match response_id {
                    Some(_) => response_id == self.finished_response,
                    // without an id, only a turn that played audio can finish
                    None => !self.turn_open,
                };
                if repeated {
                    debug!(session_id = %self.id, "Ignoring repeated response.audio.done");
                    return None;
                }
                self.finished_response = response_id;
                self.turn_open = false;
                self.stats.turns_completed += 1;
                Some(DeviceAction::EndOfTurn(self.settings.end_of_turn_marker))
            }
            ControlEvent::Error { error } => {
                warn!(session_id = %self.id, "Upstream reported an error: {}", error);
                None
            }
            ControlEvent::SessionCreated { .. } | ControlEvent::SessionUpdated { .. } => {
                debug!(session_id = %self.id, "Upstream acknowledged session configuration");
                None
            }
            other => {
                debug!(session_id = %self.id, "Not relaying upstream {} to device", other.type_name());
                None
            }
        }
    }

    /// Decode, optionally resample, and package one delta for the device.
    fn device_audio(&self, event: &ControlEvent) -> RelayResult<Vec<u8>> {
        let frame = decode_audio_event(event, self.settings.upstream_sample_rate)?;
        trace!(session_id = %self.id, "{} ms of audio for the device", frame.duration_ms());
        let frame = if self.settings.resample_return_path {
            resample(&frame, self.settings.device_sample_rate)
        } else {
            frame
        };
        self.settings.output_framing.package(&frame)
    }

    /// The device went away (close frame, protocol error, heartbeat timeout).
    /// Idempotent.
    pub fn on_device_closed(&mut self) {
        if self.is_finished() {
            return;
        }
        info!(session_id = %self.id, state = self.state.as_str(), "Device disconnected");
        self.shut_down();
    }

    /// `Closing` only lasts while the upstream handle is released. The
    /// connector finishes its close on its own task; nothing is awaited here.
    fn shut_down(&mut self) {
        self.state = SessionState::Closing;
        self.upstream.close();
        self.state = SessionState::Closed;

        let stats = &self.stats;
        info!(
            session_id = %self.id,
            upstream_state = self.upstream.state().as_str(),
            duration_ms = (Utc::now() - self.created_at).num_milliseconds(),
            device_frames_in = stats.device_frames_in,
            audio_frames_forwarded = stats.audio_frames_forwarded,
            audio_frames_dropped = stats.audio_frames_dropped,
            frame_errors = stats.frame_errors,
            device_bytes_out = stats.device_bytes_out,
            turns_completed = stats.turns_completed,
            "Session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::connector::DetachedUpstream;
    use crate::upstream::ConnectorState;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn settings() -> RelaySettings {
        RelaySettings {
            device_sample_rate: 16000,
            upstream_sample_rate: 24000,
            resample_return_path: false,
            output_framing: OutputFraming::Raw,
            end_of_turn_marker: EndOfTurnMarker::EmptyFrame,
        }
    }

    fn connecting(settings: RelaySettings) -> (SessionRelay, DetachedUpstream) {
        let (handle, upstream) = UpstreamHandle::detached(16);
        (SessionRelay::new(Uuid::new_v4(), settings, handle), upstream)
    }

    fn active(settings: RelaySettings) -> (SessionRelay, DetachedUpstream) {
        let (mut session, upstream) = connecting(settings);
        upstream.state.send_replace(ConnectorState::Configured);
        assert!(session.on_upstream(InboundEvent::Ready).is_empty());
        assert_eq!(session.state(), SessionState::Active);
        (session, upstream)
    }

    fn delta(samples: &[i16], response_id: &str) -> InboundEvent {
        let frame = AudioFrame::new(samples.to_vec(), 24000);
        InboundEvent::Event(ControlEvent::ResponseAudioDelta {
            delta: STANDARD.encode(frame.to_pcm_bytes()),
            response_id: Some(response_id.to_string()),
        })
    }

    fn done(response_id: &str) -> InboundEvent {
        InboundEvent::Event(ControlEvent::ResponseAudioDone {
            response_id: Some(response_id.to_string()),
        })
    }

    #[test]
    fn test_device_audio_is_resampled_and_encoded() {
        let (mut session, mut upstream) = active(settings());

        session.on_device_audio(&[0x20u8; 320]);

        let sent = upstream.outbound.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        let pcm = STANDARD.decode(value["audio"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 480);
        assert_eq!(session.stats().audio_frames_forwarded, 1);
    }

    #[test]
    fn test_device_audio_dropped_until_active() {
        let (mut session, mut upstream) = connecting(settings());

        session.on_device_audio(&[0u8; 320]);

        assert!(upstream.outbound.try_recv().is_err());
        assert_eq!(session.stats().audio_frames_dropped, 1);
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_odd_length_audio_is_a_frame_error_not_fatal() {
        let (mut session, mut upstream) = active(settings());

        session.on_device_audio(&[0u8; 321]);
        assert!(upstream.outbound.try_recv().is_err());
        assert_eq!(session.stats().frame_errors, 1);
        assert_eq!(session.state(), SessionState::Active);

        session.on_device_audio(&[0u8; 320]);
        assert!(upstream.outbound.try_recv().is_ok());
    }

    #[test]
    fn test_unrecognized_control_is_not_forwarded() {
        let (mut session, mut upstream) = active(settings());

        session.on_device_text(r#"{"type":"bogus"}"#);
        session.on_device_text("{garbage");

        assert!(upstream.outbound.try_recv().is_err());
        assert_eq!(session.stats().control_dropped, 2);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_whitelisted_control_is_forwarded_verbatim() {
        let (mut session, mut upstream) = active(settings());
        let text = r#"{"type":"input_audio_buffer.commit","event_id":"dev-7"}"#;

        session.on_device_text(text);

        assert_eq!(upstream.outbound.try_recv().unwrap(), text);
        assert_eq!(session.stats().control_forwarded, 1);
    }

    #[test]
    fn test_device_disconnect_before_configured_closes_upstream() {
        let (mut session, mut upstream) = connecting(settings());

        session.on_device_closed();

        assert_eq!(upstream.close.try_recv(), Ok(()));
        assert_eq!(session.state(), SessionState::Closed);

        // later traffic is ignored
        session.on_device_audio(&[0u8; 320]);
        assert!(session.on_upstream(InboundEvent::Ready).is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_dropping_the_session_releases_upstream() {
        let (session, mut upstream) = connecting(settings());
        drop(session);
        assert!(upstream.close.try_recv().is_ok());
    }

    #[test]
    fn test_audio_delta_forwarded_verbatim_by_default() {
        let (mut session, _upstream) = active(settings());

        let actions = session.on_upstream(delta(&[1, 2, 3], "r1"));

        assert_eq!(actions, vec![DeviceAction::Audio(vec![1, 0, 2, 0, 3, 0])]);
        assert_eq!(session.stats().device_bytes_out, 6);
    }

    #[test]
    fn test_audio_done_sends_exactly_one_end_marker() {
        let (mut session, _upstream) = active(settings());

        assert_eq!(session.on_upstream(delta(&[5; 24], "r1")).len(), 1);
        assert_eq!(
            session.on_upstream(done("r1")),
            vec![DeviceAction::EndOfTurn(EndOfTurnMarker::EmptyFrame)]
        );

        // stragglers and duplicates for the finished turn produce nothing
        assert!(session.on_upstream(delta(&[5; 24], "r1")).is_empty());
        assert!(session.on_upstream(done("r1")).is_empty());
        assert_eq!(session.stats().turns_completed, 1);

        // the next turn flows again
        assert_eq!(session.on_upstream(delta(&[6; 24], "r2")).len(), 1);
    }

    #[test]
    fn test_repeated_done_without_response_id_sends_one_marker() {
        let (mut session, _upstream) = active(settings());
        let anonymous_delta = || {
            let frame = AudioFrame::new(vec![7; 24], 24000);
            InboundEvent::Event(ControlEvent::ResponseAudioDelta {
                delta: STANDARD.encode(frame.to_pcm_bytes()),
                response_id: None,
            })
        };
        let anonymous_done = || InboundEvent::Event(ControlEvent::ResponseAudioDone { response_id: None });

        assert_eq!(session.on_upstream(anonymous_delta()).len(), 1);
        assert_eq!(
            session.on_upstream(anonymous_done()),
            vec![DeviceAction::EndOfTurn(EndOfTurnMarker::EmptyFrame)]
        );
        assert!(session.on_upstream(anonymous_done()).is_empty());
        assert_eq!(session.stats().turns_completed, 1);

        // audio reopens the turn
        assert_eq!(session.on_upstream(anonymous_delta()).len(), 1);
        assert_eq!(session.on_upstream(anonymous_done()).len(), 1);
        assert_eq!(session.stats().turns_completed, 2);
    }

    #[test]
    fn test_return_path_resampling_and_wav_framing() {
        let mut custom = settings();
        custom.resample_return_path = true;
        custom.output_framing = OutputFraming::Wav;
        custom.end_of_turn_marker = EndOfTurnMarker::Text;
        let (mut session, _upstream) = active(custom);

        match session.on_upstream(delta(&[100; 240], "r1")).as_slice() {
            [DeviceAction::Audio(bytes)] => {
                assert_eq!(&bytes[0..4], b"RIFF");
                // 240 samples at 24kHz -> 160 samples at 16kHz
                assert_eq!(bytes.len(), 44 + 320);
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(
            session.on_upstream(done("r1")),
            vec![DeviceAction::EndOfTurn(EndOfTurnMarker::Text)]
        );
    }

    #[test]
    fn test_bad_delta_is_dropped() {
        let (mut session, _upstream) = active(settings());
        let event = InboundEvent::Event(ControlEvent::ResponseAudioDelta {
            delta: "%%%".to_string(),
            response_id: None,
        });

        assert!(session.on_upstream(event).is_empty());
        assert_eq!(session.stats().frame_errors, 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_upstream_failure_closes_device_and_upstream() {
        let (mut session, mut upstream) = connecting(settings());
        let failure = RelayError::Handshake("upstream rejected the credential (401 Unauthorized)".to_string());

        let actions = session.on_upstream(InboundEvent::Failed(failure.clone()));

        assert_eq!(actions, vec![DeviceAction::Close(CloseCause::Failed(failure))]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(upstream.close.try_recv().is_ok());
        assert!(session.on_upstream(delta(&[1], "r1")).is_empty());
    }

    #[test]
    fn test_upstream_close_closes_device() {
        let (mut session, _upstream) = active(settings());

        let actions = session.on_upstream(InboundEvent::Closed {
            reason: Some("1000 bye".to_string()),
        });

        match actions.as_slice() {
            [DeviceAction::Close(cause)] => assert_eq!(cause.describe(), "upstream closed: 1000 bye"),
            other => panic!("unexpected actions {:?}", other),
        }
        // the device disconnect that follows is a no-op
        session.on_device_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_upstream_error_event_is_not_fatal_once_active() {
        let (mut session, _upstream) = active(settings());
        let event: ControlEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"buffer too small"}}"#,
        )
        .unwrap();

        assert!(session.on_upstream(InboundEvent::Event(event)).is_empty());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_full_outbound_queue_drops_audio() {
        let (handle, upstream) = UpstreamHandle::detached(1);
        upstream.state.send_replace(ConnectorState::Configured);
        let mut session = SessionRelay::new(Uuid::new_v4(), settings(), handle);
        session.on_upstream(InboundEvent::Ready);

        session.on_device_audio(&[0u8; 64]);
        session.on_device_audio(&[0u8; 64]);

        assert_eq!(session.stats().audio_frames_forwarded, 1);
        assert_eq!(session.stats().audio_frames_dropped, 1);
        drop(upstream);
    }
}
