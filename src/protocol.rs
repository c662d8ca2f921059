//! # Realtime Event Protocol
//!
//! JSON events exchanged with the upstream speech service. Every event is an
//! object with a `type` tag; audio travels base64-encoded inside the JSON.
//!
//! ## Event Directions:
//! - **Relay → upstream**: `session.update`, `input_audio_buffer.append`,
//!   `input_audio_buffer.clear`, `input_audio_buffer.commit`, `response.create`
//! - **Upstream → relay**: `session.created`, `session.updated`,
//!   `response.audio.delta`, `response.audio.done`, `error`
//!
//! Every other `type` the service emits (transcripts, rate limits, item
//! bookkeeping) is outside this set and is dropped by the codec.

use serde::{Deserialize, Serialize};

/// Audio encoding name understood by the upstream for both directions.
pub const PCM16_FORMAT: &str = "pcm16";

/// The closed set of events the relay understands.
///
/// ## Serde Layout:
/// `#[serde(tag = "type")]` produces the flat upstream shape, e.g.
/// `{"type": "input_audio_buffer.append", "audio": "AAAA"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// Session configuration, sent once the upstream connection is open
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfiguration },

    /// Upstream announces that the session exists (handshake acknowledgement)
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: serde_json::Value,
    },

    /// Upstream accepted a `session.update`
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: serde_json::Value,
    },

    /// Base64 PCM16 chunk of device audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Ask the upstream to start a response; options are passed through untouched
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<serde_json::Value>,
    },

    /// Base64 PCM16 chunk of synthesized speech
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    /// End of the current spoken turn
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error { error: UpstreamErrorDetail },
}

impl ControlEvent {
    /// The wire `type` tag of this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlEvent::SessionUpdate { .. } => "session.update",
            ControlEvent::SessionCreated { .. } => "session.created",
            ControlEvent::SessionUpdated { .. } => "session.updated",
            ControlEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ControlEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ControlEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ControlEvent::ResponseCreate { .. } => "response.create",
            ControlEvent::ResponseAudioDelta { .. } => "response.audio.delta",
            ControlEvent::ResponseAudioDone { .. } => "response.audio.done",
            ControlEvent::Error { .. } => "error",
        }
    }

    /// Whether `type_name` belongs to the set above.
    pub fn is_known_type(type_name: &str) -> bool {
        matches!(
            type_name,
            "session.update"
                | "session.created"
                | "session.updated"
                | "input_audio_buffer.append"
                | "input_audio_buffer.clear"
                | "input_audio_buffer.commit"
                | "response.create"
                | "response.audio.delta"
                | "response.audio.done"
                | "error"
        )
    }
}

/// Error payload of an upstream `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for UpstreamErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.code) {
            (Some(kind), Some(code)) => write!(f, "{} ({}): {}", kind, code, self.message),
            (Some(kind), None) => write!(f, "{}: {}", kind, self.message),
            (None, Some(code)) => write!(f, "{}: {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

/// Body of the `session.update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    /// `None` serializes as `null`, which disables server-side VAD
    pub turn_detection: Option<TurnDetection>,
}

impl SessionConfiguration {
    /// PCM16 in both directions.
    pub fn pcm16(instructions: impl Into<String>, voice: impl Into<String>, turn_detection: Option<TurnDetection>) -> Self {
        Self {
            instructions: instructions.into(),
            voice: voice.into(),
            input_audio_format: PCM16_FORMAT.to_string(),
            output_audio_format: PCM16_FORMAT.to_string(),
            turn_detection,
        }
    }
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub silence_duration_ms: u32,
    pub prefix_padding_ms: u32,
}

impl TurnDetection {
    pub fn server_vad(threshold: f32, silence_duration_ms: u32, prefix_padding_ms: u32) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold,
            silence_duration_ms,
            prefix_padding_ms,
        }
    }
}
