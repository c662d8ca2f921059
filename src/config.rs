//! # Configuration Management
//!
//! Loads the relay configuration once at startup from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables with the `APP_` prefix
//! - Platform variables: `HOST`, `PORT`, `OPENAI_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `OPENAI_API_KEY`)
//! 2. `APP_` variables, sections separated by a double underscore
//!    (e.g. `APP_AUDIO__DEVICE_SAMPLE_RATE=8000`)
//! 3. `config.toml`
//! 4. Defaults
//!
//! Nothing here changes at runtime: each session copies what it needs from
//! the loaded `AppConfig` when its device connects.

use crate::audio::container::OutputFraming;
use crate::protocol::{SessionConfiguration, TurnDetection};
use crate::upstream::{HandshakePolicy, UpstreamSettings};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

/// Device-facing listener settings.
///
/// ## Fields:
/// - `host` / `port`: where the listener binds (`0.0.0.0` to accept devices on the LAN)
/// - `device_path`: URL path devices upgrade on, in addition to `/ws/device`
/// - `heartbeat_interval_secs`: how often the relay pings each device
/// - `client_timeout_secs`: silence after which a device is considered gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub device_path: String,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// How the relay reaches the realtime speech service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Full `ws://` or `wss://` URL including the model query parameter
    pub url: String,
    /// Bearer credential; never logged or returned by the config endpoint
    pub api_key: String,
    /// Protocol-version header sent with the handshake
    pub protocol_header: String,
    pub protocol_version: String,
    /// `delay` (fixed wait before `session.update`) or `acknowledge`
    /// (wait for `session.created`)
    pub handshake_mode: HandshakeMode,
    pub handshake_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeMode {
    Delay,
    Acknowledge,
}

/// Contents of the `session.update` event sent to the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub turn_detection: TurnDetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub silence_duration_ms: u32,
    pub prefix_padding_ms: u32,
}

/// Audio formats on both legs and how device-bound audio is packaged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub device_sample_rate: u32,
    pub upstream_sample_rate: u32,
    /// Resample synthesized speech back to the device rate instead of
    /// forwarding it at the upstream rate
    pub resample_return_path: bool,
    pub output_framing: OutputFraming,
    pub end_of_turn_marker: EndOfTurnMarker,
}

/// What the device receives when a spoken turn is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfTurnMarker {
    /// A zero-length binary frame
    #[default]
    EmptyFrame,
    /// A `{"type":"response.audio.done"}` text frame
    Text,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                device_path: "/".to_string(),
                heartbeat_interval_secs: 15,
                client_timeout_secs: 45,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
                api_key: String::new(),
                protocol_header: "OpenAI-Beta".to_string(),
                protocol_version: "realtime=v1".to_string(),
                handshake_mode: HandshakeMode::Delay,
                handshake_delay_ms: 250,
                handshake_timeout_ms: 5000,
                outbound_queue_capacity: 64,
                inbound_queue_capacity: 64,
            },
            session: SessionConfig {
                instructions: "You are a friendly robot assistant. Keep responses short and clear.".to_string(),
                voice: "alloy".to_string(),
                turn_detection: TurnDetectionConfig {
                    enabled: false,
                    threshold: 0.5,
                    silence_duration_ms: 500,
                    prefix_padding_ms: 300,
                },
            },
            audio: AudioConfig {
                device_sample_rate: 16000,
                upstream_sample_rate: 24000,
                resample_return_path: false,
                output_framing: OutputFraming::Raw,
                end_of_turn_marker: EndOfTurnMarker::EmptyFrame,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_UPSTREAM__HANDSHAKE_MODE=acknowledge`
    /// - `APP_AUDIO__OUTPUT_FRAMING=wav`
    /// - `PORT=3000`, `OPENAI_API_KEY=sk-...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that could only fail later, per session.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.device_path.starts_with('/') {
            return Err(anyhow::anyhow!("Device path must start with '/'"));
        }

        if self.server.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.server.client_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.server.client_timeout_secs,
                self.server.heartbeat_interval_secs
            ));
        }

        if !(self.upstream.url.starts_with("ws://") || self.upstream.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Upstream URL must use ws:// or wss://"));
        }

        if self.upstream.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Upstream API key is missing (set OPENAI_API_KEY or upstream.api_key)"
            ));
        }

        if self.upstream.outbound_queue_capacity == 0 || self.upstream.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Upstream queue capacities must be greater than 0"));
        }

        if self.audio.device_sample_rate == 0 || self.audio.upstream_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        let vad = &self.session.turn_detection;
        if !(0.0..=1.0).contains(&vad.threshold) {
            return Err(anyhow::anyhow!("Turn detection threshold must be between 0 and 1"));
        }

        Ok(())
    }

    /// The `session.update` body every session sends.
    pub fn session_configuration(&self) -> SessionConfiguration {
        let vad = &self.session.turn_detection;
        let turn_detection = vad
            .enabled
            .then(|| TurnDetection::server_vad(vad.threshold, vad.silence_duration_ms, vad.prefix_padding_ms));

        SessionConfiguration::pcm16(
            self.session.instructions.clone(),
            self.session.voice.clone(),
            turn_detection,
        )
    }

    /// Everything the upstream connector needs to dial one session.
    pub fn upstream_settings(&self) -> UpstreamSettings {
        let handshake = match self.upstream.handshake_mode {
            HandshakeMode::Delay => HandshakePolicy::Delay(Duration::from_millis(self.upstream.handshake_delay_ms)),
            HandshakeMode::Acknowledge => {
                HandshakePolicy::Acknowledge(Duration::from_millis(self.upstream.handshake_timeout_ms))
            }
        };

        UpstreamSettings {
            url: self.upstream.url.clone(),
            api_key: self.upstream.api_key.clone(),
            protocol_header: self.upstream.protocol_header.clone(),
            protocol_version: self.upstream.protocol_version.clone(),
            handshake,
            session: self.session_configuration(),
            outbound_capacity: self.upstream.outbound_queue_capacity,
            inbound_capacity: self.upstream.inbound_queue_capacity,
        }
    }

    /// Host part of the upstream URL, safe to show in logs and health output.
    pub fn upstream_host(&self) -> String {
        let without_scheme = self
            .upstream
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.upstream.url);

        without_scheme
            .split(|c| c == '/' || c == '?')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}
