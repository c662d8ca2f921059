//! # Audio Module
//!
//! Stateless audio transforms used by the session relay.
//!
//! ## Key Components:
//! - **Frame**: immutable PCM16 buffer tagged with its sample rate
//! - **Resampler**: sample-rate conversion between the device and the upstream
//! - **Codec**: binary PCM ↔ base64 JSON events, control-message recognition
//! - **Container**: raw or WAV-wrapped packaging of device-bound audio
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit signed PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian
//! - **Sample Rate**: per side, from configuration (device 16kHz, upstream 24kHz by default)

pub mod codec;
pub mod container;
pub mod frame;
pub mod resampler;
