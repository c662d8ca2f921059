//! # Audio Frames
//!
//! An `AudioFrame` is an immutable run of 16-bit signed PCM samples tagged with
//! the sample rate they were captured (or synthesized) at. Frames are never
//! modified in place: resampling and encoding always produce a new frame.
//!
//! ## Wire Format:
//! - **Encoding**: signed 16-bit little-endian integers
//! - **Channels**: mono
//! - **Byte length**: always even (two bytes per sample)

use crate::error::{RelayError, RelayResult};
use byteorder::{ByteOrder, LittleEndian};

/// Immutable mono PCM16 buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Build a frame from already-decoded samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Reinterpret a little-endian byte buffer as PCM16 samples.
    ///
    /// ## Errors:
    /// An odd byte count cannot be split into whole samples and is reported
    /// as a `RelayError::Frame` instead of silently truncating the last byte.
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> RelayResult<Self> {
        if bytes.len() % 2 != 0 {
            return Err(RelayError::Frame(format!(
                "PCM16 buffer has odd length {}",
                bytes.len()
            )));
        }

        let mut samples = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut samples);

        Ok(Self { samples, sample_rate })
    }

    /// Serialize back to little-endian bytes.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.samples.len() * 2];
        LittleEndian::write_i16_into(&self.samples, &mut bytes);
        bytes
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples (not bytes).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}
