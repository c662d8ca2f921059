//! # Device Output Framing
//!
//! Some device firmwares play raw PCM straight into their DAC, others hand each
//! chunk to a decoder that expects a WAV header. The relay supports both and
//! picks one per deployment through `audio.output_framing`.

use super::frame::AudioFrame;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// How audio is packaged before it is sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFraming {
    /// Bare PCM16 little-endian bytes
    #[default]
    Raw,
    /// Each chunk wrapped in its own mono 16-bit WAV container
    Wav,
}

impl OutputFraming {
    /// Package one frame for the device.
    pub fn package(&self, frame: &AudioFrame) -> RelayResult<Vec<u8>> {
        match self {
            OutputFraming::Raw => Ok(frame.to_pcm_bytes()),
            OutputFraming::Wav => wrap_wav(frame),
        }
    }
}

fn wrap_wav(frame: &AudioFrame) -> RelayResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: frame.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + frame.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| RelayError::Frame(format!("WAV header: {}", e)))?;

        for &sample in frame.samples() {
            writer
                .write_sample(sample)
                .map_err(|e| RelayError::Frame(format!("WAV sample: {}", e)))?;
        }

        writer
            .finalize()
            .map_err(|e| RelayError::Frame(format!("WAV finalize: {}", e)))?;
    }

    Ok(cursor.into_inner())
}
