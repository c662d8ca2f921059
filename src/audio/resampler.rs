//! # Sample-Rate Conversion
//!
//! The device and the upstream service rarely agree on a sample rate (a
//! microphone board typically captures at 16kHz while the realtime API speaks
//! 24kHz PCM16), so every audio frame crossing the relay may need resampling.
//!
//! ## Strategies:
//! - **Upsampling**: linear interpolation between neighbouring samples
//! - **Integer decimation** (e.g. 48kHz → 16kHz): average each block of `k`
//! - **3:2 decimation** (24kHz → 16kHz): a cheap, lossy shortcut that keeps
//!   two of every three samples (the first one smoothed)
//! - **Anything else**: the same clamped linear interpolation as upsampling
//!
//! ## Output Length:
//! Every strategy produces exactly `floor(n * target / source)` samples,
//! computed with integer arithmetic so long streams never drift.
//!
//! All strategies are pure: they read from the input frame and return a new
//! one. No index ever goes past the last input sample (positions are clamped).

use super::frame::AudioFrame;

/// Convert `frame` to `target_rate`.
///
/// ## Examples:
/// - 160 samples at 16kHz → 240 samples at 24kHz
/// - 240 samples at 24kHz → 160 samples at 16kHz
pub fn resample(frame: &AudioFrame, target_rate: u32) -> AudioFrame {
    let source_rate = frame.sample_rate();

    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return AudioFrame::new(frame.samples().to_vec(), target_rate);
    }

    let input = frame.samples();
    let output_len = output_length(input.len(), source_rate, target_rate);

    let samples = if target_rate > source_rate {
        interpolate(input, source_rate, target_rate, output_len)
    } else if source_rate % target_rate == 0 {
        decimate_by_block(input, (source_rate / target_rate) as usize, output_len)
    } else if source_rate as u64 * 2 == target_rate as u64 * 3 {
        decimate_three_to_two(input, output_len)
    } else {
        interpolate(input, source_rate, target_rate, output_len)
    };

    AudioFrame::new(samples, target_rate)
}

/// `floor(len * target / source)` without going through floating point.
fn output_length(len: usize, source_rate: u32, target_rate: u32) -> usize {
    (len as u64 * target_rate as u64 / source_rate as u64) as usize
}

fn clamp_to_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Linear interpolation at `position = i * source / target`.
fn interpolate(input: &[i16], source_rate: u32, target_rate: u32, output_len: usize) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let last = input.len() - 1;
    let step = source_rate as f64 / target_rate as f64;

    (0..output_len)
        .map(|i| {
            let position = i as f64 * step;
            let i0 = (position.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = position - i0 as f64;

            let s0 = input[i0] as f64;
            let s1 = input[i1] as f64;
            clamp_to_i16(s0 + (s1 - s0) * frac)
        })
        .collect()
}

/// Mean of each consecutive block of `factor` samples.
fn decimate_by_block(input: &[i16], factor: usize, output_len: usize) -> Vec<i16> {
    input
        .chunks_exact(factor)
        .take(output_len)
        .map(|block| {
            let sum: i64 = block.iter().map(|&s| s as i64).sum();
            clamp_to_i16(sum as f64 / factor as f64)
        })
        .collect()
}

/// Groups of three in, two out: `avg(s0, s1)` then `s1`. `s2` is dropped.
fn decimate_three_to_two(input: &[i16], output_len: usize) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let last = input.len() - 1;

    (0..output_len)
        .map(|j| {
            let first = (j / 2 * 3).min(last);
            let second = (first + 1).min(last);
            if j % 2 == 0 {
                clamp_to_i16((input[first] as f64 + input[second] as f64) / 2.0)
            } else {
                input[second]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16).wrapping_mul(97)).collect()
    }

    #[test]
    fn test_device_frame_to_upstream_rate() {
        // 320 bytes of PCM16 at 16kHz
        let frame = AudioFrame::from_pcm_bytes(&[0x10u8; 320], 16000).unwrap();
        let resampled = resample(&frame, 24000);

        assert_eq!(resampled.len(), 240);
        assert_eq!(resampled.to_pcm_bytes().len(), 480);
        assert_eq!(resampled.sample_rate(), 24000);
    }

    #[test]
    fn test_upsampling_constant_buffer_stays_constant() {
        for (source, target) in [(8000, 24000), (16000, 24000), (16000, 22050), (11025, 48000)] {
            let frame = AudioFrame::new(vec![-1234; 333], source);
            let resampled = resample(&frame, target);
            assert!(!resampled.is_empty());
            assert!(
                resampled.samples().iter().all(|&s| s == -1234),
                "constant buffer changed for {} -> {}",
                source,
                target
            );
        }
    }

    #[test]
    fn test_integer_downsampling_of_silence() {
        for factor in [2u32, 3, 6] {
            let frame = AudioFrame::new(vec![0; 480], 8000 * factor);
            let resampled = resample(&frame, 8000);
            assert_eq!(resampled.len(), 480 / factor as usize);
            assert!(resampled.samples().iter().all(|&s| s == 0));
        }
    }

    #[test]
    fn test_block_average_rounds_to_nearest() {
        let frame = AudioFrame::new(vec![1, 2, 10, 11, -3, -4], 48000);
        let resampled = resample(&frame, 24000);
        // 1.5 -> 2, 10.5 -> 11, -3.5 -> -4 (round half away from zero)
        assert_eq!(resampled.samples(), &[2, 11, -4]);
    }

    #[test]
    fn test_block_average_does_not_overflow() {
        let frame = AudioFrame::new(vec![i16::MAX; 6], 48000);
        let resampled = resample(&frame, 16000);
        assert_eq!(resampled.samples(), &[i16::MAX, i16::MAX]);
    }

    #[test]
    fn test_three_to_two_decimation() {
        let frame = AudioFrame::new(vec![10, 20, 99, 30, 41, 99], 24000);
        let resampled = resample(&frame, 16000);
        assert_eq!(resampled.samples(), &[15, 20, 36, 41]);
    }

    #[test]
    fn test_three_to_two_trailing_partial_group() {
        // 8 samples -> floor(8 * 2 / 3) = 5 outputs; the last group only has two samples
        let frame = AudioFrame::new(vec![0, 2, 9, 4, 6, 9, 8, 10], 24000);
        let resampled = resample(&frame, 16000);
        assert_eq!(resampled.samples(), &[1, 2, 5, 6, 9]);
    }

    #[test]
    fn test_interpolation_midpoints() {
        let frame = AudioFrame::new(vec![0, 100, 200], 8000);
        let resampled = resample(&frame, 16000);
        // positions 0, 0.5, 1, 1.5, 2, 2.5 (clamped at the last sample)
        assert_eq!(resampled.samples(), &[0, 50, 100, 150, 200, 200]);
    }

    #[test]
    fn test_empty_input() {
        for (source, target) in [(16000, 24000), (24000, 16000), (48000, 16000), (44100, 16000)] {
            let frame = AudioFrame::new(Vec::new(), source);
            assert!(resample(&frame, target).is_empty());
        }
    }

    #[test]
    fn test_single_sample_never_reads_past_end() {
        let frame = AudioFrame::new(vec![42], 16000);
        let resampled = resample(&frame, 48000);
        assert_eq!(resampled.samples(), &[42, 42, 42]);

        let frame = AudioFrame::new(vec![42, 42], 24000);
        assert_eq!(resample(&frame, 16000).samples(), &[42]);
    }

    #[test]
    fn test_round_trip_length_does_not_drift() {
        let pairs = [(16000, 24000), (8000, 16000), (16000, 48000), (24000, 16000), (16000, 22050)];
        for len in 0..200 {
            for (source, target) in pairs {
                let frame = AudioFrame::new(ramp(len), source);
                let there = resample(&frame, target);
                let back = resample(&there, source);
                let diff = back.len() as i64 - len as i64;
                assert!(
                    diff.abs() <= 1,
                    "{} samples {} -> {} -> {} came back as {}",
                    len,
                    source,
                    target,
                    source,
                    back.len()
                );
            }
        }
    }

    #[test]
    fn test_same_rate_is_identity() {
        let frame = AudioFrame::new(ramp(50), 16000);
        assert_eq!(resample(&frame, 16000), frame);
    }
}
