//! # Frame Codec
//!
//! Translates between the device's framing (raw binary PCM, small JSON control
//! messages) and the upstream's JSON events with base64 audio.
//!
//! ## Error Handling:
//! Every function here fails with `RelayError::Frame`. A frame error only
//! affects the frame being translated; callers log it and move on.

use super::frame::AudioFrame;
use crate::error::{RelayError, RelayResult};
use crate::protocol::ControlEvent;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

/// Device control messages that are forwarded to the upstream unchanged.
pub const PASS_THROUGH_TYPES: [&str; 3] = [
    "input_audio_buffer.clear",
    "input_audio_buffer.commit",
    "response.create",
];

/// A whitelisted device control message, kept verbatim for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThrough {
    pub type_name: String,
    pub raw: String,
}

/// Wrap a frame in an `input_audio_buffer.append` event.
pub fn encode_audio_event(frame: &AudioFrame) -> ControlEvent {
    ControlEvent::InputAudioBufferAppend {
        audio: STANDARD.encode(frame.to_pcm_bytes()),
    }
}

/// Extract the PCM payload of a `response.audio.delta` event.
///
/// The upstream does not repeat the sample rate in every delta, so the
/// caller supplies the rate negotiated for the session.
pub fn decode_audio_event(event: &ControlEvent, sample_rate: u32) -> RelayResult<AudioFrame> {
    match event {
        ControlEvent::ResponseAudioDelta { delta, .. } => decode_audio_payload(delta, sample_rate),
        ControlEvent::InputAudioBufferAppend { audio } => decode_audio_payload(audio, sample_rate),
        other => Err(RelayError::Frame(format!(
            "{} does not carry audio",
            other.type_name()
        ))),
    }
}

fn decode_audio_payload(payload: &str, sample_rate: u32) -> RelayResult<AudioFrame> {
    let bytes = STANDARD.decode(payload)?;
    AudioFrame::from_pcm_bytes(&bytes, sample_rate)
}

/// Read the `type` tag of a JSON object.
fn type_tag(value: &serde_json::Value) -> RelayResult<&str> {
    value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| RelayError::Frame("message has no string \"type\" field".to_string()))
}

/// Parse one upstream text message.
///
/// ## Returns:
/// - **Ok(Some(event))**: a type the relay understands
/// - **Ok(None)**: well-formed, but a type the relay has no use for
/// - **Err(Frame)**: not JSON, no `type`, or a known type with a broken body
pub fn parse_upstream_event(text: &str) -> RelayResult<Option<ControlEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let type_name = type_tag(&value)?;

    if !ControlEvent::is_known_type(type_name) {
        debug!("Dropping unrecognized upstream event type {}", type_name);
        return Ok(None);
    }

    let event = serde_json::from_value(value)?;
    Ok(Some(event))
}

/// Decide what to do with a text frame from the device.
///
/// Only the pass-through types are forwarded; anything else is logged and
/// dropped, including known upstream types the device has no business sending
/// (a device must not be able to rewrite the session configuration).
pub fn classify_device_text(text: &str) -> RelayResult<Option<PassThrough>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let type_name = type_tag(&value)?;

    if PASS_THROUGH_TYPES.contains(&type_name) {
        Ok(Some(PassThrough {
            type_name: type_name.to_string(),
            raw: text.to_string(),
        }))
    } else {
        debug!("Dropping device control message of type {}", type_name);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_event_round_trip() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN, 1234, -4321], 24000);
        let event = encode_audio_event(&frame);
        assert_eq!(decode_audio_event(&event, 24000).unwrap(), frame);
    }

    #[test]
    fn test_encoded_payload_is_base64_of_le_bytes() {
        let frame = AudioFrame::new(vec![1, 2], 16000);
        match encode_audio_event(&frame) {
            ControlEvent::InputAudioBufferAppend { audio } => assert_eq!(audio, "AQACAA=="),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_delta() {
        let event = ControlEvent::ResponseAudioDelta {
            delta: "AQACAA==".to_string(),
            response_id: None,
        };
        let frame = decode_audio_event(&event, 24000).unwrap();
        assert_eq!(frame.samples(), &[1, 2]);
        assert_eq!(frame.sample_rate(), 24000);
    }

    #[test]
    fn test_decode_bad_base64() {
        let event = ControlEvent::ResponseAudioDelta {
            delta: "not base64!!".to_string(),
            response_id: None,
        };
        assert!(matches!(decode_audio_event(&event, 24000), Err(RelayError::Frame(_))));
    }

    #[test]
    fn test_decode_truncated_sample() {
        // three bytes = one and a half samples
        let event = ControlEvent::ResponseAudioDelta {
            delta: STANDARD.encode([1u8, 2, 3]),
            response_id: None,
        };
        assert!(matches!(decode_audio_event(&event, 24000), Err(RelayError::Frame(_))));
    }

    #[test]
    fn test_decode_non_audio_event() {
        let event = ControlEvent::InputAudioBufferCommit;
        assert!(matches!(decode_audio_event(&event, 24000), Err(RelayError::Frame(_))));
    }

    #[test]
    fn test_parse_upstream_known_and_unknown() {
        let done = parse_upstream_event(r#"{"type":"response.audio.done","response_id":"r9"}"#).unwrap();
        assert_eq!(
            done,
            Some(ControlEvent::ResponseAudioDone {
                response_id: Some("r9".to_string())
            })
        );

        let transcript = parse_upstream_event(r#"{"type":"response.audio_transcript.delta","delta":"hi"}"#).unwrap();
        assert_eq!(transcript, None);
    }

    #[test]
    fn test_parse_upstream_malformed() {
        assert!(matches!(parse_upstream_event("{oops"), Err(RelayError::Frame(_))));
        assert!(matches!(parse_upstream_event(r#"{"delta":"AA=="}"#), Err(RelayError::Frame(_))));
        // known type, missing required field
        assert!(matches!(
            parse_upstream_event(r#"{"type":"response.audio.delta"}"#),
            Err(RelayError::Frame(_))
        ));
    }

    #[test]
    fn test_device_pass_through_is_verbatim() {
        let text = r#"{"type":"response.create","response":{"modalities":["audio","text"]}}"#;
        let pass = classify_device_text(text).unwrap().unwrap();
        assert_eq!(pass.type_name, "response.create");
        assert_eq!(pass.raw, text);

        for kind in ["input_audio_buffer.clear", "input_audio_buffer.commit"] {
            let text = format!(r#"{{"type":"{}"}}"#, kind);
            assert!(classify_device_text(&text).unwrap().is_some());
        }
    }

    #[test]
    fn test_device_other_types_dropped() {
        assert_eq!(classify_device_text(r#"{"type":"bogus"}"#).unwrap(), None);
        assert_eq!(
            classify_device_text(r#"{"type":"session.update","session":{}}"#).unwrap(),
            None
        );
        assert!(classify_device_text("not json").is_err());
    }
}
