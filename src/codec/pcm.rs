//! PCM16 codec
//!
//! Converts between normalized `f32` samples and 16-bit little-endian PCM,
//! and wraps outbound frames in the base64 + mime envelope the live service
//! expects.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{INPUT_MIME_TYPE, INPUT_SAMPLE_RATE};
use crate::error::CodecError;

/// Scale between normalized floats and PCM16
const PCM16_SCALE: f32 = 32768.0;

/// Encoded outbound audio frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudioPacket {
    /// Base64 PCM16 payload
    pub data: String,
    /// Format tag, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Send order
    #[serde(skip)]
    pub sequence: u64,
}

impl EncodedAudioPacket {
    /// Sample rate declared by the mime tag
    pub fn sample_rate(&self) -> Option<u32> {
        sample_rate_from_mime(&self.mime_type)
    }
}

/// Convert one normalized sample to PCM16, clamping out-of-range input.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (clamped * PCM16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Serialize samples as PCM16 little-endian bytes
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample_to_i16(sample));
    }
    buf.freeze()
}

/// Parse PCM16 little-endian bytes back to normalized samples
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::InvalidLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Encode a capture frame for the live service (mono, 16 kHz).
pub fn encode(samples: &[f32], sequence: u64) -> EncodedAudioPacket {
    EncodedAudioPacket {
        data: STANDARD.encode(encode_pcm16(samples)),
        mime_type: INPUT_MIME_TYPE.to_string(),
        sequence,
    }
}

/// Decode a base64 PCM16 payload
pub fn decode(payload: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    decode_pcm16(&bytes)
}

/// Extract the `rate=` parameter from an `audio/pcm` mime tag.
pub fn sample_rate_from_mime(mime: &str) -> Option<u32> {
    let mut parts = mime.split(';').map(str::trim);
    let kind = parts.next()?;
    if !kind.eq_ignore_ascii_case("audio/pcm") && !kind.eq_ignore_ascii_case("audio/l16") {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// Mime tag for outbound frames at an arbitrary rate
pub fn mime_for_rate(sample_rate: u32) -> String {
    if sample_rate == INPUT_SAMPLE_RATE {
        INPUT_MIME_TYPE.to_string()
    } else {
        format!("audio/pcm;rate={}", sample_rate)
    }
}
