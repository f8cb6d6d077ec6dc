//! # Voice Frame Codec
//!
//! Converts between float sample buffers and the transport payload of a `voice` message.
//!
//! ## Payload Format:
//! - **Samples**: 16-bit signed PCM, little-endian, mono
//! - **Encoding**: standard base64 alphabet with padding, so it fits a JSON string
//! - **Rate**: fixed (44.1 kHz by default) on both ends, never negotiated
//!
//! ## Quantization:
//! Encoding clamps to [-1.0, 1.0] and scales by 32767 with rounding, so full scale maps to
//! ±32767 and never wraps. Decoding divides by 32768, which keeps every decoded value
//! inside [-1.0, 1.0).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use std::time::Duration;

/// Why a payload could not be decoded. Always confined to the one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    InvalidBase64(String),
    /// PCM16 needs an even number of bytes
    OddLength(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidBase64(msg) => write!(f, "Invalid base64 payload: {}", msg),
            CodecError::OddLength(len) => {
                write!(f, "PCM16 payload has odd byte length {}", len)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for crate::error::ClientError {
    fn from(err: CodecError) -> Self {
        crate::error::ClientError::Protocol(err.to_string())
    }
}

/// Voice frame encoder/decoder for one fixed sample rate.
#[derive(Debug, Clone, Copy)]
pub struct VoiceCodec {
    sample_rate: u32,
}

impl VoiceCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Quantize float samples and wrap them as a transport payload.
    pub fn encode(&self, samples: &[f32]) -> String {
        let pcm = float_to_pcm(samples);
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            // Writing into a Vec cannot fail
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }
        STANDARD.encode(bytes)
    }

    /// Unwrap a transport payload back into float samples.
    pub fn decode(&self, payload: &str) -> Result<Vec<f32>, CodecError> {
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
        if bytes.len() % 2 != 0 {
            return Err(CodecError::OddLength(bytes.len()));
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Ok(pcm_to_float(&samples))
    }

    /// Playback length of `sample_count` mono samples.
    pub fn duration_of(&self, sample_count: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(sample_count as f64 / self.sample_rate as f64)
    }
}

/// Scales from float range [-1.0, 1.0] to 16-bit integer range [-32767, 32767].
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            // NaN clamps to NaN; treat it as silence
            let sample = if sample.is_nan() { 0.0 } else { sample };
            (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
        })
        .collect()
}

/// Scales from 16-bit integer range [-32768, 32767] to float range [-1.0, 1.0).
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_clamps_and_rounds() {
        assert_eq!(
            float_to_pcm(&[0.0, 1.0, -1.0, 1.5, -3.0, 0.5, f32::NAN]),
            vec![0, 32767, -32767, 32767, -32767, 16384, 0]
        );
    }

    #[test]
    fn test_payload_is_little_endian_base64() {
        let codec = VoiceCodec::new(44_100);
        // 1.0 -> 32767 = 0x7FFF -> bytes [FF, 7F]
        let payload = codec.encode(&[1.0]);
        assert_eq!(payload, STANDARD.encode([0xFF, 0x7F]));
        assert_eq!(codec.encode(&[]), "");
    }

    #[test]
    fn test_decode_stays_within_tolerance() {
        let codec = VoiceCodec::new(44_100);
        let original: Vec<f32> = (0..441)
            .map(|i| (i as f32 * 0.07).sin() * 0.8)
            .collect();
        let decoded = codec.decode(&codec.encode(&original)).unwrap();

        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1.0 / 16_000.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let codec = VoiceCodec::new(44_100);
        assert!(matches!(
            codec.decode("not base64!"),
            Err(CodecError::InvalidBase64(_))
        ));
        let odd = STANDARD.encode([1u8, 2, 3]);
        assert_eq!(codec.decode(&odd), Err(CodecError::OddLength(3)));
    }

    #[test]
    fn test_frame_duration() {
        let codec = VoiceCodec::new(44_100);
        assert_eq!(codec.duration_of(4410), Duration::from_millis(100));
        assert_eq!(VoiceCodec::new(0).duration_of(10), Duration::ZERO);
    }
}
