//! Frame-format contract shared by the stream engine and its callbacks.
//!
//! A frame is the fixed-size chunk of audio exchanged on every callback
//! tick, sized from the sample rate and the configured frame duration.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Sample encoding for a stream, named by its wire tag.
///
/// Integer formats are little-endian signed samples, interleaved by
/// channel; float formats are IEEE-754 little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 8-bit signed integer ("l8")
    L8,
    /// 16-bit signed integer ("l16")
    L16,
    /// 24-bit signed integer, 3 bytes packed ("l24")
    L24,
    /// 32-bit signed integer ("l32")
    L32,
    /// 32-bit float ("f32")
    F32,
    /// 64-bit float ("f64")
    F64,
}

/// All supported formats, in tag order.
pub const SAMPLE_FORMATS: [SampleFormat; 6] = [
    SampleFormat::L8,
    SampleFormat::L16,
    SampleFormat::L24,
    SampleFormat::L32,
    SampleFormat::F32,
    SampleFormat::F64,
];

impl SampleFormat {
    /// Size of one sample of this format in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::L8 => 1,
            SampleFormat::L16 => 2,
            SampleFormat::L24 => 3,
            SampleFormat::L32 => 4,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// The string tag for this format.
    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::L8 => "l8",
            SampleFormat::L16 => "l16",
            SampleFormat::L24 => "l24",
            SampleFormat::L32 => "l32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        SAMPLE_FORMATS
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "invalid format \"{}\", must be one of \"l8\", \"l16\", \"l24\", \"l32\", \"f32\", \"f64\"",
                    s
                ))
            })
    }
}

/// Number of sample frames exchanged per callback tick.
///
/// Integer division truncates: a `(sample_rate, frame_duration_ms)` pair
/// whose product is not divisible by 1000 silently loses the fractional
/// part, so callers should pick exactly divisible values.
pub fn frame_size_samples(sample_rate: u32, frame_duration_ms: u32) -> usize {
    (sample_rate as u64 * frame_duration_ms as u64 / 1000) as usize
}

/// Bytes in one frame for a single direction.
pub fn frame_bytes(frame_size: usize, format: SampleFormat, channels: u32) -> usize {
    frame_size * format.bytes_per_sample() * channels as usize
}

/// Copy handler-produced audio into a device output buffer.
///
/// Produced bytes are truncated to the buffer length, and any remainder
/// of the buffer is zeroed. No produced audio (or an empty fragment)
/// zero-fills the whole buffer, so the device never renders stale or
/// undefined bytes.
pub fn fill_output(output: &mut [u8], produced: Option<&[u8]>) {
    let copied = match produced {
        Some(data) if !data.is_empty() => {
            let n = data.len().min(output.len());
            output[..n].copy_from_slice(&data[..n]);
            n
        }
        _ => 0,
    };
    output[copied..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_exact_pairs() {
        assert_eq!(frame_size_samples(16000, 20), 320);
        assert_eq!(frame_size_samples(16000, 15), 240);
        assert_eq!(frame_size_samples(8000, 7), 56);
        assert_eq!(frame_size_samples(8000, 1), 8);
        assert_eq!(frame_size_samples(48000, 20), 960);
    }

    #[test]
    fn frame_size_truncates() {
        // 22050 * 33 / 1000 = 727.65
        assert_eq!(frame_size_samples(22050, 33), 727);
        // 44100 * 1 / 1000 = 44.1
        assert_eq!(frame_size_samples(44100, 1), 44);
    }

    #[test]
    fn frame_bytes_scales_with_format_and_channels() {
        assert_eq!(frame_bytes(320, SampleFormat::L16, 1), 640);
        assert_eq!(frame_bytes(320, SampleFormat::L16, 2), 1280);
        assert_eq!(frame_bytes(320, SampleFormat::F64, 1), 2560);
        assert_eq!(frame_bytes(320, SampleFormat::L24, 2), 1920);
    }

    #[test]
    fn format_tags_round_trip() {
        for f in SAMPLE_FORMATS {
            assert_eq!(f.as_str().parse::<SampleFormat>().unwrap(), f);
        }
        assert!("pcm".parse::<SampleFormat>().is_err());
        assert!("L16".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn fill_output_truncates_oversized() {
        let mut out = [0xffu8; 4];
        fill_output(&mut out, Some(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn fill_output_pads_short_with_zeros() {
        let mut out = [0xffu8; 6];
        fill_output(&mut out, Some(&[9, 8]));
        assert_eq!(out, [9, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn fill_output_silences_on_none_or_empty() {
        let mut out = [0xffu8; 4];
        fill_output(&mut out, None);
        assert_eq!(out, [0; 4]);

        let mut out = [0xffu8; 4];
        fill_output(&mut out, Some(&[]));
        assert_eq!(out, [0; 4]);
    }
}
