//! Stateful audio transforms: codec encode/decode, resampling, noise
//! preprocessing, and echo cancellation.
//!
//! Every operation takes a little-endian 16-bit PCM byte fragment plus an
//! optional state from a previous call and returns the output fragment
//! together with the state for reuse. A state is created on first use
//! (creation parameters are validated then, and only then) and is owned by
//! the caller; passing a state of the wrong kind is a hard error, never a
//! silent re-creation.

use std::fmt;

use crate::error::{Error, Result};
use crate::speex;

/// Default resampler conversion quality.
pub const DEFAULT_RESAMPLE_QUALITY: u32 = 3;

/// Which transform a [`TransformState`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Encoder,
    Decoder,
    Resampler,
    Preprocessor,
    EchoCanceller,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransformKind::Encoder => "encoder",
            TransformKind::Decoder => "decoder",
            TransformKind::Resampler => "resampler",
            TransformKind::Preprocessor => "preprocessor",
            TransformKind::EchoCanceller => "echo canceller",
        })
    }
}

/// Caller-owned state of one transform instance.
///
/// The kind is fixed at creation; each operation accepts only its own
/// kind. Dropping the state releases the native resources.
pub enum TransformState {
    Encoder(speex::Encoder),
    Decoder(speex::Decoder),
    Resampler(speex::Resampler),
    Preprocessor(speex::Preprocessor),
    EchoCanceller(speex::EchoCanceller),
}

impl TransformState {
    pub fn kind(&self) -> TransformKind {
        match self {
            TransformState::Encoder(_) => TransformKind::Encoder,
            TransformState::Decoder(_) => TransformKind::Decoder,
            TransformState::Resampler(_) => TransformKind::Resampler,
            TransformState::Preprocessor(_) => TransformKind::Preprocessor,
            TransformState::EchoCanceller(_) => TransformKind::EchoCanceller,
        }
    }
}

impl fmt::Debug for TransformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformState::{}", self.kind())
    }
}

fn mismatch(expected: TransformKind, found: &TransformState) -> Error {
    Error::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

/// Reinterpret a byte fragment as little-endian i16 PCM samples.
fn pcm_from_bytes(fragment: &[u8]) -> Result<Vec<i16>> {
    if fragment.len() % 2 != 0 {
        return Err(Error::InvalidParameter(format!(
            "PCM fragment length must be a multiple of 2, got {}",
            fragment.len()
        )));
    }
    Ok(fragment
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Encode one PCM frame to a compressed payload.
///
/// `sample_rate` selects the codec mode (8000, 16000 or 32000 Hz) and is
/// used only when no `state` is supplied. The fragment must be exactly
/// one codec frame at that mode.
pub fn encode(
    fragment: &[u8],
    sample_rate: u32,
    state: Option<TransformState>,
) -> Result<(Vec<u8>, TransformState)> {
    let mut enc = match state {
        Some(TransformState::Encoder(enc)) => enc,
        Some(other) => return Err(mismatch(TransformKind::Encoder, &other)),
        None => speex::Encoder::new(sample_rate)?,
    };
    let pcm = pcm_from_bytes(fragment)?;
    let payload = enc.encode(&pcm)?;
    Ok((payload, TransformState::Encoder(enc)))
}

/// Decode one compressed payload back to a PCM frame.
///
/// The output is always exactly one codec frame for the mode the state
/// was created at, regardless of payload size.
pub fn decode(
    fragment: &[u8],
    sample_rate: u32,
    state: Option<TransformState>,
) -> Result<(Vec<u8>, TransformState)> {
    let mut dec = match state {
        Some(TransformState::Decoder(dec)) => dec,
        Some(other) => return Err(mismatch(TransformKind::Decoder, &other)),
        None => speex::Decoder::new(sample_rate)?,
    };
    let pcm = dec.decode(fragment)?;
    Ok((pcm_to_bytes(&pcm), TransformState::Decoder(dec)))
}

/// Convert the sample rate of a mono PCM fragment.
///
/// `input_rate`, `output_rate` and `quality` (0-10, default 3) are used
/// only when no `state` is supplied; a reused state keeps the rates it
/// was created with. The output carries only the samples the resampler
/// actually produced, which may differ from the exact ratio by the
/// state's output margin.
pub fn resample(
    fragment: &[u8],
    input_rate: u32,
    output_rate: u32,
    quality: Option<u32>,
    state: Option<TransformState>,
) -> Result<(Vec<u8>, TransformState)> {
    let mut rs = match state {
        Some(TransformState::Resampler(rs)) => rs,
        Some(other) => return Err(mismatch(TransformKind::Resampler, &other)),
        None => speex::Resampler::new(
            1,
            input_rate,
            output_rate,
            quality.unwrap_or(DEFAULT_RESAMPLE_QUALITY),
        )?,
    };
    let pcm = pcm_from_bytes(fragment)?;

    // Size for the exact rate conversion plus the state's margin for
    // native rounding; only the produced prefix is returned.
    let capacity = (pcm.len() * rs.output_rate() as usize).div_ceil(rs.input_rate() as usize)
        + rs.output_margin();
    let mut out = vec![0i16; capacity];
    let (_, produced) = rs.process_int(0, &pcm, &mut out)?;
    out.truncate(produced as usize);

    Ok((pcm_to_bytes(&out), TransformState::Resampler(rs)))
}

/// Apply denoise/AGC conditioning to a copy of one PCM frame.
///
/// `frame_size` (samples) and `sampling_rate` are used only when no
/// `state` is supplied; the fragment must always be exactly one frame.
pub fn preprocess(
    fragment: &[u8],
    frame_size: usize,
    sampling_rate: u32,
    state: Option<TransformState>,
) -> Result<(Vec<u8>, TransformState)> {
    let mut pp = match state {
        Some(TransformState::Preprocessor(pp)) => pp,
        Some(other) => return Err(mismatch(TransformKind::Preprocessor, &other)),
        None => speex::Preprocessor::new(frame_size, sampling_rate)?,
    };
    let mut pcm = pcm_from_bytes(fragment)?;
    pp.process(&mut pcm)?;
    Ok((pcm_to_bytes(&pcm), TransformState::Preprocessor(pp)))
}

/// Remove played-back audio from a captured frame.
///
/// Both fragments must be the same length, exactly `frame_size` samples;
/// the cleaned frame has the same length as the captured one.
/// `frame_size` and `filter_length` (adaptive filter memory, in samples)
/// are used only when no `state` is supplied.
pub fn cancel_echo(
    captured: &[u8],
    played: &[u8],
    frame_size: usize,
    filter_length: usize,
    state: Option<TransformState>,
) -> Result<(Vec<u8>, TransformState)> {
    let mut aec = match state {
        Some(TransformState::EchoCanceller(aec)) => aec,
        Some(other) => return Err(mismatch(TransformKind::EchoCanceller, &other)),
        None => speex::EchoCanceller::new(frame_size, filter_length)?,
    };
    let cap = pcm_from_bytes(captured)?;
    let play = pcm_from_bytes(played)?;
    let cleaned = aec.cancel(&cap, &play)?;
    Ok((pcm_to_bytes(&cleaned), TransformState::EchoCanceller(aec)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_frame(samples: usize) -> Vec<u8> {
        // A low-amplitude ramp, enough signal for the codec to chew on
        pcm_to_bytes(
            &(0..samples)
                .map(|i| ((i as i32 % 64) - 32) as i16 * 100)
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn encode_decode_round_trip_keeps_frame_length() {
        for (rate, frame) in [(8000u32, 160usize), (16000, 320), (32000, 640)] {
            let input = pcm_frame(frame);
            let (payload, enc) = encode(&input, rate, None).unwrap();
            assert!(!payload.is_empty());
            assert!(payload.len() < input.len());

            let (output, dec) = decode(&payload, rate, None).unwrap();
            assert_eq!(output.len(), input.len());

            // Reuse both states for a second frame
            let (payload2, _) = encode(&input, 0, Some(enc)).unwrap();
            let (output2, _) = decode(&payload2, 0, Some(dec)).unwrap();
            assert_eq!(output2.len(), input.len());
        }
    }

    #[test]
    fn encode_validates_rate_only_on_creation() {
        assert!(matches!(
            encode(&pcm_frame(160), 44100, None),
            Err(Error::InvalidParameter(_))
        ));
        // With an existing state the rate argument is ignored
        let (_, enc) = encode(&pcm_frame(160), 8000, None).unwrap();
        assert!(encode(&pcm_frame(160), 44100, Some(enc)).is_ok());
    }

    #[test]
    fn encode_rejects_wrong_frame_length() {
        assert!(matches!(
            encode(&pcm_frame(100), 8000, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn odd_length_fragment_is_rejected() {
        assert!(matches!(
            encode(&[0u8; 321], 8000, None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            resample(&[0u8; 11], 8000, 16000, None, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn wrong_kind_state_is_a_type_mismatch() {
        let (_, enc) = encode(&pcm_frame(160), 8000, None).unwrap();
        let err = decode(&[0u8; 20], 8000, Some(enc)).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: TransformKind::Decoder,
                found: TransformKind::Encoder,
            }
        ));

        let (_, enc) = encode(&pcm_frame(160), 8000, None).unwrap();
        assert!(matches!(
            resample(&pcm_frame(160), 8000, 16000, None, Some(enc)),
            Err(Error::TypeMismatch { .. })
        ));

        // Kind is checked before any creation-parameter validation
        let (_, pp) = preprocess(&pcm_frame(160), 160, 8000, None).unwrap();
        assert!(matches!(
            cancel_echo(&pcm_frame(160), &pcm_frame(160), 0, 0, Some(pp)),
            Err(Error::TypeMismatch {
                expected: TransformKind::EchoCanceller,
                found: TransformKind::Preprocessor,
            })
        ));
    }

    #[test]
    fn resample_doubles_within_margin() {
        let input = pcm_frame(160);
        let (output, rs) = resample(&input, 8000, 16000, None, None).unwrap();
        let out_samples = output.len() / 2;
        assert!(out_samples > 0);
        assert!(out_samples <= 320 + speex::DEFAULT_OUTPUT_MARGIN);

        // Steady state: a primed converter keeps the exact 1:2 ratio
        // within a few samples of filter delay
        let (output2, _) = resample(&input, 0, 0, None, Some(rs)).unwrap();
        let out2 = output2.len() / 2;
        assert!((300..=330).contains(&out2), "got {}", out2);
    }

    #[test]
    fn resample_requires_rates_on_creation() {
        assert!(matches!(
            resample(&pcm_frame(160), 0, 16000, None, None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            resample(&pcm_frame(160), 8000, 0, None, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn preprocess_keeps_frame_length() {
        let input = pcm_frame(160);
        let (output, pp) = preprocess(&input, 160, 8000, None).unwrap();
        assert_eq!(output.len(), input.len());

        // Wrong frame length against an existing state
        assert!(matches!(
            preprocess(&pcm_frame(80), 0, 0, Some(pp)),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn preprocess_requires_creation_parameters() {
        assert!(matches!(
            preprocess(&pcm_frame(160), 0, 8000, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn cancel_echo_keeps_frame_length() {
        let captured = pcm_frame(160);
        let played = pcm_frame(160);
        let (cleaned, aec) = cancel_echo(&captured, &played, 160, 1024, None).unwrap();
        assert_eq!(cleaned.len(), captured.len());

        // Mismatched fragment lengths are rejected
        assert!(matches!(
            cancel_echo(&captured, &pcm_frame(80), 0, 0, Some(aec)),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn tuned_preprocessor_state_is_reusable() {
        let mut pp = speex::Preprocessor::new(160, 8000).unwrap();
        pp.set_denoise(true);
        pp.set_noise_suppress(-25);
        pp.set_agc(true);
        pp.set_agc_level(24000.0);

        let input = pcm_frame(160);
        let (output, state) =
            preprocess(&input, 0, 0, Some(TransformState::Preprocessor(pp))).unwrap();
        assert_eq!(output.len(), input.len());
        assert_eq!(state.kind(), TransformKind::Preprocessor);
    }
}
