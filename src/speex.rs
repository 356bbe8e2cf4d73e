//! Safe wrappers around the Speex codec and SpeexDSP's preprocessor,
//! resampler, and echo canceller.
//!
//! Each wrapper owns one native state object and releases it on drop.

use std::ffi::{c_char, c_int, c_void};
use std::mem::MaybeUninit;

use crate::error::{Error, Result};

// ======================== FFI declarations ========================

/// Opaque type for a Speex codec mode descriptor
#[repr(C)]
pub struct SpeexMode {
    _private: [u8; 0],
}

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexEchoState
#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

/// Bit-packing accumulator used by the codec, layout per speex_bits.h.
#[repr(C)]
struct SpeexBits {
    chars: *mut c_char,
    nb_bits: c_int,
    char_ptr: c_int,
    bit_ptr: c_int,
    owner: c_int,
    overflow: c_int,
    buf_size: c_int,
    reserved1: c_int,
    reserved2: *mut c_void,
}

// Codec request constants
const SPEEX_GET_FRAME_SIZE: c_int = 3;

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

// Resampler constants
const RESAMPLER_ERR_SUCCESS: c_int = 0;

// Codec mode ids for speex_lib_get_mode
const SPEEX_MODEID_NB: c_int = 0;
const SPEEX_MODEID_WB: c_int = 1;
const SPEEX_MODEID_UWB: c_int = 2;

unsafe extern "C" {
    fn speex_lib_get_mode(mode: c_int) -> *const SpeexMode;

    fn speex_bits_init(bits: *mut SpeexBits);
    fn speex_bits_destroy(bits: *mut SpeexBits);
    fn speex_bits_reset(bits: *mut SpeexBits);
    fn speex_bits_read_from(bits: *mut SpeexBits, chars: *const c_char, len: c_int);
    fn speex_bits_nbytes(bits: *mut SpeexBits) -> c_int;
    fn speex_bits_write(bits: *mut SpeexBits, chars: *mut c_char, max_len: c_int) -> c_int;

    fn speex_encoder_init(mode: *const SpeexMode) -> *mut c_void;
    fn speex_encoder_destroy(state: *mut c_void);
    fn speex_encoder_ctl(state: *mut c_void, request: c_int, ptr: *mut c_void) -> c_int;
    fn speex_encode_int(state: *mut c_void, input: *mut i16, bits: *mut SpeexBits) -> c_int;

    fn speex_decoder_init(mode: *const SpeexMode) -> *mut c_void;
    fn speex_decoder_destroy(state: *mut c_void);
    fn speex_decoder_ctl(state: *mut c_void, request: c_int, ptr: *mut c_void) -> c_int;
    fn speex_decode_int(state: *mut c_void, bits: *mut SpeexBits, output: *mut i16) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;

    fn speex_preprocess_state_init(
        frame_size: c_int,
        sampling_rate: c_int,
    ) -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_echo_state_init(frame_size: c_int, filter_length: c_int) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_cancellation(
        st: *mut SpeexEchoState,
        rec: *const i16,
        play: *const i16,
        out: *mut i16,
    );
}

/// Select the codec mode for a sample rate: 8000 Hz narrowband,
/// 16000 Hz wideband, 32000 Hz ultra-wideband.
fn mode_for_rate(sample_rate: u32) -> Result<*const SpeexMode> {
    let mode_id = match sample_rate {
        8000 => SPEEX_MODEID_NB,
        16000 => SPEEX_MODEID_WB,
        32000 => SPEEX_MODEID_UWB,
        _ => {
            return Err(Error::InvalidParameter(
                "invalid or missing sample_rate argument, must be 8000, 16000 or 32000".into(),
            ));
        }
    };
    let mode = unsafe { speex_lib_get_mode(mode_id) };
    if mode.is_null() {
        return Err(Error::Backend(format!(
            "codec mode for {} Hz is unavailable",
            sample_rate
        )));
    }
    Ok(mode)
}

fn new_bits() -> SpeexBits {
    let mut bits = MaybeUninit::<SpeexBits>::uninit();
    unsafe {
        speex_bits_init(bits.as_mut_ptr());
        bits.assume_init()
    }
}

// ======================== Encoder ========================

/// Speex encoder for one fixed-size PCM frame per call.
pub struct Encoder {
    state: *mut c_void,
    bits: SpeexBits,
    sample_rate: u32,
    frame_size: usize,
}

// The native state is used from a single thread only
unsafe impl Send for Encoder {}

impl Encoder {
    /// Create an encoder for one of the supported mode rates.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let mode = mode_for_rate(sample_rate)?;
        let state = unsafe { speex_encoder_init(mode) };
        if state.is_null() {
            return Err(Error::Backend("failed to create encoder state".into()));
        }

        let mut frame_size: c_int = 0;
        unsafe {
            speex_encoder_ctl(
                state,
                SPEEX_GET_FRAME_SIZE,
                &mut frame_size as *mut c_int as *mut c_void,
            );
        }
        if frame_size <= 0 {
            unsafe { speex_encoder_destroy(state) };
            return Err(Error::Backend("internal error in getting frame size".into()));
        }

        Ok(Self {
            state,
            bits: new_bits(),
            sample_rate,
            frame_size: frame_size as usize,
        })
    }

    /// Mode sample rate this encoder was created for.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of PCM samples consumed per frame (160/320/640).
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode exactly one PCM frame into a compressed payload.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != self.frame_size {
            return Err(Error::InvalidParameter(format!(
                "encoder frame must be exactly {} samples, got {}",
                self.frame_size,
                pcm.len()
            )));
        }

        unsafe {
            speex_bits_reset(&mut self.bits);
            speex_encode_int(self.state, pcm.as_ptr() as *mut i16, &mut self.bits);

            let nbytes = speex_bits_nbytes(&mut self.bits).max(0);
            let mut out = vec![0u8; nbytes as usize];
            let written =
                speex_bits_write(&mut self.bits, out.as_mut_ptr() as *mut c_char, nbytes).max(0);
            out.truncate(written as usize);
            Ok(out)
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        unsafe {
            speex_encoder_destroy(self.state);
            speex_bits_destroy(&mut self.bits);
        }
    }
}

// ======================== Decoder ========================

/// Speex decoder producing one fixed-size PCM frame per payload.
pub struct Decoder {
    state: *mut c_void,
    bits: SpeexBits,
    sample_rate: u32,
}

unsafe impl Send for Decoder {}

impl Decoder {
    /// Create a decoder for one of the supported mode rates.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let mode = mode_for_rate(sample_rate)?;
        let state = unsafe { speex_decoder_init(mode) };
        if state.is_null() {
            return Err(Error::Backend("failed to create decoder state".into()));
        }
        Ok(Self {
            state,
            bits: new_bits(),
            sample_rate,
        })
    }

    /// Mode sample rate this decoder was created for.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode one compressed payload into exactly one PCM frame.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        unsafe {
            speex_bits_read_from(
                &mut self.bits,
                payload.as_ptr() as *const c_char,
                payload.len() as c_int,
            );

            let mut frame_size: c_int = 0;
            speex_decoder_ctl(
                self.state,
                SPEEX_GET_FRAME_SIZE,
                &mut frame_size as *mut c_int as *mut c_void,
            );
            if frame_size <= 0 {
                return Err(Error::Backend("internal error in getting frame size".into()));
            }

            let mut out = vec![0i16; frame_size as usize];
            // A negative return means end-of-stream or a corrupt payload;
            // the decoder still emits a concealment frame of full size.
            let _ = speex_decode_int(self.state, &mut self.bits, out.as_mut_ptr());
            Ok(out)
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        unsafe {
            speex_decoder_destroy(self.state);
            speex_bits_destroy(&mut self.bits);
        }
    }
}

// ======================== Resampler ========================

/// Default extra output capacity to absorb native rounding, in samples.
pub const DEFAULT_OUTPUT_MARGIN: usize = 100;

/// Safe wrapper around SpeexResamplerState.
pub struct Resampler {
    state: *mut SpeexResamplerState,
    input_rate: u32,
    output_rate: u32,
    margin: usize,
}

unsafe impl Send for Resampler {}

impl Resampler {
    /// Create a new resampler.
    ///
    /// * `channels` - Number of channels
    /// * `in_rate`  - Input sample rate
    /// * `out_rate` - Output sample rate
    /// * `quality`  - Conversion quality, 0 (fastest) to 10 (best)
    pub fn new(channels: u32, in_rate: u32, out_rate: u32, quality: u32) -> Result<Self> {
        if in_rate == 0 || out_rate == 0 {
            return Err(Error::InvalidParameter(
                "invalid or missing input_rate or output_rate argument".into(),
            ));
        }
        if quality > 10 {
            return Err(Error::InvalidParameter(format!(
                "resampler quality must be 0..=10, got {}",
                quality
            )));
        }

        let mut err: c_int = 0;
        let state =
            unsafe { speex_resampler_init(channels, in_rate, out_rate, quality as c_int, &mut err) };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            return Err(Error::Backend(format!(
                "failed to create resampler state: err={}",
                err
            )));
        }
        Ok(Self {
            state,
            input_rate: in_rate,
            output_rate: out_rate,
            margin: DEFAULT_OUTPUT_MARGIN,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Extra output capacity reserved beyond the rate-converted size.
    pub fn output_margin(&self) -> usize {
        self.margin
    }

    /// Override the output margin, an empirical constant of the native
    /// resampler's rounding behavior.
    pub fn set_output_margin(&mut self, samples: usize) {
        self.margin = samples;
    }

    /// Resample a single channel of 16-bit PCM data.
    ///
    /// Returns `(input_samples_consumed, output_samples_produced)`.
    pub fn process_int(
        &mut self,
        channel: u32,
        input: &[i16],
        output: &mut [i16],
    ) -> Result<(u32, u32)> {
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_int(
                self.state,
                channel,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            return Err(Error::Backend(format!("resampler error: {}", err)));
        }
        Ok((in_len, out_len))
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}

// ======================== Preprocessor (denoise + AGC) ========================

/// Safe wrapper around SpeexPreprocessState for noise suppression and AGC.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
    sample_rate: u32,
}

unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> Result<Self> {
        if frame_size == 0 || sample_rate == 0 {
            return Err(Error::InvalidParameter(
                "invalid or missing frame_size or sampling_rate argument".into(),
            ));
        }
        let state =
            unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            return Err(Error::Backend("failed to create preprocess state".into()));
        }
        Ok(Self {
            state,
            frame_size,
            sample_rate,
        })
    }

    /// Frame size in samples this preprocessor was created for.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Enable or disable denoising.
    pub fn set_denoise(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_DENOISE,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set noise suppress level in dB (negative value, e.g. -25).
    pub fn set_noise_suppress(&mut self, level: i32) {
        let mut val: c_int = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_NOISE_SUPPRESS,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Enable or disable automatic gain control.
    pub fn set_agc(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_AGC,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set AGC level (target signal level).
    pub fn set_agc_level(&mut self, level: f32) {
        let mut val: f32 = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_AGC_LEVEL,
                &mut val as *mut f32 as *mut c_void,
            );
        }
    }

    /// Run the preprocessor on one frame of 16-bit PCM mono samples.
    /// The samples are modified in place and must be exactly one frame.
    pub fn process(&mut self, samples: &mut [i16]) -> Result<()> {
        if samples.len() != self.frame_size {
            return Err(Error::InvalidParameter(format!(
                "preprocess frame must be exactly {} samples, got {}",
                self.frame_size,
                samples.len()
            )));
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
        Ok(())
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Echo canceller ========================

/// Safe wrapper around SpeexEchoState for acoustic echo cancellation.
pub struct EchoCanceller {
    state: *mut SpeexEchoState,
    frame_size: usize,
    filter_length: usize,
}

unsafe impl Send for EchoCanceller {}

impl EchoCanceller {
    /// Create a new echo canceller.
    ///
    /// * `frame_size`    - Samples per processed frame
    /// * `filter_length` - Adaptive filter memory in samples (typically
    ///   100-500 ms worth of audio)
    pub fn new(frame_size: usize, filter_length: usize) -> Result<Self> {
        if frame_size == 0 || filter_length == 0 {
            return Err(Error::InvalidParameter(
                "invalid or missing frame_size or filter_length argument".into(),
            ));
        }
        let state = unsafe { speex_echo_state_init(frame_size as c_int, filter_length as c_int) };
        if state.is_null() {
            return Err(Error::Backend(
                "failed to create echo cancellation state".into(),
            ));
        }
        Ok(Self {
            state,
            frame_size,
            filter_length,
        })
    }

    /// Frame size in samples this canceller was created for.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn filter_length(&self) -> usize {
        self.filter_length
    }

    /// Remove the played reference signal from the captured frame.
    /// Both frames must be exactly one frame long; the cleaned frame has
    /// the same length.
    pub fn cancel(&mut self, captured: &[i16], played: &[i16]) -> Result<Vec<i16>> {
        if captured.len() != self.frame_size || played.len() != self.frame_size {
            return Err(Error::InvalidParameter(format!(
                "echo cancellation frames must both be exactly {} samples, got {} and {}",
                self.frame_size,
                captured.len(),
                played.len()
            )));
        }
        let mut out = vec![0i16; self.frame_size];
        unsafe {
            speex_echo_cancellation(
                self.state,
                captured.as_ptr(),
                played.as_ptr(),
                out.as_mut_ptr(),
            );
        }
        Ok(out)
    }
}

impl Drop for EchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_frame_size_follows_mode() {
        assert_eq!(Encoder::new(8000).unwrap().frame_size(), 160);
        assert_eq!(Encoder::new(16000).unwrap().frame_size(), 320);
        assert_eq!(Encoder::new(32000).unwrap().frame_size(), 640);
    }

    #[test]
    fn codec_rejects_unsupported_rates() {
        assert!(matches!(
            Encoder::new(44100),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(Decoder::new(0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn encoder_rejects_short_frame() {
        let mut enc = Encoder::new(8000).unwrap();
        assert!(matches!(
            enc.encode(&[0i16; 80]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn resampler_validates_creation_parameters() {
        assert!(matches!(
            Resampler::new(1, 0, 16000, 3),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Resampler::new(1, 8000, 16000, 11),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn preprocessor_rejects_wrong_frame_length() {
        let mut pp = Preprocessor::new(160, 8000).unwrap();
        assert!(pp.process(&mut [0i16; 160]).is_ok());
        assert!(matches!(
            pp.process(&mut [0i16; 161]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn echo_canceller_keeps_frame_length() {
        let mut aec = EchoCanceller::new(160, 1024).unwrap();
        let cleaned = aec.cancel(&[0i16; 160], &[0i16; 160]).unwrap();
        assert_eq!(cleaned.len(), 160);
        assert!(matches!(
            aec.cancel(&[0i16; 160], &[0i16; 80]),
            Err(Error::InvalidParameter(_))
        ));
    }
}
