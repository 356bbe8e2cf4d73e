//! voiceio - real-time duplex audio capture/playback with a speech
//! processing pipeline.
//!
//! Uses ALSA for audio I/O and Speex/SpeexDSP for encoding/decoding,
//! resampling, noise suppression, and acoustic echo cancellation.
//!
//! A [`StreamEngine`] opens one duplex stream and invokes a
//! [`FrameHandler`] once per frame period with the captured audio,
//! rendering whatever the handler returns. The [`transform`] operations
//! are independent of the engine: they run wherever the handler composes
//! them.
//!
//! ```no_run
//! use voiceio::{StreamConfig, StreamEngine};
//!
//! let mut engine = StreamEngine::new();
//! engine.open(&StreamConfig::default(), |captured: &[u8], _time: f64| {
//!     // loop the microphone straight back to the speaker
//!     Some(captured.to_vec())
//! })?;
//! // ... stream runs until closed
//! engine.close();
//! # Ok::<(), voiceio::Error>(())
//! ```

mod alsa_device;
pub mod device;
mod error;
pub mod frame;
pub mod speex;
pub mod stream;
pub mod transform;

pub use alsa::Direction;
pub use device::{BACKEND_NAME, DeviceDescriptor, list_devices, resolve};
pub use error::{Error, Result};
pub use frame::SampleFormat;
pub use stream::{FrameHandler, StreamConfig, StreamEngine};
pub use transform::{
    TransformKind, TransformState, cancel_echo, decode, encode, preprocess, resample,
};
