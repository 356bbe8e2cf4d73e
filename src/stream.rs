//! The stream engine: a duplex hardware stream driven by a per-frame
//! callback.
//!
//! Real-time audio I/O runs on a dedicated OS thread (NOT an async task)
//! that owns the PCM handles. Each period it captures one frame, invokes
//! the bound handler synchronously, and renders whatever the handler
//! produced. The handler must return within one frame duration or the
//! device will underrun; that is audible, not fatal.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use alsa::Direction;
use alsa::pcm::PCM;

use crate::alsa_device;
use crate::device;
use crate::error::{Error, Result};
use crate::frame::{self, SampleFormat};

/// Consecutive playback recovery attempts before the rest of a frame is
/// dropped to break a dead loop.
const MAX_WRITE_RETRIES: u32 = 3;

/// Application logic bound to an open stream, invoked once per frame on
/// the real-time thread.
///
/// Any state the handler needs across frames (transform states, queues,
/// counters) lives in the implementing value itself. Returning `None`,
/// or an empty fragment, renders silence for that frame; a fragment of
/// the wrong length is truncated or zero-padded to the frame size.
pub trait FrameHandler: Send {
    /// Exchange one frame: `captured` holds exactly one frame of input
    /// bytes (empty when no input device is configured), `stream_time`
    /// is seconds since the stream started.
    fn on_frame(&mut self, captured: &[u8], stream_time: f64) -> Option<Vec<u8>>;
}

impl<F> FrameHandler for F
where
    F: FnMut(&[u8], f64) -> Option<Vec<u8>> + Send,
{
    fn on_frame(&mut self, captured: &[u8], stream_time: f64) -> Option<Vec<u8>> {
        self(captured, stream_time)
    }
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capture device name, or `None` to disable capture
    pub input_device: Option<String>,
    /// Playback device name, or `None` to disable playback
    pub output_device: Option<String>,
    /// Capture channel count
    pub input_channels: u32,
    /// Playback channel count
    pub output_channels: u32,
    /// Sample format for both directions
    pub sample_format: SampleFormat,
    /// Desired sample rate in Hz (the device may negotiate a nearby rate)
    pub sample_rate: u32,
    /// Frame duration in ms; with the sample rate this fixes the frame size
    pub frame_duration_ms: u32,
    /// Device buffer-count hint (0 = backend default)
    pub periods: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            input_device: Some(device::DEFAULT_DEVICE.to_string()),
            output_device: Some(device::DEFAULT_DEVICE.to_string()),
            input_channels: 1,
            output_channels: 1,
            sample_format: SampleFormat::L16,
            sample_rate: 16000,
            frame_duration_ms: 20,
            periods: 0,
        }
    }
}

/// Everything the real-time thread owns.
struct StreamContext {
    capture: Option<PCM>,
    playback: Option<PCM>,
    handler: Box<dyn FrameHandler>,
    frame_size: usize,
    input_frame_bytes: usize,
    output_frame_bytes: usize,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    samples_processed: Arc<AtomicU64>,
}

struct ActiveStream {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    samples_processed: Arc<AtomicU64>,
    sample_rate: u32,
    latency_frames: u64,
}

/// Owns at most one open duplex stream.
///
/// The engine itself is cheap; most hardware exposes only one usable
/// stream per device, so a process typically keeps a single engine.
pub struct StreamEngine {
    active: Option<ActiveStream>,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Open and start a duplex stream, binding `handler` as the
    /// per-frame callback.
    ///
    /// Validation that needs no hardware (direction and channel counts,
    /// frame sizing, name resolution) happens before any device is
    /// touched; on any failure afterwards every partially-opened device
    /// is released and the engine stays closed. Opening while a stream
    /// is already open fails with [`Error::AlreadyOpen`].
    pub fn open<H: FrameHandler + 'static>(
        &mut self,
        config: &StreamConfig,
        handler: H,
    ) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::AlreadyOpen);
        }
        if config.input_device.is_none() && config.output_device.is_none() {
            return Err(Error::InvalidParameter(
                "at least one of input and output must be enabled".into(),
            ));
        }
        if config.input_device.is_some() && config.input_channels == 0 {
            return Err(Error::InvalidParameter(
                "input_channels must be positive".into(),
            ));
        }
        if config.output_device.is_some() && config.output_channels == 0 {
            return Err(Error::InvalidParameter(
                "output_channels must be positive".into(),
            ));
        }

        let frame_size = frame::frame_size_samples(config.sample_rate, config.frame_duration_ms);
        if frame_size == 0 {
            return Err(Error::InvalidParameter(format!(
                "frame of {} ms at {} Hz is empty",
                config.frame_duration_ms, config.sample_rate
            )));
        }

        let input_id = config
            .input_device
            .as_deref()
            .map(|name| device::resolve(name, Direction::Capture))
            .transpose()?;
        let output_id = config
            .output_device
            .as_deref()
            .map(|name| device::resolve(name, Direction::Playback))
            .transpose()?;

        // Open the configured directions; the frame size is passed down
        // as the period-size hint. A failure on the second open drops
        // the first device on the way out.
        let mut capture = None;
        let mut sample_rate = 0;
        let mut latency_frames = 0;
        if let Some(id) = &input_id {
            let (pcm, params) = alsa_device::open_capture(
                id,
                config.sample_format,
                config.sample_rate,
                config.input_channels,
                frame_size,
                config.periods,
            )?;
            sample_rate = params.sample_rate;
            latency_frames += params.buffer_size;
            capture = Some(pcm);
        }
        let mut playback = None;
        if let Some(id) = &output_id {
            let (pcm, params) = alsa_device::open_playback(
                id,
                config.sample_format,
                config.sample_rate,
                config.output_channels,
                frame_size,
                config.periods,
            )?;
            if sample_rate == 0 {
                sample_rate = params.sample_rate;
            }
            latency_frames += params.buffer_size;
            playback = Some(pcm);
        }

        let running = Arc::new(AtomicBool::new(true));
        let samples_processed = Arc::new(AtomicU64::new(0));

        let ctx = StreamContext {
            input_frame_bytes: if capture.is_some() {
                frame::frame_bytes(frame_size, config.sample_format, config.input_channels)
            } else {
                0
            },
            output_frame_bytes: if playback.is_some() {
                frame::frame_bytes(frame_size, config.sample_format, config.output_channels)
            } else {
                0
            },
            capture,
            playback,
            handler: Box::new(handler),
            frame_size,
            sample_rate,
            running: running.clone(),
            samples_processed: samples_processed.clone(),
        };

        let handle = thread::Builder::new()
            .name("audio-stream".into())
            .spawn(move || stream_thread(ctx))
            .map_err(|e| Error::Backend(format!("failed to spawn stream thread: {}", e)))?;

        log::info!(
            "Stream opened — input: {:?}, output: {:?}, format: {}, rate: {} Hz, frame: {} samples",
            input_id,
            output_id,
            config.sample_format,
            sample_rate,
            frame_size,
        );

        self.active = Some(ActiveStream {
            running,
            handle: Some(handle),
            samples_processed,
            sample_rate,
            latency_frames,
        });
        Ok(())
    }

    /// Stop and tear down the stream. Never fails and may be called on a
    /// closed engine; teardown errors are logged, not surfaced. After
    /// this returns the handler will not be invoked again.
    pub fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.running.store(false, Ordering::SeqCst);
        if let Some(handle) = active.handle.take() {
            if handle.join().is_err() {
                log::warn!("stream thread terminated abnormally");
            }
        }
        log::info!("Stream closed");
    }

    /// Whether a stream is currently open and running.
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Seconds of audio processed since the stream started, advancing
    /// one frame at a time.
    pub fn stream_time(&self) -> Result<f64> {
        let active = self.active()?;
        Ok(active.samples_processed.load(Ordering::Relaxed) as f64 / active.sample_rate as f64)
    }

    /// Device buffering delay in sample frames, summed over the open
    /// directions.
    pub fn stream_latency(&self) -> Result<u64> {
        Ok(self.active()?.latency_frames)
    }

    /// The sample rate the stream actually runs at after negotiation.
    pub fn stream_sample_rate(&self) -> Result<u32> {
        Ok(self.active()?.sample_rate)
    }

    fn active(&self) -> Result<&ActiveStream> {
        self.active
            .as_ref()
            .ok_or_else(|| Error::Backend("stream is not open".into()))
    }
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.close();
    }
}

// ======================== Real-time thread ========================

fn stream_thread(mut ctx: StreamContext) {
    let mut input_buf = vec![0u8; ctx.input_frame_bytes];
    let mut output_buf = vec![0u8; ctx.output_frame_bytes];

    log::info!(
        "Stream thread started: frame={} samples, input={} B, output={} B",
        ctx.frame_size,
        ctx.input_frame_bytes,
        ctx.output_frame_bytes,
    );

    // Device-frame byte widths for converting readi/writei frame counts;
    // frame_size is validated positive before the thread is spawned
    let input_stride = ctx.input_frame_bytes / ctx.frame_size;
    let output_stride = ctx.output_frame_bytes / ctx.frame_size;

    while ctx.running.load(Ordering::Relaxed) {
        if let Some(pcm) = &ctx.capture {
            if !read_frame(pcm, &mut input_buf, input_stride) {
                break;
            }
        }

        let stream_time =
            ctx.samples_processed.load(Ordering::Relaxed) as f64 / ctx.sample_rate as f64;
        exchange_frame(
            ctx.handler.as_mut(),
            &input_buf,
            stream_time,
            &mut output_buf,
        );

        if let Some(pcm) = &ctx.playback {
            if !write_frame(pcm, &output_buf, output_stride) {
                break;
            }
        }

        ctx.samples_processed
            .fetch_add(ctx.frame_size as u64, Ordering::Relaxed);
    }

    // Best-effort teardown: let queued playback finish, swallow errors
    if let Some(pcm) = &ctx.playback {
        if let Err(e) = pcm.drain() {
            log::debug!("playback drain failed on teardown: {}", e);
        }
    }

    log::info!("Stream thread stopped");
}

/// Invoke the handler for one frame and fill the device output buffer.
///
/// The handler runs inside a panic boundary: a fault in handler logic
/// renders silence for this frame only, and the stream keeps running.
/// No errors cross back into the real-time loop.
fn exchange_frame(
    handler: &mut dyn FrameHandler,
    captured: &[u8],
    stream_time: f64,
    output: &mut [u8],
) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_frame(captured, stream_time))) {
        Ok(produced) => frame::fill_output(output, produced.as_deref()),
        Err(_) => {
            log::error!(
                "frame handler panicked at t={:.3}s, substituting silence",
                stream_time
            );
            frame::fill_output(output, None);
        }
    }
}

/// Read exactly one frame of bytes from the capture device, recovering
/// from overruns. `stride` is the byte width of one device frame.
/// Returns false only if recovery itself fails.
fn read_frame(pcm: &PCM, buf: &mut [u8], stride: usize) -> bool {
    let io = pcm.io_bytes();
    let mut filled = 0;
    while filled < buf.len() {
        match io.readi(&mut buf[filled..]) {
            Ok(0) => continue,
            Ok(frames) => filled += frames * stride,
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    return false;
                }
            }
        }
    }
    true
}

/// Write one frame of bytes to the playback device, recovering from
/// underruns. After repeated failed recoveries the rest of the frame is
/// dropped so the loop cannot wedge. Returns false only if recovery
/// itself fails.
fn write_frame(pcm: &PCM, buf: &[u8], stride: usize) -> bool {
    let io = pcm.io_bytes();
    let mut written = 0;
    let mut retries = 0u32;
    while written < buf.len() {
        match io.writei(&buf[written..]) {
            Ok(0) => continue,
            Ok(frames) => {
                written += frames * stride;
                retries = 0;
            }
            Err(e) => {
                log::warn!("ALSA playback error: {}, recovering...", e);
                retries += 1;
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    return false;
                }
                if retries >= MAX_WRITE_RETRIES {
                    log::error!(
                        "Max recovery retries ({}) reached, dropping {} unwritten bytes",
                        retries,
                        buf.len() - written
                    );
                    break;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.input_device.as_deref(), Some("default"));
        assert_eq!(config.output_device.as_deref(), Some("default"));
        assert_eq!(config.input_channels, 1);
        assert_eq!(config.output_channels, 1);
        assert_eq!(config.sample_format, SampleFormat::L16);
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_duration_ms, 20);
    }

    #[test]
    fn open_requires_a_direction() {
        let mut engine = StreamEngine::new();
        let config = StreamConfig {
            input_device: None,
            output_device: None,
            ..StreamConfig::default()
        };
        assert!(matches!(
            engine.open(&config, |_: &[u8], _: f64| -> Option<Vec<u8>> { None }),
            Err(Error::InvalidParameter(_))
        ));
        assert!(!engine.is_open());
    }

    #[test]
    fn open_rejects_empty_frame() {
        let mut engine = StreamEngine::new();
        let config = StreamConfig {
            frame_duration_ms: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(
            engine.open(&config, |_: &[u8], _: f64| -> Option<Vec<u8>> { None }),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn open_rejects_zero_channels() {
        let mut engine = StreamEngine::new();
        let config = StreamConfig {
            input_channels: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(
            engine.open(&config, |_: &[u8], _: f64| -> Option<Vec<u8>> { None }),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn failed_open_leaves_engine_closed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut engine = StreamEngine::new();
        let config = StreamConfig {
            input_device: Some("no-such-device-xyz".to_string()),
            output_device: None,
            ..StreamConfig::default()
        };
        assert!(engine.open(&config, |_: &[u8], _: f64| -> Option<Vec<u8>> { None }).is_err());
        assert!(!engine.is_open());
        assert!(engine.stream_time().is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut engine = StreamEngine::new();
        assert!(!engine.is_open());
        engine.close();
        engine.close();
        assert!(!engine.is_open());
    }

    #[test]
    fn queries_fail_while_closed() {
        let engine = StreamEngine::new();
        assert!(matches!(engine.stream_time(), Err(Error::Backend(_))));
        assert!(matches!(engine.stream_latency(), Err(Error::Backend(_))));
        assert!(matches!(engine.stream_sample_rate(), Err(Error::Backend(_))));
    }

    #[test]
    fn exchange_copies_exact_frame() {
        let mut handler = |captured: &[u8], _t: f64| Some(captured.to_vec());
        let mut out = [0u8; 4];
        exchange_frame(&mut handler, &[1, 2, 3, 4], 0.0, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn exchange_truncates_and_pads() {
        let mut oversized = |_: &[u8], _: f64| Some(vec![7u8; 10]);
        let mut out = [0u8; 4];
        exchange_frame(&mut oversized, &[], 0.0, &mut out);
        assert_eq!(out, [7, 7, 7, 7]);

        let mut short = |_: &[u8], _: f64| Some(vec![9u8; 2]);
        let mut out = [0xffu8; 4];
        exchange_frame(&mut short, &[], 0.0, &mut out);
        assert_eq!(out, [9, 9, 0, 0]);
    }

    #[test]
    fn exchange_silences_on_no_output() {
        let mut handler = |_: &[u8], _: f64| -> Option<Vec<u8>> { None };
        let mut out = [0xffu8; 4];
        exchange_frame(&mut handler, &[], 0.0, &mut out);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn panicking_handler_yields_silence_then_recovers() {
        let mut calls = 0u32;
        let mut handler = move |_: &[u8], _: f64| {
            calls += 1;
            if calls == 1 {
                panic!("handler fault");
            }
            Some(vec![5u8; 4])
        };

        let mut out = [0xffu8; 4];
        exchange_frame(&mut handler, &[], 0.0, &mut out);
        assert_eq!(out, [0; 4], "faulting frame must render silence");

        exchange_frame(&mut handler, &[], 0.02, &mut out);
        assert_eq!(out, [5; 4], "stream must keep exchanging frames");
    }

    #[test]
    fn handler_trait_object_receives_stream_time() {
        struct Recorder {
            times: Vec<f64>,
        }
        impl FrameHandler for Recorder {
            fn on_frame(&mut self, _captured: &[u8], stream_time: f64) -> Option<Vec<u8>> {
                self.times.push(stream_time);
                None
            }
        }

        let mut recorder = Recorder { times: Vec::new() };
        let mut out = [0u8; 2];
        exchange_frame(&mut recorder, &[], 0.0, &mut out);
        exchange_frame(&mut recorder, &[], 0.02, &mut out);
        assert_eq!(recorder.times, vec![0.0, 0.02]);
    }
}
