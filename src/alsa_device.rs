//! ALSA PCM device wrappers for capture and playback negotiation.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::{Error, Result};
use crate::frame::SampleFormat;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in sample frames
    pub period_size: usize,
    /// Total device buffer size in sample frames
    pub buffer_size: u64,
}

/// Map a stream sample format to its ALSA little-endian equivalent.
pub(crate) fn alsa_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::L8 => Format::S8,
        SampleFormat::L16 => Format::S16LE,
        SampleFormat::L24 => Format::S243LE,
        SampleFormat::L32 => Format::S32LE,
        SampleFormat::F32 => Format::FloatLE,
        SampleFormat::F64 => Format::Float64LE,
    }
}

/// Open a PCM device for capture (recording).
pub fn open_capture(
    device: &str,
    format: SampleFormat,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
    periods: u32,
) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(
        device,
        Direction::Capture,
        format,
        sample_rate,
        channels,
        period_size,
        periods,
        "Capture",
    )
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    format: SampleFormat,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
    periods: u32,
) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(
        device,
        Direction::Playback,
        format,
        sample_rate,
        channels,
        period_size,
        periods,
        "Playback",
    )
}

#[allow(clippy::too_many_arguments)]
fn open_pcm(
    device: &str,
    direction: Direction,
    format: SampleFormat,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
    periods: u32,
    dir_name: &str,
) -> Result<(PCM, NegotiatedParams)> {
    let pcm = PCM::new(device, direction, false).map_err(|e| {
        Error::Backend(format!(
            "failed to open PCM device '{}' for {}: {}",
            device, dir_name, e
        ))
    })?;

    // Configure hardware parameters. The period size is a hint; the
    // device picks the nearest value it supports.
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(alsa_format(format))?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        if periods > 0 {
            hwp.set_periods(periods, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        NegotiatedParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as u64,
        }
    };

    log::info!(
        "ALSA {}: device={}, format={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        format,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}
