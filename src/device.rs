//! Hardware device enumeration and name resolution.
//!
//! Devices are discovered through the ALSA PCM name-hint namespace and
//! probed per direction for their capabilities. Descriptors are
//! snapshots: ordering and content are backend-defined and stable only
//! within one process session.

use alsa::device_name::HintIter;
use alsa::pcm::{HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::alsa_device::alsa_format;
use crate::error::{Error, Result};
use crate::frame::{SAMPLE_FORMATS, SampleFormat};

/// Identifier of the underlying audio API.
pub const BACKEND_NAME: &str = "linux-alsa";

/// Device id of the backend's default device, in either direction.
pub const DEFAULT_DEVICE: &str = "default";

/// Conventional hardware rates tested against each device's supported range.
const PROBE_RATES: [u32; 14] = [
    4000, 5512, 8000, 9600, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
];

/// Snapshot of one enumerated device's capabilities.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Device name, usable as an id for [`resolve`] and stream open
    pub name: String,
    /// Whether the backend could query the device at all; all other
    /// capability fields are meaningful only when this is true
    pub probed: bool,
    /// Maximum capture channels (0 if capture is unsupported)
    pub input_channels: u32,
    /// Maximum playback channels (0 if playback is unsupported)
    pub output_channels: u32,
    /// Channels usable simultaneously in both directions
    pub duplex_channels: u32,
    pub is_default_input: bool,
    pub is_default_output: bool,
    /// Supported sample rates, ascending
    pub sample_rates: Vec<u32>,
    /// Sample formats the device accepts natively
    pub native_formats: Vec<SampleFormat>,
}

struct DirectionCaps {
    channels: u32,
    rates: Vec<u32>,
    formats: Vec<SampleFormat>,
}

/// Query one direction of a device. `None` means the device could not be
/// opened or queried in this direction.
///
/// Each rate and format is probed against a fresh constraint space so
/// one restriction cannot mask another.
fn probe_direction(name: &str, direction: Direction) -> Option<DirectionCaps> {
    let pcm = PCM::new(name, direction, true).ok()?;

    let channels = HwParams::any(&pcm).ok()?.get_channels_max().ok()?;
    let rates = PROBE_RATES
        .into_iter()
        .filter(|&r| {
            HwParams::any(&pcm)
                .map(|hwp| hwp.set_rate(r, ValueOr::Nearest).is_ok())
                .unwrap_or(false)
        })
        .collect();
    let formats = SAMPLE_FORMATS
        .into_iter()
        .filter(|&f| {
            HwParams::any(&pcm)
                .map(|hwp| hwp.set_format(alsa_format(f)).is_ok())
                .unwrap_or(false)
        })
        .collect();

    Some(DirectionCaps {
        channels,
        rates,
        formats,
    })
}

/// Enumerate the available audio devices and their capabilities.
///
/// Per-device probe failures are reported as `probed = false`, not as an
/// error; only a failure to enumerate at all fails the call.
pub fn list_devices() -> Result<Vec<DeviceDescriptor>> {
    let hints = HintIter::new_str(None, "pcm")
        .map_err(|e| Error::Backend(format!("failed to enumerate PCM devices: {}", e)))?;

    let mut devices = Vec::new();
    for hint in hints {
        let Some(name) = hint.name else { continue };

        let input = match hint.direction {
            None | Some(Direction::Capture) => probe_direction(&name, Direction::Capture),
            _ => None,
        };
        let output = match hint.direction {
            None | Some(Direction::Playback) => probe_direction(&name, Direction::Playback),
            _ => None,
        };

        let probed = input.is_some() || output.is_some();
        let input_channels = input.as_ref().map_or(0, |c| c.channels);
        let output_channels = output.as_ref().map_or(0, |c| c.channels);

        let mut sample_rates: Vec<u32> = Vec::new();
        let mut native_formats: Vec<SampleFormat> = Vec::new();
        for caps in input.iter().chain(output.iter()) {
            sample_rates.extend(&caps.rates);
            for f in &caps.formats {
                if !native_formats.contains(f) {
                    native_formats.push(*f);
                }
            }
        }
        sample_rates.sort_unstable();
        sample_rates.dedup();

        devices.push(DeviceDescriptor {
            is_default_input: input.is_some() && name == DEFAULT_DEVICE,
            is_default_output: output.is_some() && name == DEFAULT_DEVICE,
            duplex_channels: input_channels.min(output_channels),
            name,
            probed,
            input_channels,
            output_channels,
            sample_rates,
            native_formats,
        });
    }

    Ok(devices)
}

/// Exact, case-sensitive name lookup among probed devices; first match wins.
fn find_by_name<'a>(devices: &'a [DeviceDescriptor], name: &str) -> Option<&'a DeviceDescriptor> {
    devices.iter().find(|d| d.probed && d.name == name)
}

/// Resolve a device name to the id to open a stream with.
///
/// `"default"` maps straight to the backend's default device for the
/// given direction; any other name must match an enumerated, probed
/// device exactly.
pub fn resolve(name: &str, direction: Direction) -> Result<String> {
    if name == DEFAULT_DEVICE {
        return Ok(DEFAULT_DEVICE.to_string());
    }

    let devices = list_devices()?;
    match find_by_name(&devices, name) {
        Some(dev) => {
            log::debug!("resolved device '{}' for {:?}", dev.name, direction);
            Ok(dev.name.clone())
        }
        None => Err(Error::DeviceNotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, probed: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            probed,
            input_channels: 2,
            output_channels: 2,
            duplex_channels: 2,
            is_default_input: false,
            is_default_output: false,
            sample_rates: vec![8000, 16000, 48000],
            native_formats: vec![SampleFormat::L16],
        }
    }

    #[test]
    fn default_resolves_without_enumeration() {
        assert_eq!(
            resolve("default", Direction::Capture).unwrap(),
            "default"
        );
        assert_eq!(
            resolve("default", Direction::Playback).unwrap(),
            "default"
        );
    }

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        let devices = [descriptor("hw:0,0", true), descriptor("plughw:0,0", true)];
        assert!(find_by_name(&devices, "hw:0,0").is_some());
        assert!(find_by_name(&devices, "HW:0,0").is_none());
        assert!(find_by_name(&devices, "hw:0").is_none());
    }

    #[test]
    fn lookup_skips_unprobed_devices() {
        let devices = [descriptor("hw:0,0", false), descriptor("hw:0,0", true)];
        let found = find_by_name(&devices, "hw:0,0").unwrap();
        assert!(found.probed);
    }

    #[test]
    fn lookup_takes_first_match() {
        let mut first = descriptor("dup", true);
        first.input_channels = 1;
        let second = descriptor("dup", true);
        let devices = [first, second];
        assert_eq!(find_by_name(&devices, "dup").unwrap().input_channels, 1);
    }

    #[test]
    fn backend_name_is_fixed() {
        assert_eq!(BACKEND_NAME, "linux-alsa");
    }
}
