//! Audio device enumeration and selection
//!
//! Devices are identified as `input:<name>` or `output:<name>`. A bare
//! name is accepted and looked up in the direction being opened.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::frame::SAMPLE_RATE;
use crate::error::AudioError;
use crate::protocol::AudioDeviceInfo;

/// Longest wait for a device thread to report its stream open
pub const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Devices to open for the next call; `None` means the host default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub input: Option<String>,
    pub output: Option<String>,
}

impl DeviceSelection {
    pub fn new(input: Option<String>, output: Option<String>) -> Self {
        Self {
            input: normalize(input),
            output: normalize(output),
        }
    }
}

fn normalize(id: Option<String>) -> Option<String> {
    id.filter(|id| !id.trim().is_empty())
}

/// List all available audio devices
///
/// A device that is both an input and an output is reported once, under
/// its input id.
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        id: format!("output:{}", name),
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

/// Strip the direction prefix from a device id
pub fn device_name(id: &str) -> &str {
    id.strip_prefix("input:")
        .or_else(|| id.strip_prefix("output:"))
        .unwrap_or(id)
}

/// Open the capture device by id, or the default input device
pub fn input_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(id) => {
            let devices = host
                .input_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            find_by_name(devices, id)
        }
    }
}

/// Open the playback device by id, or the default output device
pub fn output_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(id) => {
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            find_by_name(devices, id)
        }
    }
}

/// Pick a 44.1 kHz config from what a device supports
///
/// Fewest channels wins; the streams downmix or duplicate to mono.
pub(crate) fn pick_config(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let rate = cpal::SampleRate(SAMPLE_RATE);
    ranges
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter(|range| format_rank(range.sample_format()).is_some())
        .min_by_key(|range| (range.channels(), format_rank(range.sample_format())))
        .map(|range| range.with_sample_rate(rate))
        .ok_or_else(|| {
            AudioError::UnsupportedConfig(format!("no {} Hz i16/f32/u16 stream", SAMPLE_RATE))
        })
}

fn format_rank(format: cpal::SampleFormat) -> Option<u8> {
    match format {
        cpal::SampleFormat::I16 => Some(0),
        cpal::SampleFormat::F32 => Some(1),
        cpal::SampleFormat::U16 => Some(2),
        _ => None,
    }
}

fn find_by_name(
    devices: impl Iterator<Item = cpal::Device>,
    id: &str,
) -> Result<cpal::Device, AudioError> {
    let wanted = device_name(id);
    devices
        .into_iter()
        .find(|device| device.name().map_or(false, |name| name == wanted))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_strips_direction() {
        assert_eq!(device_name("input:USB Mic"), "USB Mic");
        assert_eq!(device_name("output:Speakers"), "Speakers");
        assert_eq!(device_name("Speakers"), "Speakers");
    }

    #[test]
    fn test_selection_treats_blank_as_default() {
        let selection = DeviceSelection::new(Some("  ".into()), Some("output:Speakers".into()));
        assert_eq!(selection.input, None);
        assert_eq!(selection.output.as_deref(), Some("output:Speakers"));
    }

    fn range(channels: u16, min: u32, max: u32, format: cpal::SampleFormat) -> cpal::SupportedStreamConfigRange {
        cpal::SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_pick_config_prefers_mono_i16() {
        let config = pick_config(
            vec![
                range(2, 44_100, 48_000, cpal::SampleFormat::I16),
                range(1, 8_000, 96_000, cpal::SampleFormat::F32),
                range(1, 8_000, 96_000, cpal::SampleFormat::I16),
            ]
            .into_iter(),
        )
        .unwrap();
        assert_eq!(config.channels(), 1);
        assert_eq!(config.sample_format(), cpal::SampleFormat::I16);
        assert_eq!(config.sample_rate(), cpal::SampleRate(SAMPLE_RATE));
    }

    #[test]
    fn test_pick_config_rejects_wrong_rate() {
        let result = pick_config(vec![range(1, 48_000, 48_000, cpal::SampleFormat::F32)].into_iter());
        assert!(matches!(result, Err(AudioError::UnsupportedConfig(_))));
    }

    #[test]
    fn test_listed_ids_carry_direction() {
        // Hosts without audio hardware simply list nothing
        for device in list_devices() {
            assert!(device.id.starts_with("input:") || device.id.starts_with("output:"));
            assert!(device.is_input || device.is_output);
        }
    }
}
