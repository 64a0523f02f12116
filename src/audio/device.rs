//! Audio device lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::{AudioError, PermissionError};

/// Summary of a device for listings
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
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

    devices
}

fn find_by_name(
    devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> Option<cpal::Device> {
    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Resolve a capture device by id (`input:<name>` or bare name), or the default.
///
/// Failing to find one is a permission problem from the caller's point of
/// view: the capture-dependent feature cannot start.
pub fn capture_device(id: Option<&str>) -> Result<cpal::Device, PermissionError> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_input_device()
            .ok_or(PermissionError::NoCaptureDevice),
        Some(id) => {
            let name = id.strip_prefix("input:").unwrap_or(id);
            let devices = host
                .input_devices()
                .map_err(|e| PermissionError::Denied(e.to_string()))?;
            find_by_name(devices, name).ok_or_else(|| PermissionError::DeviceNotFound(id.to_string()))
        }
    }
}

/// Resolve a playback device by id (`output:<name>` or bare name), or the default.
pub fn playback_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(id) => {
            let name = id.strip_prefix("output:").unwrap_or(id);
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            find_by_name(devices, name).ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
        }
    }
}
