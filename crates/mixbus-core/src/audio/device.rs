//! Audio device enumeration
//!
//! Devices are enumerated from ALL available cpal hosts (ALSA, JACK,
//! PulseAudio, WASAPI...) so the user can pick any of them for any slot.
//! A single [`AudioDevice`] describes both capture and playback capabilities;
//! the engine filters the list per direction down to stereo-capable devices.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};
use serde::{Deserialize, Serialize};

use super::error::{AudioError, AudioResult};
use crate::types::{Direction, CHANNELS};

/// Stable device handle
///
/// Includes both the device name and the host backend, so the same hardware
/// exposed through two hosts can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device name as reported by the system
    pub name: String,
    /// Audio host label (e.g., "ALSA", "JACK", "CoreAudio")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }

    pub fn with_host(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: Some(host.to_string()),
        }
    }

    /// Label that includes the host if available
    pub fn display_label(&self) -> String {
        match &self.host {
            Some(host) => format!("[{}] {}", host, self.name),
            None => self.name.clone(),
        }
    }
}

/// Information about an audio device
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDevice {
    /// Handle used to open streams
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Host backend label (e.g., "ALSA", "JACK")
    pub host: String,
    /// Maximum capture channels (0 = output only)
    pub max_input_channels: u16,
    /// Maximum playback channels (0 = input only)
    pub max_output_channels: u16,
}

impl AudioDevice {
    /// Whether the device can run a stereo stream in this direction
    pub fn supports(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.max_input_channels >= CHANNELS,
            Direction::Output => self.max_output_channels >= CHANNELS,
        }
    }

    /// Short name for meters and selectors
    ///
    /// Drops parenthesized and bracketed qualifiers from the device name
    /// ("Speakers (Realtek Audio) [hw:0,0]" becomes "Speakers") and appends
    /// the host label.
    pub fn display_name(&self) -> String {
        let base = strip_qualifiers(&self.name);
        if self.host.is_empty() {
            base
        } else {
            format!("{} {}", base, self.host)
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.host)
    }
}

/// Remove `(...)` and `[...]` groups and trim the rest
fn strip_qualifiers(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Devices usable as a stereo stream in the given direction, in list order
pub fn compatible_devices(devices: &[AudioDevice], direction: Direction) -> Vec<AudioDevice> {
    devices
        .iter()
        .filter(|d| d.supports(direction))
        .cloned()
        .collect()
}

/// Get a human-readable name for a host ID
pub(crate) fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        "Asio" => "ASIO".to_string(),
        _ => name,
    }
}

/// Get a host by its display label
fn get_host_by_name(name: &str) -> Option<Host> {
    cpal::available_hosts()
        .into_iter()
        .find(|id| host_name(*id) == name)
        .and_then(|id| cpal::host_from_id(id).ok())
}

/// Largest channel count over a device's supported configs in one direction
fn max_channels(device: &cpal::Device, direction: Direction) -> u16 {
    let channels = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|configs| configs.map(|c| c.channels()).max()),
        Direction::Output => device
            .supported_output_configs()
            .map(|configs| configs.map(|c| c.channels()).max()),
    };
    channels.ok().flatten().unwrap_or(0)
}

/// Enumerate devices from every available cpal host
pub fn enumerate_cpal_devices() -> AudioResult<Vec<AudioDevice>> {
    let mut all_devices: Vec<AudioDevice> = Vec::new();
    let mut hosts_ok = 0usize;

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("Could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };

        let host_label = host_name(host_id);

        let devices_iter = match host.devices() {
            Ok(d) => d,
            Err(e) => {
                log::debug!("Could not enumerate devices for {:?}: {}", host_id, e);
                continue;
            }
        };
        hosts_ok += 1;

        for device in devices_iter {
            let name = match device.name() {
                Ok(n) => n,
                Err(_) => continue,
            };

            let max_input_channels = max_channels(&device, Direction::Input);
            let max_output_channels = max_channels(&device, Direction::Output);
            if max_input_channels == 0 && max_output_channels == 0 {
                continue;
            }

            all_devices.push(AudioDevice {
                id: DeviceId::with_host(&name, &host_label),
                name,
                host: host_label.clone(),
                max_input_channels,
                max_output_channels,
            });
        }
    }

    if hosts_ok == 0 {
        return Err(AudioError::Enumeration("no audio host could list devices".into()));
    }

    all_devices.sort_by(|a, b| a.host.cmp(&b.host).then_with(|| a.name.cmp(&b.name)));

    log::info!(
        "Enumerated {} audio devices from {} hosts",
        all_devices.len(),
        hosts_ok
    );

    Ok(all_devices)
}

/// Find a cpal device by its ID for the given direction
///
/// Uses the host named in the DeviceId if present, otherwise searches all hosts.
pub fn find_cpal_device(id: &DeviceId, direction: Direction) -> AudioResult<cpal::Device> {
    let find_in = |host: &Host| -> Option<cpal::Device> {
        let mut devices: Box<dyn Iterator<Item = cpal::Device>> = match direction {
            Direction::Input => Box::new(host.input_devices().ok()?),
            Direction::Output => Box::new(host.output_devices().ok()?),
        };
        devices.find(|d| d.name().ok().as_deref() == Some(id.name.as_str()))
    };

    if let Some(ref host_label) = id.host {
        if let Some(host) = get_host_by_name(host_label) {
            return find_in(&host).ok_or_else(|| AudioError::DeviceNotFound(id.display_label()));
        }
    }

    cpal::available_hosts()
        .into_iter()
        .filter_map(|host_id| cpal::host_from_id(host_id).ok())
        .find_map(|host| find_in(&host))
        .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()))
}
