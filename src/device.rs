//! Audio device catalog
//!
//! Devices are enumerated once and never mutated. Streams keep a [`DeviceId`]
//! only and look the [`Device`] up again when they need to open it.
//!
//! [`CpalCatalog`] walks every cpal host, so ALSA/JACK/PulseAudio devices on
//! Linux and WASAPI endpoints on Windows all show up in one list.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::HostId;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Index of a device inside the [`DeviceList`] it was enumerated into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

/// Category a device is listed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Input,
    Output,
    /// Captures what is being sent to an output (system/application audio)
    Loopback,
    /// Software endpoint we write into (e.g. "CABLE Input")
    VirtualInput,
    /// Software endpoint other applications write into (e.g. "CABLE Output")
    VirtualOutput,
}

/// Native direction of the endpoint, used to resolve it at the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// An enumerated audio endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Host backend name (e.g. "ALSA", "WASAPI")
    pub host: String,
    pub kind: DeviceKind,
    pub direction: Direction,
    pub channels: u16,
    pub default_sample_rate: u32,
}

/// Snapshot of the devices known to the catalog
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<Device>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device, assigning it the next id
    pub fn push(
        &mut self,
        name: impl Into<String>,
        host: impl Into<String>,
        kind: DeviceKind,
        direction: Direction,
        channels: u16,
        default_sample_rate: u32,
    ) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(Device {
            id,
            name: name.into(),
            host: host.into(),
            kind,
            direction,
            channels,
            default_sample_rate,
        });
        id
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    /// Look a device up by display name within one category
    pub fn by_name(&self, kind: DeviceKind, name: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.kind == kind && d.name == name)
    }

    pub fn of_kind(&self, kind: DeviceKind) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(move |d| d.kind == kind)
    }

    /// First device of a category, used when nothing was selected
    pub fn first_of(&self, kind: DeviceKind) -> Option<&Device> {
        self.of_kind(kind).next()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

/// Source of enumerated devices. The engine reads it at startup and on refresh.
pub trait DeviceCatalog: Send {
    fn enumerate(&self) -> StreamResult<DeviceList>;
}

/// A fixed list acts as its own catalog
impl DeviceCatalog for DeviceList {
    fn enumerate(&self) -> StreamResult<DeviceList> {
        Ok(self.clone())
    }
}

const VIRTUAL_MARKERS: &[&str] = &["VB-Audio", "CABLE", "Virtual"];
const LOOPBACK_MARKERS: &[&str] = &["Monitor of", "Loopback", "Stereo Mix"];

fn contains_any(name: &str, markers: &[&str]) -> bool {
    let lower = name.to_lowercase();
    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
}

/// Classify a device by direction and display name
pub fn classify(name: &str, direction: Direction) -> DeviceKind {
    match direction {
        Direction::Input if contains_any(name, VIRTUAL_MARKERS) => DeviceKind::VirtualOutput,
        Direction::Input if contains_any(name, LOOPBACK_MARKERS) => DeviceKind::Loopback,
        Direction::Input => DeviceKind::Input,
        Direction::Output if contains_any(name, VIRTUAL_MARKERS) => DeviceKind::VirtualInput,
        Direction::Output => DeviceKind::Output,
    }
}

/// Human-readable name for a cpal host
pub fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

/// Hosts whose output endpoints can be opened for capture (loopback)
pub fn supports_output_loopback(host: &str) -> bool {
    host == "WASAPI"
}

/// Enumerates devices from every available cpal host
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalCatalog;

impl DeviceCatalog for CpalCatalog {
    fn enumerate(&self) -> StreamResult<DeviceList> {
        let mut list = DeviceList::new();

        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(h) => h,
                Err(e) => {
                    log::debug!("Could not initialize host {:?}: {}", host_id, e);
                    continue;
                }
            };
            let host_str = host_name(host_id);

            match host.input_devices() {
                Ok(devices) => {
                    for device in devices {
                        let Ok(name) = device.name() else { continue };
                        let Ok(config) = device.default_input_config() else {
                            continue;
                        };
                        list.push(
                            name.clone(),
                            host_str.clone(),
                            classify(&name, Direction::Input),
                            Direction::Input,
                            config.channels(),
                            config.sample_rate().0,
                        );
                    }
                }
                Err(e) => log::debug!("Could not enumerate inputs for {:?}: {}", host_id, e),
            }

            match host.output_devices() {
                Ok(devices) => {
                    for device in devices {
                        let Ok(name) = device.name() else { continue };
                        let Ok(config) = device.default_output_config() else {
                            continue;
                        };
                        let kind = classify(&name, Direction::Output);
                        list.push(
                            name.clone(),
                            host_str.clone(),
                            kind,
                            Direction::Output,
                            config.channels(),
                            config.sample_rate().0,
                        );
                        if kind == DeviceKind::Output && supports_output_loopback(&host_str) {
                            list.push(
                                name,
                                host_str.clone(),
                                DeviceKind::Loopback,
                                Direction::Output,
                                config.channels(),
                                config.sample_rate().0,
                            );
                        }
                    }
                }
                Err(e) => log::debug!("Could not enumerate outputs for {:?}: {}", host_id, e),
            }
        }

        if list.is_empty() {
            return Err(StreamError::DeviceUnavailable(
                "No audio devices found".to_string(),
            ));
        }

        log::info!("Enumerated {} audio device(s)", list.len());
        Ok(list)
    }
}
