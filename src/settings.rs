use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{DeviceRole, EngineConfig, KeybindTable};

const APP_DIR: &str = "soundboard-rs";
const DEFAULT_MAX_FILE_LENGTH: Duration = Duration::from_secs(30);

/// Returns the config directory: `~/.config/soundboard-rs`
fn config_dir() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path
}

/// Returns the path to the settings file: `~/.config/soundboard-rs/settings.json`
fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_recordings_dir() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path.push("recordings");
    path
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted application settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // Devices, by display name
    pub devices: BTreeMap<DeviceRole, String>,

    // Streams
    pub sample_rate: u32,
    pub frames_per_buffer: u32,
    pub max_file_length_secs: f64,
    pub recordings_dir: PathBuf,

    // Hotkeys
    pub midi_port: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),

            sample_rate: 48000,
            frames_per_buffer: 256,
            max_file_length_secs: DEFAULT_MAX_FILE_LENGTH.as_secs_f64(),
            recordings_dir: default_recordings_dir(),

            midi_port: None,
        }
    }
}

impl AppSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        self.save_to(&settings_path());
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Failed to write settings: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }

    /// Typed engine configuration derived from these settings
    pub fn engine_config(&self) -> EngineConfig {
        let max_file_length = Duration::try_from_secs_f64(self.max_file_length_secs)
            .unwrap_or_else(|e| {
                log::warn!(
                    "Invalid max_file_length_secs {} ({}), using {:?}",
                    self.max_file_length_secs,
                    e,
                    DEFAULT_MAX_FILE_LENGTH
                );
                DEFAULT_MAX_FILE_LENGTH
            });
        EngineConfig {
            sample_rate: self.sample_rate,
            frames_per_buffer: self.frames_per_buffer,
            max_file_length,
            recordings_dir: self.recordings_dir.clone(),
            preferred: self.devices.clone(),
        }
    }
}

/// Persistence boundary for the keybind table
pub trait KeybindStore: Send {
    fn load(&self) -> Result<KeybindTable, SettingsError>;
    fn save(&self, table: &KeybindTable) -> Result<(), SettingsError>;
}

/// Keybinds as a JSON document: keycode string to entry
pub struct JsonBindStore {
    path: PathBuf,
}

impl JsonBindStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `keybinds.json` next to `settings.json`
    pub fn default_location() -> Self {
        Self::new(config_dir().join("keybinds.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeybindStore for JsonBindStore {
    /// A missing file is an empty table
    fn load(&self) -> Result<KeybindTable, SettingsError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No keybinds at {}, starting empty", self.path.display());
                return Ok(KeybindTable::new());
            }
            Err(e) => return Err(e.into()),
        };
        let table: KeybindTable = serde_json::from_str(&contents)?;
        log::info!("Loaded {} keybinds from {}", table.len(), self.path.display());
        Ok(table)
    }

    fn save(&self, table: &KeybindTable) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(table)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
