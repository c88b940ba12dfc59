//! Stream engine - device roles, stream lifecycle and hotkey dispatch
//!
//! The engine is an ordinary value owned by one control thread. It maps each
//! logical device role to an enumerated [`Device`], owns the five stream
//! instances built from those roles, owns the keybind table, and turns
//! hotkey edges into stream starts and stops.
//!
//! Every reset follows the same order: request stop, wait for the callback to
//! acknowledge (bounded), close the driver binding, then build the
//! replacement.

mod handle;
mod keybinds;

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{
    AudioDriver, CaptureOptions, CaptureStream, PassthroughStream, PlaybackRole, PlaybackStream,
    Recording, StreamConfig,
};
use crate::device::{Device, DeviceCatalog, DeviceId, DeviceKind, DeviceList};
use crate::effects::EffectSettings;
use crate::error::{StreamError, StreamResult};
use crate::settings::{KeybindStore, SettingsError};

pub use handle::{EngineCommand, EngineHandle};
pub use keybinds::{ActionKind, CaptureFlags, KeybindEntry, KeybindTable, Keycode, Trigger};

/// Logical device slot the user picks a device for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceRole {
    Input,
    Output,
    Loopback,
    VirtualInput,
    VirtualOutput,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 5] = [
        Self::Input,
        Self::Output,
        Self::Loopback,
        Self::VirtualInput,
        Self::VirtualOutput,
    ];

    /// Catalog category devices for this role are picked from
    pub fn kind(self) -> DeviceKind {
        match self {
            Self::Input => DeviceKind::Input,
            Self::Output => DeviceKind::Output,
            Self::Loopback => DeviceKind::Loopback,
            Self::VirtualInput => DeviceKind::VirtualInput,
            Self::VirtualOutput => DeviceKind::VirtualOutput,
        }
    }
}

/// Which recorder produced a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Input,
    Loopback,
}

impl CaptureSource {
    fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Loopback => "loopback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub frames_per_buffer: u32,
    pub max_file_length: Duration,
    pub recordings_dir: PathBuf,
    /// Device display name per role; roles without one use the first device
    /// of their category
    pub preferred: BTreeMap<DeviceRole, String>,
}

/// A hotkey edge from the external hotkey source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyEvent {
    pub keycode: Keycode,
    pub pressed: bool,
}

impl HotkeyEvent {
    pub fn press(keycode: Keycode) -> Self {
        Self {
            keycode,
            pressed: true,
        }
    }

    pub fn release(keycode: Keycode) -> Self {
        Self {
            keycode,
            pressed: false,
        }
    }
}

/// Notifications for the control layer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Devices enumerated and default streams built
    Ready,
    /// A listening bind received its key
    BindCaptured { keycode: Keycode, kind: ActionKind },
    RecordingFinished {
        keycode: Option<Keycode>,
        source: CaptureSource,
        recording: Recording,
    },
    PlaybackFinished { role: PlaybackRole, path: PathBuf },
    /// A device disappeared mid-stream
    StreamAborted(String),
    Error(String),
}

/// What the next key press will be bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingBind {
    /// Move an existing entry to the pressed key
    Rebind(Keycode),
    New(ActionKind),
}

pub struct StreamEngine {
    driver: Box<dyn AudioDriver>,
    catalog: Box<dyn DeviceCatalog>,
    store: Box<dyn KeybindStore>,
    config: EngineConfig,
    stream_config: StreamConfig,

    devices: DeviceList,
    selected: BTreeMap<DeviceRole, DeviceId>,

    input_recorder: Option<CaptureStream>,
    loopback_recorder: Option<CaptureStream>,
    passthrough: Option<PassthroughStream>,
    player: Option<PlaybackStream>,
    monitor: Option<PlaybackStream>,

    keybinds: KeybindTable,
    pending: Option<PendingBind>,
    /// Bind whose recording is in progress
    recording_key: Option<Keycode>,
    /// Bind whose voice effects are applied
    voice_key: Option<Keycode>,
    /// Soundboard bind whose sample is playing
    playing_key: Option<Keycode>,

    events: VecDeque<EngineEvent>,
    ready: bool,
}

impl StreamEngine {
    /// Enumerate devices, load keybinds and build every stream.
    ///
    /// Only enumeration failure is fatal. A stream that cannot be built is
    /// reported as an [`EngineEvent::Error`] and left empty.
    pub fn new(
        driver: Box<dyn AudioDriver>,
        catalog: Box<dyn DeviceCatalog>,
        store: Box<dyn KeybindStore>,
        config: EngineConfig,
    ) -> StreamResult<Self> {
        let devices = catalog.enumerate()?;
        log::info!("Enumerated {} audio devices", devices.len());

        let keybinds = store.load().unwrap_or_else(|e| {
            log::warn!("Failed to load keybinds ({}), starting empty", e);
            KeybindTable::new()
        });

        let stream_config = StreamConfig::new(config.sample_rate, config.frames_per_buffer);
        let mut engine = Self {
            driver,
            catalog,
            store,
            config,
            stream_config,
            devices,
            selected: BTreeMap::new(),
            input_recorder: None,
            loopback_recorder: None,
            passthrough: None,
            player: None,
            monitor: None,
            keybinds,
            pending: None,
            recording_key: None,
            voice_key: None,
            playing_key: None,
            events: VecDeque::new(),
            ready: false,
        };

        let preferred = engine.config.preferred.clone();
        engine.select_defaults(&preferred);

        let resets: [(&str, fn(&mut Self) -> StreamResult<()>); 5] = [
            ("input recorder", Self::reset_input_recorder),
            ("loopback recorder", Self::reset_loopback_recorder),
            ("passthrough", Self::reset_passthrough),
            ("player", Self::reset_player),
            ("monitor", Self::reset_monitor),
        ];
        for (name, reset) in resets {
            if let Err(e) = reset(&mut engine) {
                engine.report(format!("Failed to build {}", name), e);
            }
        }

        engine.ready = true;
        engine.events.push_back(EngineEvent::Ready);
        log::info!("Stream engine ready");
        Ok(engine)
    }

    /// True once construction has finished
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    pub fn keybinds(&self) -> &KeybindTable {
        &self.keybinds
    }

    pub fn is_listening_for_bind(&self) -> bool {
        self.pending.is_some()
    }

    /// Currently selected device for a role
    pub fn device_for(&self, role: DeviceRole) -> Option<&Device> {
        self.selected.get(&role).and_then(|id| self.devices.get(*id))
    }

    pub fn input_recorder(&self) -> Option<&CaptureStream> {
        self.input_recorder.as_ref()
    }

    pub fn loopback_recorder(&self) -> Option<&CaptureStream> {
        self.loopback_recorder.as_ref()
    }

    pub fn passthrough(&self) -> Option<&PassthroughStream> {
        self.passthrough.as_ref()
    }

    pub fn player(&self) -> Option<&PlaybackStream> {
        self.player.as_ref()
    }

    pub fn monitor(&self) -> Option<&PlaybackStream> {
        self.monitor.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.recording_key.is_some()
    }

    /// Where a bind's recording from `source` is written
    pub fn recording_path(&self, keycode: Keycode, source: CaptureSource) -> PathBuf {
        self.config
            .recordings_dir
            .join(format!("bind-{}-{}.wav", keycode, source.label()))
    }

    fn report(&mut self, context: String, error: StreamError) {
        log::error!("{}: {}", context, error);
        let event = match error {
            StreamError::StreamAborted(msg) => EngineEvent::StreamAborted(msg),
            other => EngineEvent::Error(format!("{}: {}", context, other)),
        };
        self.events.push_back(event);
    }

    /// Resolve every role from preferred names, falling back to the first
    /// device of the role's category
    fn select_defaults(&mut self, preferred: &BTreeMap<DeviceRole, String>) {
        self.selected.clear();
        for role in DeviceRole::ALL {
            let kind = role.kind();
            let by_name = preferred
                .get(&role)
                .and_then(|name| self.devices.by_name(kind, name));
            if by_name.is_none() && preferred.contains_key(&role) {
                log::warn!("Preferred {:?} device not found, using the first available", role);
            }
            if let Some(device) = by_name.or_else(|| self.devices.first_of(kind)) {
                log::info!("{:?} device: {}", role, device.name);
                self.selected.insert(role, device.id);
            }
        }
    }

    // Resets

    pub fn reset_input_recorder(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.input_recorder.take() {
            let result = old.stop();
            self.finish_capture(CaptureSource::Input, result.transpose());
        }
        self.input_recorder = self
            .device_for(DeviceRole::Input)
            .cloned()
            .map(|device| CaptureStream::new(device, self.stream_config));
        Ok(())
    }

    pub fn reset_loopback_recorder(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.loopback_recorder.take() {
            let result = old.stop();
            self.finish_capture(CaptureSource::Loopback, result.transpose());
        }
        self.loopback_recorder = self
            .device_for(DeviceRole::Loopback)
            .cloned()
            .map(|device| CaptureStream::new(device, self.stream_config));
        Ok(())
    }

    /// Rebuild the passthrough from the input to the virtual input device and
    /// start routing, keeping any voice effects in force
    pub fn reset_passthrough(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.passthrough.take() {
            old.stop();
        }
        let (Some(input), Some(output)) = (
            self.device_for(DeviceRole::Input).cloned(),
            self.device_for(DeviceRole::VirtualInput).cloned(),
        ) else {
            log::warn!("Passthrough needs an input and a virtual input device");
            return Ok(());
        };

        let mut passthrough = PassthroughStream::new(input, output, self.stream_config)?;
        passthrough.start(self.driver.as_ref(), self.voice_effects())?;
        self.passthrough = Some(passthrough);
        Ok(())
    }

    pub fn reset_player(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.player.take() {
            old.stop();
        }
        self.player = self
            .device_for(DeviceRole::VirtualInput)
            .cloned()
            .map(|device| PlaybackStream::new(PlaybackRole::Player, device, self.stream_config));
        Ok(())
    }

    pub fn reset_monitor(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.monitor.take() {
            old.stop();
        }
        self.monitor = self
            .device_for(DeviceRole::Output)
            .cloned()
            .map(|device| PlaybackStream::new(PlaybackRole::Monitor, device, self.stream_config));
        Ok(())
    }

    fn reset_role(&mut self, role: DeviceRole) -> StreamResult<()> {
        match role {
            DeviceRole::Input => {
                self.reset_input_recorder()?;
                self.reset_passthrough()
            }
            DeviceRole::Output => self.reset_monitor(),
            DeviceRole::Loopback => self.reset_loopback_recorder(),
            DeviceRole::VirtualInput => {
                self.reset_player()?;
                self.reset_passthrough()
            }
            DeviceRole::VirtualOutput => Ok(()),
        }
    }

    /// Pick a device for a role by display name and rebuild the streams using it
    pub fn select_device(&mut self, role: DeviceRole, name: &str) -> StreamResult<()> {
        let id = self
            .devices
            .by_name(role.kind(), name)
            .map(|d| d.id)
            .ok_or_else(|| StreamError::DeviceUnavailable(format!("No {:?} device named {}", role, name)))?;

        if self.selected.get(&role) == Some(&id) {
            return Ok(());
        }
        self.selected.insert(role, id);
        log::info!("Selected {:?} device: {}", role, name);
        self.reset_role(role)
    }

    /// Re-enumerate devices. Roles whose device vanished fall back to the
    /// first device of their category and their streams are rebuilt.
    pub fn refresh_devices(&mut self) -> StreamResult<()> {
        let previous: BTreeMap<DeviceRole, Device> = DeviceRole::ALL
            .iter()
            .filter_map(|role| self.device_for(*role).map(|d| (*role, d.clone())))
            .collect();
        let names: BTreeMap<DeviceRole, String> = previous
            .iter()
            .map(|(role, device)| (*role, device.name.clone()))
            .collect();

        self.devices = self.catalog.enumerate()?;
        self.select_defaults(&names);

        for role in DeviceRole::ALL {
            if previous.get(&role) != self.device_for(role) {
                if let Err(e) = self.reset_role(role) {
                    self.report(format!("Failed to rebuild streams for {:?}", role), e);
                }
            }
        }
        Ok(())
    }

    // Keybinds

    /// Listen for the next key press and move `keycode`'s entry to it
    pub fn rebind(&mut self, keycode: Keycode) {
        if !self.keybinds.contains(keycode) {
            log::warn!("Rebind requested for unknown key {}", keycode);
            return;
        }
        log::info!("Listening for new key for bind {}", keycode);
        self.pending = Some(PendingBind::Rebind(keycode));
    }

    /// Listen for the next key press and register it as a new `kind` bind
    pub fn begin_new_bind(&mut self, kind: ActionKind) {
        log::info!("Listening for new {:?} bind", kind);
        self.pending = Some(PendingBind::New(kind));
    }

    /// Bind `keycode` to `kind`.
    ///
    /// Finalizes a pending rebind by moving the listening entry to `keycode`.
    /// Otherwise an existing entry has its action replaced in place and an
    /// unused keycode gets a default entry.
    pub fn set_new_bind(&mut self, keycode: Keycode, kind: ActionKind) {
        match self.pending.take() {
            Some(PendingBind::Rebind(old)) => {
                self.end_action(old);
                let mut entry = self
                    .keybinds
                    .remove(old)
                    .unwrap_or_else(|| KeybindEntry::new(kind));
                entry.set_kind(kind);
                if self.keybinds.insert(keycode, entry).is_some() {
                    log::info!("Bind {} replaced the entry on key {}", old, keycode);
                }
                log::info!("Moved bind {} -> {}", old, keycode);
            }
            Some(PendingBind::New(_)) | None => match self.keybinds.get_mut(keycode) {
                Some(entry) => {
                    entry.set_kind(kind);
                    log::info!("Bind {} is now {:?}", keycode, kind);
                }
                None => {
                    self.keybinds.insert(keycode, KeybindEntry::new(kind));
                    log::info!("New {:?} bind on key {}", kind, keycode);
                }
            },
        }
        self.events.push_back(EngineEvent::BindCaptured { keycode, kind });
        self.persist_binds();
    }

    /// Remove a bind; unknown keycodes are ignored
    pub fn remove_bind(&mut self, keycode: Keycode) {
        if self.pending == Some(PendingBind::Rebind(keycode)) {
            self.pending = None;
        }
        self.end_action(keycode);
        if self.keybinds.remove(keycode).is_some() {
            log::info!("Removed bind {}", keycode);
            self.persist_binds();
        }
    }

    /// Replace an entry's settings (the settings popup)
    pub fn update_bind(&mut self, keycode: Keycode, entry: KeybindEntry) -> StreamResult<()> {
        let Some(slot) = self.keybinds.get_mut(keycode) else {
            return Err(StreamError::Configuration(format!("No bind on key {}", keycode)));
        };
        *slot = entry;
        log::info!("Updated bind {}", keycode);

        // Live voice effects follow the edit
        if self.voice_key == Some(keycode) {
            let effects = self.voice_effects();
            if let Some(passthrough) = self.passthrough.as_mut() {
                passthrough.set_effects(effects);
            }
        }
        self.persist_binds();
        Ok(())
    }

    /// Choose the sound a bind plays. The file must be a readable WAV.
    pub fn override_sound(&mut self, keycode: Keycode, path: &Path) -> StreamResult<()> {
        if !self.keybinds.contains(keycode) {
            return Err(StreamError::Configuration(format!("No bind on key {}", keycode)));
        }
        hound::WavReader::open(path)?;
        if let Some(entry) = self.keybinds.get_mut(keycode) {
            entry.sample = Some(path.to_path_buf());
        }
        log::info!("Bind {} plays {}", keycode, path.display());
        self.persist_binds();
        Ok(())
    }

    /// Forget a bind's sound. A soundboard bind records again on its next press.
    pub fn clear_sound(&mut self, keycode: Keycode) -> StreamResult<()> {
        if self.playing_key == Some(keycode) {
            self.end_action(keycode);
        }
        let Some(entry) = self.keybinds.get_mut(keycode) else {
            return Err(StreamError::Configuration(format!("No bind on key {}", keycode)));
        };
        entry.sample = None;
        log::info!("Bind {} sound cleared", keycode);
        self.persist_binds();
        Ok(())
    }

    pub fn save_binds(&self) -> Result<(), SettingsError> {
        self.store.save(&self.keybinds)
    }

    fn persist_binds(&mut self) {
        if let Err(e) = self.save_binds() {
            log::error!("Failed to save keybinds: {}", e);
            self.events
                .push_back(EngineEvent::Error(format!("Failed to save keybinds: {}", e)));
        }
    }

    // Hotkey dispatch

    pub fn handle_hotkey(&mut self, event: HotkeyEvent) {
        if let Some(pending) = self.pending {
            if event.pressed {
                let kind = match pending {
                    PendingBind::Rebind(old) => self
                        .keybinds
                        .get(old)
                        .map(|e| e.kind)
                        .unwrap_or(ActionKind::RecordSoundboard),
                    PendingBind::New(kind) => kind,
                };
                self.set_new_bind(event.keycode, kind);
            }
            return;
        }

        let Some(trigger) = self.keybinds.get(event.keycode).map(|e| e.trigger) else {
            return;
        };
        let running = self.is_running(event.keycode);

        match (trigger, event.pressed, running) {
            (_, true, false) => self.start_action(event.keycode),
            (Trigger::Hold, false, true) | (Trigger::Toggle, true, true) => {
                self.end_action(event.keycode)
            }
            _ => {}
        }
    }

    fn is_running(&self, keycode: Keycode) -> bool {
        self.recording_key == Some(keycode)
            || self.voice_key == Some(keycode)
            || self.playing_key == Some(keycode)
    }

    /// Effects the passthrough should apply right now
    fn voice_effects(&self) -> EffectSettings {
        self.voice_key
            .and_then(|k| self.keybinds.get(k))
            .map(|e| e.effects)
            .unwrap_or_else(EffectSettings::bypass)
    }

    fn start_action(&mut self, keycode: Keycode) {
        let Some(entry) = self.keybinds.get(keycode).cloned() else {
            return;
        };
        match entry.kind {
            ActionKind::RecordSoundboard => match entry.sample.as_deref() {
                Some(sample) => self.start_soundboard(keycode, sample),
                None => self.start_recording(keycode, entry.capture),
            },
            ActionKind::PlayVoiceFX => self.start_voice(keycode, &entry),
        }
    }

    fn start_recording(&mut self, keycode: Keycode, capture: CaptureFlags) {
        if let Some(active) = self.recording_key {
            log::debug!("Recording for bind {} in progress, ignoring {}", active, keycode);
            return;
        }

        let options = CaptureOptions {
            pad_origin: capture.pad_to_sync.then(|| self.driver.now()),
            max_file_length: self.config.max_file_length,
        };
        let mut armed = false;

        if capture.record_input {
            let path = self.recording_path(keycode, CaptureSource::Input);
            let result = match self.input_recorder.as_mut() {
                Some(recorder) => recorder.arm(self.driver.as_ref(), &path, options),
                None => Err(StreamError::DeviceUnavailable("No input device selected".into())),
            };
            match result {
                Ok(()) => armed = true,
                Err(e) => self.report(format!("Bind {}: input capture", keycode), e),
            }
        }
        if capture.record_loopback {
            let path = self.recording_path(keycode, CaptureSource::Loopback);
            let result = match self.loopback_recorder.as_mut() {
                Some(recorder) => recorder.arm(self.driver.as_ref(), &path, options),
                None => Err(StreamError::DeviceUnavailable("No loopback device selected".into())),
            };
            match result {
                Ok(()) => armed = true,
                Err(e) => self.report(format!("Bind {}: loopback capture", keycode), e),
            }
        }

        if armed {
            self.recording_key = Some(keycode);
        }
    }

    /// Play a soundboard bind's sample into the virtual microphone and the
    /// local output
    fn start_soundboard(&mut self, keycode: Keycode, sample: &Path) {
        if let Some(previous) = self.playing_key {
            self.end_action(previous);
        }
        if self.play_sample(keycode, sample) {
            self.playing_key = Some(keycode);
        }
    }

    fn start_voice(&mut self, keycode: Keycode, entry: &KeybindEntry) {
        if let Some(previous) = self.voice_key {
            self.end_action(previous);
        }
        self.voice_key = Some(keycode);

        match self.passthrough.as_mut() {
            Some(passthrough) => passthrough.set_effects(entry.effects),
            None => log::warn!("No passthrough running for bind {}", keycode),
        }

        if let Some(sample) = entry.sample.as_deref() {
            // The Player now belongs to this bind
            self.playing_key = None;
            self.play_sample(keycode, sample);
        }
    }

    /// Start `sample` on the Player and the Monitor. True if either started.
    fn play_sample(&mut self, keycode: Keycode, sample: &Path) -> bool {
        let mut started = false;
        for role in [PlaybackRole::Player, PlaybackRole::Monitor] {
            let stream = match role {
                PlaybackRole::Player => self.player.as_mut(),
                PlaybackRole::Monitor => self.monitor.as_mut(),
            };
            let result = match stream {
                Some(stream) => stream.play(self.driver.as_ref(), sample),
                None => continue,
            };
            match result {
                Ok(()) => started = true,
                Err(e) => self.report(format!("Bind {}: {} playback", keycode, role.label()), e),
            }
        }
        started
    }

    fn stop_playback(&mut self) {
        if let Some(player) = self.player.as_mut() {
            player.stop();
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
    }

    fn end_action(&mut self, keycode: Keycode) {
        if self.recording_key == Some(keycode) {
            self.stop_recording();
        }
        if self.voice_key == Some(keycode) {
            self.voice_key = None;
            if let Some(passthrough) = self.passthrough.as_mut() {
                passthrough.set_effects(EffectSettings::bypass());
            }
            self.stop_playback();
        }
        if self.playing_key == Some(keycode) {
            self.playing_key = None;
            self.stop_playback();
        }
    }

    fn stop_recording(&mut self) {
        if let Some(result) = self.input_recorder.as_mut().map(CaptureStream::stop) {
            self.finish_capture(CaptureSource::Input, result.transpose());
        }
        if let Some(result) = self.loopback_recorder.as_mut().map(CaptureStream::stop) {
            self.finish_capture(CaptureSource::Loopback, result.transpose());
        }
        self.recording_key = None;
    }

    fn finish_capture(&mut self, source: CaptureSource, result: Option<StreamResult<Recording>>) {
        match result {
            Some(Ok(recording)) => {
                if let Some(keycode) = self.recording_key {
                    self.adopt_recording(keycode, source, &recording.path);
                }
                self.events.push_back(EngineEvent::RecordingFinished {
                    keycode: self.recording_key,
                    source,
                    recording,
                });
            }
            Some(Err(e)) => self.report(format!("{} capture", source.label()), e),
            None => {}
        }
    }

    /// Make a finished recording the sound its soundboard bind plays. The
    /// input take is used when the bind records both devices.
    fn adopt_recording(&mut self, keycode: Keycode, source: CaptureSource, path: &Path) {
        let Some(entry) = self.keybinds.get_mut(keycode) else {
            return;
        };
        let primary = match source {
            CaptureSource::Input => true,
            CaptureSource::Loopback => !entry.capture.record_input,
        };
        if entry.kind != ActionKind::RecordSoundboard || !primary {
            return;
        }
        entry.sample = Some(path.to_path_buf());
        log::info!("Bind {} plays {}", keycode, path.display());
        self.persist_binds();
    }

    /// Reap streams that ended on their own
    pub fn poll(&mut self) {
        if let Some(result) = self.input_recorder.as_mut().and_then(CaptureStream::poll) {
            self.finish_capture(CaptureSource::Input, Some(result));
        }
        if let Some(result) = self.loopback_recorder.as_mut().and_then(CaptureStream::poll) {
            self.finish_capture(CaptureSource::Loopback, Some(result));
        }
        let any_recording = self.input_recorder.as_ref().is_some_and(CaptureStream::is_active)
            || self.loopback_recorder.as_ref().is_some_and(CaptureStream::is_active);
        if !any_recording {
            self.recording_key = None;
        }

        for role in [PlaybackRole::Player, PlaybackRole::Monitor] {
            let stream = match role {
                PlaybackRole::Player => self.player.as_mut(),
                PlaybackRole::Monitor => self.monitor.as_mut(),
            };
            match stream.and_then(PlaybackStream::poll) {
                Some(Ok(path)) => {
                    // The Monitor never ends on its own; it follows the Player
                    if role == PlaybackRole::Player && self.playing_key.take().is_some() {
                        if let Some(monitor) = self.monitor.as_mut() {
                            monitor.stop();
                        }
                    }
                    self.events.push_back(EngineEvent::PlaybackFinished { role, path });
                }
                Some(Err(e)) => self.report(format!("{} playback", role.label()), e),
                None => {}
            }
        }

        if let Some(error) = self.passthrough.as_mut().and_then(PassthroughStream::poll) {
            self.report("Passthrough".to_string(), error);
        }
    }

    /// Take every event queued since the last call
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    /// Apply one command from the control channel
    pub fn execute(&mut self, command: EngineCommand) {
        let result = match command {
            EngineCommand::Hotkey(event) => {
                self.handle_hotkey(event);
                Ok(())
            }
            EngineCommand::SelectDevice { role, name } => self.select_device(role, &name),
            EngineCommand::RefreshDevices => self.refresh_devices(),
            EngineCommand::BeginNewBind(kind) => {
                self.begin_new_bind(kind);
                Ok(())
            }
            EngineCommand::Rebind(keycode) => {
                self.rebind(keycode);
                Ok(())
            }
            EngineCommand::SetNewBind { keycode, kind } => {
                self.set_new_bind(keycode, kind);
                Ok(())
            }
            EngineCommand::RemoveBind(keycode) => {
                self.remove_bind(keycode);
                Ok(())
            }
            EngineCommand::UpdateBind { keycode, entry } => self.update_bind(keycode, entry),
            EngineCommand::OverrideSound { keycode, path } => self.override_sound(keycode, &path),
            EngineCommand::ClearSound(keycode) => self.clear_sound(keycode),
            EngineCommand::SaveBinds => {
                self.persist_binds();
                Ok(())
            }
            EngineCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report("Command failed".to_string(), e);
        }
    }

    /// Stop every stream and save the keybinds
    pub fn shutdown(&mut self) {
        if let Some(keycode) = self.voice_key {
            self.end_action(keycode);
        }
        if let Some(keycode) = self.playing_key {
            self.end_action(keycode);
        }
        if self.recording_key.is_some() {
            self.stop_recording();
        }
        if let Some(passthrough) = self.passthrough.as_mut() {
            passthrough.stop();
        }
        for stream in [self.player.as_mut(), self.monitor.as_mut()].into_iter().flatten() {
            stream.stop();
        }
        self.persist_binds();
        log::info!("Stream engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{SimulatedDriver, StreamState};
    use crate::device::Direction;
    use crate::effects::ReverbSettings;
    use crate::settings::JsonBindStore;
    use std::sync::{Arc, Mutex};

    fn devices() -> DeviceList {
        let mut list = DeviceList::new();
        list.push("Mic-1", "Sim", DeviceKind::Input, Direction::Input, 1, 48000);
        list.push("Mic-2", "Sim", DeviceKind::Input, Direction::Input, 1, 48000);
        list.push("Speakers", "Sim", DeviceKind::Output, Direction::Output, 1, 48000);
        list.push("Stereo Mix", "Sim", DeviceKind::Loopback, Direction::Input, 1, 48000);
        list.push("CABLE Input", "Sim", DeviceKind::VirtualInput, Direction::Output, 1, 48000);
        list.push("CABLE Output", "Sim", DeviceKind::VirtualOutput, Direction::Input, 1, 48000);
        list
    }

    const MIC_1: DeviceId = DeviceId(0);
    const MIC_2: DeviceId = DeviceId(1);
    const LOOPBACK: DeviceId = DeviceId(3);

    /// Catalog whose contents a test can swap out
    #[derive(Clone)]
    struct SharedCatalog(Arc<Mutex<DeviceList>>);

    impl DeviceCatalog for SharedCatalog {
        fn enumerate(&self) -> StreamResult<DeviceList> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct Fixture {
        engine: StreamEngine,
        driver: SimulatedDriver,
        dir: tempfile::TempDir,
    }

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            sample_rate: 48000,
            frames_per_buffer: 256,
            max_file_length: Duration::from_secs(10),
            recordings_dir: dir.join("recordings"),
            preferred: BTreeMap::new(),
        }
    }

    fn fixture_with(catalog: Box<dyn DeviceCatalog>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedDriver::new(48000, 256);
        let store = JsonBindStore::new(dir.path().join("keybinds.json"));
        let engine = StreamEngine::new(
            Box::new(driver.clone()),
            catalog,
            Box::new(store),
            config(dir.path()),
        )
        .unwrap();
        Fixture { engine, driver, dir }
    }

    fn fixture() -> Fixture {
        fixture_with(Box::new(devices()))
    }

    fn write_sample(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0.25f32).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_startup_selects_defaults_and_routes() {
        let mut f = fixture();
        assert!(f.engine.is_ready());
        assert_eq!(f.engine.drain_events(), vec![EngineEvent::Ready]);

        assert_eq!(f.engine.device_for(DeviceRole::Input).unwrap().name, "Mic-1");
        assert_eq!(f.engine.device_for(DeviceRole::VirtualInput).unwrap().name, "CABLE Input");
        assert!(f.engine.passthrough().unwrap().is_active());
        assert!(f.engine.input_recorder().is_some());
        assert!(f.engine.loopback_recorder().is_some());
        // Only the passthrough holds a driver callback at rest
        assert_eq!(f.driver.open_count(), 1);
    }

    #[test]
    fn test_set_new_bind_replaces_kind_in_place() {
        let mut f = fixture();
        f.engine.set_new_bind(65, ActionKind::RecordSoundboard);
        f.engine.set_new_bind(65, ActionKind::PlayVoiceFX);

        assert_eq!(f.engine.keybinds().len(), 1);
        let entry = f.engine.keybinds().get(65).unwrap();
        assert_eq!(entry.kind, ActionKind::PlayVoiceFX);
        assert_eq!(entry.trigger, Trigger::Hold);

        f.engine.remove_bind(999);
        assert_eq!(f.engine.keybinds().len(), 1);
    }

    #[test]
    fn test_binds_persist_through_store() {
        let mut f = fixture();
        f.engine.set_new_bind(70, ActionKind::RecordSoundboard);
        f.engine.remove_bind(70);
        f.engine.set_new_bind(71, ActionKind::PlayVoiceFX);

        let stored = JsonBindStore::new(f.dir.path().join("keybinds.json")).load().unwrap();
        assert!(!stored.contains(70));
        assert_eq!(stored.get(71).unwrap().kind, ActionKind::PlayVoiceFX);
    }

    #[test]
    fn test_new_bind_consumes_next_press() {
        let mut f = fixture();
        f.engine.drain_events();
        f.engine.begin_new_bind(ActionKind::RecordSoundboard);
        assert!(f.engine.is_listening_for_bind());

        f.engine.handle_hotkey(HotkeyEvent::press(80));
        f.engine.handle_hotkey(HotkeyEvent::release(80));

        assert!(!f.engine.is_listening_for_bind());
        assert!(!f.engine.is_recording());
        assert_eq!(
            f.engine.drain_events(),
            vec![EngineEvent::BindCaptured {
                keycode: 80,
                kind: ActionKind::RecordSoundboard
            }]
        );
    }

    #[test]
    fn test_rebind_moves_entry() {
        let mut f = fixture();
        f.engine.set_new_bind(81, ActionKind::PlayVoiceFX);
        let mut entry = f.engine.keybinds().get(81).unwrap().clone();
        entry.label = "echo".to_string();
        f.engine.update_bind(81, entry).unwrap();

        f.engine.rebind(81);
        f.engine.handle_hotkey(HotkeyEvent::press(82));

        assert!(!f.engine.keybinds().contains(81));
        let moved = f.engine.keybinds().get(82).unwrap();
        assert_eq!(moved.label, "echo");
        assert_eq!(moved.kind, ActionKind::PlayVoiceFX);
    }

    #[test]
    fn test_toggle_bind_records_both_devices() {
        let mut f = fixture();
        f.engine.set_new_bind(90, ActionKind::RecordSoundboard);
        let mut entry = f.engine.keybinds().get(90).unwrap().clone();
        entry.capture = CaptureFlags {
            record_input: true,
            record_loopback: true,
            pad_to_sync: true,
        };
        f.engine.update_bind(90, entry).unwrap();
        f.engine.drain_events();

        f.driver.feed(MIC_1, &[0.5; 1024]);
        f.driver.feed(LOOPBACK, &[-0.5; 1024]);

        f.engine.handle_hotkey(HotkeyEvent::press(90));
        f.engine.handle_hotkey(HotkeyEvent::release(90));
        assert!(f.engine.is_recording());
        assert_eq!(
            f.engine.input_recorder().unwrap().state(),
            StreamState::Armed
        );

        f.driver.advance(4);
        // A second bind cannot start a recording meanwhile
        f.engine.set_new_bind(91, ActionKind::RecordSoundboard);
        f.engine.handle_hotkey(HotkeyEvent::press(91));
        f.engine.handle_hotkey(HotkeyEvent::press(90));
        assert!(!f.engine.is_recording());

        let finished: Vec<_> = f
            .engine
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::RecordingFinished {
                    keycode,
                    source,
                    recording,
                } => Some((keycode, source, recording)),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 2);
        for (keycode, source, recording) in finished {
            assert_eq!(keycode, Some(90));
            assert_eq!(recording.frames, 1024);
            assert_eq!(recording.path, f.engine.recording_path(90, source));
            assert!(recording.path.exists());
        }
        assert!(!f.engine.recording_path(91, CaptureSource::Input).exists());
    }

    #[test]
    fn test_max_length_is_reaped_by_poll() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedDriver::new(48000, 256);
        let mut config = config(dir.path());
        config.max_file_length = Duration::from_secs_f64(0.1);
        let mut engine = StreamEngine::new(
            Box::new(driver.clone()),
            Box::new(devices()),
            Box::new(JsonBindStore::new(dir.path().join("keybinds.json"))),
            config,
        )
        .unwrap();
        engine.set_new_bind(92, ActionKind::RecordSoundboard);
        engine.drain_events();

        engine.handle_hotkey(HotkeyEvent::press(92));
        driver.advance_for(Duration::from_secs_f64(0.2));
        engine.poll();

        assert!(!engine.is_recording());
        let events = engine.drain_events();
        assert!(matches!(
            &events[..],
            [EngineEvent::RecordingFinished { recording, .. }] if recording.frames == 4800
        ));
    }

    #[test]
    fn test_soundboard_bind_plays_back_its_recording() {
        let mut f = fixture();
        f.engine.set_new_bind(130, ActionKind::RecordSoundboard);
        f.engine.drain_events();

        // Toggle on and off records
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        f.driver.advance(4);
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        let take = f.engine.recording_path(130, CaptureSource::Input);
        assert_eq!(f.engine.keybinds().get(130).unwrap().sample.as_deref(), Some(take.as_path()));
        let stored = JsonBindStore::new(f.dir.path().join("keybinds.json")).load().unwrap();
        assert_eq!(stored.get(130).unwrap().sample.as_deref(), Some(take.as_path()));

        // Later presses play the take; the second press of a toggle stops it
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        assert!(!f.engine.is_recording());
        assert!(f.engine.player().unwrap().is_active());
        assert!(f.engine.monitor().unwrap().is_active());
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        assert_eq!(f.driver.open_count(), 1);

        // Playing to the end releases the Monitor too
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        f.engine.drain_events();
        f.driver.advance(8);
        f.engine.poll();
        assert!(f.engine.drain_events().contains(&EngineEvent::PlaybackFinished {
            role: PlaybackRole::Player,
            path: take.clone(),
        }));
        assert_eq!(f.driver.open_count(), 1);

        // Without a sound the bind records again
        f.engine.clear_sound(130).unwrap();
        f.engine.handle_hotkey(HotkeyEvent::press(130));
        assert!(f.engine.is_recording());
        assert!(matches!(
            f.engine.clear_sound(555),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_hold_voice_bind_applies_effects_and_plays_sample() {
        let mut f = fixture();
        let sample = f.dir.path().join("airhorn.wav");
        write_sample(&sample, 48000);

        f.engine.set_new_bind(100, ActionKind::PlayVoiceFX);
        let mut entry = f.engine.keybinds().get(100).unwrap().clone();
        entry.effects.reverb = ReverbSettings {
            enabled: true,
            ..ReverbSettings::default()
        };
        f.engine.update_bind(100, entry.clone()).unwrap();
        f.engine.override_sound(100, &sample).unwrap();

        f.engine.handle_hotkey(HotkeyEvent::press(100));
        assert_eq!(f.engine.passthrough().unwrap().effects(), entry.effects);
        assert!(f.engine.player().unwrap().is_active());
        assert!(f.engine.monitor().unwrap().is_active());
        assert_eq!(f.driver.open_count(), 3);

        f.engine.handle_hotkey(HotkeyEvent::release(100));
        assert!(f.engine.passthrough().unwrap().effects().is_bypass());
        assert!(!f.engine.player().unwrap().is_active());
        assert!(!f.engine.monitor().unwrap().is_active());
        assert_eq!(f.driver.open_count(), 1);
    }

    #[test]
    fn test_override_sound_rejects_non_wav() {
        let mut f = fixture();
        f.engine.set_new_bind(101, ActionKind::PlayVoiceFX);
        let bogus = f.dir.path().join("notes.txt");
        std::fs::write(&bogus, "hello").unwrap();

        assert!(matches!(
            f.engine.override_sound(101, &bogus),
            Err(StreamError::FormatMismatch(_))
        ));
        assert!(matches!(
            f.engine.override_sound(555, &bogus),
            Err(StreamError::Configuration(_))
        ));
        assert!(f.engine.keybinds().get(101).unwrap().sample.is_none());
    }

    #[test]
    fn test_select_device_rebuilds_affected_streams() {
        let mut f = fixture();
        f.engine.select_device(DeviceRole::Input, "Mic-2").unwrap();

        assert_eq!(f.engine.input_recorder().unwrap().device().id, MIC_2);
        assert_eq!(f.engine.passthrough().unwrap().input().id, MIC_2);
        assert_eq!(f.driver.open_count(), 1);

        assert!(matches!(
            f.engine.select_device(DeviceRole::Input, "Nope"),
            Err(StreamError::DeviceUnavailable(_))
        ));
        assert!(f.engine.select_device(DeviceRole::VirtualOutput, "CABLE Output").is_ok());
    }

    #[test]
    fn test_refresh_falls_back_when_device_vanishes() {
        let mut list = devices();
        let catalog = SharedCatalog(Arc::new(Mutex::new(list.clone())));
        let mut f = fixture_with(Box::new(catalog.clone()));
        f.engine.select_device(DeviceRole::Input, "Mic-2").unwrap();

        list = DeviceList::new();
        list.push("Mic-1", "Sim", DeviceKind::Input, Direction::Input, 1, 48000);
        list.push("CABLE Input", "Sim", DeviceKind::VirtualInput, Direction::Output, 1, 48000);
        *catalog.0.lock().unwrap() = list;

        f.engine.refresh_devices().unwrap();
        assert_eq!(f.engine.device_for(DeviceRole::Input).unwrap().name, "Mic-1");
        assert!(f.engine.device_for(DeviceRole::Loopback).is_none());
        assert!(f.engine.loopback_recorder().is_none());
        assert!(f.engine.monitor().is_none());
        assert_eq!(f.engine.passthrough().unwrap().input().name, "Mic-1");
    }

    #[test]
    fn test_device_loss_during_recording_is_reported() {
        let mut f = fixture();
        f.engine.set_new_bind(110, ActionKind::RecordSoundboard);
        f.engine.drain_events();

        f.engine.handle_hotkey(HotkeyEvent::press(110));
        f.driver.advance(2);
        f.driver.disconnect(MIC_1);
        f.engine.poll();

        assert!(!f.engine.is_recording());
        let events = f.engine.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::StreamAborted(_))));
        assert!(f.engine.recording_path(110, CaptureSource::Input).exists());
    }

    #[test]
    fn test_shutdown_releases_every_callback() {
        let mut f = fixture();
        f.engine.set_new_bind(120, ActionKind::RecordSoundboard);
        f.engine.handle_hotkey(HotkeyEvent::press(120));
        assert_eq!(f.driver.open_count(), 2);

        f.engine.shutdown();
        assert_eq!(f.driver.open_count(), 0);
        assert!(!f.engine.is_recording());
    }
}
