//! Keybind table
//!
//! Typed entries keyed by keycode. The table is owned by the control thread;
//! the only data that reaches a real-time callback is a copied
//! [`EffectSettings`] snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::effects::EffectSettings;

/// Platform key code, or `0x1000 + note` for MIDI notes
pub type Keycode = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Record the input and/or loopback device while active
    RecordSoundboard,
    /// Apply voice effects to the passthrough and play the bound sample
    PlayVoiceFX,
}

impl ActionKind {
    pub fn default_trigger(self) -> Trigger {
        match self {
            Self::RecordSoundboard => Trigger::Toggle,
            Self::PlayVoiceFX => Trigger::Hold,
        }
    }
}

/// How a key press maps to the start and end of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Active while the key is held
    Hold,
    /// First press starts, second press ends
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureFlags {
    pub record_input: bool,
    pub record_loopback: bool,
    /// Pad both recordings with leading silence so they start on the same instant
    pub pad_to_sync: bool,
}

impl Default for CaptureFlags {
    fn default() -> Self {
        Self {
            record_input: true,
            record_loopback: false,
            pad_to_sync: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeybindEntry {
    #[serde(default)]
    pub label: String,
    pub kind: ActionKind,
    pub trigger: Trigger,
    #[serde(default)]
    pub capture: CaptureFlags,
    #[serde(default)]
    pub effects: EffectSettings,
    /// Sound played by the bind, chosen by the user
    #[serde(default)]
    pub sample: Option<PathBuf>,
}

impl KeybindEntry {
    /// Default configuration for a freshly registered bind
    pub fn new(kind: ActionKind) -> Self {
        Self {
            label: String::new(),
            kind,
            trigger: kind.default_trigger(),
            capture: CaptureFlags::default(),
            effects: EffectSettings::bypass(),
            sample: None,
        }
    }

    /// Change the action, resetting the trigger to the new kind's default
    pub fn set_kind(&mut self, kind: ActionKind) {
        if self.kind != kind {
            self.kind = kind;
            self.trigger = kind.default_trigger();
        }
    }
}

/// Keycode to entry mapping. Serializes as a JSON object keyed by the
/// keycode's decimal string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeybindTable {
    entries: BTreeMap<Keycode, KeybindEntry>,
}

impl KeybindTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keycode: Keycode) -> Option<&KeybindEntry> {
        self.entries.get(&keycode)
    }

    pub fn get_mut(&mut self, keycode: Keycode) -> Option<&mut KeybindEntry> {
        self.entries.get_mut(&keycode)
    }

    pub fn contains(&self, keycode: Keycode) -> bool {
        self.entries.contains_key(&keycode)
    }

    /// Insert or replace the entry for `keycode`
    pub fn insert(&mut self, keycode: Keycode, entry: KeybindEntry) -> Option<KeybindEntry> {
        self.entries.insert(keycode, entry)
    }

    pub fn remove(&mut self, keycode: Keycode) -> Option<KeybindEntry> {
        self.entries.remove(&keycode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Keycode, &KeybindEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::PitchMode;

    #[test]
    fn test_defaults_per_kind() {
        let record = KeybindEntry::new(ActionKind::RecordSoundboard);
        assert_eq!(record.trigger, Trigger::Toggle);
        assert!(record.capture.record_input);
        assert!(record.effects.is_bypass());

        let mut voice = KeybindEntry::new(ActionKind::PlayVoiceFX);
        assert_eq!(voice.trigger, Trigger::Hold);
        voice.set_kind(ActionKind::RecordSoundboard);
        assert_eq!(voice.trigger, Trigger::Toggle);
    }

    #[test]
    fn test_document_is_keyed_by_keycode_string() {
        let mut table = KeybindTable::new();
        let mut entry = KeybindEntry::new(ActionKind::PlayVoiceFX);
        entry.label = "robot".to_string();
        entry.effects.pitch.enabled = true;
        entry.effects.pitch.mode = PitchMode::Shift { semitones: -5.0 };
        table.insert(65, entry);

        let text = serde_json::to_string(&table).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["65"]["label"], "robot");
        assert_eq!(json["65"]["kind"], "PlayVoiceFX");

        let parsed: KeybindTable = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_sparse_entry_fills_defaults() {
        let parsed: KeybindTable =
            serde_json::from_str(r#"{"112":{"kind":"RecordSoundboard","trigger":"Hold"}}"#).unwrap();
        let entry = parsed.get(112).unwrap();
        assert_eq!(entry.trigger, Trigger::Hold);
        assert_eq!(entry.capture, CaptureFlags::default());
        assert!(entry.sample.is_none());
    }
}
