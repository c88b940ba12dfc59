//! MIDI hotkey source
//!
//! Turns Note On / Note Off messages from a MIDI input port into hotkey edges
//! on the engine's command channel. Note `n` maps to keycode
//! [`MIDI_KEYCODE_BASE`]` + n` so pads and keys can be bound like keyboard keys.

use std::sync::mpsc::Sender;

use midir::{MidiInput, MidiInputConnection};

use crate::engine::{EngineCommand, HotkeyEvent, Keycode};
use crate::error::{StreamError, StreamResult};

/// Offset keeping MIDI notes clear of platform keycodes
pub const MIDI_KEYCODE_BASE: Keycode = 0x1000;

/// Parse a raw MIDI message into `(note, pressed)`.
///
/// Note On with velocity 0 is a release, as running-status keyboards send it.
pub fn parse_note_event(message: &[u8]) -> Option<(u8, bool)> {
    let [status, note, velocity] = *message else {
        return None;
    };
    let note = note & 0x7F;
    match status & 0xF0 {
        0x90 => Some((note, velocity & 0x7F > 0)),
        0x80 => Some((note, false)),
        _ => None,
    }
}

pub fn note_keycode(note: u8) -> Keycode {
    MIDI_KEYCODE_BASE + note as Keycode
}

/// MIDI input port feeding hotkeys to the engine
pub struct MidiHotkeySource {
    /// Available MIDI port names (refreshed on scan)
    pub ports: Vec<String>,

    connection: Option<MidiInputConnection<()>>,

    /// Name of the connected port
    connected: Option<String>,
}

impl MidiHotkeySource {
    pub fn new() -> Self {
        let mut source = Self {
            ports: Vec::new(),
            connection: None,
            connected: None,
        };
        source.scan_ports();
        source
    }

    /// Scan for available MIDI input ports
    pub fn scan_ports(&mut self) {
        self.ports.clear();
        match MidiInput::new("soundboard-rs-scan") {
            Ok(midi_in) => {
                for port in midi_in.ports().iter() {
                    let name = midi_in
                        .port_name(port)
                        .unwrap_or_else(|_| "Unknown".to_string());
                    self.ports.push(name);
                }
                if self.ports.is_empty() {
                    log::info!("No MIDI devices found");
                }
            }
            Err(e) => log::warn!("MIDI init error: {}", e),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connected_port(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    /// Connect to the port named `port_name`, or the first port when `None`,
    /// forwarding note edges to `commands`
    pub fn connect(
        &mut self,
        port_name: Option<&str>,
        commands: Sender<EngineCommand>,
    ) -> StreamResult<()> {
        self.disconnect();

        let midi_in = MidiInput::new("soundboard-rs")
            .map_err(|e| StreamError::DeviceUnavailable(format!("MIDI init error: {}", e)))?;

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| match port_name {
                Some(wanted) => midi_in.port_name(p).is_ok_and(|name| name == wanted),
                None => true,
            })
            .ok_or_else(|| {
                StreamError::DeviceUnavailable(format!(
                    "MIDI port {} not found",
                    port_name.unwrap_or("(any)")
                ))
            })?;
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());

        let connection = midi_in
            .connect(
                port,
                "soundboard-rs-input",
                move |_timestamp, message, _| {
                    if let Some((note, pressed)) = parse_note_event(message) {
                        let event = HotkeyEvent {
                            keycode: note_keycode(note),
                            pressed,
                        };
                        // Engine gone; the connection is about to be dropped
                        let _ = commands.send(EngineCommand::Hotkey(event));
                    }
                },
                (),
            )
            .map_err(|e| StreamError::DeviceUnavailable(format!("MIDI connect error: {}", e)))?;

        log::info!("MIDI connected: {}", name);
        self.connection = Some(connection);
        self.connected = Some(name);
        Ok(())
    }

    /// Disconnect from the current MIDI port
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
            log::info!("MIDI disconnected");
        }
        self.connected = None;
    }
}

impl Default for MidiHotkeySource {
    fn default() -> Self {
        Self::new()
    }
}
