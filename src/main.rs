//! soundboard-rs - headless engine runner
//!
//! Loads settings, starts the stream engine on cpal, connects the configured
//! MIDI port as the hotkey source and logs engine events until the engine
//! thread exits.

use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use soundboard_rs::audio::CpalDriver;
use soundboard_rs::device::CpalCatalog;
use soundboard_rs::engine::{EngineEvent, EngineHandle, StreamEngine};
use soundboard_rs::error::StreamResult;
use soundboard_rs::midi::MidiHotkeySource;
use soundboard_rs::settings::{AppSettings, JsonBindStore};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> StreamResult<()> {
    env_logger::init();
    log::info!("Starting soundboard-rs");

    let mut settings = AppSettings::load();
    let config = settings.engine_config();

    let handle = EngineHandle::spawn(
        move || {
            StreamEngine::new(
                Box::new(CpalDriver::new()),
                Box::new(CpalCatalog),
                Box::new(JsonBindStore::default_location()),
                config,
            )
        },
        POLL_INTERVAL,
    )?;

    if !handle.wait_for_ready(READY_TIMEOUT)? {
        log::warn!("Stream engine still starting after {:?}", READY_TIMEOUT);
    }

    let mut midi = MidiHotkeySource::new();
    log::info!("MIDI ports: {:?}", midi.ports);
    if !midi.ports.is_empty() {
        if let Err(e) = midi.connect(settings.midi_port.as_deref(), handle.sender()) {
            log::warn!("{}", e);
        }
    }

    loop {
        match handle.events().recv_timeout(Duration::from_secs(1)) {
            Ok(EngineEvent::RecordingFinished {
                keycode, recording, ..
            }) => log::info!(
                "Bind {:?} recorded {} frames to {}",
                keycode,
                recording.frames,
                recording.path.display()
            ),
            Ok(EngineEvent::Error(msg)) | Ok(EngineEvent::StreamAborted(msg)) => {
                log::error!("{}", msg)
            }
            Ok(event) => log::info!("{:?}", event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(port) = midi.connected_port() {
        settings.midi_port = Some(port.to_string());
        settings.save();
    }
    midi.disconnect();
    handle.shutdown();
    Ok(())
}
