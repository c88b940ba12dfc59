//! Engine thread and its command channel
//!
//! [`EngineHandle::spawn`] builds the [`StreamEngine`] on a dedicated control
//! thread and returns immediately. Callers send [`EngineCommand`]s and read
//! [`EngineEvent`]s; [`EngineHandle::wait_for_ready`] blocks until
//! construction has finished or failed.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    ActionKind, DeviceRole, EngineEvent, HotkeyEvent, KeybindEntry, Keycode, StreamEngine,
};
use crate::error::{StreamError, StreamResult};

/// Requests the control layer can make of the engine thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Hotkey(HotkeyEvent),
    SelectDevice { role: DeviceRole, name: String },
    RefreshDevices,
    BeginNewBind(ActionKind),
    Rebind(Keycode),
    SetNewBind { keycode: Keycode, kind: ActionKind },
    RemoveBind(Keycode),
    UpdateBind { keycode: Keycode, entry: KeybindEntry },
    OverrideSound { keycode: Keycode, path: PathBuf },
    ClearSound(Keycode),
    SaveBinds,
    Shutdown,
}

enum ReadyState {
    Pending,
    Ready,
    Failed(Option<StreamError>),
}

struct ReadySignal {
    state: Mutex<ReadyState>,
    changed: Condvar,
}

impl ReadySignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReadyState::Pending),
            changed: Condvar::new(),
        }
    }

    fn set(&self, state: ReadyState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = state;
        self.changed.notify_all();
    }
}

pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    events: Receiver<EngineEvent>,
    ready: Arc<ReadySignal>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Start the engine thread. `build` runs on that thread; between commands
    /// the engine is polled every `poll_interval`.
    pub fn spawn<F>(build: F, poll_interval: Duration) -> StreamResult<Self>
    where
        F: FnOnce() -> StreamResult<StreamEngine> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let ready = Arc::new(ReadySignal::new());
        let thread_ready = Arc::clone(&ready);

        let thread = thread::Builder::new()
            .name("soundboard-engine".to_string())
            .spawn(move || {
                let engine = match build() {
                    Ok(engine) => engine,
                    Err(e) => {
                        log::error!("Stream engine failed to start: {}", e);
                        thread_ready.set(ReadyState::Failed(Some(e)));
                        return;
                    }
                };
                thread_ready.set(ReadyState::Ready);
                run(engine, command_rx, event_tx, poll_interval);
            })?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            ready,
            thread: Some(thread),
        })
    }

    /// Block until the engine is built. `Ok(false)` on timeout; the build
    /// error if construction failed (returned once).
    pub fn wait_for_ready(&self, timeout: Duration) -> StreamResult<bool> {
        let guard = self.ready.state.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .ready
            .changed
            .wait_timeout_while(guard, timeout, |s| matches!(s, ReadyState::Pending))
            .unwrap_or_else(|e| e.into_inner());

        match &mut *guard {
            ReadyState::Pending => Ok(false),
            ReadyState::Ready => Ok(true),
            ReadyState::Failed(error) => match error.take() {
                Some(e) => Err(e),
                None => Err(StreamError::Configuration("Stream engine failed to start".into())),
            },
        }
    }

    /// A sender for hotkey sources and other producers
    pub fn sender(&self) -> Sender<EngineCommand> {
        self.commands.clone()
    }

    /// Queue a command. Fails once the engine thread has exited.
    pub fn send(&self, command: EngineCommand) -> StreamResult<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::Configuration("Stream engine is not running".into()))
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    /// Stop every stream, save the keybinds and join the thread
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(EngineCommand::Shutdown);
        if thread.join().is_err() {
            log::error!("Stream engine thread panicked");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn run(
    mut engine: StreamEngine,
    commands: Receiver<EngineCommand>,
    events: Sender<EngineEvent>,
    poll_interval: Duration,
) {
    loop {
        let shutdown = match commands.recv_timeout(poll_interval) {
            Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => true,
            Ok(command) => {
                engine.execute(command);
                false
            }
            Err(RecvTimeoutError::Timeout) => false,
        };

        if shutdown {
            engine.shutdown();
        } else {
            engine.poll();
        }
        for event in engine.drain_events() {
            // The receiver may already be gone during teardown
            let _ = events.send(event);
        }
        if shutdown {
            break;
        }
    }
    log::info!("Stream engine thread exiting");
}
