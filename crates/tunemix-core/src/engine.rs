//! tunemix engine: the playback coordinator.
//!
//! Owns the single "currently playing music" slot and the format decisions
//! made when it opened. Control calls lock the slot; the mixing bridge
//! (`MixHandle::mix`) only ever `try_lock`s it, so a control call in
//! progress makes the callback leave its buffer alone instead of blocking.
//!
//! Lock order is always slot, then a handle's backend.
//!
//! The slot owns a strong reference to the active handle and only ever drops
//! it under a control call, so backend teardown stays off the audio thread.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backends::{BackendKind, BackendSet};
use crate::config::MixerConfig;
use crate::error::{MusicError, MusicResult};
use crate::format::HardwareFormat;
use crate::models::{MusicStatus, PlaybackCommand};
use crate::music::{load_backend, Music, MusicInner};
use crate::negotiate::{negotiate, MixCorrection, Negotiated};
use crate::sniff::sniff_path;
use crate::MAX_VOLUME;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Slot {
    active: Option<Arc<MusicInner>>,
    /// False while paused.
    audible: bool,
    volume: i32,
    command: Option<String>,
    closed: bool,
}

impl Slot {
    /// The active handle, unless its `Music` has been dropped.
    fn active(&self) -> Option<&Arc<MusicInner>> {
        self.active.as_ref().filter(|inner| !inner.is_released())
    }

    fn is_active(&self, music: &Music) -> bool {
        self.active
            .as_ref()
            .is_some_and(|inner| Arc::ptr_eq(inner, &music.inner))
    }

    /// Clear the slot, then stop whatever was in it.
    fn halt(&mut self) {
        if let Some(inner) = self.active.take() {
            inner.backend.lock().stop();
            log::debug!("tunemix: halted music #{}", inner.id);
        }
        self.audible = false;
    }
}

struct Shared {
    slot: Mutex<Slot>,
    negotiated: Negotiated,
    backends: BackendSet,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The music engine. Exactly one piece of music plays at a time.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Negotiate with the hardware format and build an engine.
    ///
    /// Fails with the first negotiation error; nothing half-set-up is
    /// ever returned.
    pub fn open(hardware: HardwareFormat, config: MixerConfig) -> MusicResult<Self> {
        let negotiated = negotiate(&hardware, &config)?;
        let backends = config.backend_set();

        let command = match config.music_command {
            Some(cmd) if backends.contains(BackendKind::Command) => Some(cmd),
            Some(_) => {
                log::warn!("tunemix: music command ignored, command backend is disabled");
                None
            }
            None => None,
        };

        log::info!(
            "tunemix: engine open ({}), backends: {:?}",
            hardware,
            backends.kinds().collect::<Vec<_>>()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    active: None,
                    audible: false,
                    volume: config.initial_volume.clamp(0, MAX_VOLUME),
                    command,
                    closed: false,
                }),
                negotiated,
                backends,
            }),
        })
    }

    /// Handle for the audio thread.
    pub fn mix_handle(&self) -> MixHandle {
        MixHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.shared.slot.lock()
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    /// Sniff `path` and load it with the matching backend.
    ///
    /// Does file I/O; never call it from the audio thread.
    pub fn load(&self, path: impl AsRef<Path>) -> MusicResult<Music> {
        let path = path.as_ref();
        let command = {
            let slot = self.slot();
            if slot.closed {
                return Err(MusicError::Closed);
            }
            slot.command.clone()
        };

        let (kind, magic) = sniff_path(path, &self.shared.backends, command.as_deref())?;
        let music = load_backend(path, kind, &magic, &self.shared.negotiated, command.as_deref())?;
        log::info!("tunemix: loaded {} as {} (#{})", path.display(), kind, music.id());
        Ok(music)
    }

    /// Release a handle, halting it first when it is the active one.
    pub fn free_music(&self, music: Music) {
        let mut slot = self.slot();
        if slot.is_active(&music) {
            slot.halt();
        }
        drop(slot);
        log::debug!("tunemix: freed music #{}", music.id());
    }

    // -----------------------------------------------------------------------
    // Playback control
    // -----------------------------------------------------------------------

    /// Start `music`. `loops` only matters for MPEG: 0 plays once, n adds n
    /// passes, -1 repeats until halted.
    ///
    /// A different handle that is still playing is halted once the new one
    /// has started. If starting fails, the slot is left as it was.
    pub fn play(&self, music: &Music, loops: i32) -> MusicResult<()> {
        let mut slot = self.slot();
        if slot.closed {
            return Err(MusicError::Closed);
        }

        {
            let mut backend = music.inner.backend.lock();
            backend.set_volume(slot.volume);
            backend.start(loops).map_err(|e| {
                log::warn!("tunemix: {} failed to start: {}", music.kind(), e);
                MusicError::BackendStartFailed {
                    kind: music.kind(),
                    reason: e.to_string(),
                }
            })?;
        }

        if !slot.is_active(music) {
            slot.halt();
        }
        slot.active = Some(Arc::clone(&music.inner));
        slot.audible = true;
        log::info!("tunemix: playing music #{} ({})", music.id(), music.kind());
        Ok(())
    }

    /// Stop the active music. Succeeds without an active handle.
    pub fn halt(&self) -> MusicResult<()> {
        self.slot().halt();
        Ok(())
    }

    /// Pause the active music. Only the command and MPEG backends actually
    /// pause; the others keep rendering.
    pub fn pause(&self) {
        let mut slot = self.slot();
        if let Some(inner) = slot.active() {
            inner.backend.lock().pause();
        }
        slot.audible = false;
    }

    pub fn resume(&self) {
        let mut slot = self.slot();
        if let Some(inner) = slot.active() {
            inner.backend.lock().resume();
        }
        slot.audible = true;
    }

    /// Restart the active music from the beginning (MPEG only).
    pub fn rewind(&self) {
        if let Some(inner) = self.slot().active() {
            inner.backend.lock().rewind();
        }
    }

    /// Set the music volume and return the previous one. Negative values
    /// only query; larger ones clamp to `MAX_VOLUME`.
    pub fn set_volume(&self, volume: i32) -> i32 {
        let mut slot = self.slot();
        let previous = slot.volume;
        if volume >= 0 {
            let volume = volume.min(MAX_VOLUME);
            slot.volume = volume;
            if let Some(inner) = slot.active() {
                inner.backend.lock().set_volume(volume);
            }
        }
        previous
    }

    pub fn volume(&self) -> i32 {
        self.slot().volume
    }

    /// Whether music is playing. Clears the slot (releasing the backend
    /// here, on the calling thread) when the active handle has finished or
    /// been dropped.
    pub fn is_playing(&self) -> bool {
        let mut slot = self.slot();
        let finished = match &slot.active {
            Some(inner) => inner.is_released() || !inner.backend.lock().is_active(),
            None => false,
        };
        if finished {
            log::debug!("tunemix: active music finished");
            slot.active = None;
            slot.audible = false;
        }
        slot.active.is_some()
    }

    /// Playing, but paused.
    pub fn is_paused(&self) -> bool {
        self.is_playing() && !self.slot().audible
    }

    /// Backend of the active handle.
    pub fn playing_kind(&self) -> Option<BackendKind> {
        if !self.is_playing() {
            return None;
        }
        self.slot().active().map(|inner| inner.kind)
    }

    /// Route every later load through an external player (`None` clears).
    /// Halts the active music first.
    pub fn set_music_cmd(&self, command: Option<&str>) -> MusicResult<()> {
        if command.is_some() && !self.shared.backends.contains(BackendKind::Command) {
            return Err(MusicError::UnsupportedOperation(
                "command backend is disabled".into(),
            ));
        }

        let mut slot = self.slot();
        slot.halt();
        slot.command = None;
        if let Some(cmd) = command {
            let mut owned = String::new();
            owned
                .try_reserve_exact(cmd.len())
                .map_err(|_| MusicError::AllocationFailure)?;
            owned.push_str(cmd);
            log::info!("tunemix: music command set to '{}'", owned);
            slot.command = Some(owned);
        }
        Ok(())
    }

    pub fn music_command(&self) -> Option<String> {
        self.slot().command.clone()
    }

    /// Dispatch a serialised control command.
    pub fn command(&self, cmd: PlaybackCommand) -> MusicResult<()> {
        match cmd {
            PlaybackCommand::Halt => self.halt()?,
            PlaybackCommand::Pause => self.pause(),
            PlaybackCommand::Resume => self.resume(),
            PlaybackCommand::Rewind => self.rewind(),
            PlaybackCommand::Volume { volume } => {
                self.set_volume(volume);
            }
        }
        Ok(())
    }

    pub fn status(&self) -> MusicStatus {
        let playing = self.is_playing();
        let slot = self.slot();
        let active = slot.active();
        MusicStatus {
            playing,
            paused: playing && !slot.audible,
            kind: active.as_ref().map(|inner| inner.kind),
            music_id: active.as_ref().map(|inner| inner.id),
            volume: slot.volume,
            music_command: slot.command.clone(),
            hardware: self.shared.negotiated.hardware,
        }
    }

    pub fn hardware_format(&self) -> HardwareFormat {
        self.shared.negotiated.hardware
    }

    pub fn correction(&self) -> MixCorrection {
        self.shared.negotiated.correction
    }

    pub fn backends(&self) -> BackendSet {
        self.shared.backends
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Halt, clear the command and refuse further loads. Idempotent.
    pub fn shutdown(&self) {
        let mut slot = self.slot();
        if slot.closed {
            return;
        }
        slot.halt();
        slot.command = None;
        slot.closed = true;
        log::info!("tunemix: engine shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Mixing bridge
// ---------------------------------------------------------------------------

/// Cheap, cloneable view of the engine for the real-time audio thread.
#[derive(Clone)]
pub struct MixHandle {
    shared: Arc<Shared>,
}

impl MixHandle {
    /// Render the active music into one hardware buffer.
    ///
    /// Leaves `buf` untouched when nothing is active, when the active handle
    /// was dropped, or when a control call holds the slot. Never blocks,
    /// allocates or logs.
    pub fn mix(&self, buf: &mut [u8]) {
        let Some(slot) = self.shared.slot.try_lock() else {
            return;
        };
        let Some(inner) = slot.active() else {
            return;
        };
        let Some(mut backend) = inner.backend.try_lock() else {
            return;
        };
        backend.mix(buf, &self.shared.negotiated.correction);
    }

    pub fn hardware_format(&self) -> HardwareFormat {
        self.shared.negotiated.hardware
    }
}
