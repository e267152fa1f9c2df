//! Music handles and backend dispatch.
//!
//! `Backend` is a closed enum over the five adapters. Each operation is an
//! explicit match, so a capability gap (pause on a module, rewind on a
//! wave) is visible right here rather than hidden in a default method.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backends::command::CommandSong;
use crate::backends::midi::MidiSong;
use crate::backends::module::ModuleSong;
use crate::backends::mpeg::MpegStream;
use crate::backends::wave::WaveStream;
use crate::backends::{BackendKind, BackendResult};
use crate::error::{MusicError, MusicResult};
use crate::negotiate::{MixCorrection, Negotiated};

pub(crate) enum Backend {
    Command(CommandSong),
    Wave(WaveStream),
    Module(ModuleSong),
    Midi(MidiSong),
    Mpeg(MpegStream),
}

impl Backend {
    pub fn start(&mut self, loops: i32) -> BackendResult<()> {
        match self {
            Backend::Command(song) => song.start()?,
            Backend::Wave(stream) => stream.start(),
            Backend::Module(song) => song.start(),
            Backend::Midi(song) => song.start(),
            Backend::Mpeg(stream) => stream.play(loops),
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        match self {
            Backend::Command(song) => song.stop(),
            Backend::Wave(stream) => stream.stop(),
            Backend::Module(song) => song.stop(),
            Backend::Midi(song) => song.stop(),
            Backend::Mpeg(stream) => stream.stop(),
        }
    }

    pub fn pause(&mut self) {
        match self {
            Backend::Command(song) => song.pause(),
            Backend::Mpeg(stream) => stream.pause(),
            Backend::Wave(_) | Backend::Module(_) | Backend::Midi(_) => {}
        }
    }

    pub fn resume(&mut self) {
        match self {
            Backend::Command(song) => song.resume(),
            Backend::Mpeg(stream) => stream.resume(),
            Backend::Wave(_) | Backend::Module(_) | Backend::Midi(_) => {}
        }
    }

    pub fn rewind(&mut self) {
        if let Backend::Mpeg(stream) = self {
            stream.rewind();
        }
    }

    pub fn set_volume(&mut self, volume: i32) {
        match self {
            Backend::Command(song) => song.set_volume(volume),
            Backend::Wave(stream) => stream.set_volume(volume),
            Backend::Module(song) => song.set_volume(volume),
            Backend::Midi(song) => song.set_volume(volume),
            Backend::Mpeg(stream) => stream.set_volume(volume),
        }
    }

    pub fn is_active(&mut self) -> bool {
        match self {
            Backend::Command(song) => song.is_active(),
            Backend::Wave(stream) => stream.is_active(),
            Backend::Module(song) => song.is_active(),
            Backend::Midi(song) => song.is_active(),
            Backend::Mpeg(stream) => stream.is_active(),
        }
    }

    /// Render one hardware buffer. Never allocates.
    pub fn mix(&mut self, buf: &mut [u8], correction: &MixCorrection) {
        match self {
            // The child process writes its own audio
            Backend::Command(_) => {}
            Backend::Wave(stream) => stream.play_some(buf),
            Backend::Module(song) => {
                song.fill(buf);
                correction.apply(buf);
            }
            Backend::Midi(song) => {
                let frames = buf.len() / correction.frame_size;
                song.fill(buf, frames);
            }
            Backend::Mpeg(stream) => stream.play_audio(buf),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct MusicInner {
    pub id: u64,
    pub kind: BackendKind,
    pub path: PathBuf,
    pub backend: Mutex<Backend>,
    /// Set once the caller's `Music` is gone.
    released: AtomicBool,
}

impl MusicInner {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// A loaded piece of music.
///
/// Owned by the caller. Dropping a `Music` stops its backend; the engine
/// keeps its own reference to the active handle and lets go of it on the
/// next control call, so a backend is never torn down on the audio thread.
/// [`Engine::free_music`](crate::Engine::free_music) does the same, halting
/// first.
pub struct Music {
    pub(crate) inner: Arc<MusicInner>,
}

impl Music {
    pub fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    /// Process-unique identity of this handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for Music {
    fn drop(&mut self) {
        self.inner.released.store(true, Ordering::Release);
        self.inner.backend.lock().stop();
    }
}

impl std::fmt::Debug for Music {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Music")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Build the backend for an already sniffed file.
pub(crate) fn load_backend(
    path: &Path,
    kind: BackendKind,
    magic: &[u8; 4],
    negotiated: &Negotiated,
    command: Option<&str>,
) -> MusicResult<Music> {
    let loaded = match kind {
        BackendKind::Command => CommandSong::load(command.unwrap_or_default(), path).map(Backend::Command),
        BackendKind::Wave => WaveStream::load(path, magic, &negotiated.hardware).map(Backend::Wave),
        BackendKind::Module => ModuleSong::load(path, &negotiated.module_driver).map(Backend::Module),
        BackendKind::Midi => {
            let synth = negotiated
                .synth
                .as_ref()
                .map_err(|reason| MusicError::SynthesisEngineUnavailable(reason.clone()))?;
            MidiSong::load(path, synth).map(Backend::Midi)
        }
        BackendKind::Mpeg => MpegStream::load(path, &negotiated.hardware).map(Backend::Mpeg),
    };

    let backend = loaded.map_err(|e| {
        log::warn!("tunemix: {} backend rejected {}: {}", kind, path.display(), e);
        MusicError::UnsupportedOrCorruptFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    Ok(Music {
        inner: Arc::new(MusicInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            path: path.to_path_buf(),
            backend: Mutex::new(backend),
            released: AtomicBool::new(false),
        }),
    })
}
