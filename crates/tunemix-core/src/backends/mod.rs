//! Backend adapters.
//!
//! Each adapter wraps one engine and exposes the subset of
//! load / start / stop / pause / resume / set_volume / is_active / fill /
//! rewind that the engine supports. Capability gaps are explicit in the
//! dispatch in `music.rs`, not hidden behind no-op trait methods.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod command;
pub mod midi;
pub mod module;
pub mod mpeg;
pub(crate) mod pcm;
pub mod wave;

/// Which engine owns a loaded piece of music.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Command,
    Wave,
    Module,
    Midi,
    Mpeg,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Command,
        BackendKind::Wave,
        BackendKind::Module,
        BackendKind::Midi,
        BackendKind::Mpeg,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Command => "command",
            BackendKind::Wave => "wave",
            BackendKind::Module => "module",
            BackendKind::Midi => "midi",
            BackendKind::Mpeg => "mpeg",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry of enabled backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSet(u8);

impl BackendSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        BackendKind::ALL.into_iter().collect()
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: BackendKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: BackendKind) {
        self.0 &= !kind.bit();
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        BackendKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl Default for BackendSet {
    /// Everything; the external command player only on unix.
    fn default() -> Self {
        let mut set = Self::all();
        if !cfg!(unix) {
            set.remove(BackendKind::Command);
        }
        set
    }
}

impl FromIterator<BackendKind> for BackendSet {
    fn from_iter<I: IntoIterator<Item = BackendKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Failure inside a backend engine.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("{0}")]
    Format(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
