//! Mixer configuration.
//!
//! Plain serde struct; every field has a default so a partial JSON document
//! (or none at all) yields a working setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backends::{BackendKind, BackendSet};
use crate::error::{MusicError, MusicResult};
use crate::MAX_VOLUME;

/// Environment variable naming an external music player command.
pub const MUSIC_CMD_ENV: &str = "TUNEMIX_MUSIC_CMD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Backends available to the sniffer and loader.
    pub backends: Vec<BackendKind>,
    /// External player command used for every load while set.
    pub music_command: Option<String>,
    /// Music volume right after negotiation (0..=MAX_VOLUME).
    pub initial_volume: i32,
    pub module: ModuleSettings,
    pub midi: MidiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Driver output level, 0..=128.
    pub master_volume: u8,
    /// Stereo separation, 0 (mono) ..=128 (hard left/right).
    pub pan_separation: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    /// When false the synthesizer's startup probe always fails.
    pub enabled: bool,
    /// Polyphony limit.
    pub voices: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            backends: BackendSet::default().kinds().collect(),
            music_command: None,
            initial_volume: MAX_VOLUME,
            module: ModuleSettings::default(),
            midi: MidiSettings::default(),
        }
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            master_volume: 96,
            pan_separation: 128,
        }
    }
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            voices: 32,
        }
    }
}

impl MixerConfig {
    pub fn from_json(text: &str) -> MusicResult<Self> {
        serde_json::from_str(text).map_err(|e| MusicError::Config(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> MusicResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MusicError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Let `TUNEMIX_MUSIC_CMD` override `music_command` when it is set and
    /// not blank.
    pub fn apply_env(mut self) -> Self {
        if let Ok(cmd) = std::env::var(MUSIC_CMD_ENV) {
            if !cmd.trim().is_empty() {
                self.music_command = Some(cmd);
            }
        }
        self
    }

    /// The capability registry described by `backends`.
    pub fn backend_set(&self) -> BackendSet {
        self.backends.iter().copied().collect()
    }
}
