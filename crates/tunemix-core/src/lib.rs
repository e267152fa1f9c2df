//! tunemix-core: music playback coordination for a software mixer.
//!
//! One piece of music plays at a time. Files are sniffed by their first
//! four bytes and handed to one of five backends; the host mixer pulls
//! audio through a real-time-safe bridge.
//!
//! # Architecture
//!
//! ```text
//! host mixer ──open(hw)──▶ negotiate ──▶ Engine (slot: active / audible / volume)
//!                                          │ load: sniff ──▶ Backend
//! audio thread ──mix(buf)──▶ MixHandle ────┘ (try_lock, never blocks)
//! ```
//!
//! Backends: external command, WAVE/AIFF, tracker module, MIDI, MPEG audio.

pub mod backends;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
#[cfg(feature = "native")]
pub mod host;
pub mod models;
pub mod music;
pub mod negotiate;
pub mod sniff;

/// Full music volume.
pub const MAX_VOLUME: i32 = 128;

pub use backends::{BackendKind, BackendSet};
pub use config::MixerConfig;
pub use engine::{Engine, MixHandle};
pub use error::{MusicError, MusicResult};
pub use format::{HardwareFormat, SampleFormat};
pub use models::*;
pub use music::Music;
pub use negotiate::MixCorrection;

#[cfg(feature = "native")]
pub use host::AudioOutput;
