//! Error taxonomy for loading, negotiation and playback control.
//!
//! Load-time and negotiation-time failures are returned to the caller.
//! Runtime capability gaps (pause on a backend that cannot pause) are not
//! errors at all, and the mixing bridge never fails.

use std::path::PathBuf;

use crate::backends::BackendKind;
use crate::format::SampleFormat;

/// Result alias used across the crate.
pub type MusicResult<T> = Result<T, MusicError>;

#[derive(thiserror::Error, Debug)]
pub enum MusicError {
    /// The file could not be opened or has fewer than 4 bytes.
    #[error("couldn't read from '{}'", path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The selected backend rejected the file.
    #[error("unsupported or corrupt music file '{}': {reason}", path.display())]
    UnsupportedOrCorruptFormat { path: PathBuf, reason: String },

    /// The MIDI synthesizer failed its startup probe during negotiation.
    #[error("MIDI synthesis engine unavailable: {0}")]
    SynthesisEngineUnavailable(String),

    /// No music handle was supplied.
    #[error("no music handle")]
    NullHandle,

    /// The backend refused to start playback.
    #[error("{kind} backend failed to start: {reason}")]
    BackendStartFailed { kind: BackendKind, reason: String },

    /// The hardware negotiated an encoding the mixer cannot produce.
    #[error("unknown hardware audio format: {0:?}")]
    UnsupportedHardwareFormat(SampleFormat),

    /// The hardware uses more channels than the mixer supports.
    #[error("hardware uses more channels than mixer ({0} > 2)")]
    TooManyChannels(u16),

    /// Storage for a control string could not be reserved.
    #[error("out of memory")]
    AllocationFailure,

    /// The operation has no handler in the enabled backend set.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The engine has been shut down.
    #[error("music engine is shut down")]
    Closed,

    /// The configuration could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The host audio device could not be opened or driven.
    #[error("audio device error: {0}")]
    AudioDevice(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        let err = MusicError::UnsupportedOrCorruptFormat {
            path: PathBuf::from("song.xyz"),
            reason: "unrecognized music format".into(),
        };
        assert!(err.to_string().contains("song.xyz"));
        assert!(err.to_string().contains("unrecognized"));

        let err = MusicError::BackendStartFailed {
            kind: BackendKind::Command,
            reason: "spawn failed".into(),
        };
        assert_eq!(err.to_string(), "command backend failed to start: spawn failed");

        assert!(MusicError::TooManyChannels(6).to_string().contains("6 > 2"));
    }

    #[test]
    fn unreadable_file_keeps_io_source() {
        use std::error::Error as _;
        let err = MusicError::UnreadableFile {
            path: PathBuf::from("/nope"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.source().is_some());
    }
}
