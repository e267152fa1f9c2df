//! Serialisable control and status types shared by the C ABI and the CLI.

pub mod playback;
pub mod status;

pub use playback::PlaybackCommand;
pub use status::MusicStatus;
