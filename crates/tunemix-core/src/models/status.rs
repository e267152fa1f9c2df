use serde::{Deserialize, Serialize};

use crate::backends::BackendKind;
use crate::format::HardwareFormat;

/// Snapshot of the engine's playback slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicStatus {
    pub playing: bool,
    pub paused: bool,
    /// Backend of the active handle, if any.
    pub kind: Option<BackendKind>,
    /// Id of the active handle, if any.
    pub music_id: Option<u64>,
    pub volume: i32,
    pub music_command: Option<String>,
    pub hardware: HardwareFormat,
}
