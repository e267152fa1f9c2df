//! Playback control commands.
//!
//! A tagged enum so control surfaces (the C ABI, the CLI's stdin loop) can
//! send `{"action": "volume", "volume": 64}` and friends as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlaybackCommand {
    Halt,
    Pause,
    Resume,
    Rewind,
    /// Negative values only query.
    Volume { volume: i32 },
}

impl PlaybackCommand {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        serde_json::from_value(v.clone()).ok()
    }

    /// Parse a one-line text command: `halt`, `stop`, `pause`, `resume`,
    /// `rewind` or `volume <n>`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let cmd = match words.next()? {
            "halt" | "stop" => PlaybackCommand::Halt,
            "pause" => PlaybackCommand::Pause,
            "resume" => PlaybackCommand::Resume,
            "rewind" => PlaybackCommand::Rewind,
            "volume" | "vol" => PlaybackCommand::Volume {
                volume: words.next()?.parse().ok()?,
            },
            _ => return None,
        };
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let v = PlaybackCommand::Volume { volume: 64 }.to_value();
        assert_eq!(v, serde_json::json!({"action": "volume", "volume": 64}));
        assert_eq!(
            PlaybackCommand::from_value(&serde_json::json!({"action": "rewind"})),
            Some(PlaybackCommand::Rewind)
        );
        assert_eq!(PlaybackCommand::from_value(&serde_json::json!({"action": "seek"})), None);
    }

    #[test]
    fn text_lines() {
        assert_eq!(PlaybackCommand::parse_line("stop"), Some(PlaybackCommand::Halt));
        assert_eq!(
            PlaybackCommand::parse_line("  volume 12 "),
            Some(PlaybackCommand::Volume { volume: 12 })
        );
        assert_eq!(PlaybackCommand::parse_line("volume loud"), None);
        assert_eq!(PlaybackCommand::parse_line(""), None);
    }
}
