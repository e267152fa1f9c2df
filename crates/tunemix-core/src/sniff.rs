//! Format sniffing: pick a backend from the first four bytes of a file.
//!
//! | magic                         | backend |
//! |-------------------------------|---------|
//! | external command configured   | Command |
//! | `RIFF` or `FORM`              | Wave    |
//! | `MThd`                        | Midi    |
//! | `0xFF`, byte 2 high nibble F  | Mpeg    |
//! | anything else                 | Module  |
//!
//! The file extension is never consulted.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::backends::{BackendKind, BackendSet};
use crate::error::{MusicError, MusicResult};

/// Classify a 4-byte header against the enabled backends.
///
/// Returns `None` when no enabled rule matches and the module fallback is
/// disabled too.
pub fn classify_magic(magic: &[u8; 4], enabled: &BackendSet, command: Option<&str>) -> Option<BackendKind> {
    if command.is_some() && enabled.contains(BackendKind::Command) {
        return Some(BackendKind::Command);
    }

    let candidate = if magic == b"RIFF" || magic == b"FORM" {
        Some(BackendKind::Wave)
    } else if magic == b"MThd" {
        Some(BackendKind::Midi)
    } else if magic[0] == 0xFF && magic[1] >> 4 == 0x0F {
        Some(BackendKind::Mpeg)
    } else {
        None
    };

    match candidate {
        Some(kind) if enabled.contains(kind) => Some(kind),
        _ if enabled.contains(BackendKind::Module) => Some(BackendKind::Module),
        _ => None,
    }
}

/// Read the first four bytes of `source`.
pub fn read_magic<R: Read>(source: &mut R) -> std::io::Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    source.read_exact(&mut magic)?;
    Ok(magic)
}

/// Open `path`, read its header and classify it.
pub fn sniff_path(path: &Path, enabled: &BackendSet, command: Option<&str>) -> MusicResult<(BackendKind, [u8; 4])> {
    let unreadable = |source: std::io::Error| MusicError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(unreadable)?;
    let magic = read_magic(&mut file).map_err(unreadable)?;

    let kind = classify_magic(&magic, enabled, command).ok_or_else(|| MusicError::UnsupportedOrCorruptFormat {
        path: path.to_path_buf(),
        reason: "unrecognized music format".into(),
    })?;
    log::debug!("tunemix: {} sniffed as {}", path.display(), kind);
    Ok((kind, magic))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> BackendSet {
        BackendSet::all()
    }

    #[test]
    fn magic_table() {
        assert_eq!(classify_magic(b"RIFF", &all(), None), Some(BackendKind::Wave));
        assert_eq!(classify_magic(b"FORM", &all(), None), Some(BackendKind::Wave));
        assert_eq!(classify_magic(b"MThd", &all(), None), Some(BackendKind::Midi));
        assert_eq!(classify_magic(&[0xFF, 0xFB, 0x90, 0x00], &all(), None), Some(BackendKind::Mpeg));
        assert_eq!(classify_magic(&[0xFF, 0xF3, 0x00, 0x00], &all(), None), Some(BackendKind::Mpeg));
        assert_eq!(classify_magic(b"M.K.", &all(), None), Some(BackendKind::Module));
    }

    #[test]
    fn near_miss_mpeg_sync_falls_back_to_module() {
        assert_eq!(classify_magic(&[0xFF, 0xE0, 0x00, 0x00], &all(), None), Some(BackendKind::Module));
        assert_eq!(classify_magic(&[0xFE, 0xFB, 0x00, 0x00], &all(), None), Some(BackendKind::Module));
    }

    #[test]
    fn command_takes_priority() {
        assert_eq!(classify_magic(b"RIFF", &all(), Some("mpg123")), Some(BackendKind::Command));
        assert_eq!(classify_magic(b"MThd", &all(), Some("timidity")), Some(BackendKind::Command));
    }

    #[test]
    fn command_ignored_when_disabled() {
        let mut set = all();
        set.remove(BackendKind::Command);
        assert_eq!(classify_magic(b"RIFF", &set, Some("mpg123")), Some(BackendKind::Wave));
    }

    #[test]
    fn disabled_rule_falls_through_to_module() {
        let mut set = all();
        set.remove(BackendKind::Midi);
        assert_eq!(classify_magic(b"MThd", &set, None), Some(BackendKind::Module));

        set.remove(BackendKind::Module);
        assert_eq!(classify_magic(b"MThd", &set, None), None);
        assert_eq!(classify_magic(b"RIFF", &set, None), Some(BackendKind::Wave));
    }

    #[test]
    fn short_or_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.mid");
        std::fs::write(&short, b"MTh").unwrap();
        assert!(matches!(
            sniff_path(&short, &all(), None),
            Err(MusicError::UnreadableFile { .. })
        ));
        assert!(matches!(
            sniff_path(&dir.path().join("absent.mp3"), &all(), None),
            Err(MusicError::UnreadableFile { .. })
        ));
    }

    #[test]
    fn extension_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actually_wave.mod");
        std::fs::write(&path, b"RIFF\0\0\0\0WAVE").unwrap();
        let (kind, magic) = sniff_path(&path, &all(), None).unwrap();
        assert_eq!(kind, BackendKind::Wave);
        assert_eq!(&magic, b"RIFF");
    }

    #[test]
    fn no_fallback_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery.bin");
        std::fs::write(&path, b"\0\0\0\0").unwrap();
        let set: BackendSet = [BackendKind::Wave].into_iter().collect();
        assert!(matches!(
            sniff_path(&path, &set, None),
            Err(MusicError::UnsupportedOrCorruptFormat { .. })
        ));
    }
}
