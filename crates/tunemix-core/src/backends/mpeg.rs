//! MPEG audio backend.
//!
//! The only backend with a loop count, a real pause and rewind-to-start.
//! Decoding targets the format negotiated with the hardware, so the fill
//! path is a straight encode.

use std::path::Path;

use super::pcm::{decode_file, PcmTrack};
use super::BackendResult;
use crate::format::HardwareFormat;
use crate::MAX_VOLUME;

/// Loop count meaning "repeat until halted".
pub const LOOP_FOREVER: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegStatus {
    Stopped,
    Playing,
    Paused,
}

pub struct MpegStream {
    track: PcmTrack,
    hardware: HardwareFormat,
    status: MpegStatus,
    /// Extra passes left after the current one; negative repeats forever.
    loops_left: i32,
    gain: f32,
}

impl MpegStream {
    pub fn load(path: &Path, hardware: &HardwareFormat) -> BackendResult<Self> {
        let decoded = decode_file(path, "mp3")?;
        log::debug!(
            "tunemix: mpeg stream {} ({} Hz, {} ch) -> {}",
            path.display(),
            decoded.sample_rate,
            decoded.channels,
            hardware
        );
        Ok(Self {
            track: PcmTrack::new(decoded, hardware),
            hardware: *hardware,
            status: MpegStatus::Stopped,
            loops_left: 0,
            gain: 1.0,
        })
    }

    pub fn play(&mut self, loops: i32) {
        self.track.rewind();
        self.loops_left = loops;
        self.status = MpegStatus::Playing;
    }

    pub fn stop(&mut self) {
        self.status = MpegStatus::Stopped;
    }

    pub fn pause(&mut self) {
        if self.status == MpegStatus::Playing {
            self.status = MpegStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.status == MpegStatus::Paused {
            self.status = MpegStatus::Playing;
        }
    }

    pub fn rewind(&mut self) {
        self.track.rewind();
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.gain = volume.clamp(0, MAX_VOLUME) as f32 / MAX_VOLUME as f32;
    }

    pub fn status(&self) -> MpegStatus {
        self.status
    }

    /// Paused streams still count as active.
    pub fn is_active(&self) -> bool {
        self.status != MpegStatus::Stopped
    }

    pub fn play_audio(&mut self, buf: &mut [u8]) {
        let mut written = 0;
        while self.status == MpegStatus::Playing && written < buf.len() {
            let n = self.track.fill(&mut buf[written..], &self.hardware, self.gain);
            written += n;
            if self.track.is_finished() {
                if self.loops_left == 0 || self.track.frames() == 0 {
                    self.status = MpegStatus::Stopped;
                } else {
                    if self.loops_left > 0 {
                        self.loops_left -= 1;
                    }
                    self.track.rewind();
                }
            } else if n == 0 {
                // Less than one frame of room left
                break;
            }
        }
        self.hardware.format.fill_silence(&mut buf[written..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::pcm::DecodedAudio;
    use crate::format::SampleFormat;

    fn stream(frames: usize) -> MpegStream {
        let hardware = HardwareFormat::new(8000, SampleFormat::S16Lsb, 1, 64);
        let decoded = DecodedAudio {
            samples: vec![0.5; frames],
            sample_rate: 8000,
            channels: 1,
        };
        MpegStream {
            track: PcmTrack::new(decoded, &hardware),
            hardware,
            status: MpegStatus::Stopped,
            loops_left: 0,
            gain: 1.0,
        }
    }

    fn nonzero_frames(buf: &[u8]) -> usize {
        buf.chunks_exact(2).filter(|p| p != &[0, 0]).count()
    }

    #[test]
    fn plays_once_without_loops() {
        let mut s = stream(10);
        s.play(0);
        let mut buf = [0u8; 64];
        s.play_audio(&mut buf);
        assert_eq!(nonzero_frames(&buf), 10);
        assert_eq!(s.status(), MpegStatus::Stopped);
        assert!(!s.is_active());
    }

    #[test]
    fn loop_count_repeats_track() {
        let mut s = stream(10);
        s.play(2);
        let mut buf = [0u8; 100];
        s.play_audio(&mut buf);
        assert_eq!(nonzero_frames(&buf), 30);
        assert!(!s.is_active());
    }

    #[test]
    fn loop_forever_keeps_playing() {
        let mut s = stream(10);
        s.play(LOOP_FOREVER);
        let mut buf = [0u8; 400];
        s.play_audio(&mut buf);
        assert_eq!(nonzero_frames(&buf), 200);
        assert!(s.is_active());
    }

    #[test]
    fn pause_outputs_silence_and_stays_active() {
        let mut s = stream(10);
        s.play(0);
        s.pause();
        assert_eq!(s.status(), MpegStatus::Paused);
        assert!(s.is_active());
        let mut buf = [0xAAu8; 8];
        s.play_audio(&mut buf);
        assert_eq!(buf, [0; 8]);

        s.resume();
        s.play_audio(&mut buf);
        assert_eq!(nonzero_frames(&buf), 4);
    }

    #[test]
    fn rewind_restarts_from_first_frame() {
        let mut s = stream(10);
        s.play(0);
        let mut buf = [0u8; 16];
        s.play_audio(&mut buf);
        s.rewind();
        let mut buf = [0u8; 64];
        s.play_audio(&mut buf);
        assert_eq!(nonzero_frames(&buf), 10);
    }
}
