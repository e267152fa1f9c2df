//! WAVE / AIFF streaming backend.
//!
//! Plays once per start; no pause, no rewind. Volume is applied while
//! encoding into the hardware buffer.

use std::path::Path;

use super::pcm::{decode_file, PcmTrack};
use super::BackendResult;
use crate::format::HardwareFormat;
use crate::MAX_VOLUME;

pub struct WaveStream {
    track: PcmTrack,
    hardware: HardwareFormat,
    playing: bool,
    gain: f32,
}

impl WaveStream {
    /// `magic` is the sniffed header; it only picks the decoder hint.
    pub fn load(path: &Path, magic: &[u8; 4], hardware: &HardwareFormat) -> BackendResult<Self> {
        let hint = if magic == b"FORM" { "aiff" } else { "wav" };
        let decoded = decode_file(path, hint)?;
        log::debug!(
            "tunemix: wave stream {} ({} Hz, {} ch)",
            path.display(),
            decoded.sample_rate,
            decoded.channels
        );
        Ok(Self {
            track: PcmTrack::new(decoded, hardware),
            hardware: *hardware,
            playing: false,
            gain: 1.0,
        })
    }

    pub fn start(&mut self) {
        self.track.rewind();
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.gain = volume.clamp(0, MAX_VOLUME) as f32 / MAX_VOLUME as f32;
    }

    pub fn is_active(&self) -> bool {
        self.playing && !self.track.is_finished()
    }

    /// Fill `buf`; whatever the stream cannot supply becomes silence.
    pub fn play_some(&mut self, buf: &mut [u8]) {
        let written = if self.playing {
            self.track.fill(buf, &self.hardware, self.gain)
        } else {
            0
        };
        self.hardware.format.fill_silence(&mut buf[written..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample(((i % 64) as i16 - 32) * 500).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn plays_once_then_goes_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_wav(&path, 8000, 1, 100);

        let hw = HardwareFormat::new(8000, SampleFormat::S16Lsb, 1, 64);
        let mut wave = WaveStream::load(&path, b"RIFF", &hw).unwrap();
        assert!(!wave.is_active());

        wave.start();
        assert!(wave.is_active());

        let mut buf = vec![0u8; 1024];
        wave.play_some(&mut buf);
        assert!(!wave.is_active());
        // Tail past the 100 decoded frames is silence
        assert!(buf[200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stop_silences_and_deactivates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8000, 2, 400);

        let hw = HardwareFormat::new(8000, SampleFormat::U8, 2, 64);
        let mut wave = WaveStream::load(&path, b"RIFF", &hw).unwrap();
        wave.start();
        wave.stop();
        assert!(!wave.is_active());

        let mut buf = vec![0u8; 16];
        wave.play_some(&mut buf);
        assert!(buf.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn zero_volume_renders_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.wav");
        write_wav(&path, 8000, 1, 50);

        let hw = HardwareFormat::new(8000, SampleFormat::S16Lsb, 1, 64);
        let mut wave = WaveStream::load(&path, b"RIFF", &hw).unwrap();
        wave.set_volume(0);
        wave.start();
        let mut buf = vec![0xAAu8; 40];
        wave.play_some(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn garbage_riff_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"RIFF\x00\x00\x00\x00garbage").unwrap();
        let hw = HardwareFormat::new(8000, SampleFormat::S16Lsb, 1, 64);
        assert!(WaveStream::load(&path, b"RIFF", &hw).is_err());
    }
}
