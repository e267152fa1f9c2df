//! Hardware sample formats and PCM encoding.
//!
//! The host mixer negotiates one `HardwareFormat` at startup. Every backend
//! that renders through the engine writes frames in that format.

use serde::{Deserialize, Serialize};

/// Sample encoding of the hardware buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S8,
    U16Lsb,
    S16Lsb,
    U16Msb,
    S16Msb,
}

impl SampleFormat {
    /// Signed 16-bit in host byte order.
    #[cfg(target_endian = "little")]
    pub const S16_NATIVE: SampleFormat = SampleFormat::S16Lsb;
    #[cfg(target_endian = "big")]
    pub const S16_NATIVE: SampleFormat = SampleFormat::S16Msb;

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 1,
            _ => 2,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, SampleFormat::S8 | SampleFormat::S16Lsb | SampleFormat::S16Msb)
    }

    pub fn is_big_endian(self) -> bool {
        matches!(self, SampleFormat::U16Msb | SampleFormat::S16Msb)
    }

    /// Write one sample in `[-1.0, 1.0]` into `out` (`bytes_per_sample` long).
    #[inline]
    pub fn encode(self, value: f32, out: &mut [u8]) {
        let v = value.clamp(-1.0, 1.0);
        match self {
            SampleFormat::U8 => out[0] = (v * 127.0 + 128.0) as u8,
            SampleFormat::S8 => out[0] = (v * 127.0) as i8 as u8,
            SampleFormat::U16Lsb => {
                out[..2].copy_from_slice(&((v * 32767.0 + 32768.0) as u16).to_le_bytes())
            }
            SampleFormat::U16Msb => {
                out[..2].copy_from_slice(&((v * 32767.0 + 32768.0) as u16).to_be_bytes())
            }
            SampleFormat::S16Lsb => out[..2].copy_from_slice(&((v * 32767.0) as i16).to_le_bytes()),
            SampleFormat::S16Msb => out[..2].copy_from_slice(&((v * 32767.0) as i16).to_be_bytes()),
        }
    }

    /// Fill `buf` with this format's silence.
    pub fn fill_silence(self, buf: &mut [u8]) {
        match self {
            SampleFormat::U8 => buf.fill(0x80),
            SampleFormat::U16Lsb => {
                for pair in buf.chunks_exact_mut(2) {
                    pair.copy_from_slice(&0x8000u16.to_le_bytes());
                }
            }
            SampleFormat::U16Msb => {
                for pair in buf.chunks_exact_mut(2) {
                    pair.copy_from_slice(&0x8000u16.to_be_bytes());
                }
            }
            _ => buf.fill(0),
        }
    }
}

/// The format negotiated with the audio hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareFormat {
    /// Sample rate in Hz.
    pub freq: u32,
    pub format: SampleFormat,
    pub channels: u16,
    /// Frames per hardware buffer.
    pub samples: u16,
}

impl HardwareFormat {
    pub fn new(freq: u32, format: SampleFormat, channels: u16, samples: u16) -> Self {
        Self { freq, format, channels, samples }
    }

    /// Bytes in one interleaved frame.
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Bytes in one hardware buffer.
    pub fn size(&self) -> usize {
        self.frame_size() * self.samples as usize
    }
}

impl std::fmt::Display for HardwareFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {:?}, {} ch, {} frames/buffer",
            self.freq, self.format, self.channels, self.samples
        )
    }
}

/// Encode interleaved `src` frames into `dst`, scaled by `gain`.
///
/// Returns the number of bytes written. Stops at whichever runs out first.
pub(crate) fn encode_interleaved(src: &[f32], dst: &mut [u8], format: SampleFormat, gain: f32) -> usize {
    let bps = format.bytes_per_sample();
    let mut written = 0;
    for (sample, out) in src.iter().zip(dst.chunks_exact_mut(bps)) {
        format.encode(sample * gain, out);
        written += bps;
    }
    written
}
