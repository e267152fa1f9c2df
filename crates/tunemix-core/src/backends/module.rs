//! Tracker module backend.
//!
//! A compact ProTracker MOD player (4, 6 or 8 channels, 31 samples). It
//! renders in the driver's native layout: unsigned 8-bit, or signed 16-bit
//! in host byte order. The engine applies the hardware correction afterwards.
//!
//! Supported effects: 9 (sample offset), A (volume slide), B (position jump),
//! C (set volume), D (pattern break), F (speed / tempo). Anything else is
//! ignored. A jump backwards ends the song instead of looping it.

use std::path::Path;

use super::{BackendError, BackendResult};
use crate::format::SampleFormat;
use crate::MAX_VOLUME;

/// Amiga PAL clock used to turn periods into playback rates.
const PAULA_CLOCK: f64 = 3_546_894.6;

const SAMPLE_COUNT: usize = 31;
const ORDER_TABLE_LEN: usize = 128;
const ROWS_PER_PATTERN: usize = 64;
const HEADER_LEN: usize = 1084;
const TAG_OFFSET: usize = 1080;

const DEFAULT_SPEED: u8 = 6;
const DEFAULT_BPM: u8 = 125;

/// Output configuration of the module driver, produced by format negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDriver {
    pub rate: u32,
    pub stereo: bool,
    pub sixteen_bit: bool,
    /// 0..=128
    pub master_volume: u8,
    /// 0 (mono) ..=128 (hard left/right)
    pub pan_separation: u8,
}

impl ModuleDriver {
    /// Format the driver renders in before correction.
    pub fn native_format(&self) -> SampleFormat {
        if self.sixteen_bit {
            SampleFormat::S16_NATIVE
        } else {
            SampleFormat::U8
        }
    }

    pub fn channels(&self) -> u16 {
        if self.stereo {
            2
        } else {
            1
        }
    }

    fn frame_size(&self) -> usize {
        self.native_format().bytes_per_sample() * self.channels() as usize
    }
}

fn channel_count(tag: &[u8]) -> Option<usize> {
    match tag {
        b"M.K." | b"M!K!" | b"FLT4" | b"4CHN" => Some(4),
        b"6CHN" => Some(6),
        b"8CHN" | b"FLT8" => Some(8),
        _ => None,
    }
}

fn read_u16_be(bytes: &[u8], at: usize) -> usize {
    u16::from_be_bytes([bytes[at], bytes[at + 1]]) as usize
}

struct Sample {
    data: Vec<i8>,
    volume: u8,
    finetune: i8,
    loop_start: usize,
    /// Zero when the sample does not loop.
    loop_len: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Note {
    sample: u8,
    period: u16,
    effect: u8,
    param: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    sample: Option<usize>,
    active: bool,
    pos: f64,
    step: f64,
    volume: u8,
    slide: u8,
}

pub struct ModuleSong {
    title: String,
    driver: ModuleDriver,
    samples: Vec<Sample>,
    orders: Vec<u8>,
    patterns: Vec<u8>,
    channels: Vec<Channel>,
    /// (left, right) gain per tracker channel.
    pan: Vec<(f32, f32)>,
    gain: f32,

    playing: bool,
    order: usize,
    row: usize,
    tick: u8,
    speed: u8,
    bpm: u8,
    tick_frames_left: u32,
    jump: Option<(usize, usize)>,
}

impl ModuleSong {
    pub fn load(path: &Path, driver: &ModuleDriver) -> BackendResult<Self> {
        let bytes = std::fs::read(path)?;
        let song = Self::parse(&bytes, driver)?;
        log::debug!(
            "tunemix: module '{}' ({} channels, {} orders) from {}",
            song.title,
            song.channels.len(),
            song.orders.len(),
            path.display()
        );
        Ok(song)
    }

    pub fn parse(bytes: &[u8], driver: &ModuleDriver) -> BackendResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BackendError::Format("not a module: file too short".into()));
        }
        let channel_count = channel_count(&bytes[TAG_OFFSET..TAG_OFFSET + 4])
            .ok_or_else(|| BackendError::Format("not a module: unknown signature".into()))?;

        let title = String::from_utf8_lossy(&bytes[..20])
            .trim_end_matches('\0')
            .trim()
            .to_string();

        let song_length = (bytes[950] as usize).clamp(1, ORDER_TABLE_LEN);
        let order_table = &bytes[952..952 + ORDER_TABLE_LEN];
        let pattern_count = order_table.iter().copied().max().unwrap_or(0) as usize + 1;
        let orders = order_table[..song_length].to_vec();

        let pattern_bytes = pattern_count * ROWS_PER_PATTERN * channel_count * 4;
        let pattern_end = HEADER_LEN + pattern_bytes;
        if bytes.len() < pattern_end {
            return Err(BackendError::Format("module pattern data is truncated".into()));
        }
        let patterns = bytes[HEADER_LEN..pattern_end].to_vec();

        // Sample bodies follow the patterns back to back. Truncated
        // trailing samples are kept at whatever length is present.
        let mut samples = Vec::with_capacity(SAMPLE_COUNT);
        let mut offset = pattern_end;
        for i in 0..SAMPLE_COUNT {
            let header = 20 + i * 30;
            let length = read_u16_be(bytes, header + 22) * 2;
            let finetune = ((bytes[header + 24] & 0x0F) << 4) as i8 >> 4;
            let volume = bytes[header + 25].min(64);
            let loop_start = read_u16_be(bytes, header + 26) * 2;
            let loop_len = read_u16_be(bytes, header + 28) * 2;

            let start = offset.min(bytes.len());
            let end = (offset + length).min(bytes.len());
            offset += length;
            let data: Vec<i8> = bytes[start..end].iter().map(|&b| b as i8).collect();

            let loop_end = (loop_start + loop_len).min(data.len());
            let loop_len = if loop_len > 2 && loop_start < loop_end {
                loop_end - loop_start
            } else {
                0
            };

            samples.push(Sample {
                data,
                volume,
                finetune,
                loop_start,
                loop_len,
            });
        }

        let separation = driver.pan_separation.min(128) as f32 / 128.0;
        let pan = (0..channel_count)
            .map(|ch| {
                if !driver.stereo {
                    return (1.0, 0.0);
                }
                // Amiga layout: L R R L
                let side = if matches!(ch % 4, 0 | 3) { -1.0 } else { 1.0 };
                let right = 0.5 + 0.5 * separation * side;
                (1.0 - right, right)
            })
            .collect();

        Ok(Self {
            title,
            driver: *driver,
            samples,
            orders,
            patterns,
            channels: vec![Channel::default(); channel_count],
            pan,
            gain: 1.0,
            playing: false,
            order: 0,
            row: 0,
            tick: 0,
            speed: DEFAULT_SPEED,
            bpm: DEFAULT_BPM,
            tick_frames_left: 0,
            jump: None,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn start(&mut self) {
        self.channels.fill(Channel::default());
        self.order = 0;
        self.row = 0;
        self.tick = 0;
        self.speed = DEFAULT_SPEED;
        self.bpm = DEFAULT_BPM;
        self.tick_frames_left = 0;
        self.jump = None;
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.gain = volume.clamp(0, MAX_VOLUME) as f32 / MAX_VOLUME as f32;
    }

    pub fn is_active(&self) -> bool {
        self.playing
    }

    /// Render into `buf` in the driver's native format.
    pub fn fill(&mut self, buf: &mut [u8]) {
        let format = self.driver.native_format();
        let bps = format.bytes_per_sample();
        let mut frames = buf.chunks_exact_mut(self.driver.frame_size());

        for frame in frames.by_ref() {
            if self.playing && self.tick_frames_left == 0 {
                self.next_tick();
            }
            if !self.playing {
                format.fill_silence(frame);
                continue;
            }
            let (left, right) = self.mix_frame();
            self.tick_frames_left -= 1;
            if self.driver.stereo {
                format.encode(left, &mut frame[..bps]);
                format.encode(right, &mut frame[bps..]);
            } else {
                format.encode(left, frame);
            }
        }
        format.fill_silence(frames.into_remainder());
    }

    fn next_tick(&mut self) {
        if self.tick >= self.speed {
            self.tick = 0;
            self.advance_row();
            if !self.playing {
                return;
            }
        }
        if self.tick == 0 {
            self.play_row();
        } else {
            self.slide_volumes();
        }
        self.tick += 1;
        self.tick_frames_left = frames_per_tick(self.driver.rate, self.bpm);
    }

    fn advance_row(&mut self) {
        let (order, row) = match self.jump.take() {
            Some(target) => target,
            None if self.row + 1 >= ROWS_PER_PATTERN => (self.order + 1, 0),
            None => (self.order, self.row + 1),
        };
        let backwards = order < self.order || (order == self.order && row <= self.row);
        if backwards || order >= self.orders.len() {
            self.playing = false;
            return;
        }
        self.order = order;
        self.row = row;
    }

    fn note_at(&self, channel: usize) -> Note {
        let pattern = self.orders[self.order] as usize;
        let width = self.channels.len() * 4;
        let at = pattern * ROWS_PER_PATTERN * width + self.row * width + channel * 4;
        let cell = &self.patterns[at..at + 4];
        Note {
            sample: (cell[0] & 0xF0) | (cell[2] >> 4),
            period: u16::from(cell[0] & 0x0F) << 8 | u16::from(cell[1]),
            effect: cell[2] & 0x0F,
            param: cell[3],
        }
    }

    fn play_row(&mut self) {
        let mut jump_order = None;
        let mut break_row = None;

        for ch in 0..self.channels.len() {
            let note = self.note_at(ch);
            let chan = &mut self.channels[ch];

            if note.sample > 0 && (note.sample as usize) <= self.samples.len() {
                let index = note.sample as usize - 1;
                chan.sample = Some(index);
                chan.volume = self.samples[index].volume;
            }

            if note.period > 0 {
                if let Some(sample) = chan.sample.and_then(|i| self.samples.get(i)) {
                    let period = note.period as f64 * 2f64.powf(-(sample.finetune as f64) / 96.0);
                    chan.step = PAULA_CLOCK / (period * self.driver.rate as f64);
                    chan.pos = if note.effect == 0x9 {
                        note.param as f64 * 256.0
                    } else {
                        0.0
                    };
                    chan.active = chan.pos < sample.data.len() as f64;
                }
            }

            chan.slide = 0;
            match note.effect {
                0xA => chan.slide = note.param,
                0xB => jump_order = Some(note.param as usize),
                0xC => chan.volume = note.param.min(64),
                0xD => {
                    let row = (note.param >> 4) as usize * 10 + (note.param & 0x0F) as usize;
                    break_row = Some(if row < ROWS_PER_PATTERN { row } else { 0 });
                }
                0xF if note.param == 0 => {}
                0xF if note.param < 32 => self.speed = note.param,
                0xF => self.bpm = note.param,
                _ => {}
            }
        }

        if jump_order.is_some() || break_row.is_some() {
            self.jump = Some((
                jump_order.unwrap_or(self.order + 1),
                break_row.unwrap_or(0),
            ));
        }
    }

    fn slide_volumes(&mut self) {
        for chan in self.channels.iter_mut().filter(|c| c.slide != 0) {
            let up = chan.slide >> 4;
            let down = chan.slide & 0x0F;
            chan.volume = if up > 0 {
                (chan.volume + up).min(64)
            } else {
                chan.volume.saturating_sub(down)
            };
        }
    }

    fn mix_frame(&mut self) -> (f32, f32) {
        let mut left = 0.0f32;
        let mut right = 0.0f32;

        for (chan, &(gain_l, gain_r)) in self.channels.iter_mut().zip(self.pan.iter()) {
            if !chan.active {
                continue;
            }
            let Some(sample) = chan.sample.and_then(|i| self.samples.get(i)) else {
                continue;
            };
            let Some(&raw) = sample.data.get(chan.pos as usize) else {
                chan.active = false;
                continue;
            };

            let value = raw as f32 / 128.0 * chan.volume as f32 / 64.0;
            left += value * gain_l;
            right += value * gain_r;

            chan.pos += chan.step;
            if sample.loop_len > 0 {
                let loop_end = (sample.loop_start + sample.loop_len) as f64;
                while chan.pos >= loop_end {
                    chan.pos -= sample.loop_len as f64;
                }
            } else if chan.pos >= sample.data.len() as f64 {
                chan.active = false;
            }
        }

        let headroom = (self.channels.len() as f32 / 2.0).max(1.0);
        let gain = self.driver.master_volume.min(128) as f32 / 128.0 * self.gain / headroom;
        (left * gain, right * gain)
    }
}

/// Frames per tracker tick: `rate * 2.5 / bpm`.
fn frames_per_tick(rate: u32, bpm: u8) -> u32 {
    let frames = u64::from(rate) * 5 / (u64::from(bpm.max(1)) * 2);
    frames.clamp(1, u64::from(u32::MAX)) as u32
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// One-pattern module with a looping square-wave sample; `cells` are
    /// (row, channel, [b0, b1, b2, b3]).
    pub fn module_bytes_with(tag: &[u8; 4], channels: usize, cells: &[(usize, usize, [u8; 4])]) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[..9].copy_from_slice(b"test tune");
        // Sample 1: 32 words, volume 64, loops over its whole length
        let header = 20;
        bytes[header + 22..header + 24].copy_from_slice(&32u16.to_be_bytes());
        bytes[header + 25] = 64;
        bytes[header + 28..header + 30].copy_from_slice(&32u16.to_be_bytes());
        bytes[950] = 1;
        bytes[TAG_OFFSET..TAG_OFFSET + 4].copy_from_slice(tag);

        let mut pattern = vec![0u8; ROWS_PER_PATTERN * channels * 4];
        for &(row, ch, cell) in cells {
            let at = (row * channels + ch) * 4;
            pattern[at..at + 4].copy_from_slice(&cell);
        }
        bytes.extend_from_slice(&pattern);
        bytes.extend((0..64).map(|i| if i < 32 { 100u8 } else { (-100i8) as u8 }));
        bytes
    }

    /// Four-channel `M.K.` module.
    pub fn module_bytes(cells: &[(usize, usize, [u8; 4])]) -> Vec<u8> {
        module_bytes_with(b"M.K.", 4, cells)
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::module_bytes_with as module_bytes;
    use super::*;

    const RATE: u32 = 8000;

    fn driver(stereo: bool, sixteen_bit: bool) -> ModuleDriver {
        ModuleDriver {
            rate: RATE,
            stereo,
            sixteen_bit,
            master_volume: 128,
            pan_separation: 128,
        }
    }

    /// Sample 1 at period 428 (C-2).
    const C2: [u8; 4] = [0x01, 0xAC, 0x10, 0x00];

    fn frames(song: &mut ModuleSong, count: usize) -> Vec<u8> {
        let mut buf = vec![0u8; count * song.driver.frame_size()];
        song.fill(&mut buf);
        buf
    }

    #[test]
    fn rejects_short_or_unknown_files() {
        assert!(ModuleSong::parse(b"RIFF", &driver(true, true)).is_err());
        let mut bytes = module_bytes(b"M.K.", 4, &[]);
        bytes[TAG_OFFSET..TAG_OFFSET + 4].copy_from_slice(b"NOPE");
        assert!(ModuleSong::parse(&bytes, &driver(true, true)).is_err());
    }

    #[test]
    fn rejects_truncated_patterns() {
        let mut bytes = module_bytes(b"M.K.", 4, &[]);
        bytes.truncate(HEADER_LEN + 100);
        assert!(ModuleSong::parse(&bytes, &driver(true, true)).is_err());
    }

    #[test]
    fn signature_sets_channel_count() {
        let song = ModuleSong::parse(&module_bytes(b"6CHN", 6, &[]), &driver(true, true)).unwrap();
        assert_eq!(song.channels.len(), 6);
        assert_eq!(song.title(), "test tune");
    }

    #[test]
    fn stopped_song_renders_native_silence() {
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, C2)]), &driver(false, false)).unwrap();
        assert!(!song.is_active());
        assert!(frames(&mut song, 32).iter().all(|&b| b == 0x80));
    }

    #[test]
    fn note_produces_audio() {
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, C2)]), &driver(true, true)).unwrap();
        song.start();
        let buf = frames(&mut song, 256);
        assert_eq!(buf.len(), 256 * 4);
        assert!(buf.iter().any(|&b| b != 0));
        assert!(song.is_active());
    }

    #[test]
    fn channel_one_pans_left() {
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, C2)]), &driver(true, true)).unwrap();
        song.start();
        let buf = frames(&mut song, 64);
        for frame in buf.chunks_exact(4) {
            let right = i16::from_ne_bytes([frame[2], frame[3]]);
            assert_eq!(right, 0);
        }
    }

    #[test]
    fn set_volume_effect_silences_channel() {
        let quiet = [0x01, 0xAC, 0x1C, 0x00];
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, quiet)]), &driver(false, false)).unwrap();
        song.start();
        assert!(frames(&mut song, 128).iter().all(|&b| b == 0x80));
    }

    #[test]
    fn zero_song_volume_is_silent() {
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, C2)]), &driver(false, false)).unwrap();
        song.set_volume(0);
        song.start();
        assert!(frames(&mut song, 128).iter().all(|&b| b == 0x80));
    }

    #[test]
    fn pattern_break_past_last_order_ends_song() {
        // Speed 3 on channel 2, break on channel 3: one row of three ticks
        let speed = [0x00, 0x00, 0x0F, 0x03];
        let brk = [0x00, 0x00, 0x0D, 0x00];
        let bytes = module_bytes(b"M.K.", 4, &[(0, 0, C2), (0, 1, speed), (0, 2, brk)]);
        let mut song = ModuleSong::parse(&bytes, &driver(false, false)).unwrap();
        song.start();

        let tick = frames_per_tick(RATE, DEFAULT_BPM) as usize;
        frames(&mut song, tick * 3);
        assert!(song.is_active());
        let tail = frames(&mut song, 8);
        assert!(!song.is_active());
        assert!(tail.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn backward_jump_ends_song() {
        let jump = [0x00, 0x00, 0x0B, 0x00];
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, jump)]), &driver(false, false)).unwrap();
        song.start();
        let tick = frames_per_tick(RATE, DEFAULT_BPM) as usize;
        frames(&mut song, tick * DEFAULT_SPEED as usize + 1);
        assert!(!song.is_active());
    }

    #[test]
    fn song_plays_through_one_pattern() {
        let mut song = ModuleSong::parse(&module_bytes(b"M.K.", 4, &[(0, 0, C2)]), &driver(false, false)).unwrap();
        song.start();
        let tick = frames_per_tick(RATE, DEFAULT_BPM) as usize;
        let pattern_frames = tick * DEFAULT_SPEED as usize * ROWS_PER_PATTERN;
        frames(&mut song, pattern_frames);
        assert!(song.is_active());
        frames(&mut song, 1);
        assert!(!song.is_active());
    }

    #[test]
    fn tick_length_follows_tempo() {
        assert_eq!(frames_per_tick(44100, 125), 882);
        assert_eq!(frames_per_tick(8000, 125), 160);
        // Rates past u32::MAX / 5 must not overflow
        assert_eq!(frames_per_tick(1_000_000_000, 125), 20_000_000);
        assert_eq!(frames_per_tick(u32::MAX, 32), 335_544_319);
    }
}
