//! MIDI backend: Standard MIDI File parser and a small polyphonic synth.
//!
//! The synth is probed once at negotiation time (`SynthConfig::init`); a
//! failed probe makes every later MIDI load fail. Songs are parsed fully at
//! load and pre-scheduled in output frames, so `fill` only walks an event
//! list and runs the voice pool.

use std::f32::consts::TAU;
use std::path::Path;

use super::{BackendError, BackendResult};
use crate::config::MidiSettings;
use crate::format::{HardwareFormat, SampleFormat};
use crate::MAX_VOLUME;

const MIN_RATE: u32 = 4000;
const MAX_RATE: u32 = 96_000;

const DEFAULT_TEMPO_US: u32 = 500_000;
const PERCUSSION_CHANNEL: u8 = 9;

const ATTACK_SECS: f32 = 0.005;
const DECAY_SECS: f32 = 0.1;
const SUSTAIN_LEVEL: f32 = 0.7;
const RELEASE_SECS: f32 = 0.15;
const DRUM_DECAY_SECS: f32 = 0.12;
/// Per-voice output level before the song gain.
const VOICE_LEVEL: f32 = 0.25;

/// Output setup accepted by the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthConfig {
    pub rate: u32,
    pub format: SampleFormat,
    pub channels: u16,
    pub voices: usize,
}

impl SynthConfig {
    /// Startup probe. The error string is what later MIDI loads report.
    pub fn init(hardware: &HardwareFormat, settings: &MidiSettings) -> Result<Self, String> {
        if !settings.enabled {
            return Err("MIDI synthesis disabled in configuration".into());
        }
        if !(MIN_RATE..=MAX_RATE).contains(&hardware.freq) {
            return Err(format!(
                "synth cannot run at {} Hz (supported {}..={})",
                hardware.freq, MIN_RATE, MAX_RATE
            ));
        }
        if settings.voices == 0 {
            return Err("synth needs at least one voice".into());
        }
        Ok(Self {
            rate: hardware.freq,
            format: hardware.format,
            channels: hardware.channels,
            voices: settings.voices,
        })
    }

    fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    AllNotesOff { channel: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub frame: u64,
    pub event: MidiEvent,
}

enum Division {
    /// Ticks per quarter note; tempo meta events apply.
    Ppqn(u16),
    /// Fixed seconds per tick.
    Smpte(f64),
}

enum RawKind {
    Tempo(u32),
    Event(MidiEvent),
}

struct RawEvent {
    tick: u64,
    kind: RawKind,
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> BackendResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| BackendError::Format("MIDI data is truncated".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> BackendResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> BackendResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> BackendResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn varlen(&mut self) -> BackendResult<u32> {
        let mut value = 0u32;
        for _ in 0..4 {
            let byte = self.u8()?;
            value = (value << 7) | u32::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BackendError::Format("MIDI variable-length value too long".into()))
    }
}

/// Parse a Standard MIDI File into events scheduled at `rate` frames/second.
pub fn parse_smf(bytes: &[u8], rate: u32) -> BackendResult<Vec<ScheduledEvent>> {
    let mut reader = ByteReader::new(bytes);
    if reader.take(4)? != b"MThd" {
        return Err(BackendError::Format("missing MThd header".into()));
    }
    let header_len = reader.u32()? as usize;
    if header_len < 6 {
        return Err(BackendError::Format("MThd header too short".into()));
    }
    let mut header = ByteReader::new(reader.take(header_len)?);
    let format = header.u16()?;
    let track_count = header.u16()?;
    let raw_division = header.u16()?;

    if format > 1 {
        return Err(BackendError::Format(format!("MIDI format {} not supported", format)));
    }
    let division = if raw_division & 0x8000 != 0 {
        let fps = match -i16::from((raw_division >> 8) as u8 as i8) {
            29 => 29.97,
            fps => fps as f64,
        };
        let ticks_per_frame = (raw_division & 0xFF) as f64;
        if fps <= 0.0 || ticks_per_frame == 0.0 {
            return Err(BackendError::Format("invalid SMPTE division".into()));
        }
        Division::Smpte(1.0 / (fps * ticks_per_frame))
    } else if raw_division == 0 {
        return Err(BackendError::Format("zero ticks per quarter note".into()));
    } else {
        Division::Ppqn(raw_division)
    };

    let mut raw = Vec::new();
    let mut tracks_read = 0;
    while tracks_read < track_count && !reader.is_empty() {
        let id = reader.take(4)?;
        let len = reader.u32()? as usize;
        let body = reader.take(len)?;
        if id == b"MTrk" {
            parse_track(body, &mut raw)?;
            tracks_read += 1;
        }
    }
    if tracks_read == 0 {
        return Err(BackendError::Format("MIDI file has no tracks".into()));
    }

    // Stable: events on the same tick keep track order, so tempo changes in
    // the first track apply before notes in later ones.
    raw.sort_by_key(|e| e.tick);

    let mut tempo_us = DEFAULT_TEMPO_US;
    let mut last_tick = 0u64;
    let mut seconds = 0.0f64;
    let mut events = Vec::with_capacity(raw.len());
    for event in raw {
        let seconds_per_tick = match division {
            Division::Ppqn(ppqn) => tempo_us as f64 / 1_000_000.0 / ppqn as f64,
            Division::Smpte(secs) => secs,
        };
        seconds += (event.tick - last_tick) as f64 * seconds_per_tick;
        last_tick = event.tick;
        match event.kind {
            RawKind::Tempo(us) => {
                if us > 0 {
                    tempo_us = us;
                }
            }
            RawKind::Event(event) => events.push(ScheduledEvent {
                frame: (seconds * rate as f64).round() as u64,
                event,
            }),
        }
    }
    Ok(events)
}

fn parse_track(body: &[u8], out: &mut Vec<RawEvent>) -> BackendResult<()> {
    let mut reader = ByteReader::new(body);
    let mut tick = 0u64;
    let mut running: Option<u8> = None;

    while !reader.is_empty() {
        tick += u64::from(reader.varlen()?);
        let mut status = reader.u8()?;

        match status {
            0xFF => {
                let kind = reader.u8()?;
                let len = reader.varlen()? as usize;
                let data = reader.take(len)?;
                match kind {
                    0x2F => break,
                    0x51 if data.len() == 3 => out.push(RawEvent {
                        tick,
                        kind: RawKind::Tempo(u32::from_be_bytes([0, data[0], data[1], data[2]])),
                    }),
                    _ => {}
                }
                continue;
            }
            0xF0 | 0xF7 => {
                let len = reader.varlen()? as usize;
                reader.take(len)?;
                continue;
            }
            _ => {}
        }

        let first = if status & 0x80 == 0 {
            // Running status: this byte was already the first data byte
            let data = status;
            status = running.ok_or_else(|| BackendError::Format("data byte without running status".into()))?;
            data
        } else {
            if status >= 0xF0 {
                return Err(BackendError::Format(format!("unexpected system message 0x{:02X}", status)));
            }
            running = Some(status);
            reader.u8()?
        };

        let channel = status & 0x0F;
        let event = match status & 0xF0 {
            0x80 => {
                reader.u8()?;
                Some(MidiEvent::NoteOff { channel, key: first })
            }
            0x90 => {
                let velocity = reader.u8()?;
                Some(if velocity == 0 {
                    MidiEvent::NoteOff { channel, key: first }
                } else {
                    MidiEvent::NoteOn { channel, key: first, velocity }
                })
            }
            0xB0 => {
                reader.u8()?;
                matches!(first, 120 | 123).then_some(MidiEvent::AllNotesOff { channel })
            }
            0xA0 | 0xE0 => {
                reader.u8()?;
                None
            }
            // Program change and channel pressure carry one data byte
            _ => None,
        };
        if let Some(event) = event {
            out.push(RawEvent {
                tick,
                kind: RawKind::Event(event),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    stage: Stage,
    channel: u8,
    key: u8,
    amplitude: f32,
    level: f32,
    phase: f32,
    phase_inc: f32,
    noise: u32,
    age: u64,
}

impl Voice {
    const IDLE: Voice = Voice {
        stage: Stage::Idle,
        channel: 0,
        key: 0,
        amplitude: 0.0,
        level: 0.0,
        phase: 0.0,
        phase_inc: 0.0,
        noise: 1,
        age: 0,
    };

    fn is_percussion(&self) -> bool {
        self.channel == PERCUSSION_CHANNEL
    }
}

/// Fixed-size voice pool; the oldest voice is stolen when all are busy.
struct Synth {
    voices: Vec<Voice>,
    rate: f32,
    next_age: u64,
}

impl Synth {
    fn new(config: &SynthConfig) -> Self {
        Self {
            voices: vec![Voice::IDLE; config.voices],
            rate: config.rate as f32,
            next_age: 0,
        }
    }

    fn reset(&mut self) {
        self.voices.fill(Voice::IDLE);
    }

    fn sounding(&self) -> bool {
        self.voices.iter().any(|v| v.stage != Stage::Idle)
    }

    fn apply(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOn { channel, key, velocity } => {
                let slot = self
                    .voices
                    .iter()
                    .position(|v| v.stage == Stage::Idle)
                    .or_else(|| {
                        self.voices
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, v)| v.age)
                            .map(|(i, _)| i)
                    });
                let Some(slot) = slot else {
                    return;
                };
                let freq = 440.0 * 2f32.powf((key as f32 - 69.0) / 12.0);
                self.next_age += 1;
                self.voices[slot] = Voice {
                    stage: Stage::Attack,
                    channel,
                    key,
                    amplitude: velocity as f32 / 127.0,
                    level: 0.0,
                    phase: 0.0,
                    phase_inc: freq / self.rate,
                    noise: 0x1234_5678 ^ u32::from(key),
                    age: self.next_age,
                };
            }
            MidiEvent::NoteOff { channel, key } => {
                for voice in &mut self.voices {
                    if voice.channel == channel && voice.key == key && !voice.is_percussion() && voice.stage != Stage::Idle {
                        voice.stage = Stage::Release;
                    }
                }
            }
            MidiEvent::AllNotesOff { channel } => {
                for voice in &mut self.voices {
                    if voice.channel == channel && voice.stage != Stage::Idle {
                        voice.stage = Stage::Release;
                    }
                }
            }
        }
    }

    fn next_sample(&mut self) -> f32 {
        let attack = 1.0 / (ATTACK_SECS * self.rate);
        let decay = (1.0 - SUSTAIN_LEVEL) / (DECAY_SECS * self.rate);
        let release = 1.0 / (RELEASE_SECS * self.rate);
        let drum_decay = 1.0 / (DRUM_DECAY_SECS * self.rate);

        let mut out = 0.0;
        for voice in self.voices.iter_mut().filter(|v| v.stage != Stage::Idle) {
            match voice.stage {
                Stage::Attack => {
                    voice.level += attack;
                    if voice.level >= 1.0 {
                        voice.level = 1.0;
                        voice.stage = Stage::Decay;
                    }
                }
                Stage::Decay if voice.is_percussion() => voice.level -= drum_decay,
                Stage::Decay => {
                    voice.level -= decay;
                    if voice.level <= SUSTAIN_LEVEL {
                        voice.level = SUSTAIN_LEVEL;
                        voice.stage = Stage::Sustain;
                    }
                }
                Stage::Release => voice.level -= release,
                Stage::Sustain | Stage::Idle => {}
            }
            if voice.level <= 0.0 {
                voice.stage = Stage::Idle;
                continue;
            }

            let wave = if voice.is_percussion() {
                // xorshift noise
                voice.noise ^= voice.noise << 13;
                voice.noise ^= voice.noise >> 17;
                voice.noise ^= voice.noise << 5;
                voice.noise as f32 / u32::MAX as f32 * 2.0 - 1.0
            } else {
                let s = (voice.phase * TAU).sin();
                voice.phase = (voice.phase + voice.phase_inc).fract();
                s
            };
            out += wave * voice.level * voice.amplitude * VOICE_LEVEL;
        }
        out
    }
}

pub struct MidiSong {
    config: SynthConfig,
    events: Vec<ScheduledEvent>,
    synth: Synth,
    cursor: usize,
    frame: u64,
    playing: bool,
    gain: f32,
}

impl MidiSong {
    pub fn load(path: &Path, config: &SynthConfig) -> BackendResult<Self> {
        let bytes = std::fs::read(path)?;
        let song = Self::parse(&bytes, config)?;
        log::debug!("tunemix: midi song {} ({} events)", path.display(), song.events.len());
        Ok(song)
    }

    pub fn parse(bytes: &[u8], config: &SynthConfig) -> BackendResult<Self> {
        Ok(Self {
            config: *config,
            events: parse_smf(bytes, config.rate)?,
            synth: Synth::new(config),
            cursor: 0,
            frame: 0,
            playing: false,
            gain: 1.0,
        })
    }

    pub fn start(&mut self) {
        self.synth.reset();
        self.cursor = 0;
        self.frame = 0;
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
        self.synth.reset();
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.gain = volume.clamp(0, MAX_VOLUME) as f32 / MAX_VOLUME as f32;
    }

    pub fn is_active(&self) -> bool {
        self.playing
    }

    /// Render `frames` frames (bounded by `buf`) in the hardware format.
    pub fn fill(&mut self, buf: &mut [u8], frames: usize) {
        let format = self.config.format;
        let bps = format.bytes_per_sample();
        let frame_size = self.config.frame_size();
        let frames = frames.min(buf.len() / frame_size);

        for frame in buf[..frames * frame_size].chunks_exact_mut(frame_size) {
            if !self.playing {
                format.fill_silence(frame);
                continue;
            }
            while let Some(scheduled) = self.events.get(self.cursor) {
                if scheduled.frame > self.frame {
                    break;
                }
                self.synth.apply(scheduled.event);
                self.cursor += 1;
            }

            let value = self.synth.next_sample() * self.gain;
            for out in frame.chunks_exact_mut(bps) {
                format.encode(value, out);
            }

            self.frame += 1;
            if self.cursor >= self.events.len() && !self.synth.sounding() {
                self.playing = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(voices: usize) -> SynthConfig {
        SynthConfig {
            rate: 8000,
            format: SampleFormat::S16Lsb,
            channels: 1,
            voices,
        }
    }

    fn smf(format: u16, division: u16, tracks: &[&[u8]]) -> Vec<u8> {
        let mut bytes = b"MThd".to_vec();
        bytes.extend_from_slice(&6u32.to_be_bytes());
        bytes.extend_from_slice(&format.to_be_bytes());
        bytes.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&division.to_be_bytes());
        for track in tracks {
            bytes.extend_from_slice(b"MTrk");
            bytes.extend_from_slice(&(track.len() as u32).to_be_bytes());
            bytes.extend_from_slice(track);
        }
        bytes
    }

    /// Middle C for one quarter note (96 ticks), then end of track.
    const ONE_NOTE: &[u8] = &[0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00];

    #[test]
    fn synth_init_rejects_bad_setups() {
        let hw = HardwareFormat::new(22050, SampleFormat::S16Lsb, 2, 512);
        assert!(SynthConfig::init(&hw, &MidiSettings::default()).is_ok());

        let disabled = MidiSettings { enabled: false, ..MidiSettings::default() };
        assert!(SynthConfig::init(&hw, &disabled).is_err());

        let no_voices = MidiSettings { voices: 0, ..MidiSettings::default() };
        assert!(SynthConfig::init(&hw, &no_voices).is_err());

        let slow = HardwareFormat::new(1000, SampleFormat::U8, 1, 512);
        assert!(SynthConfig::init(&slow, &MidiSettings::default()).is_err());
    }

    #[test]
    fn ppqn_events_use_default_tempo() {
        let events = parse_smf(&smf(0, 96, &[ONE_NOTE]), 8000).unwrap();
        assert_eq!(
            events,
            vec![
                ScheduledEvent { frame: 0, event: MidiEvent::NoteOn { channel: 0, key: 60, velocity: 100 } },
                // One quarter at 120 bpm
                ScheduledEvent { frame: 4000, event: MidiEvent::NoteOff { channel: 0, key: 60 } },
            ]
        );
    }

    #[test]
    fn longer_header_is_skipped() {
        let mut bytes = smf(0, 96, &[ONE_NOTE]);
        bytes[4..8].copy_from_slice(&8u32.to_be_bytes());
        bytes.splice(14..14, [0xAB, 0xCD]);
        let events = parse_smf(&bytes, 8000).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].frame, 4000);
    }

    #[test]
    fn tempo_meta_changes_timing() {
        // 250000 us per quarter (240 bpm)
        let track: &[u8] = &[
            0x00, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, 0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00,
        ];
        let events = parse_smf(&smf(0, 96, &[track]), 8000).unwrap();
        assert_eq!(events[1].frame, 2000);
    }

    #[test]
    fn running_status_and_zero_velocity() {
        let track: &[u8] = &[0x00, 0x91, 64, 90, 0x10, 64, 0, 0x00, 0xFF, 0x2F, 0x00];
        let events = parse_smf(&smf(0, 96, &[track]), 8000).unwrap();
        assert_eq!(events[1].event, MidiEvent::NoteOff { channel: 1, key: 64 });
    }

    #[test]
    fn smpte_division() {
        // 25 fps, 40 ticks per frame: 1000 ticks per second
        let division = (((-25i8) as u8 as u16) << 8) | 40;
        let track: &[u8] = &[0x83, 0x74, 0x90, 60, 100, 0x00, 0xFF, 0x2F, 0x00];
        let events = parse_smf(&smf(0, division, &[track]), 8000).unwrap();
        assert_eq!(events[0].frame, 4000);
    }

    #[test]
    fn format_one_tracks_merge_in_time_order() {
        let late: &[u8] = &[0x60, 0x90, 62, 100, 0x00, 0xFF, 0x2F, 0x00];
        let early: &[u8] = &[0x30, 0x90, 64, 100, 0x00, 0xFF, 0x2F, 0x00];
        let events = parse_smf(&smf(1, 96, &[late, early]), 8000).unwrap();
        let keys: Vec<u8> = events
            .iter()
            .map(|e| match e.event {
                MidiEvent::NoteOn { key, .. } => key,
                _ => 0,
            })
            .collect();
        assert_eq!(keys, vec![64, 62]);
    }

    #[test]
    fn sysex_and_unknown_chunks_are_skipped() {
        let track: &[u8] = &[0x00, 0xF0, 0x03, 0x7E, 0x7F, 0xF7, 0x00, 0xC0, 0x05, 0x00, 0x90, 60, 1, 0x00, 0xFF, 0x2F, 0x00];
        let mut bytes = smf(0, 96, &[]);
        bytes[10..12].copy_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(b"XFIH");
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track.len() as u32).to_be_bytes());
        bytes.extend_from_slice(track);
        let events = parse_smf(&bytes, 8000).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_files_are_rejected() {
        assert!(parse_smf(b"MThd", 8000).is_err());
        assert!(parse_smf(b"RIFF\0\0\0\x06\0\0\0\x01\0\x60", 8000).is_err());
        assert!(parse_smf(&smf(2, 96, &[ONE_NOTE]), 8000).is_err());
        assert!(parse_smf(&smf(0, 0, &[ONE_NOTE]), 8000).is_err());
        assert!(parse_smf(&smf(0, 96, &[]), 8000).is_err());

        let mut truncated = smf(0, 96, &[ONE_NOTE]);
        truncated.truncate(truncated.len() - 4);
        assert!(parse_smf(&truncated, 8000).is_err());
    }

    #[test]
    fn song_plays_then_finishes() {
        let mut song = MidiSong::parse(&smf(0, 96, &[ONE_NOTE]), &config(4)).unwrap();
        assert!(!song.is_active());
        song.start();

        let mut buf = vec![0u8; 4000 * 2];
        song.fill(&mut buf, 4000);
        assert!(song.is_active());
        assert!(buf.chunks_exact(2).any(|s| s != [0, 0]));

        // Release tail, then the song is over
        let mut buf = vec![0u8; 4000 * 2];
        song.fill(&mut buf, 4000);
        assert!(!song.is_active());
        assert!(buf[buf.len() - 2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn fill_respects_frame_count() {
        let mut song = MidiSong::parse(&smf(0, 96, &[ONE_NOTE]), &config(4)).unwrap();
        song.start();
        let mut buf = vec![0xAAu8; 64];
        song.fill(&mut buf, 10);
        assert!(buf[20..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn stopped_song_renders_silence() {
        let mut song = MidiSong::parse(&smf(0, 96, &[ONE_NOTE]), &config(4)).unwrap();
        song.start();
        song.stop();
        let mut buf = vec![0xAAu8; 32];
        song.fill(&mut buf, 16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn voice_pool_steals_oldest() {
        let mut synth = Synth::new(&config(1));
        synth.apply(MidiEvent::NoteOn { channel: 0, key: 60, velocity: 100 });
        synth.apply(MidiEvent::NoteOn { channel: 0, key: 72, velocity: 100 });
        assert_eq!(synth.voices.len(), 1);
        assert_eq!(synth.voices[0].key, 72);

        synth.apply(MidiEvent::NoteOff { channel: 0, key: 72 });
        assert_eq!(synth.voices[0].stage, Stage::Release);
    }

    #[test]
    fn percussion_ignores_note_off() {
        let mut synth = Synth::new(&config(2));
        synth.apply(MidiEvent::NoteOn { channel: PERCUSSION_CHANNEL, key: 38, velocity: 100 });
        synth.apply(MidiEvent::NoteOff { channel: PERCUSSION_CHANNEL, key: 38 });
        assert_eq!(synth.voices[0].stage, Stage::Attack);
        assert!(synth.next_sample().abs() <= 1.0);
    }
}
