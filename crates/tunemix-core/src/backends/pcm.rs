//! Shared PCM path for the Wave and Mpeg backends.
//!
//! 1. symphonia decodes the whole file at load time (load is the only
//!    operation allowed to block)
//! 2. one pass of linear resampling, then a channel remix, lays it out at
//!    the negotiated rate and channel count
//! 3. `PcmTrack::fill` encodes straight into the hardware buffer, with no
//!    allocation on the mixing thread

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{BackendError, BackendResult};
use crate::format::{encode_interleaved, HardwareFormat};

/// Interleaved f32 audio straight out of the decoder.
pub(crate) struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decode every packet of the default audio track in `path`.
pub(crate) fn decode_file(path: &Path, hint_ext: &str) -> BackendResult<DecodedAudio> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => hint.with_extension(ext),
        None => hint.with_extension(hint_ext),
    };

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| BackendError::Format("file does not have any audio stream".into()))?;
    let track_id = track.id;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);

    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break; // End of stream
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, not fatal
            Err(SymphoniaError::DecodeError(msg)) => {
                log::debug!("tunemix: skipping undecodable packet in {}: {}", path.display(), msg);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if samples.is_empty() {
        return Err(BackendError::Format("no audio samples decoded".into()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

/// Convert interleaved audio from `from` Hz to `to` Hz, interpolating
/// linearly between neighbouring frames. Runs once per file at load time.
fn resample(samples: Vec<f32>, channels: usize, from: u32, to: u32) -> Vec<f32> {
    let in_frames = samples.len() / channels;
    if from == to || from == 0 || in_frames == 0 {
        return samples;
    }

    let out_frames = (in_frames as u64 * u64::from(to) / u64::from(from)).max(1) as usize;
    let step = f64::from(from) / f64::from(to);
    let last = in_frames - 1;
    let mut out = Vec::with_capacity(out_frames * channels);
    for n in 0..out_frames {
        let pos = n as f64 * step;
        let i = (pos as usize).min(last);
        let t = (pos - i as f64) as f32;
        let j = (i + 1).min(last);
        let here = &samples[i * channels..(i + 1) * channels];
        let next = &samples[j * channels..(j + 1) * channels];
        out.extend(here.iter().zip(next).map(|(&a, &b)| a + (b - a) * t));
    }
    out
}

/// Lay interleaved audio out for `to` channels. Mono is copied to every
/// output channel, a mono output averages the source channels, anything
/// else keeps channels in order and pads with silence.
fn remix(samples: Vec<f32>, from: usize, to: usize) -> Vec<f32> {
    if from == to {
        return samples;
    }
    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        match (from, to) {
            (1, _) => out.extend(std::iter::repeat(frame[0]).take(to)),
            (_, 1) => out.push(frame.iter().sum::<f32>() / from as f32),
            _ => out.extend((0..to).map(|c| frame.get(c).copied().unwrap_or(0.0))),
        }
    }
    out
}

/// Decoded audio already laid out in the hardware rate and channel count,
/// plus a play cursor.
pub(crate) struct PcmTrack {
    samples: Vec<f32>,
    channels: usize,
    cursor: usize,
}

impl PcmTrack {
    pub fn new(decoded: DecodedAudio, hardware: &HardwareFormat) -> Self {
        let source_channels = usize::from(decoded.channels.max(1));
        let channels = usize::from(hardware.channels.max(1));
        let samples = resample(decoded.samples, source_channels, decoded.sample_rate, hardware.freq);

        Self {
            samples: remix(samples, source_channels, channels),
            channels,
            cursor: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn position(&self) -> usize {
        self.cursor / self.channels
    }

    pub fn is_finished(&self) -> bool {
        self.position() >= self.frames()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Encode as many remaining frames as fit into `dst`. Returns bytes written.
    pub fn fill(&mut self, dst: &mut [u8], hardware: &HardwareFormat, gain: f32) -> usize {
        let frame_size = hardware.frame_size();
        let frames = (dst.len() / frame_size).min(self.frames() - self.position());
        let count = frames * self.channels;
        let end = self.cursor + count;
        let written = encode_interleaved(&self.samples[self.cursor..end], dst, hardware.format, gain);
        self.cursor = end;
        written
    }
}
