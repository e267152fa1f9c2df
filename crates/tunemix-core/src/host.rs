//! Native audio output via cpal.
//!
//! Opens the default output device, negotiates signed 16-bit host-endian at
//! the device rate (at most two channels) and drives the engine's mixing
//! bridge from the cpal callback. The device stream itself is f32, so the
//! callback converts each hardware buffer after mixing.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::config::MixerConfig;
use crate::engine::{Engine, MixHandle};
use crate::error::{MusicError, MusicResult};
use crate::format::{HardwareFormat, SampleFormat};

/// Frames per hardware buffer we advertise to the engine. cpal decides the
/// real callback size; longer periods are mixed in several passes.
const BUFFER_FRAMES: u16 = 1024;

fn device_error(e: impl std::fmt::Display) -> MusicError {
    MusicError::AudioDevice(e.to_string())
}

/// A running output stream. Audio stops when this is dropped.
pub struct AudioOutput {
    _stream: cpal::Stream,
    hardware: HardwareFormat,
    device_name: String,
}

impl AudioOutput {
    /// Open the default output device and an engine negotiated for it.
    pub fn open(config: MixerConfig) -> MusicResult<(Engine, AudioOutput)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| device_error("no output device"))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let default_cfg = device.default_output_config().map_err(device_error)?;
        if default_cfg.sample_format() != cpal::SampleFormat::F32 {
            return Err(device_error(format!(
                "device does not support f32 output (got {:?})",
                default_cfg.sample_format()
            )));
        }
        let stream_config: cpal::StreamConfig = default_cfg.into();

        let hardware = HardwareFormat::new(
            stream_config.sample_rate.0,
            SampleFormat::S16_NATIVE,
            stream_config.channels.clamp(1, 2),
            BUFFER_FRAMES,
        );
        let engine = Engine::open(hardware, config)?;

        let stream = build_stream(&device, &stream_config, engine.mix_handle())?;
        stream.play().map_err(device_error)?;
        log::info!("tunemix: output on '{}' ({})", device_name, hardware);

        Ok((
            engine,
            AudioOutput {
                _stream: stream,
                hardware,
                device_name,
            },
        ))
    }

    pub fn hardware_format(&self) -> HardwareFormat {
        self.hardware
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn build_stream(device: &cpal::Device, config: &cpal::StreamConfig, mixer: MixHandle) -> MusicResult<cpal::Stream> {
    let hardware = mixer.hardware_format();
    let device_channels = usize::from(config.channels.max(1));
    let mut scratch = vec![0u8; hardware.size().max(hardware.frame_size())];

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render(&mut scratch, hardware, data, device_channels, |buf| mixer.mix(buf));
            },
            move |err| {
                log::error!("tunemix: cpal error: {}", err);
            },
            None,
        )
        .map_err(device_error)
}

/// Fill a device period through `scratch`, one scratch-sized chunk at a
/// time, so a period longer than advertised never reallocates.
fn render(
    scratch: &mut [u8],
    hardware: HardwareFormat,
    data: &mut [f32],
    device_channels: usize,
    mut mix: impl FnMut(&mut [u8]),
) {
    let frame_size = hardware.frame_size();
    let chunk_frames = scratch.len() / frame_size;
    for out in data.chunks_mut(chunk_frames * device_channels) {
        let buf = &mut scratch[..out.len() / device_channels * frame_size];
        hardware.format.fill_silence(buf);
        mix(buf);
        write_device_frames(buf, usize::from(hardware.channels), out, device_channels);
    }
}

/// Convert host-endian S16 frames to the device's f32 layout. Device
/// channels past the mixer's get silence.
fn write_device_frames(src: &[u8], src_channels: usize, dst: &mut [f32], dst_channels: usize) {
    let src_frame = src_channels * 2;
    for (frame, out) in src.chunks_exact(src_frame).zip(dst.chunks_exact_mut(dst_channels)) {
        for (c, sample) in out.iter_mut().enumerate() {
            *sample = if c < src_channels {
                i16::from_ne_bytes([frame[c * 2], frame[c * 2 + 1]]) as f32 / 32768.0
            } else {
                0.0
            };
        }
    }
}
