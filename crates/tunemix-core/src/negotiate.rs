//! Format negotiation between the hardware and the backends.
//!
//! Runs once when the engine opens. Produces the mix correction for the
//! module driver's native output, the module driver setup, and the result
//! of the MIDI synthesizer probe.

use serde::Serialize;

use crate::backends::midi::SynthConfig;
use crate::backends::module::ModuleDriver;
use crate::config::MixerConfig;
use crate::error::{MusicError, MusicResult};
use crate::format::{HardwareFormat, SampleFormat};

/// Post-render fix-up applied to module output before it reaches the
/// hardware. At most one of the two swaps is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MixCorrection {
    /// Bytes per hardware frame.
    pub frame_size: usize,
    /// Flip the sign bit of every byte (unsigned 8-bit to signed).
    pub swap_8bit_sign: bool,
    /// Swap each byte pair (host-endian 16-bit to the other order).
    pub swap_16bit_endianness: bool,
}

impl MixCorrection {
    pub fn apply(&self, buf: &mut [u8]) {
        if self.swap_8bit_sign {
            for byte in buf.iter_mut() {
                *byte ^= 0x80;
            }
        } else if self.swap_16bit_endianness {
            for pair in buf.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
    }
}

/// Everything negotiation decided.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub hardware: HardwareFormat,
    pub correction: MixCorrection,
    pub module_driver: ModuleDriver,
    /// `Err` holds the reason the synthesizer refused the setup.
    pub synth: Result<SynthConfig, String>,
}

pub fn negotiate(hardware: &HardwareFormat, config: &MixerConfig) -> MusicResult<Negotiated> {
    let mut errors = Vec::new();

    let (sixteen_bit, swap_8bit_sign, swap_16bit_endianness) = match hardware.format {
        SampleFormat::U8 => (false, false, false),
        SampleFormat::S8 => (false, true, false),
        SampleFormat::S16Lsb | SampleFormat::S16Msb => {
            (true, false, hardware.format != SampleFormat::S16_NATIVE)
        }
        SampleFormat::U16Lsb | SampleFormat::U16Msb => {
            errors.push(MusicError::UnsupportedHardwareFormat(hardware.format));
            (true, false, false)
        }
    };

    match hardware.channels {
        0 => errors.push(MusicError::UnsupportedHardwareFormat(hardware.format)),
        1 | 2 => {}
        n => errors.push(MusicError::TooManyChannels(n)),
    }
    if hardware.freq == 0 {
        errors.push(MusicError::UnsupportedHardwareFormat(hardware.format));
    }

    if let Some(first) = first_error(errors) {
        return Err(first);
    }

    let correction = MixCorrection {
        frame_size: hardware.frame_size(),
        swap_8bit_sign,
        swap_16bit_endianness,
    };
    let module_driver = ModuleDriver {
        rate: hardware.freq,
        stereo: hardware.channels == 2,
        sixteen_bit,
        master_volume: config.module.master_volume,
        pan_separation: config.module.pan_separation,
    };

    let synth = SynthConfig::init(hardware, &config.midi);
    match &synth {
        Ok(_) => log::debug!("tunemix: MIDI synth ready at {} Hz", hardware.freq),
        Err(reason) => log::warn!("tunemix: MIDI synth unavailable: {}", reason),
    }

    log::info!(
        "tunemix: negotiated {} (module {}-bit {}, correction {:?})",
        hardware,
        if sixteen_bit { 16 } else { 8 },
        if module_driver.stereo { "stereo" } else { "mono" },
        correction
    );

    Ok(Negotiated {
        hardware: *hardware,
        correction,
        module_driver,
        synth,
    })
}

/// Log every negotiation error and keep the first.
fn first_error(errors: Vec<MusicError>) -> Option<MusicError> {
    for err in &errors {
        log::error!("tunemix: {}", err);
    }
    errors.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MidiSettings;

    fn hw(format: SampleFormat, channels: u16) -> HardwareFormat {
        HardwareFormat::new(22050, format, channels, 1024)
    }

    fn run(format: SampleFormat, channels: u16) -> MusicResult<Negotiated> {
        negotiate(&hw(format, channels), &MixerConfig::default())
    }

    #[test]
    fn signed_8bit_flips_sign() {
        let n = run(SampleFormat::S8, 1).unwrap();
        assert!(n.correction.swap_8bit_sign);
        assert!(!n.correction.swap_16bit_endianness);
        assert!(!n.module_driver.sixteen_bit);
        assert_eq!(n.correction.frame_size, 1);
    }

    #[test]
    fn unsigned_8bit_and_native_16bit_need_nothing() {
        for format in [SampleFormat::U8, SampleFormat::S16_NATIVE] {
            let n = run(format, 2).unwrap();
            assert!(!n.correction.swap_8bit_sign);
            assert!(!n.correction.swap_16bit_endianness);
            assert!(n.module_driver.stereo);
        }
    }

    #[test]
    fn foreign_16bit_swaps_bytes() {
        let foreign = if cfg!(target_endian = "little") {
            SampleFormat::S16Msb
        } else {
            SampleFormat::S16Lsb
        };
        let n = run(foreign, 2).unwrap();
        assert!(n.correction.swap_16bit_endianness);
        assert!(!n.correction.swap_8bit_sign);
        assert!(n.module_driver.sixteen_bit);
        assert_eq!(n.correction.frame_size, 4);
    }

    #[test]
    fn swaps_are_mutually_exclusive() {
        for format in [SampleFormat::U8, SampleFormat::S8, SampleFormat::S16Lsb, SampleFormat::S16Msb] {
            for channels in [1, 2] {
                let c = run(format, channels).unwrap().correction;
                assert!(!(c.swap_8bit_sign && c.swap_16bit_endianness));
            }
        }
    }

    #[test]
    fn byte_swap_scenario() {
        let correction = MixCorrection {
            frame_size: 4,
            swap_8bit_sign: false,
            swap_16bit_endianness: true,
        };
        let mut buf = [1, 2, 3, 4];
        correction.apply(&mut buf);
        assert_eq!(buf, [2, 1, 4, 3]);
    }

    #[test]
    fn sign_flip_scenario() {
        let correction = MixCorrection {
            frame_size: 1,
            swap_8bit_sign: true,
            swap_16bit_endianness: false,
        };
        let mut buf = [0x80, 0x00, 0xFF];
        correction.apply(&mut buf);
        assert_eq!(buf, [0x00, 0x80, 0x7F]);
    }

    #[test]
    fn unsigned_16bit_rejected() {
        assert!(matches!(
            run(SampleFormat::U16Lsb, 2),
            Err(MusicError::UnsupportedHardwareFormat(SampleFormat::U16Lsb))
        ));
        assert!(run(SampleFormat::U16Msb, 2).is_err());
    }

    #[test]
    fn channel_limits() {
        assert!(matches!(run(SampleFormat::S8, 6), Err(MusicError::TooManyChannels(6))));
        assert!(matches!(run(SampleFormat::S8, 0), Err(MusicError::UnsupportedHardwareFormat(_))));
    }

    #[test]
    fn first_of_several_errors_wins() {
        assert!(matches!(
            run(SampleFormat::U16Msb, 4),
            Err(MusicError::UnsupportedHardwareFormat(_))
        ));
    }

    #[test]
    fn synth_init_result_is_recorded() {
        let n = run(SampleFormat::S16Lsb, 2).unwrap();
        assert!(n.synth.is_ok());

        let config = MixerConfig {
            midi: MidiSettings { enabled: false, ..MidiSettings::default() },
            ..MixerConfig::default()
        };
        let n = negotiate(&hw(SampleFormat::S16Lsb, 2), &config).unwrap();
        assert!(n.synth.is_err());
    }

    #[test]
    fn module_settings_flow_into_driver() {
        let mut config = MixerConfig::default();
        config.module.pan_separation = 32;
        let n = negotiate(&hw(SampleFormat::U8, 2), &config).unwrap();
        assert_eq!(n.module_driver.pan_separation, 32);
        assert_eq!(n.module_driver.master_volume, 96);
        assert_eq!(n.module_driver.rate, 22050);
    }
}
