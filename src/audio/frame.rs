//! Raw PCM frame format
//!
//! Mono, signed 16-bit, 44.1 kHz, [`FRAME_SAMPLES`] samples per frame.
//! On the wire a frame is its samples in little-endian byte order with
//! no header, one frame per datagram.

use serde::{Deserialize, Serialize};

/// Sample rate of every stream
pub const SAMPLE_RATE: u32 = 44_100;

/// Mono
pub const CHANNELS: u16 = 1;

/// Samples per frame (and per datagram)
pub const FRAME_SAMPLES: usize = 1024;

/// Bytes per encoded frame
pub const FRAME_BYTES: usize = FRAME_SAMPLES * std::mem::size_of::<i16>();

/// Per-direction volume in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volumes {
    pub input: u8,
    pub output: u8,
}

impl Default for Volumes {
    fn default() -> Self {
        Self {
            input: 100,
            output: 100,
        }
    }
}

impl Volumes {
    pub fn new(input: i64, output: i64) -> Self {
        Self {
            input: clamp_volume(input),
            output: clamp_volume(output),
        }
    }

    pub fn input_gain(&self) -> f32 {
        volume_to_gain(self.input)
    }

    pub fn output_gain(&self) -> f32 {
        volume_to_gain(self.output)
    }
}

/// Clamp a requested volume to 0..=100
pub fn clamp_volume(pct: i64) -> u8 {
    pct.clamp(0, 100) as u8
}

/// Volume percent to linear gain in [0, 1]
pub fn volume_to_gain(pct: u8) -> f32 {
    f32::from(pct.min(100)) / 100.0
}

/// Scale samples in place
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain >= 1.0 {
        return;
    }
    let gain = gain.max(0.0);
    for sample in samples.iter_mut() {
        *sample = (f32::from(*sample) * gain).round() as i16;
    }
}

/// Samples to wire bytes
pub fn encode_frame(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Wire bytes to samples; a trailing odd byte is dropped
pub fn decode_frame(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Peak absolute sample value
pub fn peak(samples: &[i16]) -> u16 {
    samples
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_fits_one_datagram() {
        assert_eq!(FRAME_BYTES, 2048);
        assert!(FRAME_BYTES < 65_507);
    }

    #[test]
    fn test_wire_is_little_endian() {
        assert_eq!(encode_frame(&[1, -2]), vec![0x01, 0x00, 0xfe, 0xff]);
        assert_eq!(decode_frame(&[0x01, 0x00, 0xfe, 0xff, 0x07]), vec![1, -2]);
    }

    #[test]
    fn test_zero_gain_silences() {
        let mut samples = vec![i16::MAX, i16::MIN, 1234, -1];
        apply_gain(&mut samples, 0.0);
        assert_eq!(peak(&samples), 0);
    }

    #[test]
    fn test_unity_gain_is_identity() {
        let original = vec![i16::MAX, i16::MIN, 1234, -1];
        let mut samples = original.clone();
        apply_gain(&mut samples, 1.0);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_half_gain() {
        let mut samples = vec![1000, -1000, 3];
        apply_gain(&mut samples, 0.5);
        assert_eq!(samples, vec![500, -500, 2]);
    }

    proptest! {
        #[test]
        fn prop_volume_always_clamped(input in any::<i64>(), output in any::<i64>()) {
            let volumes = Volumes::new(input, output);
            prop_assert!(volumes.input <= 100 && volumes.output <= 100);
            prop_assert!((0.0..=1.0).contains(&volumes.input_gain()));
            prop_assert!((0.0..=1.0).contains(&volumes.output_gain()));
        }

        #[test]
        fn prop_gain_never_amplifies(samples in proptest::collection::vec(any::<i16>(), 0..256), pct in 0u8..=100) {
            let mut scaled = samples.clone();
            apply_gain(&mut scaled, volume_to_gain(pct));
            for (before, after) in samples.iter().zip(&scaled) {
                prop_assert!(after.unsigned_abs() <= before.unsigned_abs());
            }
        }
    }
}
