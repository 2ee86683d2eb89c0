//! PCM wavelet data for the FM channel's PCM process mode.
//!
//! Samples are stored as log-table indices so the operator's envelope adds
//! directly onto them, exactly like any other wavelet.

use std::sync::Arc;

use cf_tables::amplitude_to_log_index;

/// Mono PCM data played through one FM operator.
#[derive(Clone)]
pub struct PcmData {
    /// Log-index samples.
    pub wavelet: Arc<[i32]>,
    pub start_point: i32,
    pub end_point: i32,
    /// -1 disables looping (one-shot).
    pub loop_point: i32,
}

impl PcmData {
    /// Build from normalized float samples. Stereo input is averaged down to
    /// mono; `loop_point` of -1 keeps the clip one-shot.
    pub fn from_samples(samples: &[f64], channels: usize, loop_point: i32) -> Self {
        let frames = if channels > 1 {
            samples.len() / channels
        } else {
            samples.len()
        };
        let mut wavelet = Vec::with_capacity(frames);
        for frame in 0..frames {
            let value = if channels > 1 {
                let base = frame * channels;
                (samples[base] + samples[base + 1]) * 0.5
            } else {
                samples[frame]
            };
            wavelet.push(amplitude_to_log_index(value));
        }
        let end_point = wavelet.len() as i32;
        Self {
            wavelet: wavelet.into(),
            start_point: 0,
            end_point,
            loop_point,
        }
    }

    pub fn len(&self) -> usize {
        self.wavelet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelet.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;
    use cf_tables::RefTables;

    #[test]
    fn test_from_samples_mono() {
        RefTables::initialize(SampleRate::Hz48000);
        let data = PcmData::from_samples(&[1.0, -1.0, 0.5], 1, -1);
        assert_eq!(data.len(), 3);
        assert_eq!(data.end_point, 3);
        assert_eq!(data.loop_point, -1);
        // Full positive scale maps to log index 0.
        assert_eq!(data.wavelet[0], 0);
        assert_eq!(data.wavelet[1], 1);
    }

    #[test]
    fn test_from_samples_stereo_downmix() {
        RefTables::initialize(SampleRate::Hz48000);
        let data = PcmData::from_samples(&[1.0, 0.0, -1.0, -1.0], 2, 0);
        assert_eq!(data.len(), 2);
        assert_eq!(data.loop_point, 0);
    }
}
