//! Single-band stereo compressor: peak envelope follower, soft knee,
//! attack/release ballistics and makeup gain.

use crate::{arg, Effect};

pub struct SingleBandCompressor {
    sample_rate: f64,

    threshold_db: f64,
    ratio: f64,
    attack_ms: f64,
    release_ms: f64,
    knee_db: f64,
    makeup_db: f64,

    attack_coef: f64,
    release_coef: f64,
    envelope_left: f64,
    envelope_right: f64,
}

impl SingleBandCompressor {
    pub fn new(sample_rate: f64) -> Self {
        let mut comp = Self {
            sample_rate,
            threshold_db: -20.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            knee_db: 6.0,
            makeup_db: 0.0,
            attack_coef: 0.0,
            release_coef: 0.0,
            envelope_left: 0.0,
            envelope_right: 0.0,
        };
        comp.update_coefficients();
        comp
    }

    fn update_coefficients(&mut self) {
        self.attack_coef = (-1.0 / (self.attack_ms * 0.001 * self.sample_rate)).exp();
        self.release_coef = (-1.0 / (self.release_ms * 0.001 * self.sample_rate)).exp();
    }

    fn compute_gain(&self, envelope: f64) -> f64 {
        if envelope < 1e-10 {
            return 1.0;
        }
        let input_db = 20.0 * envelope.log10();
        let threshold = self.threshold_db;
        let knee = self.knee_db;

        let output_db = if input_db < threshold - knee / 2.0 {
            input_db
        } else if input_db > threshold + knee / 2.0 {
            threshold + (input_db - threshold) / self.ratio
        } else {
            // Soft knee region.
            let x = input_db - threshold + knee / 2.0;
            input_db + (1.0 / self.ratio - 1.0) * x * x / (2.0 * knee)
        };

        10f64.powf((output_db - input_db) / 20.0)
    }
}

impl Effect for SingleBandCompressor {
    fn prepare_process(&mut self) -> usize {
        2
    }

    fn process(
        &mut self,
        channels: usize,
        buffer: &mut [f64],
        start: usize,
        length: usize,
    ) -> usize {
        let makeup = 10f64.powf(self.makeup_db / 20.0);
        let start_index = start * 2;
        let end_index = (start_index + length * 2).min(buffer.len());

        let mut i = start_index;
        while i + 1 < end_index {
            let input_left = buffer[i].abs();
            let input_right = buffer[i + 1].abs();

            let coef_left = if input_left > self.envelope_left {
                self.attack_coef
            } else {
                self.release_coef
            };
            let coef_right = if input_right > self.envelope_right {
                self.attack_coef
            } else {
                self.release_coef
            };
            self.envelope_left = input_left + coef_left * (self.envelope_left - input_left);
            self.envelope_right = input_right + coef_right * (self.envelope_right - input_right);

            let gain_left = self.compute_gain(self.envelope_left);
            let gain_right = self.compute_gain(self.envelope_right);

            buffer[i] *= gain_left * makeup;
            buffer[i + 1] *= gain_right * makeup;
            i += 2;
        }
        channels
    }

    fn set_args(&mut self, args: &[f64]) {
        self.threshold_db = arg(args, 0, -20.0).clamp(-60.0, 0.0);
        self.ratio = arg(args, 1, 4.0).clamp(1.0, 20.0);
        self.attack_ms = arg(args, 2, 10.0).clamp(0.1, 500.0);
        self.release_ms = arg(args, 3, 100.0).clamp(1.0, 2000.0);
        self.knee_db = arg(args, 4, 6.0).clamp(0.0, 24.0);
        self.makeup_db = arg(args, 5, 0.0).clamp(-24.0, 24.0);
        self.update_coefficients();
    }

    fn reset(&mut self) {
        self.envelope_left = 0.0;
        self.envelope_right = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loud_signal_is_reduced() {
        let mut comp = SingleBandCompressor::new(48000.0);
        comp.set_args(&[-20.0, 8.0, 1.0, 50.0, 0.0, 0.0]);
        let mut buffer = vec![0.9f64; 8192];
        comp.process(2, &mut buffer, 0, 4096);
        // Settled gain: -20 + (|0.9|dB - -20)/8, i.e. well below 0.9.
        assert!(buffer[8000] < 0.35, "got {}", buffer[8000]);
    }

    #[test]
    fn test_quiet_signal_passes() {
        let mut comp = SingleBandCompressor::new(48000.0);
        comp.set_args(&[-20.0, 8.0, 1.0, 50.0, 0.0, 0.0]);
        let mut buffer = vec![0.01f64; 2048];
        comp.process(2, &mut buffer, 0, 1024);
        assert!((buffer[2000] - 0.01).abs() < 1e-4);
    }
}
