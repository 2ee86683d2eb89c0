//! Linkwitz-Riley 4th-order crossover filter (two cascaded 2nd-order
//! Butterworth sections per band). The low and high outputs of a pair of
//! these sum flat, which is what makes them usable as a crossover network.

use crate::{arg, Effect};

const SQRT2: f64 = std::f64::consts::SQRT_2;

/// Per-channel, per-band biquad history (two cascaded stages).
#[derive(Debug, Clone, Copy, Default)]
struct StageHistory {
    in_1a: f64,
    in_2a: f64,
    out_1a: f64,
    out_2a: f64,
    in_1b: f64,
    in_2b: f64,
    out_1b: f64,
    out_2b: f64,
}

pub struct LinkwitzRileyFilter {
    sample_rate: f64,
    cutoff: f64,
    /// 0 = lowpass output, 1 = highpass output.
    output_mode: i32,

    low_in: [f64; 3],
    low_out: [f64; 2],
    high_in: [f64; 3],
    high_out: [f64; 2],

    low_left: StageHistory,
    low_right: StageHistory,
    high_left: StageHistory,
    high_right: StageHistory,
}

impl LinkwitzRileyFilter {
    pub fn new(sample_rate: f64) -> Self {
        let mut filter = Self {
            sample_rate,
            cutoff: 1000.0,
            output_mode: 0,
            low_in: [0.0; 3],
            low_out: [0.0; 2],
            high_in: [0.0; 3],
            high_out: [0.0; 2],
            low_left: StageHistory::default(),
            low_right: StageHistory::default(),
            high_left: StageHistory::default(),
            high_right: StageHistory::default(),
        };
        filter.compute_coefficients();
        filter
    }

    pub fn set_params(&mut self, cutoff: f64, output_mode: i32) {
        self.cutoff = cutoff.clamp(20.0, 20000.0);
        self.output_mode = if output_mode == 1 { 1 } else { 0 };
        self.compute_coefficients();
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn output_mode(&self) -> i32 {
        self.output_mode
    }

    fn compute_coefficients(&mut self) {
        let warp = 1.0 / (std::f64::consts::PI * self.cutoff / self.sample_rate).tan();
        let warp2 = warp * warp;
        let mult = 1.0 / (1.0 + SQRT2 * warp + warp2);

        self.low_in = [mult, 2.0 * mult, mult];
        self.low_out = [
            -2.0 * (1.0 - warp2) * mult,
            -(1.0 - SQRT2 * warp + warp2) * mult,
        ];

        let high0 = warp2 * mult;
        self.high_in = [high0, -2.0 * high0, high0];
        self.high_out = self.low_out;
    }

    /// Two cascaded biquad stages over one history set.
    #[inline]
    fn run_band(
        input: f64,
        coeff_in: &[f64; 3],
        coeff_out: &[f64; 2],
        history: &mut StageHistory,
    ) -> f64 {
        let stage_a = input * coeff_in[0]
            + history.in_1a * coeff_in[1]
            + history.in_2a * coeff_in[2]
            + history.out_1a * coeff_out[0]
            + history.out_2a * coeff_out[1];
        history.in_2a = history.in_1a;
        history.in_1a = input;
        history.out_2a = history.out_1a;
        history.out_1a = stage_a;

        let stage_b = stage_a * coeff_in[0]
            + history.in_1b * coeff_in[1]
            + history.in_2b * coeff_in[2]
            + history.out_1b * coeff_out[0]
            + history.out_2b * coeff_out[1];
        history.in_2b = history.in_1b;
        history.in_1b = stage_a;
        history.out_2b = history.out_1b;
        history.out_1b = stage_b;

        stage_b
    }

    /// Split one sample pair into (low, high) without choosing an output.
    #[inline]
    pub fn split_sample(&mut self, left: f64, right: f64) -> ((f64, f64), (f64, f64)) {
        let low_l = Self::run_band(left, &self.low_in, &self.low_out, &mut self.low_left);
        let low_r = Self::run_band(right, &self.low_in, &self.low_out, &mut self.low_right);
        let high_l = Self::run_band(left, &self.high_in, &self.high_out, &mut self.high_left);
        let high_r = Self::run_band(right, &self.high_in, &self.high_out, &mut self.high_right);
        ((low_l, low_r), (high_l, high_r))
    }

    /// Process the selected band only (the `Effect` path).
    #[inline]
    fn process_selected(&mut self, left: f64, right: f64) -> (f64, f64) {
        if self.output_mode == 0 {
            (
                Self::run_band(left, &self.low_in, &self.low_out, &mut self.low_left),
                Self::run_band(right, &self.low_in, &self.low_out, &mut self.low_right),
            )
        } else {
            (
                Self::run_band(left, &self.high_in, &self.high_out, &mut self.high_left),
                Self::run_band(right, &self.high_in, &self.high_out, &mut self.high_right),
            )
        }
    }
}

impl Effect for LinkwitzRileyFilter {
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
        let start_index = start * 2;
        let end_index = (start_index + length * 2).min(buffer.len());

        if channels == 1 {
            let mut i = start_index;
            while i + 1 < end_index {
                let (out, _) = self.process_selected(buffer[i], buffer[i]);
                buffer[i] = out;
                buffer[i + 1] = out;
                i += 2;
            }
        } else {
            let mut i = start_index;
            while i + 1 < end_index {
                let (left, right) = self.process_selected(buffer[i], buffer[i + 1]);
                buffer[i] = left;
                buffer[i + 1] = right;
                i += 2;
            }
        }
        channels
    }

    fn set_args(&mut self, args: &[f64]) {
        let cutoff = arg(args, 0, 1000.0);
        let output_mode = arg(args, 1, 0.0) as i32;
        self.set_params(cutoff, output_mode);
    }

    fn reset(&mut self) {
        self.low_left = StageHistory::default();
        self.low_right = StageHistory::default();
        self.high_left = StageHistory::default();
        self.high_right = StageHistory::default();
        self.compute_coefficients();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sums_flat() {
        // LR4 low + high outputs must reconstruct the input (allpass sum).
        let mut filter = LinkwitzRileyFilter::new(48000.0);
        filter.set_params(1000.0, 0);

        // Drive with a slow sine; after settling, |low+high| tracks input.
        let mut max_error = 0.0f64;
        for i in 0..4800 {
            let x = (i as f64 * std::f64::consts::TAU * 100.0 / 48000.0).sin() * 0.5;
            let ((low_l, _), (high_l, _)) = filter.split_sample(x, x);
            if i > 2400 {
                // LR4 sum is allpass: magnitude preserved, phase rotated.
                let sum = low_l + high_l;
                max_error = max_error.max((sum.abs() - 0.5).max(0.0));
            }
        }
        assert!(max_error < 0.05, "crossover sum deviates by {max_error}");
    }

    #[test]
    fn test_lowpass_attenuates_high_frequency() {
        let mut filter = LinkwitzRileyFilter::new(48000.0);
        filter.set_params(500.0, 0);
        let mut peak = 0.0f64;
        for i in 0..4800 {
            let x = (i as f64 * std::f64::consts::TAU * 8000.0 / 48000.0).sin();
            let (out, _) = filter.process_selected(x, x);
            if i > 2400 {
                peak = peak.max(out.abs());
            }
        }
        // 4 poles at 4 octaves above cutoff: > 90 dB down in theory; leave
        // generous headroom for the settling tail.
        assert!(peak < 0.01, "lowpass leaked {peak}");
    }

    #[test]
    fn test_effect_processes_in_place() {
        let mut filter = LinkwitzRileyFilter::new(48000.0);
        filter.set_args(&[2000.0, 1.0]);
        let mut buffer = vec![0.25f64; 256];
        filter.process(2, &mut buffer, 0, 128);
        // DC through a highpass dies out.
        assert!(buffer[250].abs() < 0.25);
    }
}
