//! Stereo delay with optional cross-feedback and click-free delay-time
//! changes (crossfade or pitch-glide between read positions).

use crate::{arg, Effect};

const DELAY_BUFFER_BITS: usize = 16;
const DELAY_BUFFER_LEN: usize = 1 << DELAY_BUFFER_BITS;
const DELAY_BUFFER_MASK: usize = DELAY_BUFFER_LEN - 1;

/// Time it takes to move to a new delay time, in seconds.
const CROSSFADE_TIME: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum DelayTimeMode {
    /// Glide the read pointer (tape-style pitch artifact).
    Pitch = 0,
    /// Crossfade between the old and new read positions.
    #[default]
    Fade = 1,
}

impl DelayTimeMode {
    fn from_index(index: i32) -> Self {
        if index == 0 {
            Self::Pitch
        } else {
            Self::Fade
        }
    }
}

pub struct StereoDelay {
    sample_rate: f64,

    delay_buffer_left: Vec<f64>,
    delay_buffer_right: Vec<f64>,
    pointer_write: usize,
    pointer_read: usize,
    pointer_read_old: usize,
    pointer_read_target: usize,
    pointer_read_fractional: f64,
    crossfade_position: f64,
    crossfade_increment: f64,
    time_mode: DelayTimeMode,

    feedback: f64,
    cross: bool,
    wet: f64,
    dry_gain: f64,
    wet_gain: f64,
}

impl StereoDelay {
    pub fn new(sample_rate: f64) -> Self {
        let mut delay = Self {
            sample_rate,
            delay_buffer_left: vec![0.0; DELAY_BUFFER_LEN],
            delay_buffer_right: vec![0.0; DELAY_BUFFER_LEN],
            pointer_write: 0,
            pointer_read: 0,
            pointer_read_old: 0,
            pointer_read_target: 0,
            pointer_read_fractional: 0.0,
            crossfade_position: 1.0,
            crossfade_increment: 1.0,
            time_mode: DelayTimeMode::Fade,
            feedback: 0.25,
            cross: false,
            wet: 0.25,
            dry_gain: 1.0,
            wet_gain: 0.0,
        };
        delay.set_params(250.0, 0.25, false, 0.25, DelayTimeMode::Fade);
        delay
    }

    pub fn set_params(
        &mut self,
        delay_time_ms: f64,
        feedback: f64,
        cross: bool,
        wet: f64,
        time_mode: DelayTimeMode,
    ) {
        let samples_per_ms = self.sample_rate / 1000.0;
        let offset = ((delay_time_ms * samples_per_ms) as usize).min(DELAY_BUFFER_MASK);
        let current_offset = self.pointer_write.wrapping_sub(self.pointer_read) & DELAY_BUFFER_MASK;

        self.time_mode = time_mode;

        if current_offset != offset {
            self.pointer_read_old = self.pointer_read;
            self.pointer_read_target =
                self.pointer_write.wrapping_sub(offset) & DELAY_BUFFER_MASK;
            self.pointer_read_fractional = 0.0;
            self.crossfade_position = 0.0;
            let crossfade_samples = (CROSSFADE_TIME * self.sample_rate) as i32;
            self.crossfade_increment = if crossfade_samples > 0 {
                1.0 / crossfade_samples as f64
            } else {
                1.0
            };
        }

        self.feedback = feedback.clamp(-0.9990234375, 0.9990234375);
        self.wet = wet;
        self.cross = cross;

        // Constant-power dry/wet law.
        let angle = self.wet.clamp(0.0, 1.0) * std::f64::consts::FRAC_PI_2;
        self.dry_gain = angle.cos();
        self.wet_gain = angle.sin();
    }

    /// Delayed value for the current read state of one lane.
    #[inline]
    fn read_value(&self, read_buffer: &[f64]) -> f64 {
        if self.crossfade_position < 1.0 && self.time_mode == DelayTimeMode::Fade {
            let old_value = read_buffer[self.pointer_read_old];
            let new_value = read_buffer[self.pointer_read_target];
            old_value * (1.0 - self.crossfade_position) + new_value * self.crossfade_position
        } else {
            read_buffer[self.pointer_read]
        }
    }

    fn advance_pointers(&mut self) {
        self.pointer_write = (self.pointer_write + 1) & DELAY_BUFFER_MASK;

        if self.crossfade_position < 1.0 {
            self.crossfade_position += self.crossfade_increment;
            if self.crossfade_position >= 1.0 {
                self.crossfade_position = 1.0;
                self.pointer_read = self.pointer_read_target;
                self.pointer_read_fractional = 0.0;
            }

            if self.time_mode == DelayTimeMode::Pitch {
                let mut distance = (self
                    .pointer_read_target
                    .wrapping_sub(self.pointer_read_old)
                    & DELAY_BUFFER_MASK) as i64;
                if distance > (DELAY_BUFFER_MASK >> 1) as i64 {
                    distance = distance - DELAY_BUFFER_MASK as i64 - 1;
                }
                let step = 1.0 + distance as f64 * self.crossfade_increment;
                self.pointer_read_fractional += step;
                let step_int = self.pointer_read_fractional as i64;
                self.pointer_read_fractional -= step_int as f64;
                self.pointer_read =
                    (self.pointer_read.wrapping_add(step_int as usize)) & DELAY_BUFFER_MASK;
            }

            self.pointer_read_old = (self.pointer_read_old + 1) & DELAY_BUFFER_MASK;
            self.pointer_read_target = (self.pointer_read_target + 1) & DELAY_BUFFER_MASK;
        } else {
            self.pointer_read = (self.pointer_read + 1) & DELAY_BUFFER_MASK;
        }
    }
}

impl Effect for StereoDelay {
    fn prepare_process(&mut self) -> usize {
        self.delay_buffer_left.fill(0.0);
        self.delay_buffer_right.fill(0.0);
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

        let mut i = start_index;
        while i + 1 < end_index {
            // Left lane (reads right when cross-feedback is on).
            let left_read = if self.cross {
                self.read_value(&self.delay_buffer_right)
            } else {
                self.read_value(&self.delay_buffer_left)
            };
            self.delay_buffer_left[self.pointer_write] = buffer[i] - left_read * self.feedback;
            buffer[i] = buffer[i] * self.dry_gain + left_read * self.wet_gain;

            // Right lane.
            let right_read = if self.cross {
                self.read_value(&self.delay_buffer_left)
            } else {
                self.read_value(&self.delay_buffer_right)
            };
            self.delay_buffer_right[self.pointer_write] =
                buffer[i + 1] - right_read * self.feedback;
            buffer[i + 1] = buffer[i + 1] * self.dry_gain + right_read * self.wet_gain;

            self.advance_pointers();
            i += 2;
        }
        channels
    }

    fn set_args(&mut self, args: &[f64]) {
        let delay_time = arg(args, 0, 250.0);
        let feedback = arg(args, 1, 25.0) / 100.0;
        let cross = arg(args, 2, 0.0) as i32 == 1;
        let wet = arg(args, 3, 100.0) / 100.0;
        let time_mode = DelayTimeMode::from_index(arg(args, 4, DelayTimeMode::Fade as i32 as f64) as i32);
        self.set_params(delay_time, feedback, cross, wet, time_mode);
    }

    fn reset(&mut self) {
        self.delay_buffer_left.fill(0.0);
        self.delay_buffer_right.fill(0.0);
        self.set_params(250.0, 0.25, false, 0.25, DelayTimeMode::Fade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a delay and run enough silence through it that any pending
    /// delay-time crossfade has fully settled.
    fn settled_delay(ms: f64, feedback: f64, cross: bool, wet: f64) -> StereoDelay {
        let mut delay = StereoDelay::new(48000.0);
        delay.set_params(ms, feedback, cross, wet, DelayTimeMode::Fade);
        let mut silence = vec![0.0f64; 8192 * 2];
        delay.process(2, &mut silence, 0, 8192);
        delay.prepare_process();
        delay
    }

    #[test]
    fn test_impulse_returns_after_delay_time() {
        // 10 ms delay, full wet.
        let mut delay = settled_delay(10.0, 0.0, false, 1.0);

        let frames = 1024;
        let mut buffer = vec![0.0f64; frames * 2];
        buffer[0] = 1.0;
        buffer[1] = 1.0;
        delay.process(2, &mut buffer, 0, frames);

        // Echo lands 480 frames later.
        let echo = buffer[480 * 2].abs();
        assert!(echo > 0.4, "echo missing, value {echo}");
        // Full-wet kills the dry impulse.
        assert!(buffer[0].abs() < 1e-6);
    }

    #[test]
    fn test_feedback_produces_repeats() {
        let mut delay = settled_delay(5.0, 0.5, false, 1.0);

        let frames = 2048;
        let mut buffer = vec![0.0f64; frames * 2];
        buffer[0] = 1.0;
        buffer[1] = 1.0;
        delay.process(2, &mut buffer, 0, frames);

        let first = buffer[240 * 2].abs();
        let second = buffer[480 * 2].abs();
        assert!(first > 0.3);
        assert!(second > 0.05 && second < first);
    }

    #[test]
    fn test_cross_feedback_swaps_lanes() {
        let mut delay = settled_delay(5.0, 0.0, true, 1.0);

        let frames = 1024;
        let mut buffer = vec![0.0f64; frames * 2];
        buffer[0] = 1.0; // left-only impulse
        delay.process(2, &mut buffer, 0, frames);

        // The echo appears on the right lane.
        assert!(buffer[240 * 2 + 1].abs() > 0.4);
        assert!(buffer[240 * 2].abs() < 1e-6);
    }
}
