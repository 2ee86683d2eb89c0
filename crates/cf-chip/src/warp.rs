//! Granular overlap-add engine for the streaming channel's warp modes
//! (TONES pitch-shift and TEXTURE stretch).
//!
//! Two alternating Hann-windowed grains read through the ring buffer with
//! their own fractional cursors. The engine is audio-thread-only state and
//! is embedded by composition; the data source is abstracted as a closure
//! so it works against any sample storage.

/// Warp modes of the streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum WarpMode {
    #[default]
    Off = 0,
    /// Playback rate follows the BPM ratio (varispeed).
    Repitch = 1,
    /// Reserved: BPM-ratio granular re-time.
    Beats = 2,
    /// Granular pitch-shift; timing follows the BPM ratio.
    Tones = 3,
    /// Granular texture stretch; grains play 1:1 with random offsets.
    Texture = 4,
}

impl WarpMode {
    pub fn from_index(index: i32) -> Self {
        match index {
            1 => Self::Repitch,
            2 => Self::Beats,
            3 => Self::Tones,
            4 => Self::Texture,
            _ => Self::Off,
        }
    }

    #[inline]
    pub fn is_granular(self) -> bool {
        matches!(self, Self::Tones | Self::Texture)
    }
}

/// Grain bounds in output samples (~5..100 ms at 48 kHz).
const GRAIN_MIN_SAMPLES: i32 = 240;
const GRAIN_MAX_SAMPLES: i32 = 4800;

#[derive(Debug, Clone, Copy, Default)]
pub struct Grain {
    /// Fractional read offset relative to the ring read head.
    pub read_pos: f64,
    /// Position within the grain window [0, grain_len).
    pub window_pos: f64,
    pub grain_len: i32,
    pub active: bool,
}

pub struct WarpProcessor {
    grains: [Grain; 2],
    /// Output sample counter driving grain scheduling.
    grain_phase: i32,
    /// Accumulated source position (advances at the BPM ratio or 1:1).
    grain_source_pos: f64,
    /// xorshift32 state for TEXTURE fluctuation; deterministic across runs.
    rng_state: u32,

    /// Grain size control, 0..1 mapped to GRAIN_MIN..GRAIN_MAX samples.
    grain_size: f64,
    /// Fluctuation amount for TEXTURE mode, 0..1.
    flux: f64,
}

impl WarpProcessor {
    pub fn new() -> Self {
        Self {
            grains: [Grain::default(); 2],
            grain_phase: 0,
            grain_source_pos: 0.0,
            rng_state: 1,
            grain_size: 0.5,
            flux: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.grains = [Grain::default(); 2];
        self.grain_phase = 0;
        self.grain_source_pos = 0.0;
        self.rng_state = 1;
        self.grain_size = 0.5;
        self.flux = 0.0;
    }

    #[inline]
    fn xorshift32(&mut self) -> u32 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;
        x
    }

    // ---- Parameters ----

    pub fn set_grain_size(&mut self, size: f64) {
        self.grain_size = size.clamp(0.0, 1.0);
    }

    pub fn grain_size(&self) -> f64 {
        self.grain_size
    }

    pub fn set_flux(&mut self, flux: f64) {
        self.flux = flux.clamp(0.0, 1.0);
    }

    pub fn flux(&self) -> f64 {
        self.flux
    }

    pub fn compute_grain_length(&self) -> i32 {
        GRAIN_MIN_SAMPLES
            + (self.grain_size * (GRAIN_MAX_SAMPLES - GRAIN_MIN_SAMPLES) as f64) as i32
    }

    #[inline]
    pub fn source_pos(&self) -> f64 {
        self.grain_source_pos
    }

    pub fn set_source_pos(&mut self, pos: f64) {
        self.grain_source_pos = pos;
    }

    #[inline]
    pub fn grain(&self, index: usize) -> &Grain {
        &self.grains[index & 1]
    }

    // ---- Engine ----

    fn start_grain(&mut self, slot: usize, source_pos: f64, warp_mode: WarpMode) {
        let grain_len = self.compute_grain_length();
        // TEXTURE fluctuation: randomize the read position by up to
        // +/-(flux * grain_len * 2) frames.
        let read_pos = if warp_mode == WarpMode::Texture && self.flux > 0.0 {
            let rand_norm = (self.xorshift32() & 0xffff) as f64 / 65535.0 * 2.0 - 1.0;
            let max_offset = self.flux * grain_len as f64 * 2.0;
            (source_pos + rand_norm * max_offset).max(0.0)
        } else {
            source_pos
        };

        let grain = &mut self.grains[slot];
        grain.grain_len = grain_len;
        grain.window_pos = 0.0;
        grain.active = true;
        grain.read_pos = read_pos;
    }

    /// Start a new grain when the phase counter crosses a hop boundary
    /// (half the grain length). Call once per output sample, before
    /// `read_granular`.
    pub fn schedule_grain_if_needed(&mut self, source_pos: f64, warp_mode: WarpMode) {
        let hop_size = (self.compute_grain_length() / 2).max(1);
        if self.grain_phase % hop_size == 0 {
            let slot = ((self.grain_phase / hop_size) & 1) as usize;
            self.start_grain(slot, source_pos, warp_mode);
        }
    }

    /// Advance the phase counter and source position. Call once per output
    /// sample, after `read_granular`.
    pub fn advance(&mut self, source_advance: f64) {
        self.grain_source_pos += source_advance;
        self.grain_phase += 1;
    }

    /// Mixed, windowed output for one channel. `read` maps (offset, channel)
    /// to a source sample; `available` bounds the readable region. Grain
    /// state advances only on the last channel so stereo reads don't
    /// double-step.
    pub fn read_granular(
        &mut self,
        read: impl Fn(usize, usize) -> f64,
        available: usize,
        channel: usize,
        channels: usize,
        pitch_step: f64,
    ) -> f64 {
        let mut mixed = 0.0;

        for grain in &mut self.grains {
            if !grain.active || grain.grain_len <= 0 {
                continue;
            }

            // Raised-cosine window for smooth overlap-add.
            let phase = grain.window_pos / grain.grain_len as f64;
            let window = 0.5 - 0.5 * (std::f64::consts::TAU * phase).cos();

            let base_index = grain.read_pos as i64;
            let frac = grain.read_pos - base_index as f64;
            if base_index >= 0 && ((base_index + 1) as usize) < available {
                let s0 = read(base_index as usize, channel);
                let s1 = read((base_index + 1) as usize, channel);
                mixed += (s0 + (s1 - s0) * frac) * window;
            }

            if channel == channels - 1 {
                grain.read_pos += pitch_step;
                grain.window_pos += 1.0;
                if grain.window_pos >= grain.grain_len as f64 {
                    grain.active = false;
                }
            }
        }

        mixed
    }

    /// Keep grain positions relative to the ring read head after frames are
    /// consumed from it.
    pub fn adjust_positions(&mut self, frames_consumed: usize) {
        self.grain_source_pos -= frames_consumed as f64;
        for grain in &mut self.grains {
            if grain.active {
                grain.read_pos -= frames_consumed as f64;
            }
        }
    }
}

impl Default for WarpProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grain_length_range() {
        let mut warp = WarpProcessor::new();
        warp.set_grain_size(0.0);
        assert_eq!(warp.compute_grain_length(), GRAIN_MIN_SAMPLES);
        warp.set_grain_size(1.0);
        assert_eq!(warp.compute_grain_length(), GRAIN_MAX_SAMPLES);
    }

    #[test]
    fn test_grains_alternate_on_hops() {
        let mut warp = WarpProcessor::new();
        warp.set_grain_size(0.0); // hop = 120
        warp.schedule_grain_if_needed(0.0, WarpMode::Tones);
        assert!(warp.grain(0).active);
        assert!(!warp.grain(1).active);
        for _ in 0..120 {
            warp.advance(1.0);
            warp.schedule_grain_if_needed(warp.source_pos(), WarpMode::Tones);
        }
        assert!(warp.grain(1).active, "second slot never scheduled");
    }

    #[test]
    fn test_window_is_zero_at_edges() {
        let mut warp = WarpProcessor::new();
        warp.set_grain_size(0.0);
        warp.schedule_grain_if_needed(0.0, WarpMode::Tones);
        // Constant source of 1.0; first output sample sits at window phase 0.
        let first = warp.read_granular(|_, _| 1.0, 1024, 0, 1, 1.0);
        assert!(first.abs() < 1e-9, "window must start at zero, got {first}");
    }

    #[test]
    fn test_overlap_add_is_roughly_unity_mid_grain() {
        let mut warp = WarpProcessor::new();
        warp.set_grain_size(0.0);
        let mut peak = 0.0f64;
        for _ in 0..2000 {
            warp.schedule_grain_if_needed(warp.source_pos(), WarpMode::Tones);
            let value = warp.read_granular(|_, _| 1.0, 1 << 20, 0, 1, 1.0);
            peak = peak.max(value);
            warp.advance(1.0);
        }
        // Two half-overlapping Hann windows sum to 1.0.
        assert!((peak - 1.0).abs() < 0.05, "overlap-add peak {peak}");
    }

    #[test]
    fn test_adjust_positions_shifts_grains() {
        let mut warp = WarpProcessor::new();
        warp.schedule_grain_if_needed(100.0, WarpMode::Tones);
        let before = warp.grain(0).read_pos;
        warp.adjust_positions(40);
        assert_eq!(warp.grain(0).read_pos, before - 40.0);
    }

    #[test]
    fn test_texture_flux_randomizes_within_bounds() {
        let mut warp = WarpProcessor::new();
        warp.set_grain_size(0.0);
        warp.set_flux(1.0);
        let grain_len = warp.compute_grain_length() as f64;
        for _ in 0..32 {
            warp.start_grain(0, 1000.0, WarpMode::Texture);
            let offset = (warp.grain(0).read_pos - 1000.0).abs();
            assert!(offset <= grain_len * 2.0 + 1e-9);
        }
    }
}
