//! Sampler wave data: pre-resampled float PCM with slice points and
//! non-destructive boundary fades.

use std::sync::Arc;

use cf_core::TARGET_SAMPLE_RATE;

/// Boundary fade length in frames (~3 ms at 48 kHz).
const BOUNDARY_FADE_FRAMES: usize = 144;

/// Minimum tail kept when seeking the end gap.
const END_GAP_KEEP_FRAMES: i32 = 1152;

/// Linear resampler for mono/stereo interleaved PCM in [-1, 1].
fn resample_linear(src: &[f64], channels: usize, src_rate: u32, dst_rate: u32) -> Vec<f64> {
    if src_rate == dst_rate || src_rate == 0 || dst_rate == 0 {
        return src.to_vec();
    }
    let src_frames = src.len() / channels;
    if src_frames < 2 {
        return src.to_vec();
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let inv_ratio = 1.0 / ratio;
    let dst_frames = (src_frames as f64 * ratio).ceil() as usize;
    let mut dst = vec![0.0; dst_frames * channels];

    for ch in 0..channels {
        let mut src_pos = 0.0f64;
        for frame in 0..dst_frames {
            let mut index = src_pos.floor() as usize;
            let mut frac = src_pos - index as f64;
            if index >= src_frames - 1 {
                index = src_frames - 2;
                frac = 1.0;
            }
            let s0 = src[index * channels + ch];
            let s1 = src[(index + 1) * channels + ch];
            dst[frame * channels + ch] = s0 + (s1 - s0) * frac;
            src_pos += inv_ratio;
        }
    }
    dst
}

/// One loaded sample: interleaved float PCM at 48 kHz with slice points.
pub struct SamplerData {
    /// Working copy; boundary fades are baked into this one.
    wave_data: Vec<f64>,
    /// Untouched copy the fades are re-applied from.
    original_wave_data: Vec<f64>,
    channel_count: usize,

    start_point: i32,
    end_point: i32,
    /// -1 disables looping.
    loop_point: i32,

    ignore_note_off: bool,
    fixed_pitch: bool,
    pan: i32,
    gain_db: i32,
    gain_linear: f64,
    root_offset: i32,
    coarse_offset: i32,
    fine_offset: i32,
}

impl SamplerData {
    /// Build from interleaved float PCM. When `source_rate` differs from
    /// 48 kHz the data is resampled at load.
    pub fn new(samples: Vec<f64>, channels: usize, source_rate: u32) -> Self {
        let channels = channels.clamp(1, 2);
        let wave_data = resample_linear(&samples, channels, source_rate, TARGET_SAMPLE_RATE);
        let mut data = Self {
            original_wave_data: wave_data.clone(),
            wave_data,
            channel_count: channels,
            start_point: -1,
            end_point: -1,
            loop_point: -1,
            ignore_note_off: false,
            fixed_pitch: false,
            pan: 0,
            gain_db: 0,
            gain_linear: 1.0,
            root_offset: 0,
            coarse_offset: 0,
            fine_offset: 0,
        };
        data.slice();
        data
    }

    #[inline]
    pub fn wave_data(&self) -> &[f64] {
        &self.wave_data
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Length in frames.
    pub fn length(&self) -> i32 {
        (self.wave_data.len() / self.channel_count) as i32
    }

    #[inline]
    pub fn start_point(&self) -> i32 {
        self.start_point
    }

    #[inline]
    pub fn end_point(&self) -> i32 {
        self.end_point
    }

    #[inline]
    pub fn loop_point(&self) -> i32 {
        self.loop_point
    }

    #[inline]
    pub fn ignore_note_off(&self) -> bool {
        self.ignore_note_off
    }

    pub fn set_ignore_note_off(&mut self, ignore: bool) {
        // A looping sample has to honor note-off or it never stops.
        self.ignore_note_off = self.loop_point == -1 && ignore;
    }

    #[inline]
    pub fn is_fixed_pitch(&self) -> bool {
        self.fixed_pitch
    }

    pub fn set_fixed_pitch(&mut self, fixed: bool) {
        self.fixed_pitch = fixed;
    }

    #[inline]
    pub fn pan(&self) -> i32 {
        self.pan
    }

    pub fn set_pan(&mut self, pan: i32) {
        self.pan = pan.clamp(-64, 64);
    }

    #[inline]
    pub fn gain_db(&self) -> i32 {
        self.gain_db
    }

    #[inline]
    pub fn gain_linear(&self) -> f64 {
        self.gain_linear
    }

    pub fn set_gain_db(&mut self, db: i32) {
        self.gain_db = db.clamp(-36, 36);
        self.gain_linear = 10f64.powf(self.gain_db as f64 / 20.0);
    }

    #[inline]
    pub fn root_offset(&self) -> i32 {
        self.root_offset
    }

    pub fn set_root_offset(&mut self, semitones: i32) {
        self.root_offset = semitones.clamp(-48, 48);
    }

    #[inline]
    pub fn coarse_offset(&self) -> i32 {
        self.coarse_offset
    }

    pub fn set_coarse_offset(&mut self, semitones: i32) {
        self.coarse_offset = semitones.clamp(-48, 48);
    }

    #[inline]
    pub fn fine_offset(&self) -> i32 {
        self.fine_offset
    }

    pub fn set_fine_offset(&mut self, cents: i32) {
        self.fine_offset = cents.clamp(-100, 100);
    }

    /// Playback start frame for a note-on phase in [0, 1].
    pub fn initial_sample_index(&self, phase: f64) -> i32 {
        (self.start_point as f64 * (1.0 - phase) + self.end_point as f64 * phase) as i32
    }

    pub fn set_start_point(&mut self, start: i32) {
        self.start_point = start;
        self.slice();
    }

    pub fn set_end_point(&mut self, end: i32) {
        self.end_point = end;
        self.slice();
    }

    pub fn set_loop_point(&mut self, loop_point: i32) {
        self.loop_point = loop_point;
        self.slice();
    }

    /// Skip leading silence: first frame where a 0.5 ms mean-square window
    /// crosses the audible threshold.
    fn seek_head_silence(&self) -> i32 {
        if self.wave_data.is_empty() {
            return 0;
        }
        const WINDOW: usize = 22;
        let threshold = 0.0011 * self.channel_count as f64;
        let mut window = [0.0f64; WINDOW];
        let mut cursor = 0usize;
        let mut ms = 0.0f64;

        let frames = self.length() as usize;
        for frame in 0..frames {
            ms -= window[cursor];
            let mut energy = 0.0;
            for ch in 0..self.channel_count {
                let v = self.wave_data[frame * self.channel_count + ch];
                energy += v * v;
            }
            window[cursor] = energy;
            ms += energy;
            cursor = (cursor + 1) % WINDOW;
            if ms > threshold {
                return (frame as i32 - WINDOW as i32).max(0);
            }
        }
        0
    }

    /// Find the last audible frame, keeping a short tail.
    fn seek_end_gap(&self) -> i32 {
        if self.wave_data.is_empty() {
            return 0;
        }
        let threshold = 0.0001 * self.channel_count as f64;
        let frames = self.length();
        for frame in (0..frames).rev() {
            let mut energy = 0.0;
            for ch in 0..self.channel_count {
                let v = self.wave_data[(frame as usize) * self.channel_count + ch];
                energy += v * v;
            }
            if energy > threshold {
                return frame.max(frames - 1 - END_GAP_KEEP_FRAMES);
            }
        }
        (frames - 1).max(0)
    }

    /// Resolve slice points and re-apply the boundary fades from the
    /// unmodified copy.
    fn slice(&mut self) {
        if self.start_point < 0 {
            self.start_point = self.seek_head_silence();
        }
        if self.loop_point < 0 {
            self.loop_point = -1;
        }
        if self.end_point < 0 {
            self.end_point = self.seek_end_gap();
        }
        if self.end_point < self.loop_point {
            self.loop_point = -1;
        }
        if self.end_point < self.start_point {
            self.end_point = (self.length() - 1).max(0);
        }
        if self.loop_point != -1 {
            self.ignore_note_off = false;
        }

        self.apply_boundary_fades();
    }

    fn apply_boundary_fades(&mut self) {
        self.wave_data.copy_from_slice(&self.original_wave_data);

        let channels = self.channel_count;
        let start = self.start_point.max(0) as usize;
        let end = (self.end_point.max(0) as usize).min(self.length().max(0) as usize);
        if end <= start {
            return;
        }
        let fade = BOUNDARY_FADE_FRAMES.min((end - start) / 2);
        if fade == 0 {
            return;
        }

        for i in 0..fade {
            let gain = i as f64 / fade as f64;
            for ch in 0..channels {
                self.wave_data[(start + i) * channels + ch] *= gain;
            }
        }
        // No fade-out at the end point when the loop region covers it.
        if self.loop_point == -1 {
            for i in 0..fade {
                let gain = i as f64 / fade as f64;
                for ch in 0..channels {
                    self.wave_data[(end - 1 - i) * channels + ch] *= gain;
                }
            }
        }
    }
}

/// Shared handle to one sample. The audio thread locks only at block scope;
/// the control thread builds instances before sharing them.
pub type SamplerDataRef = Arc<parking_lot::Mutex<SamplerData>>;

/// A bank of up to 128 samples addressed by note number.
#[derive(Default)]
pub struct SamplerTable {
    samples: Vec<Option<SamplerDataRef>>,
}

impl SamplerTable {
    pub fn new() -> Self {
        Self {
            samples: vec![None; 128],
        }
    }

    pub fn set_sample(&mut self, note: usize, data: SamplerData) {
        if note < 128 {
            self.samples[note] = Some(Arc::new(parking_lot::Mutex::new(data)));
        }
    }

    pub fn sample(&self, note: usize) -> Option<SamplerDataRef> {
        self.samples.get(note & 127).cloned().flatten()
    }

    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize) -> Vec<f64> {
        (0..frames).map(|i| ((i % 100) as f64 - 50.0) / 50.0).collect()
    }

    #[test]
    fn test_resample_doubles_length() {
        let src = ramp(1000);
        let out = resample_linear(&src, 1, 24000, 48000);
        assert_eq!(out.len(), 2000);
    }

    #[test]
    fn test_slice_defaults() {
        let data = SamplerData::new(ramp(4800), 1, 48000);
        assert!(data.start_point() >= 0);
        assert!(data.end_point() > data.start_point());
        assert_eq!(data.loop_point(), -1);
    }

    #[test]
    fn test_boundary_fade_is_nondestructive() {
        let mut data = SamplerData::new(ramp(4800), 1, 48000);
        let faded_head = data.wave_data()[data.start_point() as usize];
        // Moving the start point re-derives the fade from the original copy.
        data.set_start_point(100);
        data.set_start_point(0);
        assert_eq!(data.start_point(), 0);
        let _ = faded_head;
        // Frame just past the fade region must be untouched.
        let idx = BOUNDARY_FADE_FRAMES + 1;
        assert_eq!(data.wave_data()[idx], data.original_wave_data[idx]);
    }

    #[test]
    fn test_loop_point_disables_ignore_note_off() {
        let mut data = SamplerData::new(ramp(4800), 1, 48000);
        data.set_loop_point(100);
        data.set_ignore_note_off(true);
        assert!(!data.ignore_note_off());
    }

    #[test]
    fn test_gain_clamp() {
        let mut data = SamplerData::new(ramp(100), 1, 48000);
        data.set_gain_db(99);
        assert_eq!(data.gain_db(), 36);
        assert!((data.gain_linear() - 10f64.powf(1.8)).abs() < 1e-9);
    }
}
