//! Streaming channel: plays disk-streamed clips from the 48 kHz ring buffer
//! with tempo warping (repitch or granular), trim, fades and looping.

use std::sync::Arc;

use cf_stream::StreamWaveData;
use cf_tables::SAMPLE_MAX;

use crate::channel::{ChannelCommon, OutputMode, RenderContext};
use crate::pipe::RIGHT_PIPE;
use crate::warp::{WarpMode, WarpProcessor};

const STREAM_GAIN_MIN_DB: i32 = -36;
const STREAM_GAIN_MAX_DB: i32 = 36;

pub struct StreamChannel {
    pub common: ChannelCommon,

    stream_data: Option<Arc<StreamWaveData>>,

    playing: bool,
    reached_end: bool,
    /// Fractional read position into the ring (frames past the read head).
    playback_pos: f64,
    /// Source-domain 48 kHz frames consumed since the clip start.
    source_frames_elapsed: f64,

    gain_db: i32,
    clip_gain: f64,
    pitch_step: f64,
    pitch_cents: i32,
    fade_in_frames: i64,
    fade_out_frames: i64,
    in_sample: i64,
    out_sample: i64,
    warp_mode: WarpMode,
    clip_bpm: f64,

    looping: bool,
    loop_start_48k: i64,
    loop_end_48k: i64,
    loops_completed: u64,

    warp: WarpProcessor,
}

impl StreamChannel {
    pub fn new() -> Self {
        let mut channel = Self {
            common: ChannelCommon::new(),
            stream_data: None,
            playing: false,
            reached_end: false,
            playback_pos: 0.0,
            source_frames_elapsed: 0.0,
            gain_db: 0,
            clip_gain: 1.0,
            pitch_step: 1.0,
            pitch_cents: 0,
            fade_in_frames: 0,
            fade_out_frames: 0,
            in_sample: 0,
            out_sample: 0,
            warp_mode: WarpMode::Off,
            clip_bpm: 0.0,
            looping: false,
            loop_start_48k: 0,
            loop_end_48k: 0,
            loops_completed: 0,
            warp: WarpProcessor::new(),
        };
        channel.reset();
        channel
    }

    pub fn initialize(&mut self, prev: Option<&ChannelCommon>, buffer_index: usize) {
        self.common.initialize(prev, buffer_index);
        self.reset();
        self.common.filter_variables2 = [0.0; 3];
    }

    pub fn reset(&mut self) {
        self.common.reset();
        self.playing = false;
        self.reached_end = false;
        self.stream_data = None;
        self.playback_pos = 0.0;
        self.source_frames_elapsed = 0.0;
        self.gain_db = 0;
        self.clip_gain = 1.0;
        self.pitch_step = 1.0;
        self.pitch_cents = 0;
        self.fade_in_frames = 0;
        self.fade_out_frames = 0;
        self.in_sample = 0;
        self.out_sample = 0;
        self.warp_mode = WarpMode::Off;
        self.clip_bpm = 0.0;
        self.looping = false;
        self.loop_start_48k = 0;
        self.loop_end_48k = 0;
        self.loops_completed = 0;
        self.warp.reset();
    }

    // ---- Wave data ----

    pub fn set_stream_data(&mut self, data: Arc<StreamWaveData>) {
        self.stream_data = Some(data);
    }

    pub fn stream_data(&self) -> Option<&Arc<StreamWaveData>> {
        self.stream_data.as_ref()
    }

    #[inline]
    pub fn loops_completed(&self) -> u64 {
        self.loops_completed
    }

    // ---- Pitch / warp ----

    fn recalc_pitch_step(&mut self, bpm: f64) {
        self.pitch_step = match self.warp_mode {
            WarpMode::Repitch if self.clip_bpm > 0.0 => {
                // Varispeed: rate is fully determined by the BPM ratio; user
                // pitch is ignored.
                bpm / self.clip_bpm
            }
            // TONES: grains read at the user pitch while the source position
            // advances at the BPM ratio.
            WarpMode::Tones => 2f64.powf(self.pitch_cents as f64 / 1200.0),
            // TEXTURE: grains always play 1:1; stretching comes from the
            // granular engine alone.
            WarpMode::Texture => 1.0,
            _ => 2f64.powf(self.pitch_cents as f64 / 1200.0),
        };
    }

    /// Effective clip length relative to `in_sample`, in 48 kHz frames.
    fn effective_clip_length(&self) -> i64 {
        if self.out_sample > 0 {
            return self.out_sample - self.in_sample;
        }
        match &self.stream_data {
            Some(data) => data.total_frames_48k() as i64 - self.in_sample,
            None => 0,
        }
    }

    fn compute_fade_envelope(&self, source_frame: f64) -> f64 {
        let mut env = 1.0;

        // Fade-in only on the very first loop iteration.
        if self.fade_in_frames > 0
            && self.loops_completed == 0
            && source_frame < self.fade_in_frames as f64
        {
            env *= source_frame / self.fade_in_frames as f64;
        }

        // Fade-out only when not looping.
        if self.fade_out_frames > 0 && !self.looping {
            let total = self.effective_clip_length();
            if total > 0 {
                let fade_out_start = (total - self.fade_out_frames) as f64;
                if source_frame >= fade_out_start && source_frame < total as f64 {
                    env *= (total as f64 - source_frame) / self.fade_out_frames as f64;
                }
            }
        }

        env
    }

    // ---- Note events ----

    pub fn note_on(&mut self) {
        let Some(data) = self.stream_data.clone() else {
            self.common.is_idling = true;
            return;
        };

        self.common.cancel_kill_fade();

        self.playback_pos = 0.0;
        self.source_frames_elapsed = 0.0;
        self.playing = true;
        self.reached_end = false;
        self.common.is_idling = false;
        self.loops_completed = 0;

        // Sync trim and loop state so the loader wraps at the right frames.
        data.set_in_sample(self.in_sample);
        data.set_out_sample(self.out_sample);
        data.set_looping(self.looping);
        data.set_loop_region(self.loop_start_48k, self.loop_end_48k);

        // Granular state restarts but keeps the user parameters.
        let grain_size = self.warp.grain_size();
        let flux = self.warp.flux();
        self.warp.reset();
        self.warp.set_grain_size(grain_size);
        self.warp.set_flux(flux);

        // Reposition the ring at the clip start; without this a retrigger
        // would read the tail of the previous playback. seek() is lock-free
        // from this thread's perspective and the loader refills async;
        // buffer() rides out any brief underrun with silence.
        data.seek(self.in_sample);
        data.activate();

        self.common.note_on();
    }

    pub fn note_off(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        self.common.start_kill_fade(-1);
        self.common.note_off();
    }

    // ---- Block generation ----

    pub fn buffer(&mut self, ctx: &mut RenderContext, length: usize) {
        let Some(data) = self.stream_data.clone() else {
            self.buffer_no_process(length);
            return;
        };
        if self.common.is_idling || !self.playing {
            // Let a pending kill fade finish on silence.
            if self.common.kill_fade_remaining() > 0 {
                self.render_silence_with_fade(ctx, length, data.channel_count() == 2);
            }
            self.buffer_no_process(length);
            return;
        }

        let channels = data.channel_count();
        let stereo = channels == 2;
        let effective_end = self.effective_clip_length();
        if effective_end <= 0 {
            self.buffer_no_process(length);
            return;
        }

        // Loop boundary relative to in_sample.
        let mut effective_loop_end = effective_end;
        let mut loop_offset = 0.0f64;
        if self.looping {
            let end = if self.loop_end_48k > 0 {
                self.loop_end_48k
            } else if self.out_sample > 0 {
                self.out_sample
            } else {
                data.total_frames_48k() as i64
            };
            let start = if self.loop_start_48k > 0 {
                self.loop_start_48k
            } else {
                self.in_sample
            };
            effective_loop_end = end - self.in_sample;
            loop_offset = (start - self.in_sample) as f64;
            if effective_loop_end <= loop_offset as i64 {
                effective_loop_end = effective_end;
            }
        }

        let start = self.common.buffer_index;
        let out_pipe = self.common.out_pipe;

        if self.warp_mode.is_granular() {
            self.buffer_granular(
                ctx,
                &data,
                length,
                channels,
                effective_loop_end,
                loop_offset,
            );
        } else {
            self.buffer_standard(
                ctx,
                &data,
                length,
                channels,
                effective_loop_end,
                loop_offset,
            );
        }

        // Ask for a refill when the ring is running low.
        if data.ring_available() < data.ring_capacity() / 2 {
            data.request_refill();
        }

        // Post DSP.
        if self.common.filter_on {
            if stereo {
                let (left, right) = ctx.pipes.pipe_pair(out_pipe, RIGHT_PIPE);
                self.common.apply_sv_filter_stereo(
                    &mut left[start..start + length],
                    &mut right[start..start + length],
                );
            } else {
                let out = ctx.pipes.slice_mut(out_pipe, start, length);
                self.common.apply_sv_filter(out, false);
            }
        }

        if self.common.kill_fade_remaining() > 0 {
            let completed = if stereo {
                let (left, right) = ctx.pipes.pipe_pair(out_pipe, RIGHT_PIPE);
                self.common.apply_kill_fade_stereo(
                    &mut left[start..start + length],
                    &mut right[start..start + length],
                )
            } else {
                let out = ctx.pipes.slice_mut(out_pipe, start, length);
                self.common.apply_kill_fade(out)
            };
            if completed {
                data.deactivate();
                self.reset();
            }
        }

        // Mix into streams.
        if !self.common.mute && self.common.output_mode == OutputMode::Standard {
            let volume_coef = ctx.sampler_volume * self.common.instrument_gain;
            let pan = self.common.pan.clamp(0, 128);
            let RenderContext {
                pipes,
                bank,
                slot_targets,
                ..
            } = ctx;
            if stereo {
                let (left, right) = pipes.pipe_pair(out_pipe, RIGHT_PIPE);
                self.common.write_stream_stereo(
                    bank,
                    slot_targets,
                    &left[start..start + length],
                    &right[start..start + length],
                    length,
                    volume_coef,
                    pan,
                );
            } else {
                let out = pipes.slice(out_pipe, start, length);
                self.common.write_stream_mono(
                    bank,
                    slot_targets,
                    out,
                    length,
                    volume_coef,
                    pan,
                );
            }
        }

        self.common.buffer_index += length;
    }

    /// Non-granular path: linear interpolation through the ring at the
    /// pitch step (1:1, user pitch, or the REPITCH BPM ratio).
    fn buffer_standard(
        &mut self,
        ctx: &mut RenderContext,
        data: &Arc<StreamWaveData>,
        length: usize,
        channels: usize,
        effective_loop_end: i64,
        loop_offset: f64,
    ) {
        let start = self.common.buffer_index;
        let out_pipe = self.common.out_pipe;
        let stereo = channels == 2;
        let max = SAMPLE_MAX as f64;

        for i in 0..length {
            let pos = start + i;

            // End/loop check before interpolation; wrap preserves overshoot.
            if self.source_frames_elapsed >= effective_loop_end as f64 || self.reached_end {
                if self.looping && !self.reached_end {
                    let overshoot = self.source_frames_elapsed - effective_loop_end as f64;
                    self.source_frames_elapsed = loop_offset + overshoot;
                    self.loops_completed += 1;
                    // The ring is continuous across the wrap (the loader
                    // wrapped at loop_end); playback_pos is NOT reset.
                } else {
                    // One-shot end: click-safe stop, channel stays alive so
                    // the filter can decay on zero input.
                    self.common.start_kill_fade(-1);
                    self.playing = false;
                    for j in i..length {
                        ctx.pipes.write(out_pipe, start + j, 0);
                        if stereo {
                            ctx.pipes.write(RIGHT_PIPE, start + j, 0);
                        }
                    }
                    break;
                }
            }

            // Interpolation needs two frames of footroom.
            let available = data.ring_available();
            let needed = self.playback_pos as usize + 2;
            if available < needed {
                // Underrun: silence for this sample, position still advances.
                ctx.pipes.write(out_pipe, pos, 0);
                if stereo {
                    ctx.pipes.write(RIGHT_PIPE, pos, 0);
                }
                self.source_frames_elapsed += self.pitch_step;
                self.playback_pos += self.pitch_step;
                continue;
            }

            let base_index = self.playback_pos as usize;
            let frac = self.playback_pos - base_index as f64;

            let l0 = data.ring_read_sample(base_index, 0);
            let l1 = data.ring_read_sample(base_index + 1, 0);
            let sample_left = l0 + (l1 - l0) * frac;
            let sample_right = if stereo {
                let r0 = data.ring_read_sample(base_index, 1);
                let r1 = data.ring_read_sample(base_index + 1, 1);
                r0 + (r1 - r0) * frac
            } else {
                sample_left
            };

            let fade = self.compute_fade_envelope(self.source_frames_elapsed);
            let amplitude = self.clip_gain * fade;
            ctx.pipes.write(
                out_pipe,
                pos,
                (sample_left * amplitude * max).clamp(-max, max - 1.0) as i32,
            );
            if stereo {
                ctx.pipes.write(
                    RIGHT_PIPE,
                    pos,
                    (sample_right * amplitude * max).clamp(-max, max - 1.0) as i32,
                );
            }

            self.playback_pos += self.pitch_step;
            self.source_frames_elapsed += self.pitch_step;

            // Consume whole frames from the ring.
            let whole = self.playback_pos as usize;
            if whole > 0 {
                data.ring_advance_read(whole);
                self.playback_pos -= whole as f64;
            }
        }
    }

    /// Granular path (TONES / TEXTURE): overlap-add grains read through the
    /// ring while the source position advances at the BPM ratio.
    fn buffer_granular(
        &mut self,
        ctx: &mut RenderContext,
        data: &Arc<StreamWaveData>,
        length: usize,
        channels: usize,
        effective_loop_end: i64,
        loop_offset: f64,
    ) {
        let start = self.common.buffer_index;
        let out_pipe = self.common.out_pipe;
        let stereo = channels == 2;
        let max = SAMPLE_MAX as f64;

        // Source advance: tempo-matched when clip BPM metadata exists.
        let source_advance = if self.clip_bpm > 0.0 {
            ctx.bpm / self.clip_bpm
        } else {
            1.0
        };

        for i in 0..length {
            let pos = start + i;

            if self.source_frames_elapsed >= effective_loop_end as f64 || self.reached_end {
                if self.looping && !self.reached_end {
                    let overshoot = self.source_frames_elapsed - effective_loop_end as f64;
                    self.source_frames_elapsed = loop_offset + overshoot;
                    self.warp.set_source_pos(self.source_frames_elapsed);
                    self.loops_completed += 1;
                } else {
                    self.common.start_kill_fade(-1);
                    self.playing = false;
                    for j in i..length {
                        ctx.pipes.write(out_pipe, start + j, 0);
                        if stereo {
                            ctx.pipes.write(RIGHT_PIPE, start + j, 0);
                        }
                    }
                    break;
                }
            }

            self.warp
                .schedule_grain_if_needed(self.warp.source_pos(), self.warp_mode);

            let available = data.ring_available();
            let sample_left = self.warp.read_granular(
                |offset, ch| data.ring_read_sample(offset, ch),
                available,
                0,
                channels,
                self.pitch_step,
            );
            let sample_right = if stereo {
                self.warp.read_granular(
                    |offset, ch| data.ring_read_sample(offset, ch),
                    available,
                    1,
                    channels,
                    self.pitch_step,
                )
            } else {
                sample_left
            };

            let fade = self.compute_fade_envelope(self.source_frames_elapsed);
            let amplitude = self.clip_gain * fade;
            ctx.pipes.write(
                out_pipe,
                pos,
                (sample_left * amplitude * max).clamp(-max, max - 1.0) as i32,
            );
            if stereo {
                ctx.pipes.write(
                    RIGHT_PIPE,
                    pos,
                    (sample_right * amplitude * max).clamp(-max, max - 1.0) as i32,
                );
            }

            self.warp.advance(source_advance);
            self.source_frames_elapsed += source_advance;

            // Consume ring frames behind the slowest active grain; keep two
            // frames of interpolation footroom.
            let desired = self.warp.source_pos() as i64;
            if desired > 0 {
                let mut safe_advance = desired;
                for slot in 0..2 {
                    let grain = self.warp.grain(slot);
                    if grain.active {
                        safe_advance = safe_advance.min(grain.read_pos as i64);
                    }
                }
                let available = data.ring_available() as i64;
                let to_consume = safe_advance.max(0).min(available - 2);
                if to_consume > 0 {
                    data.ring_advance_read(to_consume as usize);
                    self.warp.adjust_positions(to_consume as usize);
                }
            }
        }
    }

    /// Render a silent block, letting a pending kill fade count down.
    fn render_silence_with_fade(&mut self, ctx: &mut RenderContext, length: usize, stereo: bool) {
        let start = self.common.buffer_index;
        for j in 0..length {
            ctx.pipes.write(self.common.out_pipe, start + j, 0);
            if stereo {
                ctx.pipes.write(RIGHT_PIPE, start + j, 0);
            }
        }
        let out_pipe = self.common.out_pipe;
        let completed = if stereo {
            let (left, right) = ctx.pipes.pipe_pair(out_pipe, RIGHT_PIPE);
            self.common
                .apply_kill_fade_stereo(&mut left[start..start + length], &mut right[start..start + length])
        } else {
            let out = ctx.pipes.slice_mut(out_pipe, start, length);
            self.common.apply_kill_fade(out)
        };
        if completed {
            if let Some(data) = &self.stream_data {
                data.deactivate();
            }
            self.reset();
        }
    }

    fn buffer_no_process(&mut self, length: usize) {
        self.common.buffer_index += length;
    }

    // ---- Live parameter setters ----

    pub fn set_stream_gain(&mut self, gain_db: f64) {
        let clamped = (gain_db as i32).clamp(STREAM_GAIN_MIN_DB, STREAM_GAIN_MAX_DB);
        self.gain_db = clamped;
        self.clip_gain = 2f64.powf(clamped as f64 / 6.0);
    }

    pub fn set_stream_pan(&mut self, pan: i32) {
        self.common.set_pan(pan);
    }

    pub fn set_stream_pitch_cents(&mut self, cents: i32, bpm: f64) {
        self.pitch_cents = cents;
        self.recalc_pitch_step(bpm);
    }

    pub fn set_stream_fade_in(&mut self, frames: i64) {
        self.fade_in_frames = frames.max(0);
    }

    pub fn set_stream_fade_out(&mut self, frames: i64) {
        self.fade_out_frames = frames.max(0);
    }

    pub fn set_stream_in_sample(&mut self, sample: i64) {
        self.in_sample = sample.max(0);
        if let Some(data) = self.stream_data.clone() {
            let old_in = data.in_sample();
            data.set_in_sample(self.in_sample);
            // Seek forward when the new start skips past the current
            // position.
            if self.playing
                && self.in_sample > old_in
                && self.source_frames_elapsed < (self.in_sample - old_in) as f64
            {
                data.seek(self.in_sample);
                self.playback_pos = 0.0;
                self.source_frames_elapsed = 0.0;
            }
        }
    }

    pub fn set_stream_out_sample(&mut self, sample: i64) {
        self.out_sample = sample.max(0);
        if let Some(data) = self.stream_data.clone() {
            data.set_out_sample(self.out_sample);
            // Past the new end: wrap to the clip start instead of stopping,
            // so the endpoint can be dragged freely mid-playback.
            if self.playing && self.out_sample > 0 {
                let effective_len = self.out_sample - self.in_sample;
                if effective_len > 0 && self.source_frames_elapsed >= effective_len as f64 {
                    data.seek(self.in_sample);
                    self.playback_pos = 0.0;
                    self.source_frames_elapsed = 0.0;
                }
            }
        }
    }

    pub fn set_stream_warp_mode(&mut self, mode: i32, bpm: f64) {
        self.warp_mode = WarpMode::from_index(mode);
        self.recalc_pitch_step(bpm);
    }

    pub fn set_stream_clip_bpm(&mut self, clip_bpm: f64, bpm: f64) {
        self.clip_bpm = clip_bpm.max(0.0);
        self.recalc_pitch_step(bpm);
    }

    pub fn set_stream_grain_size(&mut self, grain_size: f64) {
        self.warp.set_grain_size(grain_size);
    }

    pub fn set_stream_flux(&mut self, flux: f64) {
        self.warp.set_flux(flux);
    }

    pub fn set_stream_looping(&mut self, looping: bool) {
        self.looping = looping;
        if let Some(data) = &self.stream_data {
            data.set_looping(looping);
        }
    }

    pub fn set_stream_loop_region(&mut self, start_48k: i64, end_48k: i64) {
        self.loop_start_48k = start_48k.max(0);
        self.loop_end_48k = end_48k.max(0);
        if let Some(data) = &self.stream_data {
            data.set_loop_region(self.loop_start_48k, self.loop_end_48k);
        }
    }

    pub fn seek_to(&mut self, position_48k: i64) {
        let Some(data) = self.stream_data.clone() else {
            return;
        };
        data.seek(position_48k);
        self.playback_pos = 0.0;
        let relative = position_48k - self.in_sample;
        self.source_frames_elapsed = relative.max(0) as f64;
    }

    /// BPM changes re-derive the REPITCH rate and synced LFO.
    pub fn update_for_bpm(&mut self, bpm: f64) {
        self.common.update_lfo_for_bpm(bpm);
        if matches!(
            self.warp_mode,
            WarpMode::Repitch | WarpMode::Tones | WarpMode::Texture
        ) && self.clip_bpm > 0.0
        {
            self.recalc_pitch_step(bpm);
        }
    }
}

impl Default for StreamChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ChipPipes;
    use crate::stream::{StreamBank, MASTER_STREAM};
    use cf_core::SampleRate;
    use cf_tables::RefTables;

    const LEN: usize = 256;

    fn write_test_wav(dir: &tempfile::TempDir, frames: usize) -> std::path::PathBuf {
        let path = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            let value = (((i % 100) as i32) - 50) * 300;
            writer.write_sample(value as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn setup(frames: usize) -> (StreamChannel, ChipPipes, StreamBank, tempfile::TempDir) {
        RefTables::initialize(SampleRate::Hz48000);
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, frames);
        let data = StreamWaveData::load_wav(&path, 32768).unwrap();
        let mut channel = StreamChannel::new();
        channel.set_stream_data(data);
        (channel, ChipPipes::new(LEN), StreamBank::new(LEN, 2), dir)
    }

    fn render(ch: &mut StreamChannel, pipes: &mut ChipPipes, bank: &mut StreamBank) {
        ch.common.buffer_index = 0;
        let mut ctx = RenderContext {
            pipes,
            bank,
            slot_targets: &[MASTER_STREAM; 4],
            bpm: 120.0,
            sampler_volume: 1.0,
        };
        ch.buffer(&mut ctx, LEN);
    }

    #[test]
    fn test_stream_plays_after_note_on() {
        let (mut ch, mut pipes, mut bank, _dir) = setup(48000);
        ch.note_on();
        ch.stream_data().unwrap().wait_until_idle();
        ch.stream_data().unwrap().prefill_sync();

        let mut peak = 0.0f64;
        for _ in 0..8 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            for &v in bank.get(MASTER_STREAM).buffer() {
                peak = peak.max(v.abs());
            }
        }
        assert!(peak > 0.01, "stream silent, peak {peak}");
    }

    #[test]
    fn test_repitch_doubles_consumption_at_double_bpm() {
        let (mut ch, mut pipes, mut bank, _dir) = setup(48000);
        ch.set_stream_clip_bpm(120.0, 240.0);
        ch.set_stream_warp_mode(WarpMode::Repitch as i32, 240.0);
        assert!((ch.pitch_step - 2.0).abs() < 1e-12);
        ch.note_on();
        ch.stream_data().unwrap().wait_until_idle();
        ch.stream_data().unwrap().prefill_sync();

        bank.clear_all();
        render(&mut ch, &mut pipes, &mut bank);
        // One block at 2x consumes two blocks of source.
        assert!((ch.source_frames_elapsed - 2.0 * LEN as f64).abs() < 1e-6);
    }

    #[test]
    fn test_one_shot_end_starts_kill_fade() {
        let (mut ch, mut pipes, mut bank, _dir) = setup(1000);
        ch.note_on();
        ch.stream_data().unwrap().wait_until_idle();
        ch.stream_data().unwrap().prefill_sync();

        let mut ended = false;
        for _ in 0..16 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            if !ch.playing {
                ended = true;
                break;
            }
        }
        assert!(ended, "one-shot clip never ended");
    }

    #[test]
    fn test_loop_wraps_and_counts() {
        let (mut ch, mut pipes, mut bank, _dir) = setup(4000);
        ch.set_stream_looping(true);
        ch.set_stream_loop_region(0, 1000);
        ch.note_on();
        ch.stream_data().unwrap().wait_until_idle();
        ch.stream_data().unwrap().prefill_sync();

        for _ in 0..20 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
        }
        // 20 blocks of 256 = 5120 source frames across a 1000-frame loop.
        assert!(ch.loops_completed() >= 4, "loops {}", ch.loops_completed());
        assert!(ch.playing);
    }

    #[test]
    fn test_granular_tones_produces_audio() {
        let (mut ch, mut pipes, mut bank, _dir) = setup(48000);
        ch.set_stream_clip_bpm(120.0, 120.0);
        ch.set_stream_warp_mode(WarpMode::Tones as i32, 120.0);
        ch.set_stream_pitch_cents(1200, 120.0); // one octave up
        ch.note_on();
        ch.stream_data().unwrap().wait_until_idle();
        ch.stream_data().unwrap().prefill_sync();

        let mut peak = 0.0f64;
        for _ in 0..16 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            for &v in bank.get(MASTER_STREAM).buffer() {
                peak = peak.max(v.abs());
            }
        }
        assert!(peak > 0.005, "granular path silent, peak {peak}");
    }

    #[test]
    fn test_gain_db_steps_by_six() {
        let (mut ch, ..) = setup(100);
        ch.set_stream_gain(6.0);
        assert!((ch.clip_gain - 2.0).abs() < 1e-12);
        ch.set_stream_gain(-12.0);
        assert!((ch.clip_gain - 0.25).abs() < 1e-12);
    }
}
