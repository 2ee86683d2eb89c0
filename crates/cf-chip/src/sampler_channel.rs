//! Sampler channel: pitched playback of pre-resampled 48 kHz PCM with a
//! linear-segment ADSR, click-safe voice stealing and LFO modulation.

use std::sync::Arc;

use cf_tables::{RefTables, LFO_TIMER_INITIAL, SAMPLE_MAX};

use crate::channel::{ChannelCommon, OutputMode, RenderContext};
use crate::pipe::RIGHT_PIPE;
use crate::sampler_data::{SamplerDataRef, SamplerTable};

/// Click-guard length after the envelope reaches idle (~10 ms at 48 kHz).
const RELEASE_SAMPLES: i32 = 512;

/// Amp level below which a deferred note-on may fire.
const DEFERRED_FIRE_LEVEL: f64 = 0.1;

/// Convert an AM delta (log-index domain) into a linear gain multiplier:
/// adding `delta` to a log index scales the amplitude by `2^(-delta/512)`.
#[inline]
fn am_gain_from_log_delta(delta: i32) -> f64 {
    2f64.powf(-(delta as f64) / 512.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AmpStage {
    #[default]
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

pub struct SamplerChannel {
    pub common: ChannelCommon,

    sampler_table: Option<Arc<SamplerTable>>,
    sample_data: Option<SamplerDataRef>,

    bank_number: i32,
    wave_number: i32,
    fine_pitch: i32,
    expression: f64,
    sample_start_phase: i32,
    sample_pan: i32,

    note_on_pitch: i32,
    has_note_on_pitch: bool,
    pitch_step: f64,
    sample_index_fp: f64,

    // Amplitude envelope (linear segments in [0, 1]).
    amp_attack_rate: i32,
    amp_decay_rate: i32,
    amp_sustain_level: i32,
    amp_release_rate: i32,
    amp_stage: AmpStage,
    amp_level: f64,
    amp_stage_target_level: f64,
    amp_stage_increment: f64,
    amp_stage_samples_left: i32,
    envelope_level: f64,
    amp_rate_scale: f64,

    // End-of-sample click guard.
    click_guard_active: bool,
    click_guard_samples_left: i32,

    // LFO modulation.
    amplitude_modulation_depth: i32,
    pitch_modulation_depth: i32,
    am_output_level: i32,
    pm_output_level: i32,
    am_gain: f64,

    // Voice-steal deferral.
    has_deferred_note_on: bool,
    /// Raised when the release fell quiet enough; the deferred note fires
    /// once no sample-data lock is held.
    deferred_ready: bool,
    deferred_wave_number: i32,
    deferred_start_phase: i32,
    deferred_pitch_step: f64,
}

impl SamplerChannel {
    pub fn new() -> Self {
        let mut channel = Self {
            common: ChannelCommon::new(),
            sampler_table: None,
            sample_data: None,
            bank_number: 0,
            wave_number: -1,
            fine_pitch: 0,
            expression: 1.0,
            sample_start_phase: 0,
            sample_pan: 0,
            note_on_pitch: 0,
            has_note_on_pitch: false,
            pitch_step: 1.0,
            sample_index_fp: 0.0,
            amp_attack_rate: 63,
            amp_decay_rate: 0,
            amp_sustain_level: 128,
            amp_release_rate: 32,
            amp_stage: AmpStage::Idle,
            amp_level: 0.0,
            amp_stage_target_level: 0.0,
            amp_stage_increment: 0.0,
            amp_stage_samples_left: 0,
            envelope_level: 0.0,
            amp_rate_scale: 1.0,
            click_guard_active: false,
            click_guard_samples_left: 0,
            amplitude_modulation_depth: 0,
            pitch_modulation_depth: 0,
            am_output_level: 0,
            pm_output_level: 0,
            am_gain: 1.0,
            has_deferred_note_on: false,
            deferred_ready: false,
            deferred_wave_number: -1,
            deferred_start_phase: 0,
            deferred_pitch_step: 1.0,
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
        self.bank_number = 0;
        self.wave_number = -1;
        self.expression = 1.0;
        self.sample_start_phase = 0;
        self.sample_pan = 0;
        self.fine_pitch = 0;
        self.note_on_pitch = 0;
        self.has_note_on_pitch = false;
        self.pitch_step = 1.0;
        self.sample_index_fp = 0.0;
        // Sample data survives resets so the voice-steal declick can keep
        // playing the tail of the previous note.
        self.stop_click_guard();
        self.reset_amp_envelope();
        self.has_deferred_note_on = false;
        self.deferred_ready = false;
        self.deferred_wave_number = -1;
        self.deferred_start_phase = 0;
        self.deferred_pitch_step = 1.0;
    }

    // ---- Wave data ----

    pub fn set_sampler_table(&mut self, table: Arc<SamplerTable>) {
        self.sampler_table = Some(table);
    }

    pub fn set_types(&mut self, bank: i32) {
        self.bank_number = bank & 3;
    }

    // ---- Pitch ----

    pub fn pitch(&self) -> i32 {
        (self.wave_number << 6) + self.fine_pitch
    }

    pub fn set_pitch(&mut self, value: i32) {
        self.wave_number = value >> 6;
        self.fine_pitch = value & 0x3f;

        let (fixed_pitch, user_offset) = self.sample_pitch_info();

        let delta_semitones = if fixed_pitch && self.has_note_on_pitch {
            // Fixed-pitch samples ignore base transposition but keep
            // envelope-driven pitch deltas.
            (value - self.note_on_pitch) as f64 / 64.0
        } else {
            (self.wave_number - 60) as f64 + self.fine_pitch as f64 / 64.0
        };

        self.pitch_step = 2f64.powf((delta_semitones + user_offset) / 12.0);
    }

    fn sample_pitch_info(&self) -> (bool, f64) {
        match &self.sample_data {
            Some(data) => {
                let data = data.lock();
                let offset = data.root_offset() as f64
                    + data.coarse_offset() as f64
                    + data.fine_offset() as f64 / 100.0;
                (data.is_fixed_pitch(), offset)
            }
            None => (false, 0.0),
        }
    }

    fn recalc_pitch_step(&mut self) {
        if self.sample_data.is_none() {
            return;
        }
        let (fixed_pitch, user_offset) = self.sample_pitch_info();
        let note_transposition = if fixed_pitch {
            0.0
        } else {
            (self.wave_number - 60) as f64
        };
        self.pitch_step = 2f64.powf((note_transposition + user_offset) / 12.0);
    }

    pub fn set_phase(&mut self, value: i32) {
        self.sample_start_phase = value;
    }

    // ---- Volume ----

    pub fn offset_volume(&mut self, expression: i32, velocity: i32) {
        self.expression = expression as f64 * velocity as f64 * 0.00006103515625; // 1/16384
    }

    // ---- LFO ----

    pub fn set_frequency_ratio(&mut self, ratio: i32) {
        self.common.frequency_ratio = ratio;
        let coef = if ratio != 0 { 100.0 / ratio as f64 } else { 1.0 };
        self.common.lfo_timer_initial = (LFO_TIMER_INITIAL as f64 * coef) as i32;
        self.amp_rate_scale = coef;
        self.refresh_active_amp_stage();
    }

    pub fn initialize_lfo(&mut self, waveform: i32) {
        self.common.initialize_lfo(waveform, None);
        self.set_lfo_state(false);
        self.amplitude_modulation_depth = 0;
        self.pitch_modulation_depth = 0;
        self.am_output_level = 0;
        self.pm_output_level = 0;
        self.am_gain = 1.0;
    }

    pub fn set_amplitude_modulation(&mut self, depth: i32) {
        self.amplitude_modulation_depth = depth << 2;
        self.am_output_level = ((self.common.lfo_wave_table[self.common.lfo_phase]
            * self.amplitude_modulation_depth)
            >> 7)
            << 3;
        self.set_lfo_state(self.pitch_modulation_depth != 0 || self.amplitude_modulation_depth != 0);
        self.am_gain = am_gain_from_log_delta(self.am_output_level);
    }

    pub fn set_pitch_modulation(&mut self, depth: i32) {
        self.pitch_modulation_depth = depth;
        self.pm_output_level = (((self.common.lfo_wave_table[self.common.lfo_phase] << 1) - 255)
            * self.pitch_modulation_depth)
            >> 8;
        self.set_lfo_state(self.pitch_modulation_depth != 0 || self.amplitude_modulation_depth != 0);
    }

    fn set_lfo_state(&mut self, enabled: bool) {
        self.common.lfo_on = enabled;
        self.common.lfo_timer_step = if enabled {
            self.common.lfo_timer_step_buffer
        } else {
            0
        };
    }

    fn update_lfo(&mut self) {
        if !self.common.lfo_on {
            return;
        }
        self.common.lfo_timer -= self.common.lfo_timer_step;
        if self.common.lfo_timer >= 0 {
            return;
        }
        self.common.lfo_phase = (self.common.lfo_phase + 1) & 255;
        let value_base = self.common.lfo_wave_table[self.common.lfo_phase];
        self.am_output_level = ((value_base * self.amplitude_modulation_depth) >> 7) << 3;
        self.pm_output_level =
            (((value_base << 1) - 255) * self.pitch_modulation_depth) >> 8;
        self.common.lfo_timer += self.common.lfo_timer_initial;
        self.am_gain = am_gain_from_log_delta(self.am_output_level);
    }

    // ---- Amp envelope rates ----

    pub fn set_amp_attack_rate(&mut self, value: i32) {
        let clamped = value.clamp(0, 63);
        if self.amp_attack_rate == clamped {
            return;
        }
        self.amp_attack_rate = clamped;
        if self.amp_stage == AmpStage::Attack {
            self.configure_amp_stage(1.0, self.amp_attack_rate);
        }
    }

    pub fn set_amp_decay_rate(&mut self, value: i32) {
        let clamped = value.clamp(0, 63);
        if self.amp_decay_rate == clamped {
            return;
        }
        self.amp_decay_rate = clamped;
        if self.amp_stage == AmpStage::Decay {
            let sustain = self.amp_sustain_level as f64 * 0.0078125;
            self.configure_amp_stage(sustain, self.amp_decay_rate);
        }
    }

    pub fn set_amp_sustain_level(&mut self, value: i32) {
        let clamped = value.clamp(0, 128);
        if self.amp_sustain_level == clamped {
            return;
        }
        self.amp_sustain_level = clamped;
        let sustain = self.amp_sustain_level as f64 * 0.0078125;
        match self.amp_stage {
            AmpStage::Decay => self.configure_amp_stage(sustain, self.amp_decay_rate),
            AmpStage::Sustain => {
                self.amp_level = sustain;
                self.envelope_level = self.amp_level;
            }
            _ => {}
        }
    }

    pub fn set_amp_release_rate(&mut self, value: i32) {
        let clamped = value.clamp(0, 63);
        if self.amp_release_rate == clamped {
            return;
        }
        self.amp_release_rate = clamped;
        if self.amp_stage == AmpStage::Release {
            self.configure_amp_stage(0.0, self.amp_release_rate);
        }
    }

    pub fn amp_envelope(&self) -> (i32, i32, i32, i32) {
        (
            self.amp_attack_rate,
            self.amp_decay_rate,
            self.amp_sustain_level,
            self.amp_release_rate,
        )
    }

    // ---- Amp envelope machinery ----

    fn reset_amp_envelope(&mut self) {
        self.amp_stage = AmpStage::Idle;
        self.amp_level = 0.0;
        self.amp_stage_target_level = 0.0;
        self.amp_stage_increment = 0.0;
        self.amp_stage_samples_left = 0;
        self.envelope_level = 0.0;
        self.common.is_idling = true;
    }

    fn start_amp_envelope(&mut self) {
        self.stop_click_guard();
        self.common.is_idling = false;
        self.set_amp_stage(AmpStage::Attack);
    }

    fn begin_amp_release(&mut self) {
        if self.amp_stage == AmpStage::Idle || self.amp_stage == AmpStage::Release {
            return;
        }
        self.set_amp_stage(AmpStage::Release);
    }

    fn advance_amp_stage(&mut self) {
        match self.amp_stage {
            AmpStage::Attack => {
                // Skip decay when sustain is full scale and decay is instant.
                let needs_decay = self.amp_sustain_level < 128 || self.amp_decay_rate > 0;
                if needs_decay {
                    self.set_amp_stage(AmpStage::Decay);
                } else {
                    self.set_amp_stage(AmpStage::Sustain);
                }
            }
            AmpStage::Decay => self.set_amp_stage(AmpStage::Sustain),
            AmpStage::Release => {
                self.set_amp_stage(AmpStage::Idle);
                self.begin_click_guard();
            }
            _ => {}
        }
    }

    fn set_amp_stage(&mut self, stage: AmpStage) {
        self.amp_stage = stage;
        match stage {
            AmpStage::Attack => {
                self.common.is_idling = false;
                self.amp_level = self.amp_level.clamp(0.0, 1.0);
                self.configure_amp_stage(1.0, self.amp_attack_rate);
            }
            AmpStage::Decay => {
                self.common.is_idling = false;
                let sustain = self.amp_sustain_level as f64 * 0.0078125;
                self.configure_amp_stage(sustain, self.amp_decay_rate);
            }
            AmpStage::Sustain => {
                self.common.is_idling = false;
                self.amp_stage_samples_left = 0;
                self.amp_stage_increment = 0.0;
                self.amp_level = self.amp_sustain_level as f64 * 0.0078125;
                self.envelope_level = self.amp_level;
            }
            AmpStage::Release => {
                self.common.is_idling = false;
                self.configure_amp_stage(0.0, self.amp_release_rate);
            }
            AmpStage::Idle => {
                self.amp_stage_samples_left = 0;
                self.amp_stage_increment = 0.0;
                self.amp_level = 0.0;
                self.envelope_level = 0.0;
                self.common.is_idling = true;
            }
        }
    }

    /// Derive the linear increment toward `target_level` from the reference
    /// rate table scaled by the envelope frequency ratio.
    fn configure_amp_stage(&mut self, target_level: f64, rate: i32) {
        self.amp_stage_target_level = target_level.clamp(0.0, 1.0);
        let delta = self.amp_stage_target_level - self.amp_level;
        let delta_abs = delta.abs();
        if rate < 0 || delta_abs < 1e-9 {
            self.finish_amp_stage_immediately();
            return;
        }

        let samples_per_unit = self.compute_amp_samples_per_unit(rate);
        if samples_per_unit <= 0 {
            self.finish_amp_stage_immediately();
            return;
        }

        let units = (delta_abs * 128.0).ceil().max(1.0);
        self.amp_stage_samples_left =
            ((samples_per_unit as f64 * units).ceil() as i32).max(1);
        self.amp_stage_increment = delta / self.amp_stage_samples_left as f64;
    }

    fn finish_amp_stage_immediately(&mut self) {
        self.amp_level = self.amp_stage_target_level;
        self.amp_stage_samples_left = 0;
        self.amp_stage_increment = 0.0;
        if matches!(
            self.amp_stage,
            AmpStage::Attack | AmpStage::Decay | AmpStage::Release
        ) {
            self.advance_amp_stage();
        } else {
            self.envelope_level = self.amp_level;
        }
    }

    fn refresh_active_amp_stage(&mut self) {
        match self.amp_stage {
            AmpStage::Attack => self.configure_amp_stage(1.0, self.amp_attack_rate),
            AmpStage::Decay => {
                let sustain = self.amp_sustain_level as f64 * 0.0078125;
                self.configure_amp_stage(sustain, self.amp_decay_rate);
            }
            AmpStage::Release => self.configure_amp_stage(0.0, self.amp_release_rate),
            _ => {}
        }
    }

    fn compute_amp_samples_per_unit(&self, rate: i32) -> i32 {
        let tables = RefTables::get();
        let mut base = tables.filter_eg_rate[rate.clamp(0, 63) as usize];
        if base <= 0 {
            let slowest = tables.filter_eg_rate[1].max(1);
            base = slowest << 4;
        }
        let scaled = base as f64 * self.amp_rate_scale;
        if scaled <= 0.0 {
            return 0;
        }
        (scaled as i32).max(1)
    }

    fn update_amp_envelope(&mut self) -> bool {
        match self.amp_stage {
            AmpStage::Attack | AmpStage::Decay | AmpStage::Release => {
                if self.amp_stage_samples_left > 0 {
                    self.amp_level += self.amp_stage_increment;
                    self.amp_stage_samples_left -= 1;

                    // A pending deferred note-on fires as soon as the fast
                    // release is quiet enough; checked before the stage
                    // advance so it cannot slip through to IDLE unnoticed.
                    // The actual restart is signalled to the caller, which
                    // runs it once no sample-data lock is held.
                    if self.has_deferred_note_on
                        && self.amp_stage == AmpStage::Release
                        && self.amp_level < DEFERRED_FIRE_LEVEL
                    {
                        self.deferred_ready = true;
                        return true;
                    }

                    if self.amp_stage_samples_left <= 0 {
                        self.amp_level = self.amp_stage_target_level;
                        self.advance_amp_stage();
                    }
                } else {
                    self.amp_level = self.amp_stage_target_level;
                    self.advance_amp_stage();
                }
            }
            AmpStage::Sustain => {
                self.amp_level = self.amp_sustain_level as f64 * 0.0078125;
            }
            AmpStage::Idle => {
                self.amp_level = 0.0;
                // Safety net: a deferred note-on stuck in IDLE would mean
                // permanent silence; flag it for execution now.
                if self.has_deferred_note_on {
                    self.deferred_ready = true;
                    return true;
                }
            }
        }

        self.envelope_level = self.amp_level.clamp(0.0, 1.0);
        if self.click_guard_active {
            if self.click_guard_samples_left > 0 {
                self.click_guard_samples_left -= 1;
                self.envelope_level *=
                    self.click_guard_samples_left as f64 / RELEASE_SAMPLES as f64;
            } else {
                self.stop_click_guard();
                self.envelope_level = 0.0;
            }
        }
        false
    }

    /// Execute the deferred restart. Must not be called while a sample-data
    /// lock is held (it re-locks to read the new slice).
    fn fire_deferred_note_on(&mut self) {
        self.wave_number = self.deferred_wave_number;
        self.sample_start_phase = self.deferred_start_phase;
        self.pitch_step = self.deferred_pitch_step;
        self.has_deferred_note_on = false;
        self.deferred_ready = false;
        self.execute_note_on_immediate();
    }

    fn begin_click_guard(&mut self) {
        self.click_guard_active = true;
        self.click_guard_samples_left = RELEASE_SAMPLES;
    }

    fn stop_click_guard(&mut self) {
        self.click_guard_active = false;
        self.click_guard_samples_left = 0;
    }

    // ---- Note events ----

    pub fn note_on(&mut self) {
        if self.wave_number < 0 {
            return;
        }

        // Voice-steal declick: defer the note while audible audio is playing.
        let envelope_audible =
            self.amp_stage != AmpStage::Idle && self.amp_level > DEFERRED_FIRE_LEVEL;
        if envelope_audible && self.sample_data.is_some() {
            self.has_deferred_note_on = true;
            self.deferred_wave_number = self.wave_number;
            self.deferred_start_phase = self.sample_start_phase;
            self.deferred_pitch_step = self.pitch_step;

            if self.amp_stage != AmpStage::Release {
                self.begin_amp_release();
            }
            // Rate 63 = fastest fade-out of the old note.
            self.configure_amp_stage(0.0, 63);
            return;
        }

        self.execute_note_on_immediate();
    }

    fn execute_note_on_immediate(&mut self) {
        self.stop_click_guard();
        self.reset_amp_envelope();

        if let Some(table) = &self.sampler_table {
            self.sample_data = table.sample((self.wave_number & 127) as usize);
        }

        let mut has_sample = false;
        if let Some(data) = &self.sample_data {
            if self.sample_start_phase != 255 {
                let data = data.lock();
                let index =
                    data.initial_sample_index(self.sample_start_phase as f64 * 0.00390625);
                self.sample_index_fp = index as f64;
                self.sample_pan = data.pan();
                has_sample = true;
            }
        }
        if has_sample {
            self.note_on_pitch = self.pitch();
            self.has_note_on_pitch = true;
            self.recalc_pitch_step();
        }

        self.common.is_idling = !has_sample;
        self.common.is_note_on = has_sample;

        if has_sample {
            self.common.note_on();
            self.start_amp_envelope();
        }
    }

    pub fn note_off(&mut self) {
        let ignore = self
            .sample_data
            .as_ref()
            .is_none_or(|data| data.lock().ignore_note_off());
        if ignore {
            return;
        }
        self.common.is_note_on = false;
        self.begin_amp_release();
        self.common.note_off();
    }

    // ---- Block generation ----

    pub fn buffer(&mut self, ctx: &mut RenderContext, length: usize) {
        let Some(data_ref) = self.sample_data.clone() else {
            self.buffer_no_process(length);
            return;
        };
        if self.common.is_idling {
            self.buffer_no_process(length);
            return;
        }

        let data = data_ref.lock();
        if data.length() <= 0 {
            drop(data);
            self.buffer_no_process(length);
            return;
        }

        let wave_data = data.wave_data();
        let channels = data.channel_count();
        let end_point = data.end_point();
        let loop_point = data.loop_point();
        let sample_gain = data.gain_linear();
        let data_pan = data.pan();

        let start = self.common.buffer_index;
        let out_pipe = self.common.out_pipe;
        let stereo = channels == 2;

        for i in 0..length {
            let pos = start + i;

            // End/loop handling, preserving overshoot on wrap.
            if self.sample_index_fp >= end_point as f64 {
                if loop_point >= 0 {
                    self.sample_index_fp =
                        loop_point as f64 + (self.sample_index_fp - end_point as f64);
                } else {
                    self.begin_click_guard();
                    self.common.is_idling = true;
                    for j in i..length {
                        ctx.pipes.write(out_pipe, start + j, 0);
                        if stereo {
                            ctx.pipes.write(RIGHT_PIPE, start + j, 0);
                        }
                    }
                    break;
                }
            }

            self.update_lfo();
            if self.update_amp_envelope() {
                // Deferred note-on became ready; the rest of the block is
                // silence (the level is below the audible threshold here)
                // and the restart runs after the data lock is released.
                for j in i..length {
                    ctx.pipes.write(out_pipe, start + j, 0);
                    if stereo {
                        ctx.pipes.write(RIGHT_PIPE, start + j, 0);
                    }
                }
                break;
            }
            if self.amp_stage == AmpStage::Idle && !self.click_guard_active {
                for j in i..length {
                    ctx.pipes.write(out_pipe, start + j, 0);
                    if stereo {
                        ctx.pipes.write(RIGHT_PIPE, start + j, 0);
                    }
                }
                break;
            }

            // Linear interpolation.
            let base_index = self.sample_index_fp as usize;
            let frac = self.sample_index_fp - base_index as f64;
            let next_index = if (base_index + 1) < end_point as usize {
                base_index + 1
            } else {
                base_index
            };

            let s_l0 = wave_data[base_index * channels];
            let s_l1 = wave_data[next_index * channels];
            let sample_left = s_l0 + (s_l1 - s_l0) * frac;
            let sample_right = if stereo {
                let s_r0 = wave_data[base_index * channels + 1];
                let s_r1 = wave_data[next_index * channels + 1];
                s_r0 + (s_r1 - s_r0) * frac
            } else {
                sample_left
            };

            let env = self.envelope_level * self.am_gain * sample_gain;
            let out_left = sample_left * env;
            let out_right = sample_right * env;

            let max = SAMPLE_MAX as f64;
            ctx.pipes.write(
                out_pipe,
                pos,
                (out_left * max).clamp(-max, max - 1.0) as i32,
            );
            if stereo {
                ctx.pipes.write(
                    RIGHT_PIPE,
                    pos,
                    (out_right * max).clamp(-max, max - 1.0) as i32,
                );
            }

            // Advance with pitch modulation (vibrato).
            let pm_semitones = self.pm_output_level as f64 / 64.0;
            let step = self.pitch_step * 2f64.powf(pm_semitones / 12.0);
            self.sample_index_fp += step;
        }

        drop(data);

        if self.deferred_ready {
            self.fire_deferred_note_on();
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
                self.reset();
            }
        }

        // Mix into streams.
        if !self.common.mute && self.common.output_mode == OutputMode::Standard {
            let volume_coef =
                self.expression * ctx.sampler_volume * self.common.instrument_gain;
            let pan = (self.common.pan + data_pan).clamp(0, 128);
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

    fn buffer_no_process(&mut self, length: usize) {
        // A pending deferred note-on still needs its envelope driven, or it
        // would never fall low enough to fire.
        if self.has_deferred_note_on {
            for _ in 0..length {
                if self.update_amp_envelope() {
                    self.fire_deferred_note_on();
                    break;
                }
            }
        }
        self.common.buffer_index += length;
    }

    // ---- Live sample-data setters (mailbox targets) ----

    fn with_sample_data(&mut self, f: impl FnOnce(&mut crate::sampler_data::SamplerData)) {
        if let Some(data) = &self.sample_data {
            f(&mut data.lock());
        }
    }

    pub fn set_sampler_start_point(&mut self, start: i32) {
        self.with_sample_data(|data| data.set_start_point(start));
    }

    pub fn set_sampler_end_point(&mut self, end: i32) {
        self.with_sample_data(|data| data.set_end_point(end));
    }

    pub fn set_sampler_loop_point(&mut self, loop_point: i32) {
        self.with_sample_data(|data| data.set_loop_point(loop_point));
    }

    pub fn set_sampler_ignore_note_off(&mut self, ignore: bool) {
        self.with_sample_data(|data| data.set_ignore_note_off(ignore));
    }

    pub fn set_sampler_pan(&mut self, pan: i32) {
        self.with_sample_data(|data| data.set_pan(pan));
        if self.sample_data.is_some() {
            self.sample_pan = pan;
        }
    }

    pub fn set_sampler_gain_db(&mut self, db: i32) {
        self.with_sample_data(|data| data.set_gain_db(db));
    }

    pub fn set_sampler_root_offset(&mut self, semitones: i32) {
        self.with_sample_data(|data| data.set_root_offset(semitones));
        self.recalc_pitch_step();
    }

    pub fn set_sampler_coarse_offset(&mut self, semitones: i32) {
        self.with_sample_data(|data| data.set_coarse_offset(semitones));
        self.recalc_pitch_step();
    }

    pub fn set_sampler_fine_offset(&mut self, cents: i32) {
        self.with_sample_data(|data| data.set_fine_offset(cents));
        self.recalc_pitch_step();
    }
}

impl Default for SamplerChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ChipPipes;
    use crate::sampler_data::SamplerData;
    use crate::stream::{StreamBank, MASTER_STREAM};
    use cf_core::SampleRate;

    const LEN: usize = 256;

    fn setup() -> (SamplerChannel, ChipPipes, StreamBank) {
        RefTables::initialize(SampleRate::Hz48000);
        let mut channel = SamplerChannel::new();
        let mut table = SamplerTable::new();
        // A loud constant-ish sample so output is trivially audible.
        let samples: Vec<f64> = (0..9600).map(|i| ((i % 96) as f64 - 48.0) / 48.0).collect();
        table.set_sample(60, SamplerData::new(samples, 1, 48000));
        channel.set_sampler_table(Arc::new(table));
        (channel, ChipPipes::new(LEN), StreamBank::new(LEN, 2))
    }

    fn render(ch: &mut SamplerChannel, pipes: &mut ChipPipes, bank: &mut StreamBank) {
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

    fn master_peak(bank: &StreamBank) -> f64 {
        bank.get(MASTER_STREAM)
            .buffer()
            .iter()
            .fold(0.0f64, |acc, &v| acc.max(v.abs()))
    }

    #[test]
    fn test_sampler_plays_assigned_note() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_pitch(60 << 6);
        ch.note_on();
        assert!(!ch.common.is_idling);
        let mut peak = 0.0f64;
        for _ in 0..16 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            peak = peak.max(master_peak(&bank));
        }
        assert!(peak > 0.05, "sampler silent, peak {peak}");
    }

    #[test]
    fn test_note_without_sample_idles() {
        let (mut ch, ..) = setup();
        ch.set_pitch(61 << 6); // no sample at note 61
        ch.note_on();
        assert!(ch.common.is_idling);
    }

    #[test]
    fn test_one_shot_end_starts_click_guard() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_pitch(60 << 6);
        // Play fast so the one-shot end arrives quickly.
        ch.note_on();
        ch.pitch_step = 64.0;
        let mut guard_seen = false;
        for _ in 0..64 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            if ch.click_guard_active || ch.common.is_idling {
                guard_seen = true;
                break;
            }
        }
        assert!(guard_seen, "one-shot end never reached");
    }

    #[test]
    fn test_voice_steal_defers_note_on() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_pitch(60 << 6);
        ch.note_on();
        // Let the attack open up.
        for _ in 0..16 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
        }
        assert!(ch.amp_level > DEFERRED_FIRE_LEVEL);

        ch.set_pitch(60 << 6);
        ch.note_on();
        assert!(ch.has_deferred_note_on, "steal must defer");
        assert_eq!(ch.amp_stage, AmpStage::Release);

        // The deferred note must eventually fire and restart the attack.
        let mut fired = false;
        for _ in 0..256 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            if !ch.has_deferred_note_on {
                fired = true;
                break;
            }
        }
        assert!(fired, "deferred note-on never fired");
        assert!(matches!(
            ch.amp_stage,
            AmpStage::Attack | AmpStage::Decay | AmpStage::Sustain
        ));
    }

    #[test]
    fn test_note_off_releases() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_pitch(60 << 6);
        ch.note_on();
        for _ in 0..8 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
        }
        ch.note_off();
        assert_eq!(ch.amp_stage, AmpStage::Release);
        let mut idle = false;
        for _ in 0..4096 {
            bank.clear_all();
            render(&mut ch, &mut pipes, &mut bank);
            if ch.common.is_idling && !ch.click_guard_active {
                idle = true;
                break;
            }
        }
        assert!(idle, "release never reached idle");
    }

    #[test]
    fn test_pitch_step_octave() {
        let (mut ch, ..) = setup();
        ch.set_pitch(60 << 6);
        let unity = ch.pitch_step;
        ch.set_pitch(72 << 6);
        assert!((ch.pitch_step / unity - 2.0).abs() < 1e-9);
    }
}
