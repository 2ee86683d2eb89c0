//! The driver: owns the sound chip, stream bank, effector, mailbox and
//! metering, and runs the per-block pipeline behind the host's pull
//! callback.
//!
//! All parameter and note mutation flows through the mailbox; the typed
//! methods here are thin wrappers that push messages. Configuration that
//! installs shared data (sampler banks, stream clips, voices, effect
//! streams) is control-plane and happens between blocks.

use std::collections::HashMap;
use std::sync::Arc;

use cf_chip::{
    Channel, ChannelParams, ModuleType, SoundChip, StreamBank, LfoTimeMode, MASTER_STREAM,
};
use cf_core::{BufferSize, CfError, CfResult, ChannelConfig, SampleRate};
use cf_effects::Effector;
use cf_stream::StreamWaveData;
use cf_tables::RefTables;

use crate::mailbox::{FmOpParam, FxOp, KeyOn, Mailbox, TrackUpdate};
use crate::metering::Metering;

/// Track slots available for allocation.
pub const MAX_TRACKS: usize = 32;

/// Behavior when a note-on arrives for a track that is already sounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionMode {
    /// Retrigger on the same channel (voice steal handles the declick).
    #[default]
    Ignore,
    /// Drop the new note while the old one still sounds.
    Reject,
    /// Key the old note off, then retrigger.
    Overwrite,
    /// No quantize grid in the core; treated as retrigger.
    Shift,
}

/// One voice slot: a stable track id bound to a chip channel.
struct Track {
    track_id: i32,
    voice_scope_id: i64,
    channel: Option<usize>,
    module: ModuleType,
    note: i32,
    pitch_bend: i32,
    remaining_frames: Option<u64>,
    velocity: i32,
    expression: i32,
    active: bool,
}

impl Track {
    fn empty() -> Self {
        Self {
            track_id: -1,
            voice_scope_id: -1,
            channel: None,
            module: ModuleType::Fm,
            note: 60,
            pitch_bend: 0,
            remaining_frames: None,
            velocity: 256,
            expression: 128,
            active: false,
        }
    }
}

/// Per-track cached filter state for merging partial mailbox updates.
#[derive(Clone, Copy)]
struct FilterState {
    initialized: bool,
    filter_type: i32,
    cutoff: i32,
    resonance: i32,
    attack_rate: i32,
    decay_rate1: i32,
    decay_rate2: i32,
    release_rate: i32,
    decay_cutoff1: i32,
    decay_cutoff2: i32,
    sustain_cutoff: i32,
    release_cutoff: i32,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            initialized: false,
            filter_type: 0,
            cutoff: 128,
            resonance: 0,
            attack_rate: 0,
            decay_rate1: 0,
            decay_rate2: 0,
            release_rate: 0,
            decay_cutoff1: 128,
            decay_cutoff2: 64,
            sustain_cutoff: 32,
            release_cutoff: 128,
        }
    }
}

pub struct Driver {
    buffer_length: BufferSize,
    channel_config: ChannelConfig,
    sample_rate: SampleRate,

    chip: SoundChip,
    bank: StreamBank,
    effector: Effector,
    mailbox: Arc<Mailbox>,
    metering: Arc<Metering>,

    tracks: Vec<Track>,
    channel_bound: Vec<bool>,
    /// track id -> local effect stream index in the effector.
    track_effect_streams: HashMap<i32, usize>,
    filter_state_cache: HashMap<i32, FilterState>,

    note_on_exception_mode: ExceptionMode,
    master_volume: f64,
    bpm: f64,
    meter_downsample_counter: u32,

    // Residual buffer bridging internal blocks and host request sizes.
    residual: Vec<f64>,
    residual_frames: usize,
    residual_offset: usize,
}

impl Driver {
    pub fn new(buffer_length: u32, channel_count: u32, sample_rate: u32) -> CfResult<Self> {
        let buffer_length = BufferSize::new(buffer_length)?;
        let channel_config = ChannelConfig::from_count(channel_count)?;
        let sample_rate = SampleRate::from_u32(sample_rate)?;
        RefTables::initialize(sample_rate);

        let block = buffer_length.as_usize();
        Ok(Self {
            buffer_length,
            channel_config,
            sample_rate,
            chip: SoundChip::new(buffer_length),
            bank: StreamBank::new(block, channel_config.count()),
            effector: Effector::new(sample_rate.as_f64()),
            mailbox: Arc::new(Mailbox::new()),
            metering: Arc::new(Metering::new()),
            tracks: (0..MAX_TRACKS).map(|_| Track::empty()).collect(),
            channel_bound: Vec::new(),
            track_effect_streams: HashMap::new(),
            filter_state_cache: HashMap::new(),
            note_on_exception_mode: ExceptionMode::Ignore,
            master_volume: 1.0,
            bpm: 120.0,
            meter_downsample_counter: 0,
            residual: vec![0.0; block * 2],
            residual_frames: 0,
            residual_offset: 0,
        })
        .map(|mut driver| {
            driver.channel_bound = vec![false; driver.chip.channel_count()];
            driver.chip.set_bpm(driver.bpm);
            driver
        })
    }

    // ---- Accessors ----

    #[inline]
    pub fn buffer_length(&self) -> usize {
        self.buffer_length.as_usize()
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_config.count()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.as_u32()
    }

    /// Clonable control-thread handle for all parameter/note pushes.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Clonable metering read handle.
    pub fn metering(&self) -> Arc<Metering> {
        Arc::clone(&self.metering)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm.clamp(1.0, 999.0);
        self.chip.set_bpm(self.bpm);
    }

    pub fn master_volume(&self) -> f64 {
        self.master_volume
    }

    pub fn set_master_volume(&mut self, volume: f64) {
        self.master_volume = volume.clamp(0.0, 2.0);
    }

    pub fn note_on_exception_mode(&self) -> ExceptionMode {
        self.note_on_exception_mode
    }

    pub fn set_note_on_exception_mode(&mut self, mode: ExceptionMode) {
        self.note_on_exception_mode = mode;
    }

    pub fn chip(&self) -> &SoundChip {
        &self.chip
    }

    pub fn effector_mut(&mut self) -> &mut Effector {
        &mut self.effector
    }

    // ---- Control-plane configuration ----

    pub fn set_sampler_table(&mut self, bank: usize, table: cf_chip::SamplerTable) {
        self.chip.set_sampler_table(bank, table);
    }

    /// Allocate (or find) the track and bind a channel of the given kind
    /// without triggering a note.
    pub fn ensure_track(&mut self, track_id: i32, module: ModuleType) -> CfResult<()> {
        if self.find_track(track_id).is_some() {
            return Ok(());
        }
        self.allocate_track(track_id, module)
            .map(|_| ())
            .ok_or_else(|| CfError::Config(format!("no free channel for track {track_id}")))
    }

    /// Stamp a voice scope id onto a track (mailbox voice filtering).
    pub fn set_track_voice_scope(&mut self, track_id: i32, voice_scope_id: i64) {
        if let Some(index) = self.find_track(track_id) {
            self.tracks[index].voice_scope_id = voice_scope_id;
        }
    }

    /// Apply a full voice parameter block to the track's channel.
    pub fn set_track_voice(&mut self, track_id: i32, params: &ChannelParams) -> CfResult<()> {
        self.ensure_track(track_id, ModuleType::Fm)?;
        let bpm = self.bpm;
        if let Some(channel) = self.track_channel_mut(track_id) {
            match channel {
                Channel::Fm(ch) => ch.set_channel_params(params, true, true, bpm),
                Channel::Sampler(ch) => ch.set_channel_params(params, true, true, bpm),
                Channel::Stream(_) => {}
            }
        }
        Ok(())
    }

    /// Bind a streaming clip to a track's stream channel.
    pub fn set_track_stream_data(
        &mut self,
        track_id: i32,
        data: Arc<StreamWaveData>,
    ) -> CfResult<()> {
        self.ensure_track(track_id, ModuleType::Stream)?;
        if let Some(Channel::Stream(ch)) = self.track_channel_mut(track_id) {
            ch.set_stream_data(data);
            Ok(())
        } else {
            Err(CfError::Config(format!(
                "track {track_id} is not a stream track"
            )))
        }
    }

    /// Bind an effect chain to a global send slot (1..=3); channel sends to
    /// that slot then feed the chain instead of the master directly.
    pub fn create_global_effect(&mut self, slot: usize) -> bool {
        self.effector
            .create_global_effect(slot, &mut self.bank, &mut self.chip)
            .is_some()
    }

    /// Set a track channel's send level (slot 0 = main, 1..=3 = effect
    /// sends), linear 0..=2.
    pub fn set_track_stream_send(&mut self, track_id: i32, slot: usize, level: f64) {
        if let Some(channel) = self.track_channel_mut(track_id) {
            channel
                .common_mut()
                .set_stream_send(slot, level.clamp(0.0, 2.0));
        }
    }

    /// Create (or fetch) the per-track insert effect chain and re-route the
    /// track's main send through it.
    pub fn ensure_track_effect_stream(&mut self, track_id: i32) -> usize {
        if let Some(&index) = self.track_effect_streams.get(&track_id) {
            return index;
        }
        let index = self.effector.create_local_effect(1, &mut self.bank);
        self.track_effect_streams.insert(track_id, index);
        self.bind_track_effect_stream(track_id);
        index
    }

    fn bind_track_effect_stream(&mut self, track_id: i32) {
        let Some(&index) = self.track_effect_streams.get(&track_id) else {
            return;
        };
        let Some(stream_id) = self.effector.local_stream_id(index) else {
            return;
        };
        let Some(track_index) = self.find_track(track_id) else {
            return;
        };
        let Some(channel_index) = self.tracks[track_index].channel else {
            return;
        };

        let channel = self.chip.channel_mut(channel_index);
        let send0 = channel.common().stream_send(0);
        let pan = channel.common().pan;
        channel.common_mut().set_stream_buffer(0, Some(stream_id));

        if let Some(stream) = self.effector.local(index) {
            // The insert chain takes over fader and pan duty from the
            // channel's main send.
            stream.set_post_fader_gain(send0);
            stream.set_post_pan(pan);
        }
    }

    /// Keep insert-chain faders mirroring their channels' send-0 levels.
    fn update_track_effect_post_fader(&mut self) {
        for (&track_id, &index) in &self.track_effect_streams {
            let Some(track_index) = self
                .tracks
                .iter()
                .position(|t| t.active && t.track_id == track_id)
            else {
                continue;
            };
            let Some(channel_index) = self.tracks[track_index].channel else {
                continue;
            };
            let send0 = self.chip.channel(channel_index).common().stream_send(0);
            let pan = self.chip.channel(channel_index).common().pan;
            if let Some(stream) = self.effector.local(index) {
                stream.set_post_fader_gain(send0);
                stream.set_post_pan(pan);
            }
        }
    }

    // ---- Note sugar (push through the mailbox) ----

    pub fn note_on(&self, track_id: i32, module: ModuleType, note: i32, length_frames: u64) {
        self.mailbox.key_on(track_id, module, note, length_frames);
    }

    pub fn note_off(&self, track_id: i32) {
        self.mailbox.key_off(track_id, false);
    }

    // ---- Track bookkeeping ----

    fn find_track(&self, track_id: i32) -> Option<usize> {
        self.tracks
            .iter()
            .position(|track| track.active && track.track_id == track_id)
    }

    fn track_channel_mut(&mut self, track_id: i32) -> Option<&mut Channel> {
        let index = self.find_track(track_id)?;
        let channel = self.tracks[index].channel?;
        Some(self.chip.channel_mut(channel))
    }

    fn find_free_channel(&self, module: ModuleType) -> Option<usize> {
        (0..self.chip.channel_count()).find(|&index| {
            if self.channel_bound[index] {
                return false;
            }
            matches!(
                (module, self.chip.channel(index)),
                (ModuleType::Fm, Channel::Fm(_))
                    | (ModuleType::Sampler, Channel::Sampler(_))
                    | (ModuleType::Stream, Channel::Stream(_))
            )
        })
    }

    /// Bind a fresh track to a free channel of the requested kind. Returns
    /// the track index, or None when the pools are exhausted (the note is
    /// then rejected per the error policy).
    fn allocate_track(&mut self, track_id: i32, module: ModuleType) -> Option<usize> {
        let track_index = self.tracks.iter().position(|track| !track.active)?;
        let channel_index = self.find_free_channel(module)?;

        if self.chip.prepare_channel(channel_index).is_err() {
            return None;
        }
        self.channel_bound[channel_index] = true;

        let track = &mut self.tracks[track_index];
        *track = Track::empty();
        track.track_id = track_id;
        track.module = module;
        track.channel = Some(channel_index);
        track.active = true;

        self.bind_track_effect_stream(track_id);
        Some(track_index)
    }

    // ---- Mailbox drain ----

    fn drain_mailbox(&mut self) {
        let mailbox = Arc::clone(&self.mailbox);
        mailbox.drain(|update| self.apply_update(update));
    }

    fn apply_update(&mut self, update: &TrackUpdate) {
        // Effect-chain mutations apply once, at the chain level.
        if let Some(fx) = &update.fx {
            self.apply_fx_update(update.track_id, fx);
        }

        if let Some(key_on) = &update.key_on {
            self.handle_key_on(update.track_id, key_on);
        }

        // Everything else applies to live channels matching the scope. The
        // index loop keeps the drain allocation-free.
        let bpm = self.bpm;
        for track_index in 0..self.tracks.len() {
            let matches = {
                let track = &self.tracks[track_index];
                track.active
                    && track.track_id == update.track_id
                    && (update.voice_scope_id == -1
                        || track.voice_scope_id == update.voice_scope_id)
            };
            if matches {
                self.apply_channel_update(track_index, update, bpm);
            }
        }
    }

    fn handle_key_on(&mut self, track_id: i32, key_on: &KeyOn) {
        let existing = self.find_track(track_id);

        let track_index = match existing {
            Some(index) => {
                let channel_index = self.tracks[index].channel;
                let sounding = channel_index
                    .map(|ch| self.chip.channel(ch).is_note_on())
                    .unwrap_or(false);
                match self.note_on_exception_mode {
                    ExceptionMode::Reject if sounding => return,
                    ExceptionMode::Overwrite => {
                        if let Some(ch) = channel_index {
                            self.chip.channel_mut(ch).note_off();
                        }
                        index
                    }
                    _ => index,
                }
            }
            None => match self.allocate_track(track_id, key_on.module) {
                Some(index) => index,
                None => {
                    log::warn!("Driver: no free channel for note-on (track {track_id})");
                    return;
                }
            },
        };

        let note = key_on.note.clamp(0, 127);
        self.tracks[track_index].note = note;
        self.tracks[track_index].remaining_frames =
            (key_on.length_frames > 0).then_some(key_on.length_frames);
        let velocity = self.tracks[track_index].velocity;
        let expression = self.tracks[track_index].expression;
        let bend = self.tracks[track_index].pitch_bend;

        if let Some(channel_index) = self.tracks[track_index].channel {
            let channel = self.chip.channel_mut(channel_index);
            channel.set_pitch((note << 6) + bend);
            channel.offset_volume(expression, velocity);
            channel.note_on();
        }
    }

    fn apply_fx_update(&mut self, track_id: i32, fx: &crate::mailbox::FxUpdate) {
        let Some(&index) = self.track_effect_streams.get(&track_id) else {
            return;
        };

        // Build instances first so the stream borrow stays short.
        match fx.op {
            FxOp::SetChain => {
                let mut chain = Vec::with_capacity(fx.chain_len);
                for spec in &fx.chain[..fx.chain_len] {
                    if spec.name().is_empty() {
                        continue;
                    }
                    if let Some(mut effect) = self.effector.create_effect_instance(spec.name()) {
                        effect.reset();
                        effect.set_args(spec.args());
                        chain.push(effect);
                    }
                }
                if let Some(stream) = self.effector.local(index) {
                    stream.set_chain(chain);
                }
            }
            FxOp::Insert => {
                let spec = &fx.chain[0];
                if let Some(mut effect) = self.effector.create_effect_instance(spec.name()) {
                    effect.reset();
                    effect.set_args(spec.args());
                    if let Some(stream) = self.effector.local(index) {
                        stream.insert_effect(fx.index, effect);
                        stream.prepare_process();
                    }
                }
            }
            FxOp::Remove => {
                if let Some(stream) = self.effector.local(index) {
                    stream.remove_effect(fx.index);
                    stream.prepare_process();
                }
            }
            FxOp::Swap => {
                if let Some(stream) = self.effector.local(index) {
                    stream.swap_effects(fx.index, fx.index_b);
                    stream.prepare_process();
                }
            }
            FxOp::None => {}
        }

        if let Some(stream) = self.effector.local(index) {
            if let Some(args) = &fx.args {
                stream.set_effect_args(fx.index, args.args());
            }
            if let Some(bypassed) = fx.bypass {
                stream.set_effect_bypass(fx.index, bypassed);
            }
        }
    }

    fn apply_channel_update(&mut self, track_index: usize, update: &TrackUpdate, bpm: f64) {
        let Some(channel_index) = self.tracks[track_index].channel else {
            return;
        };

        // Track-level fields first.
        if let Some(expression) = update.expression {
            self.tracks[track_index].expression = expression.clamp(0, 128);
        }
        if let Some(velocity) = update.velocity {
            self.tracks[track_index].velocity = velocity.clamp(0, 512);
        }
        if let Some(bend) = update.pitch_bend {
            self.tracks[track_index].pitch_bend = bend.clamp(-8192, 8191);
        }
        let note = self.tracks[track_index].note;
        let bend = self.tracks[track_index].pitch_bend;
        let velocity = self.tracks[track_index].velocity;
        let expression = self.tracks[track_index].expression;
        let track_id = self.tracks[track_index].track_id;

        // Filter merge needs the cache entry before the channel borrow.
        let filter_update = self.merge_filter_state(track_id, update);

        let channel = self.chip.channel_mut(channel_index);

        if let Some(volume) = update.volume {
            // Up to 2.0 (200%) for hot-mix headroom; downstream gain staging
            // keeps the final output in range.
            let volume128 = (volume.clamp(0.0, 2.0) * 128.0).round() as i32;
            channel.common_mut().set_master_volume(volume128);
        }
        if let Some(db) = update.instrument_gain_db {
            channel.common_mut().set_instrument_gain_db(db);
        }
        if let Some(pan) = update.pan {
            channel.common_mut().set_pan(pan);
        }

        if let Some((full, state)) = filter_update {
            let common = channel.common_mut();
            if full {
                common.activate_filter(true);
                common.set_filter_type(state.filter_type);
                common.set_sv_filter(
                    state.cutoff,
                    state.resonance,
                    state.attack_rate,
                    state.decay_rate1,
                    state.decay_rate2,
                    state.release_rate,
                    state.decay_cutoff1,
                    state.decay_cutoff2,
                    state.sustain_cutoff,
                    state.release_cutoff,
                );
                common.cutoff_frequency = state.cutoff;
            } else {
                // Lightweight path: bootstrap the filter if needed, then
                // glide to the new values in place.
                if !common.is_filter_active() {
                    common.activate_filter(true);
                    common.set_filter_type(state.filter_type);
                }
                if update.filter_cutoff.is_some() {
                    common.set_filter_cutoff_now(state.cutoff);
                }
                if update.filter_resonance.is_some() {
                    common.set_filter_resonance_now(state.resonance);
                }
            }
        }

        if update.expression.is_some() || update.velocity.is_some() {
            channel.offset_volume(expression, velocity);
        }
        if update.pitch_bend.is_some() {
            channel.set_pitch((note << 6) + bend);
        }

        if let Some(wave) = update.lfo_wave_shape {
            match channel {
                Channel::Fm(ch) => ch.initialize_lfo(wave),
                Channel::Sampler(ch) => ch.initialize_lfo(wave),
                Channel::Stream(ch) => ch.common.initialize_lfo(wave, None),
            }
        }
        if let Some(mode) = update.lfo_time_mode {
            channel
                .common_mut()
                .set_lfo_time_mode(LfoTimeMode::from_index(mode), bpm);
        }
        if let Some(step) = update.lfo_frequency_step {
            channel.common_mut().set_lfo_frequency_step(step, bpm);
        }
        if let Some(ratio) = update.envelope_frequency_ratio {
            match &mut *channel {
                Channel::Sampler(ch) => ch.set_frequency_ratio(ratio),
                other => other.common_mut().set_frequency_ratio(ratio),
            }
        }

        if let Some(depth) = update.ch_am_depth {
            match channel {
                Channel::Fm(ch) => ch.set_amplitude_modulation(depth),
                Channel::Sampler(ch) => ch.set_amplitude_modulation(depth),
                Channel::Stream(_) => {}
            }
        }
        if let Some(depth) = update.ch_pm_depth {
            match channel {
                Channel::Fm(ch) => ch.set_pitch_modulation(depth),
                Channel::Sampler(ch) => ch.set_pitch_modulation(depth),
                Channel::Stream(_) => {}
            }
        }

        if let Some(op_update) = &update.fm_op {
            if let Channel::Fm(ch) = channel {
                ch.set_active_operator_index(op_update.op_index.min(3));
                let op = ch.active_operator();
                let value = op_update.value;
                match op_update.param {
                    FmOpParam::TotalLevel => op.set_total_level(value),
                    FmOpParam::Multiple => op.set_multiple(value),
                    FmOpParam::FineMultiple => op.set_fine_multiple(value),
                    FmOpParam::Detune1 => op.set_detune1(value),
                    FmOpParam::Detune2 => op.set_ptss_detune(value),
                    FmOpParam::AttackRate => op.set_attack_rate(value),
                    FmOpParam::DecayRate => op.set_decay_rate(value),
                    FmOpParam::SustainRate => op.set_sustain_rate(value),
                    FmOpParam::ReleaseRate => op.set_release_rate(value),
                    FmOpParam::SustainLevel => op.set_sustain_level(value),
                    FmOpParam::Mute => op.set_mute(value != 0),
                    FmOpParam::EnvelopeReset => op.set_envelope_reset_on_attack(value != 0),
                    FmOpParam::SuperCount => {
                        let spread = op.super_spread();
                        op.set_super_wave(value, spread);
                    }
                    FmOpParam::SuperSpread => {
                        let count = op.super_count() as i32;
                        op.set_super_wave(count, value);
                    }
                    FmOpParam::SuperStereoSpread => op.set_super_stereo_spread(value),
                }
            }
        }

        if let Channel::Sampler(ch) = channel {
            if let Some(value) = update.amp_attack_rate {
                ch.set_amp_attack_rate(value);
            }
            if let Some(value) = update.amp_decay_rate {
                ch.set_amp_decay_rate(value);
            }
            if let Some(value) = update.amp_sustain_level {
                ch.set_amp_sustain_level(value);
            }
            if let Some(value) = update.amp_release_rate {
                ch.set_amp_release_rate(value);
            }
            if let Some(value) = update.sampler_start_point {
                ch.set_sampler_start_point(value);
            }
            if let Some(value) = update.sampler_end_point {
                ch.set_sampler_end_point(value);
            }
            if let Some(value) = update.sampler_loop_point {
                ch.set_sampler_loop_point(value);
            }
            if let Some(value) = update.sampler_ignore_note_off {
                ch.set_sampler_ignore_note_off(value);
            }
            if let Some(value) = update.sampler_pan {
                ch.set_sampler_pan(value);
            }
            if let Some(value) = update.sampler_gain_db {
                ch.set_sampler_gain_db(value);
            }
            if let Some(value) = update.sampler_root_offset {
                ch.set_sampler_root_offset(value);
            }
            if let Some(value) = update.sampler_coarse_offset {
                ch.set_sampler_coarse_offset(value);
            }
            if let Some(value) = update.sampler_fine_offset {
                ch.set_sampler_fine_offset(value);
            }
        }

        if let Channel::Stream(ch) = channel {
            if let Some(value) = update.stream_gain_db {
                ch.set_stream_gain(value);
            }
            if let Some(value) = update.stream_pan {
                ch.set_stream_pan(value);
            }
            if let Some(value) = update.stream_pitch_cents {
                ch.set_stream_pitch_cents(value, bpm);
            }
            if let Some(value) = update.stream_fade_in {
                ch.set_stream_fade_in(value);
            }
            if let Some(value) = update.stream_fade_out {
                ch.set_stream_fade_out(value);
            }
            if let Some(value) = update.stream_in_sample {
                ch.set_stream_in_sample(value);
            }
            if let Some(value) = update.stream_out_sample {
                ch.set_stream_out_sample(value);
            }
            if let Some(value) = update.stream_warp_mode {
                ch.set_stream_warp_mode(value, bpm);
            }
            if let Some(value) = update.stream_clip_bpm {
                ch.set_stream_clip_bpm(value, bpm);
            }
            if let Some(value) = update.stream_grain_size {
                ch.set_stream_grain_size(value);
            }
            if let Some(value) = update.stream_flux {
                ch.set_stream_flux(value);
            }
            if let Some(value) = update.stream_seek {
                ch.seek_to(value);
            }
            if let Some(value) = update.stream_looping {
                ch.set_stream_looping(value);
            }
            if let Some((start, end)) = update.stream_loop_region {
                ch.set_stream_loop_region(start, end);
            }
        }

        if let Some(immediate) = update.key_off {
            self.tracks[track_index].remaining_frames = None;
            let channel = self.chip.channel_mut(channel_index);
            channel.note_off();
            if immediate {
                channel.common_mut().start_kill_fade(-1);
            }
        }
    }

    /// Merge a message's filter fields into the per-track cache. Returns
    /// `(needs_full_restamp, merged_state)` when any filter field was set.
    fn merge_filter_state(
        &mut self,
        track_id: i32,
        update: &TrackUpdate,
    ) -> Option<(bool, FilterState)> {
        let any = update.filter.is_some()
            || update.filter_type.is_some()
            || update.filter_cutoff.is_some()
            || update.filter_resonance.is_some()
            || update.filter_attack_rate.is_some()
            || update.filter_decay_rate1.is_some()
            || update.filter_decay_rate2.is_some()
            || update.filter_release_rate.is_some()
            || update.filter_decay_cutoff1.is_some()
            || update.filter_decay_cutoff2.is_some()
            || update.filter_sustain_cutoff.is_some()
            || update.filter_release_cutoff.is_some();
        if !any {
            return None;
        }

        let state = self.filter_state_cache.entry(track_id).or_default();
        if let Some(filter_type) = update.filter_type {
            state.filter_type = filter_type.clamp(0, 2);
        }
        if let Some(stamp) = update.filter {
            state.cutoff = stamp.cutoff.clamp(0, 128);
            state.resonance = stamp.resonance.clamp(0, 9);
        }
        if let Some(cutoff) = update.filter_cutoff {
            state.cutoff = cutoff.clamp(0, 128);
        }
        if let Some(resonance) = update.filter_resonance {
            state.resonance = resonance.clamp(0, 9);
        }
        if let Some(value) = update.filter_attack_rate {
            state.attack_rate = value.clamp(0, 63);
        }
        if let Some(value) = update.filter_decay_rate1 {
            state.decay_rate1 = value.clamp(0, 63);
        }
        if let Some(value) = update.filter_decay_rate2 {
            state.decay_rate2 = value.clamp(0, 63);
        }
        if let Some(value) = update.filter_release_rate {
            state.release_rate = value.clamp(0, 63);
        }
        if let Some(value) = update.filter_decay_cutoff1 {
            state.decay_cutoff1 = value.clamp(0, 128);
        }
        if let Some(value) = update.filter_decay_cutoff2 {
            state.decay_cutoff2 = value.clamp(0, 128);
        }
        if let Some(value) = update.filter_sustain_cutoff {
            state.sustain_cutoff = value.clamp(0, 128);
        }
        if let Some(value) = update.filter_release_cutoff {
            state.release_cutoff = value.clamp(0, 128);
        }

        // A full stamp (the combined setter or any rate/offset write)
        // restarts the EG; bare cutoff/resonance writes stay lightweight.
        let full = update.filter.is_some()
            || update.filter_type.is_some()
            || update.filter_attack_rate.is_some()
            || update.filter_decay_rate1.is_some()
            || update.filter_decay_rate2.is_some()
            || update.filter_release_rate.is_some()
            || update.filter_decay_cutoff1.is_some()
            || update.filter_decay_cutoff2.is_some()
            || update.filter_sustain_cutoff.is_some()
            || update.filter_release_cutoff.is_some();

        state.initialized = true;
        Some((full, *state))
    }

    // ---- Block pipeline ----

    /// Generate one internal block into the master accumulator.
    fn process_block(&mut self) {
        let block = self.buffer_length.as_usize();

        // 1. Parameter updates take effect on block boundaries.
        self.drain_mailbox();

        // 2. Length-bounded notes count down and key off.
        for track in &mut self.tracks {
            if !track.active {
                continue;
            }
            if let Some(remaining) = track.remaining_frames {
                if remaining <= block as u64 {
                    track.remaining_frames = None;
                    if let Some(channel_index) = track.channel {
                        self.chip.channel_mut(channel_index).note_off();
                    }
                } else {
                    track.remaining_frames = Some(remaining - block as u64);
                }
            }
        }

        // 3..6. Channels render and mix.
        self.bank.clear_all();
        self.chip.begin_process();
        self.chip.buffer_all(&mut self.bank, block);

        // 7..8. Effect chains, deepest first, then master.
        self.update_track_effect_post_fader();
        self.effector.process_all(&mut self.bank, block);

        // Master volume on the final accumulator.
        if (self.master_volume - 1.0).abs() > 1e-12 {
            for value in self.bank.get_mut(MASTER_STREAM).buffer_mut() {
                *value *= self.master_volume;
            }
        }

        // 9. Metering, downsampled.
        if self.metering.is_enabled() {
            self.meter_downsample_counter += 1;
            if self.meter_downsample_counter >= self.metering.downsample_factor() {
                self.meter_downsample_counter = 0;
                for (&track_id, &index) in &self.track_effect_streams {
                    if let Some(stream) = self.effector.local_ref(index) {
                        let buffer = self.bank.get(stream.stream()).buffer();
                        self.metering.meter_track(
                            track_id,
                            buffer,
                            block,
                            stream.post_fader_gain(),
                            stream.post_pan(),
                        );
                    }
                }
                self.metering
                    .meter_master(self.bank.get(MASTER_STREAM).buffer(), block);
            }
        }
    }

    /// Fill the host's interleaved stereo buffer. Internally generates
    /// `buffer_length`-frame blocks and bridges arbitrary request sizes
    /// through the residual buffer. Returns frames written.
    pub fn generate_audio(&mut self, output: &mut [f32]) -> usize {
        let frames_requested = output.len() / 2;
        let block = self.buffer_length.as_usize();
        let mut frames_generated = 0usize;

        while frames_generated < frames_requested {
            if self.residual_frames == 0 {
                self.process_block();
                let master = self.bank.get(MASTER_STREAM).buffer();
                self.residual[..block * 2].copy_from_slice(&master[..block * 2]);
                self.residual_frames = block;
                self.residual_offset = 0;
            }

            let available = self.residual_frames - self.residual_offset;
            let to_copy = available.min(frames_requested - frames_generated);
            for i in 0..to_copy {
                let src = (self.residual_offset + i) * 2;
                let dst = (frames_generated + i) * 2;
                output[dst] = self.residual[src] as f32;
                output[dst + 1] = self.residual[src + 1] as f32;
            }

            self.residual_offset += to_copy;
            frames_generated += to_copy;
            if self.residual_offset >= self.residual_frames {
                self.residual_frames = 0;
                self.residual_offset = 0;
            }
        }

        frames_generated
    }

    /// Synchronous block render used by the offline renderer; returns the
    /// master accumulator for the block just produced.
    pub(crate) fn render_one_block(&mut self) -> &[f64] {
        self.process_block();
        self.bank.get(MASTER_STREAM).buffer()
    }

    // ---- Metering passthrough ----

    pub fn register_track_for_metering(&self, track_id: i32) {
        self.metering.register_track(track_id);
    }

    pub fn unregister_track_for_metering(&self, track_id: i32) {
        self.metering.unregister_track(track_id);
    }

    pub fn get_master_meter_snapshot(&self) -> crate::metering::MeterSnapshot {
        self.metering.master_snapshot()
    }

    pub fn get_track_meter_snapshot(
        &self,
        track_id: i32,
    ) -> Option<crate::metering::MeterSnapshot> {
        self.metering.track_snapshot(track_id)
    }
}
