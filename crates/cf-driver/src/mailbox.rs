//! Parameter mailbox: a fixed-capacity SPSC ring carrying typed parameter
//! updates from the control thread to the audio thread.
//!
//! Push never blocks and never fails; when the ring is full the oldest
//! message is dropped, because a parameter stream is a latest-wins contract.
//! The audio thread drains once per block, applying each message to every
//! live channel matching its track id (and optional voice scope).

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use cf_chip::ModuleType;

/// Ring capacity; power of two for cheap wrapping.
pub const MAILBOX_CAPACITY: usize = 1024;

/// FM operator parameters addressable per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmOpParam {
    TotalLevel,
    Multiple,
    FineMultiple,
    Detune1,
    Detune2,
    AttackRate,
    DecayRate,
    SustainRate,
    ReleaseRate,
    SustainLevel,
    Mute,
    EnvelopeReset,
    SuperCount,
    SuperSpread,
    SuperStereoSpread,
}

#[derive(Debug, Clone, Copy)]
pub struct FmOpUpdate {
    pub op_index: usize,
    pub param: FmOpParam,
    pub value: i32,
}

/// Full filter stamp: restarts the filter envelope when applied.
#[derive(Debug, Clone, Copy)]
pub struct FilterStamp {
    pub cutoff: i32,
    pub resonance: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyOn {
    pub module: ModuleType,
    pub note: i32,
    /// 0 = held until key-off.
    pub length_frames: u64,
}

// ---- Effect chain mutation ----

pub const FX_NAME_MAX: usize = 16;
pub const FX_ARGS_MAX: usize = 21;
pub const FX_CHAIN_MAX: usize = 4;

/// Fixed-size effect spec (name + positional args) so messages stay `Copy`.
#[derive(Debug, Clone, Copy)]
pub struct FxEffectSpec {
    name: [u8; FX_NAME_MAX],
    name_len: u8,
    args: [f64; FX_ARGS_MAX],
    argc: u8,
}

impl FxEffectSpec {
    pub fn new(name: &str, args: &[f64]) -> Self {
        let mut spec = Self {
            name: [0; FX_NAME_MAX],
            name_len: 0,
            args: [0.0; FX_ARGS_MAX],
            argc: 0,
        };
        let bytes = name.as_bytes();
        let len = bytes.len().min(FX_NAME_MAX);
        spec.name[..len].copy_from_slice(&bytes[..len]);
        spec.name_len = len as u8;
        let argc = args.len().min(FX_ARGS_MAX);
        spec.args[..argc].copy_from_slice(&args[..argc]);
        spec.argc = argc as u8;
        spec
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn args(&self) -> &[f64] {
        &self.args[..self.argc as usize]
    }
}

impl Default for FxEffectSpec {
    fn default() -> Self {
        Self::new("", &[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FxOp {
    #[default]
    None,
    SetChain,
    Insert,
    Remove,
    Swap,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FxUpdate {
    pub op: FxOp,
    pub index: usize,
    pub index_b: usize,
    pub chain: [FxEffectSpec; FX_CHAIN_MAX],
    pub chain_len: usize,
    pub args: Option<FxEffectSpec>,
    pub bypass: Option<bool>,
}

// ---- The message ----

/// One mailbox message: track scope plus optional fields; only set fields
/// are applied, all of them to one channel before the next is visited.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackUpdate {
    pub track_id: i32,
    /// When >= 0, restricts the update to channels stamped with this voice.
    pub voice_scope_id: i64,

    pub volume: Option<f64>,
    pub instrument_gain_db: Option<i32>,
    pub pan: Option<i32>,

    // Filter: a full stamp restarts the EG; cutoff/resonance alone are
    // lightweight in-place writes.
    pub filter: Option<FilterStamp>,
    pub filter_type: Option<i32>,
    pub filter_cutoff: Option<i32>,
    pub filter_resonance: Option<i32>,
    pub filter_attack_rate: Option<i32>,
    pub filter_decay_rate1: Option<i32>,
    pub filter_decay_rate2: Option<i32>,
    pub filter_release_rate: Option<i32>,
    pub filter_decay_cutoff1: Option<i32>,
    pub filter_decay_cutoff2: Option<i32>,
    pub filter_sustain_cutoff: Option<i32>,
    pub filter_release_cutoff: Option<i32>,

    pub fm_op: Option<FmOpUpdate>,
    pub ch_am_depth: Option<i32>,
    pub ch_pm_depth: Option<i32>,
    pub pitch_bend: Option<i32>,
    pub lfo_frequency_step: Option<i32>,
    pub lfo_wave_shape: Option<i32>,
    pub lfo_time_mode: Option<i32>,
    pub envelope_frequency_ratio: Option<i32>,

    // Sampler amplitude envelope + sample slice parameters.
    pub amp_attack_rate: Option<i32>,
    pub amp_decay_rate: Option<i32>,
    pub amp_sustain_level: Option<i32>,
    pub amp_release_rate: Option<i32>,
    pub sampler_start_point: Option<i32>,
    pub sampler_end_point: Option<i32>,
    pub sampler_loop_point: Option<i32>,
    pub sampler_ignore_note_off: Option<bool>,
    pub sampler_pan: Option<i32>,
    pub sampler_gain_db: Option<i32>,
    pub sampler_root_offset: Option<i32>,
    pub sampler_coarse_offset: Option<i32>,
    pub sampler_fine_offset: Option<i32>,

    // Streaming clip parameters.
    pub stream_gain_db: Option<f64>,
    pub stream_pan: Option<i32>,
    pub stream_pitch_cents: Option<i32>,
    pub stream_fade_in: Option<i64>,
    pub stream_fade_out: Option<i64>,
    pub stream_in_sample: Option<i64>,
    pub stream_out_sample: Option<i64>,
    pub stream_warp_mode: Option<i32>,
    pub stream_clip_bpm: Option<f64>,
    pub stream_grain_size: Option<f64>,
    pub stream_flux: Option<f64>,
    pub stream_seek: Option<i64>,
    pub stream_looping: Option<bool>,
    pub stream_loop_region: Option<(i64, i64)>,

    // Note control.
    pub key_on: Option<KeyOn>,
    pub key_off: Option<bool>,
    pub expression: Option<i32>,
    pub velocity: Option<i32>,

    // Effect chain mutation (applied once at chain level).
    pub fx: Option<FxUpdate>,
}

impl TrackUpdate {
    pub fn new(track_id: i32, voice_scope_id: i64) -> Self {
        Self {
            track_id,
            voice_scope_id,
            ..Self::default()
        }
    }
}

// ---- The ring ----

/// SPSC ring of `TrackUpdate` messages. Slots are tiny mutexes so the
/// drop-oldest overflow path can never produce a torn message; both sides
/// hold a slot lock only for a value copy.
pub struct Mailbox {
    ring: Box<[Mutex<TrackUpdate>]>,
    /// Producer cursor.
    head: AtomicUsize,
    /// Consumer cursor. The producer advances it on overflow (drop-oldest).
    tail: AtomicUsize,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            ring: (0..MAILBOX_CAPACITY)
                .map(|_| Mutex::new(TrackUpdate::default()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a message; always succeeds. On overflow the oldest message is
    /// dropped by advancing the tail.
    pub fn push(&self, update: TrackUpdate) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let next = (head + 1) & (MAILBOX_CAPACITY - 1);
        if next == tail {
            // Ring full: drop the oldest. A concurrent drain advancing the
            // tail makes the exchange fail, which means space appeared.
            let _ = self.tail.compare_exchange(
                tail,
                (tail + 1) & (MAILBOX_CAPACITY - 1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        *self.ring[head].lock() = update;
        self.head.store(next, Ordering::Release);
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & (MAILBOX_CAPACITY - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain in FIFO order, calling `apply` per message. Audio thread only.
    pub fn drain(&self, mut apply: impl FnMut(&TrackUpdate)) {
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Relaxed);
        while tail != head {
            let update = *self.ring[tail].lock();
            tail = (tail + 1) & (MAILBOX_CAPACITY - 1);
            // Publish progress before applying so an overflowing producer
            // sees the freed slot as early as possible.
            self.tail.store(tail, Ordering::Release);
            apply(&update);
        }
    }

    // ---- Typed setters (control thread) ----

    pub fn set_track_volume(&self, track_id: i32, linear_volume: f64, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.volume = Some(linear_volume);
        self.push(update);
    }

    pub fn set_track_pan(&self, track_id: i32, pan: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.pan = Some(pan);
        self.push(update);
    }

    pub fn set_track_instrument_gain_db(&self, track_id: i32, db: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.instrument_gain_db = Some(db);
        self.push(update);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_track_filter(
        &self,
        track_id: i32,
        cutoff: i32,
        resonance: i32,
        filter_type: Option<i32>,
        rates: [Option<i32>; 4],
        cutoffs: [Option<i32>; 4],
        voice_scope_id: i64,
    ) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter = Some(FilterStamp { cutoff, resonance });
        update.filter_type = filter_type;
        update.filter_attack_rate = rates[0];
        update.filter_decay_rate1 = rates[1];
        update.filter_decay_rate2 = rates[2];
        update.filter_release_rate = rates[3];
        update.filter_decay_cutoff1 = cutoffs[0];
        update.filter_decay_cutoff2 = cutoffs[1];
        update.filter_sustain_cutoff = cutoffs[2];
        update.filter_release_cutoff = cutoffs[3];
        self.push(update);
    }

    pub fn set_track_filter_type(&self, track_id: i32, filter_type: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_type = Some(filter_type);
        self.push(update);
    }

    pub fn set_track_filter_cutoff(&self, track_id: i32, cutoff: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_cutoff = Some(cutoff);
        self.push(update);
    }

    pub fn set_track_filter_resonance(&self, track_id: i32, resonance: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_resonance = Some(resonance);
        self.push(update);
    }

    pub fn set_track_filter_attack_rate(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_attack_rate = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_decay_rate1(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_decay_rate1 = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_decay_rate2(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_decay_rate2 = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_release_rate(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_release_rate = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_decay_cutoff1(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_decay_cutoff1 = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_decay_cutoff2(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_decay_cutoff2 = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_sustain_cutoff(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_sustain_cutoff = Some(value);
        self.push(update);
    }

    pub fn set_track_filter_release_cutoff(&self, track_id: i32, value: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.filter_release_cutoff = Some(value);
        self.push(update);
    }

    pub fn set_fm_op_param(&self, track_id: i32, op_index: usize, param: FmOpParam, value: i32) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.fm_op = Some(FmOpUpdate {
            op_index,
            param,
            value,
        });
        self.push(update);
    }

    pub fn set_ch_am_depth(&self, track_id: i32, depth: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.ch_am_depth = Some(depth);
        self.push(update);
    }

    pub fn set_ch_pm_depth(&self, track_id: i32, depth: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.ch_pm_depth = Some(depth);
        self.push(update);
    }

    pub fn set_pitch_bend(&self, track_id: i32, bend: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.pitch_bend = Some(bend);
        self.push(update);
    }

    pub fn set_lfo_frequency_step(&self, track_id: i32, step: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.lfo_frequency_step = Some(step);
        self.push(update);
    }

    pub fn set_lfo_wave_shape(&self, track_id: i32, wave_shape: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.lfo_wave_shape = Some(wave_shape);
        self.push(update);
    }

    pub fn set_lfo_time_mode(&self, track_id: i32, mode: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.lfo_time_mode = Some(mode);
        self.push(update);
    }

    pub fn set_envelope_frequency_ratio(&self, track_id: i32, ratio: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.envelope_frequency_ratio = Some(ratio);
        self.push(update);
    }

    pub fn set_amp_envelope(
        &self,
        track_id: i32,
        attack: Option<i32>,
        decay: Option<i32>,
        sustain: Option<i32>,
        release: Option<i32>,
    ) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.amp_attack_rate = attack;
        update.amp_decay_rate = decay;
        update.amp_sustain_level = sustain;
        update.amp_release_rate = release;
        self.push(update);
    }

    pub fn set_sampler_slice(
        &self,
        track_id: i32,
        start: Option<i32>,
        end: Option<i32>,
        loop_point: Option<i32>,
    ) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.sampler_start_point = start;
        update.sampler_end_point = end;
        update.sampler_loop_point = loop_point;
        self.push(update);
    }

    pub fn set_sampler_ignore_note_off(&self, track_id: i32, ignore: bool) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.sampler_ignore_note_off = Some(ignore);
        self.push(update);
    }

    pub fn set_sampler_pan(&self, track_id: i32, pan: i32) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.sampler_pan = Some(pan);
        self.push(update);
    }

    pub fn set_sampler_gain_db(&self, track_id: i32, db: i32) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.sampler_gain_db = Some(db);
        self.push(update);
    }

    pub fn set_sampler_pitch_offsets(
        &self,
        track_id: i32,
        root: Option<i32>,
        coarse: Option<i32>,
        fine: Option<i32>,
    ) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.sampler_root_offset = root;
        update.sampler_coarse_offset = coarse;
        update.sampler_fine_offset = fine;
        self.push(update);
    }

    pub fn set_stream_gain_db(&self, track_id: i32, db: f64, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_gain_db = Some(db);
        self.push(update);
    }

    pub fn set_stream_pan(&self, track_id: i32, pan: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_pan = Some(pan);
        self.push(update);
    }

    pub fn set_stream_pitch_cents(&self, track_id: i32, cents: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_pitch_cents = Some(cents);
        self.push(update);
    }

    pub fn set_stream_fades(&self, track_id: i32, fade_in: Option<i64>, fade_out: Option<i64>) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.stream_fade_in = fade_in;
        update.stream_fade_out = fade_out;
        self.push(update);
    }

    pub fn set_stream_trim(&self, track_id: i32, in_sample: Option<i64>, out_sample: Option<i64>) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.stream_in_sample = in_sample;
        update.stream_out_sample = out_sample;
        self.push(update);
    }

    pub fn set_stream_warp_mode(&self, track_id: i32, mode: i32, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_warp_mode = Some(mode);
        self.push(update);
    }

    pub fn set_stream_clip_bpm(&self, track_id: i32, bpm: f64, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_clip_bpm = Some(bpm);
        self.push(update);
    }

    pub fn set_stream_grain_size(&self, track_id: i32, grain_size: f64, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_grain_size = Some(grain_size);
        self.push(update);
    }

    pub fn set_stream_flux(&self, track_id: i32, flux: f64, voice_scope_id: i64) {
        let mut update = TrackUpdate::new(track_id, voice_scope_id);
        update.stream_flux = Some(flux);
        self.push(update);
    }

    pub fn stream_seek(&self, track_id: i32, position_48k: i64) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.stream_seek = Some(position_48k);
        self.push(update);
    }

    pub fn set_stream_looping(&self, track_id: i32, looping: bool) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.stream_looping = Some(looping);
        self.push(update);
    }

    pub fn set_stream_loop_region(&self, track_id: i32, start_48k: i64, end_48k: i64) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.stream_loop_region = Some((start_48k, end_48k));
        self.push(update);
    }

    pub fn key_on(&self, track_id: i32, module: ModuleType, note: i32, length_frames: u64) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.key_on = Some(KeyOn {
            module,
            note,
            length_frames,
        });
        self.push(update);
    }

    pub fn key_off(&self, track_id: i32, immediate: bool) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.key_off = Some(immediate);
        self.push(update);
    }

    pub fn set_expression(&self, track_id: i32, expression: i32) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.expression = Some(expression);
        self.push(update);
    }

    pub fn set_velocity(&self, track_id: i32, velocity: i32) {
        let mut update = TrackUpdate::new(track_id, -1);
        update.velocity = Some(velocity);
        self.push(update);
    }

    pub fn fx_set_chain(&self, track_id: i32, specs: &[FxEffectSpec]) {
        let mut fx = FxUpdate {
            op: FxOp::SetChain,
            ..FxUpdate::default()
        };
        fx.chain_len = specs.len().min(FX_CHAIN_MAX);
        fx.chain[..fx.chain_len].copy_from_slice(&specs[..fx.chain_len]);
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }

    pub fn fx_insert(&self, track_id: i32, index: usize, spec: FxEffectSpec) {
        let mut fx = FxUpdate {
            op: FxOp::Insert,
            index,
            ..FxUpdate::default()
        };
        fx.chain[0] = spec;
        fx.chain_len = 1;
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }

    pub fn fx_remove(&self, track_id: i32, index: usize) {
        let fx = FxUpdate {
            op: FxOp::Remove,
            index,
            ..FxUpdate::default()
        };
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }

    pub fn fx_swap(&self, track_id: i32, index_a: usize, index_b: usize) {
        let fx = FxUpdate {
            op: FxOp::Swap,
            index: index_a,
            index_b,
            ..FxUpdate::default()
        };
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }

    pub fn fx_set_args(&self, track_id: i32, index: usize, args: &[f64]) {
        let fx = FxUpdate {
            op: FxOp::None,
            index,
            args: Some(FxEffectSpec::new("", args)),
            ..FxUpdate::default()
        };
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }

    pub fn fx_set_bypass(&self, track_id: i32, index: usize, bypassed: bool) {
        let fx = FxUpdate {
            op: FxOp::None,
            index,
            bypass: Some(bypassed),
            ..FxUpdate::default()
        };
        let mut update = TrackUpdate::new(track_id, -1);
        update.fx = Some(fx);
        self.push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        for i in 0..10 {
            mailbox.set_track_volume(i, i as f64 / 10.0, -1);
        }
        let mut seen = Vec::new();
        mailbox.drain(|update| seen.push(update.track_id));
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mailbox = Mailbox::new();
        // Push twice the capacity; only the newest CAPACITY-1 usable slots
        // survive, still in FIFO order.
        for i in 0..(2 * MAILBOX_CAPACITY as i32) {
            mailbox.set_track_volume(i, 1.0, -1);
        }
        let mut seen = Vec::new();
        mailbox.drain(|update| seen.push(update.track_id));
        assert!(!seen.is_empty());
        assert!(seen.len() <= MAILBOX_CAPACITY);
        // The newest message always survives, and order is ascending.
        assert_eq!(*seen.last().unwrap(), 2 * MAILBOX_CAPACITY as i32 - 1);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_only_set_fields_present() {
        let mailbox = Mailbox::new();
        mailbox.set_track_pan(3, -10, 42);
        mailbox.drain(|update| {
            assert_eq!(update.track_id, 3);
            assert_eq!(update.voice_scope_id, 42);
            assert_eq!(update.pan, Some(-10));
            assert!(update.volume.is_none());
            assert!(update.filter.is_none());
            assert!(update.key_on.is_none());
        });
    }

    #[test]
    fn test_fx_spec_name_round_trip() {
        let spec = FxEffectSpec::new("mb_compressor", &[1.0, 2.0]);
        assert_eq!(spec.name(), "mb_compressor");
        assert_eq!(spec.args(), &[1.0, 2.0]);
        // Oversized names truncate instead of failing.
        let long = FxEffectSpec::new("a_very_long_effect_name_indeed", &[]);
        assert_eq!(long.name().len(), FX_NAME_MAX);
    }

    #[test]
    fn test_push_from_second_thread() {
        let mailbox = std::sync::Arc::new(Mailbox::new());
        let producer = std::sync::Arc::clone(&mailbox);
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                producer.set_track_volume(i, 0.5, -1);
            }
        });
        handle.join().unwrap();
        let mut count = 0;
        mailbox.drain(|_| count += 1);
        assert_eq!(count, 100);
    }
}
