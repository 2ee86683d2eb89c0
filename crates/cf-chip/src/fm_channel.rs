//! FM channel: 1-4 operators routed by one of 16 algorithms, plus the
//! analog-like, ring-modulation, oscillator-sync and PCM process modes.

use std::sync::Arc;

use cf_tables::{PitchTableType, PulseGeneratorType, RefTables, PHASE_FILTER, PHASE_MAX};

use crate::channel::{ChannelCommon, InputMode, OutputMode, RenderContext, IDLING_THRESHOLD};
use crate::operator::{EgState, Operator};
use crate::pcm_data::PcmData;
use crate::pipe::{OpBase, OpInput, OpOutput};

/// Process function selector; one entry per operator count plus the special
/// modes. The per-sample loops are selected by a plain match, never a
/// closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessType {
    #[default]
    Op1,
    Op2,
    Op3,
    Op4,
    AnalogLike,
    Ring,
    Sync,
    Pcm,
}

/// Carrier flags per (operator count - 1, algorithm); bit i set means
/// operator i reaches the mix. Must agree with the pipe wiring installed by
/// `set_algorithm`.
pub const CARRIER_MASKS: [[u8; 16]; 4] = [
    [1; 16],
    [
        0b10, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11, 0b11,
        0b11, 0b11,
    ],
    [
        0b100, 0b100, 0b101, 0b110, 0b110, 0b111, 0b110, 0b111, 0b111, 0b111, 0b111, 0b111,
        0b111, 0b111, 0b111, 0b111,
    ],
    [
        0b1000, 0b1000, 0b1000, 0b1000, 0b1010, 0b1110, 0b1110, 0b1111, 0b1001, 0b1101,
        0b1000, 0b1001, 0b1010, 0b1111, 0b1111, 0b1111,
    ],
];

pub struct FmChannel {
    pub common: ChannelCommon,
    operators: [Operator; 4],
    operator_count: usize,
    active_operator: usize,
    algorithm: i32,
    process_type: ProcessType,

    // LFO modulation state.
    amplitude_modulation_depth: i32,
    pitch_modulation_depth: i32,
    am_output_level: i32,
    pm_output_level: i32,

    /// Which operator's feedback pipe drives the channel input.
    feedback_connection: Option<usize>,

    // OPM register map scratch.
    register_map_channel: i32,
    opm_pmd: i32,
    opm_amd: i32,

    // Stereo supersaw lanes (channel-owned, block sized).
    stereo_left: Box<[i32]>,
    stereo_right: Box<[i32]>,
}

impl FmChannel {
    pub fn new(buffer_length: usize) -> Self {
        let mut channel = Self {
            common: ChannelCommon::new(),
            operators: std::array::from_fn(|_| Operator::new()),
            operator_count: 1,
            active_operator: 0,
            algorithm: 0,
            process_type: ProcessType::Op1,
            amplitude_modulation_depth: 0,
            pitch_modulation_depth: 0,
            am_output_level: 0,
            pm_output_level: 0,
            feedback_connection: None,
            register_map_channel: 0,
            opm_pmd: 0,
            opm_amd: 0,
            stereo_left: vec![0i32; buffer_length].into_boxed_slice(),
            stereo_right: vec![0i32; buffer_length].into_boxed_slice(),
        };
        channel.initialize(None, 0);
        channel
    }

    pub fn initialize(&mut self, prev: Option<&ChannelCommon>, buffer_index: usize) {
        self.update_operator_count(1);
        self.operators[0].initialize();
        self.common.initialize(prev, buffer_index);
        self.initialize_lfo(0);
        self.common.filter_variables2 = [0.0; 3];
    }

    pub fn reset(&mut self) {
        for op in &mut self.operators {
            op.reset();
        }
        self.common.reset();
    }

    // ---- Operator management ----

    /// All four operators exist for the channel's lifetime; changing the
    /// count only re-initializes the ones crossing the boundary. No
    /// allocation happens during playback.
    fn update_operator_count(&mut self, count: usize) {
        if self.operator_count < count {
            for i in self.operator_count..count {
                self.operators[i].initialize();
            }
        } else if self.operator_count > count {
            for i in count..self.operator_count {
                self.operators[i].reset();
            }
        }

        self.operator_count = count;
        self.process_type = match count {
            1 => ProcessType::Op1,
            2 => ProcessType::Op2,
            3 => ProcessType::Op3,
            _ => ProcessType::Op4,
        };
        self.active_operator = count - 1;

        if self.common.input_mode == InputMode::Feedback {
            self.set_feedback(0, 0);
        }
    }

    #[inline]
    pub fn operator_count(&self) -> usize {
        self.operator_count
    }

    #[inline]
    pub fn algorithm(&self) -> i32 {
        self.algorithm
    }

    #[inline]
    pub fn operator(&self, index: usize) -> &Operator {
        &self.operators[index.min(3)]
    }

    pub fn set_active_operator_index(&mut self, index: usize) {
        self.active_operator = index.min(self.operator_count - 1);
    }

    #[inline]
    pub fn active_operator(&mut self) -> &mut Operator {
        &mut self.operators[self.active_operator]
    }

    /// Carrier mask reflecting the current routing.
    pub fn carrier_mask(&self) -> u8 {
        let mut mask = 0u8;
        for i in 0..self.operator_count {
            if self.operators[i].is_final() {
                mask |= 1 << i;
            }
        }
        mask
    }

    // ---- Algorithm selection ----

    fn set_routing(&mut self, index: usize, input: OpInput, output: OpOutput, base: OpBase, is_final: bool) {
        let op = &mut self.operators[index];
        op.routing.input = input;
        op.routing.output = output;
        op.routing.base = base;
        op.routing.is_final = is_final;
        op.feed_out = 0;
    }

    fn set_algorithm_operator1(&mut self, algorithm: i32) {
        self.update_operator_count(1);
        self.algorithm = algorithm;
        self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
    }

    fn set_algorithm_operator2(&mut self, algorithm: i32) {
        self.update_operator_count(2);
        self.algorithm = algorithm;
        match algorithm {
            0 => {
                // o1(o0)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            2 => {
                // o0+o1(o0)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Output, true);
            }
            _ => {
                // o0+o1
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
        }
    }

    fn set_algorithm_operator3(&mut self, algorithm: i32) {
        self.update_operator_count(3);
        self.algorithm = algorithm;
        match algorithm {
            0 => {
                // o2(o1(o0))
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            1 => {
                // o2(o0+o1)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(2, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            2 => {
                // o0+o2(o1)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            3 => {
                // o1(o0)+o2
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
            4 => {
                // o1(o0)+o2(o0)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            6 => {
                // o0+o1(o0)+o2
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
            _ => {
                // o0+o1+o2
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
        }
    }

    fn set_algorithm_operator4(&mut self, algorithm: i32) {
        self.update_operator_count(4);
        self.algorithm = algorithm;
        match algorithm {
            0 => {
                // o3(o2(o1(o0)))
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(3, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            1 => {
                // o3(o2(o0+o1))
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(2, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(3, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            2 => {
                // o3(o0+o2(o1))
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(3, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            3 => {
                // o3(o1(o0)+o2)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(3, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            4 => {
                // o1(o0)+o3(o2)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(3, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            5 => {
                // o1(o0)+o2(o0)+o3(o0)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(3, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            6 => {
                // o1(o0)+o2+o3
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(3, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
            8 => {
                // o0+o3(o2(o1))
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(3, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            9 => {
                // o0+o2(o1)+o3
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(2, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(3, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
            10 => {
                // o3(o0+o1+o2)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, false);
                self.set_routing(3, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Zero, true);
            }
            11 => {
                // o0+o3(o1+o2)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe1, OpBase::Output, false);
                self.set_routing(3, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            12 => {
                // o0+o1(o0)+o3(o2)
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Zero, false);
                self.set_routing(1, OpInput::Pipe0, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe1, OpBase::Zero, false);
                self.set_routing(3, OpInput::Pipe1, OpOutput::Pipe0, OpBase::Output, true);
            }
            _ => {
                // o0+o1+o2+o3
                self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(2, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
                self.set_routing(3, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
            }
        }
    }

    fn set_algorithm_analog_like(&mut self, algorithm: i32) {
        let target = if (0..=3).contains(&algorithm) {
            algorithm
        } else {
            0
        };
        if self.operator_count == 2
            && self.algorithm == target
            && self.process_type == ProcessType::AnalogLike
        {
            return;
        }
        self.update_operator_count(2);
        self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
        self.set_routing(1, OpInput::Zero, OpOutput::Pipe0, OpBase::Output, true);
        self.algorithm = target;
        self.process_type = ProcessType::AnalogLike;
    }

    /// Select the operator topology. Short-circuits when nothing changes so
    /// rapid re-triggers never rewire pipes mid-block.
    pub fn set_algorithm(&mut self, operator_count: usize, analog_like: bool, algorithm: i32) {
        let is_analog_now = self.process_type == ProcessType::AnalogLike;
        if analog_like == is_analog_now
            && self.operator_count == operator_count
            && self.algorithm == algorithm
        {
            return;
        }

        if analog_like {
            self.set_algorithm_analog_like(algorithm);
            return;
        }

        match operator_count {
            1 => self.set_algorithm_operator1(algorithm),
            2 => self.set_algorithm_operator2(algorithm),
            3 => self.set_algorithm_operator3(algorithm),
            4 => self.set_algorithm_operator4(algorithm),
            _ => log::warn!("FmChannel: invalid operator count {operator_count}"),
        }
    }

    /// Ring-mod and sync process modes reuse the two-operator wiring.
    pub fn set_process_mode_ring(&mut self) {
        self.set_algorithm(2, false, 0);
        self.process_type = ProcessType::Ring;
    }

    pub fn set_process_mode_sync(&mut self) {
        self.set_algorithm(2, false, 0);
        self.process_type = ProcessType::Sync;
    }

    pub fn set_feedback(&mut self, level: i32, connection: usize) {
        if level > 0 {
            let connection = if connection >= self.operator_count {
                0
            } else {
                connection
            };
            self.feedback_connection = Some(connection);
            self.operators[connection].feed_out = 0;
            self.common.input_mode = InputMode::Feedback;
            self.common.input_level = level + 6;
        } else {
            self.feedback_connection = None;
            self.common.input_mode = InputMode::Zero;
            self.common.input_level = 0;
        }
    }

    pub fn feedback(&self) -> (i32, usize) {
        match self.feedback_connection {
            Some(connection) if self.common.input_mode == InputMode::Feedback => {
                (self.common.input_level - 6, connection)
            }
            _ => (0, 0),
        }
    }

    // ---- Wave data ----

    pub fn set_pcm_data(&mut self, pcm: Arc<PcmData>) {
        // Skip the count update when already configured for PCM to avoid
        // racing rapid note triggers.
        if self.operator_count != 1 || self.process_type != ProcessType::Pcm {
            self.update_operator_count(1);
            self.process_type = ProcessType::Pcm;
            self.set_routing(0, OpInput::Channel, OpOutput::Pipe0, OpBase::Output, true);
        }
        self.operators[0].set_pcm_data(Some(pcm));
        self.set_envelope_reset(true);
    }

    pub fn set_wave_table(&mut self, wavelet: Arc<[i32]>, fixed_bits: u32) {
        for op in &mut self.operators {
            op.set_wave_table(Arc::clone(&wavelet), fixed_bits);
        }
    }

    pub fn set_types(&mut self, pg_type: i32, pt_type: PitchTableType) {
        let op = &mut self.operators[self.active_operator];
        op.set_pulse_generator_type(pg_type);
        op.set_pitch_table_type(pt_type);
        // Leaving PCM mode restores the plain operator process path.
        if self.process_type == ProcessType::Pcm {
            self.process_type = ProcessType::Op1;
        }
    }

    // ---- Per-operator forwarding (active operator) ----

    pub fn set_params_by_value(&mut self, values: [Option<i32>; 14]) {
        let op = &mut self.operators[self.active_operator];
        if let Some(v) = values[0] {
            op.set_attack_rate(v);
        }
        if let Some(v) = values[1] {
            op.set_decay_rate(v);
        }
        if let Some(v) = values[2] {
            op.set_sustain_rate(v);
        }
        if let Some(v) = values[3] {
            op.set_release_rate(v);
        }
        if let Some(v) = values[4] {
            op.set_sustain_level(v);
        }
        if let Some(v) = values[5] {
            op.set_total_level(v);
        }
        if let Some(v) = values[6] {
            op.set_key_scaling_rate(v);
        }
        if let Some(v) = values[7] {
            op.set_key_scaling_level(v, false);
        }
        if let Some(v) = values[8] {
            op.set_multiple(v);
        }
        if let Some(v) = values[9] {
            op.set_detune1(v);
        }
        if let Some(v) = values[10] {
            op.set_ptss_detune(v);
        }
        if let Some(v) = values[11] {
            op.set_amplitude_modulation_shift(v);
        }
        if let Some(v) = values[12] {
            op.set_key_on_phase(v);
        }
        if let Some(v) = values[13] {
            op.set_fixed_pitch_index(v << 6);
        }
    }

    pub fn set_all_attack_rate(&mut self, value: i32) {
        for i in 0..self.operator_count {
            if self.operators[i].is_final() {
                self.operators[i].set_attack_rate(value);
            }
        }
    }

    pub fn set_all_release_rate(&mut self, value: i32) {
        for i in 0..self.operator_count {
            if self.operators[i].is_final() {
                self.operators[i].set_release_rate(value);
            }
        }
    }

    pub fn pitch(&self) -> i32 {
        self.operators[self.operator_count - 1].pitch_index()
    }

    pub fn set_pitch(&mut self, value: i32) {
        for i in 0..self.operator_count {
            self.operators[i].set_pitch_index(value);
        }
    }

    pub fn set_envelope_reset(&mut self, reset: bool) {
        for i in 0..self.operator_count {
            self.operators[i].set_envelope_reset_on_attack(reset);
        }
    }

    // ---- Volume control ----

    pub fn offset_volume(&mut self, expression: i32, velocity: i32) {
        let expression_index = (expression << 1).clamp(0, 512) as usize;
        let velocity_index = velocity.clamp(0, 512) as usize;
        let offset = self.common.expression_table[expression_index]
            + self.common.velocity_table[velocity_index];
        for i in 0..self.operator_count {
            let value = if self.operators[i].is_final() { offset } else { 0 };
            self.operators[i].offset_total_level(value);
        }
    }

    // ---- LFO control ----

    fn set_lfo_state(&mut self, enabled: bool) {
        self.common.lfo_on = enabled;
        self.common.lfo_timer_step = if enabled {
            self.common.lfo_timer_step_buffer
        } else {
            0
        };
    }

    pub fn initialize_lfo(&mut self, waveform: i32) {
        self.initialize_lfo_custom(waveform, None);
    }

    pub fn initialize_lfo_custom(&mut self, waveform: i32, custom: Option<&[i32]>) {
        self.common.initialize_lfo(waveform, custom);
        self.set_lfo_state(false);
        self.amplitude_modulation_depth = 0;
        self.pitch_modulation_depth = 0;
        self.am_output_level = 0;
        self.pm_output_level = 0;
        for op in &mut self.operators {
            op.set_pm_detune(0);
        }
    }

    pub fn set_amplitude_modulation(&mut self, depth: i32) {
        self.amplitude_modulation_depth = depth << 2;
        self.am_output_level = ((self.common.lfo_wave_table[self.common.lfo_phase]
            * self.amplitude_modulation_depth)
            >> 7)
            << 3;
        self.set_lfo_state(self.pitch_modulation_depth != 0 || self.amplitude_modulation_depth != 0);
    }

    pub fn set_pitch_modulation(&mut self, depth: i32) {
        self.pitch_modulation_depth = depth;
        self.pm_output_level = (((self.common.lfo_wave_table[self.common.lfo_phase] << 1) - 255)
            * self.pitch_modulation_depth)
            >> 8;
        self.set_lfo_state(self.pitch_modulation_depth != 0 || self.amplitude_modulation_depth != 0);
        if self.pitch_modulation_depth == 0 {
            for op in &mut self.operators {
                op.set_pm_detune(0);
            }
        }
    }

    // ---- OPM register interface ----

    pub fn set_channel_number(&mut self, value: i32) {
        self.register_map_channel = value;
    }

    /// Hardware-register style parameter write (OPM register map).
    pub fn set_register(&mut self, address: i32, data: i32) {
        if address < 0x20 {
            match address {
                15 => {
                    // NOIZE:7 FREQ:4-0 for channel #7
                    if self.register_map_channel == 7
                        && self.operator_count == 4
                        && (data & 128) != 0
                    {
                        self.operators[3].set_pulse_generator_type(
                            PulseGeneratorType::Noise as i32,
                        );
                        self.operators[3].set_pitch_table_type(PitchTableType::OpmNoise);
                        self.operators[3].set_pitch_index(((data & 31) << 6) + 2048);
                    }
                }
                24 => {
                    // LFO FREQ:7-0
                    let step = RefTables::get().lfo_timer_steps[(data & 255) as usize];
                    self.common.lfo_timer = i32::from(step > 0);
                    self.common.lfo_timer_step = step;
                    self.common.lfo_timer_step_buffer = step;
                }
                25 => {
                    // A(0)/P(1):7 DEPTH:6-0
                    if (data & 128) != 0 {
                        self.opm_pmd = data & 127;
                    } else {
                        self.opm_amd = data & 127;
                    }
                }
                27 => {
                    // LFO WS:1-0
                    self.initialize_lfo(data & 3);
                }
                _ => {}
            }
            return;
        }

        if self.register_map_channel != (address & 7) {
            return;
        }

        if address < 0x40 {
            match (address - 0x20) >> 3 {
                0 => {
                    // L:7 R:6 FB:5-3 ALG:2-0
                    self.set_algorithm(4, false, data & 7);
                    self.set_feedback((data >> 3) & 7, 0);
                    let lr = data >> 6;
                    self.common.volumes[0] = if lr != 0 { 0.5 } else { 0.0 };
                    self.common.pan = match lr {
                        1 => 128,
                        2 => 0,
                        _ => 64,
                    };
                }
                1 => {
                    // KC:6-0
                    for i in 0..4 {
                        self.operators[i].set_key_code(data & 127);
                    }
                }
                2 => {
                    // KF:6-0
                    for i in 0..4 {
                        self.operators[i].set_key_fraction(data & 127);
                    }
                }
                3 => {
                    // PMS:6-4 AMS:1-0
                    let pitch_mod_shift = (data >> 4) & 7;
                    let amplitude_mod_shift = data & 3;
                    if (data & 128) != 0 {
                        let depth = if pitch_mod_shift < 6 {
                            self.opm_pmd >> (6 - pitch_mod_shift)
                        } else {
                            self.opm_pmd << (pitch_mod_shift - 5)
                        };
                        self.set_pitch_modulation(depth);
                    } else {
                        let depth = if amplitude_mod_shift > 0 {
                            self.opm_amd << (amplitude_mod_shift - 1)
                        } else {
                            0
                        };
                        self.set_amplitude_modulation(depth);
                    }
                }
                _ => {}
            }
            return;
        }

        // Operator parameters. Register order swaps the middle operators.
        let ops = [0usize, 2, 1, 3];
        let op_index = ops[((address >> 3) & 3) as usize];
        let op = &mut self.operators[op_index];
        match (address - 0x40) >> 5 {
            0 => {
                // DT1:6-4 MUL:3-0
                op.set_detune1((data >> 4) & 7);
                op.set_multiple(data & 15);
            }
            1 => op.set_total_level(data & 127),
            2 => {
                // KS:7-6 AR:4-0
                op.set_key_scaling_rate((data >> 6) & 3);
                op.set_attack_rate((data & 31) << 1);
            }
            3 => {
                // AMS:7 DR:4-0
                op.set_amplitude_modulation_shift(((data >> 7) & 1) << 1);
                op.set_decay_rate((data & 31) << 1);
            }
            4 => {
                // DT2:7-6 SR:4-0
                let options = [0, 384, 500, 608];
                op.set_ptss_detune(options[((data >> 6) & 3) as usize]);
                op.set_sustain_rate((data & 31) << 1);
            }
            5 => {
                // SL:7-4 RR:3-0
                op.set_sustain_level((data >> 4) & 15);
                op.set_release_rate((data & 15) << 2);
            }
            _ => {}
        }
    }

    // ---- Processing ----

    #[inline]
    fn is_stereo_super_mode(&self) -> bool {
        self.process_type == ProcessType::Op1
            && self.operators[self.active_operator].super_stereo_spread() > 0
            && self.operators[self.active_operator].super_count() > 1
    }

    /// Advance the LFO one sample and push pitch modulation to operators.
    #[inline]
    fn update_lfo(&mut self, op_count: usize) {
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

        if self.pitch_modulation_depth != 0 {
            for i in 0..op_count {
                self.operators[i].set_pm_detune(self.pm_output_level);
            }
        }
        self.common.lfo_timer += self.common.lfo_timer_initial;
    }

    #[inline]
    fn channel_input(&self, ctx: &RenderContext, pos: usize) -> i32 {
        match self.common.input_mode {
            InputMode::Zero => 0,
            InputMode::Pipe => ctx.pipes.read(self.common.in_pipe, pos),
            InputMode::Feedback => {
                self.feedback_connection
                    .map_or(0, |connection| self.operators[connection].feed_out)
            }
        }
    }

    #[inline]
    fn external_base(&self, ctx: &RenderContext, pos: usize) -> i32 {
        if self.common.output_mode == OutputMode::Add {
            ctx.pipes.read_out(self.common.out_pipe, pos)
        } else {
            0
        }
    }

    /// Generic operator-graph loop for 1..=4 operators.
    fn process_operators(&mut self, ctx: &mut RenderContext, length: usize) {
        let count = self.operator_count;
        let eg_timer_initial = self.common.eg_timer_initial;
        let input_level = self.common.input_level;
        let stereo_mode = self.is_stereo_super_mode();
        let start = self.common.buffer_index;

        for i in 0..length {
            let pos = start + i;
            let ch_in = self.channel_input(ctx, pos);
            self.update_lfo(count);

            let mut p0 = 0i32;
            let mut p1 = 0i32;

            if stereo_mode {
                // Single-operator stereo supersaw path.
                let am_output_level = self.am_output_level;
                let (left, right) = {
                    let op = &mut self.operators[0];
                    op.tick_eg(eg_timer_initial);
                    op.tick_pulse_generator(0);
                    let am_level = am_output_level >> op.am_shift();
                    let (left, right, _) = op.super_output_stereo(ch_in, input_level, am_level);
                    // Feedback reads the mono mix.
                    op.feed_out = (left + right) >> 1;
                    (left, right)
                };
                self.stereo_left[pos] = left;
                self.stereo_right[pos] = right;
                continue;
            }

            for op_index in 0..count {
                let am_output_level = self.am_output_level;
                let op = &mut self.operators[op_index];
                op.tick_eg(eg_timer_initial);
                op.tick_pulse_generator(0);

                let am_level = am_output_level >> op.am_shift();
                let (fm_input, level) = match op.routing.input {
                    crate::pipe::OpInput::Channel => (ch_in, input_level),
                    crate::pipe::OpInput::Pipe0 => (p0, op.fm_shift()),
                    crate::pipe::OpInput::Pipe1 => (p1, op.fm_shift()),
                    crate::pipe::OpInput::Zero => (0, 0),
                };
                let output = op.super_output(fm_input, level, am_level);
                op.feed_out = output;

                let base = match op.routing.base {
                    crate::pipe::OpBase::Zero => 0,
                    crate::pipe::OpBase::Output => match op.routing.output {
                        crate::pipe::OpOutput::Pipe0 => p0,
                        crate::pipe::OpOutput::Pipe1 => p1,
                    },
                };
                match op.routing.output {
                    crate::pipe::OpOutput::Pipe0 => p0 = output + base,
                    crate::pipe::OpOutput::Pipe1 => p1 = output + base,
                }
            }

            let value = p0 + self.external_base(ctx, pos);
            ctx.pipes.write(self.common.out_pipe, pos, value);
        }
    }

    /// Analog-like pair: operator 1 follows operator 0's envelope.
    fn process_analog_like(&mut self, ctx: &mut RenderContext, length: usize) {
        let eg_timer_initial = self.common.eg_timer_initial;
        let input_level = self.common.input_level;
        let start = self.common.buffer_index;

        for i in 0..length {
            let pos = start + i;
            let ch_in = self.channel_input(ctx, pos);
            self.update_lfo(2);

            let (head, tail) = self.operators.split_at_mut(1);
            let op0 = &mut head[0];
            let op1 = &mut tail[0];

            op0.tick_eg(eg_timer_initial);
            op1.update_eg_output_from(op0);

            op0.tick_pulse_generator(0);
            let am_level = self.am_output_level >> op0.am_shift();
            let output0 = op0.super_output(ch_in, input_level, am_level);

            op1.tick_pulse_generator(0);
            let output1 = op1.super_output(0, 0, am_level);

            op0.feed_out = output0;

            let value = output0 + output1 + self.external_base(ctx, pos);
            ctx.pipes.write(self.common.out_pipe, pos, value);
        }
    }

    /// Ring modulation of the two operators' waveforms through one lookup.
    fn process_ring(&mut self, ctx: &mut RenderContext, length: usize) {
        let tables = RefTables::get();
        let eg_timer_initial = self.common.eg_timer_initial;
        let input_level = self.common.input_level;
        let start = self.common.buffer_index;

        for i in 0..length {
            let pos = start + i;
            let ch_in = self.channel_input(ctx, pos);
            self.update_lfo(2);

            let (head, tail) = self.operators.split_at_mut(1);
            let op0 = &mut head[0];
            let op1 = &mut tail[0];

            op0.tick_eg(eg_timer_initial);
            op1.update_eg_output_from(op0);

            op0.tick_pulse_generator(0);
            let phase0 = op0.phase() + ((ch_in as i64) << input_level);
            let t0 = ((phase0 & PHASE_FILTER) >> op0.wave_fixed_bits()) as usize;
            let mut log_index = op0.wave_value(t0);

            op1.tick_pulse_generator(0);
            let t1 = ((op1.phase() & PHASE_FILTER) >> op1.wave_fixed_bits()) as usize;
            log_index += op1.wave_value(t1);
            log_index += op1.eg_output() + (self.am_output_level >> op0.am_shift());
            let output = tables.log_lookup(log_index);

            op0.feed_out = output;

            let value = output + self.external_base(ctx, pos);
            ctx.pipes.write(self.common.out_pipe, pos, value);
        }
    }

    /// Hard sync: operator 0 wrapping resets operator 1's phase.
    fn process_sync(&mut self, ctx: &mut RenderContext, length: usize) {
        let tables = RefTables::get();
        let eg_timer_initial = self.common.eg_timer_initial;
        let input_level = self.common.input_level;
        let start = self.common.buffer_index;

        for i in 0..length {
            let pos = start + i;
            let ch_in = self.channel_input(ctx, pos);
            self.update_lfo(2);

            let (head, tail) = self.operators.split_at_mut(1);
            let op0 = &mut head[0];
            let op1 = &mut tail[0];

            op0.tick_eg(eg_timer_initial);
            op1.update_eg_output_from(op0);

            op0.tick_pulse_generator((ch_in as i64) << input_level);
            if (op0.phase() & PHASE_MAX) != 0 {
                op1.set_phase(op1.key_on_phase_raw());
            }
            op0.set_phase(op0.phase() & PHASE_FILTER);

            op1.tick_pulse_generator(0);
            let t = ((op1.phase() & PHASE_FILTER) >> op1.wave_fixed_bits()) as usize;
            let mut log_index = op1.wave_value(t);
            log_index += op1.eg_output() + (self.am_output_level >> op0.am_shift());
            let output = tables.log_lookup(log_index);

            op0.feed_out = output;

            let value = output + self.external_base(ctx, pos);
            ctx.pipes.write(self.common.out_pipe, pos, value);
        }
    }

    /// One-operator PCM playback with end/loop points.
    fn process_pcm(&mut self, ctx: &mut RenderContext, length: usize) {
        let tables = RefTables::get();
        let eg_timer_initial = self.common.eg_timer_initial;
        let input_level = self.common.input_level;
        let start = self.common.buffer_index;

        let mut i = 0usize;
        while i < length {
            let pos = start + i;
            let ch_in = self.channel_input(ctx, pos);
            self.update_lfo(1);

            let am_output_level = self.am_output_level;
            let output = {
                let op = &mut self.operators[0];
                op.tick_eg(eg_timer_initial);
                op.tick_pulse_generator(0);

                let modulated = op.phase() + ((ch_in as i64) << input_level);
                let mut t = (modulated >> op.wave_fixed_bits()) as i32;

                if t >= op.pcm_end_point() {
                    if op.pcm_loop_point() == -1 {
                        op.force_eg_off();
                        None
                    } else {
                        let span = op.pcm_end_point() - op.pcm_loop_point();
                        t -= span;
                        op.adjust_phase(-((span as i64) << op.wave_fixed_bits()));
                        Some(t)
                    }
                } else {
                    Some(t)
                }
                .map(|t| {
                    let mut log_index = op.wave_value_pcm(t.max(0) as usize);
                    log_index += op.eg_output() + (am_output_level >> op.am_shift());
                    let output = tables.log_lookup(log_index);
                    op.feed_out = output;
                    output
                })
            };

            match output {
                Some(output) => {
                    let value = output + self.external_base(ctx, pos);
                    ctx.pipes.write(self.common.out_pipe, pos, value);
                    i += 1;
                }
                None => {
                    // One-shot end: fast forward the rest of the block.
                    for j in i..length {
                        let pos = start + j;
                        let value = self.external_base(ctx, pos);
                        ctx.pipes.write(self.common.out_pipe, pos, value);
                    }
                    break;
                }
            }
        }
    }

    // ---- Note events ----

    pub fn note_on(&mut self) {
        // A note-on while the channel is active is a voice steal from the
        // channel's point of view; the operators defer their attack and
        // phase reset until the envelope reaches near-silence.
        let is_voice_steal = self.common.is_note_on && !self.common.is_idling;
        for i in 0..self.operator_count {
            self.operators[i].set_voice_steal_hint(is_voice_steal);
            self.operators[i].note_on();
        }
        self.common.note_on();
        self.common.is_idling = false;
    }

    pub fn note_off(&mut self) {
        for i in 0..self.operator_count {
            self.operators[i].note_off();
        }
        self.common.note_off();
    }

    pub fn reset_channel_buffer_status(&mut self) {
        self.common.buffer_index = 0;
        let mut idling = true;
        for i in 0..self.operator_count {
            let op = &self.operators[i];
            if op.is_final()
                && (op.eg_output() < IDLING_THRESHOLD || op.eg_state() == EgState::Attack)
            {
                idling = false;
                break;
            }
        }
        if self.common.kill_fade_remaining() > 0 {
            idling = false;
        }
        self.common.is_idling = idling;
    }

    // ---- Block generation ----

    pub fn buffer(&mut self, ctx: &mut RenderContext, length: usize) {
        if self.common.is_idling {
            self.common.buffer_index += length;
            return;
        }

        let stereo_mode = self.is_stereo_super_mode();
        let start = self.common.buffer_index;

        match self.process_type {
            ProcessType::Op1 | ProcessType::Op2 | ProcessType::Op3 | ProcessType::Op4 => {
                self.process_operators(ctx, length)
            }
            ProcessType::AnalogLike => self.process_analog_like(ctx, length),
            ProcessType::Ring => self.process_ring(ctx, length),
            ProcessType::Sync => self.process_sync(ctx, length),
            ProcessType::Pcm => self.process_pcm(ctx, length),
        }

        // Post-voice DSP.
        if stereo_mode {
            if let Some(ring) = self.common.ring_pipe {
                let ring_slice = ctx.pipes.slice(ring, start, length);
                self.common
                    .apply_ring_modulation(&mut self.stereo_left[start..start + length], ring_slice);
                self.common
                    .apply_ring_modulation(&mut self.stereo_right[start..start + length], ring_slice);
            }
            if self.common.filter_on {
                let (left, right) = stereo_lanes(
                    &mut self.stereo_left,
                    &mut self.stereo_right,
                    start,
                    length,
                );
                self.common.apply_sv_filter_stereo(left, right);
            }
            if self.common.kill_fade_remaining() > 0 {
                let (left, right) = stereo_lanes(
                    &mut self.stereo_left,
                    &mut self.stereo_right,
                    start,
                    length,
                );
                if self.common.apply_kill_fade_stereo(left, right) {
                    self.reset();
                }
            }
        } else {
            if let Some(ring) = self.common.ring_pipe {
                let (out, ring_pipe) = ctx.pipes.pipe_pair(self.common.out_pipe, ring);
                self.common.apply_ring_modulation(
                    &mut out[start..start + length],
                    &ring_pipe[start..start + length],
                );
            }
            if self.common.filter_on {
                let out = ctx.pipes.slice_mut(self.common.out_pipe, start, length);
                self.common.apply_sv_filter(out, false);
            }
            if self.common.kill_fade_remaining() > 0 {
                let out = ctx.pipes.slice_mut(self.common.out_pipe, start, length);
                if self.common.apply_kill_fade(out) {
                    self.reset();
                }
            }
        }

        // Mix into streams.
        if self.common.output_mode == OutputMode::Standard && !self.common.mute {
            let volume_coef = self.common.instrument_gain;
            if stereo_mode {
                let RenderContext { bank, slot_targets, .. } = ctx;
                self.common.write_stream_stereo(
                    bank,
                    slot_targets,
                    &self.stereo_left[start..start + length],
                    &self.stereo_right[start..start + length],
                    length,
                    volume_coef,
                    self.common.pan,
                );
            } else {
                let RenderContext {
                    pipes,
                    bank,
                    slot_targets,
                    ..
                } = ctx;
                let out = pipes.slice(self.common.out_pipe, start, length);
                self.common.write_stream_mono(
                    bank,
                    slot_targets,
                    out,
                    length,
                    volume_coef,
                    self.common.pan,
                );
            }
        }

        // Stereo mode keeps a mono mix in the scratch pipe for metering and
        // downstream ring-mod readers.
        if stereo_mode {
            for i in 0..length {
                let mono = (self.stereo_left[start + i] + self.stereo_right[start + i]) >> 1;
                ctx.pipes.write(self.common.out_pipe, start + i, mono);
            }
        }

        self.common.buffer_index += length;
    }
}

/// Split the stereo lanes into mutable block regions.
fn stereo_lanes<'a>(
    left: &'a mut [i32],
    right: &'a mut [i32],
    start: usize,
    length: usize,
) -> (&'a mut [i32], &'a mut [i32]) {
    (
        &mut left[start..start + length],
        &mut right[start..start + length],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ChipPipes;
    use crate::stream::{StreamBank, MASTER_STREAM};
    use cf_core::SampleRate;

    const LEN: usize = 256;

    fn context<'a>(pipes: &'a mut ChipPipes, bank: &'a mut StreamBank) -> RenderContext<'a> {
        RenderContext {
            pipes,
            bank,
            slot_targets: &[MASTER_STREAM; 4],
            bpm: 120.0,
            sampler_volume: 1.0,
        }
    }

    fn setup() -> (FmChannel, ChipPipes, StreamBank) {
        RefTables::initialize(SampleRate::Hz48000);
        (
            FmChannel::new(LEN),
            ChipPipes::new(LEN),
            StreamBank::new(LEN, 2),
        )
    }

    fn render_block(ch: &mut FmChannel, pipes: &mut ChipPipes, bank: &mut StreamBank) {
        ch.reset_channel_buffer_status();
        let mut ctx = context(pipes, bank);
        ch.buffer(&mut ctx, LEN);
    }

    #[test]
    fn test_single_operator_produces_audio() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_algorithm(1, false, 0);
        ch.set_pitch(60 << 6);
        ch.note_on();

        let mut peak = 0f64;
        for _ in 0..64 {
            bank.clear_all();
            render_block(&mut ch, &mut pipes, &mut bank);
            for &value in bank.get(MASTER_STREAM).buffer() {
                peak = peak.max(value.abs());
            }
        }
        assert!(peak > 0.01, "channel produced silence, peak {peak}");
    }

    #[test]
    fn test_carrier_masks_match_routing() {
        let (mut ch, ..) = setup();
        for count in 1..=4usize {
            let algorithms: usize = match count {
                1 => 1,
                2 => 3,
                3 => 7,
                _ => 13,
            };
            for alg in 0..algorithms {
                ch.set_algorithm(count, false, alg as i32);
                assert_eq!(
                    ch.carrier_mask(),
                    CARRIER_MASKS[count - 1][alg],
                    "mask mismatch for {count} ops, algorithm {alg}"
                );
            }
        }
    }

    #[test]
    fn test_set_algorithm_short_circuits() {
        let (mut ch, ..) = setup();
        ch.set_algorithm(4, false, 4);
        ch.active_operator().set_total_level(55);
        // Same triple must not rewire (which would reset feed pipes etc.).
        ch.set_algorithm(4, false, 4);
        assert_eq!(ch.operator_count(), 4);
        assert_eq!(ch.algorithm(), 4);
    }

    #[test]
    fn test_operator_count_change_preserves_slots() {
        let (mut ch, ..) = setup();
        ch.set_algorithm(4, false, 0);
        assert_eq!(ch.operator_count(), 4);
        ch.set_algorithm(1, false, 0);
        assert_eq!(ch.operator_count(), 1);
        // Deactivated operators must be silent.
        assert_eq!(ch.operator(3).eg_state(), EgState::Off);
    }

    #[test]
    fn test_idle_channel_skips_dsp() {
        let (mut ch, mut pipes, mut bank) = setup();
        render_block(&mut ch, &mut pipes, &mut bank);
        assert!(ch.common.is_idling);
        for &value in bank.get(MASTER_STREAM).buffer() {
            assert_eq!(value, 0.0);
        }
    }

    #[test]
    fn test_note_off_decays_to_idle() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_algorithm(1, false, 0);
        // Audible release so the decay is observable but finite.
        ch.active_operator().set_release_rate(48);
        ch.set_pitch(69 << 6);
        ch.note_on();
        for _ in 0..8 {
            bank.clear_all();
            render_block(&mut ch, &mut pipes, &mut bank);
        }
        ch.note_off();
        let mut became_idle = false;
        for _ in 0..2000 {
            bank.clear_all();
            render_block(&mut ch, &mut pipes, &mut bank);
            if ch.common.is_idling {
                became_idle = true;
                break;
            }
        }
        assert!(became_idle, "release never reached idle");
    }

    #[test]
    fn test_voice_steal_output_decays_before_attack() {
        let (mut ch, mut pipes, mut bank) = setup();
        ch.set_algorithm(1, false, 0);
        ch.active_operator().set_attack_rate(40);
        ch.set_pitch(60 << 6);
        ch.note_on();
        for _ in 0..32 {
            bank.clear_all();
            render_block(&mut ch, &mut pipes, &mut bank);
        }

        // Steal with a new note; output must never jump discontinuously.
        ch.set_pitch(72 << 6);
        ch.note_on();
        let mut previous = None::<f64>;
        for _ in 0..8 {
            bank.clear_all();
            render_block(&mut ch, &mut pipes, &mut bank);
            for frame in bank.get(MASTER_STREAM).buffer().chunks_exact(2) {
                if let Some(prev) = previous {
                    let delta = (frame[0] - prev).abs();
                    assert!(delta < 0.25, "click-sized step {delta} during steal");
                }
                previous = Some(frame[0]);
            }
        }
    }

    #[test]
    fn test_opm_register_algorithm_write() {
        let (mut ch, ..) = setup();
        ch.set_channel_number(1);
        // Address 0x21 row 0 for channel 1: L+R on, FB 2, ALG 3.
        ch.set_register(0x21, 0b11_010_011);
        assert_eq!(ch.operator_count(), 4);
        assert_eq!(ch.algorithm(), 3);
        let (fb_level, fb_connection) = ch.feedback();
        assert_eq!(fb_level, 2);
        assert_eq!(fb_connection, 0);
    }
}
