//! Channel parameter block: a plain value set describing a complete voice,
//! applied to any channel kind in one call.

use crate::channel::LfoTimeMode;
use crate::fm_channel::FmChannel;
use crate::operator::OperatorParams;
use crate::sampler_channel::SamplerChannel;
use crate::stream::STREAM_SEND_SIZE;

#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub operator_count: usize,
    pub analog_like: bool,
    pub algorithm: i32,
    pub feedback: i32,
    pub feedback_connection: usize,
    pub envelope_frequency_ratio: i32,

    pub lfo_wave_shape: i32,
    pub lfo_time_mode: LfoTimeMode,
    /// Raw timer step, milliseconds, or beat division depending on the mode.
    pub lfo_value: i32,
    pub amplitude_modulation_depth: i32,
    pub pitch_modulation_depth: i32,

    pub master_volumes: [f64; STREAM_SEND_SIZE],
    pub instrument_gain_db: i32,
    /// Stored 0..=128 like the channel.
    pub pan: i32,

    pub filter_type: i32,
    pub filter_cutoff: i32,
    pub filter_resonance: i32,
    pub filter_attack_rate: i32,
    pub filter_decay_rate1: i32,
    pub filter_decay_rate2: i32,
    pub filter_release_rate: i32,
    pub filter_decay_offset1: i32,
    pub filter_decay_offset2: i32,
    pub filter_sustain_offset: i32,
    pub filter_release_offset: i32,

    // Sampler amplitude envelope.
    pub amp_attack_rate: i32,
    pub amp_decay_rate: i32,
    pub amp_sustain_level: i32,
    pub amp_release_rate: i32,

    pub operators: [OperatorParams; 4],
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            operator_count: 1,
            analog_like: false,
            algorithm: 0,
            feedback: 0,
            feedback_connection: 0,
            envelope_frequency_ratio: 100,
            lfo_wave_shape: 0,
            lfo_time_mode: LfoTimeMode::Rate,
            lfo_value: 0,
            amplitude_modulation_depth: 0,
            pitch_modulation_depth: 0,
            master_volumes: [0.5, 0.0, 0.0, 0.0],
            instrument_gain_db: 0,
            pan: 64,
            filter_type: 0,
            filter_cutoff: 128,
            filter_resonance: 0,
            filter_attack_rate: 0,
            filter_decay_rate1: 0,
            filter_decay_rate2: 0,
            filter_release_rate: 0,
            filter_decay_offset1: 128,
            filter_decay_offset2: 64,
            filter_sustain_offset: 32,
            filter_release_offset: 128,
            amp_attack_rate: 63,
            amp_decay_rate: 0,
            amp_sustain_level: 128,
            amp_release_rate: 32,
            operators: std::array::from_fn(|_| OperatorParams::default()),
        }
    }
}

impl FmChannel {
    pub fn set_channel_params(
        &mut self,
        params: &ChannelParams,
        with_volume: bool,
        with_modulation: bool,
        bpm: f64,
    ) {
        if params.operator_count == 0 {
            return;
        }

        self.set_algorithm(params.operator_count, params.analog_like, params.algorithm);
        self.common.set_frequency_ratio(params.envelope_frequency_ratio);
        self.set_feedback(params.feedback, params.feedback_connection);

        if with_modulation {
            self.initialize_lfo(params.lfo_wave_shape);
            self.common.set_lfo_time_mode(params.lfo_time_mode, bpm);
            self.common.set_lfo_frequency_step(params.lfo_value, bpm);
            self.set_amplitude_modulation(params.amplitude_modulation_depth);
            self.set_pitch_modulation(params.pitch_modulation_depth);
        }

        if with_volume {
            self.common.volumes = params.master_volumes;
            self.common.has_effect_send =
                params.master_volumes[1..].iter().any(|&volume| volume > 0.0);
            self.common.pan = params.pan.clamp(0, 128);
        }
        self.common.set_instrument_gain_db(params.instrument_gain_db);

        self.common.set_filter_type(params.filter_type);
        self.common.set_sv_filter(
            params.filter_cutoff,
            params.filter_resonance,
            params.filter_attack_rate,
            params.filter_decay_rate1,
            params.filter_decay_rate2,
            params.filter_release_rate,
            params.filter_decay_offset1,
            params.filter_decay_offset2,
            params.filter_sustain_offset,
            params.filter_release_offset,
        );

        for i in 0..self.operator_count() {
            self.set_active_operator_index(i);
            self.active_operator().set_operator_params(&params.operators[i]);
        }
        self.set_active_operator_index(self.operator_count() - 1);
    }

    pub fn channel_params(&self) -> ChannelParams {
        let mut params = ChannelParams {
            operator_count: self.operator_count(),
            algorithm: self.algorithm(),
            envelope_frequency_ratio: self.common.frequency_ratio,
            lfo_wave_shape: self.common.lfo_wave_shape,
            lfo_time_mode: self.common.lfo_time_mode,
            lfo_value: self.common.lfo_timer_step_buffer,
            master_volumes: self.common.volumes,
            instrument_gain_db: self.common.instrument_gain_db(),
            pan: self.common.pan,
            filter_type: self.common.filter_type as i32,
            ..ChannelParams::default()
        };
        let (feedback, feedback_connection) = self.feedback();
        params.feedback = feedback;
        params.feedback_connection = feedback_connection;
        for i in 0..self.operator_count() {
            params.operators[i] = self.operator(i).operator_params();
        }
        params
    }
}

impl SamplerChannel {
    pub fn set_channel_params(
        &mut self,
        params: &ChannelParams,
        with_volume: bool,
        with_modulation: bool,
        bpm: f64,
    ) {
        if params.operator_count == 0 {
            return;
        }

        self.set_frequency_ratio(params.envelope_frequency_ratio);
        if with_modulation {
            self.initialize_lfo(params.lfo_wave_shape);
            self.common.set_lfo_time_mode(params.lfo_time_mode, bpm);
            self.common.set_lfo_frequency_step(params.lfo_value, bpm);
            self.set_amplitude_modulation(params.amplitude_modulation_depth);
            self.set_pitch_modulation(params.pitch_modulation_depth);
        }

        if with_volume {
            self.common.volumes = params.master_volumes;
            self.common.has_effect_send =
                params.master_volumes[1..].iter().any(|&volume| volume > 0.0);
            self.common.pan = params.pan.clamp(0, 128);
        }
        self.common.set_instrument_gain_db(params.instrument_gain_db);

        self.common.set_filter_type(params.filter_type);
        self.common.set_sv_filter(
            params.filter_cutoff,
            params.filter_resonance,
            params.filter_attack_rate,
            params.filter_decay_rate1,
            params.filter_decay_rate2,
            params.filter_release_rate,
            params.filter_decay_offset1,
            params.filter_decay_offset2,
            params.filter_sustain_offset,
            params.filter_release_offset,
        );

        self.set_amp_attack_rate(params.amp_attack_rate);
        self.set_amp_decay_rate(params.amp_decay_rate);
        self.set_amp_sustain_level(params.amp_sustain_level);
        self.set_amp_release_rate(params.amp_release_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;
    use cf_tables::RefTables;

    #[test]
    fn test_apply_round_trip_core_fields() {
        RefTables::initialize(SampleRate::Hz48000);
        let mut channel = FmChannel::new(256);
        let mut params = ChannelParams {
            operator_count: 4,
            algorithm: 4,
            feedback: 3,
            pan: 96,
            instrument_gain_db: -6,
            ..ChannelParams::default()
        };
        params.operators[0].total_level = 12;

        channel.set_channel_params(&params, true, true, 120.0);
        let got = channel.channel_params();
        assert_eq!(got.operator_count, 4);
        assert_eq!(got.algorithm, 4);
        assert_eq!(got.feedback, 3);
        assert_eq!(got.pan, 96);
        assert_eq!(got.instrument_gain_db, -6);
        assert_eq!(got.operators[0].total_level, 12);
    }
}
