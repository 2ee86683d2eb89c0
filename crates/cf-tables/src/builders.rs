//! Table construction. Runs once at startup; nothing here is hot.

use crate::*;

const LOG_TABLE_FULL: usize = LOG_TABLE_SIZE * 3;

/// Convert a normalized amplitude in [-1, 1] to a sign-interleaved log index.
pub fn amplitude_to_log_index(value: f64) -> i32 {
    let sign = if value < 0.0 { 1 } else { 0 };
    let mag = value.abs();
    if mag < 1e-8 {
        // Effectively silent; park on a deep (zero) entry of matching sign.
        return ((LOG_TABLE_FULL as i32 - 2) & !1) | sign;
    }
    let index = (-mag.log2() * LOG_TABLE_RESOLUTION as f64).round() as i32;
    let index = index.clamp(0, (LOG_TABLE_FULL / 2 - 1) as i32);
    (index << 1) | sign
}

fn build_log_table() -> Box<[i32]> {
    let mut table = vec![0i32; LOG_TABLE_FULL];
    for (i, entry) in table.iter_mut().enumerate() {
        let mag_index = (i >> 1) as f64 / LOG_TABLE_RESOLUTION as f64;
        let value = (SAMPLE_MAX as f64 * 2f64.powf(-mag_index)).round() as i32;
        *entry = if i & 1 == 0 { value } else { -value };
    }
    table.into_boxed_slice()
}

fn wavelet_from_fn(f: impl Fn(f64) -> f64) -> Box<[i32]> {
    let mut wavelet = vec![0i32; WAVELET_SIZE];
    for (i, entry) in wavelet.iter_mut().enumerate() {
        let phase = (i as f64 + 0.5) / WAVELET_SIZE as f64;
        *entry = amplitude_to_log_index(f(phase));
    }
    wavelet.into_boxed_slice()
}

fn build_wave_tables() -> Vec<WaveTable> {
    let fixed_bits = PHASE_BITS - WAVELET_BITS;
    let two_pi = std::f64::consts::TAU;

    let sine = wavelet_from_fn(|p| (p * two_pi).sin());
    let saw = wavelet_from_fn(|p| 2.0 * p - 1.0);
    let triangle = wavelet_from_fn(|p| {
        if p < 0.25 {
            4.0 * p
        } else if p < 0.75 {
            2.0 - 4.0 * p
        } else {
            4.0 * p - 4.0
        }
    });
    let square = wavelet_from_fn(|p| if p < 0.5 { 1.0 } else { -1.0 });

    // Full-scale random signs, deterministic across runs.
    let mut state = 0x2463_0641u32;
    let mut noise = vec![0i32; WAVELET_SIZE];
    for entry in noise.iter_mut() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        *entry = ((state >> 16) & 1) as i32;
    }

    let table = |wavelet: Box<[i32]>, pt: PitchTableType| WaveTable {
        wavelet,
        fixed_bits,
        default_pitch_table: pt,
    };

    vec![
        table(sine, PitchTableType::Opm),
        table(saw, PitchTableType::Opm),
        table(triangle, PitchTableType::Opm),
        table(square, PitchTableType::Opm),
        table(noise.into_boxed_slice(), PitchTableType::OpmNoise),
    ]
}

fn note_frequency(note: f64) -> f64 {
    440.0 * 2f64.powf((note - 69.0) / 12.0)
}

fn build_pitch_table_opm(sample_rate: u32) -> Box<[i32]> {
    let mut table = vec![0i32; 128 * 64];
    for (i, entry) in table.iter_mut().enumerate() {
        let freq = note_frequency(i as f64 / 64.0);
        *entry = (freq * PHASE_MAX as f64 / sample_rate as f64).round() as i32;
    }
    table.into_boxed_slice()
}

fn build_pitch_table_pcm(sample_rate: u32) -> Box<[i32]> {
    // PCM data is pre-resampled to 48 kHz with note 69 as the 1:1 root.
    let target = cf_core::TARGET_SAMPLE_RATE as f64;
    let mut table = vec![0i32; 128 * 64];
    for (i, entry) in table.iter_mut().enumerate() {
        let ratio = 2f64.powf((i as f64 / 64.0 - 69.0) / 12.0);
        let step = ratio * (1i64 << PCM_FIXED_BITS) as f64 * target / sample_rate as f64;
        *entry = step.round() as i32;
    }
    table.into_boxed_slice()
}

fn build_pitch_table_noise(sample_rate: u32) -> Box<[i32]> {
    // 32 coarse noise rates, 64 fractions each; new random value at `freq` Hz.
    let fixed = (1i64 << (PHASE_BITS - WAVELET_BITS)) as f64;
    let mut table = vec![0i32; 2048];
    for (i, entry) in table.iter_mut().enumerate() {
        let freq = 100.0 * 2f64.powf(i as f64 / 64.0 / 5.0);
        *entry = (freq * fixed / sample_rate as f64).round() as i32;
    }
    table.into_boxed_slice()
}

fn build_dt1_table(sample_rate: u32) -> Box<[[i32; 128]]> {
    let mut table = vec![[0i32; 128]; 8];
    for mag in 0..4usize {
        for kc in 0..128usize {
            let cents = mag as f64 * (0.5 + 2.5 * kc as f64 / 127.0);
            let freq = note_frequency(kc as f64);
            let offset = freq * (2f64.powf(cents / 1200.0) - 1.0) * PHASE_MAX as f64
                / sample_rate as f64;
            let offset = offset.round() as i32;
            table[mag][kc] = offset;
            table[mag + 4][kc] = -offset;
        }
    }
    table.into_boxed_slice()
}

fn build_eg_increment_tables() -> ([[i32; 8]; EG_INCREMENT_ROWS], [[i32; 8]; EG_INCREMENT_ROWS]) {
    // Decay-side rows: increments per EG tick, average 1..8 across rows.
    let mut decay = [[0i32; 8]; EG_INCREMENT_ROWS];
    const DECAY_ROWS: [[i32; 8]; 13] = [
        [1, 1, 1, 1, 1, 1, 1, 1],
        [1, 1, 1, 2, 1, 1, 1, 2],
        [1, 2, 1, 2, 1, 2, 1, 2],
        [1, 2, 2, 2, 1, 2, 2, 2],
        [2, 2, 2, 2, 2, 2, 2, 2],
        [2, 2, 2, 4, 2, 2, 2, 4],
        [2, 4, 2, 4, 2, 4, 2, 4],
        [2, 4, 4, 4, 2, 4, 4, 4],
        [4, 4, 4, 4, 4, 4, 4, 4],
        [4, 4, 4, 8, 4, 4, 4, 8],
        [4, 8, 4, 8, 4, 8, 4, 8],
        [4, 8, 8, 8, 4, 8, 8, 8],
        [8, 8, 8, 8, 8, 8, 8, 8],
    ];
    for (row, values) in DECAY_ROWS.iter().enumerate() {
        decay[row] = *values;
    }
    decay[13] = DECAY_ROWS[12];
    decay[14] = DECAY_ROWS[12];
    decay[15] = DECAY_ROWS[12];
    // Voice-steal fast release.
    decay[EG_FAST_RELEASE_ROW] = [16; 8];
    decay[EG_ZERO_ROW] = [0; 8];

    // Attack-side rows: right-shift amounts for `level -= 1 + (level >> s)`.
    // Smaller shift means a steeper curve; zero entries skip the tick.
    let mut attack = [[0i32; 8]; EG_INCREMENT_ROWS];
    const ATTACK_SHIFTS: [i32; 16] = [13, 12, 12, 11, 11, 10, 10, 9, 9, 8, 8, 7, 7, 7, 3, 2];
    for (row, &shift) in ATTACK_SHIFTS.iter().enumerate() {
        attack[row] = [shift; 8];
    }
    // Slowest row only steps every other tick.
    attack[0] = [13, 0, 13, 0, 13, 0, 13, 0];

    (decay, attack)
}

fn build_eg_timer_steps() -> [i32; 128] {
    let mut steps = [0i32; 128];
    for (i, step) in steps.iter_mut().enumerate().take(64) {
        *step = (88.0 * 2f64.powf(i as f64 / 8.0)).round() as i32;
    }
    steps
}

fn build_eg_level_tables() -> [[i32; ENV_TABLE_SIZE]; 4] {
    let mut tables = [[0i32; ENV_TABLE_SIZE]; 4];
    for i in 0..ENV_TABLE_SIZE {
        let i32i = i as i32;
        tables[0][i] = i32i;
        tables[1][i] = (i32i << 2).min(ENV_BOTTOM);
        tables[2][i] = (ENV_BOTTOM - (i32i << 2)).max(0);
        tables[3][i] = (ENV_BOTTOM - i32i).max(0);
    }
    tables
}

fn build_total_level_tables() -> [[i32; TL_TABLE_SIZE]; VOLUME_MODE_MAX] {
    let mut tables = [[0i32; TL_TABLE_SIZE]; VOLUME_MODE_MAX];
    for i in 0..TL_TABLE_SIZE {
        if i == 0 {
            for table in tables.iter_mut() {
                table[0] = ENV_BOTTOM;
            }
            continue;
        }
        let norm = i as f64 / 256.0;
        // One envelope unit is 1/64 octave (~0.094 dB).
        tables[VolumeMode::Linear as usize][i] =
            (-norm.log2() * 64.0).round().clamp(-512.0, ENV_BOTTOM as f64) as i32;
        for (mode, range_db) in [(VolumeMode::Db48, 48.0), (VolumeMode::Db96, 96.0)] {
            let db = (norm - 1.0) * range_db;
            tables[mode as usize][i] =
                (-db / 0.09375).round().clamp(-512.0, ENV_BOTTOM as f64) as i32;
        }
    }
    tables
}

fn build_linear_to_total_level() -> [i32; 129] {
    let mut table = [0i32; 129];
    table[0] = 127;
    for (i, entry) in table.iter_mut().enumerate().skip(1) {
        *entry = (-(i as f64 / 128.0).log2() * 8.0).round().min(127.0) as i32;
    }
    table
}

fn build_pan_table() -> [f64; 129] {
    let mut table = [0.0f64; 129];
    for (i, entry) in table.iter_mut().enumerate() {
        *entry = (i as f64 * std::f64::consts::PI / 256.0).sin();
    }
    table
}

fn build_lfo_wave_tables() -> [[i32; LFO_TABLE_SIZE]; LFO_WAVE_MAX] {
    let mut tables = [[0i32; LFO_TABLE_SIZE]; LFO_WAVE_MAX];
    let mut state = 0x0bad_cafeu32;
    for i in 0..LFO_TABLE_SIZE {
        let i32i = i as i32;
        tables[LfoWaveShape::Triangle as usize][i] =
            if i < 128 { i32i * 2 } else { 510 - i32i * 2 };
        tables[LfoWaveShape::Saw as usize][i] = i32i;
        tables[LfoWaveShape::Square as usize][i] = if i < 128 { 255 } else { 0 };
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        tables[LfoWaveShape::Noise as usize][i] = ((state >> 16) & 255) as i32;
    }
    tables
}

fn build_lfo_timer_steps(sample_rate: u32) -> [i32; 256] {
    let mut steps = [0i32; 256];
    for (i, step) in steps.iter_mut().enumerate() {
        // OPM-style LFO frequency curve: 0.008 Hz .. ~50 Hz.
        let freq = 0.008 * 2f64.powf(i as f64 / 16.0);
        let phase_steps_per_sec = freq * LFO_TABLE_SIZE as f64;
        *step = (LFO_TIMER_INITIAL as f64 * phase_steps_per_sec / sample_rate as f64)
            .round() as i32;
    }
    steps
}

fn build_filter_cutoff_table() -> [f64; 129] {
    let mut table = [0.0f64; 129];
    for (i, entry) in table.iter_mut().enumerate() {
        *entry = (i * i) as f64 / 16384.0;
    }
    table
}

fn build_filter_eg_rate() -> [i32; 64] {
    let mut table = [0i32; 64];
    for (i, entry) in table.iter_mut().enumerate().skip(1) {
        *entry = 2f64.powf((63 - i) as f64 / 4.0).round().max(1.0) as i32;
    }
    table
}

pub(crate) fn build(sample_rate: u32) -> RefTables {
    let (eg_increment_tables, eg_increment_tables_attack) = build_eg_increment_tables();

    let mut eg_sustain_level_table = [0i32; 16];
    for (i, entry) in eg_sustain_level_table.iter_mut().enumerate() {
        *entry = (i as i32) << 5;
    }
    eg_sustain_level_table[15] = ENV_BOTTOM;

    let mut note_number_to_key_code = [0i32; 128];
    for (n, entry) in note_number_to_key_code.iter_mut().enumerate() {
        *entry = (n as i32 + n as i32 / 3).min(127);
    }

    // SSG level-table selection per (type, ssgec attack rate, ssgec state).
    // Type 0: repeat-to-zero, 1: repeat-to-max, 2: alternating, 3: held.
    let eg_ssg_table_index = [
        [[1, 1, 1], [1, 1, 1]],
        [[2, 2, 2], [2, 2, 2]],
        [[1, 2, 1], [2, 1, 2]],
        [[1, 3, 1], [3, 1, 3]],
    ];

    RefTables {
        sample_rate,
        i2n: 1.0 / SAMPLE_MAX as f64,
        log_table: build_log_table(),
        wave_tables: build_wave_tables(),
        pitch_table_opm: build_pitch_table_opm(sample_rate),
        pitch_table_pcm: build_pitch_table_pcm(sample_rate),
        pitch_table_noise: build_pitch_table_noise(sample_rate),
        dt1_table: build_dt1_table(sample_rate),
        dt2_table: [0, 384, 500, 608],
        note_number_to_key_code,
        eg_increment_tables,
        eg_increment_tables_attack,
        eg_table_selector: {
            let mut selector = [0usize; 64];
            for (i, entry) in selector.iter_mut().enumerate() {
                *entry = (i / 4).min(15);
            }
            selector
        },
        eg_timer_steps: build_eg_timer_steps(),
        eg_sustain_level_table,
        eg_level_tables: build_eg_level_tables(),
        eg_ssg_table_index,
        eg_total_level_tables: build_total_level_tables(),
        eg_linear_to_total_level_table: build_linear_to_total_level(),
        pan_table: build_pan_table(),
        lfo_wave_tables: build_lfo_wave_tables(),
        lfo_timer_steps: build_lfo_timer_steps(sample_rate),
        filter_cutoff_table: build_filter_cutoff_table(),
        filter_eg_rate: build_filter_eg_rate(),
    }
}
