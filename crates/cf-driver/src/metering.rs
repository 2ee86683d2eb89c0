//! Metering: downsampled peak/RMS snapshots for the master bus and
//! registered tracks.
//!
//! Snapshots are written by the audio thread under a short lock (the lock
//! guards only the value replace, never any allocation) and read by any
//! consumer as a copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use cf_tables::RefTables;

/// History ring length for the master meter.
pub const METER_RING_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeterSnapshot {
    pub peak_left: f64,
    pub peak_right: f64,
    pub rms_left: f64,
    pub rms_right: f64,
    /// Monotonic counter, not wall time; safe to produce on the audio thread.
    pub timestamp: u64,
    pub sample_count: usize,
}

pub struct Metering {
    enabled: AtomicBool,
    downsample_factor: AtomicU32,
    counter: AtomicU64,

    master: Mutex<MeterSnapshot>,
    history: Mutex<[MeterSnapshot; METER_RING_SIZE]>,
    history_head: AtomicU32,
    tracks: Mutex<HashMap<i32, MeterSnapshot>>,
}

impl Default for Metering {
    fn default() -> Self {
        Self::new()
    }
}

impl Metering {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            downsample_factor: AtomicU32::new(1),
            counter: AtomicU64::new(0),
            master: Mutex::new(MeterSnapshot::default()),
            history: Mutex::new([MeterSnapshot::default(); METER_RING_SIZE]),
            history_head: AtomicU32::new(0),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Run the metering pass only every Nth block (1..=16).
    pub fn set_downsample_factor(&self, factor: u32) {
        self.downsample_factor
            .store(factor.clamp(1, 16), Ordering::Release);
    }

    pub fn downsample_factor(&self) -> u32 {
        self.downsample_factor.load(Ordering::Acquire)
    }

    pub fn register_track(&self, track_id: i32) {
        self.tracks
            .lock()
            .entry(track_id)
            .or_default();
    }

    pub fn unregister_track(&self, track_id: i32) {
        self.tracks.lock().remove(&track_id);
    }

    pub fn is_track_registered(&self, track_id: i32) -> bool {
        self.tracks.lock().contains_key(&track_id)
    }

    pub fn master_snapshot(&self) -> MeterSnapshot {
        *self.master.lock()
    }

    pub fn track_snapshot(&self, track_id: i32) -> Option<MeterSnapshot> {
        self.tracks.lock().get(&track_id).copied()
    }

    /// Recent master snapshots, newest last.
    pub fn master_history(&self) -> Vec<MeterSnapshot> {
        let history = self.history.lock();
        let head = self.history_head.load(Ordering::Acquire) as usize;
        let mut out = Vec::with_capacity(METER_RING_SIZE);
        for i in 0..METER_RING_SIZE {
            out.push(history[(head + i) % METER_RING_SIZE]);
        }
        out
    }

    /// Peak/RMS over one interleaved stereo block.
    fn analyze(buffer: &[f64], frames: usize, timestamp: u64) -> MeterSnapshot {
        let mut snapshot = MeterSnapshot {
            timestamp,
            sample_count: frames,
            ..MeterSnapshot::default()
        };
        let mut sum_sq_left = 0.0f64;
        let mut sum_sq_right = 0.0f64;
        for frame in buffer.chunks_exact(2).take(frames) {
            let left = frame[0].abs();
            let right = frame[1].abs();
            snapshot.peak_left = snapshot.peak_left.max(left);
            snapshot.peak_right = snapshot.peak_right.max(right);
            sum_sq_left += left * left;
            sum_sq_right += right * right;
        }
        if frames > 0 {
            snapshot.rms_left = (sum_sq_left / frames as f64).sqrt();
            snapshot.rms_right = (sum_sq_right / frames as f64).sqrt();
        }
        snapshot
    }

    /// Master pass: analyze the post-master accumulator.
    pub fn meter_master(&self, buffer: &[f64], frames: usize) {
        let timestamp = self.counter.fetch_add(1, Ordering::Relaxed);
        let snapshot = Self::analyze(buffer, frames, timestamp);
        *self.master.lock() = snapshot;

        let head = self.history_head.load(Ordering::Relaxed) as usize;
        self.history.lock()[head] = snapshot;
        self.history_head
            .store(((head + 1) % METER_RING_SIZE) as u32, Ordering::Release);
    }

    /// Track pass: analyze a track effect stream's accumulator with its
    /// post-fader gain and post-pan applied. No-op for unregistered tracks.
    pub fn meter_track(
        &self,
        track_id: i32,
        buffer: &[f64],
        frames: usize,
        post_fader_gain: f64,
        post_pan: i32,
    ) {
        {
            let tracks = self.tracks.lock();
            if !tracks.contains_key(&track_id) {
                return;
            }
        }

        let tables = RefTables::get();
        let pan = post_pan.clamp(0, 128) as usize;
        let gain = post_fader_gain.max(0.0);
        let gain_left = tables.pan_table[128 - pan] * gain;
        let gain_right = tables.pan_table[pan] * gain;

        let timestamp = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut snapshot = MeterSnapshot {
            timestamp,
            sample_count: frames,
            ..MeterSnapshot::default()
        };
        let mut sum_sq_left = 0.0f64;
        let mut sum_sq_right = 0.0f64;
        for frame in buffer.chunks_exact(2).take(frames) {
            let left = (frame[0] * gain_left).abs();
            let right = (frame[1] * gain_right).abs();
            snapshot.peak_left = snapshot.peak_left.max(left);
            snapshot.peak_right = snapshot.peak_right.max(right);
            sum_sq_left += left * left;
            sum_sq_right += right * right;
        }
        if frames > 0 {
            snapshot.rms_left = (sum_sq_left / frames as f64).sqrt();
            snapshot.rms_right = (sum_sq_right / frames as f64).sqrt();
        }

        self.tracks.lock().insert(track_id, snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;

    #[test]
    fn test_master_peak_and_rms() {
        RefTables::initialize(SampleRate::Hz48000);
        let metering = Metering::new();
        let buffer: Vec<f64> = (0..256).map(|i| if i % 2 == 0 { 0.5 } else { -0.25 }).collect();
        metering.meter_master(&buffer, 128);
        let snapshot = metering.master_snapshot();
        assert!((snapshot.peak_left - 0.5).abs() < 1e-12);
        assert!((snapshot.peak_right - 0.25).abs() < 1e-12);
        assert!((snapshot.rms_left - 0.5).abs() < 1e-12);
        assert_eq!(snapshot.sample_count, 128);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        RefTables::initialize(SampleRate::Hz48000);
        let metering = Metering::new();
        let buffer = vec![0.1f64; 64];
        metering.meter_master(&buffer, 32);
        let first = metering.master_snapshot().timestamp;
        metering.meter_master(&buffer, 32);
        let second = metering.master_snapshot().timestamp;
        assert!(second > first);
    }

    #[test]
    fn test_unregistered_track_is_skipped() {
        RefTables::initialize(SampleRate::Hz48000);
        let metering = Metering::new();
        let buffer = vec![0.5f64; 64];
        metering.meter_track(7, &buffer, 32, 1.0, 64);
        assert!(metering.track_snapshot(7).is_none());

        metering.register_track(7);
        metering.meter_track(7, &buffer, 32, 1.0, 64);
        let snapshot = metering.track_snapshot(7).unwrap();
        // Center pan applies cos(45 deg).
        assert!((snapshot.peak_left - 0.5 * std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn test_history_keeps_recent_snapshots() {
        RefTables::initialize(SampleRate::Hz48000);
        let metering = Metering::new();
        let buffer = vec![0.25f64; 64];
        for _ in 0..(METER_RING_SIZE + 4) {
            metering.meter_master(&buffer, 32);
        }
        let history = metering.master_history();
        assert_eq!(history.len(), METER_RING_SIZE);
        assert!(history.last().unwrap().sample_count == 32);
    }
}
