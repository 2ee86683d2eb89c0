//! SPSC ring buffer of 48 kHz interleaved frames.
//!
//! Producer: the loader thread (writes decoded audio).
//! Consumer: the audio thread (reads for playback).
//!
//! Positions are monotonically increasing `u32` frame counters; the buffer
//! index is `pos & mask`. The writer publishes a whole batch with one
//! release store so the reader never observes a partial fill.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct StreamRing {
    data: Box<[UnsafeCell<f64>]>,
    capacity: usize,
    mask: usize,
    channels: usize,
    /// Frame position of the next write (producer only).
    write_pos: AtomicU32,
    /// Frame position of the next read (consumer only).
    read_pos: AtomicU32,
}

// SAFETY: SPSC discipline - the loader thread is the only writer, the audio
// thread the only reader, and the cursor atomics order the data accesses
// (release on publish, acquire on availability checks).
unsafe impl Send for StreamRing {}
unsafe impl Sync for StreamRing {}

impl StreamRing {
    /// Capacity is rounded up to a power of two.
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity = capacity_frames.next_power_of_two();
        let data = (0..capacity * channels)
            .map(|_| UnsafeCell::new(0.0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data,
            capacity,
            mask: capacity - 1,
            channels,
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames available for reading (consumer side).
    #[inline]
    pub fn available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Relaxed);
        w.wrapping_sub(r) as usize
    }

    /// Frames available for writing (producer side).
    #[inline]
    pub fn space(&self) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        self.capacity - w.wrapping_sub(r) as usize
    }

    /// Random-access read at `offset` frames past the read head (consumer).
    /// The caller is responsible for staying within `available()`.
    #[inline]
    pub fn read_sample(&self, offset: usize, channel: usize) -> f64 {
        let r = self.read_pos.load(Ordering::Relaxed) as usize;
        let index = ((r + offset) & self.mask) * self.channels + channel;
        // SAFETY: offsets within available() are published and stable until
        // the consumer advances past them.
        unsafe { *self.data[index].get() }
    }

    /// Consume frames (consumer).
    #[inline]
    pub fn advance_read(&self, frames: usize) {
        let r = self.read_pos.load(Ordering::Relaxed);
        self.read_pos
            .store(r.wrapping_add(frames as u32), Ordering::Release);
    }

    /// Append interleaved frames (producer). Returns frames written.
    pub fn write_frames(&self, frames: &[f64], frame_count: usize) -> usize {
        let to_write = frame_count.min(self.space());
        if to_write == 0 {
            return 0;
        }
        let w = self.write_pos.load(Ordering::Relaxed) as usize;
        for i in 0..to_write {
            let dst = ((w + i) & self.mask) * self.channels;
            let src = i * self.channels;
            for ch in 0..self.channels {
                // SAFETY: region between write_pos and read_pos+capacity is
                // exclusively the producer's until published below.
                unsafe {
                    *self.data[dst + ch].get() = frames[src + ch];
                }
            }
        }
        // One release store publishes the whole batch.
        self.write_pos.store(
            (w as u32).wrapping_add(to_write as u32),
            Ordering::Release,
        );
        to_write
    }

    /// Discard everything buffered (consumer side of a seek).
    pub fn flush_read(&self) {
        let w = self.write_pos.load(Ordering::Relaxed);
        self.read_pos.store(w, Ordering::Release);
    }

    /// Reset both cursors (exclusive access only, e.g. synchronous prefill).
    pub fn reset(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }

    #[inline]
    pub fn write_position(&self) -> u32 {
        self.write_pos.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_position(&self) -> u32 {
        self.read_pos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let ring = StreamRing::new(1000, 2);
        assert_eq!(ring.capacity(), 1024);
    }

    #[test]
    fn test_write_read_round_trip() {
        let ring = StreamRing::new(16, 2);
        let frames: Vec<f64> = (0..16).map(|i| i as f64).collect();
        assert_eq!(ring.write_frames(&frames, 8), 8);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.read_sample(0, 0), 0.0);
        assert_eq!(ring.read_sample(3, 1), 7.0);
        ring.advance_read(4);
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.read_sample(0, 0), 8.0);
    }

    #[test]
    fn test_write_respects_space() {
        let ring = StreamRing::new(8, 1);
        let frames = vec![1.0f64; 16];
        assert_eq!(ring.write_frames(&frames, 16), 8);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.write_frames(&frames, 4), 0);
        ring.advance_read(2);
        assert_eq!(ring.write_frames(&frames, 4), 2);
    }

    #[test]
    fn test_cursors_monotonic_across_wrap() {
        let ring = StreamRing::new(8, 1);
        let frames = vec![0.5f64; 8];
        for _ in 0..100 {
            let written = ring.write_frames(&frames, 8);
            assert!(ring.write_position().wrapping_sub(ring.read_position()) as usize <= 8);
            ring.advance_read(written);
        }
    }
}
