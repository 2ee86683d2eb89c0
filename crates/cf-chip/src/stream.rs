//! Mix streams: stereo accumulators that channels and effect chains write
//! into, identified by bank index so routing needs no shared pointers.

use cf_tables::RefTables;

/// Identifier of a stream inside the [`StreamBank`].
pub type StreamId = usize;

/// The master output stream always occupies slot 0.
pub const MASTER_STREAM: StreamId = 0;

/// Number of send slots per channel (send 0 = main output).
pub const STREAM_SEND_SIZE: usize = 4;

/// One stereo accumulation buffer (interleaved L/R doubles).
pub struct MixStream {
    buffer: Vec<f64>,
    channels: usize,
}

impl MixStream {
    pub fn new(buffer_length: usize, channels: usize) -> Self {
        Self {
            buffer: vec![0.0; buffer_length * 2],
            channels,
        }
    }

    #[inline]
    pub fn buffer(&self) -> &[f64] {
        &self.buffer
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [f64] {
        &mut self.buffer
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
    }

    /// Accumulate a mono integer pipe region with volume and pan applied.
    pub fn write(&mut self, data: &[i32], offset: usize, length: usize, volume: f64, pan: i32) {
        let tables = RefTables::get();
        let volume = volume * tables.i2n;
        let end = ((offset + length) * 2).min(self.buffer.len());
        let pan = pan.clamp(0, 128) as usize;

        if self.channels == 2 {
            let volume_left = tables.pan_table[128 - pan] * volume;
            let volume_right = tables.pan_table[pan] * volume;
            let mut i = offset * 2;
            for &value in data {
                if i >= end {
                    break;
                }
                self.buffer[i] += value as f64 * volume_left;
                self.buffer[i + 1] += value as f64 * volume_right;
                i += 2;
            }
        } else {
            let mut i = offset * 2;
            for &value in data {
                if i >= end {
                    break;
                }
                self.buffer[i] += value as f64 * volume;
                self.buffer[i + 1] += value as f64 * volume;
                i += 2;
            }
        }
    }

    /// Accumulate separate left/right integer pipe regions.
    pub fn write_stereo(
        &mut self,
        left: &[i32],
        right: &[i32],
        offset: usize,
        length: usize,
        volume: f64,
        pan: i32,
    ) {
        let tables = RefTables::get();
        let volume = volume * tables.i2n;
        let end = ((offset + length) * 2).min(self.buffer.len());
        let pan = pan.clamp(0, 128) as usize;

        if self.channels == 2 {
            let volume_left = tables.pan_table[128 - pan] * volume;
            let volume_right = tables.pan_table[pan] * volume;
            let mut i = offset * 2;
            for (&l, &r) in left.iter().zip(right.iter()) {
                if i >= end {
                    break;
                }
                self.buffer[i] += l as f64 * volume_left;
                self.buffer[i + 1] += r as f64 * volume_right;
                i += 2;
            }
        } else {
            let volume = volume * 0.5;
            let mut i = offset * 2;
            for (&l, &r) in left.iter().zip(right.iter()) {
                if i >= end {
                    break;
                }
                let mono = (l + r) as f64 * volume;
                self.buffer[i] += mono;
                self.buffer[i + 1] += mono;
                i += 2;
            }
        }
    }

    /// Accumulate already-float stereo frames (effect stream fan-out) with
    /// post-fader gain and pan applied.
    pub fn write_frames(&mut self, frames: &[f64], offset: usize, length: usize, volume: f64, pan: i32) {
        let tables = RefTables::get();
        let pan = pan.clamp(0, 128) as usize;
        let volume_left = tables.pan_table[128 - pan] * volume;
        let volume_right = tables.pan_table[pan] * volume;
        let start = offset * 2;
        let end = (start + length * 2).min(self.buffer.len()).min(frames.len());
        let mut i = start;
        while i + 2 <= end {
            self.buffer[i] += frames[i] * volume_left;
            self.buffer[i + 1] += frames[i + 1] * volume_right;
            i += 2;
        }
    }
}

/// Bank of mix streams. Slot 0 is the master output; further slots are
/// allocated by the effector for global and per-track effect chains.
pub struct StreamBank {
    streams: Vec<MixStream>,
    buffer_length: usize,
    channels: usize,
}

impl StreamBank {
    pub fn new(buffer_length: usize, channels: usize) -> Self {
        Self {
            streams: vec![MixStream::new(buffer_length, channels)],
            buffer_length,
            channels,
        }
    }

    /// Allocate a new stream and return its id.
    pub fn allocate(&mut self) -> StreamId {
        self.streams.push(MixStream::new(self.buffer_length, self.channels));
        self.streams.len() - 1
    }

    #[inline]
    pub fn get(&self, id: StreamId) -> &MixStream {
        &self.streams[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: StreamId) -> &mut MixStream {
        &mut self.streams[id]
    }

    /// Disjoint mutable access to two streams (effect fan-out writes the
    /// source stream's processed output into a downstream stream).
    pub fn pair_mut(&mut self, a: StreamId, b: StreamId) -> (&mut MixStream, &mut MixStream) {
        assert!(a != b, "stream fan-out cannot target itself");
        if a < b {
            let (head, tail) = self.streams.split_at_mut(b);
            (&mut head[a], &mut tail[0])
        } else {
            let (head, tail) = self.streams.split_at_mut(a);
            (&mut tail[0], &mut head[b])
        }
    }

    pub fn clear_all(&mut self) {
        for stream in &mut self.streams {
            stream.clear();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    #[inline]
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;

    fn init() {
        RefTables::initialize(SampleRate::Hz48000);
    }

    #[test]
    fn test_write_center_pan() {
        init();
        let mut stream = MixStream::new(8, 2);
        let data = [8192i32; 8];
        stream.write(&data, 0, 8, 1.0, 64);
        // Center pan splits at cos(45deg) on both sides.
        let expected = std::f64::consts::FRAC_1_SQRT_2;
        assert!((stream.buffer()[0] - expected).abs() < 1e-9);
        assert!((stream.buffer()[1] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_write_accumulates() {
        init();
        let mut stream = MixStream::new(4, 2);
        let data = [4096i32; 4];
        stream.write(&data, 0, 4, 1.0, 64);
        let first = stream.buffer()[0];
        stream.write(&data, 0, 4, 1.0, 64);
        assert!((stream.buffer()[0] - first * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_bank_pair_mut() {
        init();
        let mut bank = StreamBank::new(4, 2);
        let extra = bank.allocate();
        let (a, b) = bank.pair_mut(extra, MASTER_STREAM);
        a.buffer_mut()[0] = 1.0;
        b.buffer_mut()[0] = 2.0;
        assert_eq!(bank.get(extra).buffer()[0], 1.0);
        assert_eq!(bank.get(MASTER_STREAM).buffer()[0], 2.0);
    }
}
