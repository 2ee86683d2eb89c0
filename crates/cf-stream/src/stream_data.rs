//! Streaming clip data: a WAV file decoded on the background loader thread
//! into a 48 kHz ring buffer the audio thread reads from.
//!
//! Thread split:
//! - Audio thread owns the ring read cursor and the granular/playback state
//!   in the stream channel.
//! - The loader thread owns the decode buffer, file reader, resample cursor
//!   and overlap frame (everything inside `LoaderState`).
//! - The control thread configures trim/loop flags (atomics) and performs
//!   the synchronous prefill at load time, before the instance is shared.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cf_core::{CfError, CfResult, TARGET_SAMPLE_RATE};

use crate::loader;
use crate::ring::StreamRing;

/// Default ring capacity in frames (~340 ms of stereo at 48 kHz).
pub const DEFAULT_RING_CAPACITY: usize = 16384;

/// Frames decoded from disk per chunk.
const DECODE_CHUNK_FRAMES: usize = 4096;

/// Maximum frames appended to the ring per fill pass.
const FILL_CHUNK_FRAMES: usize = 4096;

/// Sample encodings accepted from WAV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSampleFormat {
    Pcm16,
    Pcm24,
    Float32,
}

/// Loader-thread-only decode state.
pub(crate) struct LoaderState {
    reader: Option<hound::WavReader<BufReader<File>>>,
    decode_buffer: Vec<f64>,
    decode_buf_valid: usize,
    file_read_pos_frames: u64,
    resample_frac: f64,
    overlap_frame: [f64; 2],
    has_overlap: bool,
    decode_pos_48k: i64,
    fill_scratch: Vec<f64>,
}

impl LoaderState {
    fn new() -> Self {
        Self {
            reader: None,
            decode_buffer: Vec::new(),
            decode_buf_valid: 0,
            file_read_pos_frames: 0,
            resample_frac: 0.0,
            overlap_frame: [0.0; 2],
            has_overlap: false,
            decode_pos_48k: 0,
            fill_scratch: Vec::new(),
        }
    }
}

/// A streaming clip bound to one WAV file.
pub struct StreamWaveData {
    path: PathBuf,
    source_sample_rate: u32,
    channel_count: usize,
    format: StreamSampleFormat,
    total_source_frames: u64,
    total_frames_48k: u64,

    ring: StreamRing,

    // Trim and loop configuration (control thread writes, loader reads).
    in_sample: AtomicI64,
    out_sample: AtomicI64,
    looping: AtomicBool,
    loop_start_48k: AtomicI64,
    loop_end_48k: AtomicI64,

    // Lifecycle flags.
    active: AtomicBool,
    seek_requested: AtomicBool,
    seek_target: AtomicI64,
    pub(crate) enqueued: AtomicBool,
    pub(crate) processing: AtomicBool,
    /// Completed loader-side loop wraps, for diagnostics.
    loader_loops: AtomicU64,

    loader: Mutex<LoaderState>,
}

impl StreamWaveData {
    /// Parse the WAV header, allocate the ring and prefill it synchronously
    /// so playback can begin without waiting for the loader thread.
    pub fn load_wav(path: impl AsRef<Path>, ring_capacity: usize) -> CfResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let reader = hound::WavReader::open(&path)
            .map_err(|e| CfError::Stream(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();

        let format = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => StreamSampleFormat::Pcm16,
            (hound::SampleFormat::Int, 24) => StreamSampleFormat::Pcm24,
            (hound::SampleFormat::Float, 32) => StreamSampleFormat::Float32,
            (_, bits) => {
                return Err(CfError::UnsupportedWavFormat(format!(
                    "{bits}-bit {:?}",
                    spec.sample_format
                )));
            }
        };
        if !(1..=2).contains(&spec.channels) {
            return Err(CfError::UnsupportedWavFormat(format!(
                "{} channels",
                spec.channels
            )));
        }

        let total_source_frames = reader.duration() as u64;
        if total_source_frames == 0 {
            return Err(CfError::Stream("empty audio data".into()));
        }

        let total_frames_48k = if spec.sample_rate == TARGET_SAMPLE_RATE {
            total_source_frames
        } else {
            let ratio = TARGET_SAMPLE_RATE as f64 / spec.sample_rate as f64;
            (total_source_frames as f64 * ratio).ceil() as u64
        };

        let capacity = if ring_capacity > 0 {
            ring_capacity
        } else {
            DEFAULT_RING_CAPACITY
        };

        let data = Arc::new(Self {
            path,
            source_sample_rate: spec.sample_rate,
            channel_count: spec.channels as usize,
            format,
            total_source_frames,
            total_frames_48k,
            ring: StreamRing::new(capacity, spec.channels as usize),
            in_sample: AtomicI64::new(0),
            out_sample: AtomicI64::new(0),
            looping: AtomicBool::new(false),
            loop_start_48k: AtomicI64::new(0),
            loop_end_48k: AtomicI64::new(0),
            active: AtomicBool::new(false),
            seek_requested: AtomicBool::new(false),
            seek_target: AtomicI64::new(0),
            enqueued: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            loader_loops: AtomicU64::new(0),
            loader: Mutex::new(LoaderState::new()),
        });

        data.prefill_sync();
        Ok(data)
    }

    // ---- Metadata ----

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    #[inline]
    pub fn sample_format(&self) -> StreamSampleFormat {
        self.format
    }

    #[inline]
    pub fn total_source_frames(&self) -> u64 {
        self.total_source_frames
    }

    #[inline]
    pub fn total_frames_48k(&self) -> u64 {
        self.total_frames_48k
    }

    // ---- Trim & loop configuration ----

    pub fn set_in_sample(&self, sample: i64) {
        self.in_sample.store(sample.max(0), Ordering::Relaxed);
    }

    pub fn in_sample(&self) -> i64 {
        self.in_sample.load(Ordering::Relaxed)
    }

    pub fn set_out_sample(&self, sample: i64) {
        self.out_sample.store(sample.max(0), Ordering::Relaxed);
    }

    pub fn out_sample(&self) -> i64 {
        self.out_sample.load(Ordering::Relaxed)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Relaxed);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Relaxed)
    }

    pub fn set_loop_region(&self, start_48k: i64, end_48k: i64) {
        self.loop_start_48k.store(start_48k.max(0), Ordering::Relaxed);
        self.loop_end_48k.store(end_48k.max(0), Ordering::Relaxed);
    }

    pub fn loop_start_48k(&self) -> i64 {
        self.loop_start_48k.load(Ordering::Relaxed)
    }

    pub fn loop_end_48k(&self) -> i64 {
        self.loop_end_48k.load(Ordering::Relaxed)
    }

    pub fn loader_loops(&self) -> u64 {
        self.loader_loops.load(Ordering::Relaxed)
    }

    // ---- Audio-thread ring API ----

    #[inline]
    pub fn ring_available(&self) -> usize {
        self.ring.available()
    }

    #[inline]
    pub fn ring_read_sample(&self, offset: usize, channel: usize) -> f64 {
        self.ring.read_sample(offset, channel)
    }

    #[inline]
    pub fn ring_advance_read(&self, frames: usize) {
        self.ring.advance_read(frames);
    }

    #[inline]
    pub fn ring_capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Ask the loader to top up the ring. Fails fast when a request is
    /// already in flight (it subsumes this one).
    pub fn request_refill(self: &Arc<Self>) {
        loader::enqueue(self);
    }

    // ---- Lifecycle ----

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn activate(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        loader::enqueue(self);
    }

    /// The loader observes `active == false` and skips pending or future
    /// refills for this instance; the audio thread reads silence.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Request a reposition to an absolute 48 kHz frame. The ring is flushed
    /// so the channel never sees stale data; the loader repositions its
    /// source cursor on the next fill.
    pub fn seek(self: &Arc<Self>, position_48k: i64) {
        self.seek_target.store(position_48k, Ordering::Relaxed);
        self.seek_requested.store(true, Ordering::Release);
        self.ring.flush_read();
        loader::enqueue(self);
    }

    /// Spin until the loader is neither queued nor inside a fill for this
    /// instance. Control-thread only.
    pub fn wait_until_idle(&self) {
        while self.enqueued.load(Ordering::Acquire) || self.processing.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    /// Synchronous prefill from `in_sample`; establishes exclusive access by
    /// construction (called before the instance is shared) or after
    /// `deactivate` + `wait_until_idle`.
    pub fn prefill_sync(&self) {
        let in_sample = self.in_sample.load(Ordering::Relaxed);
        {
            let mut state = self.loader.lock();
            self.reset_decode_to_48k(&mut state, in_sample);
        }
        self.ring.reset();
        self.fill_ring_buffer();
    }

    // ---- Loader internals ----

    fn reset_decode_to_48k(&self, state: &mut LoaderState, pos_48k: i64) {
        state.file_read_pos_frames = if self.source_sample_rate == TARGET_SAMPLE_RATE {
            pos_48k.max(0) as u64
        } else {
            let inv_ratio = self.source_sample_rate as f64 / TARGET_SAMPLE_RATE as f64;
            (pos_48k.max(0) as f64 * inv_ratio) as u64
        };
        state.decode_pos_48k = pos_48k.max(0);
        state.resample_frac = 0.0;
        state.has_overlap = false;
        state.overlap_frame = [0.0; 2];
        state.decode_buf_valid = 0;
    }

    fn open_reader(&self, state: &mut LoaderState) -> bool {
        if state.reader.is_some() {
            return true;
        }
        match hound::WavReader::open(&self.path) {
            Ok(reader) => {
                state.reader = Some(reader);
                true
            }
            Err(e) => {
                log::error!(
                    "StreamWaveData: failed to open {}: {e}",
                    self.path.display()
                );
                self.active.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Pull the next chunk of source frames into the decode buffer.
    fn refill_decode_buffer(&self, state: &mut LoaderState) -> bool {
        if !self.open_reader(state) {
            return false;
        }
        if state.file_read_pos_frames >= self.total_source_frames {
            state.decode_buf_valid = 0;
            return false;
        }

        let frames_to_read = DECODE_CHUNK_FRAMES
            .min((self.total_source_frames - state.file_read_pos_frames) as usize);
        if frames_to_read == 0 {
            state.decode_buf_valid = 0;
            return false;
        }

        let channels = self.channel_count;
        let reader = state.reader.as_mut().expect("reader opened above");
        if reader.seek(state.file_read_pos_frames as u32).is_err() {
            state.decode_buf_valid = 0;
            return false;
        }

        state.decode_buffer.clear();
        state
            .decode_buffer
            .reserve(frames_to_read * channels);
        let wanted = frames_to_read * channels;
        match self.format {
            StreamSampleFormat::Pcm16 => {
                for sample in reader.samples::<i16>().take(wanted) {
                    state
                        .decode_buffer
                        .push(sample.unwrap_or(0) as f64 / 32768.0);
                }
            }
            StreamSampleFormat::Pcm24 => {
                for sample in reader.samples::<i32>().take(wanted) {
                    state
                        .decode_buffer
                        .push(sample.unwrap_or(0) as f64 / 8388608.0);
                }
            }
            StreamSampleFormat::Float32 => {
                for sample in reader.samples::<f32>().take(wanted) {
                    state.decode_buffer.push(sample.unwrap_or(0.0) as f64);
                }
            }
        }

        let actual_frames = state.decode_buffer.len() / channels;
        if actual_frames == 0 {
            state.decode_buf_valid = 0;
            return false;
        }
        state.decode_buf_valid = actual_frames;
        state.file_read_pos_frames += actual_frames as u64;
        true
    }

    /// Produce up to `max_frames` 48 kHz frames, resampling and wrapping at
    /// loop boundaries as needed. Returns frames produced.
    fn produce_resampled_frames(
        &self,
        state: &mut LoaderState,
        out: &mut [f64],
        max_frames: usize,
    ) -> usize {
        let mut effective_end = self.out_sample.load(Ordering::Relaxed);
        if effective_end <= 0 {
            effective_end = self.total_frames_48k as i64;
        }

        let looping = self.looping.load(Ordering::Relaxed);
        let loop_start_raw = self.loop_start_48k.load(Ordering::Relaxed);
        let loop_end_raw = self.loop_end_48k.load(Ordering::Relaxed);
        let in_sample = self.in_sample.load(Ordering::Relaxed);
        let effective_loop_start = if looping && loop_start_raw > 0 {
            loop_start_raw
        } else {
            in_sample
        };
        let effective_loop_end = if looping && loop_end_raw > 0 {
            loop_end_raw
        } else {
            effective_end
        };

        let channels = self.channel_count;
        let mut frames_produced = 0usize;

        if self.source_sample_rate == TARGET_SAMPLE_RATE {
            // No resampling; copy straight out of the decode buffer.
            while frames_produced < max_frames {
                if state.decode_pos_48k >= effective_loop_end {
                    if looping {
                        self.reset_decode_to_48k(state, effective_loop_start);
                        self.loader_loops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    break;
                }
                if state.decode_buf_valid == 0 && !self.refill_decode_buffer(state) {
                    if looping {
                        // EOF before loop_end (region extends past the file).
                        self.reset_decode_to_48k(state, effective_loop_start);
                        self.loader_loops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    break;
                }

                let end_remaining = (effective_loop_end - state.decode_pos_48k) as usize;
                let to_copy = (max_frames - frames_produced)
                    .min(state.decode_buf_valid)
                    .min(end_remaining);
                if to_copy == 0 {
                    break;
                }

                let buf_frames = state.decode_buffer.len() / channels;
                let buf_offset = buf_frames - state.decode_buf_valid;
                let src = buf_offset * channels;
                let dst = frames_produced * channels;
                out[dst..dst + to_copy * channels]
                    .copy_from_slice(&state.decode_buffer[src..src + to_copy * channels]);

                frames_produced += to_copy;
                state.decode_pos_48k += to_copy as i64;
                state.decode_buf_valid -= to_copy;
            }
            return frames_produced;
        }

        // Resampling path: fractional cursor with one overlap frame carried
        // between decode chunks for cross-chunk continuity.
        let inv_ratio = self.source_sample_rate as f64 / TARGET_SAMPLE_RATE as f64;

        while frames_produced < max_frames {
            if state.decode_pos_48k >= effective_loop_end {
                if looping {
                    self.reset_decode_to_48k(state, effective_loop_start);
                    self.loader_loops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                break;
            }

            if state.decode_buf_valid == 0 {
                if !self.refill_decode_buffer(state) {
                    if looping {
                        self.reset_decode_to_48k(state, effective_loop_start);
                        self.loader_loops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    break;
                }
                if !state.has_overlap {
                    state.resample_frac = 0.0;
                }
            }

            let mut progressed = false;
            while frames_produced < max_frames && state.decode_pos_48k < effective_loop_end {
                let src_index = state.resample_frac.floor() as isize;
                let frac = state.resample_frac - src_index as f64;

                let mut s0 = [0.0f64; 2];
                let mut s1 = [0.0f64; 2];
                let mut can_interpolate = false;

                if src_index < 0 && state.has_overlap {
                    s0[..channels].copy_from_slice(&state.overlap_frame[..channels]);
                    if src_index + 1 >= 0 && ((src_index + 1) as usize) < state.decode_buf_valid {
                        for ch in 0..channels {
                            s1[ch] = state.decode_buffer
                                [((src_index + 1) as usize) * channels + ch];
                        }
                        can_interpolate = true;
                    } else if src_index + 1 < 0 {
                        s1[..channels].copy_from_slice(&state.overlap_frame[..channels]);
                        can_interpolate = true;
                    }
                } else if src_index >= 0 && ((src_index + 1) as usize) < state.decode_buf_valid {
                    for ch in 0..channels {
                        s0[ch] = state.decode_buffer[(src_index as usize) * channels + ch];
                        s1[ch] = state.decode_buffer[((src_index + 1) as usize) * channels + ch];
                    }
                    can_interpolate = true;
                }

                if !can_interpolate {
                    break;
                }

                let dst = frames_produced * channels;
                for ch in 0..channels {
                    out[dst + ch] = s0[ch] + (s1[ch] - s0[ch]) * frac;
                }
                frames_produced += 1;
                state.decode_pos_48k += 1;
                state.resample_frac += inv_ratio;
                progressed = true;
            }

            // Consumed past the decode buffer: save the overlap frame and
            // prepare for the next chunk.
            if state.decode_buf_valid > 0
                && state.resample_frac.floor() as isize >= state.decode_buf_valid as isize - 1
            {
                for ch in 0..channels {
                    state.overlap_frame[ch] =
                        state.decode_buffer[(state.decode_buf_valid - 1) * channels + ch];
                }
                state.has_overlap = true;
                state.resample_frac -= state.decode_buf_valid as f64;
                state.decode_buf_valid = 0;
            } else if !progressed {
                break;
            }
        }

        frames_produced
    }

    fn handle_seek(&self, state: &mut LoaderState) {
        let target = self.seek_target.load(Ordering::Relaxed);
        self.seek_requested.store(false, Ordering::Relaxed);
        let target = target.clamp(0, self.total_frames_48k as i64);
        self.reset_decode_to_48k(state, target);
        self.ring.flush_read();
    }

    /// One fill pass: invoked by the loader thread (or the synchronous
    /// prefill) with exclusive ownership of the loader state.
    pub(crate) fn fill_ring_buffer(&self) {
        let mut state = self.loader.lock();

        if self.seek_requested.load(Ordering::Acquire) {
            self.handle_seek(&mut state);
        }

        let space = self.ring.space();
        if space == 0 {
            return;
        }
        let frames_to_fill = space.min(FILL_CHUNK_FRAMES);

        if !self.open_reader(&mut state) {
            return;
        }

        let needed = frames_to_fill * self.channel_count;
        if state.fill_scratch.len() < needed {
            state.fill_scratch.resize(needed, 0.0);
        }
        let mut scratch = std::mem::take(&mut state.fill_scratch);
        let produced = self.produce_resampled_frames(&mut state, &mut scratch, frames_to_fill);
        if produced > 0 {
            self.ring.write_frames(&scratch, produced);
        }
        state.fill_scratch = scratch;
    }
}

impl Drop for StreamWaveData {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
