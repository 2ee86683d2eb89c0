//! cf-stream: disk-streamed clip playback support for ChipForge
//!
//! - `StreamWaveData`: a WAV-backed clip with a 48 kHz SPSC ring buffer
//! - `StreamRing`: the lock-free ring itself
//! - one process-global loader thread doing file I/O, decode and resampling

mod loader;
mod ring;
mod stream_data;

pub use loader::shutdown_loader;
pub use ring::StreamRing;
pub use stream_data::{StreamSampleFormat, StreamWaveData, DEFAULT_RING_CAPACITY};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// Write a small WAV file and return its path.
    fn write_test_wav(
        dir: &tempfile::TempDir,
        name: &str,
        sample_rate: u32,
        channels: u16,
        frames: usize,
    ) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                // Audible ramp so decoded values are easy to check.
                let value = ((i % 1000) as i32 - 500) * 32;
                writer.write_sample(value as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_load_wav_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, "clip.wav", 48000, 2, 48000);
        let data = StreamWaveData::load_wav(&path, 0).unwrap();
        assert_eq!(data.channel_count(), 2);
        assert_eq!(data.source_sample_rate(), 48000);
        assert_eq!(data.total_source_frames(), 48000);
        assert_eq!(data.total_frames_48k(), 48000);
        assert_eq!(data.sample_format(), StreamSampleFormat::Pcm16);
    }

    #[test]
    fn test_prefill_provides_first_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, "clip.wav", 48000, 1, 8000);
        let data = StreamWaveData::load_wav(&path, 1024).unwrap();

        let available = data.ring_available();
        assert!(available >= 1024, "prefill too small: {available}");
        for i in 0..512usize {
            let expected = ((i % 1000) as i32 - 500) * 32;
            let got = data.ring_read_sample(i, 0);
            assert!(
                (got - expected as f64 / 32768.0).abs() < 1e-9,
                "frame {i} mismatch"
            );
        }
    }

    #[test]
    fn test_resampled_total_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, "clip44.wav", 44100, 1, 44100);
        let data = StreamWaveData::load_wav(&path, 0).unwrap();
        // One second of source is one second at 48 kHz.
        assert_eq!(data.total_frames_48k(), 48000);
        assert!(data.ring_available() > 0);
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i8).unwrap();
        writer.finalize().unwrap();
        assert!(StreamWaveData::load_wav(&path, 0).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(StreamWaveData::load_wav("/nonexistent/missing.wav", 0).is_err());
    }

    #[test]
    fn test_ring_consumption_and_refill_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, "clip.wav", 48000, 1, 48000);
        let data = StreamWaveData::load_wav(&path, 2048).unwrap();

        let before = data.ring_available();
        data.ring_advance_read(before / 2);
        // Direct fill (same code path the loader thread runs).
        data.prefill_sync();
        assert!(data.ring_available() >= before / 2);
    }

    #[test]
    fn test_loop_wrap_is_continuous() {
        let dir = tempfile::tempdir().unwrap();
        // Short clip, loop over the first 1000 frames.
        let path = write_test_wav(&dir, "looped.wav", 48000, 1, 2000);
        let data = StreamWaveData::load_wav(&path, 8192).unwrap();
        data.set_looping(true);
        data.set_loop_region(0, 1000);
        data.prefill_sync();

        // The ring holds several loop iterations; frame 1000 must equal
        // frame 0 again.
        assert!(data.ring_available() >= 2001);
        let first = data.ring_read_sample(0, 0);
        let wrapped = data.ring_read_sample(1000, 0);
        assert!((first - wrapped).abs() < 1e-9);
        assert!(data.loader_loops() >= 1);
    }

    #[test]
    fn test_seek_flushes_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(&dir, "clip.wav", 48000, 1, 48000);
        let data = StreamWaveData::load_wav(&path, 1024).unwrap();
        assert!(data.ring_available() > 0);
        data.seek(24000);
        // Flush is immediate even though the refill happens on the loader.
        assert_eq!(data.ring_available(), 0);
        data.wait_until_idle();
    }
}
