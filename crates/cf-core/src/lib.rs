//! cf-core: Shared types, traits, and utilities for ChipForge
//!
//! This crate provides the foundational types used across all ChipForge crates.

mod error;

pub use error::*;

/// Audio sample type used throughout the DSP code.
pub type Sample = f64;

/// Target sample rate of the synthesis core. Sampler and streaming sources
/// are resampled to this rate at load time.
pub const TARGET_SAMPLE_RATE: u32 = 48000;

/// Supported output sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
}

impl SampleRate {
    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Validate a raw rate value.
    pub fn from_u32(rate: u32) -> CfResult<Self> {
        match rate {
            44100 => Ok(Self::Hz44100),
            48000 => Ok(Self::Hz48000),
            other => Err(CfError::InvalidSampleRate(other)),
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}

/// Internal processing block length in frames.
///
/// Must be a power of two in [32, 8192]. The driver generates one block at a
/// time and copies into the host buffer through a residual buffer, so host
/// request sizes need not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BufferSize(u32);

impl BufferSize {
    pub const MIN: u32 = 32;
    pub const MAX: u32 = 8192;

    pub fn new(frames: u32) -> CfResult<Self> {
        if frames < Self::MIN || frames > Self::MAX || !frames.is_power_of_two() {
            return Err(CfError::InvalidBufferLength(frames));
        }
        Ok(Self(frames))
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Calculate latency in milliseconds
    #[inline]
    pub fn latency_ms(self, sample_rate: SampleRate) -> f64 {
        (self.as_usize() as f64 / sample_rate.as_f64()) * 1000.0
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self(512)
    }
}

/// Output channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChannelConfig {
    Mono,
    Stereo,
}

impl ChannelConfig {
    #[inline]
    pub fn count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }

    pub fn from_count(count: u32) -> CfResult<Self> {
        match count {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            other => Err(CfError::InvalidChannelCount(other)),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::Stereo
    }
}

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f64::NEG_INFINITY);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_bounds() {
        assert!(BufferSize::new(32).is_ok());
        assert!(BufferSize::new(8192).is_ok());
        assert!(BufferSize::new(512).is_ok());
        assert!(BufferSize::new(16).is_err());
        assert!(BufferSize::new(16384).is_err());
        assert!(BufferSize::new(500).is_err()); // not a power of two
    }

    #[test]
    fn test_sample_rate_validation() {
        assert_eq!(SampleRate::from_u32(48000).unwrap(), SampleRate::Hz48000);
        assert_eq!(SampleRate::from_u32(44100).unwrap(), SampleRate::Hz44100);
        assert!(SampleRate::from_u32(96000).is_err());
    }

    #[test]
    fn test_decibels_round_trip() {
        let db = Decibels(-6.0);
        let gain = db.to_gain();
        assert!((gain - 0.5011872).abs() < 1e-6);
        let back = Decibels::from_gain(gain);
        assert!((back.0 - db.0).abs() < 1e-9);
    }

    #[test]
    fn test_decibels_silence() {
        assert_eq!(Decibels::NEG_INF.to_gain(), 0.0);
        assert_eq!(Decibels::from_gain(0.0).0, f64::NEG_INFINITY);
    }
}
