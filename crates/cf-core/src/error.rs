//! Error types for ChipForge

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CfError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid sample rate: {0} (expected 44100 or 48000)")]
    InvalidSampleRate(u32),

    #[error("Invalid buffer length: {0} (expected a power of two in [32, 8192])")]
    InvalidBufferLength(u32),

    #[error("Invalid channel count: {0} (expected 1 or 2)")]
    InvalidChannelCount(u32),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedWavFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Result type alias
pub type CfResult<T> = Result<T, CfError>;
