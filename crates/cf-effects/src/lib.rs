//! cf-effects: post-voice effect chains for ChipForge
//!
//! - `Effect` trait + name registry
//! - `EffectStream`: an ordered chain over one mix stream with post-fader
//!   gain/pan and depth-ordered fan-out
//! - `Effector`: master chain, global send slots and per-track inserts
//! - Effects: Linkwitz-Riley crossover filter, multiband compressor,
//!   stereo delay, single-band compressor

mod compressor;
mod effect_stream;
mod effector;
mod linkwitz_riley;
mod mb_compressor;
mod stereo_delay;

pub use compressor::SingleBandCompressor;
pub use effect_stream::EffectStream;
pub use effector::Effector;
pub use linkwitz_riley::LinkwitzRileyFilter;
pub use mb_compressor::{BandMode, MultibandCompressor};
pub use stereo_delay::{DelayTimeMode, StereoDelay};

/// One effect instance processing interleaved stereo buffers in place.
pub trait Effect: Send {
    /// Reset transient state before (re)joining a chain. Returns the channel
    /// count the effect produces (1 or 2).
    fn prepare_process(&mut self) -> usize;

    /// Process `length` frames of `buffer` starting at frame `start`.
    /// `channels` is the channel count flowing in; returns the count out.
    fn process(&mut self, channels: usize, buffer: &mut [f64], start: usize, length: usize)
        -> usize;

    /// Apply a positional argument list (the batched setter form).
    fn set_args(&mut self, args: &[f64]);

    /// Clear all processing state.
    fn reset(&mut self);
}

/// Construct an effect by registry name.
pub fn create_effect(name: &str, sample_rate: f64) -> Option<Box<dyn Effect>> {
    match name {
        "mb_compressor" | "mbcomp" => Some(Box::new(MultibandCompressor::new(sample_rate))),
        "comp" | "compressor" => Some(Box::new(SingleBandCompressor::new(sample_rate))),
        "lr_filter" | "crossover" => Some(Box::new(LinkwitzRileyFilter::new(sample_rate))),
        "delay" | "stereo_delay" => Some(Box::new(StereoDelay::new(sample_rate))),
        _ => {
            log::warn!("cf-effects: unknown effect '{name}'");
            None
        }
    }
}

/// Positional-argument helper shared by the effects: missing entries fall
/// back to the default.
#[inline]
pub(crate) fn arg(args: &[f64], index: usize, default: f64) -> f64 {
    args.get(index).copied().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_known_names() {
        assert!(create_effect("mb_compressor", 48000.0).is_some());
        assert!(create_effect("comp", 48000.0).is_some());
        assert!(create_effect("lr_filter", 48000.0).is_some());
        assert!(create_effect("stereo_delay", 48000.0).is_some());
        assert!(create_effect("does_not_exist", 48000.0).is_none());
    }
}
