//! cf-chip: the ChipForge synthesis engines
//!
//! ## Modules
//! - `pipe` - shared block-sized integer pipes and operator routing records
//! - `operator` - FM operator (pulse generator + envelope generator)
//! - `channel` - shared channel state, SVF filter, LFO, kill fade, dispatch
//! - `fm_channel` - 1-4 operator FM with 16 algorithms and special modes
//! - `sampler_channel` / `sampler_data` - pitched 48 kHz PCM playback
//! - `stream_channel` / `warp` - disk-streamed clips with tempo warping
//! - `stream` - mix streams and the stream bank
//! - `chip` - channel pools and the per-block render driver

mod channel;
mod channel_params;
mod chip;
mod fm_channel;
mod operator;
mod pcm_data;
mod pipe;
mod sampler_channel;
mod sampler_data;
mod stream;
mod stream_channel;
mod warp;

pub use channel::{
    Channel, ChannelCommon, InputMode, LfoTimeMode, OutputMode, RenderContext, IDLING_THRESHOLD,
};
pub use channel_params::ChannelParams;
pub use chip::{
    ModuleType, SoundChip, DEFAULT_FM_CHANNELS, DEFAULT_SAMPLER_CHANNELS, DEFAULT_STREAM_CHANNELS,
};
pub use fm_channel::{FmChannel, ProcessType, CARRIER_MASKS};
pub use operator::{EgState, Operator, OperatorParams, MAX_SUPER_VOICES};
pub use pcm_data::PcmData;
pub use pipe::{ChipPipes, OpBase, OpInput, OpOutput, OpRouting, OUT_PIPE, PIPE_COUNT, RIGHT_PIPE};
pub use sampler_channel::SamplerChannel;
pub use sampler_data::{SamplerData, SamplerDataRef, SamplerTable};
pub use stream::{MixStream, StreamBank, StreamId, MASTER_STREAM, STREAM_SEND_SIZE};
pub use stream_channel::StreamChannel;
pub use warp::{Grain, WarpMode, WarpProcessor};
