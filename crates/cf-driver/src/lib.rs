//! cf-driver: the ChipForge synthesis driver
//!
//! Owns the block pipeline (mailbox drain, channel render, effect chains,
//! metering) behind the host's pull callback, plus the offline renderer
//! sharing the same path.

mod driver;
mod mailbox;
mod metering;
mod render;

pub use driver::{Driver, ExceptionMode, MAX_TRACKS};
pub use mailbox::{
    FilterStamp, FmOpParam, FmOpUpdate, FxEffectSpec, FxOp, FxUpdate, KeyOn, Mailbox,
    TrackUpdate, MAILBOX_CAPACITY,
};
pub use metering::{MeterSnapshot, Metering, METER_RING_SIZE};
pub use render::OfflineRenderer;

// Re-export the types a host needs to drive the core.
pub use cf_chip::{ChannelParams, ModuleType, OperatorParams, SamplerData, SamplerTable};
pub use cf_core::{CfError, CfResult};
pub use cf_stream::{shutdown_loader, StreamWaveData, DEFAULT_RING_CAPACITY};
