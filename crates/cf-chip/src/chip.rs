//! The sound chip: fixed channel pools, shared pipes and the per-block
//! render driver.
//!
//! Every channel slot, operator and pipe is allocated here at construction
//! and reused for the chip's lifetime; nothing in the block path allocates.

use std::sync::Arc;

use cf_core::{BufferSize, CfError, CfResult};

use crate::channel::{Channel, RenderContext};
use crate::fm_channel::FmChannel;
use crate::pipe::ChipPipes;
use crate::sampler_channel::SamplerChannel;
use crate::sampler_data::SamplerTable;
use crate::stream::{StreamBank, StreamId, MASTER_STREAM, STREAM_SEND_SIZE};
use crate::stream_channel::StreamChannel;

/// Channel kinds a voice can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleType {
    #[default]
    Fm,
    Sampler,
    Stream,
}

/// Default pool sizes per module type.
pub const DEFAULT_FM_CHANNELS: usize = 16;
pub const DEFAULT_SAMPLER_CHANNELS: usize = 8;
pub const DEFAULT_STREAM_CHANNELS: usize = 4;

/// Number of sampler banks.
pub const SAMPLER_BANK_COUNT: usize = 4;

pub struct SoundChip {
    pipes: ChipPipes,
    channels: Vec<Channel>,
    /// Per-slot default stream targets (master unless a global effect chain
    /// claimed the slot).
    slot_targets: [StreamId; STREAM_SEND_SIZE],
    buffer_length: usize,
    bpm: f64,
    sampler_volume: f64,
    sampler_tables: [Arc<SamplerTable>; SAMPLER_BANK_COUNT],
}

impl SoundChip {
    pub fn new(buffer_length: BufferSize) -> Self {
        Self::with_pools(
            buffer_length,
            DEFAULT_FM_CHANNELS,
            DEFAULT_SAMPLER_CHANNELS,
            DEFAULT_STREAM_CHANNELS,
        )
    }

    pub fn with_pools(
        buffer_length: BufferSize,
        fm_channels: usize,
        sampler_channels: usize,
        stream_channels: usize,
    ) -> Self {
        let length = buffer_length.as_usize();
        let mut channels =
            Vec::with_capacity(fm_channels + sampler_channels + stream_channels);
        for _ in 0..fm_channels {
            channels.push(Channel::Fm(FmChannel::new(length)));
        }
        for _ in 0..sampler_channels {
            channels.push(Channel::Sampler(SamplerChannel::new()));
        }
        for _ in 0..stream_channels {
            channels.push(Channel::Stream(StreamChannel::new()));
        }

        Self {
            pipes: ChipPipes::new(length),
            channels,
            slot_targets: [MASTER_STREAM; STREAM_SEND_SIZE],
            buffer_length: length,
            bpm: 120.0,
            sampler_volume: 1.0,
            sampler_tables: std::array::from_fn(|_| Arc::new(SamplerTable::new())),
        }
    }

    #[inline]
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    #[inline]
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Propagate a tempo change to every BPM-synced LFO and stream channel.
    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
        for channel in &mut self.channels {
            match channel {
                Channel::Stream(ch) => ch.update_for_bpm(bpm),
                other => other.common_mut().update_lfo_for_bpm(bpm),
            }
        }
    }

    #[inline]
    pub fn sampler_volume(&self) -> f64 {
        self.sampler_volume
    }

    pub fn set_sampler_volume(&mut self, volume: f64) {
        self.sampler_volume = volume.clamp(0.0, 2.0);
    }

    pub fn set_slot_target(&mut self, slot: usize, target: StreamId) {
        self.slot_targets[slot & 3] = target;
    }

    pub fn sampler_table(&self, bank: usize) -> Arc<SamplerTable> {
        Arc::clone(&self.sampler_tables[bank & 3])
    }

    /// Install a sampler bank (control plane, before notes reference it).
    pub fn set_sampler_table(&mut self, bank: usize, table: SamplerTable) {
        self.sampler_tables[bank & 3] = Arc::new(table);
    }

    /// Find a free (idle, not note-on) channel of the requested kind.
    pub fn find_free_channel(&self, module: ModuleType) -> Option<usize> {
        self.channels.iter().position(|channel| {
            let kind_matches = matches!(
                (module, channel),
                (ModuleType::Fm, Channel::Fm(_))
                    | (ModuleType::Sampler, Channel::Sampler(_))
                    | (ModuleType::Stream, Channel::Stream(_))
            );
            kind_matches && channel.is_idling() && !channel.is_note_on()
        })
    }

    /// Re-initialize a channel slot for a fresh voice, attaching sampler
    /// banks where relevant.
    pub fn prepare_channel(&mut self, index: usize) -> CfResult<()> {
        if index >= self.channels.len() {
            return Err(CfError::Config(format!("channel index {index} out of range")));
        }
        let table = Arc::clone(&self.sampler_tables[0]);
        match &mut self.channels[index] {
            Channel::Fm(ch) => ch.initialize(None, 0),
            Channel::Sampler(ch) => {
                ch.initialize(None, 0);
                ch.set_sampler_table(table);
            }
            Channel::Stream(ch) => ch.initialize(None, 0),
        }
        Ok(())
    }

    /// Start-of-block housekeeping: per-channel cursor reset and idle check.
    pub fn begin_process(&mut self) {
        for channel in &mut self.channels {
            channel.reset_channel_buffer_status();
        }
    }

    /// Render every channel for one block into the stream bank.
    pub fn buffer_all(&mut self, bank: &mut StreamBank, length: usize) {
        let Self {
            pipes,
            channels,
            slot_targets,
            bpm,
            sampler_volume,
            ..
        } = self;
        let mut ctx = RenderContext {
            pipes,
            bank,
            slot_targets,
            bpm: *bpm,
            sampler_volume: *sampler_volume,
        };
        for channel in channels.iter_mut() {
            channel.buffer(&mut ctx, length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;
    use cf_tables::RefTables;

    fn chip() -> SoundChip {
        RefTables::initialize(SampleRate::Hz48000);
        SoundChip::with_pools(BufferSize::new(256).unwrap(), 2, 1, 1)
    }

    #[test]
    fn test_pool_layout() {
        let chip = chip();
        assert_eq!(chip.channel_count(), 4);
        assert!(chip.find_free_channel(ModuleType::Fm).is_some());
        assert!(chip.find_free_channel(ModuleType::Sampler).is_some());
        assert!(chip.find_free_channel(ModuleType::Stream).is_some());
    }

    #[test]
    fn test_find_free_skips_sounding_channels() {
        let mut chip = chip();
        let first = chip.find_free_channel(ModuleType::Fm).unwrap();
        if let Channel::Fm(ch) = chip.channel_mut(first) {
            ch.set_pitch(60 << 6);
            ch.note_on();
        }
        let second = chip.find_free_channel(ModuleType::Fm).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_block_render_is_silent_when_idle() {
        let mut chip = chip();
        let mut bank = StreamBank::new(256, 2);
        chip.begin_process();
        chip.buffer_all(&mut bank, 256);
        assert!(bank
            .get(MASTER_STREAM)
            .buffer()
            .iter()
            .all(|&value| value == 0.0));
    }

    #[test]
    fn test_active_fm_channel_reaches_master() {
        let mut chip = chip();
        let mut bank = StreamBank::new(256, 2);
        let index = chip.find_free_channel(ModuleType::Fm).unwrap();
        if let Channel::Fm(ch) = chip.channel_mut(index) {
            ch.set_algorithm(1, false, 0);
            ch.set_pitch(69 << 6);
            ch.note_on();
        }
        let mut peak = 0.0f64;
        for _ in 0..32 {
            bank.clear_all();
            chip.begin_process();
            chip.buffer_all(&mut bank, 256);
            for &value in bank.get(MASTER_STREAM).buffer() {
                peak = peak.max(value.abs());
            }
        }
        assert!(peak > 0.01, "peak {peak}");
    }
}
