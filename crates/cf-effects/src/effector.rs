//! Effector: owns the master chain, the global send slots and the per-track
//! insert streams, and runs them deepest-first each block.

use cf_chip::{SoundChip, StreamBank, StreamId, MASTER_STREAM, STREAM_SEND_SIZE};

use crate::{create_effect, EffectStream};

pub struct Effector {
    sample_rate: f64,
    master: EffectStream,
    /// Global effect chains bound to send slots 1..=3.
    global: [Option<EffectStream>; STREAM_SEND_SIZE],
    /// Per-track insert chains (driver maps track ids to indices here).
    locals: Vec<EffectStream>,
}

impl Effector {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            master: EffectStream::new(MASTER_STREAM, 0),
            global: [None, None, None, None],
            locals: Vec::new(),
        }
    }

    #[inline]
    pub fn master(&mut self) -> &mut EffectStream {
        &mut self.master
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Instantiate a registry effect at this effector's sample rate.
    pub fn create_effect_instance(&self, name: &str) -> Option<Box<dyn crate::Effect>> {
        create_effect(name, self.sample_rate)
    }

    // ---- Global slots ----

    /// Bind an effect chain to a global send slot (1..=3). The chip's slot
    /// target is pointed at the new stream so channel sends land in it.
    pub fn create_global_effect(
        &mut self,
        slot: usize,
        bank: &mut StreamBank,
        chip: &mut SoundChip,
    ) -> Option<&mut EffectStream> {
        if slot == 0 || slot >= STREAM_SEND_SIZE {
            log::warn!("Effector: invalid global effect slot {slot}");
            return None;
        }
        if self.global[slot].is_none() {
            let stream_id = bank.allocate();
            self.global[slot] = Some(EffectStream::new(stream_id, 1));
            chip.set_slot_target(slot, stream_id);
        }
        self.global[slot].as_mut()
    }

    pub fn global_effect(&mut self, slot: usize) -> Option<&mut EffectStream> {
        self.global.get_mut(slot)?.as_mut()
    }

    // ---- Local (per-track) streams ----

    /// Allocate a per-track insert stream at the given depth (>= 1).
    /// Returns an index into the local stream list.
    pub fn create_local_effect(&mut self, depth: i32, bank: &mut StreamBank) -> usize {
        let stream_id = bank.allocate();
        self.locals
            .push(EffectStream::new(stream_id, depth.max(1)));
        self.locals.len() - 1
    }

    #[inline]
    pub fn local(&mut self, index: usize) -> Option<&mut EffectStream> {
        self.locals.get_mut(index)
    }

    #[inline]
    pub fn local_ref(&self, index: usize) -> Option<&EffectStream> {
        self.locals.get(index)
    }

    pub fn local_stream_id(&self, index: usize) -> Option<StreamId> {
        self.locals.get(index).map(|stream| stream.stream())
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    // ---- Block processing ----

    /// Process every chain for one block: locals and globals deepest-first,
    /// master last.
    pub fn process_all(&mut self, bank: &mut StreamBank, length: usize) {
        let max_depth = self
            .locals
            .iter()
            .map(EffectStream::depth)
            .chain(
                self.global
                    .iter()
                    .flatten()
                    .map(EffectStream::depth),
            )
            .max()
            .unwrap_or(0);

        let mut depth = max_depth;
        while depth >= 1 {
            for stream in self.locals.iter_mut().filter(|s| s.depth() == depth) {
                stream.process(bank, length);
            }
            for stream in self.global.iter_mut().flatten().filter(|s| s.depth() == depth) {
                stream.process(bank, length);
            }
            depth -= 1;
        }

        self.master.process(bank, length);
    }

    pub fn reset(&mut self) {
        self.master.reset();
        for stream in self.global.iter_mut().flatten() {
            stream.reset();
        }
        for stream in &mut self.locals {
            stream.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{BufferSize, SampleRate};
    use cf_tables::RefTables;

    fn setup() -> (Effector, StreamBank, SoundChip) {
        RefTables::initialize(SampleRate::Hz48000);
        (
            Effector::new(48000.0),
            StreamBank::new(64, 2),
            SoundChip::with_pools(BufferSize::new(64).unwrap(), 1, 0, 0),
        )
    }

    #[test]
    fn test_global_slot_allocates_once() {
        let (mut effector, mut bank, mut chip) = setup();
        effector.create_global_effect(1, &mut bank, &mut chip);
        let count = bank.len();
        effector.create_global_effect(1, &mut bank, &mut chip);
        assert_eq!(bank.len(), count, "slot must reuse its stream");
        assert!(effector.create_global_effect(0, &mut bank, &mut chip).is_none());
    }

    #[test]
    fn test_local_streams_feed_master() {
        let (mut effector, mut bank, _chip) = setup();
        let local = effector.create_local_effect(1, &mut bank);
        let id = effector.local_stream_id(local).unwrap();
        bank.get_mut(id).buffer_mut().fill(0.5);

        effector.process_all(&mut bank, 64);
        let expected = 0.5 * std::f64::consts::FRAC_1_SQRT_2;
        assert!((bank.get(MASTER_STREAM).buffer()[10] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_depth_ordering_deeper_first() {
        let (mut effector, mut bank, _chip) = setup();
        // Local at depth 2 feeds a local at depth 1 which feeds master.
        let deep = effector.create_local_effect(2, &mut bank);
        let shallow = effector.create_local_effect(1, &mut bank);
        let shallow_id = effector.local_stream_id(shallow).unwrap();
        let deep_id = effector.local_stream_id(deep).unwrap();

        effector.local(deep).unwrap().set_output(0, Some(shallow_id));
        bank.get_mut(deep_id).buffer_mut().fill(1.0);

        effector.process_all(&mut bank, 64);
        // The signal traversed both post-pan stages (two center pans).
        let expected = 0.5; // 1.0 * 0.707 * 0.707
        assert!((bank.get(MASTER_STREAM).buffer()[0] - expected).abs() < 1e-9);
    }
}
