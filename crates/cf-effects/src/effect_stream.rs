//! Effect stream: an ordered effect chain over one mix stream, with bypass
//! bits, post-fader gain/pan, depth ordering and send fan-out.

use cf_chip::{StreamBank, StreamId, MASTER_STREAM, STREAM_SEND_SIZE};

use crate::Effect;

pub struct EffectStream {
    chain: Vec<Box<dyn Effect>>,
    bypassed: Vec<bool>,
    stream: StreamId,
    /// Deeper streams process first; master is depth 0.
    depth: i32,
    post_fader_gain: f64,
    /// 0..=128, 64 center.
    post_pan: i32,
    /// Send levels into the downstream slots (slot 0 = main output).
    volumes: [f64; STREAM_SEND_SIZE],
    outputs: [Option<StreamId>; STREAM_SEND_SIZE],
    has_effect_send: bool,
    mute: bool,
}

impl EffectStream {
    pub fn new(stream: StreamId, depth: i32) -> Self {
        Self {
            chain: Vec::new(),
            bypassed: Vec::new(),
            stream,
            depth,
            post_fader_gain: 1.0,
            post_pan: 64,
            volumes: [1.0, 0.0, 0.0, 0.0],
            outputs: [None; STREAM_SEND_SIZE],
            has_effect_send: false,
            mute: false,
        }
    }

    #[inline]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    #[inline]
    pub fn depth(&self) -> i32 {
        self.depth
    }

    #[inline]
    pub fn effect_count(&self) -> usize {
        self.chain.len()
    }

    #[inline]
    pub fn post_fader_gain(&self) -> f64 {
        self.post_fader_gain
    }

    pub fn set_post_fader_gain(&mut self, gain: f64) {
        self.post_fader_gain = gain.max(0.0);
    }

    #[inline]
    pub fn post_pan(&self) -> i32 {
        self.post_pan
    }

    pub fn set_post_pan(&mut self, pan: i32) {
        self.post_pan = pan.clamp(0, 128);
    }

    pub fn is_mute(&self) -> bool {
        self.mute
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub fn set_output(&mut self, slot: usize, target: Option<StreamId>) {
        self.outputs[slot & 3] = target;
    }

    pub fn set_stream_send(&mut self, slot: usize, volume: f64) {
        self.volumes[slot & 3] = volume.clamp(0.0, 2.0);
        self.has_effect_send = self.volumes[1..].iter().any(|&v| v > 0.0);
    }

    pub fn stream_send(&self, slot: usize) -> f64 {
        self.volumes[slot & 3]
    }

    // ---- Chain mutation ----

    pub fn set_chain(&mut self, chain: Vec<Box<dyn Effect>>) {
        self.bypassed = vec![false; chain.len()];
        self.chain = chain;
        self.prepare_process();
    }

    pub fn add_to_chain(&mut self, effect: Box<dyn Effect>) {
        self.chain.push(effect);
        self.bypassed.push(false);
    }

    pub fn insert_effect(&mut self, index: usize, effect: Box<dyn Effect>) {
        let index = index.min(self.chain.len());
        self.chain.insert(index, effect);
        self.bypassed.insert(index, false);
    }

    pub fn remove_effect(&mut self, index: usize) {
        if index < self.chain.len() {
            self.chain.remove(index);
            self.bypassed.remove(index);
        }
    }

    pub fn swap_effects(&mut self, a: usize, b: usize) {
        if a < self.chain.len() && b < self.chain.len() {
            self.chain.swap(a, b);
            self.bypassed.swap(a, b);
        }
    }

    pub fn set_effect_args(&mut self, index: usize, args: &[f64]) {
        if let Some(effect) = self.chain.get_mut(index) {
            effect.set_args(args);
        }
    }

    pub fn set_effect_bypass(&mut self, index: usize, bypassed: bool) {
        if let Some(flag) = self.bypassed.get_mut(index) {
            *flag = bypassed;
        }
    }

    pub fn is_effect_bypassed(&self, index: usize) -> bool {
        self.bypassed.get(index).copied().unwrap_or(false)
    }

    pub fn prepare_process(&mut self) -> usize {
        let mut channels = 2;
        for effect in &mut self.chain {
            channels = effect.prepare_process();
        }
        channels
    }

    pub fn reset(&mut self) {
        for effect in &mut self.chain {
            effect.reset();
        }
    }

    // ---- Block processing ----

    /// Run the chain over this stream's accumulator, then fan the processed,
    /// post-fader output into the downstream streams. Master (depth 0)
    /// processes in place only.
    pub fn process(&mut self, bank: &mut StreamBank, length: usize) {
        let mut channels = 2;
        {
            let stream = bank.get_mut(self.stream);
            let buffer = stream.buffer_mut();
            for (effect, &bypassed) in self.chain.iter_mut().zip(self.bypassed.iter()) {
                if !bypassed {
                    channels = effect.process(channels, buffer, 0, length);
                }
            }
        }

        if self.stream == MASTER_STREAM || self.mute {
            return;
        }

        // Fan out to the main target and any effect sends.
        for slot in 0..STREAM_SEND_SIZE {
            let volume = self.volumes[slot];
            if volume <= 0.0 {
                continue;
            }
            if slot > 0 && !self.has_effect_send {
                continue;
            }
            let target = self.outputs[slot].unwrap_or(MASTER_STREAM);
            if target == self.stream {
                continue;
            }
            let (source, destination) = bank.pair_mut(self.stream, target);
            destination.write_frames(
                source.buffer(),
                0,
                length,
                volume * self.post_fader_gain,
                self.post_pan,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::SampleRate;
    use cf_tables::RefTables;

    /// Test effect: multiplies everything by a constant.
    struct Gain(f64);
    impl Effect for Gain {
        fn prepare_process(&mut self) -> usize {
            2
        }
        fn process(&mut self, channels: usize, buffer: &mut [f64], start: usize, length: usize) -> usize {
            for value in buffer[start * 2..(start + length) * 2].iter_mut() {
                *value *= self.0;
            }
            channels
        }
        fn set_args(&mut self, args: &[f64]) {
            self.0 = args.first().copied().unwrap_or(1.0);
        }
        fn reset(&mut self) {}
    }

    fn bank_with_local() -> (StreamBank, StreamId) {
        RefTables::initialize(SampleRate::Hz48000);
        let mut bank = StreamBank::new(64, 2);
        let local = bank.allocate();
        (bank, local)
    }

    #[test]
    fn test_chain_runs_in_order() {
        let (mut bank, local) = bank_with_local();
        let mut stream = EffectStream::new(local, 1);
        stream.add_to_chain(Box::new(Gain(2.0)));
        stream.add_to_chain(Box::new(Gain(3.0)));
        bank.get_mut(local).buffer_mut().fill(1.0);

        stream.process(&mut bank, 64);
        // Chain 2x then 3x = 6x, then fanned into master at center pan.
        let expected = 6.0 * std::f64::consts::FRAC_1_SQRT_2;
        assert!((bank.get(MASTER_STREAM).buffer()[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_bypass_skips_effect() {
        let (mut bank, local) = bank_with_local();
        let mut stream = EffectStream::new(local, 1);
        stream.add_to_chain(Box::new(Gain(100.0)));
        stream.set_effect_bypass(0, true);
        bank.get_mut(local).buffer_mut().fill(0.5);

        stream.process(&mut bank, 64);
        let expected = 0.5 * std::f64::consts::FRAC_1_SQRT_2;
        assert!((bank.get(MASTER_STREAM).buffer()[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_post_fader_gain_applies_after_chain() {
        let (mut bank, local) = bank_with_local();
        let mut stream = EffectStream::new(local, 1);
        stream.set_post_fader_gain(0.25);
        bank.get_mut(local).buffer_mut().fill(1.0);

        stream.process(&mut bank, 64);
        let expected = 0.25 * std::f64::consts::FRAC_1_SQRT_2;
        assert!((bank.get(MASTER_STREAM).buffer()[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_insert_remove_swap() {
        let (_bank, local) = bank_with_local();
        let mut stream = EffectStream::new(local, 1);
        stream.add_to_chain(Box::new(Gain(1.0)));
        stream.insert_effect(0, Box::new(Gain(2.0)));
        assert_eq!(stream.effect_count(), 2);
        stream.swap_effects(0, 1);
        stream.remove_effect(0);
        assert_eq!(stream.effect_count(), 1);
        stream.remove_effect(5); // out of range is a no-op
        assert_eq!(stream.effect_count(), 1);
    }
}
