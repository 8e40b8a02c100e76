// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `audio` module provides the planar sample buffer shared between the encoder and decoder.

/// `SignalSpec` describes the characteristics of a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalSpec {
    /// The signal sampling rate in hertz (Hz).
    pub rate: u32,
    /// The number of channels.
    pub channels: usize,
    /// The width of each sample in bits.
    pub bits_per_sample: u32,
}

impl SignalSpec {
    pub fn new(rate: u32, channels: usize, bits_per_sample: u32) -> Self {
        SignalSpec { rate, channels, bits_per_sample }
    }
}

/// An `AudioBlock` is a planar buffer of signed 32-bit samples holding one block of audio across
/// all channels. Samples of narrower widths are stored with their numeric value; the bit width of
/// the signal is carried by the block's [`SignalSpec`].
pub struct AudioBlock {
    spec: SignalSpec,
    planes: Vec<Vec<i32>>,
    /// The number of samples per channel.
    len: usize,
    /// The absolute stream position of the first sample in the block.
    first_sample: u64,
}

impl AudioBlock {
    /// Instantiate a new, empty, `AudioBlock` for the given signal.
    pub fn new(spec: SignalSpec) -> Self {
        let planes = vec![Vec::new(); spec.channels];
        AudioBlock { spec, planes, len: 0, first_sample: 0 }
    }

    /// The signal parameters of the block.
    pub fn spec(&self) -> SignalSpec {
        self.spec
    }

    /// The number of samples per channel.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the block holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The absolute stream position of the first sample in the block.
    pub fn first_sample(&self) -> u64 {
        self.first_sample
    }

    /// Update the signal parameters and resize every plane to `len` zeroed samples.
    pub fn reset(&mut self, spec: SignalSpec, len: usize, first_sample: u64) {
        self.planes.resize(spec.channels, Vec::new());

        for plane in self.planes.iter_mut() {
            plane.clear();
            plane.resize(len, 0);
        }

        self.spec = spec;
        self.len = len;
        self.first_sample = first_sample;
    }

    /// Fill every sample of every channel with zero.
    pub fn fill_zero(&mut self) {
        for plane in self.planes.iter_mut() {
            plane.iter_mut().for_each(|s| *s = 0);
        }
    }

    /// Gets an immutable slice of the samples of the given channel.
    pub fn chan(&self, ch: usize) -> &[i32] {
        &self.planes[ch][..self.len]
    }

    /// Gets a mutable slice of the samples of the given channel.
    pub fn chan_mut(&mut self, ch: usize) -> &mut [i32] {
        &mut self.planes[ch][..self.len]
    }

    /// Gets mutable slices of two different channels at once.
    pub fn chan_pair_mut(&mut self, first: usize, second: usize) -> (&mut [i32], &mut [i32]) {
        // Both channels must be unique.
        assert!(first != second);

        let len = self.len;

        if first < second {
            let (a, b) = self.planes.split_at_mut(second);
            (&mut a[first][..len], &mut b[0][..len])
        }
        else {
            let (a, b) = self.planes.split_at_mut(first);
            (&mut b[0][..len], &mut a[second][..len])
        }
    }

    /// Drops the first `count` samples of every channel, advancing the block's first sample
    /// position. Used to deliver a partial block after a mid-frame seek.
    pub fn trim_start(&mut self, count: usize) {
        let count = count.min(self.len);

        for plane in self.planes.iter_mut() {
            plane.drain(..count);
        }

        self.len -= count;
        self.first_sample += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::{AudioBlock, SignalSpec};

    #[test]
    fn verify_audio_block() {
        let mut block = AudioBlock::new(SignalSpec::new(44_100, 2, 16));

        block.reset(SignalSpec::new(44_100, 2, 16), 4, 100);

        block.chan_mut(0).copy_from_slice(&[1, 2, 3, 4]);
        block.chan_mut(1).copy_from_slice(&[-1, -2, -3, -4]);

        {
            let (left, right) = block.chan_pair_mut(0, 1);
            left[0] += 10;
            right[0] -= 10;
        }

        assert_eq!(block.chan(0), &[11, 2, 3, 4]);
        assert_eq!(block.chan(1), &[-11, -2, -3, -4]);

        block.trim_start(3);

        assert_eq!(block.len(), 1);
        assert_eq!(block.first_sample(), 103);
        assert_eq!(block.chan(0), &[4]);
        assert_eq!(block.chan(1), &[-4]);
    }
}
