// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use resona_core::errors::{verify_error, Result};
use resona_core::io::MediaSource;

use crate::decoder::{DecoderOptions, StreamDecoder};

/// The recorded context of the first verification mismatch.
#[derive(Clone, Debug)]
pub struct VerifyMismatch {
    /// The absolute stream position of the mismatched sample.
    pub absolute_sample: u64,
    /// The frame the mismatch occurred in.
    pub frame_number: u64,
    /// The channel the mismatch occurred in.
    pub channel: usize,
    /// The sample's index within the frame.
    pub sample_index: usize,
    /// The original sample value.
    pub expected: i32,
    /// The value the decoder reconstructed.
    pub got: i32,
}

/// An unseekable, in-memory byte queue. The encoder's write path appends the bytes it emits;
/// the embedded verification decoder consumes them. Both ends live on the same thread.
#[derive(Clone, Default)]
struct SharedByteQueue(Rc<RefCell<VecDeque<u8>>>);

impl io::Read for SharedByteQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.0.borrow_mut();

        let n = buf.len().min(queue.len());

        for (dst, src) in buf.iter_mut().zip(queue.drain(..n)) {
            *dst = src;
        }

        Ok(n)
    }
}

impl io::Seek for SharedByteQueue {
    fn seek(&mut self, _: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "byte queue does not support seeking"))
    }
}

impl MediaSource for SharedByteQueue {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// A `Verifier` tails an encoder's output with an embedded decoder and checks every decoded
/// sample against the original samples held in a per-channel FIFO.
///
/// The encoder pushes each block's original samples before emitting the frame, feeds the frame
/// bytes as they are written, and then drives [`Verifier::verify_frame`] exactly once per frame.
/// Because a whole frame is always queued before the decoder is driven, the byte queue never
/// runs dry mid-frame.
pub(crate) struct Verifier {
    queue: SharedByteQueue,
    decoder: StreamDecoder,
    /// The original samples not yet matched against decoded output, per channel.
    fifo: Vec<VecDeque<i32>>,
    /// The absolute stream position of the FIFO head.
    head_sample: u64,
    frames_verified: u64,
    mismatch: Option<VerifyMismatch>,
}

impl Verifier {
    pub fn new() -> Verifier {
        let queue = SharedByteQueue::default();

        let mut decoder = StreamDecoder::new(Box::new(queue.clone()), DecoderOptions::default());

        // The stream information's total sample count may be a (wrong) estimate at this point;
        // the tailing decoder must keep consuming frames regardless.
        decoder.ignore_stream_length();

        Verifier {
            queue,
            decoder,
            fifo: Vec::new(),
            head_sample: 0,
            frames_verified: 0,
            mismatch: None,
        }
    }

    /// Append encoder output to the byte queue.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.queue.0.borrow_mut().extend(bytes);
    }

    /// Append one block of original samples to the comparison FIFO.
    pub fn push_samples(&mut self, signal: &[Vec<i32>], n: usize) {
        if self.fifo.len() != signal.len() {
            self.fifo = vec![VecDeque::new(); signal.len()];
        }

        for (fifo, chan) in self.fifo.iter_mut().zip(signal) {
            fifo.extend(&chan[..n]);
        }
    }

    /// Decode the frame most recently fed to the queue and compare it against the FIFO head.
    /// Matched samples are dequeued.
    pub fn verify_frame(&mut self) -> Result<()> {
        let block = match self.decoder.next_block() {
            Ok(Some(block)) => block,
            Ok(None) => return verify_error("flac: verification decoder ended prematurely"),
            Err(_) => return verify_error("flac: verification decoder failed"),
        };

        let n = block.len();
        let n_channels = block.spec().channels;

        if n_channels != self.fifo.len() || self.fifo.iter().any(|fifo| fifo.len() < n) {
            return verify_error("flac: verification decoder produced unexpected output");
        }

        for ch in 0..n_channels {
            let decoded = block.chan(ch);
            let original = &self.fifo[ch];

            for (i, &got) in decoded.iter().enumerate() {
                let expected = original[i];

                if got != expected {
                    self.mismatch = Some(VerifyMismatch {
                        absolute_sample: self.head_sample + i as u64,
                        frame_number: self.frames_verified,
                        channel: ch,
                        sample_index: i,
                        expected,
                        got,
                    });

                    return verify_error("flac: decoded output does not match the input");
                }
            }
        }

        for fifo in self.fifo.iter_mut() {
            fifo.drain(..n);
        }

        self.head_sample += n as u64;
        self.frames_verified += 1;

        Ok(())
    }

    /// The context of the first mismatch, if one was found.
    pub fn mismatch(&self) -> Option<&VerifyMismatch> {
        self.mismatch.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::SharedByteQueue;
    use std::io::Read;

    #[test]
    fn verify_shared_byte_queue() {
        let mut queue = SharedByteQueue::default();
        let mut tail = queue.clone();

        queue.0.borrow_mut().extend(b"abcdef");

        let mut buf = [0u8; 4];
        assert_eq!(tail.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        // Drained bytes are gone; the remainder is served next.
        assert_eq!(tail.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");

        // An empty queue reads zero bytes rather than blocking.
        assert_eq!(tail.read(&mut buf).unwrap(), 0);
    }
}
