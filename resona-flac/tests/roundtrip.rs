// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end encode/decode tests.

use std::cell::RefCell;
use std::io;
use std::io::Cursor;
use std::io::{Seek as _, Write as _};
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use resona_core::io::MediaSink;
use resona_flac::{
    DecoderOptions, EncoderOptions, ErrorStatus, SeekTableSpec, StreamDecoder, StreamEncoder,
};

/// A clonable, seekable, in-memory sink whose contents remain accessible after the encoder
/// consumes its half.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Cursor<Vec<u8>>>>);

impl SharedSink {
    fn bytes(&self) -> Vec<u8> {
        self.0.borrow().get_ref().clone()
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

impl io::Seek for SharedSink {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

impl MediaSink for SharedSink {
    fn is_seekable(&self) -> bool {
        true
    }
}

/// Encode planar channels into a byte vector.
fn encode(opts: EncoderOptions, channels: &[Vec<i32>]) -> Vec<u8> {
    let sink = SharedSink::default();

    let mut encoder = StreamEncoder::new(Box::new(sink.clone()), opts).unwrap();

    let buffers: Vec<&[i32]> = channels.iter().map(|c| c.as_slice()).collect();
    encoder.process(&buffers).unwrap();
    encoder.finish().unwrap();

    sink.bytes()
}

/// Decode a byte vector back into planar channels, asserting a clean decode.
fn decode(bytes: &[u8], md5_checking: bool) -> Vec<Vec<i32>> {
    let mut decoder = StreamDecoder::new(
        Box::new(Cursor::new(bytes.to_vec())),
        DecoderOptions { md5_checking },
    );

    let mut channels: Vec<Vec<i32>> = Vec::new();

    while let Some(block) = decoder.next_block().unwrap() {
        channels.resize(block.spec().channels, Vec::new());

        for (ch, out) in channels.iter_mut().enumerate() {
            out.extend_from_slice(block.chan(ch));
        }
    }

    assert!(decoder.drain_errors().is_empty());

    if md5_checking {
        assert_eq!(decoder.finish().md5_ok, Some(true));
    }

    channels
}

/// A compressible but non-trivial test signal.
fn tonal_signal(rng: &mut SmallRng, len: usize, bits_per_sample: u32) -> Vec<i32> {
    let amplitude = f64::from((1i32 << (bits_per_sample - 1)) - 1) * 0.7;
    let noise = 1.max((1i32 << (bits_per_sample - 1)) / 256);

    (0..len)
        .map(|i| {
            let tone = (i as f64 * 0.013).sin() * amplitude * 0.8
                + (i as f64 * 0.21).sin() * amplitude * 0.05;
            tone as i32 + rng.gen_range(-noise..=noise)
        })
        .collect()
}

#[test]
fn scenario_silence_mono() {
    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        padding: None,
        ..Default::default()
    };

    let samples = vec![vec![0i32; 8192]];

    let sink = SharedSink::default();
    let mut encoder = StreamEncoder::new(Box::new(sink.clone()), opts).unwrap();

    encoder.process(&[samples[0].as_slice()]).unwrap();

    assert_eq!(encoder.frames_written(), 2);
    assert_eq!(encoder.samples_written(), 8192);

    encoder.finish().unwrap();

    let bytes = sink.bytes();

    // Two constant subframes compress to almost nothing: marker + stream info + two tiny
    // frames.
    assert!(bytes.len() < 80, "silence encoded to {} bytes", bytes.len());

    let decoded = decode(&bytes, true);

    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0], samples[0]);
}

#[test]
fn scenario_counter_mid_side() {
    let left: Vec<i32> = (0..2048).collect();
    let right: Vec<i32> = (0..2048).map(|i| -i).collect();

    let base = EncoderOptions {
        channels: 2,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 1024,
        padding: None,
        ..Default::default()
    };

    let opts_ms = EncoderOptions { do_mid_side: true, ..base.clone() };
    let opts_ind = base;

    let bytes_ms = encode(opts_ms, &[left.clone(), right.clone()]);
    let bytes_ind = encode(opts_ind, &[left.clone(), right.clone()]);

    // The mid channel is identically zero (L + R == 0) and the side channel is a ramp, so
    // mid/side must clearly win over independent coding.
    assert!(bytes_ms.len() < bytes_ind.len());

    let decoded = decode(&bytes_ms, true);

    assert_eq!(decoded[0], left);
    assert_eq!(decoded[1], right);
}

#[test]
fn scenario_seek_with_table() {
    let mut rng = SmallRng::seed_from_u64(7);

    let total = 441_000usize;
    let signal = vec![tonal_signal(&mut rng, total, 16)];

    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        total_samples_estimate: total as u64,
        seek_table_spec: Some(SeekTableSpec::parse("1s").unwrap()),
        ..Default::default()
    };

    let bytes = encode(opts, &signal);

    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    decoder.read_metadata().unwrap();

    let table = decoder.seek_table().expect("seek table present").clone();
    assert!(table.is_legal());
    assert!(table.points.iter().filter(|p| !p.is_placeholder()).count() >= 10);

    // Seek to the 5 second mark and verify that delivery begins exactly there and continues
    // contiguously to the end of the stream.
    let target = 220_500u64;

    decoder.seek_to_sample(target).unwrap();

    let mut decoded: Vec<i32> = Vec::new();
    let mut next_expected = target;

    while let Some(block) = decoder.next_block().unwrap() {
        assert_eq!(block.first_sample(), next_expected);
        next_expected += block.len() as u64;
        decoded.extend_from_slice(block.chan(0));
    }

    assert_eq!(decoded, &signal[0][target as usize..]);

    // Seeking backwards to the very beginning also works.
    decoder.seek_to_sample(0).unwrap();

    let block = decoder.next_block().unwrap().expect("block after seek");
    assert_eq!(block.first_sample(), 0);
    assert_eq!(block.chan(0), &signal[0][..block.len()]);
}

#[test]
fn scenario_corrupted_frame() {
    let mut rng = SmallRng::seed_from_u64(11);

    let n_frames = 5usize;
    let block_size = 4096usize;
    let signal = vec![tonal_signal(&mut rng, n_frames * block_size, 16)];

    // A seek point at every frame exposes each frame's byte offset.
    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: block_size as u32,
        total_samples_estimate: (n_frames * block_size) as u64,
        seek_table_spec: Some(SeekTableSpec::parse("0;4096;8192;12288;16384").unwrap()),
        padding: None,
        ..Default::default()
    };

    let mut bytes = encode(opts, &signal);

    // Locate the frame boundaries through the seek table.
    let mut probe =
        StreamDecoder::new(Box::new(Cursor::new(bytes.clone())), DecoderOptions::default());
    probe.read_metadata().unwrap();

    let table = probe.seek_table().unwrap().clone();

    // marker + stream info block + seek table block headers and payloads.
    let first_frame_offset = 4 + (4 + 34) + (4 + 18 * table.points.len());

    // The third frame ends where the fourth begins; its final two bytes are its CRC-16.
    let third_frame_end = first_frame_offset as u64 + table.points[3].byte_offset;

    bytes[third_frame_end as usize - 1] ^= 0x01;

    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    let mut blocks = 0usize;

    while let Some(block) = decoder.next_block().unwrap() {
        let start = (blocks * block_size) as usize;

        if blocks == 2 {
            // The corrupted frame is delivered as silence.
            assert!(block.chan(0).iter().all(|&s| s == 0));
        }
        else {
            assert_eq!(block.chan(0), &signal[0][start..start + block.len()]);
        }

        blocks += 1;
    }

    assert_eq!(blocks, n_frames);

    let errors = decoder.drain_errors();
    assert_eq!(errors, vec![ErrorStatus::FrameCrcMismatch]);
}

#[test]
fn scenario_id3_prefix() {
    let mut rng = SmallRng::seed_from_u64(13);

    let signal = vec![tonal_signal(&mut rng, 4096, 16)];

    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        ..Default::default()
    };

    let clean = encode(opts, &signal);

    // An ID3v2.3 tag header declaring 10 bytes of content, followed by that content.
    let mut bytes = b"ID3\x03\x00\x00\x00\x00\x00\x0a".to_vec();
    bytes.extend_from_slice(&[0u8; 10]);
    bytes.extend_from_slice(&clean);

    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions::default());

    let mut decoded: Vec<i32> = Vec::new();

    while let Some(block) = decoder.next_block().unwrap() {
        decoded.extend_from_slice(block.chan(0));
    }

    assert!(decoder.drain_errors().is_empty());
    assert_eq!(decoded, signal[0]);
}

#[test]
fn scenario_verify_loop() {
    let mut rng = SmallRng::seed_from_u64(17);

    let signal: Vec<Vec<i32>> = (0..2)
        .map(|_| (0..4096).map(|_| rng.gen_range(-(1 << 23)..(1 << 23))).collect())
        .collect();

    let opts = EncoderOptions {
        channels: 2,
        bits_per_sample: 24,
        sample_rate: 48_000,
        block_size: 4096,
        do_mid_side: true,
        verify: true,
        ..Default::default()
    };

    let sink = SharedSink::default();
    let mut encoder = StreamEncoder::new(Box::new(sink.clone()), opts).unwrap();

    let buffers: Vec<&[i32]> = signal.iter().map(|c| c.as_slice()).collect();
    encoder.process(&buffers).unwrap();

    assert!(encoder.verify_mismatch().is_none());

    encoder.finish().unwrap();

    let decoded = decode(&sink.bytes(), true);

    assert_eq!(decoded[0], signal[0]);
    assert_eq!(decoded[1], signal[1]);
}

#[test]
fn roundtrip_parameter_matrix() {
    let mut rng = SmallRng::seed_from_u64(23);

    for &channels in &[1u32, 2] {
        for &bits_per_sample in &[8u32, 16, 24] {
            for &block_size in &[192u32, 1024, 4096] {
                // An awkward length forces a short final frame.
                let len = block_size as usize * 3 + 777;

                let signal: Vec<Vec<i32>> = (0..channels)
                    .map(|_| tonal_signal(&mut rng, len, bits_per_sample))
                    .collect();

                let opts = EncoderOptions {
                    channels,
                    bits_per_sample,
                    sample_rate: 48_000,
                    block_size,
                    do_mid_side: channels == 2,
                    ..Default::default()
                };

                let bytes = encode(opts, &signal);
                let decoded = decode(&bytes, true);

                assert_eq!(
                    decoded, signal,
                    "mismatch at channels={} bps={} blocksize={}",
                    channels, bits_per_sample, block_size
                );
            }
        }
    }
}

#[test]
fn roundtrip_exhaustive_search() {
    let mut rng = SmallRng::seed_from_u64(29);

    let signal: Vec<Vec<i32>> =
        (0..2).map(|_| tonal_signal(&mut rng, 3 * 1152 + 35, 16)).collect();

    let opts = EncoderOptions {
        channels: 2,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 1152,
        do_mid_side: true,
        do_exhaustive_model_search: true,
        do_qlp_coeff_prec_search: true,
        rice_parameter_search_dist: 2,
        max_residual_partition_order: 6,
        ..Default::default()
    };

    let bytes = encode(opts, &signal);
    let decoded = decode(&bytes, true);

    assert_eq!(decoded, signal);
}

#[test]
fn roundtrip_loose_mid_side() {
    let mut rng = SmallRng::seed_from_u64(31);

    let signal: Vec<Vec<i32>> = (0..2).map(|_| tonal_signal(&mut rng, 20_000, 16)).collect();

    let opts = EncoderOptions {
        channels: 2,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 1024,
        do_mid_side: true,
        loose_mid_side: true,
        ..Default::default()
    };

    let bytes = encode(opts, &signal);
    let decoded = decode(&bytes, true);

    assert_eq!(decoded, signal);
}

#[test]
fn roundtrip_wasted_bits() {
    let mut rng = SmallRng::seed_from_u64(37);

    // Samples sharing a factor of 16 exercise the wasted-bits path.
    let signal: Vec<Vec<i32>> =
        vec![tonal_signal(&mut rng, 8192, 11).iter().map(|s| s << 4).collect()];

    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        ..Default::default()
    };

    let bytes = encode(opts, &signal);
    let decoded = decode(&bytes, true);

    assert_eq!(decoded, signal);
}

#[test]
fn roundtrip_interleaved_matches_planar() {
    let mut rng = SmallRng::seed_from_u64(41);

    let left = tonal_signal(&mut rng, 10_000, 16);
    let right = tonal_signal(&mut rng, 10_000, 16);

    let opts = EncoderOptions {
        channels: 2,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        do_mid_side: true,
        ..Default::default()
    };

    let planar = encode(opts.clone(), &[left.clone(), right.clone()]);

    let mut interleaved = Vec::with_capacity(left.len() * 2);
    for (l, r) in left.iter().zip(&right) {
        interleaved.push(*l);
        interleaved.push(*r);
    }

    let sink = SharedSink::default();
    let mut encoder = StreamEncoder::new(Box::new(sink.clone()), opts).unwrap();
    encoder.process_interleaved(&interleaved).unwrap();
    encoder.finish().unwrap();

    assert_eq!(planar, sink.bytes());
}

#[test]
fn sync_recovers_from_inserted_garbage() {
    let mut rng = SmallRng::seed_from_u64(43);

    let block_size = 4096usize;
    let signal = vec![tonal_signal(&mut rng, 2 * block_size, 16)];

    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: block_size as u32,
        total_samples_estimate: (2 * block_size) as u64,
        seek_table_spec: Some(SeekTableSpec::parse("0;4096").unwrap()),
        padding: None,
        ..Default::default()
    };

    let bytes = encode(opts, &signal);

    // Splice garbage bytes between the two frames.
    let mut probe =
        StreamDecoder::new(Box::new(Cursor::new(bytes.clone())), DecoderOptions::default());
    probe.read_metadata().unwrap();
    let table = probe.seek_table().unwrap().clone();

    let first_frame_offset = 4 + (4 + 34) + (4 + 18 * table.points.len());
    let splice_at = first_frame_offset as u64 + table.points[1].byte_offset;

    let mut corrupt = bytes[..splice_at as usize].to_vec();
    corrupt.extend_from_slice(&[0x55, 0x11, 0x22, 0x33]);
    corrupt.extend_from_slice(&bytes[splice_at as usize..]);

    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(corrupt)), DecoderOptions::default());

    let mut decoded: Vec<i32> = Vec::new();

    while let Some(block) = decoder.next_block().unwrap() {
        decoded.extend_from_slice(block.chan(0));
    }

    // Both frames decode despite the garbage, which is reported as a sync loss.
    assert_eq!(decoded, signal[0]);
    assert!(decoder.drain_errors().contains(&ErrorStatus::LostSync));
}

#[test]
fn unseekable_sink_keeps_placeholders() {
    let mut rng = SmallRng::seed_from_u64(47);

    let signal = vec![tonal_signal(&mut rng, 4096, 16)];

    let opts = EncoderOptions {
        channels: 1,
        bits_per_sample: 16,
        sample_rate: 44_100,
        block_size: 4096,
        ..Default::default()
    };

    // A pipe-like sink: bytes out, no revisiting.
    let sink = SharedPipe::default();

    let mut encoder = StreamEncoder::new(Box::new(sink.clone()), opts).unwrap();
    encoder.process(&[signal[0].as_slice()]).unwrap();
    encoder.finish().unwrap();

    let bytes = sink.0.borrow().clone();

    let mut decoder =
        StreamDecoder::new(Box::new(Cursor::new(bytes)), DecoderOptions { md5_checking: true });

    decoder.read_metadata().unwrap();

    // The totals were never rewritten.
    let info = decoder.stream_info().unwrap();
    assert_eq!(info.n_samples, None);
    assert_eq!(info.md5, None);

    let mut decoded: Vec<i32> = Vec::new();
    while let Some(block) = decoder.next_block().unwrap() {
        decoded.extend_from_slice(block.chan(0));
    }

    assert_eq!(decoded, signal[0]);

    // With no signature in the stream there is nothing to check against.
    assert_eq!(decoder.finish().md5_ok, None);
}

/// An unseekable shared sink.
#[derive(Clone, Default)]
struct SharedPipe(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for SharedPipe {
    fn seek(&mut self, _: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe does not support seeking"))
    }
}

impl MediaSink for SharedPipe {
    fn is_seekable(&self) -> bool {
        false
    }
}
