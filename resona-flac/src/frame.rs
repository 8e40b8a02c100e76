// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use resona_core::checksum::{crc8_of, Crc8Ccitt};
use resona_core::errors::{decode_error, unsupported_error, Result};
use resona_core::io::{BitWriter, Monitor, MonitorStream, ReadBytes};

/// The minimum FLAC frame header size including the sync bytes.
pub const FLAC_MIN_FRAME_HEADER_SIZE: usize = 6;
/// The maximum FLAC frame header size including the sync bytes.
pub const FLAC_MAX_FRAME_HEADER_SIZE: usize = 16;

/// `BlockingStrategy` describes how a stream sequences its frames: a fixed-blocksize stream
/// counts frames, a variable-blocksize stream counts samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockingStrategy {
    Fixed,
    Variable,
}

/// The position of a frame within its stream, in the units implied by the blocking strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSequence {
    BySample(u64),
    ByFrame(u32),
}

/// `ChannelAssignment` describes the mapping between the samples decoded from a subframe and the
/// channel those samples belong to. It is also through the `ChannelAssignment` that the decoder
/// is instructed on how to decorrelate stereo channels.
///
/// For LeftSide or RightSide channel assignments, one channel is stored independently while the
/// other stores a difference. The difference is always stored as Left - Right. For the MidSide
/// channel assignment, no channels are stored independently, rather, a Mid (average) channel and
/// a difference channel are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelAssignment {
    /// All channels are independently coded and no decorrelation step is required.
    Independent(u32),
    /// Channel 0 is the Left channel, and channel 1 is a Difference channel. The Right channel
    /// is restored by subtracting the Difference channel from the Left channel (R = L - D).
    LeftSide,
    /// Channel 0 is the Mid channel (Left/2 + Right/2), and channel 1 is the Difference channel
    /// (Left - Right).
    MidSide,
    /// Channel 0 is the Difference channel, and channel 1 is the Right channel. The Left channel
    /// is restored by adding the Difference channel to the Right channel (L = R + D).
    RightSide,
}

impl ChannelAssignment {
    /// The number of channels coded in the frame.
    pub fn n_channels(&self) -> u32 {
        match self {
            ChannelAssignment::Independent(channels) => *channels,
            _ => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameHeader {
    pub blocking_strategy: BlockingStrategy,
    pub block_sequence: BlockSequence,
    pub block_num_samples: u16,
    pub channel_assignment: ChannelAssignment,
    /// The bits per sample coded in the header, if not deferred to the stream information.
    pub bits_per_sample: Option<u32>,
    /// The sample rate coded in the header, if not deferred to the stream information.
    pub sample_rate: Option<u32>,
}

/// Synchronize the stream to the next frame header preamble.
///
/// FLAC specifies a byte-aligned 14-bit sync code of `0b11_1111_1111_1110`. The code is searched
/// for expanded to the 16-bit field `0b1111_1111_1111_10xx` one byte at a time. Returns the
/// expanded sync word and the number of bytes discarded before it.
pub fn sync_frame<B: ReadBytes>(reader: &mut B) -> Result<(u16, u64)> {
    let mut sync = 0u16;
    let mut read = 0u64;

    while (sync & 0xfffc) != 0xfff8 {
        sync = sync.wrapping_shl(8) | u16::from(reader.read_u8()?);
        read += 1;
    }

    Ok((sync, read.saturating_sub(2)))
}

/// Read a frame header, starting after the two sync bytes, and verify its CRC-8.
///
/// Malformed headers (bad coded number, failed CRC) produce a `DecodeError` from which the
/// caller may recover by resynchronizing. Field values reserved by the format produce an
/// `Unsupported` error; streams containing them are unparseable.
pub fn read_frame_header<B: ReadBytes>(reader: &mut B, sync: u16) -> Result<FrameHeader> {
    // The header is checksummed with a CRC-8 hash. Include the sync code in this CRC.
    let mut crc8 = Crc8Ccitt::new(0);
    crc8.process_buf_bytes(&sync.to_be_bytes());

    let mut reader_crc8 = MonitorStream::new(reader, crc8);

    // Extract the blocking strategy from the expanded synchronization code.
    let blocking_strategy = match sync & 0x1 {
        0 => BlockingStrategy::Fixed,
        _ => BlockingStrategy::Variable,
    };

    // The sync code's second reserved bit must be 0.
    if sync & 0x2 != 0 {
        return unsupported_error("flac: frame header reserved bit is not 0");
    }

    // Read all the standard frame description fields as one 16-bit value and extract the fields.
    let desc = reader_crc8.read_be_u16()?;

    let block_size_enc = u32::from((desc & 0xf000) >> 12);
    let sample_rate_enc = u32::from((desc & 0x0f00) >> 8);
    let channels_enc = u32::from((desc & 0x00f0) >> 4);
    let bits_per_sample_enc = u32::from((desc & 0x000e) >> 1);

    if (desc & 0x0001) == 1 {
        return unsupported_error("flac: frame header reserved bit is not set to mandatory value");
    }

    let block_sequence = match blocking_strategy {
        // Fixed-blocksize streams sequence blocks by a frame number.
        BlockingStrategy::Fixed => {
            let frame = match utf8_decode_be_u64(&mut reader_crc8)? {
                Some(frame) => frame,
                None => return decode_error("flac: frame sequence number is not valid"),
            };

            // The frame number should only be 31-bits. Since it is UTF8 encoded, the actual
            // length cannot be enforced by the coding itself.
            if frame > 0x7fff_ffff {
                return decode_error("flac: frame sequence number exceeds 31-bits");
            }

            BlockSequence::ByFrame(frame as u32)
        }
        // Variable-blocksize streams sequence blocks by a sample number.
        BlockingStrategy::Variable => {
            let sample = match utf8_decode_be_u64(&mut reader_crc8)? {
                Some(sample) => sample,
                None => return decode_error("flac: sample sequence number is not valid"),
            };

            if sample > 0xf_ffff_ffff {
                return decode_error("flac: sample sequence number exceeds 36-bits");
            }

            BlockSequence::BySample(sample)
        }
    };

    let block_num_samples = match block_size_enc {
        0x1 => 192,
        0x2..=0x5 => 576 * (1 << (block_size_enc - 2)),
        0x6 => u16::from(reader_crc8.read_u8()?) + 1,
        0x7 => {
            let block_size = reader_crc8.read_be_u16()?;
            if block_size == 0xffff {
                return decode_error("flac: block size not allowed to be greater than 65535");
            }
            block_size + 1
        }
        0x8..=0xf => 256 * (1 << (block_size_enc - 8)),
        _ => {
            return unsupported_error("flac: block size set to reserved value");
        }
    };

    let sample_rate = match sample_rate_enc {
        0x0 => None, // Get from StreamInfo if possible.
        0x1 => Some(88_200),
        0x2 => Some(176_400),
        0x3 => Some(192_000),
        0x4 => Some(8_000),
        0x5 => Some(16_000),
        0x6 => Some(22_050),
        0x7 => Some(24_000),
        0x8 => Some(32_000),
        0x9 => Some(44_100),
        0xa => Some(48_000),
        0xb => Some(96_000),
        0xc => Some(u32::from(reader_crc8.read_u8()?) * 1000),
        0xd => Some(u32::from(reader_crc8.read_be_u16()?)),
        0xe => Some(u32::from(reader_crc8.read_be_u16()?) * 10),
        _ => {
            return unsupported_error("flac: sample rate set to reserved value");
        }
    };

    if let Some(rate) = sample_rate {
        if rate < 1 || rate > 655_350 {
            return decode_error("flac: sample rate out of bounds");
        }
    }

    let bits_per_sample = match bits_per_sample_enc {
        0x0 => None, // Get from StreamInfo if possible.
        0x1 => Some(8),
        0x2 => Some(12),
        0x4 => Some(16),
        0x5 => Some(20),
        0x6 => Some(24),
        _ => {
            return unsupported_error("flac: bits per sample set to reserved value");
        }
    };

    let channel_assignment = match channels_enc {
        0x0..=0x7 => ChannelAssignment::Independent(channels_enc + 1),
        0x8 => ChannelAssignment::LeftSide,
        0x9 => ChannelAssignment::RightSide,
        0xa => ChannelAssignment::MidSide,
        _ => {
            return unsupported_error("flac: channel assignment set to reserved value");
        }
    };

    // End of frame header, pop off the CRC-8 checksum.
    let crc8_computed = reader_crc8.monitor().crc();

    // Get the expected CRC-8 checksum from the header.
    let crc8_expected = reader_crc8.into_inner().read_u8()?;

    if crc8_expected != crc8_computed {
        return decode_error("flac: computed frame header CRC does not match expected CRC");
    }

    Ok(FrameHeader {
        blocking_strategy,
        block_sequence,
        block_num_samples,
        channel_assignment,
        bits_per_sample,
        sample_rate,
    })
}

/// Write a frame header, sync code and trailing CRC-8 included, to an empty frame bit buffer.
///
/// Blocksizes and sample rates without a table code are written with trailing 8 or 16-bit hint
/// fields. The sample rate and bits per sample in the header are required on the write side;
/// values a decoder can only resolve through the stream information block (code 0) are emitted
/// only when no direct coding exists.
pub fn write_frame_header(
    bw: &mut BitWriter,
    header: &FrameHeader,
    sample_rate: u32,
    bits_per_sample: u32,
) -> Result<()> {
    // The header must begin the frame buffer so that the CRC-8 range starts at byte 0.
    debug_assert!(bw.bit_count() == 0);

    let strategy_bit = match header.blocking_strategy {
        BlockingStrategy::Fixed => 0,
        BlockingStrategy::Variable => 1,
    };

    // 14-bit sync code, one reserved zero bit, and the blocking strategy bit.
    bw.write_raw_uint32(0xfff8 | strategy_bit, 16);

    let block_num_samples = header.block_num_samples;
    debug_assert!(block_num_samples > 0);

    // Blocksize code. A hint value defers the actual blocksize to a trailing 8 or 16-bit field.
    let (block_size_enc, block_size_hint) = match block_num_samples {
        192 => (0x1, None),
        576 => (0x2, None),
        1152 => (0x3, None),
        2304 => (0x4, None),
        4608 => (0x5, None),
        256 => (0x8, None),
        512 => (0x9, None),
        1024 => (0xa, None),
        2048 => (0xb, None),
        4096 => (0xc, None),
        8192 => (0xd, None),
        16384 => (0xe, None),
        32768 => (0xf, None),
        n if n <= 256 => (0x6, Some(n - 1)),
        n => (0x7, Some(n - 1)),
    };

    bw.write_raw_uint32(block_size_enc, 4);

    // Sample rate code, with kHz, Hz, and daHz hints for rates without a table code.
    let (sample_rate_enc, sample_rate_hint) = match sample_rate {
        88_200 => (0x1, None),
        176_400 => (0x2, None),
        192_000 => (0x3, None),
        8_000 => (0x4, None),
        16_000 => (0x5, None),
        22_050 => (0x6, None),
        24_000 => (0x7, None),
        32_000 => (0x8, None),
        44_100 => (0x9, None),
        48_000 => (0xa, None),
        96_000 => (0xb, None),
        rate if rate % 1000 == 0 && rate / 1000 < 256 => (0xc, Some((rate / 1000, 8u32))),
        rate if rate < 65_536 => (0xd, Some((rate, 16))),
        rate if rate % 10 == 0 && rate / 10 < 65_536 => (0xe, Some((rate / 10, 16))),
        // No direct coding exists; the decoder falls back to the stream information.
        _ => (0x0, None),
    };

    bw.write_raw_uint32(sample_rate_enc, 4);

    let channels_enc = match header.channel_assignment {
        ChannelAssignment::Independent(channels) => {
            debug_assert!(channels >= 1 && channels <= 8);
            channels - 1
        }
        ChannelAssignment::LeftSide => 0x8,
        ChannelAssignment::RightSide => 0x9,
        ChannelAssignment::MidSide => 0xa,
    };

    bw.write_raw_uint32(channels_enc, 4);

    let bits_per_sample_enc = match bits_per_sample {
        8 => 0x1,
        12 => 0x2,
        16 => 0x4,
        20 => 0x5,
        24 => 0x6,
        // The decoder falls back to the stream information.
        _ => 0x0,
    };

    bw.write_raw_uint32(bits_per_sample_enc, 3);

    // Mandatory zero reserved bit.
    bw.write_raw_uint32(0, 1);

    match header.block_sequence {
        BlockSequence::ByFrame(frame) => bw.write_utf8_u32(frame),
        BlockSequence::BySample(sample) => bw.write_utf8_u64(sample)?,
    }

    if let Some(hint) = block_size_hint {
        let width = if block_size_enc == 0x6 { 8 } else { 16 };
        bw.write_raw_uint32(u32::from(hint), width);
    }

    if let Some((value, width)) = sample_rate_hint {
        bw.write_raw_uint32(value, width);
    }

    // The header fields are whole bytes; checksum them and append the CRC-8.
    debug_assert!(bw.is_byte_aligned());
    let crc = crc8_of(bw.written_bytes());

    bw.write_raw_uint32(u32::from(crc), 8);

    Ok(())
}

/// Decodes a big-endian unsigned integer encoded via extended UTF8. In this context, extended
/// UTF8 simply means the encoded UTF8 value may be up to 7 bytes for a maximum integer bit width
/// of 36-bits.
pub fn utf8_decode_be_u64<B: ReadBytes>(src: &mut B) -> Result<Option<u64>> {
    // Read the first byte of the UTF8 encoded integer.
    let mut state = u64::from(src.read_u8()?);

    // UTF8 prefixes 1s followed by a 0 to indicate the total number of bytes within the
    // multi-byte sequence. Using ranges, determine the mask that will overlap the data bits
    // within the first byte of the sequence. For values 0-127, return the value immediately. If
    // the value falls out of range return None as this is either not the start of a UTF8
    // sequence or the prefix is incorrect.
    let mask: u8 = match state {
        0x00..=0x7f => return Ok(Some(state)),
        0xc0..=0xdf => 0x1f,
        0xe0..=0xef => 0x0f,
        0xf0..=0xf7 => 0x07,
        0xf8..=0xfb => 0x03,
        0xfc..=0xfd => 0x01,
        0xfe => 0x00,
        _ => return Ok(None),
    };

    // Obtain the data bits from the first byte by using the data mask.
    state &= u64::from(mask);

    // Read the remaining bytes within the UTF8 sequence. Since the mask 0s out the UTF8 prefix
    // of 1s which indicate the length of the multi-byte sequence in bytes, plus an additional 0
    // bit, the number of remaining bytes to read is the number of zeros in the mask minus 2. To
    // avoid extra computation, simply loop from 2 to the number of zeros.
    for _ in 2..mask.leading_zeros() {
        let byte = src.read_u8()?;

        // Every byte after the first must carry the continuation prefix 0b10xx_xxxx.
        if byte & 0xc0 != 0x80 {
            return Ok(None);
        }

        // Append the next 6 data bits.
        state = (state << 6) | u64::from(byte & 0x3f);
    }

    Ok(Some(state))
}
