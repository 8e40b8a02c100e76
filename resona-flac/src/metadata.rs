// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::io::Write;

use resona_core::errors::{config_error, decode_error, Result};
use resona_core::io::{BitWriter, ReadBytes};

use log::warn;

/// The FLAC start of stream marker: "fLaC" in ASCII.
pub const FLAC_STREAM_MARKER: [u8; 4] = *b"fLaC";

/// The sentinel sample number marking a seek point as an unused placeholder slot.
pub const SEEK_POINT_PLACEHOLDER: u64 = u64::MAX;

/// The serialized size of a stream information block payload.
pub const STREAM_INFO_BLOCK_SIZE: u32 = 34;

/// The serialized size of a single seek point.
pub const SEEK_POINT_SIZE: u32 = 18;

/// The type of a metadata block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataBlockType {
    StreamInfo,
    Padding,
    Application,
    SeekTable,
    VorbisComment,
    Cuesheet,
    Unknown(u8),
}

impl From<u8> for MetadataBlockType {
    fn from(value: u8) -> Self {
        match value {
            0 => MetadataBlockType::StreamInfo,
            1 => MetadataBlockType::Padding,
            2 => MetadataBlockType::Application,
            3 => MetadataBlockType::SeekTable,
            4 => MetadataBlockType::VorbisComment,
            5 => MetadataBlockType::Cuesheet,
            _ => MetadataBlockType::Unknown(value),
        }
    }
}

impl From<MetadataBlockType> for u8 {
    fn from(value: MetadataBlockType) -> Self {
        match value {
            MetadataBlockType::StreamInfo => 0,
            MetadataBlockType::Padding => 1,
            MetadataBlockType::Application => 2,
            MetadataBlockType::SeekTable => 3,
            MetadataBlockType::VorbisComment => 4,
            MetadataBlockType::Cuesheet => 5,
            MetadataBlockType::Unknown(value) => value,
        }
    }
}

/// A metadata block header.
#[derive(Clone, Copy, Debug)]
pub struct MetadataBlockHeader {
    /// True if this is the final metadata block before the audio frames.
    pub is_last: bool,
    pub block_type: MetadataBlockType,
    /// The length of the block payload in bytes.
    pub block_len: u32,
}

impl MetadataBlockHeader {
    /// Read a metadata block header.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<MetadataBlockHeader> {
        let byte = reader.read_u8()?;

        Ok(MetadataBlockHeader {
            is_last: (byte & 0x80) == 0x80,
            block_type: MetadataBlockType::from(byte & 0x7f),
            block_len: reader.read_be_u24()?,
        })
    }

    /// Write a metadata block header.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        debug_assert!(self.block_len < (1 << 24));

        let tag = u8::from(self.block_type) | if self.is_last { 0x80 } else { 0 };

        sink.write_all(&[tag])?;
        sink.write_all(&self.block_len.to_be_bytes()[1..4])
    }
}

/// A stream information block, the mandatory first metadata block.
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    /// The minimum and maximum number of decoded samples per block of audio.
    pub block_len_min: u16,
    pub block_len_max: u16,
    /// The minimum and maximum byte length of an encoded block (frame) of audio. Either value may
    /// be 0 if unknown.
    pub frame_byte_len_min: u32,
    pub frame_byte_len_max: u32,
    /// The sample rate in Hz.
    pub sample_rate: u32,
    /// The number of channels.
    pub channels: u32,
    /// The number of bits per sample of the stream.
    pub bits_per_sample: u32,
    /// The total number of samples per channel in the stream, if available.
    pub n_samples: Option<u64>,
    /// The MD5 signature of the unencoded audio data, if available.
    pub md5: Option<[u8; 16]>,
}

impl StreamInfo {
    /// Read a stream information block.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<StreamInfo> {
        let mut info = StreamInfo::default();

        // Read the block length bounds in number of samples.
        info.block_len_min = reader.read_be_u16()?;
        info.block_len_max = reader.read_be_u16()?;

        // Validate the block length bounds are in the range [16, 65535] samples.
        if info.block_len_min < 16 || info.block_len_max < 16 {
            return decode_error("flac: minimum block length is 16 samples");
        }

        // Validate the maximum block length is greater than or equal to the minimum block length.
        if info.block_len_max < info.block_len_min {
            return decode_error("flac: maximum block length is less than the minimum block length");
        }

        // Read the frame byte length bounds. A value of 0 for either indicates the respective
        // bound is unknown.
        info.frame_byte_len_min = reader.read_be_u24()?;
        info.frame_byte_len_max = reader.read_be_u24()?;

        if info.frame_byte_len_min > 0
            && info.frame_byte_len_max > 0
            && info.frame_byte_len_max < info.frame_byte_len_min
        {
            return decode_error("flac: maximum frame length is less than the minimum frame length");
        }

        // The remaining fields are not byte aligned: sample rate (20 bits), channels minus 1
        // (3 bits), bits per sample minus 1 (5 bits), and the total sample count (36 bits).
        let packed = reader.read_be_u64()?;

        info.sample_rate = (packed >> 44) as u32;

        if info.sample_rate < 1 || info.sample_rate > 655_350 {
            return decode_error("flac: stream sample rate out of bounds");
        }

        info.channels = ((packed >> 41) & 0x7) as u32 + 1;

        info.bits_per_sample = ((packed >> 36) & 0x1f) as u32 + 1;

        if info.bits_per_sample < 4 {
            return decode_error("flac: stream bits per sample are out of bounds");
        }

        // A total sample count of 0 indicates a stream of unknown length.
        info.n_samples = match packed & 0xf_ffff_ffff {
            0 => None,
            samples => Some(samples),
        };

        // Read the decoded audio data MD5 signature. If zeroed, no signature is present.
        let mut md5 = [0; 16];
        reader.read_buf_exact(&mut md5)?;

        if md5 != [0; 16] {
            info.md5 = Some(md5);
        }

        Ok(info)
    }

    /// Write a stream information block payload.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        let mut bw = BitWriter::new();

        bw.write_raw_uint32(u32::from(self.block_len_min), 16);
        bw.write_raw_uint32(u32::from(self.block_len_max), 16);
        bw.write_raw_uint32(self.frame_byte_len_min, 24);
        bw.write_raw_uint32(self.frame_byte_len_max, 24);
        bw.write_raw_uint32(self.sample_rate, 20);
        bw.write_raw_uint32(self.channels - 1, 3);
        bw.write_raw_uint32(self.bits_per_sample - 1, 5);
        bw.write_raw_uint64(self.n_samples.unwrap_or(0), 36);

        sink.write_all(bw.as_slice())?;
        sink.write_all(&self.md5.unwrap_or([0; 16]))
    }

    /// Check if the size is valid for a stream information block.
    pub fn is_valid_size(size: u64) -> bool {
        size == u64::from(STREAM_INFO_BLOCK_SIZE)
    }
}

/// A seek point maps a sample number to the byte offset of the frame containing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekPoint {
    /// The sample number of the first sample in the target frame, or
    /// [`SEEK_POINT_PLACEHOLDER`] for an unused slot.
    pub sample_number: u64,
    /// The offset of the target frame's first byte, relative to the first byte of the first
    /// audio frame.
    pub byte_offset: u64,
    /// The number of samples in the target frame.
    pub frame_samples: u16,
}

impl SeekPoint {
    /// An unused seek point slot.
    pub const PLACEHOLDER: SeekPoint =
        SeekPoint { sample_number: SEEK_POINT_PLACEHOLDER, byte_offset: 0, frame_samples: 0 };

    /// Returns true if this seek point is an unused placeholder slot.
    pub fn is_placeholder(&self) -> bool {
        self.sample_number == SEEK_POINT_PLACEHOLDER
    }
}

/// A seek table metadata block.
#[derive(Clone, Debug, Default)]
pub struct SeekTable {
    pub points: Vec<SeekPoint>,
}

impl SeekTable {
    /// Read a seek table block of the given payload length.
    pub fn read<B: ReadBytes>(reader: &mut B, block_len: u32) -> Result<SeekTable> {
        // The number of seek points is always the block length divided by the length of a single
        // point, 18 bytes.
        let count = block_len / SEEK_POINT_SIZE;

        let mut points = Vec::with_capacity(count as usize);

        for _ in 0..count {
            points.push(SeekPoint {
                sample_number: reader.read_be_u64()?,
                byte_offset: reader.read_be_u64()?,
                frame_samples: reader.read_be_u16()?,
            });
        }

        Ok(SeekTable { points })
    }

    /// Write the seek table block payload.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        for point in &self.points {
            sink.write_all(&point.sample_number.to_be_bytes())?;
            sink.write_all(&point.byte_offset.to_be_bytes())?;
            sink.write_all(&point.frame_samples.to_be_bytes())?;
        }
        Ok(())
    }

    /// The serialized payload length of the table in bytes.
    pub fn byte_len(&self) -> u32 {
        self.points.len() as u32 * SEEK_POINT_SIZE
    }

    /// Returns true if all non-placeholder points are strictly ascending in sample number and
    /// non-descending in byte offset, and placeholders trail the real points.
    pub fn is_legal(&self) -> bool {
        let mut prev: Option<&SeekPoint> = None;

        for point in &self.points {
            if let Some(prev) = prev {
                if prev.is_placeholder() && !point.is_placeholder() {
                    return false;
                }
                if !point.is_placeholder()
                    && (point.sample_number <= prev.sample_number
                        || point.byte_offset < prev.byte_offset)
                {
                    return false;
                }
            }
            prev = Some(point);
        }

        true
    }

    /// Find the last non-placeholder point with a sample number at or before `sample`.
    pub fn search_before(&self, sample: u64) -> Option<&SeekPoint> {
        self.points
            .iter()
            .filter(|p| !p.is_placeholder() && p.sample_number <= sample)
            .last()
    }

    /// Find the first non-placeholder point with a sample number after `sample`.
    pub fn search_after(&self, sample: u64) -> Option<&SeekPoint> {
        self.points.iter().find(|p| !p.is_placeholder() && p.sample_number > sample)
    }

    /// Sort points by sample number (placeholders last) and drop duplicate sample numbers.
    pub fn sort_and_dedup(&mut self) {
        self.points.sort_by_key(|p| p.sample_number);
        self.points.dedup_by_key(|p| p.sample_number);
    }

    /// Snap every real point down to a block boundary, then sort and deduplicate the real points.
    /// Placeholder slots are preserved at the end of the table.
    pub fn bucket_to_block_len(&mut self, block_len: u32) {
        let n_placeholders = self.points.iter().filter(|p| p.is_placeholder()).count();

        let mut reals: Vec<SeekPoint> =
            self.points.iter().filter(|p| !p.is_placeholder()).copied().collect();

        for point in reals.iter_mut() {
            point.sample_number -= point.sample_number % u64::from(block_len);
        }

        reals.sort_by_key(|p| p.sample_number);
        reals.dedup_by_key(|p| p.sample_number);
        reals.resize(reals.len() + n_placeholders, SeekPoint::PLACEHOLDER);

        self.points = reals;
    }
}

/// One token of a seek table specification.
#[derive(Clone, Copy, Debug, PartialEq)]
enum SeekSpecToken {
    /// A single seek point at the given sample number.
    Sample(u64),
    /// Seek points at a regular interval of the given number of seconds.
    EverySeconds(f64),
    /// The given number of seek points, evenly distributed across the stream.
    Count(u32),
    /// A single placeholder slot.
    Placeholder,
}

/// A `SeekTableSpec` describes the seek points an encoder should reserve and fill, parsed from a
/// semicolon-separated list of tokens: a bare integer requests a point at that sample number,
/// `Ns` requests a point every `N` seconds (`N` may be fractional), `Nx` requests `N` points
/// evenly distributed over the stream, and `X` reserves one placeholder slot.
#[derive(Clone, Debug, Default)]
pub struct SeekTableSpec {
    tokens: Vec<SeekSpecToken>,
}

impl SeekTableSpec {
    /// Parse a seek table specification.
    pub fn parse(spec: &str) -> Result<SeekTableSpec> {
        let mut tokens = Vec::new();

        for token in spec.split(';') {
            let token = token.trim();

            if token.is_empty() {
                continue;
            }

            if token == "X" {
                tokens.push(SeekSpecToken::Placeholder);
            }
            else if let Some(secs) = token.strip_suffix('s') {
                match secs.parse::<f64>() {
                    Ok(secs) if secs > 0.0 => tokens.push(SeekSpecToken::EverySeconds(secs)),
                    _ => return config_error("flac: invalid interval in seek table specification"),
                }
            }
            else if let Some(count) = token.strip_suffix('x') {
                match count.parse::<u32>() {
                    Ok(count) => tokens.push(SeekSpecToken::Count(count)),
                    _ => return config_error("flac: invalid count in seek table specification"),
                }
            }
            else {
                match token.parse::<u64>() {
                    Ok(sample) => tokens.push(SeekSpecToken::Sample(sample)),
                    _ => return config_error("flac: invalid token in seek table specification"),
                }
            }
        }

        Ok(SeekTableSpec { tokens })
    }

    /// The specification used when none is given explicitly: one seek point every 10 seconds.
    pub fn every_ten_seconds() -> SeekTableSpec {
        SeekTableSpec { tokens: vec![SeekSpecToken::EverySeconds(10.0)] }
    }

    /// Returns true if the specification requests nothing.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Expand the specification into a seek table template. Real points carry their requested
    /// target sample number and are filled in by the encoder as frames pass; placeholder slots
    /// trail them. `total_samples` of 0 means the stream length is unknown, in which case the
    /// interval and count tokens contribute nothing.
    pub fn into_template(self, total_samples: u64, sample_rate: u32) -> SeekTable {
        let mut table = SeekTable::default();
        let mut n_placeholders = 0usize;

        for token in self.tokens {
            match token {
                SeekSpecToken::Sample(sample) => {
                    table.points.push(SeekPoint {
                        sample_number: sample,
                        byte_offset: 0,
                        frame_samples: 0,
                    });
                }
                SeekSpecToken::EverySeconds(secs) => {
                    if total_samples == 0 {
                        warn!("seek points every {}s require a known stream length", secs);
                        continue;
                    }

                    let step = (secs * f64::from(sample_rate)) as u64;

                    if step == 0 {
                        continue;
                    }

                    let mut sample = 0;
                    while sample < total_samples {
                        table.points.push(SeekPoint {
                            sample_number: sample,
                            byte_offset: 0,
                            frame_samples: 0,
                        });
                        sample += step;
                    }
                }
                SeekSpecToken::Count(count) => {
                    if total_samples == 0 {
                        warn!("{} distributed seek points require a known stream length", count);
                        continue;
                    }

                    for i in 0..u64::from(count) {
                        table.points.push(SeekPoint {
                            sample_number: i * total_samples / u64::from(count),
                            byte_offset: 0,
                            frame_samples: 0,
                        });
                    }
                }
                SeekSpecToken::Placeholder => n_placeholders += 1,
            }
        }

        table.sort_and_dedup();

        // Clip requested samples beyond the known stream length. They can never be filled.
        if total_samples > 0 {
            table.points.retain(|p| p.sample_number < total_samples);
        }

        for _ in 0..n_placeholders {
            table.points.push(SeekPoint::PLACEHOLDER);
        }

        table
    }
}

/// A Vorbis comment block: a vendor string and a list of NAME=value pairs. The semantics of the
/// comments are transparent to the codec; only the framing is implemented.
#[derive(Clone, Debug, Default)]
pub struct VorbisComment {
    pub vendor: String,
    pub comments: Vec<(String, String)>,
}

impl VorbisComment {
    /// The serialized payload length in bytes.
    pub fn byte_len(&self) -> u32 {
        let mut len = 4 + self.vendor.len() as u32 + 4;

        for (name, value) in &self.comments {
            len += 4 + name.len() as u32 + 1 + value.len() as u32;
        }

        len
    }

    /// Write the comment block payload. Unlike the rest of the format, lengths are
    /// little-endian.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(&(self.vendor.len() as u32).to_le_bytes())?;
        sink.write_all(self.vendor.as_bytes())?;

        sink.write_all(&(self.comments.len() as u32).to_le_bytes())?;

        for (name, value) in &self.comments {
            let len = name.len() as u32 + 1 + value.len() as u32;
            sink.write_all(&len.to_le_bytes())?;
            sink.write_all(name.as_bytes())?;
            sink.write_all(b"=")?;
            sink.write_all(value.as_bytes())?;
        }

        Ok(())
    }
}

/// A parsed or to-be-written metadata block.
#[derive(Clone, Debug)]
pub enum MetadataBlock {
    StreamInfo(StreamInfo),
    Padding(u32),
    Application { id: [u8; 4], data: Vec<u8> },
    SeekTable(SeekTable),
    VorbisComment(VorbisComment),
    Cuesheet(Vec<u8>),
    Unknown { block_type: u8, data: Vec<u8> },
}

impl MetadataBlock {
    /// The type tag of the block.
    pub fn block_type(&self) -> MetadataBlockType {
        match self {
            MetadataBlock::StreamInfo(_) => MetadataBlockType::StreamInfo,
            MetadataBlock::Padding(_) => MetadataBlockType::Padding,
            MetadataBlock::Application { .. } => MetadataBlockType::Application,
            MetadataBlock::SeekTable(_) => MetadataBlockType::SeekTable,
            MetadataBlock::VorbisComment(_) => MetadataBlockType::VorbisComment,
            MetadataBlock::Cuesheet(_) => MetadataBlockType::Cuesheet,
            MetadataBlock::Unknown { block_type, .. } => MetadataBlockType::Unknown(*block_type),
        }
    }

    /// The serialized payload length of the block in bytes.
    pub fn byte_len(&self) -> u32 {
        match self {
            MetadataBlock::StreamInfo(_) => STREAM_INFO_BLOCK_SIZE,
            MetadataBlock::Padding(len) => *len,
            MetadataBlock::Application { data, .. } => 4 + data.len() as u32,
            MetadataBlock::SeekTable(table) => table.byte_len(),
            MetadataBlock::VorbisComment(comment) => comment.byte_len(),
            MetadataBlock::Cuesheet(data) => data.len() as u32,
            MetadataBlock::Unknown { data, .. } => data.len() as u32,
        }
    }

    /// Write the block, header included.
    pub fn write_to<W: Write>(&self, sink: &mut W, is_last: bool) -> io::Result<()> {
        let header = MetadataBlockHeader {
            is_last,
            block_type: self.block_type(),
            block_len: self.byte_len(),
        };

        header.write_to(sink)?;

        match self {
            MetadataBlock::StreamInfo(info) => info.write_to(sink),
            MetadataBlock::Padding(len) => {
                // Padding is zero filled. Write in chunks to bound the allocation.
                let zeros = [0u8; 1024];
                let mut rem = *len as usize;

                while rem > 0 {
                    let n = rem.min(zeros.len());
                    sink.write_all(&zeros[..n])?;
                    rem -= n;
                }

                Ok(())
            }
            MetadataBlock::Application { id, data } => {
                sink.write_all(id)?;
                sink.write_all(data)
            }
            MetadataBlock::SeekTable(table) => table.write_to(sink),
            MetadataBlock::VorbisComment(comment) => comment.write_to(sink),
            MetadataBlock::Cuesheet(data) => sink.write_all(data),
            MetadataBlock::Unknown { data, .. } => sink.write_all(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resona_core::io::BufReader;

    #[test]
    fn verify_stream_info_roundtrip() {
        let info = StreamInfo {
            block_len_min: 4096,
            block_len_max: 4096,
            frame_byte_len_min: 14,
            frame_byte_len_max: 7890,
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            n_samples: Some(441_000),
            md5: Some([0xab; 16]),
        };

        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();

        assert_eq!(buf.len() as u32, STREAM_INFO_BLOCK_SIZE);

        let parsed = StreamInfo::read(&mut BufReader::new(&buf)).unwrap();

        assert_eq!(parsed.block_len_min, info.block_len_min);
        assert_eq!(parsed.block_len_max, info.block_len_max);
        assert_eq!(parsed.frame_byte_len_min, info.frame_byte_len_min);
        assert_eq!(parsed.frame_byte_len_max, info.frame_byte_len_max);
        assert_eq!(parsed.sample_rate, info.sample_rate);
        assert_eq!(parsed.channels, info.channels);
        assert_eq!(parsed.bits_per_sample, info.bits_per_sample);
        assert_eq!(parsed.n_samples, info.n_samples);
        assert_eq!(parsed.md5, info.md5);
    }

    #[test]
    fn verify_seek_table_roundtrip() {
        let mut table = SeekTable::default();

        table.points.push(SeekPoint { sample_number: 0, byte_offset: 0, frame_samples: 4096 });
        table.points.push(SeekPoint {
            sample_number: 441_000,
            byte_offset: 123_456,
            frame_samples: 4096,
        });
        table.points.push(SeekPoint::PLACEHOLDER);

        assert!(table.is_legal());

        let mut buf = Vec::new();
        table.write_to(&mut buf).unwrap();

        assert_eq!(buf.len() as u32, table.byte_len());

        let parsed = SeekTable::read(&mut BufReader::new(&buf), buf.len() as u32).unwrap();

        assert_eq!(parsed.points, table.points);

        assert_eq!(parsed.search_before(500_000).unwrap().sample_number, 441_000);
        assert_eq!(parsed.search_before(100).unwrap().sample_number, 0);
        assert_eq!(parsed.search_after(100).unwrap().sample_number, 441_000);
        assert!(parsed.search_after(441_000).is_none());
    }

    #[test]
    fn verify_seek_table_legality() {
        let descending = SeekTable {
            points: vec![
                SeekPoint { sample_number: 100, byte_offset: 10, frame_samples: 10 },
                SeekPoint { sample_number: 50, byte_offset: 20, frame_samples: 10 },
            ],
        };
        assert!(!descending.is_legal());

        let placeholder_first = SeekTable {
            points: vec![
                SeekPoint::PLACEHOLDER,
                SeekPoint { sample_number: 50, byte_offset: 20, frame_samples: 10 },
            ],
        };
        assert!(!placeholder_first.is_legal());
    }

    #[test]
    fn verify_seek_spec_parse() {
        let spec = SeekTableSpec::parse("0;1s;100x;X;4096").unwrap();
        let table = spec.into_template(441_000, 44_100);

        // 0 and 4096 from the absolute tokens, 10 points from "1s", 100 points from "100x",
        // deduplicated (sample 0 is requested three times over), one placeholder last.
        assert!(table.points.last().unwrap().is_placeholder());
        assert!(table.is_legal());

        let reals: Vec<u64> = table
            .points
            .iter()
            .filter(|p| !p.is_placeholder())
            .map(|p| p.sample_number)
            .collect();

        assert!(reals.contains(&0));
        assert!(reals.contains(&4096));
        assert!(reals.contains(&44_100));
        assert!(reals.windows(2).all(|w| w[0] < w[1]));

        assert!(SeekTableSpec::parse("12q").is_err());
        assert!(SeekTableSpec::parse("-1s").is_err());
    }

    #[test]
    fn verify_seek_spec_unknown_length() {
        let spec = SeekTableSpec::parse("10s;5x;X;123").unwrap();
        let table = spec.into_template(0, 44_100);

        // Interval and count tokens need a known length; only the absolute point and the
        // placeholder survive.
        assert_eq!(table.points.len(), 2);
        assert_eq!(table.points[0].sample_number, 123);
        assert!(table.points[1].is_placeholder());
    }
}
