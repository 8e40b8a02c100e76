// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::mem;

use resona_core::audio::{AudioBlock, SignalSpec};
use resona_core::checksum::{Crc16Ansi, Md5};
use resona_core::errors::{decode_error, is_end_of_stream, seek_error, Error, Result, SeekErrorKind};
use resona_core::io::{
    BitStreamLtr, MediaSource, MediaSourceStream, Monitor, MonitorStream, ReadBytes, ScopedStream,
};

use log::{debug, warn};

use crate::frame::{
    read_frame_header, sync_frame, BlockSequence, ChannelAssignment, FrameHeader,
};
use crate::metadata::{
    MetadataBlock, MetadataBlockHeader, MetadataBlockType, SeekTable, StreamInfo,
    FLAC_STREAM_MARKER,
};
use crate::subframe::read_subframe;

/// `DecoderOptions` carries the options of a decoder session.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecoderOptions {
    /// Accumulate the MD5 signature of the decoded output and compare it against the stream
    /// information on finalization.
    pub md5_checking: bool,
}

/// Recoverable stream errors reported by the decoder while it continues to make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Bytes were discarded before a frame synchronization code was found.
    LostSync,
    /// A frame header failed to parse or its CRC-8 check failed.
    BadHeader,
    /// A frame's CRC-16 check failed; a zero-filled block was delivered in its place.
    FrameCrcMismatch,
}

/// The result of finalizing a decoder session.
#[derive(Clone, Copy, Debug, Default)]
pub struct FinalizeResult {
    /// If MD5 checking was enabled, whether the decoded output matches the stream's MD5
    /// signature. `None` if the check could not be performed: checking disabled, no signature
    /// in the stream, a seek was performed, or the stream was not decoded to the end.
    pub md5_ok: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecoderState {
    SearchForMetadata,
    ReadMetadata,
    SearchForFrameSync,
    ReadFrame,
    EndOfStream,
    Aborted,
    Unparseable,
}

fn invert_left_side(left: &[i32], side: &mut [i32]) {
    for (s, l) in side.iter_mut().zip(left) {
        *s = *l - *s;
    }
}

fn invert_right_side(right: &[i32], side: &mut [i32]) {
    for (s, r) in side.iter_mut().zip(right) {
        *s += *r;
    }
}

fn invert_mid_side(mid: &mut [i32], side: &mut [i32]) {
    for (m, s) in mid.iter_mut().zip(side) {
        // Mid is (L + R) / 2 with the low bit dropped. Doubling it and re-attaching the low bit
        // of the side channel (L - R has the same parity as L + R) recovers L + R exactly, from
        // which both channels follow without rounding error.
        let mid = (*m << 1) | (*s & 1);
        let side = *s;
        *m = (mid + side) >> 1;
        *s = (mid - side) >> 1;
    }
}

/// A FLAC stream decoder session.
///
/// The session synchronizes on the `fLaC` stream marker (skipping a leading ID3v2 tag), parses
/// the metadata blocks, then decodes one frame per [`StreamDecoder::next_block`] call until the
/// end of the stream. Frames with failed checksums are reported through the error queue and
/// recovered from by resynchronizing. [`StreamDecoder::seek_to_sample`] positions the session at
/// an arbitrary sample using the stream's seek table when one is present.
pub struct StreamDecoder {
    reader: MediaSourceStream,
    state: DecoderState,

    stream_info: Option<StreamInfo>,
    seek_table: Option<SeekTable>,
    other_metadata: Vec<MetadataBlock>,

    /// The byte position of the first audio frame, captured after the metadata blocks.
    first_frame_offset: u64,
    /// The expanded sync word captured by the frame synchronizer.
    frame_sync: u16,

    block: AudioBlock,
    /// Set when `block` holds an undelivered block (after a seek).
    pending: bool,

    errors: Vec<ErrorStatus>,

    md5: Md5,
    md5_checking: bool,
    md5_buf: Vec<u8>,

    /// The end position of the last decoded frame, in samples.
    samples_decoded: u64,
    /// Keep decoding past the stream information's stated total. Used when tailing a stream
    /// whose total is still an estimate.
    ignore_total: bool,
}

impl StreamDecoder {
    /// Create a decoder session over the given source. No data is read until the session is
    /// driven.
    pub fn new(source: Box<dyn MediaSource>, opts: DecoderOptions) -> StreamDecoder {
        StreamDecoder {
            reader: MediaSourceStream::new(source),
            state: DecoderState::SearchForMetadata,
            stream_info: None,
            seek_table: None,
            other_metadata: Vec::new(),
            first_frame_offset: 0,
            frame_sync: 0,
            block: AudioBlock::new(SignalSpec::new(0, 0, 0)),
            pending: false,
            errors: Vec::new(),
            md5: Md5::default(),
            md5_checking: opts.md5_checking,
            md5_buf: Vec::new(),
            samples_decoded: 0,
            ignore_total: false,
        }
    }

    /// Treat the stream information's total sample count as unreliable and decode until the
    /// bytes run out.
    pub(crate) fn ignore_stream_length(&mut self) {
        self.ignore_total = true;
    }

    /// The stream information block, available once the metadata has been read.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// The stream's seek table, if one is present.
    pub fn seek_table(&self) -> Option<&SeekTable> {
        self.seek_table.as_ref()
    }

    /// The retained non-audio metadata blocks, in stream order.
    pub fn metadata_blocks(&self) -> &[MetadataBlock] {
        &self.other_metadata
    }

    /// Drain the recoverable errors reported since the last call.
    pub fn drain_errors(&mut self) -> Vec<ErrorStatus> {
        mem::take(&mut self.errors)
    }

    /// The end position of the last decoded block, in samples.
    pub fn samples_decoded(&self) -> u64 {
        self.samples_decoded
    }

    /// Drive the session through the metadata blocks, stopping at the first audio frame.
    pub fn read_metadata(&mut self) -> Result<()> {
        loop {
            match self.state {
                DecoderState::SearchForMetadata => self.find_metadata()?,
                DecoderState::ReadMetadata => self.read_one_metadata_block()?,
                _ => return Ok(()),
            }
        }
    }

    /// Decode and return the next block of audio, or `None` at the end of the stream.
    pub fn next_block(&mut self) -> Result<Option<&AudioBlock>> {
        if self.pending {
            self.pending = false;
            return Ok(Some(&self.block));
        }

        if self.advance()? {
            Ok(Some(&self.block))
        }
        else {
            Ok(None)
        }
    }

    /// Finalize the session.
    pub fn finish(self) -> FinalizeResult {
        let mut result = FinalizeResult::default();

        if self.md5_checking && self.state == DecoderState::EndOfStream {
            if let Some(expected) = self.stream_info.as_ref().and_then(|info| info.md5) {
                let decoded = self.md5.md5();

                debug!("verification: decoded md5 matches = {}", decoded == expected);

                result.md5_ok = Some(decoded == expected);
            }
        }

        result
    }

    /// Advance the state machine until a block is decoded (true) or the stream ends (false).
    fn advance(&mut self) -> Result<bool> {
        loop {
            match self.state {
                DecoderState::SearchForMetadata => self.find_metadata()?,
                DecoderState::ReadMetadata => self.read_one_metadata_block()?,
                DecoderState::SearchForFrameSync => {
                    // When the total length is known and fully delivered there is no more audio
                    // to synchronize to, only metadata-less junk or EOF.
                    let total = self.stream_info.as_ref().and_then(|info| info.n_samples);

                    if !self.ignore_total
                        && matches!(total, Some(total) if self.samples_decoded >= total)
                    {
                        self.state = DecoderState::EndOfStream;
                        continue;
                    }

                    match self.search_frame_sync() {
                        Ok(()) => (),
                        Err(ref err) if is_end_of_stream(err) => {
                            self.state = DecoderState::EndOfStream;
                        }
                        Err(err) => {
                            self.state = DecoderState::Aborted;
                            return Err(err);
                        }
                    }
                }
                DecoderState::ReadFrame => {
                    match self.read_frame() {
                        Ok(got_block) => {
                            if got_block {
                                return Ok(true);
                            }
                        }
                        Err(ref err) if is_end_of_stream(err) => {
                            self.state = DecoderState::EndOfStream;
                        }
                        Err(err) => {
                            if !matches!(self.state, DecoderState::Unparseable) {
                                self.state = DecoderState::Aborted;
                            }
                            return Err(err);
                        }
                    }
                }
                DecoderState::EndOfStream => return Ok(false),
                DecoderState::Aborted => return decode_error("flac: session was aborted"),
                DecoderState::Unparseable => return decode_error("flac: stream is unparseable"),
            }
        }
    }

    /// Search for the `fLaC` stream marker, skipping over a leading ID3v2 tag.
    fn find_metadata(&mut self) -> Result<()> {
        let mut marker = self.reader.read_quad_bytes()?;

        if &marker[0..3] == b"ID3" {
            // The fourth byte of the marker is the tag's major version, already consumed. Skip
            // the minor version and flag bytes, then the four size bytes carrying seven bits
            // each, then the tag itself.
            let _minor_and_flags = self.reader.read_double_bytes()?;

            let mut tag_len = 0u64;

            for _ in 0..4 {
                tag_len = (tag_len << 7) | u64::from(self.reader.read_u8()? & 0x7f);
            }

            debug!("skipping id3v2 tag of {} bytes", tag_len);

            self.reader.ignore_bytes(tag_len)?;

            marker = self.reader.read_quad_bytes()?;
        }

        if marker != FLAC_STREAM_MARKER {
            self.state = DecoderState::Unparseable;
            return decode_error("flac: missing stream marker");
        }

        self.state = DecoderState::ReadMetadata;

        Ok(())
    }

    /// Parse one metadata block.
    fn read_one_metadata_block(&mut self) -> Result<()> {
        let header = MetadataBlockHeader::read(&mut self.reader)?;

        let mut block_stream = ScopedStream::new(&mut self.reader, u64::from(header.block_len));

        match header.block_type {
            MetadataBlockType::StreamInfo => {
                if self.stream_info.is_some() {
                    return decode_error("flac: found more than one stream info block");
                }

                if !StreamInfo::is_valid_size(u64::from(header.block_len)) {
                    return decode_error("flac: invalid stream info block size");
                }

                self.stream_info = Some(StreamInfo::read(&mut block_stream)?);
            }
            MetadataBlockType::SeekTable => {
                if self.seek_table.is_some() {
                    return decode_error("flac: found more than one seek table block");
                }

                self.seek_table = Some(SeekTable::read(&mut block_stream, header.block_len)?);
            }
            MetadataBlockType::Application => {
                if header.block_len < 4 {
                    return decode_error("flac: application block too short for its id");
                }

                let mut id = [0u8; 4];
                block_stream.read_buf_exact(&mut id)?;

                let data = block_stream.read_boxed_slice_exact(header.block_len as usize - 4)?;

                self.other_metadata
                    .push(MetadataBlock::Application { id, data: data.into_vec() });
            }
            MetadataBlockType::Cuesheet => {
                let data = block_stream.read_boxed_slice_exact(header.block_len as usize)?;
                self.other_metadata.push(MetadataBlock::Cuesheet(data.into_vec()));
            }
            MetadataBlockType::VorbisComment => {
                // Comment semantics are transparent to the codec; carry the payload opaquely.
                let data = block_stream.read_boxed_slice_exact(header.block_len as usize)?;
                self.other_metadata
                    .push(MetadataBlock::Unknown { block_type: 4, data: data.into_vec() });
            }
            MetadataBlockType::Padding => {
                block_stream.ignore()?;
            }
            MetadataBlockType::Unknown(id) => {
                block_stream.ignore()?;
                debug!("ignoring {} bytes of block with id={}", header.block_len, id);
            }
        }

        // If the stated block length is longer than the number of bytes read, skip the rest.
        block_stream.ignore()?;

        if header.is_last {
            if self.stream_info.is_none() {
                return decode_error("flac: missing stream info block");
            }

            self.first_frame_offset = self.reader.pos();
            self.state = DecoderState::SearchForFrameSync;
        }

        Ok(())
    }

    /// Scan for the next frame synchronization code.
    fn search_frame_sync(&mut self) -> Result<()> {
        let (sync, skipped) = sync_frame(&mut self.reader)?;

        if skipped > 0 {
            warn!("lost sync; skipped {} bytes", skipped);
            self.errors.push(ErrorStatus::LostSync);
        }

        self.frame_sync = sync;
        self.state = DecoderState::ReadFrame;

        Ok(())
    }

    /// Parse and decode one frame. Returns true when a block (possibly zero-filled after a CRC
    /// failure) was delivered, false when the frame was abandoned and the state machine should
    /// resynchronize.
    fn read_frame(&mut self) -> Result<bool> {
        let sync = self.frame_sync;

        // The entire frame, headers included, is covered by a trailing CRC-16.
        let mut crc16 = Crc16Ansi::new(0);
        crc16.process_buf_bytes(&sync.to_be_bytes());

        let mut reader_crc16 = MonitorStream::new(&mut self.reader, crc16);

        let header = match read_frame_header(&mut reader_crc16, sync) {
            Ok(header) => header,
            Err(Error::DecodeError(msg)) => {
                warn!("bad frame header: {}", msg);
                self.errors.push(ErrorStatus::BadHeader);
                self.state = DecoderState::SearchForFrameSync;
                return Ok(false);
            }
            Err(err @ Error::Unsupported(_)) => {
                self.state = DecoderState::Unparseable;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let info = self.stream_info.as_ref().expect("stream info precedes frames");

        // The frame header may carry its own sample rate and bits per sample, overriding the
        // stream defaults.
        let sample_rate = header.sample_rate.unwrap_or(info.sample_rate);
        let bits_per_sample = header.bits_per_sample.unwrap_or(info.bits_per_sample);

        let n_channels = header.channel_assignment.n_channels();
        let n_samples = usize::from(header.block_num_samples);

        // A difference channel carries one extra bit; at 32 bits per sample that exceeds the
        // widest supported sample.
        if bits_per_sample >= 32
            && !matches!(header.channel_assignment, ChannelAssignment::Independent(_))
        {
            self.state = DecoderState::Unparseable;
            return decode_error("flac: stereo decorrelation is invalid at 32 bits per sample");
        }

        let first_sample = frame_first_sample(&header, info);

        self.block.reset(
            SignalSpec::new(sample_rate, n_channels as usize, bits_per_sample),
            n_samples,
            first_sample,
        );

        // Decode each channel's subframe. Subframes have no byte-aligned content; a single bit
        // reader spans all of them, then realigns for the frame footer.
        let subframe_result = {
            let mut bs = BitStreamLtr::new(&mut reader_crc16);

            let result = match header.channel_assignment {
                ChannelAssignment::Independent(channels) => {
                    let mut result = Ok(());

                    for ch in 0..channels as usize {
                        result =
                            read_subframe(&mut bs, bits_per_sample, self.block.chan_mut(ch));
                        if result.is_err() {
                            break;
                        }
                    }

                    result
                }
                // For Left/Side, Mid/Side, and Right/Side channel configurations, the side
                // (difference) channel requires an extra bit per sample.
                ChannelAssignment::LeftSide => {
                    let (left, side) = self.block.chan_pair_mut(0, 1);

                    read_subframe(&mut bs, bits_per_sample, left)
                        .and_then(|_| read_subframe(&mut bs, bits_per_sample + 1, side))
                }
                ChannelAssignment::MidSide => {
                    let (mid, side) = self.block.chan_pair_mut(0, 1);

                    read_subframe(&mut bs, bits_per_sample, mid)
                        .and_then(|_| read_subframe(&mut bs, bits_per_sample + 1, side))
                }
                ChannelAssignment::RightSide => {
                    let (side, right) = self.block.chan_pair_mut(0, 1);

                    read_subframe(&mut bs, bits_per_sample + 1, side)
                        .and_then(|_| read_subframe(&mut bs, bits_per_sample, right))
                }
            };

            // The frame is zero-padded to a byte boundary before the footer.
            bs.realign();

            result
        };

        match subframe_result {
            Ok(()) => (),
            Err(Error::DecodeError(msg)) => {
                warn!("bad subframe: {}", msg);
                self.errors.push(ErrorStatus::LostSync);
                self.state = DecoderState::SearchForFrameSync;
                return Ok(false);
            }
            Err(err @ Error::Unsupported(_)) => {
                self.state = DecoderState::Unparseable;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        // Verify the frame CRC-16.
        let crc16_computed = reader_crc16.monitor().crc();
        let crc16_expected = reader_crc16.into_inner().read_be_u16()?;

        if crc16_computed != crc16_expected {
            warn!("frame crc mismatch; delivering a silent block");
            self.errors.push(ErrorStatus::FrameCrcMismatch);

            // A zero-filled block of the frame's stated length stands in for the lost audio.
            self.block.fill_zero();

            self.samples_decoded = first_sample + n_samples as u64;
            self.state = DecoderState::SearchForFrameSync;

            return Ok(true);
        }

        // Invert the stereo decorrelation.
        match header.channel_assignment {
            ChannelAssignment::Independent(_) => (),
            ChannelAssignment::LeftSide => {
                let (left, side) = self.block.chan_pair_mut(0, 1);
                invert_left_side(left, side);
            }
            ChannelAssignment::MidSide => {
                let (mid, side) = self.block.chan_pair_mut(0, 1);
                invert_mid_side(mid, side);
            }
            ChannelAssignment::RightSide => {
                let (side, right) = self.block.chan_pair_mut(0, 1);
                invert_right_side(right, side);
            }
        }

        if self.md5_checking {
            self.md5_accumulate();
        }

        self.samples_decoded = first_sample + n_samples as u64;
        self.state = DecoderState::SearchForFrameSync;

        Ok(true)
    }

    /// Accumulate the decoded block into the MD5 signature, interleaved and little-endian at
    /// the stream's rounded-up byte width.
    fn md5_accumulate(&mut self) {
        let info = self.stream_info.as_ref().expect("stream info precedes frames");

        let bytes_per_sample = ((info.bits_per_sample + 7) / 8) as usize;

        let n = self.block.len();
        let n_channels = self.block.spec().channels;

        self.md5_buf.clear();
        self.md5_buf.reserve(n * n_channels * bytes_per_sample);

        for i in 0..n {
            for ch in 0..n_channels {
                let sample = self.block.chan(ch)[i];
                self.md5_buf.extend_from_slice(&sample.to_le_bytes()[..bytes_per_sample]);
            }
        }

        self.md5.process_buf_bytes(&self.md5_buf);
    }

    /// Seek so that the next delivered block begins exactly at `sample`.
    ///
    /// The search interpolates within bounds refined by the stream's seek table, probes one
    /// frame per iteration, and backs off on overshoot. MD5 checking is disabled for the rest
    /// of the session since decoded coverage is no longer total.
    pub fn seek_to_sample(&mut self, target: u64) -> Result<()> {
        // The metadata must be parsed before the frame region can be addressed.
        self.read_metadata()?;

        if !self.reader.is_seekable() {
            return seek_error(SeekErrorKind::Unseekable);
        }

        let stream_length = match self.reader.byte_len() {
            Some(len) => len,
            None => return seek_error(SeekErrorKind::Untellable),
        };

        let info = match self.stream_info.clone() {
            Some(info) => info,
            None => return seek_error(SeekErrorKind::Unseekable),
        };

        if let Some(total) = info.n_samples {
            if target >= total {
                return seek_error(SeekErrorKind::OutOfRange);
            }
        }

        let n_channels = u64::from(info.channels);
        let bits_per_sample = u64::from(info.bits_per_sample);
        let is_variable = info.block_len_min != info.block_len_max;

        // A guess at the byte size of a frame; deliberately high rather than low.
        let mut approx_bytes_per_frame: u64 = if info.frame_byte_len_max > 0 {
            u64::from(info.frame_byte_len_max)
        }
        else if !is_variable {
            u64::from(info.block_len_min) * n_channels * bits_per_sample / 8 + 64
        }
        else {
            1152 * n_channels * bits_per_sample / 8 + 64
        };

        let first_frame_offset = self.first_frame_offset;

        // Set the coarsest bounds on the search: the start of the first frame, and the latest
        // offset at which a final frame could begin (with allowance for a trailing tag).
        let mut lower_bound = first_frame_offset;
        let mut upper_bound =
            stream_length.saturating_sub(approx_bytes_per_frame + 128 + 2).max(lower_bound + 1);

        // Refine the bounds with the seek table.
        let lower_point = self.seek_table.as_ref().and_then(|t| t.search_before(target)).copied();
        let upper_point = self.seek_table.as_ref().and_then(|t| t.search_after(target)).copied();

        if let Some(point) = lower_point {
            lower_bound = first_frame_offset + point.byte_offset;
        }

        if let Some(point) = upper_point {
            upper_bound = (first_frame_offset + point.byte_offset).max(lower_bound + 1);
        }

        // Guess at the target's position within the bounds.
        let mut pos: Option<i64> = None;

        if let Some(point) = lower_point {
            // If the target is within a few frames of the seek point, jump straight to it.
            if target < point.sample_number + u64::from(point.frame_samples) * 4 {
                pos = Some(lower_bound as i64);
            }
            else if let Some(upper) = upper_point {
                let target_offset = (target - point.sample_number) as f64;
                let range_samples = (upper.sample_number - point.sample_number) as f64;
                let range_bytes = (upper_bound - lower_bound) as f64;

                pos = Some(
                    lower_bound as i64
                        + (target_offset / range_samples * (range_bytes - 1.0)) as i64
                        - approx_bytes_per_frame as i64,
                );
            }
        }

        if pos.is_none() {
            // Without seek points, interpolate over the whole stream using the total length.
            pos = match info.n_samples {
                Some(total) => {
                    let span = (stream_length - first_frame_offset).saturating_sub(1) as f64;

                    Some(
                        first_frame_offset as i64
                            + (target as f64 / total as f64 * span) as i64
                            - approx_bytes_per_frame as i64,
                    )
                }
                None => Some(lower_bound as i64),
            };
        }

        let mut pos = pos.unwrap();

        // Decoded coverage is no longer total.
        self.md5_checking = false;
        self.pending = false;

        let mut last_pos: Option<i64> = None;
        let mut last_frame_sample = u64::MAX;
        let mut needs_seek = true;

        loop {
            // Clip the position to the bounds; the lower bound takes precedence.
            if pos >= upper_bound as i64 {
                pos = upper_bound as i64 - 1;
            }
            if pos < lower_bound as i64 {
                pos = lower_bound as i64;
            }

            if needs_seek {
                self.reader.seek(pos as u64)?;
                self.state = DecoderState::SearchForFrameSync;
            }

            // The end-of-stream short circuit keys off delivered samples, which do not reflect
            // the probe position; suppress it while searching.
            self.samples_decoded = 0;

            if !self.advance()? {
                return seek_error(SeekErrorKind::OutOfRange);
            }

            let frame_first = self.block.first_sample();
            let frame_len = self.block.len() as u64;

            debug!(
                "seek probe at pos={} found samples {}..{} (target {})",
                pos,
                frame_first,
                frame_first + frame_len,
                target
            );

            if target >= frame_first && target < frame_first + frame_len {
                // The target is inside this frame. Deliver it from the target onward.
                self.block.trim_start((target - frame_first) as usize);
                self.samples_decoded = self.block.first_sample() + self.block.len() as u64;
                self.pending = true;

                return Ok(());
            }

            // Narrow the search.
            if frame_first == last_frame_sample {
                // Two successive probes landed on the same frame; the last backwards move was
                // not big enough. Double it.
                let back = last_pos.map_or(approx_bytes_per_frame as i64, |last| last - pos);
                pos -= back;
                needs_seek = true;
            }
            else if target < frame_first {
                // Overshot. Back off by about one frame and try again.
                last_pos = Some(pos);
                approx_bytes_per_frame = frame_len * n_channels * bits_per_sample / 8 + 64;
                pos -= approx_bytes_per_frame as i64;
                needs_seek = true;
            }
            else {
                // Undershot. Continue decoding forward from here.
                last_pos = Some(pos);
                pos = self.reader.pos() as i64;
                needs_seek = false;
            }

            last_frame_sample = frame_first;
        }
    }
}

/// The stream position of a frame's first sample.
fn frame_first_sample(header: &FrameHeader, info: &StreamInfo) -> u64 {
    match header.block_sequence {
        BlockSequence::BySample(sample) => sample,
        // Fixed-blocksize streams position frames by frame number times the stream blocksize;
        // only the final frame may be shorter.
        BlockSequence::ByFrame(frame) => u64::from(frame) * u64::from(info.block_len_max),
    }
}
