// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp;
use std::io::{Seek, SeekFrom, Write};

use resona_core::checksum::{crc16_of, Md5};
use resona_core::errors::{config_error, not_streamable_error, verify_error, Result};
use resona_core::io::{BitWriter, MediaSink, Monitor};

use log::debug;

use crate::fixed;
use crate::fixed::MAX_FIXED_ORDER;
use crate::frame::{
    write_frame_header, BlockSequence, BlockingStrategy, ChannelAssignment, FrameHeader,
};
use crate::lpc;
use crate::lpc::{MAX_LPC_ORDER, MAX_QLP_COEFF_PRECISION, MIN_QLP_COEFF_PRECISION};
use crate::metadata::{MetadataBlock, SeekTable, SeekTableSpec, StreamInfo, FLAC_STREAM_MARKER};
use crate::rice;
use crate::rice::RicePlan;
use crate::verify::{Verifier, VerifyMismatch};

/// `EncoderOptions` carries the stream parameters and the compression search settings of an
/// encoder session. Every option is validated once when the session is created; a session's
/// configuration cannot change afterwards.
#[derive(Clone, Debug)]
pub struct EncoderOptions {
    /// The number of channels, 1 to 8.
    pub channels: u32,
    /// The width of the input samples in bits, 4 to 32.
    pub bits_per_sample: u32,
    /// The sample rate in Hz, 1 to 655350.
    pub sample_rate: u32,
    /// The number of samples per frame, 16 to 65535.
    pub block_size: u32,
    /// Restrict the stream parameters to the streamable subset.
    pub streamable_subset: bool,
    /// Evaluate stereo decorrelation when encoding a two channel stream.
    pub do_mid_side: bool,
    /// Toggle between independent and mid/side coding periodically instead of evaluating both
    /// for every frame. Cheaper, slightly worse compression.
    pub loose_mid_side: bool,
    /// The maximum linear predictor order. 0 disables linear prediction entirely.
    pub max_lpc_order: u32,
    /// The quantized coefficient precision in bits, 5 to 15, or 0 to choose automatically from
    /// the blocksize and sample width.
    pub qlp_coeff_precision: u32,
    /// Sweep every usable coefficient precision instead of using one.
    pub do_qlp_coeff_prec_search: bool,
    /// Evaluate every predictor order instead of estimating the best one.
    pub do_exhaustive_model_search: bool,
    /// The bounds of the Rice partition order search.
    pub min_residual_partition_order: u32,
    pub max_residual_partition_order: u32,
    /// Sweep this many Rice parameters on either side of the per-partition estimate.
    pub rice_parameter_search_dist: u32,
    /// A hint for the total number of samples that will be encoded, used to size the seek table
    /// and prime the stream information. 0 if unknown.
    pub total_samples_estimate: u64,
    /// The size of the trailing padding block in bytes, or `None` for no padding.
    pub padding: Option<u32>,
    /// Decode the encoded output in lockstep and compare it against the original samples.
    pub verify: bool,
    /// The seek points to reserve and fill while encoding.
    pub seek_table_spec: Option<SeekTableSpec>,
    /// Additional metadata blocks, written in order between the seek table and the padding.
    pub extra_metadata: Vec<MetadataBlock>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44_100,
            block_size: 4096,
            streamable_subset: true,
            do_mid_side: false,
            loose_mid_side: false,
            max_lpc_order: 8,
            qlp_coeff_precision: 0,
            do_qlp_coeff_prec_search: false,
            do_exhaustive_model_search: false,
            min_residual_partition_order: 0,
            max_residual_partition_order: 4,
            rice_parameter_search_dist: 0,
            total_samples_estimate: 0,
            padding: Some(4096),
            verify: false,
            seek_table_spec: None,
            extra_metadata: Vec::new(),
        }
    }
}

impl EncoderOptions {
    fn validate(&self) -> Result<()> {
        if self.channels < 1 || self.channels > 8 {
            return config_error("flac: channels must be in the range 1..=8");
        }

        if self.bits_per_sample < 4 || self.bits_per_sample > 32 {
            return config_error("flac: bits per sample must be in the range 4..=32");
        }

        if self.sample_rate < 1 || self.sample_rate > 655_350 {
            return config_error("flac: sample rate must be in the range 1..=655350");
        }

        if self.block_size < 16 || self.block_size > 65_535 {
            return config_error("flac: block size must be in the range 16..=65535");
        }

        if self.max_lpc_order > MAX_LPC_ORDER as u32 {
            return config_error("flac: maximum lpc order must be at most 32");
        }

        if self.block_size <= self.max_lpc_order {
            return config_error("flac: block size must exceed the maximum lpc order");
        }

        if self.qlp_coeff_precision != 0
            && (self.qlp_coeff_precision < MIN_QLP_COEFF_PRECISION
                || self.qlp_coeff_precision > MAX_QLP_COEFF_PRECISION)
        {
            return config_error("flac: qlp coefficient precision must be 0 or in 5..=15");
        }

        if self.max_residual_partition_order > 15 {
            return config_error("flac: maximum rice partition order must be at most 15");
        }

        if self.loose_mid_side && !self.do_mid_side {
            return config_error("flac: loose mid-side requires mid-side");
        }

        if self.do_mid_side && self.channels != 2 {
            return config_error("flac: mid-side coding requires exactly 2 channels");
        }

        if self.streamable_subset {
            let legal_block_size = match self.block_size {
                192 | 576 | 1152 | 2304 | 4608 => true,
                n => n.is_power_of_two() && n >= 256 && n <= 32_768,
            };

            if !legal_block_size {
                return not_streamable_error("flac: block size outside the streamable subset");
            }

            let rate = self.sample_rate;
            let legal_rate = matches!(
                rate,
                8_000
                    | 16_000
                    | 22_050
                    | 24_000
                    | 32_000
                    | 44_100
                    | 48_000
                    | 88_200
                    | 96_000
                    | 176_400
                    | 192_000
            ) || (rate % 1000 == 0 && rate / 1000 < 256)
                || rate < 65_536
                || (rate % 10 == 0 && rate / 10 < 65_536);

            if !legal_rate {
                return not_streamable_error("flac: sample rate outside the streamable subset");
            }

            if !matches!(self.bits_per_sample, 8 | 12 | 16 | 20 | 24) {
                return not_streamable_error("flac: bits per sample outside the streamable subset");
            }
        }

        Ok(())
    }

    /// Resolve the automatic coefficient precision from the blocksize and sample width.
    fn resolved_precision(&self) -> u32 {
        if self.qlp_coeff_precision != 0 {
            return self.qlp_coeff_precision;
        }

        if self.bits_per_sample < 16 {
            cmp::max(MIN_QLP_COEFF_PRECISION, 2 + self.bits_per_sample / 2)
        }
        else {
            match self.block_size {
                0..=192 => 7,
                193..=384 => 8,
                385..=576 => 9,
                577..=1152 => 10,
                1153..=2304 => 11,
                2305..=4608 => 12,
                _ => 13,
            }
        }
    }
}

/// The per-subframe model search settings, resolved from the session options.
struct SearchParams {
    do_exhaustive: bool,
    max_lpc_order: u32,
    precision: u32,
    do_precision_search: bool,
    min_partition_order: u32,
    max_partition_order: u32,
    rice_search_dist: u32,
}

/// The chosen model for one subframe.
enum SubframeKind {
    Constant { value: i32 },
    Verbatim,
    Fixed { order: u32, residual: Vec<i32>, rice: RicePlan },
    Lpc { order: u32, precision: u32, shift: i32, qlp: Vec<i32>, residual: Vec<i32>, rice: RicePlan },
}

/// A fully evaluated subframe: the winning model, the working samples with wasted bits shifted
/// out, and the exact encoded size.
struct SubframePlan {
    kind: SubframeKind,
    /// The working samples, right-shifted by `wasted_bits`.
    samples: Vec<i32>,
    wasted_bits: u32,
    /// The effective coded sample width: the channel's width minus the wasted bits.
    bps: u32,
    /// The exact encoded size of the subframe in bits.
    bits: u64,
}

/// Find the greatest `w` such that every sample is a multiple of `2^w`, and shift the samples
/// right by `w`.
fn extract_wasted_bits(signal: &mut [i32]) -> u32 {
    let mut acc = 0i32;

    for &s in signal.iter() {
        acc |= s;
        if acc & 1 != 0 {
            return 0;
        }
    }

    if acc == 0 {
        return 0;
    }

    let shift = acc.trailing_zeros();

    for s in signal.iter_mut() {
        *s >>= shift;
    }

    shift
}

/// The size in bits of a subframe header with the given wasted bit count.
fn subframe_header_bits(wasted_bits: u32) -> u64 {
    // Zero-pad bit, 6 type bits, wasted-bits flag, and the unary wasted count when present.
    u64::from(8 + wasted_bits)
}

/// Evaluate every candidate model for one channel of one frame and return the cheapest.
///
/// Verbatim is the cost ceiling: a predictive model replaces it only when strictly cheaper, and
/// ties among the models resolve in evaluation order (constant, fixed, lpc).
fn evaluate_subframe(samples: &[i32], channel_bps: u32, params: &SearchParams) -> SubframePlan {
    let mut working = samples.to_vec();
    let wasted_bits = extract_wasted_bits(&mut working);

    let bps = channel_bps - wasted_bits;
    let n = working.len();

    let header_bits = subframe_header_bits(wasted_bits);

    let verbatim_bits = header_bits + n as u64 * u64::from(bps);

    // The best model found so far, not counting the verbatim fallback.
    let mut best: Option<(SubframeKind, u64)> = None;

    let consider = |best: &mut Option<(SubframeKind, u64)>, kind: SubframeKind, bits: u64| {
        if best.as_ref().map_or(true, |(_, b)| bits < *b) {
            *best = Some((kind, bits));
        }
    };

    if working.iter().all(|&s| s == working[0]) {
        // A constant subframe beats everything else; no other model needs evaluation.
        let bits = header_bits + u64::from(bps);

        consider(&mut best, SubframeKind::Constant { value: working[0] }, bits);
    }
    else if n > MAX_FIXED_ORDER {
        // Fixed polynomial predictors.
        let (guess_order, est_bits) = fixed::compute_best_predictor(&working);

        let (min_fixed, max_fixed) =
            if params.do_exhaustive { (0, MAX_FIXED_ORDER as u32) } else { (guess_order, guess_order) };

        for order in min_fixed..=max_fixed {
            if est_bits[order as usize] >= f64::from(bps) {
                // The estimate already exceeds a verbatim coding; don't bother.
                continue;
            }

            let mut residual = vec![0i32; n - order as usize];
            fixed::compute_residual(&working, order, &mut residual);

            let rice = rice::find_best_partition_order(
                &residual,
                order,
                params.min_partition_order,
                params.max_partition_order,
                params.rice_search_dist,
            );

            let bits = header_bits + u64::from(order) * u64::from(bps) + rice.bits;

            consider(&mut best, SubframeKind::Fixed { order, residual, rice }, bits);
        }

        // Linear prediction. The coefficient precision is bounded by 31 - bps; when that leaves
        // less than the minimum precision, linear prediction cannot be used at this width.
        let precision_limit = 31u32.saturating_sub(bps).min(MAX_QLP_COEFF_PRECISION);

        if params.max_lpc_order > 0 && precision_limit >= MIN_QLP_COEFF_PRECISION {
            let max_order = cmp::min(params.max_lpc_order as usize, n - 1);

            let real_signal: Vec<f64> = working.iter().map(|&s| f64::from(s)).collect();

            let mut autoc = [0f64; MAX_LPC_ORDER + 1];
            lpc::compute_autocorrelation(&real_signal, max_order, &mut autoc);

            // A zero autocorrelation means a constant (zero) signal, handled above in all but
            // pathological cases.
            if autoc[0] != 0.0 {
                let mut lp_coeff = vec![[0f64; MAX_LPC_ORDER]; max_order];
                let mut lpc_error = vec![0f64; max_order];

                lpc::compute_lp_coefficients(&autoc, max_order, &mut lp_coeff, &mut lpc_error);

                let (min_order, max_order) = if params.do_exhaustive {
                    (1, max_order)
                }
                else {
                    let guess = lpc::compute_best_order(&lpc_error, max_order, n, bps);
                    (guess, guess)
                };

                let (min_precision, max_precision) = if params.do_precision_search {
                    (MIN_QLP_COEFF_PRECISION, precision_limit)
                }
                else {
                    let p = params.precision.clamp(MIN_QLP_COEFF_PRECISION, precision_limit);
                    (p, p)
                };

                for order in min_order..=max_order {
                    let est =
                        lpc::compute_expected_bits_per_residual_sample(lpc_error[order - 1], n);

                    if est >= f64::from(bps) {
                        continue;
                    }

                    for precision in min_precision..=max_precision {
                        let mut qlp = [0i32; MAX_LPC_ORDER];

                        let shift = match lpc::quantize_coefficients(
                            &lp_coeff[order - 1][..order],
                            precision,
                            &mut qlp,
                        ) {
                            Some(shift) => shift,
                            // The coefficients cannot be quantized at this precision.
                            None => continue,
                        };

                        let mut residual = vec![0i32; n - order];

                        if bps <= 16 && precision <= 16 {
                            lpc::compute_residual_16bit(
                                &working,
                                &qlp[..order],
                                shift as u32,
                                &mut residual,
                            );
                        }
                        else {
                            lpc::compute_residual(&working, &qlp[..order], shift as u32, &mut residual);
                        }

                        let rice = rice::find_best_partition_order(
                            &residual,
                            order as u32,
                            params.min_partition_order,
                            params.max_partition_order,
                            params.rice_search_dist,
                        );

                        let bits = header_bits
                            + u64::from(order as u32) * u64::from(bps)
                            + 4
                            + 5
                            + u64::from(order as u32) * u64::from(precision)
                            + rice.bits;

                        consider(
                            &mut best,
                            SubframeKind::Lpc {
                                order: order as u32,
                                precision,
                                shift,
                                qlp: qlp[..order].to_vec(),
                                residual,
                                rice,
                            },
                            bits,
                        );
                    }
                }
            }
        }
    }

    // Fall back to the verbatim ceiling when no model is at least as cheap.
    let (kind, bits) = match best {
        Some((kind, bits)) if bits <= verbatim_bits => (kind, bits),
        _ => (SubframeKind::Verbatim, verbatim_bits),
    };

    SubframePlan { kind, samples: working, wasted_bits, bps, bits }
}

/// Emit an evaluated subframe into the frame bit buffer.
fn write_subframe(bw: &mut BitWriter, plan: &SubframePlan) {
    let start_bits = bw.bit_count();

    // Zero-pad bit.
    bw.write_raw_uint32(0, 1);

    let type_enc = match &plan.kind {
        SubframeKind::Constant { .. } => 0x00,
        SubframeKind::Verbatim => 0x01,
        SubframeKind::Fixed { order, .. } => 0x08 | order,
        SubframeKind::Lpc { order, .. } => 0x20 | (order - 1),
    };

    bw.write_raw_uint32(type_enc, 6);

    if plan.wasted_bits > 0 {
        bw.write_raw_uint32(1, 1);
        bw.write_unary(plan.wasted_bits - 1);
    }
    else {
        bw.write_raw_uint32(0, 1);
    }

    match &plan.kind {
        SubframeKind::Constant { value } => {
            bw.write_raw_int32(*value, plan.bps);
        }
        SubframeKind::Verbatim => {
            for &s in &plan.samples {
                bw.write_raw_int32(s, plan.bps);
            }
        }
        SubframeKind::Fixed { order, residual, rice } => {
            for &s in &plan.samples[..*order as usize] {
                bw.write_raw_int32(s, plan.bps);
            }

            rice::write_residual(bw, residual, *order, rice);
        }
        SubframeKind::Lpc { order, precision, shift, qlp, residual, rice } => {
            for &s in &plan.samples[..*order as usize] {
                bw.write_raw_int32(s, plan.bps);
            }

            bw.write_raw_uint32(precision - 1, 4);
            bw.write_raw_int32(*shift, 5);

            for &c in qlp {
                bw.write_raw_int32(c, *precision);
            }

            rice::write_residual(bw, residual, *order, rice);
        }
    }

    // The evaluated size is exact by construction.
    debug_assert_eq!(bw.bit_count() - start_bits, plan.bits);
}

/// A FLAC stream encoder session.
///
/// A session is created with [`StreamEncoder::new`], which validates the configuration and
/// writes the stream marker and metadata blocks. Samples are then submitted with
/// [`StreamEncoder::process`] or [`StreamEncoder::process_interleaved`], and the session is
/// completed with [`StreamEncoder::finish`], which flushes the final partial frame and, when the
/// sink is seekable, rewrites the stream information and seek table with their final values.
pub struct StreamEncoder {
    sink: Box<dyn MediaSink>,
    opts: EncoderOptions,

    blocksize: usize,
    channels: usize,
    bps: u32,
    precision: u32,

    /// The accumulating per-channel sample block.
    signal: Vec<Vec<i32>>,
    /// The mid/side transform of the block; maintained only for two channel mid/side sessions.
    signal_mid_side: Vec<Vec<i32>>,
    /// The block fill level.
    n_buffered: usize,

    frame: BitWriter,
    frame_number: u32,

    md5: Md5,
    md5_buf: Vec<u8>,

    samples_written: u64,
    min_framesize: u32,
    max_framesize: u32,

    /// Frame cadence for loose mid/side coding.
    loose_period: u32,
    loose_frame_count: u32,
    last_channel_assignment: ChannelAssignment,

    seek_table: Option<SeekTable>,
    /// Byte offset of the stream information block header in the output.
    stream_info_offset: u64,
    /// Byte offset of the seek table block header in the output.
    seek_table_offset: u64,
    /// Byte offset of the first audio frame.
    first_frame_offset: u64,
    /// Total bytes written to the sink.
    out_pos: u64,

    verifier: Option<Verifier>,
    verify_failure: Option<VerifyMismatch>,
    /// Set when verification has failed; all further operations are rejected.
    failed: bool,
}

impl StreamEncoder {
    /// Create an encoder session: validate the configuration and write the stream marker, the
    /// stream information block, the seek table, any extra metadata, and the padding block.
    pub fn new(sink: Box<dyn MediaSink>, opts: EncoderOptions) -> Result<StreamEncoder> {
        opts.validate()?;

        // Stereo decorrelation would require 33-bit side samples at a 32-bit sample width.
        let mut opts = opts;
        if opts.bits_per_sample >= 32 {
            opts.do_mid_side = false;
            opts.loose_mid_side = false;
        }

        let blocksize = opts.block_size as usize;
        let channels = opts.channels as usize;

        let seek_table = match &opts.seek_table_spec {
            Some(spec) => {
                let mut table =
                    spec.clone().into_template(opts.total_samples_estimate, opts.sample_rate);
                table.bucket_to_block_len(opts.block_size);

                if table.points.is_empty() {
                    None
                }
                else {
                    Some(table)
                }
            }
            None => None,
        };

        let do_mid_side = opts.do_mid_side && channels == 2;

        // One independent/mid-side toggle every ~400ms of audio.
        let loose_period = cmp::max(
            1,
            (f64::from(opts.sample_rate) * 0.4 / opts.block_size as f64).round() as u32,
        );

        let verifier = if opts.verify { Some(Verifier::new()) } else { None };

        let precision = opts.resolved_precision();

        let mut encoder = StreamEncoder {
            sink,
            blocksize,
            channels,
            bps: opts.bits_per_sample,
            precision,
            signal: vec![vec![0; blocksize]; channels],
            signal_mid_side: if do_mid_side { vec![vec![0; blocksize]; 2] } else { Vec::new() },
            n_buffered: 0,
            frame: BitWriter::new(),
            frame_number: 0,
            md5: Md5::default(),
            md5_buf: Vec::new(),
            samples_written: 0,
            min_framesize: u32::MAX,
            max_framesize: 0,
            loose_period,
            loose_frame_count: 0,
            last_channel_assignment: ChannelAssignment::Independent(opts.channels),
            seek_table,
            stream_info_offset: 0,
            seek_table_offset: 0,
            first_frame_offset: 0,
            out_pos: 0,
            verifier,
            verify_failure: None,
            failed: false,
            opts,
        };

        encoder.write_stream_header()?;

        Ok(encoder)
    }

    /// Write the stream marker and all leading metadata blocks.
    fn write_stream_header(&mut self) -> Result<()> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&FLAC_STREAM_MARKER);

        // The stream information block is mandatory and first. Frame sizes and the MD5
        // signature are placeholders until finalization.
        self.stream_info_offset = buf.len() as u64;

        let info = self.stream_info_template(None);

        let n_more_blocks = usize::from(self.seek_table.is_some())
            + self.opts.extra_metadata.len()
            + usize::from(self.opts.padding.is_some());

        MetadataBlock::StreamInfo(info).write_to(&mut buf, n_more_blocks == 0)?;

        if let Some(table) = &self.seek_table {
            self.seek_table_offset = buf.len() as u64;

            let is_last = self.opts.extra_metadata.is_empty() && self.opts.padding.is_none();
            MetadataBlock::SeekTable(table.clone()).write_to(&mut buf, is_last)?;
        }

        for (i, block) in self.opts.extra_metadata.iter().enumerate() {
            let is_last = i + 1 == self.opts.extra_metadata.len() && self.opts.padding.is_none();
            block.write_to(&mut buf, is_last)?;
        }

        if let Some(padding) = self.opts.padding {
            MetadataBlock::Padding(padding).write_to(&mut buf, true)?;
        }

        self.write_out(&buf)?;
        self.first_frame_offset = self.out_pos;

        Ok(())
    }

    /// The stream information block with the current (or final) session totals.
    fn stream_info_template(&self, md5: Option<[u8; 16]>) -> StreamInfo {
        StreamInfo {
            block_len_min: self.blocksize as u16,
            block_len_max: self.blocksize as u16,
            frame_byte_len_min: if self.min_framesize == u32::MAX { 0 } else { self.min_framesize },
            frame_byte_len_max: self.max_framesize,
            sample_rate: self.opts.sample_rate,
            channels: self.opts.channels,
            bits_per_sample: self.bps,
            n_samples: match (self.samples_written, self.opts.total_samples_estimate) {
                (0, 0) => None,
                (0, estimate) => Some(estimate),
                (written, _) => Some(written),
            },
            md5,
        }
    }

    /// Write bytes to the sink, feeding the verification decoder and the position accounting.
    fn write_out(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes)?;
        self.out_pos += bytes.len() as u64;

        if let Some(verifier) = &mut self.verifier {
            verifier.feed_bytes(bytes);
        }

        Ok(())
    }

    /// Submit a block of planar samples, one slice per channel, all of equal length.
    pub fn process(&mut self, buffers: &[&[i32]]) -> Result<()> {
        if self.failed {
            return verify_error("flac: session failed verification");
        }

        if buffers.len() != self.channels {
            return config_error("flac: wrong number of channel buffers");
        }

        let n_samples = buffers[0].len();

        if buffers.iter().any(|b| b.len() != n_samples) {
            return config_error("flac: channel buffers must be of equal length");
        }

        let mut j = 0;

        while j < n_samples {
            let fill = self.n_buffered;
            let take = cmp::min(self.blocksize - fill, n_samples - j);

            for (signal, buffer) in self.signal.iter_mut().zip(buffers) {
                signal[fill..fill + take].copy_from_slice(&buffer[j..j + take]);
            }

            self.n_buffered += take;
            j += take;

            if self.n_buffered == self.blocksize {
                self.process_frame(false)?;
            }
        }

        Ok(())
    }

    /// Submit interleaved samples. The slice length must be a multiple of the channel count.
    pub fn process_interleaved(&mut self, buffer: &[i32]) -> Result<()> {
        if self.failed {
            return verify_error("flac: session failed verification");
        }

        if buffer.len() % self.channels != 0 {
            return config_error("flac: interleaved buffer length is not a channel multiple");
        }

        let n_samples = buffer.len() / self.channels;
        let mut j = 0;

        while j < n_samples {
            let fill = self.n_buffered;
            let take = cmp::min(self.blocksize - fill, n_samples - j);

            for (ch, signal) in self.signal.iter_mut().enumerate() {
                for i in 0..take {
                    signal[fill + i] = buffer[(j + i) * self.channels + ch];
                }
            }

            self.n_buffered += take;
            j += take;

            if self.n_buffered == self.blocksize {
                self.process_frame(false)?;
            }
        }

        Ok(())
    }

    /// Complete the session: flush the final partial frame, and rewrite the stream information
    /// and seek table with their final values when the sink allows it. Returns the sink.
    pub fn finish(mut self) -> Result<Box<dyn MediaSink>> {
        if self.failed {
            return verify_error("flac: session failed verification");
        }

        if self.n_buffered > 0 {
            self.process_frame(true)?;
        }

        let md5 = self.md5.md5();

        if self.sink.is_seekable() {
            // Overwrite the stream information payload with the final totals. The byte offsets
            // skip the 4-byte block headers, which do not change.
            let info = self.stream_info_template(Some(md5));

            let mut payload = Vec::new();
            info.write_to(&mut payload)?;

            self.sink.seek(SeekFrom::Start(self.stream_info_offset + 4))?;
            self.sink.write_all(&payload)?;

            if let Some(table) = &mut self.seek_table {
                // Seek points that were never reached revert to placeholders.
                for point in table.points.iter_mut() {
                    if !point.is_placeholder() && point.frame_samples == 0 {
                        *point = crate::metadata::SeekPoint::PLACEHOLDER;
                    }
                }

                let mut payload = Vec::new();
                table.write_to(&mut payload)?;

                self.sink.seek(SeekFrom::Start(self.seek_table_offset + 4))?;
                self.sink.write_all(&payload)?;
            }

            self.sink.seek(SeekFrom::Start(self.out_pos))?;
        }
        else {
            debug!("sink is unseekable; stream information keeps placeholder values");
        }

        self.sink.flush()?;

        Ok(self.sink)
    }

    /// The number of samples encoded so far.
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// The number of frames emitted so far.
    pub fn frames_written(&self) -> u32 {
        self.frame_number
    }

    /// The details of the first verification mismatch, if one occurred.
    pub fn verify_mismatch(&self) -> Option<&VerifyMismatch> {
        self.verify_failure.as_ref()
    }

    /// Encode and emit the buffered block as one frame.
    fn process_frame(&mut self, is_last: bool) -> Result<()> {
        let n = self.n_buffered;

        debug_assert!(n > 0);
        debug_assert!(is_last || n == self.blocksize);

        // Accumulate the raw signal into the MD5 signature.
        self.md5_accumulate(n);

        // Hand the original samples to the verification decoder before they are disturbed.
        if let Some(verifier) = &mut self.verifier {
            verifier.push_samples(&self.signal, n);
        }

        // The Rice partition order is bounded by the power-of-two factorization of the
        // blocksize. The final (possibly odd-sized) block is coded without partitioning.
        let max_partition_order = if is_last {
            0
        }
        else {
            cmp::min(self.opts.max_residual_partition_order, (n as u32).trailing_zeros())
        };

        let params = SearchParams {
            do_exhaustive: self.opts.do_exhaustive_model_search,
            max_lpc_order: self.opts.max_lpc_order,
            precision: self.precision,
            do_precision_search: self.opts.do_qlp_coeff_prec_search,
            min_partition_order: cmp::min(
                self.opts.min_residual_partition_order,
                max_partition_order,
            ),
            max_partition_order,
            rice_search_dist: self.opts.rice_parameter_search_dist,
        };

        // Decide which channel layouts to evaluate this frame.
        let do_mid_side = !self.signal_mid_side.is_empty();

        let (eval_independent, eval_mid_side) = if do_mid_side {
            if self.opts.loose_mid_side && self.loose_frame_count > 0 {
                let keep_independent = matches!(
                    self.last_channel_assignment,
                    ChannelAssignment::Independent(_)
                );
                (keep_independent, !keep_independent)
            }
            else {
                (true, true)
            }
        }
        else {
            (true, false)
        };

        // Fill the mid/side transform of the block.
        if eval_mid_side {
            for i in 0..n {
                let left = i64::from(self.signal[0][i]);
                let right = i64::from(self.signal[1][i]);

                // Note: the floored average, not (left + right) / 2; the dropped carry bit is
                // recovered on decode from the side channel's parity.
                self.signal_mid_side[0][i] = ((left + right) >> 1) as i32;
                self.signal_mid_side[1][i] = (left - right) as i32;
            }
        }

        let independent_plans: Vec<SubframePlan> = if eval_independent {
            self.signal
                .iter()
                .map(|signal| evaluate_subframe(&signal[..n], self.bps, &params))
                .collect()
        }
        else {
            Vec::new()
        };

        // The side (difference) channel requires one extra bit per sample.
        let mid_side_plans: Vec<SubframePlan> = if eval_mid_side {
            self.signal_mid_side
                .iter()
                .enumerate()
                .map(|(ch, signal)| {
                    let channel_bps = self.bps + if ch == 1 { 1 } else { 0 };
                    evaluate_subframe(&signal[..n], channel_bps, &params)
                })
                .collect()
        }
        else {
            Vec::new()
        };

        // Choose the channel assignment.
        let channel_assignment = if !do_mid_side {
            ChannelAssignment::Independent(self.channels as u32)
        }
        else if self.opts.loose_mid_side && self.loose_frame_count > 0 {
            match self.last_channel_assignment {
                ChannelAssignment::Independent(_) => ChannelAssignment::Independent(2),
                _ => ChannelAssignment::MidSide,
            }
        }
        else {
            let bits = [
                (
                    ChannelAssignment::Independent(2),
                    independent_plans[0].bits + independent_plans[1].bits,
                ),
                (
                    ChannelAssignment::LeftSide,
                    independent_plans[0].bits + mid_side_plans[1].bits,
                ),
                (
                    ChannelAssignment::RightSide,
                    independent_plans[1].bits + mid_side_plans[1].bits,
                ),
                (ChannelAssignment::MidSide, mid_side_plans[0].bits + mid_side_plans[1].bits),
            ];

            bits.iter().min_by_key(|(_, bits)| *bits).map(|(ca, _)| *ca).unwrap()
        };

        // Compose the frame.
        self.frame.clear();

        let header = FrameHeader {
            blocking_strategy: BlockingStrategy::Fixed,
            block_sequence: BlockSequence::ByFrame(self.frame_number),
            block_num_samples: n as u16,
            channel_assignment,
            bits_per_sample: None,
            sample_rate: None,
        };

        write_frame_header(&mut self.frame, &header, self.opts.sample_rate, self.bps)?;

        match channel_assignment {
            ChannelAssignment::Independent(_) => {
                for plan in &independent_plans {
                    write_subframe(&mut self.frame, plan);
                }
            }
            ChannelAssignment::LeftSide => {
                write_subframe(&mut self.frame, &independent_plans[0]);
                write_subframe(&mut self.frame, &mid_side_plans[1]);
            }
            ChannelAssignment::RightSide => {
                write_subframe(&mut self.frame, &mid_side_plans[1]);
                write_subframe(&mut self.frame, &independent_plans[1]);
            }
            ChannelAssignment::MidSide => {
                write_subframe(&mut self.frame, &mid_side_plans[0]);
                write_subframe(&mut self.frame, &mid_side_plans[1]);
            }
        }

        self.frame.zero_pad_to_byte_boundary();

        // The frame footer is the CRC-16 of everything before it.
        let crc = crc16_of(self.frame.as_slice());
        self.frame.write_raw_uint32(u32::from(crc), 16);

        // Capture any seek points that land in this frame.
        let frame_first_sample = self.samples_written;
        let frame_offset = self.out_pos - self.first_frame_offset;

        if let Some(table) = &mut self.seek_table {
            for point in table.points.iter_mut() {
                if !point.is_placeholder()
                    && point.frame_samples == 0
                    && point.sample_number >= frame_first_sample
                    && point.sample_number < frame_first_sample + n as u64
                {
                    point.sample_number = frame_first_sample;
                    point.byte_offset = frame_offset;
                    point.frame_samples = n as u16;
                }
            }
        }

        let frame_bytes = self.frame.as_slice().to_vec();

        self.write_out(&frame_bytes)?;

        // Run the verification decoder over the frame it just received.
        if let Some(mut verifier) = self.verifier.take() {
            let result = verifier.verify_frame();

            if result.is_err() {
                if let Some(mismatch) = verifier.mismatch() {
                    log::warn!(
                        "verification mismatch at sample {} (frame {}, channel {})",
                        mismatch.absolute_sample,
                        mismatch.frame_number,
                        mismatch.channel
                    );
                    self.verify_failure = Some(mismatch.clone());
                }

                self.failed = true;
                self.verifier = Some(verifier);

                return result;
            }

            self.verifier = Some(verifier);
        }

        // Get ready for the next frame.
        let frame_len = frame_bytes.len() as u32;
        self.min_framesize = cmp::min(self.min_framesize, frame_len);
        self.max_framesize = cmp::max(self.max_framesize, frame_len);

        self.samples_written += n as u64;
        self.frame_number += 1;
        self.n_buffered = 0;

        if self.opts.loose_mid_side {
            self.loose_frame_count += 1;
            if self.loose_frame_count >= self.loose_period {
                self.loose_frame_count = 0;
            }
        }

        self.last_channel_assignment = channel_assignment;

        Ok(())
    }

    /// Accumulate the block's raw samples into the MD5 signature: interleaved, little-endian,
    /// at the stream's rounded-up byte width.
    fn md5_accumulate(&mut self, n: usize) {
        let bytes_per_sample = ((self.bps + 7) / 8) as usize;

        self.md5_buf.clear();
        self.md5_buf.reserve(n * self.channels * bytes_per_sample);

        for i in 0..n {
            for signal in &self.signal {
                self.md5_buf.extend_from_slice(&signal[i].to_le_bytes()[..bytes_per_sample]);
            }
        }

        self.md5.process_buf_bytes(&self.md5_buf);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use resona_core::io::BitWriter;

    /// Evaluate and emit a single subframe with default search settings, for decode tests.
    pub(crate) fn write_test_subframe(samples: &[i32], bps: u32) -> Vec<u8> {
        let params = SearchParams {
            do_exhaustive: false,
            max_lpc_order: 8,
            precision: 12,
            do_precision_search: false,
            min_partition_order: 0,
            max_partition_order: 4,
            rice_search_dist: 0,
        };

        let plan = evaluate_subframe(samples, bps, &params);

        let mut bw = BitWriter::new();
        write_subframe(&mut bw, &plan);
        bw.zero_pad_to_byte_boundary();

        bw.as_slice().to_vec()
    }

    fn search_params() -> SearchParams {
        SearchParams {
            do_exhaustive: true,
            max_lpc_order: 8,
            precision: 12,
            do_precision_search: false,
            min_partition_order: 0,
            max_partition_order: 4,
            rice_search_dist: 0,
        }
    }

    #[test]
    fn verify_extract_wasted_bits() {
        let mut signal = vec![8, -16, 24, 0, 40];
        assert_eq!(extract_wasted_bits(&mut signal), 3);
        assert_eq!(signal, vec![1, -2, 3, 0, 5]);

        let mut signal = vec![3, 6, 9];
        assert_eq!(extract_wasted_bits(&mut signal), 0);

        let mut silent = vec![0; 8];
        assert_eq!(extract_wasted_bits(&mut silent), 0);
    }

    #[test]
    fn verify_constant_subframe_selection() {
        let samples = vec![7i32; 256];

        let plan = evaluate_subframe(&samples, 16, &search_params());

        assert!(matches!(plan.kind, SubframeKind::Constant { value: 7 }));
        // Header plus a single 16-bit sample value. 7 is odd, so no wasted-bits shift applies.
        assert_eq!(plan.bits, 8 + 16);
    }

    #[test]
    fn verify_ramp_selects_fixed_or_lpc() {
        // A ramp is perfectly modelled by the order-2 fixed predictor.
        let samples: Vec<i32> = (0..4096).map(|i| i - 2048).collect();

        let plan = evaluate_subframe(&samples, 16, &search_params());

        match &plan.kind {
            SubframeKind::Fixed { .. } | SubframeKind::Lpc { .. } => (),
            _ => panic!("expected a predictive model for a ramp"),
        }

        assert!(plan.bits < 8 + 4096 * 16);
    }

    #[test]
    fn verify_noise_falls_back_to_verbatim() {
        // Full-scale noise at 4 bits has no structure to exploit; verbatim must win (or at
        // least never be beaten by an overestimating model).
        let mut state = 0xdeadbeefu32;
        let samples: Vec<i32> = (0..64)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                ((state >> 16) as i32 & 0xf) - 8
            })
            .collect();

        let plan = evaluate_subframe(&samples, 4, &search_params());

        assert!(plan.bits <= 8 + 64 * 4);
    }

    #[test]
    fn verify_options_validation() {
        let sink = || Box::new(std::io::Cursor::new(Vec::new()));

        let mut opts = EncoderOptions { channels: 9, ..Default::default() };
        assert!(StreamEncoder::new(sink(), opts.clone()).is_err());

        opts = EncoderOptions { block_size: 1000, ..Default::default() };
        // 1000 is not in the streamable subset.
        assert!(StreamEncoder::new(sink(), opts.clone()).is_err());

        opts.streamable_subset = false;
        assert!(StreamEncoder::new(sink(), opts).is_ok());

        opts = EncoderOptions { do_mid_side: true, channels: 1, ..Default::default() };
        assert!(StreamEncoder::new(sink(), opts).is_err());

        opts = EncoderOptions { loose_mid_side: true, do_mid_side: false, ..Default::default() };
        assert!(StreamEncoder::new(sink(), opts).is_err());
    }

    #[test]
    fn verify_header_emitted_on_init() {
        let opts = EncoderOptions { padding: Some(64), ..Default::default() };

        let encoder = StreamEncoder::new(Box::new(std::io::Cursor::new(Vec::new())), opts).unwrap();

        // Marker, stream info (4 + 34), padding (4 + 64).
        assert_eq!(encoder.out_pos, 4 + 38 + 68);
        assert_eq!(encoder.first_frame_offset, encoder.out_pos);
    }
}
