// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use resona_core::errors::{decode_error, unsupported_error, Result};
use resona_core::io::{BitStreamLtr, ReadBytes};

use crate::fixed;
use crate::lpc;

#[derive(Debug)]
enum SubFrameType {
    Constant,
    Verbatim,
    FixedLinear(u32),
    Linear(u32),
}

/// Read one subframe of `buf.len()` samples at the given effective bits per sample.
pub fn read_subframe<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    frame_bps: u32,
    buf: &mut [i32],
) -> Result<()> {
    // The first subframe bit must always be 0.
    if bs.read_bit()? {
        return decode_error("flac: subframe padding is not 0");
    }

    // The next 6 bits designate the subframe type.
    let subframe_type_enc = bs.read_bits_leq32(6)?;

    let subframe_type = match subframe_type_enc {
        0x00 => SubFrameType::Constant,
        0x01 => SubFrameType::Verbatim,
        0x08..=0x0f => {
            let order = subframe_type_enc & 0x07;
            // The fixed predictor only supports orders between 0 and 4.
            if order > 4 {
                return unsupported_error("flac: fixed predictor orders greater than 4 are invalid");
            }
            SubFrameType::FixedLinear(order)
        }
        0x20..=0x3f => SubFrameType::Linear((subframe_type_enc & 0x1f) + 1),
        _ => {
            return unsupported_error("flac: subframe type set to reserved value");
        }
    };

    // Bit 7 of the subframe header designates if there are any wasted bits per sample in the
    // audio sub-block. If the bit is set, unary decode the wasted bit count.
    let wasted_bits = if bs.read_bit()? { bs.read_unary_zeros()? + 1 } else { 0 };

    if wasted_bits >= frame_bps {
        return decode_error("flac: wasted bits exceed the bits per sample");
    }

    // The bits per sample stated in the frame header is for the decoded audio sub-block samples.
    // The encoder truncates `wasted_bits` of low order zero bits from every sample, so the
    // subframe is coded at a reduced effective width.
    let bps = frame_bps - wasted_bits;

    match subframe_type {
        SubFrameType::Constant => decode_constant(bs, bps, buf)?,
        SubFrameType::Verbatim => decode_verbatim(bs, bps, buf)?,
        SubFrameType::FixedLinear(order) => decode_fixed_linear(bs, bps, order, buf)?,
        SubFrameType::Linear(order) => decode_linear(bs, bps, order, buf)?,
    };

    // Shift the samples to restore the wasted bits.
    if wasted_bits > 0 {
        for sample in buf.iter_mut() {
            *sample = sample.wrapping_shl(wasted_bits);
        }
    }

    Ok(())
}

fn decode_constant<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    bps: u32,
    buf: &mut [i32],
) -> Result<()> {
    let const_sample = bs.read_bits_leq32_signed(bps)?;

    for sample in buf.iter_mut() {
        *sample = const_sample;
    }

    Ok(())
}

fn decode_verbatim<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    bps: u32,
    buf: &mut [i32],
) -> Result<()> {
    for sample in buf.iter_mut() {
        *sample = bs.read_bits_leq32_signed(bps)?;
    }

    Ok(())
}

fn decode_fixed_linear<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    bps: u32,
    order: u32,
    buf: &mut [i32],
) -> Result<()> {
    if order as usize > buf.len() {
        return decode_error("flac: fixed predictor order exceeds the block size");
    }

    // The first `order` samples are encoded verbatim to warm-up the predictor.
    decode_verbatim(bs, bps, &mut buf[..order as usize])?;

    // Decode the residuals for the predicted samples.
    decode_residual(bs, order, buf)?;

    // Run the fixed predictor over the residuals.
    fixed::restore_signal(order, buf);

    Ok(())
}

fn decode_linear<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    bps: u32,
    order: u32,
    buf: &mut [i32],
) -> Result<()> {
    // The order of the linear predictor is in the range 1..=32.
    debug_assert!(order > 0 && order <= 32);

    if order as usize > buf.len() {
        return decode_error("flac: lpc predictor order exceeds the block size");
    }

    // The first `order` samples are encoded verbatim to warm-up the predictor.
    decode_verbatim(bs, bps, &mut buf[..order as usize])?;

    // Quantized linear predictor (QLP) coefficient precision in bits.
    let qlp_precision = bs.read_bits_leq32(4)? + 1;
    if qlp_precision > 15 {
        return unsupported_error("flac: qlp precision set to reserved value");
    }

    // QLP coefficient shift, a 5-bit signed value. A negative shift never occurs in practice and
    // its interpretation is contentious, so it is rejected.
    let qlp_shift = bs.read_bits_leq32_signed(5)?;

    if qlp_shift < 0 {
        return unsupported_error("flac: lpc shifts less than 0 are not supported");
    }

    // The coefficients are stored first-coefficient first, where the prediction for sample i is
    // the dot product of coefficients 0..order with samples i-1, i-2, ..
    let mut qlp_coeffs = [0i32; 32];

    for coeff in qlp_coeffs[..order as usize].iter_mut() {
        *coeff = bs.read_bits_leq32_signed(qlp_precision)?;
    }

    decode_residual(bs, order, buf)?;

    lpc::restore_signal(&qlp_coeffs[..order as usize], qlp_shift as u32, buf);

    Ok(())
}

pub(crate) fn decode_residual<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    n_prelude_samples: u32,
    buf: &mut [i32],
) -> Result<()> {
    let method_enc = bs.read_bits_leq32(2)?;

    // The format defines two residual coding methods: Rice and Rice2. The only difference
    // between the two is the bit width of the Rice parameter.
    let param_bit_width = match method_enc {
        0x0 => 4,
        0x1 => 5,
        _ => {
            return unsupported_error("flac: residual method set to reserved value");
        }
    };

    // Read the partition order.
    let order = bs.read_bits_leq32(4)?;

    // The number of partitions is equal to 2^order.
    let n_partitions = 1usize << order;

    // In general, all partitions have the same number of samples such that the sum of all
    // partition lengths equals the block length. However, since the warm-up samples are stored
    // verbatim, the first partition has n_prelude_samples fewer samples.
    let n_partition_samples = buf.len() >> order;

    if n_prelude_samples as usize > n_partition_samples {
        return decode_error("flac: residual partition too small for given predictor order");
    }

    // Ensure that the sum of all partition lengths equals the block size.
    if n_partitions * n_partition_samples != buf.len() {
        return decode_error("flac: block size is not same as encoded residual");
    }

    // Decode the first partition, which is short by the prelude samples.
    decode_rice_partition(bs, param_bit_width, &mut buf[n_prelude_samples as usize..n_partition_samples])?;

    // Decode the remaining partitions.
    for chunk in buf[n_partition_samples..].chunks_mut(n_partition_samples) {
        decode_rice_partition(bs, param_bit_width, chunk)?;
    }

    Ok(())
}

fn decode_rice_partition<B: ReadBytes>(
    bs: &mut BitStreamLtr<'_, B>,
    param_bit_width: u32,
    buf: &mut [i32],
) -> Result<()> {
    // Read the encoding parameter, generally the Rice parameter.
    let rice_param = bs.read_bits_leq32(param_bit_width)?;

    // An all-ones parameter (e.g., 0xf for a 4-bit parameter) is the escape marker: the
    // residuals in this partition are binary encoded at a fixed width rather than Rice encoded.
    if rice_param < (1 << param_bit_width) - 1 {
        for sample in buf.iter_mut() {
            *sample = bs.read_rice_signed(rice_param)?;
        }
    }
    else {
        let residual_bits = bs.read_bits_leq32(5)?;

        for sample in buf.iter_mut() {
            *sample = bs.read_bits_leq32_signed(residual_bits)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use resona_core::io::{BitStreamLtr, BitWriter, BufReader};

    use super::read_subframe;
    use crate::encoder::tests::write_test_subframe;

    // Subframe encoding is exercised end-to-end by the encoder and the round-trip suite. The
    // tests here cover the decode paths against hand-assembled bitstreams.

    #[test]
    fn verify_decode_constant() {
        let mut bw = BitWriter::new();

        // Pad bit, type 0b000000, no wasted bits, then one 16-bit constant.
        bw.write_raw_uint32(0, 1);
        bw.write_raw_uint32(0, 6);
        bw.write_raw_uint32(0, 1);
        bw.write_raw_int32(-123, 16);
        bw.zero_pad_to_byte_boundary();

        let bytes = bw.as_slice().to_vec();
        let mut reader = BufReader::new(&bytes);
        let mut bs = BitStreamLtr::new(&mut reader);

        let mut buf = [0i32; 16];
        read_subframe(&mut bs, 16, &mut buf).unwrap();

        assert!(buf.iter().all(|&s| s == -123));
    }

    #[test]
    fn verify_decode_verbatim_with_wasted_bits() {
        let mut bw = BitWriter::new();

        let samples = [4i32, -8, 12, 0];

        // Pad bit, type 0b000001, wasted bits flag + unary count of 2 (coded as 1 + unary(1)).
        bw.write_raw_uint32(0, 1);
        bw.write_raw_uint32(1, 6);
        bw.write_raw_uint32(1, 1);
        bw.write_unary(1);

        // Samples are coded at 8 - 2 bits, right-shifted by the wasted bit count.
        for &s in &samples {
            bw.write_raw_int32(s >> 2, 6);
        }
        bw.zero_pad_to_byte_boundary();

        let bytes = bw.as_slice().to_vec();
        let mut reader = BufReader::new(&bytes);
        let mut bs = BitStreamLtr::new(&mut reader);

        let mut buf = [0i32; 4];
        read_subframe(&mut bs, 8, &mut buf).unwrap();

        assert_eq!(buf, samples);
    }

    #[test]
    fn verify_decode_reserved_type() {
        let mut bw = BitWriter::new();

        // Type 0b000010 is reserved.
        bw.write_raw_uint32(0, 1);
        bw.write_raw_uint32(2, 6);
        bw.write_raw_uint32(0, 1);
        bw.zero_pad_to_byte_boundary();

        let bytes = bw.as_slice().to_vec();
        let mut reader = BufReader::new(&bytes);
        let mut bs = BitStreamLtr::new(&mut reader);

        let mut buf = [0i32; 4];
        assert!(read_subframe(&mut bs, 8, &mut buf).is_err());
    }

    #[test]
    fn verify_decode_fixed_roundtrip() {
        // A ramp is perfectly predicted by the order-1 fixed predictor.
        let samples: Vec<i32> = (0..64).collect();

        let bytes = write_test_subframe(&samples, 16);

        let mut reader = BufReader::new(&bytes);
        let mut bs = BitStreamLtr::new(&mut reader);

        let mut buf = vec![0i32; samples.len()];
        read_subframe(&mut bs, 16, &mut buf).unwrap();

        assert_eq!(buf, samples);
    }
}
