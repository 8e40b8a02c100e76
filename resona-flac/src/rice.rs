// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The encoding side of the partitioned Rice entropy coder: partition order and parameter
//! search, and residual emission.

use resona_core::io::BitWriter;
use resona_core::util::bits::silog2_i64;

/// The width of the residual coding method field.
pub const METHOD_WIDTH: u32 = 2;

/// The width of the partition order field.
pub const PARTITION_ORDER_WIDTH: u32 = 4;

/// The width of a Rice parameter.
pub const PARAM_WIDTH: u32 = 4;

/// The all-ones parameter value marking an escaped (raw binary) partition.
pub const ESCAPE_PARAM: u32 = (1 << PARAM_WIDTH) - 1;

/// The width of the raw bit-width field of an escaped partition.
pub const RAW_WIDTH_LEN: u32 = 5;

/// The result of a partition order search: one Rice parameter (or escape width) per partition,
/// and the exact number of bits the coded residual will occupy.
#[derive(Clone, Debug, Default)]
pub struct RicePlan {
    pub partition_order: u32,
    /// Per-partition Rice parameters. [`ESCAPE_PARAM`] marks an escaped partition.
    pub parameters: Vec<u32>,
    /// Per-partition raw sample widths, meaningful where the parameter is the escape marker.
    pub raw_bits: Vec<u32>,
    /// The total coded size, method and partition order fields included.
    pub bits: u64,
}

/// Fold a signed residual into the unsigned Rice symbol: `2v` for non-negative values, and
/// `-2v - 1` for negative values.
#[inline(always)]
fn fold(r: i32) -> u32 {
    ((r << 1) ^ (r >> 31)) as u32
}

/// The exact length in bits of the Rice code of `symbol` with parameter `param`.
#[inline(always)]
fn rice_len(symbol: u32, param: u32) -> u64 {
    u64::from(1 + param) + u64::from(symbol >> param)
}

/// The largest usable partition order for a block: bounded by the requested maximum, by the
/// power-of-two divisibility of the blocksize, and by the requirement that the first partition
/// still holds at least one sample after the warm-up samples are excluded.
pub fn max_partition_order_for(blocksize: u32, predictor_order: u32, max_order: u32) -> u32 {
    let mut order = max_order.min(blocksize.trailing_zeros());

    while order > 0 && (blocksize >> order) <= predictor_order {
        order -= 1;
    }

    order
}

/// Search partition orders from `max_order` down to `min_order` for the cheapest partitioned
/// Rice coding of `residual`, estimating each partition's parameter from its mean absolute
/// residual and optionally sweeping `search_dist` parameters around the estimate. Partitions for
/// which a raw binary coding is at least as cheap are escaped.
///
/// The sum of the residual length and `predictor_order` must equal the blocksize, which in turn
/// must be divisible by `2^max_order`.
pub fn find_best_partition_order(
    residual: &[i32],
    predictor_order: u32,
    min_order: u32,
    max_order: u32,
    search_dist: u32,
) -> RicePlan {
    let blocksize = residual.len() as u32 + predictor_order;

    let max_order = max_partition_order_for(blocksize, predictor_order, max_order);
    let min_order = min_order.min(max_order);

    let symbols: Vec<u32> = residual.iter().map(|&r| fold(r)).collect();

    // Precompute per-partition absolute sums (in 64 bits, which cannot overflow) and raw sample
    // widths at the maximum partition order, then merge pairwise for each lower order.
    let n_max_partitions = 1usize << max_order;

    let mut sums = vec![0u64; n_max_partitions];
    let mut widths = vec![0u32; n_max_partitions];

    {
        let default_partition_samples = (blocksize >> max_order) as usize;
        let mut i = 0;

        for partition in 0..n_max_partitions {
            let mut n = default_partition_samples;
            if partition == 0 {
                n -= predictor_order as usize;
            }

            let mut sum = 0u64;
            let mut width = 0u32;

            for &r in &residual[i..i + n] {
                sum += u64::from(r.unsigned_abs());
                width = width.max(silog2_i64(i64::from(r)));
            }

            sums[partition] = sum;
            widths[partition] = width;

            i += n;
        }
    }

    let mut best: Option<RicePlan> = None;

    for order in (min_order..=max_order).rev() {
        let plan = plan_for_order(&symbols, &sums, &widths, predictor_order, order, search_dist);

        // On a tie the plan found first, at the higher partition order, is kept.
        if best.as_ref().map_or(true, |b| plan.bits < b.bits) {
            best = Some(plan);
        }

        // Merge the partition sums and widths pairwise for the next lower order.
        if order > min_order {
            let n = 1usize << (order - 1);

            for i in 0..n {
                sums[i] = sums[2 * i] + sums[2 * i + 1];
                widths[i] = widths[2 * i].max(widths[2 * i + 1]);
            }

            sums.truncate(n);
            widths.truncate(n);
        }
    }

    best.unwrap()
}

/// Choose the parameters for one partition order, given the per-partition absolute sums and raw
/// widths at that order.
fn plan_for_order(
    symbols: &[u32],
    sums: &[u64],
    widths: &[u32],
    predictor_order: u32,
    partition_order: u32,
    search_dist: u32,
) -> RicePlan {
    let blocksize = symbols.len() as u32 + predictor_order;
    let n_partitions = 1usize << partition_order;
    let default_partition_samples = (blocksize >> partition_order) as usize;

    let mut plan = RicePlan {
        partition_order,
        parameters: Vec::with_capacity(n_partitions),
        raw_bits: Vec::with_capacity(n_partitions),
        bits: u64::from(METHOD_WIDTH + PARTITION_ORDER_WIDTH),
    };

    let mut i = 0;

    for partition in 0..n_partitions {
        let mut n = default_partition_samples;
        if partition == 0 {
            n -= predictor_order as usize;
        }

        let partition_symbols = &symbols[i..i + n];

        // Estimate the Rice parameter as floor(log2(mean |r|)) + 1. The +1 accounts for the
        // doubling of the signed-to-unsigned fold.
        let mean = (sums[partition] + (n as u64 >> 1)) / n as u64;

        let mut estimate = 0;
        let mut m = mean;
        while m > 0 {
            estimate += 1;
            m >>= 1;
        }

        let estimate = estimate.min(ESCAPE_PARAM - 1);

        // Optionally sweep around the estimate.
        let (param_lo, param_hi) = if search_dist > 0 {
            (estimate.saturating_sub(search_dist), (estimate + search_dist).min(ESCAPE_PARAM - 1))
        }
        else {
            (estimate, estimate)
        };

        let mut best_param = estimate;
        let mut best_bits = u64::MAX;

        for param in param_lo..=param_hi {
            let bits = partition_symbols.iter().map(|&u| rice_len(u, param)).sum::<u64>();

            if bits < best_bits {
                best_param = param;
                best_bits = bits;
            }
        }

        // Escape to a raw binary coding when it is at least as cheap as the best Rice coding.
        let raw_width = widths[partition];
        let flat_bits = u64::from(RAW_WIDTH_LEN) + u64::from(raw_width) * n as u64;

        if flat_bits <= best_bits {
            plan.parameters.push(ESCAPE_PARAM);
            plan.raw_bits.push(raw_width);
            plan.bits += u64::from(PARAM_WIDTH) + flat_bits;
        }
        else {
            plan.parameters.push(best_param);
            plan.raw_bits.push(0);
            plan.bits += u64::from(PARAM_WIDTH) + best_bits;
        }

        i += n;
    }

    plan
}

/// Emit the residual coding of a subframe: the coding method, the partition order, and each
/// partition's parameter and samples.
pub fn write_residual(bw: &mut BitWriter, residual: &[i32], predictor_order: u32, plan: &RicePlan) {
    // Method 0: partitioned Rice with 4-bit parameters.
    bw.write_raw_uint32(0, METHOD_WIDTH);
    bw.write_raw_uint32(plan.partition_order, PARTITION_ORDER_WIDTH);

    let blocksize = residual.len() as u32 + predictor_order;
    let default_partition_samples = (blocksize >> plan.partition_order) as usize;

    let mut i = 0;

    for (partition, &param) in plan.parameters.iter().enumerate() {
        let mut n = default_partition_samples;
        if partition == 0 {
            n -= predictor_order as usize;
        }

        bw.write_raw_uint32(param, PARAM_WIDTH);

        if param == ESCAPE_PARAM {
            let width = plan.raw_bits[partition];

            bw.write_raw_uint32(width, RAW_WIDTH_LEN);

            for &r in &residual[i..i + n] {
                bw.write_raw_int32(r, width);
            }
        }
        else {
            for &r in &residual[i..i + n] {
                bw.write_rice_signed(r, param);
            }
        }

        i += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resona_core::io::{BitStreamLtr, BufReader};

    use crate::subframe::decode_residual;

    /// A deterministic pseudo-random residual generator with roughly Laplacian magnitudes.
    fn residuals(len: usize, scale: u32) -> Vec<i32> {
        let mut state = 0x9e37_79b9u32;

        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                let magnitude = (state % scale) as i32;
                if state & 0x8000_0000 != 0 {
                    -(magnitude * magnitude / scale as i32)
                }
                else {
                    magnitude * magnitude / scale as i32
                }
            })
            .collect()
    }

    fn roundtrip(residual: &[i32], predictor_order: u32, plan: &RicePlan) {
        let mut bw = BitWriter::new();

        write_residual(&mut bw, residual, predictor_order, plan);

        // The plan's bit accounting must be exact.
        assert_eq!(bw.bit_count(), plan.bits);

        bw.zero_pad_to_byte_boundary();

        let bytes = bw.as_slice().to_vec();
        let mut reader = BufReader::new(&bytes);
        let mut bs = BitStreamLtr::new(&mut reader);

        // decode_residual expects the whole block with the warm-up prelude skipped.
        let blocksize = residual.len() + predictor_order as usize;
        let mut buf = vec![0i32; blocksize];

        decode_residual(&mut bs, predictor_order, &mut buf).unwrap();

        assert_eq!(&buf[predictor_order as usize..], residual);
    }

    #[test]
    fn verify_partitioned_rice_roundtrip() {
        let residual = residuals(4096 - 2, 200);

        let plan = find_best_partition_order(&residual, 2, 0, 6, 0);

        assert!(plan.partition_order <= 6);
        assert_eq!(plan.parameters.len(), 1 << plan.partition_order);

        roundtrip(&residual, 2, &plan);
    }

    #[test]
    fn verify_partition_order_zero() {
        let residual = residuals(1000 - 8, 50);

        let plan = find_best_partition_order(&residual, 8, 0, 0, 2);

        assert_eq!(plan.partition_order, 0);
        assert_eq!(plan.parameters.len(), 1);

        roundtrip(&residual, 8, &plan);
    }

    #[test]
    fn verify_escape_partition() {
        // A residual with one partition of wild values and the rest silent. The wild partition
        // must escape to raw coding, the silent ones to Rice parameter 0 or a 0-width escape.
        let mut residual = vec![0i32; 1024];

        for (i, r) in residual[512..768].iter_mut().enumerate() {
            *r = if i % 2 == 0 { 1 << 20 } else { -(1 << 20) };
        }

        let plan = find_best_partition_order(&residual, 0, 2, 2, 0);

        assert_eq!(plan.partition_order, 2);
        assert!(plan.parameters.contains(&ESCAPE_PARAM));

        roundtrip(&residual, 0, &plan);
    }

    #[test]
    fn verify_partition_order_clamping() {
        // blocksize 1000 = 8 * 125: at most 3 halvings are possible.
        assert_eq!(max_partition_order_for(1000, 0, 6), 3);
        // The first partition must be longer than the predictor order.
        assert_eq!(max_partition_order_for(4096, 12, 15), 8);
        assert_eq!(max_partition_order_for(192, 4, 6), 5);
    }

    #[test]
    fn verify_greedy_estimate_near_exhaustive() {
        // The greedy parameter estimator must land within a few percent of the best parameter
        // found by sweeping the entire parameter range.
        let residual = residuals(4096, 3000);

        let greedy = find_best_partition_order(&residual, 0, 0, 6, 0);
        let swept = find_best_partition_order(&residual, 0, 0, 6, ESCAPE_PARAM - 1);

        assert!(swept.bits <= greedy.bits);
        assert!((greedy.bits as f64) < (swept.bits as f64) * 1.05);
    }
}
