// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed polynomial predictors of orders 0 through 4.

use std::num::Wrapping;

/// The maximum order of a fixed predictor.
pub const MAX_FIXED_ORDER: usize = 4;

/// Estimate the best fixed predictor order for a block of samples.
///
/// For each order k, the sum of absolute k-th finite differences over the block (excluding the
/// first [`MAX_FIXED_ORDER`] samples, so every order is scored over the same region) estimates
/// the size of that order's residual. Returns the order with the smallest sum, and the expected
/// bits per residual sample for every order.
pub fn compute_best_predictor(signal: &[i32]) -> (u32, [f64; MAX_FIXED_ORDER + 1]) {
    debug_assert!(signal.len() > MAX_FIXED_ORDER);

    let mut total_error = [0u64; MAX_FIXED_ORDER + 1];

    for i in MAX_FIXED_ORDER..signal.len() {
        let s0 = i64::from(signal[i]);
        let s1 = i64::from(signal[i - 1]);
        let s2 = i64::from(signal[i - 2]);
        let s3 = i64::from(signal[i - 3]);
        let s4 = i64::from(signal[i - 4]);

        total_error[0] += s0.unsigned_abs();
        total_error[1] += (s0 - s1).unsigned_abs();
        total_error[2] += (s0 - 2 * s1 + s2).unsigned_abs();
        total_error[3] += (s0 - 3 * s1 + 3 * s2 - s3).unsigned_abs();
        total_error[4] += (s0 - 4 * s1 + 6 * s2 - 4 * s3 + s4).unsigned_abs();
    }

    let mut order = 0;

    for (k, &error) in total_error.iter().enumerate() {
        if error < total_error[order] {
            order = k;
        }
    }

    let n = (signal.len() - MAX_FIXED_ORDER) as f64;

    let mut residual_bits_per_sample = [0f64; MAX_FIXED_ORDER + 1];

    for (bits, &error) in residual_bits_per_sample.iter_mut().zip(&total_error) {
        // An estimate of the Rice code length for a Laplacian residual with this mean.
        *bits = if error > 0 {
            (std::f64::consts::LN_2 * error as f64 / n).log2()
        }
        else {
            0.0
        };
    }

    (order as u32, residual_bits_per_sample)
}

/// Compute the fixed predictor residual of the given order. `residual` must hold
/// `signal.len() - order` samples.
pub fn compute_residual(signal: &[i32], order: u32, residual: &mut [i32]) {
    let order = order as usize;

    debug_assert!(order <= MAX_FIXED_ORDER);
    debug_assert!(residual.len() == signal.len() - order);

    for (r, i) in residual.iter_mut().zip(order..signal.len()) {
        let s0 = i64::from(signal[i]);

        let predicted = match order {
            0 => 0,
            1 => i64::from(signal[i - 1]),
            2 => 2 * i64::from(signal[i - 1]) - i64::from(signal[i - 2]),
            3 => {
                3 * i64::from(signal[i - 1]) - 3 * i64::from(signal[i - 2])
                    + i64::from(signal[i - 3])
            }
            _ => {
                4 * i64::from(signal[i - 1]) - 6 * i64::from(signal[i - 2])
                    + 4 * i64::from(signal[i - 3])
                    - i64::from(signal[i - 4])
            }
        };

        *r = (s0 - predicted) as i32;
    }
}

/// Restore a signal from its fixed predictor residual, in place. On entry `buf` holds `order`
/// warm-up samples followed by the residual; on exit it holds the restored signal.
pub fn restore_signal(order: u32, buf: &mut [i32]) {
    debug_assert!(order as usize <= MAX_FIXED_ORDER);

    // The fixed predictor is a hard-coded linear predictor with binomial coefficients. Orders 0
    // and 1 simplify; orders 2 through 4 use the same IIR-style loop as the general predictor.
    match order {
        // A 0th order predictor always predicts 0, and therefore adds nothing to any of the
        // samples in buf.
        0 => (),
        // A 1st order predictor always returns the previous sample: s(i) = 1*s(i-1).
        1 => {
            for i in 1..buf.len() {
                buf[i] = buf[i].wrapping_add(buf[i - 1]);
            }
        }
        // A 2nd order predictor uses the polynomial: s(i) = 2*s(i-1) - 1*s(i-2).
        2 => {
            for i in 2..buf.len() {
                let a = Wrapping(2) * Wrapping(i64::from(buf[i - 1]));
                let b = Wrapping(-1) * Wrapping(i64::from(buf[i - 2]));
                buf[i] = buf[i].wrapping_add((a + b).0 as i32);
            }
        }
        // A 3rd order predictor uses the polynomial: s(i) = 3*s(i-1) - 3*s(i-2) + 1*s(i-3).
        3 => {
            for i in 3..buf.len() {
                let a = Wrapping(3) * Wrapping(i64::from(buf[i - 1]));
                let b = Wrapping(-3) * Wrapping(i64::from(buf[i - 2]));
                let c = Wrapping(1) * Wrapping(i64::from(buf[i - 3]));
                buf[i] = buf[i].wrapping_add((a + b + c).0 as i32);
            }
        }
        // A 4th order predictor uses the polynomial:
        // s(i) = 4*s(i-1) - 6*s(i-2) + 4*s(i-3) - 1*s(i-4).
        _ => {
            for i in 4..buf.len() {
                let a = Wrapping(4) * Wrapping(i64::from(buf[i - 1]));
                let b = Wrapping(-6) * Wrapping(i64::from(buf[i - 2]));
                let c = Wrapping(4) * Wrapping(i64::from(buf[i - 3]));
                let d = Wrapping(-1) * Wrapping(i64::from(buf[i - 4]));
                buf[i] = buf[i].wrapping_add((a + b + c + d).0 as i32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_residual_restore_duality() {
        let signal: Vec<i32> =
            (0..256).map(|i| ((i * 7919) % 4001) - 2000 + ((i % 13) * 37)).collect();

        for order in 0..=MAX_FIXED_ORDER as u32 {
            let mut residual = vec![0i32; signal.len() - order as usize];
            compute_residual(&signal, order, &mut residual);

            let mut restored = signal[..order as usize].to_vec();
            restored.extend_from_slice(&residual);

            restore_signal(order, &mut restored);

            assert_eq!(restored, signal, "order {}", order);
        }
    }

    #[test]
    fn verify_best_predictor_on_ramp() {
        // A linear ramp has a zero 2nd difference, so order 2 (or higher, but 2 is reached
        // first with a zero total) must win.
        let signal: Vec<i32> = (0..512).map(|i| 3 * i + 11).collect();

        let (order, bits) = compute_best_predictor(&signal);

        assert_eq!(order, 2);
        assert_eq!(bits[2], 0.0);
        assert!(bits[1] > 0.0);
    }

    #[test]
    fn verify_best_predictor_on_constant() {
        let signal = vec![42i32; 128];

        let (order, bits) = compute_best_predictor(&signal);

        // The 1st difference of a constant signal is all zeros.
        assert_eq!(order, 1);
        assert_eq!(bits[1], 0.0);
    }
}
