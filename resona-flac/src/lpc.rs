// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quantized linear predictive coding: autocorrelation, coefficient computation, quantization,
//! and the residual/restoration kernels.

/// The maximum order of the linear predictor.
pub const MAX_LPC_ORDER: usize = 32;

/// The minimum quantized coefficient precision in bits.
pub const MIN_QLP_COEFF_PRECISION: u32 = 5;

/// The maximum quantized coefficient precision in bits.
pub const MAX_QLP_COEFF_PRECISION: u32 = 15;

/// The maximum quantization shift. The shift is coded as a 5-bit signed value, and negative
/// shifts are never produced.
pub const MAX_QLP_SHIFT: i32 = 15;

/// Compute the autocorrelation of `signal` for lags `0..=max_lag`, into `autoc`.
pub fn compute_autocorrelation(signal: &[f64], max_lag: usize, autoc: &mut [f64]) {
    debug_assert!(max_lag < signal.len());
    debug_assert!(autoc.len() > max_lag);

    for (lag, coeff) in autoc.iter_mut().enumerate().take(max_lag + 1) {
        let mut acc = 0.0;

        for i in lag..signal.len() {
            acc += signal[i] * signal[i - lag];
        }

        *coeff = acc;
    }
}

/// Compute the linear predictor coefficients for every order from 1 to `max_order` using the
/// Levinson-Durbin recursion.
///
/// `lp_coeff[o - 1][0..o]` receives the coefficients for order `o`, where the predicted sample
/// is the dot product of coefficients `0..o` with the `o` preceding samples, most recent first.
/// `error[o - 1]` receives the expected prediction error for order `o`.
pub fn compute_lp_coefficients(
    autoc: &[f64],
    max_order: usize,
    lp_coeff: &mut [[f64; MAX_LPC_ORDER]],
    error: &mut [f64],
) {
    debug_assert!(max_order > 0 && max_order <= MAX_LPC_ORDER);
    debug_assert!(autoc.len() > max_order);
    debug_assert!(autoc[0] != 0.0);

    let mut err = autoc[0];
    let mut lpc = [0f64; MAX_LPC_ORDER];

    for i in 0..max_order {
        // Compute the reflection coefficient for this order.
        let mut r = -autoc[i + 1];

        for j in 0..i {
            r -= lpc[j] * autoc[i - j];
        }

        r /= err;

        // Update the coefficients from the previous order.
        lpc[i] = r;

        for j in 0..(i >> 1) {
            let tmp = lpc[j];
            lpc[j] += r * lpc[i - 1 - j];
            lpc[i - 1 - j] += r * tmp;
        }

        if i & 1 != 0 {
            lpc[i >> 1] += lpc[i >> 1] * r;
        }

        err *= 1.0 - r * r;

        error[i] = err;

        // The recursion produces coefficients for a whitening filter; negate them so the
        // predictor is a weighted sum of past samples.
        for j in 0..=i {
            lp_coeff[i][j] = -lpc[j];
        }
    }
}

/// The expected number of bits per residual sample for a predictor with the given error over the
/// given number of samples.
pub fn compute_expected_bits_per_residual_sample(lpc_error: f64, total_samples: usize) -> f64 {
    debug_assert!(total_samples > 0);

    if lpc_error > 0.0 {
        let error_scale = 0.5 * std::f64::consts::LN_2 * std::f64::consts::LN_2
            / total_samples as f64;

        (0.5 * (error_scale * lpc_error).log2()).max(0.0)
    }
    else {
        0.0
    }
}

/// Estimate the order that minimizes the total subframe size: the expected residual bits plus
/// the per-order overhead of coding one extra warm-up sample.
pub fn compute_best_order(
    lpc_error: &[f64],
    max_order: usize,
    total_samples: usize,
    bits_per_signal_sample: u32,
) -> usize {
    debug_assert!(max_order > 0 && max_order <= lpc_error.len());

    let mut best_order = 0;
    let mut best_bits = f64::MAX;

    for i in 0..max_order {
        let header_bits = ((i + 1) * bits_per_signal_sample as usize) as f64;

        let bits = compute_expected_bits_per_residual_sample(lpc_error[i], total_samples)
            * (total_samples - (i + 1)) as f64
            + header_bits;

        if bits < best_bits {
            best_bits = bits;
            best_order = i;
        }
    }

    best_order + 1
}

/// Quantize predictor coefficients to `precision` bits with a common power-of-two scale.
///
/// Returns the shift count, or `None` if the coefficients cannot be represented at this
/// precision with a non-negative shift, which signals the caller to reject the order.
pub fn quantize_coefficients(
    lp_coeff: &[f64],
    precision: u32,
    qlp_coeff: &mut [i32],
) -> Option<i32> {
    debug_assert!(precision >= MIN_QLP_COEFF_PRECISION && precision <= MAX_QLP_COEFF_PRECISION);
    debug_assert!(qlp_coeff.len() >= lp_coeff.len());

    let cmax = lp_coeff.iter().fold(0f64, |cmax, c| cmax.max(c.abs()));

    // A zero (or denormal) coefficient vector cannot be scaled.
    if cmax <= 0.0 || !cmax.is_finite() {
        return None;
    }

    let log2cmax = cmax.log2().floor() as i32;

    let mut shift = precision as i32 - log2cmax - 2;

    if shift > MAX_QLP_SHIFT {
        shift = MAX_QLP_SHIFT;
    }
    else if shift < 0 {
        // The coefficients are too large for this precision.
        return None;
    }

    let qmax = (1i64 << (precision - 1)) - 1;
    let qmin = -(1i64 << (precision - 1));

    let scale = f64::from(1u32 << shift as u32);

    // Round with error feedback so quantization error does not accumulate across the filter.
    let mut error = 0.0;

    for (q, c) in qlp_coeff.iter_mut().zip(lp_coeff) {
        error += c * scale;

        let mut v = error.round() as i64;

        if v > qmax {
            v = qmax;
        }
        else if v < qmin {
            v = qmin;
        }

        error -= v as f64;

        *q = v as i32;
    }

    Some(shift)
}

/// Compute the prediction residual. `signal` holds the whole subframe; the first
/// `qlp_coeff.len()` samples are warm-up, and `residual` receives
/// `signal.len() - qlp_coeff.len()` entries.
pub fn compute_residual(signal: &[i32], qlp_coeff: &[i32], shift: u32, residual: &mut [i32]) {
    let order = qlp_coeff.len();

    debug_assert!(order > 0 && order <= MAX_LPC_ORDER);
    debug_assert!(residual.len() == signal.len() - order);

    for (r, i) in residual.iter_mut().zip(order..signal.len()) {
        let mut predicted = 0i64;

        for (j, &c) in qlp_coeff.iter().enumerate() {
            predicted += i64::from(c) * i64::from(signal[i - 1 - j]);
        }

        *r = (i64::from(signal[i]) - (predicted >> shift)) as i32;
    }
}

/// Compute the prediction residual with 32-bit accumulators. Valid when the samples fit in 16
/// bits (17 for a difference channel) and the coefficient precision is at most 16 bits, where
/// the products and running sum cannot meaningfully exceed 32 bits.
pub fn compute_residual_16bit(signal: &[i32], qlp_coeff: &[i32], shift: u32, residual: &mut [i32]) {
    let order = qlp_coeff.len();

    debug_assert!(order > 0 && order <= MAX_LPC_ORDER);
    debug_assert!(residual.len() == signal.len() - order);

    for (r, i) in residual.iter_mut().zip(order..signal.len()) {
        let mut predicted = 0i32;

        for (j, &c) in qlp_coeff.iter().enumerate() {
            predicted = predicted.wrapping_add(c.wrapping_mul(signal[i - 1 - j]));
        }

        *r = signal[i].wrapping_sub(predicted.wrapping_shr(shift));
    }
}

/// Restore a signal from its prediction residual, in place. On entry `buf` holds
/// `qlp_coeff.len()` warm-up samples followed by the residual; on exit it holds the restored
/// signal. The shift direction and rounding are the exact dual of [`compute_residual`].
pub fn restore_signal(qlp_coeff: &[i32], shift: u32, buf: &mut [i32]) {
    let order = qlp_coeff.len();

    debug_assert!(order > 0 && order <= MAX_LPC_ORDER);
    debug_assert!(order <= buf.len());

    for i in order..buf.len() {
        let mut predicted = 0i64;

        for (j, &c) in qlp_coeff.iter().enumerate() {
            predicted += i64::from(c) * i64::from(buf[i - 1 - j]);
        }

        buf[i] = buf[i].wrapping_add((predicted >> shift) as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A deterministic pseudo-random sample generator.
    fn noise(len: usize, scale: i32) -> Vec<i32> {
        let mut state = 0x2f6b_7c15u32;

        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                ((state >> 8) as i32 % scale) - scale / 2
            })
            .collect()
    }

    #[test]
    fn verify_autocorrelation() {
        let signal = [1.0, 2.0, 3.0, 4.0];
        let mut autoc = [0f64; 3];

        compute_autocorrelation(&signal, 2, &mut autoc);

        assert_eq!(autoc[0], 1.0 + 4.0 + 9.0 + 16.0);
        assert_eq!(autoc[1], 2.0 + 6.0 + 12.0);
        assert_eq!(autoc[2], 3.0 + 8.0);
    }

    #[test]
    fn verify_levinson_durbin_error_decreases() {
        // A strongly correlated signal: prediction error must not increase with order, and must
        // be far below the zeroth-order energy.
        let signal: Vec<f64> =
            (0..1024).map(|i| (i as f64 * 0.01).sin() * 1000.0 + (i as f64 * 0.1).cos()).collect();

        let max_order = 8;

        let mut autoc = [0f64; MAX_LPC_ORDER + 1];
        compute_autocorrelation(&signal, max_order, &mut autoc);

        let mut lp_coeff = [[0f64; MAX_LPC_ORDER]; MAX_LPC_ORDER];
        let mut error = [0f64; MAX_LPC_ORDER];

        compute_lp_coefficients(&autoc, max_order, &mut lp_coeff, &mut error);

        for o in 1..max_order {
            assert!(error[o] <= error[o - 1] * 1.000001, "error grew at order {}", o + 1);
        }

        assert!(error[max_order - 1] < autoc[0] / 100.0);
    }

    #[test]
    fn verify_quantization_bound() {
        // |q_k| < 2^(p-1) must hold for any coefficient vector a finite signal produces.
        let signal: Vec<f64> = (0..512)
            .map(|i| (i as f64 * 0.037).sin() * 12_000.0 + (i as f64 * 0.31).sin() * 300.0)
            .collect();

        let max_order = 12;

        let mut autoc = [0f64; MAX_LPC_ORDER + 1];
        compute_autocorrelation(&signal, max_order, &mut autoc);

        let mut lp_coeff = [[0f64; MAX_LPC_ORDER]; MAX_LPC_ORDER];
        let mut error = [0f64; MAX_LPC_ORDER];

        compute_lp_coefficients(&autoc, max_order, &mut lp_coeff, &mut error);

        for order in 1..=max_order {
            for precision in MIN_QLP_COEFF_PRECISION..=MAX_QLP_COEFF_PRECISION {
                let mut qlp = [0i32; MAX_LPC_ORDER];

                if let Some(shift) =
                    quantize_coefficients(&lp_coeff[order - 1][..order], precision, &mut qlp)
                {
                    assert!(shift >= 0 && shift <= MAX_QLP_SHIFT);

                    let limit = 1 << (precision - 1);
                    for &q in &qlp[..order] {
                        assert!(q.abs() <= limit, "coefficient out of range");
                    }
                }
            }
        }
    }

    #[test]
    fn verify_residual_restore_duality() {
        let signal = noise(512, 30_000);

        // An arbitrary quantized predictor; duality must hold regardless of how well it models
        // the signal.
        let qlp_coeff = [832, -415, 121, -33];
        let shift = 9;

        let mut residual = vec![0i32; signal.len() - qlp_coeff.len()];
        compute_residual(&signal, &qlp_coeff, shift, &mut residual);

        let mut restored = signal[..qlp_coeff.len()].to_vec();
        restored.extend_from_slice(&residual);

        restore_signal(&qlp_coeff, shift, &mut restored);

        assert_eq!(restored, signal);
    }

    #[test]
    fn verify_residual_16bit_matches_wide() {
        let signal = noise(512, 60_000);

        let qlp_coeff = [1024, -768, 301, -55, 12];
        let shift = 10;

        let mut wide = vec![0i32; signal.len() - qlp_coeff.len()];
        let mut narrow = vec![0i32; signal.len() - qlp_coeff.len()];

        compute_residual(&signal, &qlp_coeff, shift, &mut wide);
        compute_residual_16bit(&signal, &qlp_coeff, shift, &mut narrow);

        assert_eq!(wide, narrow);
    }
}
