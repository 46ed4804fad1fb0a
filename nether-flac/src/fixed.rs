//! Fixed polynomial predictors of order 0 to 4
//!
//! Order `k` predicts each sample from the `k` before it with the binomial
//! coefficients of the k-th finite difference, so the residual of order 2 is
//! `x[i] - 2 x[i-1] + x[i-2]`. The first `order` samples of a block are warm-up and
//! carry no residual.

use std::f64::consts::LN_2;

use crate::MAX_FIXED_ORDER;
use crate::error::FlacError;

/// Row `k` holds the signed binomial coefficients applied to `x[i]`, `x[i-1]`, ...
const DIFFERENCE: [[i64; MAX_FIXED_ORDER + 1]; MAX_FIXED_ORDER + 1] = [
    [1, 0, 0, 0, 0],
    [1, -1, 0, 0, 0],
    [1, -2, 1, 0, 0],
    [1, -3, 3, -1, 0],
    [1, -4, 6, -4, 1],
];

/// Predictor choice for a block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedEstimate {
    /// Order with the smallest total absolute residual
    pub order: usize,
    /// Expected residual bits per sample for each order
    pub residual_bits: [f32; MAX_FIXED_ORDER + 1],
}

/// `k`-th difference at `i`, exact in 64 bits
#[inline]
fn difference_wide<T: Copy + Into<i64>>(data: &[T], i: usize, order: usize) -> i64 {
    (0..=order)
        .map(|j| DIFFERENCE[order][j] * Into::<i64>::into(data[i - j]))
        .sum()
}

#[inline]
fn difference(data: &[i32], i: usize, order: usize) -> i32 {
    (0..=order).fold(0i32, |sum, j| {
        sum.wrapping_add((DIFFERENCE[order][j] as i32).wrapping_mul(data[i - j]))
    })
}

fn estimate(totals: [u64; MAX_FIXED_ORDER + 1], samples: usize) -> FixedEstimate {
    // Strict comparison keeps the lower order on ties
    let mut order = 0;
    for k in 1..=MAX_FIXED_ORDER {
        if totals[k] < totals[order] {
            order = k;
        }
    }
    let residual_bits = totals.map(|total| {
        if total > 0 && samples > 0 {
            (LN_2 * total as f64 / samples as f64).log2() as f32
        } else {
            0.0
        }
    });
    FixedEstimate {
        order,
        residual_bits,
    }
}

/// Pick the fixed order for `data` with 32-bit error totals
///
/// Residuals and totals wrap, so this is only meaningful for blocks whose
/// differences and sums fit 32 bits; [`best_fixed_predictor_wide`] covers the rest.
pub fn best_fixed_predictor(data: &[i32]) -> FixedEstimate {
    let mut totals = [0u32; MAX_FIXED_ORDER + 1];
    for i in MAX_FIXED_ORDER..data.len() {
        for (k, total) in totals.iter_mut().enumerate() {
            *total = total.wrapping_add(difference(data, i, k).unsigned_abs());
        }
    }
    estimate(
        totals.map(u64::from),
        data.len().saturating_sub(MAX_FIXED_ORDER),
    )
}

/// Pick the fixed order for `data` with 64-bit error totals
pub fn best_fixed_predictor_wide(data: &[i32]) -> FixedEstimate {
    let mut totals = [0u64; MAX_FIXED_ORDER + 1];
    for i in MAX_FIXED_ORDER..data.len() {
        for (k, total) in totals.iter_mut().enumerate() {
            *total += difference_wide(data, i, k).unsigned_abs();
        }
    }
    estimate(totals, data.len().saturating_sub(MAX_FIXED_ORDER))
}

fn best_limited<T: Copy + Into<i64>>(data: &[T]) -> FixedEstimate {
    let mut totals = [0u64; MAX_FIXED_ORDER + 1];
    for i in MAX_FIXED_ORDER..data.len() {
        for (k, total) in totals.iter_mut().enumerate() {
            if *total == u64::MAX {
                continue;
            }
            let e = difference_wide(data, i, k);
            *total = if i32::try_from(e).is_ok() {
                total.saturating_add(e.unsigned_abs())
            } else {
                u64::MAX
            };
        }
    }
    estimate(totals, data.len().saturating_sub(MAX_FIXED_ORDER))
}

/// Like [`best_fixed_predictor_wide`], but orders producing a residual outside the
/// 32-bit range are never chosen
pub fn best_fixed_predictor_limit_residual(data: &[i32]) -> FixedEstimate {
    best_limited(data)
}

/// [`best_fixed_predictor_limit_residual`] for 33-bit side-channel samples
pub fn best_fixed_predictor_limit_residual_33bit(data: &[i64]) -> FixedEstimate {
    best_limited(data)
}

fn check(order: usize, data_len: usize, residual_len: usize) -> Result<(), FlacError> {
    if order > MAX_FIXED_ORDER {
        return Err(FlacError::InvalidParameter("fixed predictor order"));
    }
    if data_len < order || data_len - order != residual_len {
        return Err(FlacError::InvalidParameter("residual length"));
    }
    Ok(())
}

/// Residual of `data` (warm-up included) for `order`, with wrapping 32-bit math
pub fn compute_residual(data: &[i32], order: usize, residual: &mut [i32]) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, r) in residual.iter_mut().enumerate() {
        *r = difference(data, i + order, order);
    }
    Ok(())
}

/// Residual computed in 64 bits and truncated to 32
pub fn compute_residual_wide(
    data: &[i32],
    order: usize,
    residual: &mut [i32],
) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, r) in residual.iter_mut().enumerate() {
        *r = difference_wide(data, i + order, order) as i32;
    }
    Ok(())
}

/// Residual of 33-bit samples; the caller has checked it fits 32 bits
pub fn compute_residual_wide_33bit(
    data: &[i64],
    order: usize,
    residual: &mut [i32],
) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, r) in residual.iter_mut().enumerate() {
        *r = difference_wide(data, i + order, order) as i32;
    }
    Ok(())
}

/// Prediction for `data[i]` from the samples before it
#[inline]
fn prediction_wide<T: Copy + Into<i64>>(data: &[T], i: usize, order: usize) -> i64 {
    (1..=order)
        .map(|j| -DIFFERENCE[order][j] * Into::<i64>::into(data[i - j]))
        .sum()
}

/// Rebuild `data` from its warm-up (`data[..order]`) and `residual`
pub fn restore_signal(residual: &[i32], order: usize, data: &mut [i32]) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, &r) in residual.iter().enumerate() {
        let at = i + order;
        let predicted = (1..=order).fold(0i32, |sum, j| {
            sum.wrapping_sub((DIFFERENCE[order][j] as i32).wrapping_mul(data[at - j]))
        });
        data[at] = r.wrapping_add(predicted);
    }
    Ok(())
}

/// [`restore_signal`] with 64-bit prediction
pub fn restore_signal_wide(
    residual: &[i32],
    order: usize,
    data: &mut [i32],
) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, &r) in residual.iter().enumerate() {
        let at = i + order;
        data[at] = (r as i64 + prediction_wide(data, at, order)) as i32;
    }
    Ok(())
}

/// [`restore_signal`] producing 33-bit samples
pub fn restore_signal_wide_33bit(
    residual: &[i32],
    order: usize,
    data: &mut [i64],
) -> Result<(), FlacError> {
    check(order, data.len(), residual.len())?;
    for (i, &r) in residual.iter().enumerate() {
        let at = i + order;
        data[at] = r as i64 + prediction_wide(data, at, order);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy(rng: &mut StdRng, len: usize, range: i32) -> Vec<i32> {
        let mut level = 0i32;
        (0..len)
            .map(|_| {
                level = (level + rng.random_range(-range..=range)).clamp(-(1 << 23), 1 << 23);
                level
            })
            .collect()
    }

    #[test]
    fn test_best_order_for_polynomials() {
        let constant = vec![5; 32];
        assert_eq!(best_fixed_predictor(&constant).order, 1);

        let ramp: Vec<i32> = (0..32).map(|i| 3 * i - 40).collect();
        assert_eq!(best_fixed_predictor(&ramp).order, 2);

        let parabola: Vec<i32> = (0..32).map(|i| i * i - 7 * i).collect();
        let estimate = best_fixed_predictor_wide(&parabola);
        assert_eq!(estimate.order, 3);
        assert_eq!(estimate.residual_bits[3], 0.0);
        assert!(estimate.residual_bits[0] > estimate.residual_bits[1]);
    }

    #[test]
    fn test_silence_prefers_order_zero() {
        let estimate = best_fixed_predictor(&[0; 64]);
        assert_eq!(estimate.order, 0);
        assert_eq!(estimate.residual_bits, [0.0; 5]);

        // Too short for any residual
        assert_eq!(best_fixed_predictor(&[1, 2, 3]).order, 0);
    }

    #[test]
    fn test_residual_bits_estimate() {
        // Order 0 total is 8 * 100 over 8 samples
        let data = [100; 12];
        let estimate = best_fixed_predictor(&data);
        let expected = (LN_2 * 100.0).log2() as f32;
        assert!((estimate.residual_bits[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_limit_rejects_overflowing_orders() {
        let data: Vec<i32> = (0..16)
            .map(|i| if i % 2 == 0 { i32::MAX } else { i32::MIN })
            .collect();
        let estimate = best_fixed_predictor_limit_residual(&data);
        assert_eq!(estimate.order, 0);
        assert!(estimate.residual_bits[1] > estimate.residual_bits[0]);

        let wide: Vec<i64> = (0..16).map(|i| (i % 2) << 32).collect();
        assert_eq!(best_fixed_predictor_limit_residual_33bit(&wide).order, 0);
        let ramp: Vec<i64> = (0..16).map(|i| (1 << 32) + i).collect();
        assert_eq!(best_fixed_predictor_limit_residual_33bit(&ramp).order, 2);
    }

    #[test]
    fn test_residual_values() {
        let data = [1, 4, 9, 16, 25];
        let mut residual = [0; 3];
        compute_residual(&data, 2, &mut residual).unwrap();
        assert_eq!(residual, [2, 2, 2]);

        let mut short = [0; 2];
        assert!(compute_residual(&data, 2, &mut short).is_err());
        assert!(compute_residual(&data, 5, &mut []).is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        let data = noisy(&mut rng, 512, 3000);
        for order in 0..=MAX_FIXED_ORDER {
            let mut residual = vec![0; data.len() - order];
            compute_residual(&data, order, &mut residual).unwrap();
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal(&residual, order, &mut restored).unwrap();
            assert_eq!(restored, data, "order {order}");

            compute_residual_wide(&data, order, &mut residual).unwrap();
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal_wide(&residual, order, &mut restored).unwrap();
            assert_eq!(restored, data, "wide order {order}");
        }
    }

    #[test]
    fn test_round_trip_33bit() {
        let mut rng = StdRng::seed_from_u64(33);
        let data: Vec<i64> = noisy(&mut rng, 256, 500)
            .into_iter()
            .map(|v| (1i64 << 32) - (1 << 24) + v as i64)
            .collect();
        // Order 0 passes the samples through, which do not fit 32 bits here
        for order in 1..=MAX_FIXED_ORDER {
            let mut residual = vec![0; data.len() - order];
            compute_residual_wide_33bit(&data, order, &mut residual).unwrap();
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal_wide_33bit(&residual, order, &mut restored).unwrap();
            assert_eq!(restored, data, "order {order}");
        }
    }
}
