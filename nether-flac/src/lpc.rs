//! Linear prediction: autocorrelation, Levinson-Durbin, coefficient quantization
//! and the residual/restore loops
//!
//! Quantized predictors are applied as `sum(qlp[j] * x[i-1-j]) >> shift` with an
//! arithmetic shift, so negative predictions round toward negative infinity.

use tracing::trace;

use crate::error::FlacError;
use crate::{MAX_LPC_ORDER, MAX_QLP_COEFF_PRECISION, MAX_QLP_SHIFT, MIN_QLP_SHIFT};

/// Lags up to this count use the lag-outer autocorrelation loop
const LAG_OUTER_MAX: usize = 16;

/// Multiply samples by a window into `out`
pub fn apply_window(data: &[i32], window: &[f32], out: &mut [f32]) {
    for ((o, &x), &w) in out.iter_mut().zip(data).zip(window) {
        *o = x as f32 * w;
    }
}

/// [`apply_window`] for 33-bit samples
pub fn apply_window_wide(data: &[i64], window: &[f32], out: &mut [f32]) {
    for ((o, &x), &w) in out.iter_mut().zip(data).zip(window) {
        *o = x as f32 * w;
    }
}

/// Autocorrelation of `data` for lags `0..lag`
///
/// Both loop shapes add the products of each lag in the same sample order, so the
/// choice between them never changes the result.
pub fn compute_autocorrelation(data: &[f32], lag: usize) -> Vec<f64> {
    if lag <= LAG_OUTER_MAX {
        autocorrelation_by_lag(data, lag)
    } else {
        autocorrelation_by_sample(data, lag)
    }
}

fn autocorrelation_by_lag(data: &[f32], lag: usize) -> Vec<f64> {
    (0..lag)
        .map(|l| {
            (l..data.len())
                .map(|i| data[i] as f64 * data[i - l] as f64)
                .fold(0.0, |sum, p| sum + p)
        })
        .collect()
}

fn autocorrelation_by_sample(data: &[f32], lag: usize) -> Vec<f64> {
    let mut autoc = vec![0.0f64; lag];
    for (i, &x) in data.iter().enumerate() {
        let x = x as f64;
        for (l, a) in autoc.iter_mut().enumerate().take(i + 1) {
            *a += x * data[i - l] as f64;
        }
    }
    autoc
}

/// Predictors for every order up to the one the recursion reached
#[derive(Debug, Clone, PartialEq)]
pub struct LpCoefficients {
    /// `coefficients[k]` is the order `k + 1` predictor
    pub coefficients: Vec<Vec<f32>>,
    /// Prediction error left at each order
    pub error: Vec<f64>,
}

impl LpCoefficients {
    /// Highest order computed, which may be below the requested one
    pub fn max_order(&self) -> usize {
        self.coefficients.len()
    }
}

/// Levinson-Durbin recursion over `autoc` (at least `max_order + 1` lags)
///
/// Stops early once the error reaches zero; a silent block (`autoc[0] == 0`) gives
/// no predictors at all.
pub fn compute_lp_coefficients(autoc: &[f64], max_order: usize) -> LpCoefficients {
    let max_order = max_order.min(MAX_LPC_ORDER).min(autoc.len().saturating_sub(1));
    let mut out = LpCoefficients {
        coefficients: Vec::with_capacity(max_order),
        error: Vec::with_capacity(max_order),
    };
    if max_order == 0 || autoc[0] == 0.0 {
        return out;
    }

    let mut lpc = [0.0f64; MAX_LPC_ORDER];
    let mut err = autoc[0];
    for i in 0..max_order {
        // Reflection coefficient for this order
        let mut r = -autoc[i + 1];
        for j in 0..i {
            r -= lpc[j] * autoc[i - j];
        }
        r /= err;

        lpc[i] = r;
        let half = i >> 1;
        for j in 0..half {
            let tmp = lpc[j];
            lpc[j] += r * lpc[i - 1 - j];
            lpc[i - 1 - j] += r * tmp;
        }
        if i & 1 != 0 {
            lpc[half] += lpc[half] * r;
        }
        err *= 1.0 - r * r;

        out.coefficients
            .push(lpc[..=i].iter().map(|&c| -c as f32).collect());
        out.error.push(err);

        if err == 0.0 {
            trace!("lpc: error reached zero at order {}", i + 1);
            break;
        }
    }
    out
}

/// Outcome of [`quantize_coefficients`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantizeStatus {
    Quantized { coefficients: Vec<i32>, shift: u32 },
    /// Every coefficient is zero
    AllZero,
    /// The coefficients are too large for any encodable shift at this precision
    ShiftOutOfRange,
}

/// Binary exponent `e` with `x = m * 2^e`, `0.5 <= m < 1`, for finite `x > 0`
fn frexp_exponent(x: f64) -> i32 {
    let biased = ((x.to_bits() >> 52) & 0x7FF) as i32;
    if biased == 0 {
        // Subnormal: scale into the normal range first
        return frexp_exponent(x * f64::from_bits(0x43F0_0000_0000_0000)) - 64;
    }
    biased - 1022
}

/// Quantize `lp` to `precision`-bit signed integers sharing one shift
///
/// Rounding error is carried from each coefficient into the next. A shift that
/// would be negative is folded into the coefficients and reported as 0.
pub fn quantize_coefficients(lp: &[f32], precision: u32) -> Result<QuantizeStatus, FlacError> {
    if !(2..=MAX_QLP_COEFF_PRECISION).contains(&precision) {
        return Err(FlacError::InvalidParameter("qlp coefficient precision"));
    }
    // One bit goes to the sign
    let precision = precision - 1;
    let qmax = (1i32 << precision) - 1;
    let qmin = -(1i32 << precision);

    let cmax = lp.iter().map(|&c| (c as f64).abs()).fold(0.0f64, f64::max);
    if cmax <= 0.0 {
        return Ok(QuantizeStatus::AllZero);
    }
    let log2cmax = frexp_exponent(cmax) - 1;
    let shift = (precision as i32 - log2cmax - 1).min(MAX_QLP_SHIFT);
    if shift < MIN_QLP_SHIFT {
        return Ok(QuantizeStatus::ShiftOutOfRange);
    }

    let scale = if shift >= 0 {
        (1i64 << shift) as f64
    } else {
        1.0 / (1i64 << -shift) as f64
    };
    let mut error = 0.0f64;
    let coefficients = lp
        .iter()
        .map(|&c| {
            error += c as f64 * scale;
            let q = (error.round() as i32).clamp(qmin, qmax);
            error -= q as f64;
            q
        })
        .collect();
    Ok(QuantizeStatus::Quantized {
        coefficients,
        shift: shift.max(0) as u32,
    })
}

fn check(order: usize, shift: u32, data_len: usize, residual_len: usize) -> Result<(), FlacError> {
    if order == 0 || order > MAX_LPC_ORDER {
        return Err(FlacError::InvalidParameter("lpc order"));
    }
    if shift >= 32 {
        return Err(FlacError::InvalidParameter("qlp shift"));
    }
    if data_len < order || data_len - order != residual_len {
        return Err(FlacError::InvalidParameter("residual length"));
    }
    Ok(())
}

/// Expand a call over the predictor order into one monomorphized loop per order up
/// to 12; `N = 0` takes the order from the coefficient slice
macro_rules! by_order {
    ($order:expr, $f:ident::<N $(, $extra:tt)*>($($arg:expr),* $(,)?)) => {
        match $order {
            1 => $f::<1 $(, $extra)*>($($arg),*),
            2 => $f::<2 $(, $extra)*>($($arg),*),
            3 => $f::<3 $(, $extra)*>($($arg),*),
            4 => $f::<4 $(, $extra)*>($($arg),*),
            5 => $f::<5 $(, $extra)*>($($arg),*),
            6 => $f::<6 $(, $extra)*>($($arg),*),
            7 => $f::<7 $(, $extra)*>($($arg),*),
            8 => $f::<8 $(, $extra)*>($($arg),*),
            9 => $f::<9 $(, $extra)*>($($arg),*),
            10 => $f::<10 $(, $extra)*>($($arg),*),
            11 => $f::<11 $(, $extra)*>($($arg),*),
            12 => $f::<12 $(, $extra)*>($($arg),*),
            _ => $f::<0 $(, $extra)*>($($arg),*),
        }
    };
}

#[inline(always)]
fn predict<const N: usize>(window: &[i32], qlp: &[i32]) -> i32 {
    let order = if N == 0 { qlp.len() } else { N };
    let mut sum = 0i32;
    for j in 0..order {
        sum = sum.wrapping_add(qlp[j].wrapping_mul(window[order - 1 - j]));
    }
    sum
}

#[inline(always)]
fn predict_wide<const N: usize, T: Copy + Into<i64>>(window: &[T], qlp: &[i32]) -> i64 {
    let order = if N == 0 { qlp.len() } else { N };
    let mut sum = 0i64;
    for j in 0..order {
        let x: i64 = window[order - 1 - j].into();
        sum += qlp[j] as i64 * x;
    }
    sum
}

fn residual_narrow<const N: usize>(data: &[i32], qlp: &[i32], shift: u32, residual: &mut [i32]) {
    let order = qlp.len();
    for (i, r) in residual.iter_mut().enumerate() {
        let sum = predict::<N>(&data[i..i + order], qlp);
        *r = data[i + order].wrapping_sub(sum >> shift);
    }
}

/// Runs `emit` on each residual in order; stops and returns `false` when it does
fn residual_wide<const N: usize, T: Copy + Into<i64>>(
    data: &[T],
    qlp: &[i32],
    shift: u32,
    mut emit: impl FnMut(usize, i64) -> bool,
) -> bool {
    let order = qlp.len();
    for i in 0..data.len() - order {
        let sum = predict_wide::<N, T>(&data[i..i + order], qlp);
        let x: i64 = data[i + order].into();
        if !emit(i, x - (sum >> shift)) {
            return false;
        }
    }
    true
}

fn restore_narrow<const N: usize>(residual: &[i32], qlp: &[i32], shift: u32, data: &mut [i32]) {
    let order = qlp.len();
    for (i, &r) in residual.iter().enumerate() {
        let sum = predict::<N>(&data[i..i + order], qlp);
        data[i + order] = r.wrapping_add(sum >> shift);
    }
}

fn restore_wide<const N: usize, T: Copy + Into<i64>>(
    residual: &[i32],
    qlp: &[i32],
    shift: u32,
    data: &mut [T],
    narrow: impl Fn(i64) -> T,
) {
    let order = qlp.len();
    for (i, &r) in residual.iter().enumerate() {
        let sum = predict_wide::<N, T>(&data[i..i + order], qlp);
        data[i + order] = narrow(r as i64 + (sum >> shift));
    }
}

/// Residual of `data` (warm-up included) for a quantized predictor, in wrapping
/// 32-bit arithmetic
///
/// Only exact when [`max_prediction_before_shift_bits`] is at most 32.
pub fn compute_residual_from_qlp(
    data: &[i32],
    qlp: &[i32],
    shift: u32,
    residual: &mut [i32],
) -> Result<(), FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    by_order!(qlp.len(), residual_narrow::<N>(data, qlp, shift, residual));
    Ok(())
}

/// Residual with 64-bit prediction, truncated to 32 bits
pub fn compute_residual_from_qlp_wide(
    data: &[i32],
    qlp: &[i32],
    shift: u32,
    residual: &mut [i32],
) -> Result<(), FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    let emit = |i: usize, r: i64| {
        residual[i] = r as i32;
        true
    };
    by_order!(qlp.len(), residual_wide::<N, _>(data, qlp, shift, emit));
    Ok(())
}

/// Residual with 64-bit prediction; `Ok(false)` if any value leaves the 32-bit range
pub fn compute_residual_from_qlp_limit(
    data: &[i32],
    qlp: &[i32],
    shift: u32,
    residual: &mut [i32],
) -> Result<bool, FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    let emit = |i: usize, r: i64| match i32::try_from(r) {
        Ok(r) => {
            residual[i] = r;
            true
        }
        Err(_) => false,
    };
    Ok(by_order!(qlp.len(), residual_wide::<N, _>(data, qlp, shift, emit)))
}

/// [`compute_residual_from_qlp_limit`] for 33-bit samples
pub fn compute_residual_from_qlp_limit_33bit(
    data: &[i64],
    qlp: &[i32],
    shift: u32,
    residual: &mut [i32],
) -> Result<bool, FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    let emit = |i: usize, r: i64| match i32::try_from(r) {
        Ok(r) => {
            residual[i] = r;
            true
        }
        Err(_) => false,
    };
    Ok(by_order!(qlp.len(), residual_wide::<N, _>(data, qlp, shift, emit)))
}

/// Rebuild `data` from its warm-up (`data[..order]`) and `residual` in wrapping
/// 32-bit arithmetic
pub fn restore_signal(
    residual: &[i32],
    qlp: &[i32],
    shift: u32,
    data: &mut [i32],
) -> Result<(), FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    by_order!(qlp.len(), restore_narrow::<N>(residual, qlp, shift, data));
    Ok(())
}

/// [`restore_signal`] with 64-bit prediction
pub fn restore_signal_wide(
    residual: &[i32],
    qlp: &[i32],
    shift: u32,
    data: &mut [i32],
) -> Result<(), FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    let narrow = |v: i64| v as i32;
    by_order!(qlp.len(), restore_wide::<N, _>(residual, qlp, shift, data, narrow));
    Ok(())
}

/// [`restore_signal`] producing 33-bit samples
pub fn restore_signal_wide_33bit(
    residual: &[i32],
    qlp: &[i32],
    shift: u32,
    data: &mut [i64],
) -> Result<(), FlacError> {
    check(qlp.len(), shift, data.len(), residual.len())?;
    let narrow = |v: i64| v;
    by_order!(qlp.len(), restore_wide::<N, _>(residual, qlp, shift, data, narrow));
    Ok(())
}

/// Bits per residual sample expected for a prediction error over `total_samples`
pub fn expected_bits_per_residual_sample(error: f64, total_samples: usize) -> f64 {
    bits_with_error_scale(error, 0.5 / total_samples as f64)
}

fn bits_with_error_scale(error: f64, error_scale: f64) -> f64 {
    if error > 0.0 {
        (0.5 * (error_scale * error).log2()).max(0.0)
    } else if error < 0.0 {
        // Rounding can push a tiny error below zero; never pick that order
        1e32
    } else {
        0.0
    }
}

/// Order (1-based) minimizing estimated residual bits plus per-order overhead
pub fn best_order(errors: &[f64], total_samples: usize, overhead_bits_per_order: u32) -> usize {
    let error_scale = 0.5 / total_samples as f64;
    let mut best = 0;
    let mut best_bits = f64::MAX;
    for (index, &error) in errors.iter().enumerate() {
        let order = index + 1;
        let bits = bits_with_error_scale(error, error_scale)
            * total_samples.saturating_sub(order) as f64
            + (order as u64 * overhead_bits_per_order as u64) as f64;
        if bits < best_bits {
            best = index;
            best_bits = bits;
        }
    }
    best + 1
}

/// Bits needed by a signed value
fn silog2(v: i64) -> u32 {
    match v {
        0 => 0,
        -1 => 2,
        v => {
            let magnitude = if v < 0 { -(v + 1) } else { v };
            magnitude.ilog2() + 2
        }
    }
}

/// Worst-case width of `sum(qlp[j] * x)` for `sample_bits`-bit samples
pub fn max_prediction_before_shift_bits(sample_bits: u32, qlp: &[i32]) -> u32 {
    let abs_sum: i64 = qlp.iter().map(|&q| (q as i64).abs()).sum();
    sample_bits + silog2(abs_sum.max(1))
}

/// Worst-case width of a residual for `sample_bits`-bit samples
pub fn max_residual_bits(sample_bits: u32, qlp: &[i32], shift: u32) -> u32 {
    let predictor_bits = max_prediction_before_shift_bits(sample_bits, qlp) as i64 - shift as i64;
    sample_bits.max(predictor_bits.max(0) as u32) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_qlp(rng: &mut StdRng, order: usize, precision: u32) -> Vec<i32> {
        let bound = 1i32 << (precision - 1);
        (0..order).map(|_| rng.random_range(-bound..bound)).collect()
    }

    #[test]
    fn test_window() {
        let mut out = [0.0f32; 2];
        apply_window(&[2, -4], &[0.5, 0.25], &mut out);
        assert_eq!(out, [1.0, -1.0]);
        apply_window_wide(&[1 << 32, 0], &[0.5, 1.0], &mut out);
        assert_eq!(out, [2147483648.0, 0.0]);
    }

    #[test]
    fn test_autocorrelation() {
        assert_eq!(compute_autocorrelation(&[1.0, 2.0, 3.0], 3), vec![14.0, 8.0, 3.0]);
        // Lags past the block length are zero
        assert_eq!(compute_autocorrelation(&[2.0], 2), vec![4.0, 0.0]);
    }

    #[test]
    fn test_autocorrelation_paths_agree() {
        let mut rng = StdRng::seed_from_u64(3);
        let data: Vec<f32> = (0..1000)
            .map(|_| rng.random_range(-30000.0..30000.0f32))
            .collect();
        for lag in 1..=MAX_LPC_ORDER + 1 {
            assert_eq!(
                autocorrelation_by_lag(&data, lag),
                autocorrelation_by_sample(&data, lag),
                "lag {lag}"
            );
        }
    }

    #[test]
    fn test_lp_coefficients() {
        let lp = compute_lp_coefficients(&[1.0, 0.5, 0.25], 2);
        assert_eq!(lp.max_order(), 2);
        assert_eq!(lp.coefficients, vec![vec![0.5], vec![0.5, 0.0]]);
        assert_eq!(lp.error, vec![0.75, 0.75]);
    }

    #[test]
    fn test_lp_coefficients_stop_at_zero_error() {
        let lp = compute_lp_coefficients(&[1.0; 9], 8);
        assert_eq!(lp.max_order(), 1);
        assert_eq!(lp.coefficients[0], vec![1.0]);
        assert_eq!(lp.error, vec![0.0]);

        assert_eq!(compute_lp_coefficients(&[0.0; 9], 8).max_order(), 0);
        // Order is capped by the lags supplied
        assert_eq!(compute_lp_coefficients(&[1.0, 0.5], 8).max_order(), 1);
    }

    #[test]
    fn test_quantize() {
        assert_eq!(
            quantize_coefficients(&[0.5], 15).unwrap(),
            QuantizeStatus::Quantized {
                coefficients: vec![8192],
                shift: 14
            }
        );
        // Error feedback: 1945.6 rounds up, so -972.8 - 0.4 rounds to -973
        assert_eq!(
            quantize_coefficients(&[1.9, -0.95], 12).unwrap(),
            QuantizeStatus::Quantized {
                coefficients: vec![1946, -973],
                shift: 10
            }
        );
        // Small coefficients stop at the largest shift
        assert_eq!(
            quantize_coefficients(&[1e-6], 15).unwrap(),
            QuantizeStatus::Quantized {
                coefficients: vec![0],
                shift: 15
            }
        );
    }

    #[test]
    fn test_quantize_degenerate() {
        assert_eq!(
            quantize_coefficients(&[0.0, -0.0], 12).unwrap(),
            QuantizeStatus::AllZero
        );
        assert_eq!(
            quantize_coefficients(&[1e6], 2).unwrap(),
            QuantizeStatus::ShiftOutOfRange
        );
        // A small negative shift is folded into the coefficients and clamped
        assert_eq!(
            quantize_coefficients(&[100.0], 2).unwrap(),
            QuantizeStatus::Quantized {
                coefficients: vec![1],
                shift: 0
            }
        );
        assert!(quantize_coefficients(&[0.5], 16).is_err());
        assert!(quantize_coefficients(&[0.5], 1).is_err());
    }

    #[test]
    fn test_frexp() {
        assert_eq!(frexp_exponent(0.5), 0);
        assert_eq!(frexp_exponent(1.0), 1);
        assert_eq!(frexp_exponent(1.9), 1);
        assert_eq!(frexp_exponent(100.0), 7);
        assert_eq!(frexp_exponent(f64::from_bits(1)), -1073);
    }

    #[test]
    fn test_shift_is_arithmetic() {
        // Prediction -3 >> 1 is -2, not -1
        let data = [-3, 0];
        let mut residual = [0];
        compute_residual_from_qlp(&data, &[1], 1, &mut residual).unwrap();
        assert_eq!(residual, [2]);
        compute_residual_from_qlp_wide(&data, &[1], 1, &mut residual).unwrap();
        assert_eq!(residual, [2]);
    }

    #[test]
    fn test_round_trip_all_orders() {
        let mut rng = StdRng::seed_from_u64(0x1bc);
        let data: Vec<i32> = (0..400).map(|_| rng.random_range(-(1 << 20)..(1 << 20))).collect();
        for order in 1..=MAX_LPC_ORDER {
            let qlp = random_qlp(&mut rng, order, 12);
            let shift = rng.random_range(0..=MAX_QLP_SHIFT as u32);
            let mut residual = vec![0; data.len() - order];

            compute_residual_from_qlp(&data, &qlp, shift, &mut residual).unwrap();
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal(&residual, &qlp, shift, &mut restored).unwrap();
            assert_eq!(restored, data, "order {order}");

            compute_residual_from_qlp_wide(&data, &qlp, shift, &mut residual).unwrap();
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal_wide(&residual, &qlp, shift, &mut restored).unwrap();
            assert_eq!(restored, data, "wide order {order}");
        }
    }

    #[test]
    fn test_round_trip_33bit() {
        let mut rng = StdRng::seed_from_u64(33);
        let data: Vec<i64> = (0..300)
            .map(|_| (1i64 << 32) - 5000 + rng.random_range(-2000..2000))
            .collect();
        for order in 1..=MAX_LPC_ORDER {
            // Coefficients summing to one keep the prediction near the signal
            let shift = 10;
            let mut qlp = random_qlp(&mut rng, order, 4);
            qlp[0] = (1 << shift) - qlp[1..].iter().sum::<i32>();

            let mut residual = vec![0; data.len() - order];
            assert!(compute_residual_from_qlp_limit_33bit(&data, &qlp, shift, &mut residual).unwrap());
            let mut restored = data[..order].to_vec();
            restored.resize(data.len(), 0);
            restore_signal_wide_33bit(&residual, &qlp, shift, &mut restored).unwrap();
            assert_eq!(restored, data, "order {order}");
        }
    }

    #[test]
    fn test_limit_detects_overflow() {
        let mut residual = [0];
        assert!(!compute_residual_from_qlp_limit(&[i32::MIN, i32::MAX], &[1], 0, &mut residual).unwrap());
        assert!(compute_residual_from_qlp_limit(&[5, 7], &[1], 0, &mut residual).unwrap());
        assert_eq!(residual, [2]);
        assert!(!compute_residual_from_qlp_limit_33bit(&[0, 1 << 32], &[1], 0, &mut residual).unwrap());
    }

    #[test]
    fn test_invalid_parameters() {
        let mut residual = [0; 4];
        assert!(compute_residual_from_qlp(&[0; 4], &[], 0, &mut residual).is_err());
        assert!(compute_residual_from_qlp(&[0; 5], &[1], 32, &mut residual).is_err());
        assert!(compute_residual_from_qlp(&[0; 6], &[1], 0, &mut residual).is_err());
        assert!(compute_residual_from_qlp(&[0; 5], &[1], 0, &mut residual).is_ok());
    }

    #[test]
    fn test_order_estimates() {
        assert_eq!(expected_bits_per_residual_sample(0.0, 100), 0.0);
        assert_eq!(expected_bits_per_residual_sample(-1.0, 100), 1e32);
        // 0.5 * log2(0.5 / 8 * 64) = 1
        assert_eq!(expected_bits_per_residual_sample(64.0, 8), 1.0);

        assert_eq!(best_order(&[1e6, 1e4, 9.9e3], 1000, 20), 2);
        assert_eq!(best_order(&[1e6, 1e4, 9.9e3], 1000, 0), 3);
    }

    #[test]
    fn test_bit_bounds() {
        assert_eq!(max_prediction_before_shift_bits(16, &[1024, -512]), 28);
        assert_eq!(max_residual_bits(16, &[1024, -512], 10), 19);
        assert_eq!(max_residual_bits(16, &[1], 4), 17);
        assert_eq!(max_prediction_before_shift_bits(16, &[0, 0]), 18);
    }

    #[test]
    fn test_end_to_end() {
        // Two mixed tones
        let data: Vec<i32> = (0..1024)
            .map(|i| {
                let t = i as f64;
                (8000.0 * (t * 0.05).sin() + 3000.0 * (t * 0.31).sin()).round() as i32
            })
            .collect();
        let window = vec![1.0f32; data.len()];
        let mut windowed = vec![0.0f32; data.len()];
        apply_window(&data, &window, &mut windowed);

        let autoc = compute_autocorrelation(&windowed, 9);
        let lp = compute_lp_coefficients(&autoc, 8);
        assert!(lp.max_order() >= 4);
        let order = best_order(&lp.error, data.len(), 12 + 5);
        let QuantizeStatus::Quantized { coefficients, shift } =
            quantize_coefficients(&lp.coefficients[order - 1], 12).unwrap()
        else {
            panic!("quantization failed");
        };

        let mut residual = vec![0; data.len() - order];
        assert!(compute_residual_from_qlp_limit(&data, &coefficients, shift, &mut residual).unwrap());
        // Prediction should beat the raw signal by a wide margin
        let residual_energy: i64 = residual.iter().map(|&r| (r as i64).abs()).sum();
        let signal_energy: i64 = data.iter().map(|&x| (x as i64).abs()).sum();
        assert!(residual_energy * 10 < signal_energy);

        let mut restored = data[..order].to_vec();
        restored.resize(data.len(), 0);
        restore_signal_wide(&residual, &coefficients, shift, &mut restored).unwrap();
        assert_eq!(restored, data);
    }
}
