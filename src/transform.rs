//! Elementwise intensity transforms applied to one sample before any aggregation.
//!
//! Every function here treats non-finite values as missing: they are excluded
//! from ranking and order statistics and are never rewritten.

use crate::error::{RenormError, Result};
use ndarray::{Array1, ArrayView1, Zip};
use std::f64::consts::{E, FRAC_2_PI};

/// Fractional positions closer than this to an order statistic snap onto it.
const QUANTILE_EPSILON: f64 = 1e-10;

/// Minimum number of finite values before `outlier_mask` flags anything.
const OUTLIER_MIN_VALUES: usize = 20;

fn finite_sorted(data: ArrayView1<f64>) -> Vec<f64> {
    let mut values: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    values
}

/// Returns the `k`-th quantile (`0 <= k <= 1`) of the finite values in `data`,
/// interpolating linearly between bracketing order statistics.
///
/// `None` when `data` holds no finite values.
pub fn quantile(data: ArrayView1<f64>, k: f64) -> Option<f64> {
    let sorted = finite_sorted(data);
    if sorted.is_empty() {
        return None;
    }
    let k = k.clamp(0.0, 1.0);
    let position = (sorted.len() - 1) as f64 * k;
    let whole = position.floor();
    let fraction = position - whole;
    let w = whole as usize;

    if fraction < QUANTILE_EPSILON || w + 1 >= sorted.len() {
        Some(sorted[w])
    } else {
        Some((1.0 - fraction) * sorted[w] + fraction * sorted[w + 1])
    }
}

/// Pools the order statistics of two channels and redistributes the pooled
/// distribution back to each channel's original positions.
///
/// Only positions where both `x` and `y` are finite take part. When supplied,
/// `max_threshold` and `min_threshold` clamp each normalized value to
/// `[min_threshold * original, max_threshold * original]`.
pub fn quantile_normalize(
    x: &mut Array1<f64>,
    y: &mut Array1<f64>,
    max_threshold: Option<f64>,
    min_threshold: Option<f64>,
) -> Result<()> {
    if x.len() != y.len() {
        return Err(RenormError::invalid_data(format!(
            "Channel length mismatch in quantile normalization: X has {}, Y has {}",
            x.len(),
            y.len()
        )));
    }

    let x_orig = x.clone();
    let y_orig = y.clone();

    let positions: Vec<usize> = (0..x.len())
        .filter(|&i| x[i].is_finite() && y[i].is_finite())
        .collect();

    let mut x_order: Vec<usize> = positions.clone();
    let mut y_order: Vec<usize> = positions;
    x_order.sort_by(|&a, &b| x_orig[a].total_cmp(&x_orig[b]));
    y_order.sort_by(|&a, &b| y_orig[a].total_cmp(&y_orig[b]));

    for (&xi, &yi) in x_order.iter().zip(y_order.iter()) {
        let pooled = (x_orig[xi] + y_orig[yi]) / 2.0;
        x[xi] = pooled;
        y[yi] = pooled;
    }

    if let Some(min_threshold) = min_threshold {
        clamp_relative(x, &x_orig, min_threshold, f64::max);
        clamp_relative(y, &y_orig, min_threshold, f64::max);
    }
    if let Some(max_threshold) = max_threshold {
        clamp_relative(x, &x_orig, max_threshold, f64::min);
        clamp_relative(y, &y_orig, max_threshold, f64::min);
    }
    Ok(())
}

fn clamp_relative(values: &mut Array1<f64>, original: &Array1<f64>, factor: f64, pick: fn(f64, f64) -> f64) {
    Zip::from(values).and(original).for_each(|v, &orig| {
        if v.is_finite() && orig.is_finite() {
            *v = pick(*v, factor * orig);
        }
    });
}

/// Flags non-finite positions and values outside the robust band
/// `[max(5th smallest, 1st percentile), min(5th largest, 99th percentile)]`.
///
/// With fewer than 20 finite values nothing is flagged.
pub fn outlier_mask(data: ArrayView1<f64>) -> Array1<bool> {
    let sorted = finite_sorted(data);
    let n = sorted.len();
    if n < OUTLIER_MIN_VALUES {
        return Array1::from_elem(data.len(), false);
    }

    let lower = sorted[4].max(sorted[(n as f64 * 0.01) as usize]);
    let upper = sorted[n - 5].min(sorted[(n as f64 * 0.99) as usize]);

    data.mapv(|v| !v.is_finite() || v < lower || v > upper)
}

/// Mean of the finite values after trimming `floor(p * n)` values from each end.
pub fn trimmed_mean(data: ArrayView1<f64>, p: f64) -> Option<f64> {
    let sorted = finite_sorted(data);
    let n = sorted.len();
    let cut = (p.clamp(0.0, 0.5) * n as f64) as usize;
    let kept = &sorted[cut..n.saturating_sub(cut).max(cut)];
    if kept.is_empty() {
        return None;
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Shifted Box-Cox power transform.
///
/// `lambda == 0` gives `ln(x - delta)`, otherwise `((x - delta)^lambda - 1) / lambda`.
/// A `base` rescales the result to that logarithm base.
pub fn boxcox(x: ArrayView1<f64>, lambda: f64, delta: f64, base: Option<f64>) -> Result<Array1<f64>> {
    if lambda < 0.0 {
        return Err(RenormError::config(format!(
            "Box-Cox lambda must be >= 0, got {}",
            lambda
        )));
    }
    let mut y = x.mapv(|v| {
        let shifted = v - delta;
        if lambda == 0.0 {
            shifted.ln()
        } else {
            (shifted.powf(lambda) - 1.0) / lambda
        }
    });
    if let Some(base) = base {
        y /= base.ln();
    }
    Ok(y)
}

/// General modulus power transform, defined for negative inputs as well.
pub fn gmpt(x: ArrayView1<f64>, lambda: f64, base: f64) -> Result<Array1<f64>> {
    if lambda < 0.0 {
        return Err(RenormError::config(format!(
            "Modulus power transform lambda must be >= 0, got {}",
            lambda
        )));
    }
    let mut y = x.mapv(|v| {
        let magnitude = v.abs() + 1.0;
        let transformed = if lambda == 0.0 {
            magnitude.ln()
        } else {
            (magnitude.powf(lambda) - 1.0) / lambda
        };
        // signum(0.0) is 1.0, but the transform of 0 is 0 either way
        v.signum() * transformed
    });
    if base != E {
        y /= base.ln();
    }
    Ok(y)
}

/// Polar angle `theta = (2/pi) * atan2(Y, X)`, 0 for pure A signal and 1 for pure B.
pub fn polar_angle(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array1<f64> {
    Zip::from(x).and(y).map_collect(|&a, &b| FRAC_2_PI * b.atan2(a))
}

/// Total intensity `R = X + Y` and polar angle `theta = (2/pi) * atan2(Y, X)`.
pub fn polar_coordinates(x: ArrayView1<f64>, y: ArrayView1<f64>) -> (Array1<f64>, Array1<f64>) {
    let r = Zip::from(x).and(y).map_collect(|&a, &b| a + b);
    (r, polar_angle(x, y))
}
