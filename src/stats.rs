//! Summary statistics over measurement series.
//!
//! All functions operate on plain `f64` slices so callers can feed them
//! latencies in milliseconds or bandwidths in bits per second alike.

/// Arithmetic mean. Returns 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.iter().sum::<f64>() / values.len() as f64
}

/// Median of the values, or None if the slice is empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;

    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Linear-interpolated percentile, `percentile` in `[0.0, 1.0]`.
///
/// Returns None if the slice is empty.
pub fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = (sorted.len() - 1) as f64 * percentile;
    let base = pos.floor();
    let rest = pos - base;
    let base = base as usize;

    if base + 1 < sorted.len() {
        return Some(sorted[base] + rest * (sorted[base + 1] - sorted[base]));
    }

    Some(sorted[base])
}

/// Population standard deviation.
///
/// Needs at least 2 values; returns 0.0 otherwise.
pub fn std_dev_population(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let mean = mean(values);
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>()
        / values.len() as f64;

    variance.sqrt()
}

/// Mean absolute difference between consecutive values.
///
/// Needs at least 2 values; returns 0.0 otherwise.
pub fn mean_abs_difference(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let diffs: Vec<f64> =
        values.windows(2).map(|pair| (pair[0] - pair[1]).abs()).collect();

    diffs.iter().sum::<f64>() / diffs.len() as f64
}
