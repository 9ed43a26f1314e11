//! Descriptive statistics used to judge the quality of streamed data.
//!
//! Every function takes an arbitrary sequence and returns `None` for an
//! empty one: an axis that was not streamed has no statistics, which is not
//! an error.

use serde::{Deserialize, Serialize};

/// Full scale of a raw 16-bit sample.
pub const RAW_FULL_SCALE: f64 = u16::MAX as f64;

/// Summary of one sample sequence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatisticsResult {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q5: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub q95: f64,
    pub q99: f64,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    pub std_dev: f64,
    /// Third standardized moment, NaN for a constant sequence.
    pub skewness: f64,
    /// Fourth standardized moment (not excess), NaN for a constant sequence.
    pub kurtosis: f64,
    /// `q75 - q25`
    pub interquartile_range: f64,
    /// `q95 - q5`
    pub range_90: f64,
    /// `q99 - q1`
    pub range_98: f64,
    /// `max - min`
    pub range: f64,
    /// `20 * log10(std_dev / full_scale)`, `-inf` for a constant sequence.
    pub snr_db: f64,
}

/// Quantile `q` of an ascending sequence.
///
/// With `k = floor(n * q)`, odd-length sequences yield `sorted[k]` and
/// even-length ones the mean of `sorted[k - 1]` and `sorted[k]`.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let k = ((n as f64 * q).floor() as usize).min(n - 1);
    if n % 2 == 0 && k > 0 {
        Some((sorted[k] + sorted[k - 1]) / 2.0)
    } else {
        Some(sorted[k])
    }
}

pub fn median(sorted: &[f64]) -> Option<f64> {
    quantile(sorted, 0.5)
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population variance (divides by `n`).
pub fn variance(samples: &[f64]) -> Option<f64> {
    let mu = mean(samples)?;
    Some(central_moment(samples, mu, 2))
}

pub fn std_dev(samples: &[f64]) -> Option<f64> {
    variance(samples).map(f64::sqrt)
}

fn central_moment(samples: &[f64], mu: f64, order: i32) -> f64 {
    samples.iter().map(|x| (x - mu).powi(order)).sum::<f64>() / samples.len() as f64
}

/// `E[(x - mean)^order] / std_dev^order`; 3 is skewness, 4 kurtosis.
pub fn standardized_moment(samples: &[f64], order: i32) -> Option<f64> {
    let mu = mean(samples)?;
    let sigma = central_moment(samples, mu, 2).sqrt();
    if sigma == 0.0 {
        return Some(f64::NAN);
    }
    Some(central_moment(samples, mu, order) / sigma.powi(order))
}

/// Noise relative to full scale in dB.
pub fn snr_db(std_dev: f64, full_scale: f64) -> f64 {
    if std_dev == 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * (std_dev / full_scale).log10()
}

/// Raw sample to physical value in `[-full_scale, full_scale]`.
pub fn to_physical(raw: u16, full_scale: f64) -> f64 {
    (raw as f64 / RAW_FULL_SCALE * 2.0 - 1.0) * full_scale
}

/// All statistics of `samples`, with the SNR relative to `full_scale`.
pub fn statistics(samples: &[f64], full_scale: f64) -> Option<StatisticsResult> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q = |p| quantile(&sorted, p);
    let (min, max) = (*sorted.first()?, *sorted.last()?);
    let (q1, q5, q25, median, q75, q95, q99) =
        (q(0.01)?, q(0.05)?, q(0.25)?, q(0.5)?, q(0.75)?, q(0.95)?, q(0.99)?);

    let mean = mean(samples)?;
    let variance = central_moment(samples, mean, 2);
    let std_dev = variance.sqrt();

    Some(StatisticsResult {
        count: samples.len(),
        min,
        max,
        q1,
        q5,
        q25,
        median,
        q75,
        q95,
        q99,
        mean,
        variance,
        std_dev,
        skewness: standardized_moment(samples, 3)?,
        kurtosis: standardized_moment(samples, 4)?,
        interquartile_range: q75 - q25,
        range_90: q95 - q5,
        range_98: q99 - q1,
        range: max - min,
        snr_db: snr_db(std_dev, full_scale),
    })
}

/// Statistics of raw 16-bit samples, SNR relative to the 16-bit range.
pub fn statistics_raw(samples: &[u16]) -> Option<StatisticsResult> {
    let values: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    statistics(&values, RAW_FULL_SCALE)
}
