//! Latency estimation from collected round-trip samples.
//!
//! Each probe yields a midpoint latency (half its round-trip time). The midpoints are
//! sorted, a median and a spread are computed, midpoints too far from the median are
//! discarded and the mean of what remains is the latency estimate.

use clap::ValueEnum;
use serde::Serialize;
use tokio::time::Instant;

/// One matched probe: when the request left and when its reply came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub sent_at: Instant,
    pub received_at: Instant,
}

impl Sample {
    pub fn new(sent_at: Instant, received_at: Instant) -> Self {
        Sample {
            sent_at,
            received_at,
        }
    }

    /// Round-trip time in milliseconds.
    pub fn round_trip_ms(&self) -> f64 {
        // duration_since saturates, so a sample is never negative.
        self.received_at.duration_since(self.sent_at).as_secs_f64() * 1000.0
    }

    /// Half the round-trip time, an approximation of the one-way delay.
    pub fn midpoint_ms(&self) -> f64 {
        self.round_trip_ms() / 2.0
    }
}

/// Arithmetic used to reduce the midpoints to a single value.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorMode {
    /// True median, sample standard deviation, inclusive outlier bound.
    #[default]
    Corrected,
    /// Bit-for-bit compatible with peers running the original browser implementation.
    ///
    /// Odd-sized sets average the middle element with its upper neighbour, the spread is
    /// `sqrt((Σx² - (Σx)²/n)/n - 1)` and the outlier bound is strict. Sets of identical
    /// samples therefore produce NaN.
    Reference,
}

/// Everything computed while estimating, latency included.
#[derive(Debug, Clone, Serialize)]
pub struct Estimate {
    pub mode: EstimatorMode,
    /// Midpoint latencies in ascending order.
    pub midpoints: Vec<f64>,
    pub median: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// Midpoints that survived the outlier filter.
    pub kept: Vec<f64>,
    /// Final latency in milliseconds.
    pub latency: f64,
}

/// Estimates latency from a set of samples.
pub fn estimate(samples: &[Sample], mode: EstimatorMode) -> Estimate {
    estimate_midpoints(samples.iter().map(Sample::midpoint_ms).collect(), mode)
}

/// Estimates latency from midpoint latencies given in milliseconds, in any order.
pub fn estimate_midpoints(mut midpoints: Vec<f64>, mode: EstimatorMode) -> Estimate {
    midpoints.sort_by(f64::total_cmp);

    let n = midpoints.len() as f64;
    let sum: f64 = midpoints.iter().sum();
    let sum_sq: f64 = midpoints.iter().map(|x| x * x).sum();
    let mean = sum / n;

    let (median, std_dev) = match mode {
        EstimatorMode::Corrected => (
            median_corrected(&midpoints),
            std_dev_corrected(midpoints.len(), sum, sum_sq),
        ),
        EstimatorMode::Reference => (
            median_reference(&midpoints),
            ((sum_sq - (sum * sum) / n) / n - 1.0).sqrt(),
        ),
    };

    let kept: Vec<f64> = midpoints
        .iter()
        .copied()
        .filter(|x| match mode {
            EstimatorMode::Corrected => (median - x).abs() <= std_dev,
            EstimatorMode::Reference => (median - x).abs() < std_dev,
        })
        .collect();

    let latency = if kept.is_empty() && mode == EstimatorMode::Corrected {
        median
    } else {
        kept.iter().sum::<f64>() / kept.len() as f64
    };

    log::debug!("midpoints {:?}", midpoints);
    log::debug!(
        "median {} mean {} stddev {} kept {}/{}",
        median,
        mean,
        std_dev,
        kept.len(),
        midpoints.len()
    );

    Estimate {
        mode,
        midpoints,
        median,
        mean,
        std_dev,
        kept,
        latency,
    }
}

fn median_corrected(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => f64::NAN,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

fn median_reference(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    let at = |i: usize| sorted.get(i).copied().unwrap_or(f64::NAN);
    if n % 2 == 0 {
        at(n / 2)
    } else {
        (at(n / 2) + at(n / 2 + 1)) / 2.0
    }
}

fn std_dev_corrected(n: usize, sum: f64, sum_sq: f64) -> f64 {
    match n {
        0 => f64::NAN,
        1 => 0.0,
        _ => {
            let n = n as f64;
            let variance = (sum_sq - (sum * sum) / n) / (n - 1.0);
            // Rounding can push a zero variance slightly negative.
            variance.max(0.0).sqrt()
        }
    }
}
