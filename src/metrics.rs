//! Trajectory metrics: how much the latent state moves at each step.
//!
//! - [`change_magnitudes`]: Euclidean distance between consecutive states
//! - [`identify_critical_steps`]: transitions above a percentile of the run
//! - [`noise_variance_trajectory`]: the sampler's own per-step variance record
//!
//! Critical steps are a view over a magnitude series, recomputed on demand.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::artifact::{GeneratedSequence, LatentTensorSequence};
use crate::error::MetricsError;
use crate::simd::DistanceKernel;

/// Result type for metric operations.
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// Default percentile above which a transition counts as critical.
pub const DEFAULT_CRITICAL_PERCENTILE: f64 = 75.0;

/// Step-to-step change magnitudes.
///
/// `series[i]` is the distance between latent states `i` and `i + 1`, so the
/// series is one shorter than the trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeMagnitudeSeries(Vec<f64>);

impl ChangeMagnitudeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index and value of the largest transition, if any.
    ///
    /// Ties go to the earliest transition.
    pub fn peak(&self) -> Option<(usize, f64)> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if v.total_cmp(&b).is_le() => best,
                _ => Some((i, v)),
            })
    }
}

/// Transitions whose change magnitude exceeds a percentile threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalStepSet {
    /// Percentile the threshold was computed at.
    pub percentile: f64,
    /// Threshold value; `None` for an empty series.
    pub threshold: Option<f64>,
    /// Ascending indices `i` with `series[i] > threshold`.
    pub steps: Vec<usize>,
}

impl CriticalStepSet {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, step: usize) -> bool {
        self.steps.binary_search(&step).is_ok()
    }
}

/// Compute the change magnitude of every transition in `latents`.
///
/// Each state is treated as one flat vector. Trajectories with fewer than
/// two states yield an empty series.
pub fn change_magnitudes(
    kernel: &dyn DistanceKernel,
    latents: &LatentTensorSequence,
) -> ChangeMagnitudeSeries {
    if latents.len() < 2 {
        return ChangeMagnitudeSeries::default();
    }
    let values: Vec<f64> = (1..latents.len())
        .into_par_iter()
        .map(|i| kernel.squared_l2(latents.state(i), latents.state(i - 1)).sqrt())
        .collect();
    for (i, v) in values.iter().enumerate() {
        tracing::debug!(step = i, magnitude = v, "step change");
    }
    ChangeMagnitudeSeries(values)
}

/// The `p`-th percentile of `values` by linear interpolation between order
/// statistics (rank `p / 100 · (n − 1)`).
///
/// Returns `None` for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> MetricsResult<Option<f64>> {
    check_percentile(p)?;
    if values.is_empty() {
        return Ok(None);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    let value = if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    };
    Ok(Some(value))
}

fn check_percentile(p: f64) -> MetricsResult<()> {
    if !p.is_finite() || !(0.0..=100.0).contains(&p) {
        return Err(MetricsError::InvalidParameter {
            name: "percentile",
            value: p,
            expected: "[0, 100]",
        });
    }
    Ok(())
}

/// Flag transitions strictly above the `percentile`-th percentile of `series`.
///
/// A constant series has no critical steps: the comparison is strict and no
/// value exceeds the common value.
pub fn identify_critical_steps(
    series: &ChangeMagnitudeSeries,
    percentile_value: f64,
) -> MetricsResult<CriticalStepSet> {
    let threshold = percentile(series.values(), percentile_value)?;
    let steps: Vec<usize> = match threshold {
        Some(t) => series
            .values()
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v > t)
            .map(|(i, _)| i)
            .collect(),
        None => Vec::new(),
    };

    for &step in &steps {
        tracing::info!(
            step,
            magnitude = series.values()[step],
            percentile = percentile_value,
            "critical step"
        );
    }

    Ok(CriticalStepSet {
        percentile: percentile_value,
        threshold,
        steps,
    })
}

/// Per-step noise variance as recorded by the sampler, in step order.
pub fn noise_variance_trajectory(sequence: &GeneratedSequence) -> Vec<f64> {
    sequence.steps().iter().map(|s| s.noise_variance).collect()
}
