//! Dimensionality reduction: PCA projection of sampled latent states to 2-D.
//!
//! The eigendecomposition sits behind the [`EigenSolver`] trait so the
//! projection math can be tested against a fixed-output solver, independent of
//! any linear-algebra backend. [`SymmetricEigenSolver`] (nalgebra) is the default.
//!
//! Latent states are usually far wider than the number of samples (a 4×64×64
//! latent has 16,384 elements against ~10 samples). In that case the `n×n`
//! Gram form `C·Cᵗ/(n−1)` is decomposed instead of the `d×d` covariance
//! `Cᵗ·C/(n−1)`: both share their non-zero spectrum, and the projection of `C`
//! onto the k-th covariance eigenvector is `sqrt((n−1)·λₖ)·uₖ`. Axis signs are
//! implementation-defined either way.

use nalgebra::{DMatrix, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::artifact::LatentTensorSequence;
use crate::error::ReduceError;
use crate::simd::DistanceKernel;

/// Result type for reduction operations.
pub type ReduceResult<T> = std::result::Result<T, ReduceError>;

/// Default number of evenly spaced steps sampled for projection.
pub const DEFAULT_SAMPLE_STEPS: usize = 10;

/// Relative tolerance for symmetry and sign checks on the spectrum.
const SPECTRUM_TOLERANCE: f64 = 1e-9;

/// Eigenvalues and matching eigenvectors (as columns), in any order.
#[derive(Debug, Clone)]
pub struct EigenPairs {
    pub values: Vec<f64>,
    pub vectors: DMatrix<f64>,
}

/// Eigendecomposition of a real symmetric matrix.
pub trait EigenSolver: Send + Sync {
    fn decompose(&self, matrix: &DMatrix<f64>) -> ReduceResult<EigenPairs>;
}

/// nalgebra's symmetric QR-based eigensolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricEigenSolver;

impl EigenSolver for SymmetricEigenSolver {
    fn decompose(&self, matrix: &DMatrix<f64>) -> ReduceResult<EigenPairs> {
        let eigen = SymmetricEigen::new(matrix.clone());
        Ok(EigenPairs {
            values: eigen.eigenvalues.iter().copied().collect(),
            vectors: eigen.eigenvectors,
        })
    }
}

/// One projected sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPoint {
    pub step_index: usize,
    pub x: f64,
    pub y: f64,
}

/// Sampled states projected onto their two dominant directions of variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection2D {
    /// One point per sample, in the order samples were given.
    pub points: Vec<ProjectedPoint>,
    /// Fraction of total variance along each axis.
    pub explained_variance: [f64; 2],
}

impl Projection2D {
    /// Mean of all projected points.
    pub fn centroid(&self) -> (f64, f64) {
        let n = self.points.len().max(1) as f64;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        (sx / n, sy / n)
    }
}

/// `count` evenly spaced step indices from `0` to `total − 1` inclusive,
/// truncated toward zero.
///
/// Matches `numpy.linspace(0, total - 1, count, dtype=int)`, duplicates
/// included when `count > total`.
pub fn sample_step_indices(total: usize, count: usize) -> Vec<usize> {
    if total == 0 || count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![0];
    }
    let stop = (total - 1) as f64;
    let step = stop / (count - 1) as f64;
    (0..count)
        .map(|i| {
            if i == count - 1 {
                total - 1
            } else {
                (i as f64 * step) as usize
            }
        })
        .collect()
}

/// Project the states at `sample_indices` onto their first two principal components.
///
/// Fails with `InsufficientSamples` for fewer than two samples, `IndexOutOfRange`
/// for an index past the trajectory, and `NumericalInstability` when the solver
/// output is not a valid spectrum of a covariance matrix.
pub fn project(
    kernel: &dyn DistanceKernel,
    latents: &LatentTensorSequence,
    sample_indices: &[usize],
    solver: &dyn EigenSolver,
) -> ReduceResult<Projection2D> {
    let n = sample_indices.len();
    if n < 2 {
        return Err(ReduceError::InsufficientSamples { count: n });
    }
    if let Some(&index) = sample_indices.iter().find(|&&i| i >= latents.len()) {
        return Err(ReduceError::IndexOutOfRange {
            index,
            len: latents.len(),
        });
    }

    let d = latents.state_len();
    let (coords, spectrum) = if d <= n {
        primal_projection(latents, sample_indices, solver)?
    } else {
        gram_projection(kernel, latents, sample_indices, solver)?
    };

    let explained_variance = spectrum.explained();

    let points = sample_indices
        .iter()
        .zip(coords)
        .map(|(&step_index, (x, y))| ProjectedPoint { step_index, x, y })
        .collect();

    tracing::debug!(
        samples = n,
        dim = d,
        form = if d <= n { "covariance" } else { "gram" },
        explained = ?explained_variance,
        "projected latent samples"
    );

    Ok(Projection2D {
        points,
        explained_variance,
    })
}

/// Variance along the two leading axes and across the whole spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Spectrum {
    leading: [f64; 2],
    total: f64,
}

impl Spectrum {
    /// Share of the total variance carried by each leading axis.
    fn explained(&self) -> [f64; 2] {
        if self.total > 0.0 {
            self.leading.map(|v| v / self.total)
        } else {
            [0.0, 0.0]
        }
    }
}

/// Coordinates per sample plus the spectrum they were projected from.
type Components = (Vec<(f64, f64)>, Spectrum);

/// Decompose the `d×d` covariance directly and project the centered samples.
fn primal_projection(
    latents: &LatentTensorSequence,
    sample_indices: &[usize],
    solver: &dyn EigenSolver,
) -> ReduceResult<Components> {
    let n = sample_indices.len();
    let d = latents.state_len();

    let mut centered =
        DMatrix::<f64>::from_fn(n, d, |r, c| latents.state(sample_indices[r])[c] as f64);
    for c in 0..d {
        let mean = centered.column(c).sum() / n as f64;
        centered.column_mut(c).add_scalar_mut(-mean);
    }
    let covariance = centered.transpose() * &centered / (n - 1) as f64;

    let (order, values, vectors) = checked_decompose(&covariance, solver)?;
    let coords = (0..n)
        .map(|r| {
            let axis = |k: usize| match order.get(k) {
                Some(&col) => centered.row(r).dot(&vectors.column(col).transpose()),
                None => 0.0,
            };
            (axis(0), axis(1))
        })
        .collect();
    Ok((coords, leading_variances(&order, &values)))
}

/// Decompose the `n×n` double-centered Gram matrix and recover projections.
fn gram_projection(
    kernel: &dyn DistanceKernel,
    latents: &LatentTensorSequence,
    sample_indices: &[usize],
    solver: &dyn EigenSolver,
) -> ReduceResult<Components> {
    let n = sample_indices.len();

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let a = latents.state(sample_indices[i]);
            (0..n)
                .map(|j| kernel.dot(a, latents.state(sample_indices[j])))
                .collect()
        })
        .collect();
    let raw = DMatrix::from_fn(n, n, |i, j| {
        // Average the two evaluations so the matrix is exactly symmetric.
        0.5 * (rows[i][j] + rows[j][i])
    });

    // Double-centering: (x_i − μ)·(x_j − μ) from raw inner products.
    let row_means: Vec<f64> = (0..n).map(|i| raw.row(i).sum() / n as f64).collect();
    let grand_mean = row_means.iter().sum::<f64>() / n as f64;
    let gram = DMatrix::from_fn(n, n, |i, j| {
        (raw[(i, j)] - row_means[i] - row_means[j] + grand_mean) / (n - 1) as f64
    });

    let (order, values, vectors) = checked_decompose(&gram, solver)?;
    let scale = |k: usize| {
        order
            .get(k)
            .map(|&col| ((n - 1) as f64 * values[col].max(0.0)).sqrt())
            .unwrap_or(0.0)
    };
    let (s0, s1) = (scale(0), scale(1));
    let coords = (0..n)
        .map(|r| {
            let x = order.first().map_or(0.0, |&col| s0 * vectors[(r, col)]);
            let y = order.get(1).map_or(0.0, |&col| s1 * vectors[(r, col)]);
            (x, y)
        })
        .collect();
    Ok((coords, leading_variances(&order, &values)))
}

fn leading_variances(order: &[usize], values: &[f64]) -> Spectrum {
    let pick = |k: usize| order.get(k).map_or(0.0, |&col| values[col].max(0.0));
    Spectrum {
        leading: [pick(0), pick(1)],
        total: values.iter().map(|v| v.max(0.0)).sum(),
    }
}

/// Run the solver and validate its output as a covariance spectrum.
///
/// Returns column indices sorted by descending eigenvalue, plus the raw pairs.
fn checked_decompose(
    matrix: &DMatrix<f64>,
    solver: &dyn EigenSolver,
) -> ReduceResult<(Vec<usize>, Vec<f64>, DMatrix<f64>)> {
    let size = matrix.nrows();
    let scale = matrix.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);
    let tolerance = SPECTRUM_TOLERANCE * scale;

    let asymmetry = (0..size)
        .flat_map(|i| (0..i).map(move |j| (i, j)))
        .map(|(i, j)| (matrix[(i, j)] - matrix[(j, i)]).abs())
        .fold(0.0f64, f64::max);
    if !asymmetry.is_finite() || asymmetry > tolerance {
        return Err(ReduceError::NumericalInstability {
            message: format!("covariance is not symmetric (max asymmetry {asymmetry:e})"),
        });
    }

    let EigenPairs { values, vectors } = solver.decompose(matrix)?;
    if values.len() != size || vectors.ncols() != size || vectors.nrows() != size {
        return Err(ReduceError::ShapeMismatch {
            expected: size,
            actual: values.len().min(vectors.ncols()),
        });
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(ReduceError::NumericalInstability {
            message: format!("eigenvalue {bad} is not finite"),
        });
    }
    if let Some(bad) = values.iter().find(|&&v| v < -tolerance) {
        return Err(ReduceError::NumericalInstability {
            message: format!(
                "eigenvalue {bad:e} is negative beyond tolerance {tolerance:e}; \
                 a covariance spectrum is real and non-negative"
            ),
        });
    }

    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    Ok((order, values, vectors))
}
