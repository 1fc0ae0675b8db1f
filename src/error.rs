//! Rich diagnostic error types for latent-lens.
//!
//! Each analysis defines its own error type with miette `#[diagnostic]` derives,
//! so a failed analysis reports which artifact or parameter caused it and what
//! to do about it. Errors that live next to their subsystem (emergence,
//! attribution, export, config) are re-wrapped here.

use miette::Diagnostic;
use thiserror::Error;

use crate::attribution::AttributionError;
use crate::config::ConfigError;
use crate::emergence::EmergenceError;
use crate::report::ExportError;

/// Top-level error type for latent-lens.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user. A variant aborts only the analysis that raised it.
#[derive(Debug, Error, Diagnostic)]
pub enum LensError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Emergence(#[from] EmergenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Attribution(#[from] AttributionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Artifact errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ArtifactError {
    #[error("artifact not found: {path}")]
    #[diagnostic(
        code(lens::artifact::not_found),
        help(
            "The sequence directory is missing a required file. A complete sequence \
             has metadata.json, phase3_data/latent_vectors.npy, final.png and one \
             step_NNNN.png per denoising step. Re-run the generator for this prompt."
        )
    )]
    NotFound { path: String },

    #[error("malformed artifact {path}: {message}")]
    #[diagnostic(
        code(lens::artifact::malformed),
        help(
            "The file exists but its contents are inconsistent. Check that metadata \
             fields have the right types, that `steps` is contiguous from 0, and that \
             the latent array holds exactly num_inference_steps states."
        )
    )]
    Malformed { path: String, message: String },

    #[error("I/O error reading {path}")]
    #[diagnostic(
        code(lens::artifact::io),
        help("Check file permissions and that the sequence directory is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {message}")]
    #[diagnostic(
        code(lens::artifact::decode),
        help("The image file is truncated or not a PNG. Regenerate the step images.")
    )]
    Decode { path: String, message: String },
}

impl ArtifactError {
    pub(crate) fn malformed(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(path: &std::path::Path) -> Self {
        Self::NotFound {
            path: path.display().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trajectory metric errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MetricsError {
    #[error("invalid parameter {name}: {value} (expected {expected})")]
    #[diagnostic(
        code(lens::metrics::invalid_parameter),
        help("This is a caller error. Pass a {name} within {expected}.")
    )]
    InvalidParameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Dimensionality reduction errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ReduceError {
    #[error("projection needs at least 2 samples, got {count}")]
    #[diagnostic(
        code(lens::reduce::insufficient_samples),
        help(
            "A single latent state has no direction of variation. \
             Sample two or more steps from the trajectory."
        )
    )]
    InsufficientSamples { count: usize },

    #[error("numerical instability in eigendecomposition: {message}")]
    #[diagnostic(
        code(lens::reduce::numerical_instability),
        help(
            "The covariance matrix is symmetric positive semi-definite by construction, \
             so this indicates a defect in the eigen solver or non-finite latent values. \
             Check the latent file for NaN/Inf entries."
        )
    )]
    NumericalInstability { message: String },

    #[error("sample index {index} out of range for a trajectory of {len} states")]
    #[diagnostic(
        code(lens::reduce::invalid_parameter),
        help("Sample indices must address existing latent states (0..len).")
    )]
    IndexOutOfRange { index: usize, len: usize },

    #[error("eigen solver returned {actual} components, expected at least {expected}")]
    #[diagnostic(
        code(lens::reduce::shape_mismatch),
        help("A custom EigenSolver must return one eigenpair per matrix row.")
    )]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Convenience alias for functions returning latent-lens results.
pub type LensResult<T> = std::result::Result<T, LensError>;
