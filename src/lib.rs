// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # latent-lens
//!
//! Interpretability analyses over recorded diffusion trajectories: how the
//! latent state moves step by step, when concepts become visible in the
//! intermediate images, and which prompt tokens the final image depends on.
//!
//! ## Architecture
//!
//! - **Artifacts** (`artifact`): Sequence directories (metadata, latents, step images)
//! - **Metrics** (`metrics`): Step-change magnitudes, critical steps, noise variance
//! - **Reduction** (`reduce`): 2-D principal-component projection of sampled latents
//! - **Emergence** (`emergence`): Concept similarity timelines and emergence points
//! - **Attribution** (`attribution`): Leave-one-token-out ablation studies
//! - **SIMD acceleration** (`simd`): Runtime-dispatched AVX2/generic distance kernels
//! - **Pipeline** (`pipeline`): Runs the analyses and writes `phase3_data/*.json`
//!
//! ## Library usage
//!
//! ```no_run
//! use latent_lens::artifact::ArtifactStore;
//! use latent_lens::config::AnalysisConfig;
//! use latent_lens::pipeline::Pipeline;
//!
//! let store = ArtifactStore::load("outputs/sequence_0001").unwrap();
//! let summary = Pipeline::new(AnalysisConfig::default())
//!     .noise_decomposition(&store)
//!     .unwrap();
//! println!("critical steps: {:?}", summary.critical_steps);
//! ```

pub mod artifact;
pub mod attribution;
pub mod config;
pub mod emergence;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod reduce;
pub mod report;
pub mod simd;

pub use error::{LensError, LensResult};
