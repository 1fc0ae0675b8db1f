//! Artifact store: generated diffusion sequences on disk.
//!
//! A sequence directory is the output of one completed generation run:
//!
//! - [`SequenceMetadata`]: `metadata.json`, prompt, sampler settings, per-step records
//! - [`LatentTensorSequence`]: `phase3_data/latent_vectors.npy`, one latent state per step
//! - [`StepImage`]: `step_NNNN.png` per step plus `final.png`
//!
//! [`ArtifactStore::load`] reads and validates everything except image pixels,
//! which are decoded lazily through the [`ImageSource`] trait.

pub mod latents;
pub mod layout;
pub mod metadata;
pub mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use image::RgbImage;
use ndarray::{Array2, ArrayView2};

use crate::error::ArtifactError;

pub use layout::SequenceLayout;
pub use metadata::{SequenceMetadata, StepMetadata};
pub use store::ArtifactStore;

/// Result type for artifact operations.
pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

/// Split a prompt into attribution tokens.
///
/// Whitespace-based; token order is the attribution index everywhere in the crate.
pub fn tokenize(prompt: &str) -> Vec<String> {
    prompt.split_whitespace().map(str::to_string).collect()
}

/// One denoising iteration as recorded by the sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Position in the trajectory, contiguous from 0.
    pub step_index: usize,
    /// Scheduler timestep for this iteration.
    pub timestep: i64,
    /// Standard deviation of the latent after this step, as recorded by the sampler.
    pub noise_variance: f64,
    /// When the step completed, if recorded.
    pub timestamp: Option<NaiveDateTime>,
}

/// Immutable record of a completed generation run.
///
/// Owns its step records and latent trajectory. Images are owned by the
/// [`ArtifactStore`] (or another [`ImageSource`]) and addressed by step index.
#[derive(Debug, Clone)]
pub struct GeneratedSequence {
    pub prompt: String,
    pub negative_prompt: String,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub height: u32,
    pub width: u32,
    pub created_at: Option<NaiveDateTime>,
    steps: Vec<StepRecord>,
    latents: LatentTensorSequence,
}

impl GeneratedSequence {
    /// Validate `metadata` against `latents` and assemble a sequence.
    ///
    /// Same checks as [`ArtifactStore::load`]: contiguous steps, one latent
    /// state per step, well-formed timestamps.
    pub fn from_metadata(
        metadata: SequenceMetadata,
        latents: LatentTensorSequence,
    ) -> ArtifactResult<Self> {
        metadata.into_sequence(latents, Path::new("<memory>/metadata.json"))
    }

    /// Per-step records ordered by `step_index`.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// The latent trajectory, one state per step.
    pub fn latents(&self) -> &LatentTensorSequence {
        &self.latents
    }

    /// Prompt tokens in attribution order.
    pub fn tokens(&self) -> Vec<String> {
        tokenize(&self.prompt)
    }
}

/// Ordered sequence of fixed-shape latent states.
///
/// Each state is stored flattened as one row of a standard-layout matrix;
/// `state_shape` keeps the original per-state dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentTensorSequence {
    states: Array2<f32>,
    state_shape: Vec<usize>,
}

impl LatentTensorSequence {
    /// Build from a dense array whose first axis indexes states.
    pub fn from_array(array: ndarray::ArrayD<f32>) -> Result<Self, String> {
        let shape = array.shape().to_vec();
        let Some((&count, state_shape)) = shape.split_first() else {
            return Err("latent array is zero-dimensional".into());
        };
        let state_len: usize = state_shape.iter().product();
        let flat: Vec<f32> = array.iter().copied().collect();
        let states = Array2::from_shape_vec((count, state_len), flat)
            .map_err(|e| format!("cannot flatten latent array of shape {shape:?}: {e}"))?;
        Ok(Self {
            states,
            state_shape: state_shape.to_vec(),
        })
    }

    /// Build from individually flattened states sharing `state_shape`.
    pub fn from_states(states: Vec<Vec<f32>>, state_shape: &[usize]) -> Result<Self, String> {
        let state_len: usize = state_shape.iter().product();
        if let Some((i, bad)) = states.iter().enumerate().find(|(_, s)| s.len() != state_len) {
            return Err(format!(
                "state {i} has {} elements, expected {state_len} for shape {state_shape:?}",
                bad.len()
            ));
        }
        let count = states.len();
        let flat: Vec<f32> = states.into_iter().flatten().collect();
        let states = Array2::from_shape_vec((count, state_len), flat)
            .map_err(|e| format!("cannot stack latent states: {e}"))?;
        Ok(Self {
            states,
            state_shape: state_shape.to_vec(),
        })
    }

    /// Number of latent states.
    pub fn len(&self) -> usize {
        self.states.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single state (without the leading state axis).
    pub fn state_shape(&self) -> &[usize] {
        &self.state_shape
    }

    /// Number of elements in one flattened state.
    pub fn state_len(&self) -> usize {
        self.states.ncols()
    }

    /// Flattened view of state `index`.
    ///
    /// Panics if `index >= len()`.
    pub fn state(&self, index: usize) -> &[f32] {
        let d = self.state_len();
        let flat = self
            .states
            .as_slice()
            .expect("latent states are stored in standard layout");
        &flat[index * d..(index + 1) * d]
    }

    /// All states as a `(len, state_len)` matrix view.
    pub fn as_matrix(&self) -> ArrayView2<'_, f32> {
        self.states.view()
    }
}

/// A decoded RGB image tied to its place in a sequence.
#[derive(Debug, Clone)]
pub struct StepImage {
    step: Option<usize>,
    path: Option<PathBuf>,
    pixels: RgbImage,
}

impl StepImage {
    /// The image produced at denoising step `step`.
    pub fn for_step(step: usize, pixels: RgbImage) -> Self {
        Self {
            step: Some(step),
            path: None,
            pixels,
        }
    }

    /// The completed output of a run.
    pub fn final_output(pixels: RgbImage) -> Self {
        Self {
            step: None,
            path: None,
            pixels,
        }
    }

    /// Attach the file this image was decoded from.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Step index, or `None` for a final image.
    pub fn step(&self) -> Option<usize> {
        self.step
    }

    /// Source file, if the image came from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// `(width, height)` in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Access to the images of one sequence.
///
/// Decoding is on demand: callers ask whether an image exists before paying
/// for it, and a missing image is a `NotFound` error rather than a blank frame.
pub trait ImageSource {
    /// Whether an image exists for step `step`.
    fn has_step_image(&self, step: usize) -> bool;

    /// Decode the image for step `step`.
    fn step_image(&self, step: usize) -> ArtifactResult<StepImage>;

    /// Decode the completed output image.
    fn final_image(&self) -> ArtifactResult<StepImage>;
}

/// Images held in memory, for freshly generated output and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryImages {
    steps: BTreeMap<usize, RgbImage>,
    final_image: Option<RgbImage>,
}

impl InMemoryImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the image for `step`.
    pub fn with_step(mut self, step: usize, pixels: RgbImage) -> Self {
        self.steps.insert(step, pixels);
        self
    }

    /// Set the final image.
    pub fn with_final(mut self, pixels: RgbImage) -> Self {
        self.final_image = Some(pixels);
        self
    }
}

impl ImageSource for InMemoryImages {
    fn has_step_image(&self, step: usize) -> bool {
        self.steps.contains_key(&step)
    }

    fn step_image(&self, step: usize) -> ArtifactResult<StepImage> {
        self.steps
            .get(&step)
            .map(|px| StepImage::for_step(step, px.clone()))
            .ok_or_else(|| ArtifactError::NotFound {
                path: format!("<memory>/{}", SequenceLayout::step_image_name(step)),
            })
    }

    fn final_image(&self) -> ArtifactResult<StepImage> {
        self.final_image
            .as_ref()
            .map(|px| StepImage::final_output(px.clone()))
            .ok_or_else(|| ArtifactError::NotFound {
                path: format!("<memory>/{}", layout::FINAL_IMAGE),
            })
    }
}
