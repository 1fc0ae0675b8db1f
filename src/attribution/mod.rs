//! Token attribution by ablation.
//!
//! For each whitespace token of the original prompt, the study asks a
//! [`GenerationCollaborator`] to regenerate the image with that token removed
//! (same seed, step count and guidance scale), then measures the mean squared
//! pixel difference from the original final image. Larger divergence means
//! the token mattered more.
//!
//! Every token gets an [`AblationResult`]: a generation failure or an
//! incomparable image is recorded in that token's outcome and the study moves
//! on. A [`CancelToken`] stops the study between tokens, keeping what was
//! already produced.

pub mod command;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbImage;
use miette::Diagnostic;
use thiserror::Error;

use crate::artifact::{GeneratedSequence, SequenceLayout, SequenceMetadata, tokenize};

pub use command::CommandGenerator;

/// Prompt used when removing a token leaves nothing behind.
pub const ABLATION_FALLBACK_PROMPT: &str = "image";

/// A failed call into the generation collaborator.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("generation failed: {message}")]
#[diagnostic(
    code(lens::attribution::generation_failure),
    help(
        "The generator could not produce an image for this prompt (device error, \
         resource exhaustion or an invalid prompt). Only this token is affected."
    )
)]
pub struct GenerationFailure {
    pub message: String,
}

impl GenerationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Why a single token's ablation produced no divergence.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum AttributionError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Generation(#[from] GenerationFailure),

    #[error("cannot compare a {}x{} image with a {}x{} original", .ablated.0, .ablated.1, .original.0, .original.1)]
    #[diagnostic(
        code(lens::attribution::incomparable_images),
        help("Ablated images must match the original resolution. Check the generator's height/width.")
    )]
    IncomparableImages {
        original: (u32, u32),
        ablated: (u32, u32),
    },
}

/// Per-token outcome: the divergence, or why there is none.
pub type AblationOutcome = std::result::Result<f64, AttributionError>;

/// What to generate. Only `prompt` varies across an ablation study.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    /// Where a collaborator that writes a sequence directory should put it.
    pub output_dir: Option<PathBuf>,
}

/// What a generation produced.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub final_image: RgbImage,
    /// Per-step images held in memory. Collaborators that write a sequence
    /// directory leave this empty; the images are under `output_dir`.
    pub step_images: Vec<RgbImage>,
    pub metadata: Option<SequenceMetadata>,
    pub output_dir: Option<PathBuf>,
}

impl GenerationOutput {
    /// Output consisting of just a final image.
    pub fn from_final(final_image: RgbImage) -> Self {
        Self {
            final_image,
            step_images: Vec::new(),
            metadata: None,
            output_dir: None,
        }
    }
}

/// The external image generator.
///
/// `&mut self` reflects that a generator holds a device exclusively; calls
/// are never issued concurrently.
pub trait GenerationCollaborator {
    fn name(&self) -> &str;

    fn generate(
        &mut self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationOutput, GenerationFailure>;
}

/// Cooperative stop signal, checked between tokens.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The shared flag, for signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Remove token `index` and rejoin with single spaces.
///
/// An empty result becomes [`ABLATION_FALLBACK_PROMPT`].
pub fn ablate_prompt(tokens: &[String], index: usize) -> String {
    let kept: Vec<&str> = tokens
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != index)
        .map(|(_, t)| t.as_str())
        .collect();
    let prompt = kept.join(" ");
    if prompt.trim().is_empty() {
        ABLATION_FALLBACK_PROMPT.to_string()
    } else {
        prompt
    }
}

/// Mean squared difference over every channel of every pixel.
///
/// Images must have the same dimensions. Two empty images have divergence 0.
pub fn image_mse(original: &RgbImage, ablated: &RgbImage) -> AblationOutcome {
    if original.dimensions() != ablated.dimensions() {
        return Err(AttributionError::IncomparableImages {
            original: original.dimensions(),
            ablated: ablated.dimensions(),
        });
    }
    let a = original.as_raw();
    let b = ablated.as_raw();
    if a.is_empty() {
        return Ok(0.0);
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    Ok(sum / a.len() as f64)
}

/// One token's ablation.
#[derive(Debug, Clone)]
pub struct AblationResult {
    pub token_index: usize,
    pub token: String,
    pub ablated_prompt: String,
    pub outcome: AblationOutcome,
}

impl AblationResult {
    pub fn divergence(&self) -> Option<f64> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&AttributionError> {
        self.outcome.as_ref().err()
    }
}

/// Everything a study produced, including partial results after cancellation.
#[derive(Debug, Clone)]
pub struct StudyReport {
    pub original_prompt: String,
    pub tokens: Vec<String>,
    /// One entry per processed token, in prompt order.
    pub results: Vec<AblationResult>,
    /// Whether the study stopped before processing every token.
    pub cancelled: bool,
}

impl StudyReport {
    /// Successful results by descending divergence; ties keep prompt order.
    pub fn ranking(&self) -> Vec<&AblationResult> {
        let mut ranked: Vec<&AblationResult> =
            self.results.iter().filter(|r| r.outcome.is_ok()).collect();
        ranked.sort_by(|a, b| {
            let (da, db) = (a.divergence().unwrap_or(0.0), b.divergence().unwrap_or(0.0));
            db.total_cmp(&da)
        });
        ranked
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Whether every token was processed.
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.tokens.len()
    }
}

/// Where per-token generations are written.
#[derive(Debug, Clone)]
struct RunDirs {
    layout: SequenceLayout,
    subdir: String,
}

/// Drives one ablation study against a generator.
pub struct AblationStudy<'a> {
    generator: &'a mut dyn GenerationCollaborator,
    run_dirs: Option<RunDirs>,
    observer: Option<Box<dyn FnMut(&AblationResult) + 'a>>,
}

impl<'a> AblationStudy<'a> {
    pub fn new(generator: &'a mut dyn GenerationCollaborator) -> Self {
        Self {
            generator,
            run_dirs: None,
            observer: None,
        }
    }

    /// Ask the generator to write token `i`'s run under
    /// `<sequence>/<subdir>/ablation_token{i}_{token}`.
    pub fn with_output_dirs(mut self, layout: SequenceLayout, subdir: impl Into<String>) -> Self {
        self.run_dirs = Some(RunDirs {
            layout,
            subdir: subdir.into(),
        });
        self
    }

    /// Call `observer` with each result as soon as it is produced.
    pub fn on_result(mut self, observer: impl FnMut(&AblationResult) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Ablate every token of `sequence.prompt` in order.
    ///
    /// Never fails as a whole: per-token problems land in that token's outcome.
    pub fn run(
        &mut self,
        sequence: &GeneratedSequence,
        original_final: &RgbImage,
        cancel: &CancelToken,
    ) -> StudyReport {
        let tokens = tokenize(&sequence.prompt);
        tracing::info!(
            generator = self.generator.name(),
            tokens = tokens.len(),
            seed = sequence.seed,
            steps = sequence.num_steps,
            "starting ablation study"
        );

        let mut results = Vec::with_capacity(tokens.len());
        let mut cancelled = false;
        for (token_index, token) in tokens.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(
                    completed = results.len(),
                    remaining = tokens.len() - token_index,
                    "ablation study cancelled; keeping partial results"
                );
                cancelled = true;
                break;
            }

            let ablated_prompt = ablate_prompt(&tokens, token_index);
            let request = GenerationRequest {
                prompt: ablated_prompt.clone(),
                steps: sequence.num_steps,
                guidance_scale: sequence.guidance_scale,
                seed: sequence.seed,
                output_dir: self
                    .run_dirs
                    .as_ref()
                    .map(|d| d.layout.ablation_run(&d.subdir, token_index, token)),
            };

            tracing::info!(
                token_index,
                token = %token,
                ablated_prompt = %ablated_prompt,
                "ablating token"
            );
            let outcome = match self.generator.generate(&request) {
                Ok(output) => image_mse(original_final, &output.final_image),
                Err(failure) => Err(failure.into()),
            };
            match &outcome {
                Ok(divergence) => tracing::info!(token_index, divergence, "token divergence"),
                Err(e) => tracing::warn!(token_index, error = %e, "ablation failed; continuing"),
            }

            let result = AblationResult {
                token_index,
                token: token.clone(),
                ablated_prompt,
                outcome,
            };
            if let Some(observer) = self.observer.as_mut() {
                observer(&result);
            }
            results.push(result);
        }

        let report = StudyReport {
            original_prompt: sequence.prompt.clone(),
            tokens,
            results,
            cancelled,
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "ablation study finished"
        );
        report
    }
}
