//! Analysis pipeline: runs the per-sequence analyses and writes their summaries.
//!
//! The three stages (noise decomposition, semantic emergence, token
//! attribution) are independent. Each one reads the loaded sequence, writes
//! its own JSON under `phase3_data/`, and reports a [`StageOutcome`]; a failed
//! stage never prevents the others from running.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::artifact::{ArtifactStore, ImageSource};
use crate::attribution::{
    AblationResult, AblationStudy, CancelToken, GenerationCollaborator, StudyReport,
};
use crate::config::{AnalysisConfig, ConfigResult};
use crate::emergence::{ConceptTracker, Scorer, SimilarityBackend};
use crate::error::{LensError, LensResult};
use crate::reduce::{self, EigenSolver, SymmetricEigenSolver};
use crate::report::{
    self, AttributionSummary, EmergencePoints, EmergenceSummary, NoiseDecompositionSummary,
};
use crate::simd::{self, DistanceKernel};

/// Built-in analysis stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Change magnitudes, critical steps, 2-D projection.
    NoiseDecomposition,
    /// Concept similarity timeline and emergence points.
    SemanticEmergence,
    /// Token ablation study.
    TokenAttribution,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::NoiseDecomposition,
        StageKind::SemanticEmergence,
        StageKind::TokenAttribution,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::NoiseDecomposition => "noise decomposition",
            StageKind::SemanticEmergence => "semantic emergence",
            StageKind::TokenAttribution => "token attribution",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage ended.
#[derive(Debug)]
pub enum StageOutcome {
    Succeeded { duration: Duration },
    Failed { error: LensError },
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// One stage and its outcome.
#[derive(Debug)]
pub struct PipelineStage {
    pub kind: StageKind,
    pub outcome: StageOutcome,
}

/// Outcome of every stage for one sequence.
#[derive(Debug)]
pub struct PipelineReport {
    pub sequence_dir: PathBuf,
    pub stages: Vec<PipelineStage>,
}

impl PipelineReport {
    pub fn stage(&self, kind: StageKind) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.kind == kind).map(|s| &s.outcome)
    }

    /// Whether no stage failed. Skipped stages do not count as failures.
    pub fn is_clean(&self) -> bool {
        !self
            .stages
            .iter()
            .any(|s| matches!(s.outcome, StageOutcome::Failed { .. }))
    }
}

/// External capabilities the pipeline may use.
pub struct Collaborators<'a> {
    pub similarity: Option<Box<dyn SimilarityBackend>>,
    pub fallback: Option<Box<dyn SimilarityBackend>>,
    pub generator: Option<Box<dyn GenerationCollaborator + 'a>>,
    pub cancel: CancelToken,
}

impl Collaborators<'static> {
    /// Collaborators described by `config`.
    pub fn from_config(config: &AnalysisConfig) -> ConfigResult<Self> {
        Ok(Self {
            similarity: config.similarity.backend(),
            fallback: config.emergence.fallback_scorer(),
            generator: config
                .generation
                .generator()?
                .map(|g| Box::new(g) as Box<dyn GenerationCollaborator>),
            cancel: CancelToken::new(),
        })
    }
}

/// Runs analyses over sequence directories.
pub struct Pipeline {
    config: AnalysisConfig,
    kernel: Box<dyn DistanceKernel>,
    solver: Box<dyn EigenSolver>,
}

impl Pipeline {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            kernel: simd::best_kernel(),
            solver: Box::new(SymmetricEigenSolver),
        }
    }

    /// Replace the eigen solver used for projection.
    pub fn with_solver(mut self, solver: Box<dyn EigenSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Change magnitudes, critical steps and projection; writes `noise_decomposition.json`.
    ///
    /// A projection failure is logged and leaves `projection` empty; it does
    /// not fail the stage.
    pub fn noise_decomposition(
        &self,
        store: &ArtifactStore,
    ) -> LensResult<NoiseDecompositionSummary> {
        let sequence = store.sequence();
        let mut summary = NoiseDecompositionSummary::compute(
            self.kernel.as_ref(),
            sequence,
            self.config.noise.percentile,
        )?;
        tracing::info!(
            transitions = summary.step_changes.len(),
            critical = summary.critical_steps.len(),
            threshold = ?summary.critical_threshold,
            "noise decomposition"
        );

        let samples =
            reduce::sample_step_indices(sequence.num_steps, self.config.noise.sample_steps);
        match reduce::project(
            self.kernel.as_ref(),
            sequence.latents(),
            &samples,
            self.solver.as_ref(),
        ) {
            Ok(projection) => summary = summary.with_projection(projection),
            Err(e) => tracing::warn!(error = %e, "projection skipped"),
        }

        report::save_json(&store.layout().noise_summary(), &summary)?;
        Ok(summary)
    }

    /// Similarity timeline and key-concept emergence points; writes
    /// `semantic_emergence.json` and `emergence_points.json`.
    pub fn semantic_emergence(
        &self,
        store: &ArtifactStore,
        similarity: Option<Box<dyn SimilarityBackend>>,
        fallback: Option<Box<dyn SimilarityBackend>>,
    ) -> LensResult<(EmergenceSummary, EmergencePoints)> {
        let sequence = store.sequence();
        let cfg = &self.config.emergence;
        let tracker = ConceptTracker::new(Scorer::resolve(similarity, fallback)?);

        let timeline = tracker.analyze_timeline(sequence, store, cfg.timeline_concepts())?;
        let key_concepts = cfg.key_concepts_for(&sequence.prompt);
        let points =
            tracker.find_emergence_points(sequence, store, &key_concepts, cfg.threshold)?;

        let summary = EmergenceSummary::from(&timeline);
        let points = EmergencePoints {
            prompt: sequence.prompt.clone(),
            threshold: cfg.threshold,
            scorer: timeline.source.clone(),
            skipped_steps: timeline.skipped_steps.clone(),
            points,
        };
        report::save_json(&store.layout().emergence_summary(), &summary)?;
        report::save_json(&store.layout().emergence_points(), &points)?;
        Ok((summary, points))
    }

    /// Ablation study; writes `token_attribution.json` after every token and
    /// once more at the end.
    pub fn token_attribution(
        &self,
        store: &ArtifactStore,
        generator: &mut dyn GenerationCollaborator,
        cancel: &CancelToken,
    ) -> LensResult<AttributionSummary> {
        let sequence = store.sequence();
        let original = store.final_image()?;
        let summary_path = store.layout().attribution_summary();

        let mut partial = StudyReport {
            original_prompt: sequence.prompt.clone(),
            tokens: sequence.tokens(),
            results: Vec::new(),
            cancelled: false,
        };
        let checkpoint = |result: &AblationResult| {
            partial.results.push(result.clone());
            if let Err(e) = report::save_json(&summary_path, &AttributionSummary::from(&partial)) {
                tracing::warn!(error = %e, "could not checkpoint attribution results");
            }
        };

        let study = AblationStudy::new(generator)
            .with_output_dirs(
                store.layout().clone(),
                self.config.generation.output_subdir.clone(),
            )
            .on_result(checkpoint)
            .run(sequence, original.pixels(), cancel);

        let summary = AttributionSummary::from(&study);
        report::save_json(&summary_path, &summary)?;
        Ok(summary)
    }

    /// Load the sequence in `dir` and run every stage.
    ///
    /// Fails only when the sequence cannot be loaded; stage errors are
    /// reported in the returned [`PipelineReport`].
    pub fn run(&self, dir: &Path, collaborators: Collaborators<'_>) -> LensResult<PipelineReport> {
        let store = ArtifactStore::load(dir)?;
        let Collaborators {
            similarity,
            fallback,
            mut generator,
            cancel,
        } = collaborators;

        let mut stages = Vec::with_capacity(StageKind::ALL.len());

        stages.push(PipelineStage {
            kind: StageKind::NoiseDecomposition,
            outcome: timed(StageKind::NoiseDecomposition, || {
                self.noise_decomposition(&store).map(|_| ())
            }),
        });

        let emergence = if similarity.is_none() && fallback.is_none() {
            skipped(
                StageKind::SemanticEmergence,
                "no similarity backend configured and fallback disabled",
            )
        } else {
            timed(StageKind::SemanticEmergence, || {
                self.semantic_emergence(&store, similarity, fallback).map(|_| ())
            })
        };
        stages.push(PipelineStage {
            kind: StageKind::SemanticEmergence,
            outcome: emergence,
        });

        let attribution = match generator.as_deref_mut() {
            None => skipped(StageKind::TokenAttribution, "no generation command configured"),
            Some(generator) => timed(StageKind::TokenAttribution, || {
                self.token_attribution(&store, generator, &cancel).map(|_| ())
            }),
        };
        stages.push(PipelineStage {
            kind: StageKind::TokenAttribution,
            outcome: attribution,
        });

        Ok(PipelineReport {
            sequence_dir: store.root().to_path_buf(),
            stages,
        })
    }
}

fn timed(kind: StageKind, stage: impl FnOnce() -> LensResult<()>) -> StageOutcome {
    tracing::info!(stage = %kind, "stage started");
    let started = Instant::now();
    match stage() {
        Ok(()) => {
            let duration = started.elapsed();
            tracing::info!(stage = %kind, secs = duration.as_secs_f64(), "stage succeeded");
            StageOutcome::Succeeded { duration }
        }
        Err(error) => {
            tracing::error!(stage = %kind, error = %error, "stage failed");
            StageOutcome::Failed { error }
        }
    }
}

fn skipped(kind: StageKind, reason: &str) -> StageOutcome {
    tracing::info!(stage = %kind, reason, "stage skipped");
    StageOutcome::Skipped {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{SequenceLayout, SequenceMetadata};
    use crate::emergence::{EmergenceError, FnScorer, SeededFallbackScorer};
    use crate::reduce::{EigenPairs, ReduceResult};
    use nalgebra::DMatrix;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn write_sequence(dir: &Path, prompt: &str, steps: usize) {
        let layout = SequenceLayout::new(dir);
        std::fs::create_dir_all(&layout.analysis_dir).unwrap();
        let meta = SequenceMetadata::synthetic(prompt, steps, 7.5, 5);
        std::fs::write(&layout.metadata, serde_json::to_vec(&meta).unwrap()).unwrap();
        let latents =
            Array2::<f32>::from_shape_fn((steps, 16), |(s, i)| (s * s + i) as f32 * 0.1);
        ndarray_npy::write_npy(&layout.latents, &latents).unwrap();
        for step in 0..steps {
            image::RgbImage::from_pixel(4, 4, image::Rgb([step as u8, 0, 0]))
                .save(layout.step_image(step))
                .unwrap();
        }
        image::RgbImage::new(4, 4).save(&layout.final_image).unwrap();
    }

    struct BrokenSolver;

    impl EigenSolver for BrokenSolver {
        fn decompose(&self, m: &DMatrix<f64>) -> ReduceResult<EigenPairs> {
            Ok(EigenPairs {
                values: vec![f64::NAN; m.nrows()],
                vectors: DMatrix::identity(m.nrows(), m.nrows()),
            })
        }
    }

    fn no_collaborators() -> Collaborators<'static> {
        Collaborators {
            similarity: None,
            fallback: None,
            generator: None,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn stages_without_collaborators_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "a harbor", 6);

        let report = Pipeline::new(AnalysisConfig::default())
            .run(dir.path(), no_collaborators())
            .unwrap();
        assert!(report.is_clean());
        assert!(report.stage(StageKind::NoiseDecomposition).unwrap().is_success());
        assert!(matches!(
            report.stage(StageKind::SemanticEmergence),
            Some(StageOutcome::Skipped { .. })
        ));
        assert!(matches!(
            report.stage(StageKind::TokenAttribution),
            Some(StageOutcome::Skipped { .. })
        ));
        assert!(SequenceLayout::new(dir.path()).noise_summary().is_file());
    }

    #[test]
    fn failing_stage_does_not_stop_the_others() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "a harbor", 4);
        let offline = FnScorer::new("unused", |_, _| 0.0);
        struct Offline<T>(T);
        impl<T: SimilarityBackend> SimilarityBackend for Offline<T> {
            fn name(&self) -> &str {
                "offline"
            }
            fn is_available(&self) -> bool {
                false
            }
            fn score(
                &self,
                image: &crate::artifact::StepImage,
                concept: &str,
            ) -> crate::emergence::EmergenceResult<f64> {
                self.0.score(image, concept)
            }
        }

        let mut collaborators = no_collaborators();
        collaborators.similarity = Some(Box::new(Offline(offline)));
        let report = Pipeline::new(AnalysisConfig::default())
            .run(dir.path(), collaborators)
            .unwrap();

        assert!(!report.is_clean());
        assert!(matches!(
            report.stage(StageKind::SemanticEmergence),
            Some(StageOutcome::Failed {
                error: LensError::Emergence(EmergenceError::BackendUnavailable { .. })
            })
        ));
        assert!(report.stage(StageKind::NoiseDecomposition).unwrap().is_success());
    }

    #[test]
    fn projection_failure_leaves_noise_stage_intact() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "a harbor", 5);
        let store = ArtifactStore::load(dir.path()).unwrap();

        let summary = Pipeline::new(AnalysisConfig::default())
            .with_solver(Box::new(BrokenSolver))
            .noise_decomposition(&store)
            .unwrap();
        assert!(summary.projection.is_none());
        assert_eq!(summary.step_changes.len(), 4);
    }

    #[test]
    fn emergence_with_fallback_is_marked_as_such() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "a harbor", 5);
        let store = ArtifactStore::load(dir.path()).unwrap();

        let (summary, points) = Pipeline::new(AnalysisConfig::default())
            .semantic_emergence(&store, None, Some(Box::new(SeededFallbackScorer::new(3))))
            .unwrap();
        assert!(points.scorer.is_fallback());
        assert!(summary.scorer.is_fallback());
        assert_eq!(summary.concepts.get("a harbor").unwrap().len(), 5);
        assert_eq!(points.points.len(), 3);

        let path = SequenceLayout::new(dir.path()).emergence_summary();
        let on_disk: EmergenceSummary = report::load_json(&path).unwrap();
        assert_eq!(on_disk, summary);
        let raw: serde_json::Value = report::load_json(&path).unwrap();
        assert_eq!(raw["scorer"]["kind"], "fallback");
        assert!(raw["concepts"]["a harbor"].is_array());
    }

    #[test]
    fn default_config_never_scores_with_the_fallback() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "a harbor", 4);
        let store = ArtifactStore::load(dir.path()).unwrap();

        let config = AnalysisConfig::default();
        let collaborators = Collaborators::from_config(&config).unwrap();
        assert!(collaborators.similarity.is_none());
        assert!(collaborators.fallback.is_none());

        let err = Pipeline::new(config)
            .semantic_emergence(&store, collaborators.similarity, collaborators.fallback)
            .unwrap_err();
        assert!(matches!(
            err,
            LensError::Emergence(EmergenceError::BackendUnavailable { .. })
        ));
        assert!(!SequenceLayout::new(dir.path()).emergence_summary().exists());
    }

    #[test]
    fn unreadable_sequence_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let err = Pipeline::new(AnalysisConfig::default())
            .run(&dir.path().join("missing"), no_collaborators())
            .unwrap_err();
        assert!(matches!(err, LensError::Artifact(_)));
    }
}
