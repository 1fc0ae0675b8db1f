//! Export types for analysis results.
//!
//! Each analysis has a JSON summary written to `phase3_data/` of the sequence
//! directory. Field names are snake_case and map keys keep insertion order, so
//! exported files read the same way the steps and tokens were processed.

use std::collections::BTreeMap;
use std::path::Path;

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::GeneratedSequence;
use crate::attribution::StudyReport;
use crate::emergence::{ConceptScoreSeries, EmergencePoint, ScoringSource, TimelineAnalysis};
use crate::metrics::{self, ChangeMagnitudeSeries, CriticalStepSet, MetricsResult};
use crate::reduce::Projection2D;
use crate::simd::DistanceKernel;

/// Errors from writing or reading exported summaries.
#[derive(Debug, Error, Diagnostic)]
pub enum ExportError {
    #[error("I/O error on {path}")]
    #[diagnostic(
        code(lens::export::io),
        help("Check that the sequence directory is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}")]
    #[diagnostic(
        code(lens::export::json),
        help("The summary was not written by this tool or has been edited by hand.")
    )]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for export operations.
pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// Write `value` as pretty-printed JSON, creating parent directories.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> ExportResult<()> {
    let io_err = |source| ExportError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut json = serde_json::to_string_pretty(value).map_err(|source| ExportError::Json {
        path: path.display().to_string(),
        source,
    })?;
    json.push('\n');
    std::fs::write(path, json).map_err(io_err)?;
    tracing::info!(path = %path.display(), "exported");
    Ok(())
}

/// Read a JSON summary written by [`save_json`].
pub fn load_json<T: DeserializeOwned>(path: &Path) -> ExportResult<T> {
    let bytes = std::fs::read(path).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ExportError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Noise-decomposition summary: `noise_decomposition.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseDecompositionSummary {
    pub prompt: String,
    pub num_steps: usize,
    pub noise_variance: Vec<f64>,
    pub step_changes: ChangeMagnitudeSeries,
    pub critical_steps: Vec<usize>,
    pub critical_percentile: f64,
    /// `None` when there are no transitions.
    pub critical_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection2D>,
}

impl NoiseDecompositionSummary {
    /// Change magnitudes, critical steps and noise variance for `sequence`.
    pub fn compute(
        kernel: &dyn DistanceKernel,
        sequence: &GeneratedSequence,
        percentile: f64,
    ) -> MetricsResult<Self> {
        let step_changes = metrics::change_magnitudes(kernel, sequence.latents());
        let critical = metrics::identify_critical_steps(&step_changes, percentile)?;
        Ok(Self::from_parts(sequence, step_changes, critical))
    }

    pub fn from_parts(
        sequence: &GeneratedSequence,
        step_changes: ChangeMagnitudeSeries,
        critical: CriticalStepSet,
    ) -> Self {
        Self {
            prompt: sequence.prompt.clone(),
            num_steps: sequence.num_steps,
            noise_variance: metrics::noise_variance_trajectory(sequence),
            step_changes,
            critical_steps: critical.steps,
            critical_percentile: critical.percentile,
            critical_threshold: critical.threshold,
            projection: None,
        }
    }

    pub fn with_projection(mut self, projection: Projection2D) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Semantic-emergence summary: `semantic_emergence.json`.
///
/// `concepts` is a JSON object from concept to `[{step, similarity}, ...]`.
/// `scorer` names what produced the similarities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergenceSummary {
    pub scorer: ScoringSource,
    pub concepts: ConceptScoreSeries,
}

impl From<&TimelineAnalysis> for EmergenceSummary {
    fn from(timeline: &TimelineAnalysis) -> Self {
        Self {
            scorer: timeline.source.clone(),
            concepts: timeline.series.clone(),
        }
    }
}

/// Emergence points for the key concepts: `emergence_points.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencePoints {
    pub prompt: String,
    pub threshold: f64,
    /// Which scorer produced the similarities.
    pub scorer: ScoringSource,
    /// Steps with no image; never scored.
    pub skipped_steps: Vec<usize>,
    pub points: Vec<EmergencePoint>,
}

/// One successful ablation in [`AttributionSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionScore {
    pub token: String,
    pub ablated_prompt: String,
    pub divergence: f64,
}

/// One failed ablation in [`AttributionSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionFailure {
    pub token: String,
    pub ablated_prompt: String,
    pub error: String,
}

/// Token-attribution summary: `token_attribution.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSummary {
    pub original_prompt: String,
    pub tokens: Vec<String>,
    /// Token index → result, for tokens that produced a divergence.
    pub attribution_scores: BTreeMap<usize, AttributionScore>,
    /// Token index → error, for tokens that did not.
    #[serde(default)]
    pub failures: BTreeMap<usize, AttributionFailure>,
    /// Token indices by descending divergence.
    #[serde(default)]
    pub ranking: Vec<usize>,
    #[serde(default)]
    pub succeeded: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub cancelled: bool,
}

impl From<&StudyReport> for AttributionSummary {
    fn from(report: &StudyReport) -> Self {
        let mut attribution_scores = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for r in &report.results {
            match &r.outcome {
                Ok(divergence) => {
                    attribution_scores.insert(
                        r.token_index,
                        AttributionScore {
                            token: r.token.clone(),
                            ablated_prompt: r.ablated_prompt.clone(),
                            divergence: *divergence,
                        },
                    );
                }
                Err(e) => {
                    failures.insert(
                        r.token_index,
                        AttributionFailure {
                            token: r.token.clone(),
                            ablated_prompt: r.ablated_prompt.clone(),
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
        Self {
            original_prompt: report.original_prompt.clone(),
            tokens: report.tokens.clone(),
            attribution_scores,
            failures,
            ranking: report.ranking().iter().map(|r| r.token_index).collect(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            cancelled: report.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{AblationResult, GenerationFailure};
    use tempfile::TempDir;

    fn noise_summary() -> NoiseDecompositionSummary {
        NoiseDecompositionSummary {
            prompt: "a lighthouse".into(),
            num_steps: 5,
            noise_variance: vec![1.0, 0.8, 0.55, 0.3, 0.1],
            step_changes: ChangeMagnitudeSeries::new(vec![
                0.1 + 0.2,
                1.0 / 3.0,
                std::f64::consts::PI,
                1e-17,
            ]),
            critical_steps: vec![2],
            critical_percentile: 75.0,
            critical_threshold: Some(1.0 / 3.0 + 0.7),
            projection: None,
        }
    }

    #[test]
    fn noise_summary_round_trips_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("phase3_data").join("noise_decomposition.json");
        let summary = noise_summary();
        save_json(&path, &summary).unwrap();
        let back: NoiseDecompositionSummary = load_json(&path).unwrap();
        assert_eq!(back.step_changes.values(), summary.step_changes.values());
        assert_eq!(back.critical_steps, summary.critical_steps);
        assert_eq!(back, summary);
    }

    #[test]
    fn attribution_summary_uses_string_token_keys() {
        let report = StudyReport {
            original_prompt: "red fox".into(),
            tokens: vec!["red".into(), "fox".into()],
            results: vec![
                AblationResult {
                    token_index: 0,
                    token: "red".into(),
                    ablated_prompt: "fox".into(),
                    outcome: Ok(12.5),
                },
                AblationResult {
                    token_index: 1,
                    token: "fox".into(),
                    ablated_prompt: "red".into(),
                    outcome: Err(GenerationFailure::new("device lost").into()),
                },
            ],
            cancelled: false,
        };
        let summary = AttributionSummary::from(&report);
        assert_eq!(summary.ranking, vec![0]);
        assert_eq!((summary.succeeded, summary.failed), (1, 1));

        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["attribution_scores"]["0"]["divergence"], 12.5);
        assert!(json["failures"]["1"]["error"].as_str().unwrap().contains("device lost"));

        let back: AttributionSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn attribution_summary_reads_minimal_legacy_shape() {
        let raw = r#"{
            "original_prompt": "red fox",
            "tokens": ["red", "fox"],
            "attribution_scores": {
                "0": {"token": "red", "ablated_prompt": "fox", "divergence": 3.0},
                "1": {"token": "fox", "ablated_prompt": "red", "divergence": 9.0}
            }
        }"#;
        let summary: AttributionSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.attribution_scores[&1].divergence, 9.0);
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn missing_summary_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let err = load_json::<EmergencePoints>(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }
}
