//! `metadata.json`: the per-run record written by the generator.
//!
//! Field names are snake_case, matching what the generator emits, so a
//! metadata file round-trips through [`SequenceMetadata`] unchanged.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{ArtifactResult, GeneratedSequence, LatentTensorSequence, StepRecord};
use crate::error::ArtifactError;

fn default_dimension() -> u32 {
    512
}

/// Top-level `metadata.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMetadata {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    /// ISO-8601 timestamp, with or without a UTC offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub steps: Vec<StepMetadata>,
}

/// One entry of the `steps` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step: usize,
    pub timestep: i64,
    pub noise_variance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Parse an ISO-8601 timestamp as written by Python's `datetime.isoformat()`.
///
/// Offset-carrying timestamps are normalized to UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

impl SequenceMetadata {
    /// Parse `metadata.json` bytes, mapping type errors to `Malformed`.
    pub fn from_json(bytes: &[u8], path: &Path) -> ArtifactResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ArtifactError::malformed(path, e.to_string()))
    }

    /// Validate against `latents` and build the sequence.
    ///
    /// Checks: `num_inference_steps >= 1`, `steps` contiguous from 0 with one
    /// entry per inference step, finite noise variances, parseable timestamps,
    /// and exactly one latent state per step.
    pub fn into_sequence(
        self,
        latents: LatentTensorSequence,
        path: &Path,
    ) -> ArtifactResult<GeneratedSequence> {
        if self.num_inference_steps == 0 {
            return Err(ArtifactError::malformed(
                path,
                "num_inference_steps must be at least 1",
            ));
        }
        if self.steps.len() != self.num_inference_steps {
            return Err(ArtifactError::malformed(
                path,
                format!(
                    "steps has {} entries but num_inference_steps is {}",
                    self.steps.len(),
                    self.num_inference_steps
                ),
            ));
        }
        if latents.len() != self.num_inference_steps {
            return Err(ArtifactError::malformed(
                path,
                format!(
                    "latent trajectory has {} states but num_inference_steps is {} \
                     (one post-step state per step is required)",
                    latents.len(),
                    self.num_inference_steps
                ),
            ));
        }

        let created_at = match self.generated_at.as_deref() {
            Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                ArtifactError::malformed(path, format!("generated_at is not ISO-8601: {raw:?}"))
            })?),
            None => None,
        };

        let mut steps = Vec::with_capacity(self.steps.len());
        for (expected, entry) in self.steps.iter().enumerate() {
            if entry.step != expected {
                return Err(ArtifactError::malformed(
                    path,
                    format!("steps[{expected}].step is {}, expected {expected}", entry.step),
                ));
            }
            if !entry.noise_variance.is_finite() {
                return Err(ArtifactError::malformed(
                    path,
                    format!("steps[{expected}].noise_variance is not finite"),
                ));
            }
            let timestamp = match entry.timestamp.as_deref() {
                Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                    ArtifactError::malformed(
                        path,
                        format!("steps[{expected}].timestamp is not ISO-8601: {raw:?}"),
                    )
                })?),
                None => None,
            };
            steps.push(StepRecord {
                step_index: entry.step,
                timestep: entry.timestep,
                noise_variance: entry.noise_variance,
                timestamp,
            });
        }

        Ok(GeneratedSequence {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            num_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            height: self.height,
            width: self.width,
            created_at,
            steps,
            latents,
        })
    }

    /// Metadata for a run with `num_steps` steps and synthetic step records.
    ///
    /// Used by generators and fixtures that do not track scheduler details:
    /// timesteps count down from 999 and variances decay linearly.
    pub fn synthetic(prompt: &str, num_steps: usize, guidance_scale: f64, seed: u64) -> Self {
        let steps = (0..num_steps)
            .map(|step| StepMetadata {
                step,
                timestep: 999 - (step as i64 * 1000 / num_steps.max(1) as i64),
                noise_variance: 1.0 - step as f64 / num_steps.max(1) as f64,
                timestamp: None,
            })
            .collect();
        Self {
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            num_inference_steps: num_steps,
            guidance_scale,
            seed,
            height: default_dimension(),
            width: default_dimension(),
            generated_at: None,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "prompt": "a lighthouse at dusk",
        "negative_prompt": "",
        "num_inference_steps": 3,
        "guidance_scale": 7.5,
        "seed": 42,
        "height": 512,
        "width": 512,
        "generated_at": "2025-03-01T12:30:05.123456",
        "steps": [
            {"step": 0, "timestep": 981, "noise_variance": 1.02, "timestamp": "2025-03-01T12:29:58.000001"},
            {"step": 1, "timestep": 961, "noise_variance": 0.97, "timestamp": "2025-03-01T12:29:59.500000"},
            {"step": 2, "timestep": 941, "noise_variance": 0.91, "timestamp": "2025-03-01T12:30:01+00:00"}
        ],
        "extra_field": "ignored"
    }"#;

    fn latents(n: usize) -> LatentTensorSequence {
        LatentTensorSequence::from_states(vec![vec![0.0; 4]; n], &[4]).unwrap()
    }

    #[test]
    fn parses_generator_metadata() {
        let path = Path::new("seq/metadata.json");
        let meta = SequenceMetadata::from_json(SAMPLE.as_bytes(), path).unwrap();
        let seq = meta.into_sequence(latents(3), path).unwrap();
        assert_eq!(seq.prompt, "a lighthouse at dusk");
        assert_eq!(seq.num_steps, 3);
        assert_eq!(seq.seed, 42);
        assert_eq!(seq.steps()[1].timestep, 961);
        assert!(seq.created_at.is_some());
        assert!(seq.steps().iter().all(|s| s.timestamp.is_some()));
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        let path = Path::new("seq/metadata.json");
        let raw = SAMPLE.replace("\"seed\": 42", "\"seed\": \"forty-two\"");
        let err = SequenceMetadata::from_json(raw.as_bytes(), path).unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[test]
    fn latent_length_must_match_step_count() {
        let path = Path::new("seq/metadata.json");
        let meta = SequenceMetadata::from_json(SAMPLE.as_bytes(), path).unwrap();
        // An extra initial-noise state is rejected rather than silently tolerated.
        let err = meta.into_sequence(latents(4), path).unwrap_err();
        match err {
            ArtifactError::Malformed { message, .. } => assert!(message.contains("4 states")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_contiguous_steps_are_malformed() {
        let path = Path::new("seq/metadata.json");
        let mut meta = SequenceMetadata::synthetic("x", 3, 7.5, 1);
        meta.steps[2].step = 5;
        assert!(matches!(
            meta.into_sequence(latents(3), path),
            Err(ArtifactError::Malformed { .. })
        ));
    }

    #[test]
    fn synthetic_metadata_round_trips_through_json() {
        let meta = SequenceMetadata::synthetic("red fox", 4, 6.0, 9);
        let json = serde_json::to_vec(&meta).unwrap();
        let back = SequenceMetadata::from_json(&json, Path::new("m.json")).unwrap();
        assert_eq!(meta, back);
    }
}
