//! Similarity backends and scorer resolution.
//!
//! A backend scores an image against a text concept in `[0, 1]`. Whether the
//! configured backend is usable is decided once, up front, by
//! [`Scorer::resolve`]: an unavailable backend is replaced by an explicit
//! fallback or the analysis fails before any scoring happens.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{EmergenceError, EmergenceResult};
use crate::artifact::StepImage;

/// An image/text similarity capability.
pub trait SimilarityBackend: Send + Sync {
    /// Human-readable backend name used in logs and exports.
    fn name(&self) -> &str;

    /// Whether the backend can serve requests right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Similarity of `image` to `concept`, expected in `[0, 1]`.
    fn score(&self, image: &StepImage, concept: &str) -> EmergenceResult<f64>;
}

/// Which implementation produced a set of scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ScoringSource {
    Backend(String),
    Fallback(String),
}

impl ScoringSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

impl fmt::Display for ScoringSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(name) => write!(f, "{name}"),
            Self::Fallback(name) => write!(f, "{name} (fallback)"),
        }
    }
}

/// The similarity implementation chosen for one analysis run.
pub struct Scorer {
    backend: Box<dyn SimilarityBackend>,
    source: ScoringSource,
}

impl Scorer {
    /// Pick the backend to score with.
    ///
    /// An available `backend` wins. Otherwise `fallback` is used and the
    /// substitution is logged and recorded in [`Scorer::source`]. With neither
    /// usable, fails with `BackendUnavailable`.
    pub fn resolve(
        backend: Option<Box<dyn SimilarityBackend>>,
        fallback: Option<Box<dyn SimilarityBackend>>,
    ) -> EmergenceResult<Self> {
        let unavailable = match backend {
            Some(b) if b.is_available() => {
                let source = ScoringSource::Backend(b.name().to_string());
                tracing::info!(backend = b.name(), "similarity backend available");
                return Ok(Self { backend: b, source });
            }
            Some(b) => b.name().to_string(),
            None => "none configured".to_string(),
        };

        match fallback {
            Some(f) => {
                tracing::warn!(
                    backend = %unavailable,
                    fallback = f.name(),
                    "similarity backend unavailable; scoring with fallback"
                );
                let source = ScoringSource::Fallback(f.name().to_string());
                Ok(Self { backend: f, source })
            }
            None => Err(EmergenceError::BackendUnavailable {
                backend: unavailable,
            }),
        }
    }

    /// Use `backend` directly, without an availability probe.
    pub fn direct(backend: Box<dyn SimilarityBackend>) -> Self {
        let source = ScoringSource::Backend(backend.name().to_string());
        Self { backend, source }
    }

    pub fn source(&self) -> &ScoringSource {
        &self.source
    }

    /// Score and validate: the result must be finite and within `[0, 1]`.
    pub fn score(&self, image: &StepImage, concept: &str) -> EmergenceResult<f64> {
        let value = self.backend.score(image, concept)?;
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(EmergenceError::Scoring {
                backend: self.backend.name().to_string(),
                concept: concept.to_string(),
                step: image.step(),
                value,
            });
        }
        Ok(value)
    }
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scorer").field("source", &self.source).finish()
    }
}

/// Adapts a closure into a backend.
pub struct FnScorer<F> {
    name: String,
    f: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&StepImage, &str) -> f64 + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> SimilarityBackend for FnScorer<F>
where
    F: Fn(&StepImage, &str) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, image: &StepImage, concept: &str) -> EmergenceResult<f64> {
        Ok((self.f)(image, concept))
    }
}

/// Deterministic pseudo-random similarity in `[0, 1)`.
///
/// The score depends only on the seed, the concept text and the step index,
/// so two runs over the same sequence agree exactly. It carries no semantic
/// signal and exists so the pipeline can run without a vision model.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededFallbackScorer {
    seed: u64,
}

impl SeededFallbackScorer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn mix(&self, concept: &str, step: Option<usize>) -> u64 {
        // FNV-1a over seed, concept and step; stable across builds.
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let step_bytes = step.map_or(u64::MAX, |s| s as u64).to_le_bytes();
        self.seed
            .to_le_bytes()
            .iter()
            .chain(concept.as_bytes())
            .chain(step_bytes.iter())
            .fold(OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(PRIME))
    }
}

impl SimilarityBackend for SeededFallbackScorer {
    fn name(&self) -> &str {
        "seeded-fallback"
    }

    fn score(&self, image: &StepImage, concept: &str) -> EmergenceResult<f64> {
        let mut rng = StdRng::seed_from_u64(self.mix(concept, image.step()));
        Ok(rng.gen_range(0.0..1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    struct Offline;

    impl SimilarityBackend for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        fn is_available(&self) -> bool {
            false
        }

        fn score(&self, _: &StepImage, _: &str) -> EmergenceResult<f64> {
            panic!("an unavailable backend must never be called");
        }
    }

    fn img(step: usize) -> StepImage {
        StepImage::for_step(step, RgbImage::new(1, 1))
    }

    #[test]
    fn unavailable_backend_without_fallback_fails_up_front() {
        let err = Scorer::resolve(Some(Box::new(Offline)), None).unwrap_err();
        assert!(matches!(err, EmergenceError::BackendUnavailable { ref backend } if backend == "offline"));
        assert!(Scorer::resolve(None, None).is_err());
    }

    #[test]
    fn unavailable_backend_switches_to_recorded_fallback() {
        let scorer = Scorer::resolve(
            Some(Box::new(Offline)),
            Some(Box::new(SeededFallbackScorer::new(1))),
        )
        .unwrap();
        assert_eq!(
            scorer.source(),
            &ScoringSource::Fallback("seeded-fallback".into())
        );
        let s = scorer.score(&img(0), "a cat").unwrap();
        assert!((0.0..1.0).contains(&s));
    }

    #[test]
    fn available_backend_is_preferred() {
        let scorer = Scorer::resolve(
            Some(Box::new(FnScorer::new("const", |_, _| 0.25))),
            Some(Box::new(SeededFallbackScorer::new(1))),
        )
        .unwrap();
        assert_eq!(scorer.source(), &ScoringSource::Backend("const".into()));
        assert!(!scorer.source().is_fallback());
        assert_eq!(scorer.score(&img(3), "x").unwrap(), 0.25);
    }

    #[test]
    fn out_of_range_scores_are_rejected() {
        for bad in [-0.2, 1.5, f64::NAN] {
            let scorer = Scorer::direct(Box::new(FnScorer::new("bad", move |_, _| bad)));
            assert!(matches!(
                scorer.score(&img(2), "x"),
                Err(EmergenceError::Scoring { step: Some(2), .. })
            ));
        }
    }

    #[test]
    fn seeded_fallback_is_deterministic() {
        let a = SeededFallbackScorer::new(7);
        let b = SeededFallbackScorer::new(7);
        let c = SeededFallbackScorer::new(8);
        let sa = a.score(&img(4), "lighthouse").unwrap();
        assert_eq!(sa, b.score(&img(4), "lighthouse").unwrap());
        assert_ne!(sa, c.score(&img(4), "lighthouse").unwrap());
        assert_ne!(sa, a.score(&img(5), "lighthouse").unwrap());
    }
}
