//! Concept emergence: when does a text concept become recognizable?
//!
//! [`ConceptTracker`] scores step images against concepts through a resolved
//! [`Scorer`] and finds the first step whose similarity reaches a threshold.
//! Steps are visited in increasing index order. Steps without an image are
//! skipped, never zero-filled, and reported back in [`TimelineAnalysis::skipped_steps`].

pub mod backend;
pub mod http;

use std::fmt;

use miette::Diagnostic;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::artifact::{GeneratedSequence, ImageSource, tokenize};
use crate::error::ArtifactError;

pub use backend::{FnScorer, Scorer, ScoringSource, SeededFallbackScorer, SimilarityBackend};
pub use http::HttpSimilarityBackend;

/// Default similarity at which a concept counts as emerged.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Generic concepts always tracked by the default policy.
pub const GENERIC_CONCEPTS: [&str; 3] = ["abstract shapes", "recognizable objects", "clear details"];

/// Errors from emergence analysis.
#[derive(Debug, Error, Diagnostic)]
pub enum EmergenceError {
    #[error("similarity backend unavailable: {backend}")]
    #[diagnostic(
        code(lens::emergence::backend_unavailable),
        help(
            "Start the similarity service, or choose an explicit fallback scorer \
             (emergence.fallback = \"seeded\" in the config). Fallback scores carry \
             no semantic signal."
        )
    )]
    BackendUnavailable { backend: String },

    #[error("similarity backend {backend} failed: {message}")]
    #[diagnostic(
        code(lens::emergence::backend),
        help("The backend was reachable at startup but a request failed. Check its logs.")
    )]
    Backend { backend: String, message: String },

    #[error("backend {backend} returned similarity {value} for {concept:?} at step {step:?}, outside [0, 1]")]
    #[diagnostic(
        code(lens::emergence::scoring),
        help("Similarity backends must return finite scores in [0, 1]; rescale cosine similarity before returning it.")
    )]
    Scoring {
        backend: String,
        concept: String,
        step: Option<usize>,
        value: f64,
    },

    #[error("invalid parameter {name}: {value} (expected {expected})")]
    #[diagnostic(
        code(lens::emergence::invalid_parameter),
        help("This is a caller error. Pass a {name} within {expected}.")
    )]
    InvalidParameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Result type for emergence operations.
pub type EmergenceResult<T> = std::result::Result<T, EmergenceError>;

/// Concepts tracked when the caller supplies none.
///
/// The full prompt, each whitespace token longer than three characters, then
/// [`GENERIC_CONCEPTS`]. Duplicates keep their first position.
pub fn default_concepts(prompt: &str) -> Vec<String> {
    let mut concepts = Vec::new();
    if !prompt.trim().is_empty() {
        concepts.push(prompt.to_string());
    }
    concepts.extend(tokenize(prompt).into_iter().filter(|t| t.chars().count() > 3));
    concepts.extend(GENERIC_CONCEPTS.iter().map(|c| c.to_string()));
    dedup_preserving_order(concepts)
}

/// Concepts checked for an emergence point by default.
pub fn default_key_concepts(prompt: &str) -> Vec<String> {
    let concepts = std::iter::once(prompt.to_string())
        .filter(|p| !p.trim().is_empty())
        .chain(["recognizable objects", "clear details"].map(String::from))
        .collect();
    dedup_preserving_order(concepts)
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn check_threshold(threshold: f64) -> EmergenceResult<()> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(EmergenceError::InvalidParameter {
            name: "threshold",
            value: threshold,
            expected: "[0, 1]",
        });
    }
    Ok(())
}

/// One scored step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConceptScore {
    pub step: usize,
    pub similarity: f64,
}

/// Per-concept similarity series, in the order concepts were requested.
///
/// Serializes as a JSON object keyed by concept text; key order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConceptScoreSeries {
    entries: Vec<(String, Vec<ConceptScore>)>,
}

impl ConceptScoreSeries {
    /// An empty series for each of `concepts`.
    pub fn for_concepts(concepts: &[String]) -> Self {
        Self {
            entries: concepts.iter().map(|c| (c.clone(), Vec::new())).collect(),
        }
    }

    pub fn concepts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    /// Scores for `concept`, or `None` if it was not tracked.
    pub fn get(&self, concept: &str) -> Option<&[ConceptScore]> {
        self.entries
            .iter()
            .find(|(c, _)| c == concept)
            .map(|(_, s)| s.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ConceptScore])> {
        self.entries.iter().map(|(c, s)| (c.as_str(), s.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, index: usize, score: ConceptScore) {
        self.entries[index].1.push(score);
    }
}

impl Serialize for ConceptScoreSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (concept, scores) in &self.entries {
            map.serialize_entry(concept, scores)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ConceptScoreSeries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SeriesVisitor;

        impl<'de> Visitor<'de> for SeriesVisitor {
            type Value = ConceptScoreSeries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from concept to [{step, similarity}]")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((concept, scores)) = access.next_entry::<String, Vec<ConceptScore>>()? {
                    entries.push((concept, scores));
                }
                Ok(ConceptScoreSeries { entries })
            }
        }

        deserializer.deserialize_map(SeriesVisitor)
    }
}

/// Output of [`ConceptTracker::analyze_timeline`].
#[derive(Debug, Clone)]
pub struct TimelineAnalysis {
    pub series: ConceptScoreSeries,
    /// Steps with no image, ascending. Absent from every series.
    pub skipped_steps: Vec<usize>,
    pub source: ScoringSource,
}

/// First step at which a concept reached the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencePoint {
    pub concept: String,
    /// `None` means the concept never emerged.
    pub step: Option<usize>,
    /// Similarity at `step`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl EmergencePoint {
    pub fn emerged(&self) -> bool {
        self.step.is_some()
    }
}

/// Scores step images against concepts.
#[derive(Debug)]
pub struct ConceptTracker {
    scorer: Scorer,
}

impl ConceptTracker {
    pub fn new(scorer: Scorer) -> Self {
        Self { scorer }
    }

    pub fn source(&self) -> &ScoringSource {
        self.scorer.source()
    }

    /// Score every available step image against each concept.
    ///
    /// `concepts = None` uses [`default_concepts`] for the sequence prompt.
    /// Repeated concepts are tracked once, at their first position.
    pub fn analyze_timeline(
        &self,
        sequence: &GeneratedSequence,
        images: &dyn ImageSource,
        concepts: Option<&[String]>,
    ) -> EmergenceResult<TimelineAnalysis> {
        let concepts = match concepts {
            Some(c) => dedup_preserving_order(c.to_vec()),
            None => default_concepts(&sequence.prompt),
        };
        tracing::info!(
            concepts = concepts.len(),
            steps = sequence.num_steps,
            scorer = %self.scorer.source(),
            "analyzing emergence timeline"
        );

        let mut series = ConceptScoreSeries::for_concepts(&concepts);
        let mut skipped_steps = Vec::new();
        for step in 0..sequence.num_steps {
            if !images.has_step_image(step) {
                tracing::debug!(step, "no image for step; skipped");
                skipped_steps.push(step);
                continue;
            }
            let image = images.step_image(step)?;
            for (index, concept) in concepts.iter().enumerate() {
                let similarity = self.scorer.score(&image, concept)?;
                tracing::debug!(step, concept = %concept, similarity, "scored");
                series.push(index, ConceptScore { step, similarity });
            }
        }

        if !skipped_steps.is_empty() {
            tracing::warn!(
                skipped = skipped_steps.len(),
                "steps without images were left out of every series"
            );
        }

        Ok(TimelineAnalysis {
            series,
            skipped_steps,
            source: self.scorer.source().clone(),
        })
    }

    /// First step whose similarity to `concept` is at least `threshold`.
    ///
    /// Stops scoring at the first match.
    pub fn find_emergence_point(
        &self,
        sequence: &GeneratedSequence,
        images: &dyn ImageSource,
        concept: &str,
        threshold: f64,
    ) -> EmergenceResult<EmergencePoint> {
        check_threshold(threshold)?;

        for step in 0..sequence.num_steps {
            if !images.has_step_image(step) {
                continue;
            }
            let image = images.step_image(step)?;
            let similarity = self.scorer.score(&image, concept)?;
            if similarity >= threshold {
                tracing::info!(concept, step, similarity, "concept emerged");
                return Ok(EmergencePoint {
                    concept: concept.to_string(),
                    step: Some(step),
                    similarity: Some(similarity),
                });
            }
        }

        tracing::info!(concept, threshold, "concept never emerged");
        Ok(EmergencePoint {
            concept: concept.to_string(),
            step: None,
            similarity: None,
        })
    }

    /// [`find_emergence_point`](Self::find_emergence_point) for each concept, in order.
    pub fn find_emergence_points(
        &self,
        sequence: &GeneratedSequence,
        images: &dyn ImageSource,
        concepts: &[String],
        threshold: f64,
    ) -> EmergenceResult<Vec<EmergencePoint>> {
        check_threshold(threshold)?;
        concepts
            .iter()
            .map(|c| self.find_emergence_point(sequence, images, c, threshold))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::artifact::{InMemoryImages, LatentTensorSequence, SequenceMetadata};
    use image::RgbImage;

    fn sequence(prompt: &str, steps: usize) -> GeneratedSequence {
        let latents = LatentTensorSequence::from_states(vec![vec![0.0; 2]; steps], &[2]).unwrap();
        GeneratedSequence::from_metadata(SequenceMetadata::synthetic(prompt, steps, 7.5, 1), latents)
            .unwrap()
    }

    fn all_images(steps: usize) -> InMemoryImages {
        (0..steps).fold(InMemoryImages::new(), |acc, s| acc.with_step(s, RgbImage::new(2, 2)))
    }

    /// Returns 0.0 for steps 0..=4 and 0.9 after; counts calls and the last step seen.
    fn step_function(calls: Arc<AtomicUsize>, last: Arc<AtomicUsize>) -> Scorer {
        Scorer::direct(Box::new(FnScorer::new("step-fn", move |img, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            let step = img.step().unwrap_or(usize::MAX);
            last.store(step, Ordering::SeqCst);
            if step >= 5 { 0.9 } else { 0.0 }
        })))
    }

    #[test]
    fn default_concepts_follow_policy() {
        let concepts = default_concepts("a red lighthouse at dusk");
        assert_eq!(
            concepts,
            vec![
                "a red lighthouse at dusk",
                "lighthouse",
                "dusk",
                "abstract shapes",
                "recognizable objects",
                "clear details",
            ]
        );
    }

    #[test]
    fn default_concepts_are_deduplicated() {
        let concepts = default_concepts("clear details");
        assert_eq!(concepts.iter().filter(|c| *c == "clear details").count(), 1);
        assert_eq!(concepts[0], "clear details");
        assert_eq!(default_key_concepts("")[0], "recognizable objects");
    }

    #[test]
    fn emergence_short_circuits_at_first_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        let tracker = ConceptTracker::new(step_function(calls.clone(), last.clone()));
        let seq = sequence("a fox", 10);

        let point = tracker
            .find_emergence_point(&seq, &all_images(10), "fox", 0.5)
            .unwrap();
        assert_eq!(point.step, Some(5));
        assert_eq!(point.similarity, Some(0.9));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn never_emerged_is_a_value_not_an_error() {
        let tracker = ConceptTracker::new(Scorer::direct(Box::new(FnScorer::new("zero", |_, _| 0.1))));
        let seq = sequence("a fox", 4);
        let point = tracker
            .find_emergence_point(&seq, &all_images(4), "fox", 0.5)
            .unwrap();
        assert!(!point.emerged());
        assert_eq!(point.similarity, None);
    }

    #[test]
    fn timeline_skips_missing_images() {
        let tracker = ConceptTracker::new(Scorer::direct(Box::new(FnScorer::new("half", |_, _| 0.5))));
        let seq = sequence("a quiet fox", 4);
        let images = InMemoryImages::new()
            .with_step(0, RgbImage::new(1, 1))
            .with_step(2, RgbImage::new(1, 1))
            .with_step(3, RgbImage::new(1, 1));
        let concepts = vec!["fox".to_string(), "quiet".to_string()];

        let timeline = tracker.analyze_timeline(&seq, &images, Some(&concepts)).unwrap();
        assert_eq!(timeline.skipped_steps, vec![1]);
        let steps: Vec<usize> = timeline.series.get("fox").unwrap().iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 2, 3]);
        assert_eq!(timeline.series.concepts().collect::<Vec<_>>(), vec!["fox", "quiet"]);
    }

    #[test]
    fn repeated_timeline_concepts_are_scored_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tracker = ConceptTracker::new(Scorer::direct(Box::new(FnScorer::new(
            "count",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                0.5
            },
        ))));
        let seq = sequence("a quiet fox", 3);
        let concepts = vec!["fox".to_string(), "quiet".to_string(), "fox".to_string()];

        let timeline = tracker.analyze_timeline(&seq, &all_images(3), Some(&concepts)).unwrap();
        assert_eq!(timeline.series.len(), 2);
        assert_eq!(timeline.series.concepts().collect::<Vec<_>>(), vec!["fox", "quiet"]);
        assert_eq!(timeline.series.get("fox").unwrap().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn missing_image_does_not_count_toward_emergence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        let tracker = ConceptTracker::new(step_function(calls.clone(), last));
        let seq = sequence("a fox", 8);
        let images = (0..8)
            .filter(|&s| s != 5)
            .fold(InMemoryImages::new(), |acc, s| acc.with_step(s, RgbImage::new(1, 1)));

        let point = tracker.find_emergence_point(&seq, &images, "fox", 0.5).unwrap();
        assert_eq!(point.step, Some(6));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let tracker = ConceptTracker::new(Scorer::direct(Box::new(FnScorer::new("z", |_, _| 0.0))));
        let seq = sequence("a fox", 2);
        for bad in [-0.1, 1.1, f64::NAN] {
            assert!(matches!(
                tracker.find_emergence_point(&seq, &all_images(2), "fox", bad),
                Err(EmergenceError::InvalidParameter { name: "threshold", .. })
            ));
        }
    }

    #[test]
    fn series_json_preserves_concept_order() {
        let mut series = ConceptScoreSeries::for_concepts(&["zebra".into(), "apple".into()]);
        series.push(0, ConceptScore { step: 0, similarity: 0.25 });
        let json = serde_json::to_string(&series).unwrap();
        assert!(json.find("zebra").unwrap() < json.find("apple").unwrap());
        let back: ConceptScoreSeries = serde_json::from_str(&json).unwrap();
        assert_eq!(back, series);
    }
}
