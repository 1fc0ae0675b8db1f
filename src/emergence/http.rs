//! JSON-over-HTTP similarity backend.
//!
//! Talks to a local scoring service (typically a CLIP server):
//!
//! - `GET  {url}/health` → 200 when ready
//! - `POST {url}/similarity` with `{"image_path": ..., "text": ...}` →
//!   `{"similarity": <f64>}`
//!
//! Images are passed by path; the service reads them from the same disk.

use std::time::Duration;

use super::{EmergenceError, EmergenceResult, SimilarityBackend};
use crate::artifact::StepImage;

/// Configuration for the HTTP similarity backend.
#[derive(Debug, Clone)]
pub struct HttpSimilarityConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for HttpSimilarityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".into(),
            timeout_secs: 60,
        }
    }
}

/// Client for a similarity scoring service.
pub struct HttpSimilarityBackend {
    config: HttpSimilarityConfig,
    agent: ureq::Agent,
}

impl HttpSimilarityBackend {
    pub fn new(config: HttpSimilarityConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { config, agent }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn request_failed(&self, message: impl Into<String>) -> EmergenceError {
        EmergenceError::Backend {
            backend: self.config.base_url.clone(),
            message: message.into(),
        }
    }
}

impl SimilarityBackend for HttpSimilarityBackend {
    fn name(&self) -> &str {
        &self.config.base_url
    }

    fn is_available(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);
        let probe = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(5))
            .build();
        match probe.get(&url).call() {
            Ok(resp) => resp.status() == 200,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "similarity backend probe failed");
                false
            }
        }
    }

    fn score(&self, image: &StepImage, concept: &str) -> EmergenceResult<f64> {
        let path = image.path().ok_or_else(|| {
            self.request_failed("image has no file path; this backend scores images on disk")
        })?;

        let url = format!("{}/similarity", self.config.base_url);
        let body = serde_json::json!({
            "image_path": path.display().to_string(),
            "text": concept,
        });
        let body_str =
            serde_json::to_string(&body).map_err(|e| self.request_failed(e.to_string()))?;

        let resp = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body_str)
            .map_err(|e: ureq::Error| self.request_failed(e.to_string()))?;

        let resp_str = resp
            .into_string()
            .map_err(|e| self.request_failed(e.to_string()))?;
        let json: serde_json::Value =
            serde_json::from_str(&resp_str).map_err(|e| self.request_failed(e.to_string()))?;

        json["similarity"]
            .as_f64()
            .ok_or_else(|| self.request_failed("missing 'similarity' field"))
    }
}

impl std::fmt::Debug for HttpSimilarityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSimilarityBackend")
            .field("base_url", &self.config.base_url)
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergence::Scorer;
    use image::RgbImage;

    fn unreachable() -> HttpSimilarityBackend {
        HttpSimilarityBackend::new(HttpSimilarityConfig {
            base_url: "http://127.0.0.1:1".into(), // unreachable port
            timeout_secs: 1,
        })
    }

    #[test]
    fn unreachable_service_is_unavailable() {
        assert!(!unreachable().is_available());
        let err = Scorer::resolve(Some(Box::new(unreachable())), None).unwrap_err();
        assert!(matches!(err, EmergenceError::BackendUnavailable { .. }));
    }

    #[test]
    fn in_memory_image_cannot_be_scored_over_http() {
        let img = StepImage::for_step(0, RgbImage::new(1, 1));
        assert!(matches!(
            unreachable().score(&img, "x"),
            Err(EmergenceError::Backend { .. })
        ));
    }
}
