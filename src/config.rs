//! Analysis configuration, persisted as TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid config.
//!
//! ```toml
//! [noise]
//! percentile = 75.0
//! sample_steps = 10
//!
//! [emergence]
//! threshold = 0.5
//! concepts = []            # empty: prompt, long tokens, generic concepts
//! fallback = "none"        # or "seeded" for placeholder scores
//!
//! [similarity]
//! url = "http://127.0.0.1:8765"
//!
//! [generation]
//! command = ["python", "diffusion_step_generator.py"]
//! timeout_secs = 3600
//! ```

use std::path::Path;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::layout::ABLATION_DIR;
use crate::attribution::CommandGenerator;
use crate::emergence::http::HttpSimilarityConfig;
use crate::emergence::{
    self, HttpSimilarityBackend, SeededFallbackScorer, SimilarityBackend,
};
use crate::metrics::DEFAULT_CRITICAL_PERCENTILE;
use crate::reduce::DEFAULT_SAMPLE_STEPS;

/// Errors from configuration handling.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(lens::config::read),
        help("Ensure the config file exists, or run `latent-lens init-config` to write one.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(lens::config::parse),
        help("Check the TOML syntax and field types in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(lens::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value {field}: {message}")]
    #[diagnostic(code(lens::config::invalid), help("Fix {field} in the config file."))]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub emergence: EmergenceConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Noise decomposition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Percentile above which a transition is critical.
    #[serde(default = "default_percentile")]
    pub percentile: f64,
    /// Steps sampled for the 2-D projection.
    #[serde(default = "default_sample_steps")]
    pub sample_steps: usize,
}

fn default_percentile() -> f64 {
    DEFAULT_CRITICAL_PERCENTILE
}
fn default_sample_steps() -> usize {
    DEFAULT_SAMPLE_STEPS
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            sample_steps: default_sample_steps(),
        }
    }
}

/// What to do when the similarity backend is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Deterministic pseudo-random scores; the run is marked as fallback.
    Seeded,
    /// Fail the emergence analysis.
    #[default]
    #[serde(rename = "none")]
    Off,
}

/// Concept emergence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergenceConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Concepts for the timeline. Empty uses the default policy.
    #[serde(default)]
    pub concepts: Vec<String>,
    /// Concepts checked for an emergence point. Unset uses the prompt plus
    /// "recognizable objects" and "clear details".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_concepts: Option<Vec<String>>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub fallback_seed: u64,
}

fn default_threshold() -> f64 {
    emergence::DEFAULT_THRESHOLD
}

impl Default for EmergenceConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            concepts: Vec::new(),
            key_concepts: None,
            fallback: FallbackPolicy::default(),
            fallback_seed: 0,
        }
    }
}

impl EmergenceConfig {
    /// Timeline concepts, or `None` for the default policy.
    pub fn timeline_concepts(&self) -> Option<&[String]> {
        (!self.concepts.is_empty()).then_some(self.concepts.as_slice())
    }

    /// Key concepts for `prompt`.
    pub fn key_concepts_for(&self, prompt: &str) -> Vec<String> {
        match &self.key_concepts {
            Some(concepts) => concepts.clone(),
            None => emergence::default_key_concepts(prompt),
        }
    }

    /// The fallback scorer this policy allows, if any.
    pub fn fallback_scorer(&self) -> Option<Box<dyn SimilarityBackend>> {
        match self.fallback {
            FallbackPolicy::Seeded => Some(Box::new(SeededFallbackScorer::new(self.fallback_seed))),
            FallbackPolicy::Off => None,
        }
    }
}

/// Similarity backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Base URL of the scoring service. Unset means no backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_similarity_timeout")]
    pub timeout_secs: u64,
}

fn default_similarity_timeout() -> u64 {
    60
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_similarity_timeout(),
        }
    }
}

impl SimilarityConfig {
    /// The configured backend, if a URL is set.
    pub fn backend(&self) -> Option<Box<dyn SimilarityBackend>> {
        self.url.as_ref().map(|url| {
            Box::new(HttpSimilarityBackend::new(HttpSimilarityConfig {
                base_url: url.trim_end_matches('/').to_string(),
                timeout_secs: self.timeout_secs,
            })) as Box<dyn SimilarityBackend>
        })
    }
}

/// Generation collaborator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Program and leading arguments. Unset disables attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    /// Directory under the sequence where ablation runs are written.
    #[serde(default = "default_output_subdir")]
    pub output_subdir: String,
}

fn default_generation_timeout() -> u64 {
    crate::attribution::command::DEFAULT_TIMEOUT_SECS
}
fn default_output_subdir() -> String {
    ABLATION_DIR.into()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_generation_timeout(),
            output_subdir: default_output_subdir(),
        }
    }
}

impl GenerationConfig {
    /// The configured generator, or `None` when no command is set.
    pub fn generator(&self) -> ConfigResult<Option<CommandGenerator>> {
        let Some(command) = self.command.as_deref() else {
            return Ok(None);
        };
        let generator = CommandGenerator::new(command).map_err(|e| ConfigError::Invalid {
            field: "generation.command",
            message: e.message,
        })?;
        Ok(Some(
            generator.with_timeout(Duration::from_secs(self.timeout_secs)),
        ))
    }
}

impl AnalysisConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Check value ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        let p = self.noise.percentile;
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return Err(ConfigError::Invalid {
                field: "noise.percentile",
                message: format!("{p} is outside [0, 100]"),
            });
        }
        if self.noise.sample_steps < 2 {
            return Err(ConfigError::Invalid {
                field: "noise.sample_steps",
                message: format!(
                    "{} is too few; projection needs at least 2 samples",
                    self.noise.sample_steps
                ),
            });
        }
        let t = self.emergence.threshold;
        if !t.is_finite() || !(0.0..=1.0).contains(&t) {
            return Err(ConfigError::Invalid {
                field: "emergence.threshold",
                message: format!("{t} is outside [0, 1]"),
            });
        }
        if self.similarity.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "similarity.timeout_secs",
                message: "must be positive".into(),
            });
        }
        if self.generation.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "generation.timeout_secs",
                message: "must be positive".into(),
            });
        }
        if self.generation.command.as_ref().is_some_and(|c| c.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "generation.command",
                message: "must name a program".into(),
            });
        }
        if self.generation.output_subdir.trim().is_empty()
            || Path::new(&self.generation.output_subdir).is_absolute()
        {
            return Err(ConfigError::Invalid {
                field: "generation.output_subdir",
                message: "must be a relative directory name".into(),
            });
        }
        Ok(())
    }
}
