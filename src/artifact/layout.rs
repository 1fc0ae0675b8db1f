//! On-disk layout of a generated sequence directory.
//!
//! Provides `SequenceLayout`, resolving every artifact path relative to one
//! sequence root, in the format the generator writes:
//!
//! ```text
//! <root>/
//!   metadata.json
//!   step_0000.png ... step_NNNN.png
//!   final.png
//!   phase3_data/
//!     latent_vectors.npy
//!     noise_decomposition.json
//!     semantic_emergence.json
//!     emergence_points.json
//!     token_attribution.json
//!   ablation_study/
//!     ablation_token{idx}_{token}/   (one full sequence per ablated token)
//! ```

use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";
pub const FINAL_IMAGE: &str = "final.png";
pub const ANALYSIS_DIR: &str = "phase3_data";
pub const LATENTS_FILE: &str = "latent_vectors.npy";
pub const NOISE_SUMMARY_FILE: &str = "noise_decomposition.json";
pub const EMERGENCE_SUMMARY_FILE: &str = "semantic_emergence.json";
pub const EMERGENCE_POINTS_FILE: &str = "emergence_points.json";
pub const ATTRIBUTION_SUMMARY_FILE: &str = "token_attribution.json";
pub const ABLATION_DIR: &str = "ablation_study";

/// Paths inside one sequence directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLayout {
    /// The sequence directory itself.
    pub root: PathBuf,
    /// `<root>/metadata.json`
    pub metadata: PathBuf,
    /// `<root>/phase3_data/`
    pub analysis_dir: PathBuf,
    /// `<root>/phase3_data/latent_vectors.npy`
    pub latents: PathBuf,
    /// `<root>/final.png`
    pub final_image: PathBuf,
}

impl SequenceLayout {
    /// Resolve the layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let analysis_dir = root.join(ANALYSIS_DIR);
        Self {
            metadata: root.join(METADATA_FILE),
            latents: analysis_dir.join(LATENTS_FILE),
            final_image: root.join(FINAL_IMAGE),
            analysis_dir,
            root,
        }
    }

    /// File name of the image for `step`, zero-padded to four digits.
    pub fn step_image_name(step: usize) -> String {
        format!("step_{step:04}.png")
    }

    /// `<root>/step_NNNN.png`
    pub fn step_image(&self, step: usize) -> PathBuf {
        self.root.join(Self::step_image_name(step))
    }

    /// `<root>/phase3_data/noise_decomposition.json`
    pub fn noise_summary(&self) -> PathBuf {
        self.analysis_dir.join(NOISE_SUMMARY_FILE)
    }

    /// `<root>/phase3_data/semantic_emergence.json`
    pub fn emergence_summary(&self) -> PathBuf {
        self.analysis_dir.join(EMERGENCE_SUMMARY_FILE)
    }

    /// `<root>/phase3_data/emergence_points.json`
    pub fn emergence_points(&self) -> PathBuf {
        self.analysis_dir.join(EMERGENCE_POINTS_FILE)
    }

    /// `<root>/phase3_data/token_attribution.json`
    pub fn attribution_summary(&self) -> PathBuf {
        self.analysis_dir.join(ATTRIBUTION_SUMMARY_FILE)
    }

    /// Output directory for the run with token `index` removed.
    ///
    /// `subdir` is normally [`ABLATION_DIR`]. Path separators in the token are
    /// replaced so a token can never escape the ablation directory.
    pub fn ablation_run(&self, subdir: &str, index: usize, token: &str) -> PathBuf {
        let safe: String = token
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect();
        self.root
            .join(subdir)
            .join(format!("ablation_token{index}_{safe}"))
    }

    /// Whether `path` is inside this sequence directory.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_resolves_expected_files() {
        let layout = SequenceLayout::new("/data/seq01");
        assert_eq!(layout.metadata, PathBuf::from("/data/seq01/metadata.json"));
        assert_eq!(
            layout.latents,
            PathBuf::from("/data/seq01/phase3_data/latent_vectors.npy")
        );
        assert_eq!(layout.final_image, PathBuf::from("/data/seq01/final.png"));
        assert_eq!(
            layout.noise_summary(),
            PathBuf::from("/data/seq01/phase3_data/noise_decomposition.json")
        );
    }

    #[test]
    fn step_images_are_zero_padded() {
        let layout = SequenceLayout::new("seq");
        assert_eq!(layout.step_image(7), PathBuf::from("seq/step_0007.png"));
        assert_eq!(SequenceLayout::step_image_name(1234), "step_1234.png");
    }

    #[test]
    fn ablation_run_sanitizes_tokens() {
        let layout = SequenceLayout::new("seq");
        let dir = layout.ablation_run(ABLATION_DIR, 2, "red/../fox");
        assert_eq!(
            dir,
            PathBuf::from("seq/ablation_study/ablation_token2_red_.._fox")
        );
        assert!(layout.contains(&dir));
    }
}
