//! Directory-backed artifact store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::latents::load_latents;
use super::{
    ArtifactResult, GeneratedSequence, ImageSource, SequenceLayout, SequenceMetadata, StepImage,
};
use crate::error::ArtifactError;

/// A loaded sequence directory.
///
/// Owns the [`GeneratedSequence`] for the lifetime of one analysis run and
/// serves its images on demand. Read-only: nothing here writes to the directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: SequenceLayout,
    sequence: GeneratedSequence,
    /// Step indices whose `step_NNNN.png` was absent at load time.
    missing_steps: BTreeSet<usize>,
}

impl ArtifactStore {
    /// Load the sequence in `dir`.
    ///
    /// Fails with `NotFound` when `metadata.json`, the latent file, or
    /// `final.png` is absent, and with `Malformed` when metadata is inconsistent
    /// with itself or with the latent trajectory. Missing step images are
    /// recorded, not fatal; see [`ArtifactStore::missing_step_images`].
    pub fn load(dir: impl AsRef<Path>) -> ArtifactResult<Self> {
        let layout = SequenceLayout::new(dir.as_ref());
        if !layout.root.is_dir() {
            return Err(ArtifactError::not_found(&layout.root));
        }

        let bytes = std::fs::read(&layout.metadata).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::not_found(&layout.metadata)
            } else {
                ArtifactError::Io {
                    path: layout.metadata.display().to_string(),
                    source: e,
                }
            }
        })?;
        let metadata = SequenceMetadata::from_json(&bytes, &layout.metadata)?;
        let latents = load_latents(&layout.latents)?;
        let sequence = metadata.into_sequence(latents, &layout.metadata)?;

        if !layout.final_image.is_file() {
            return Err(ArtifactError::not_found(&layout.final_image));
        }

        let missing_steps: BTreeSet<usize> = (0..sequence.num_steps)
            .filter(|&step| !layout.step_image(step).is_file())
            .collect();
        if !missing_steps.is_empty() {
            tracing::warn!(
                dir = %layout.root.display(),
                missing = missing_steps.len(),
                "sequence has missing step images; they will be skipped by image analyses"
            );
        }

        tracing::info!(
            dir = %layout.root.display(),
            prompt = %sequence.prompt,
            steps = sequence.num_steps,
            seed = sequence.seed,
            "loaded sequence"
        );

        Ok(Self {
            layout,
            sequence,
            missing_steps,
        })
    }

    /// Like [`ArtifactStore::load`], but every step image must be present.
    pub fn load_strict(dir: impl AsRef<Path>) -> ArtifactResult<Self> {
        let store = Self::load(dir)?;
        if let Some(&step) = store.missing_steps.iter().next() {
            return Err(ArtifactError::not_found(&store.layout.step_image(step)));
        }
        Ok(store)
    }

    /// The loaded sequence.
    pub fn sequence(&self) -> &GeneratedSequence {
        &self.sequence
    }

    /// Resolved paths of this sequence directory.
    pub fn layout(&self) -> &SequenceLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Steps whose image file was missing at load time, ascending.
    pub fn missing_step_images(&self) -> Vec<usize> {
        self.missing_steps.iter().copied().collect()
    }

    fn decode(path: &Path) -> ArtifactResult<image::RgbImage> {
        if !path.is_file() {
            return Err(ArtifactError::not_found(path));
        }
        let img = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(source) => ArtifactError::Io {
                path: path.display().to_string(),
                source,
            },
            other => ArtifactError::Decode {
                path: path.display().to_string(),
                message: other.to_string(),
            },
        })?;
        Ok(img.to_rgb8())
    }

    fn step_path(&self, step: usize) -> PathBuf {
        self.layout.step_image(step)
    }
}

impl ImageSource for ArtifactStore {
    fn has_step_image(&self, step: usize) -> bool {
        step < self.sequence.num_steps && !self.missing_steps.contains(&step)
    }

    fn step_image(&self, step: usize) -> ArtifactResult<StepImage> {
        let path = self.step_path(step);
        if !self.has_step_image(step) {
            return Err(ArtifactError::not_found(&path));
        }
        let pixels = Self::decode(&path)?;
        Ok(StepImage::for_step(step, pixels).with_path(path))
    }

    fn final_image(&self) -> ArtifactResult<StepImage> {
        let pixels = Self::decode(&self.layout.final_image)?;
        Ok(StepImage::final_output(pixels).with_path(self.layout.final_image.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn write_sequence(dir: &Path, steps: usize, skip_image: Option<usize>) {
        let layout = SequenceLayout::new(dir);
        std::fs::create_dir_all(&layout.analysis_dir).unwrap();
        let meta = SequenceMetadata::synthetic("a quiet harbor", steps, 7.5, 3);
        std::fs::write(&layout.metadata, serde_json::to_vec_pretty(&meta).unwrap()).unwrap();
        let latents = Array2::<f32>::from_shape_fn((steps, 4), |(s, i)| (s + i) as f32);
        ndarray_npy::write_npy(&layout.latents, &latents).unwrap();
        for step in 0..steps {
            if Some(step) != skip_image {
                image::RgbImage::new(4, 4).save(layout.step_image(step)).unwrap();
            }
        }
        image::RgbImage::new(4, 4).save(&layout.final_image).unwrap();
    }

    #[test]
    fn loads_complete_sequence() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), 3, None);

        let store = ArtifactStore::load_strict(dir.path()).unwrap();
        assert_eq!(store.sequence().num_steps, 3);
        assert_eq!(store.sequence().latents().len(), 3);
        assert!(store.missing_step_images().is_empty());
        assert_eq!(store.step_image(2).unwrap().dimensions(), (4, 4));
        assert!(store.final_image().unwrap().path().is_some());
    }

    #[test]
    fn missing_step_image_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), 3, Some(1));

        let store = ArtifactStore::load(dir.path()).unwrap();
        assert_eq!(store.missing_step_images(), vec![1]);
        assert!(!store.has_step_image(1));
        assert!(matches!(
            store.step_image(1),
            Err(ArtifactError::NotFound { .. })
        ));

        let strict = ArtifactStore::load_strict(dir.path()).unwrap_err();
        assert!(matches!(strict, ArtifactError::NotFound { ref path } if path.ends_with("step_0001.png")));
    }

    #[test]
    fn missing_metadata_is_not_found() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), 2, None);
        std::fs::remove_file(dir.path().join("metadata.json")).unwrap();
        let err = ArtifactStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { ref path } if path.ends_with("metadata.json")));
    }

    #[test]
    fn missing_final_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), 2, None);
        std::fs::remove_file(dir.path().join("final.png")).unwrap();
        assert!(matches!(
            ArtifactStore::load(dir.path()),
            Err(ArtifactError::NotFound { .. })
        ));
    }
}
