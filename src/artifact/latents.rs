//! Latent trajectory loading from NumPy `.npy` files.
//!
//! The file is memory-mapped with `memmap2`. A little-endian `f32` array with
//! an aligned header is viewed in place; anything else (`f64`, big-endian,
//! unaligned data) falls back to a decoding read from the same mapping.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use ndarray::{ArrayD, ArrayViewD};
use ndarray_npy::{ReadNpyExt, ViewNpyExt};

use super::{ArtifactResult, LatentTensorSequence};
use crate::error::ArtifactError;

/// Load the latent trajectory stored at `path`.
///
/// The first array axis indexes states; remaining axes are the per-state shape.
pub fn load_latents(path: &Path) -> ArtifactResult<LatentTensorSequence> {
    if !path.is_file() {
        return Err(ArtifactError::not_found(path));
    }
    let file = File::open(path).map_err(|e| ArtifactError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    // Safety: the mapping is read-only and dropped before this function returns;
    // the array is copied out before that.
    let mmap = unsafe {
        Mmap::map(&file).map_err(|e| ArtifactError::Io {
            path: path.display().to_string(),
            source: e,
        })?
    };

    let array = decode_npy(&mmap).map_err(|message| ArtifactError::malformed(path, message))?;
    if array.ndim() < 2 {
        return Err(ArtifactError::malformed(
            path,
            format!(
                "latent array must have a state axis plus at least one data axis, got shape {:?}",
                array.shape()
            ),
        ));
    }
    if array.iter().any(|v| !v.is_finite()) {
        return Err(ArtifactError::malformed(path, "latent array contains NaN or Inf"));
    }

    let sequence =
        LatentTensorSequence::from_array(array).map_err(|m| ArtifactError::malformed(path, m))?;
    tracing::debug!(
        path = %path.display(),
        states = sequence.len(),
        state_shape = ?sequence.state_shape(),
        "loaded latent trajectory"
    );
    Ok(sequence)
}

/// Decode `.npy` bytes into an `f32` array.
pub fn decode_npy(bytes: &[u8]) -> Result<ArrayD<f32>, String> {
    if let Ok(view) = ArrayViewD::<f32>::view_npy(bytes) {
        return Ok(view.to_owned());
    }
    match ArrayD::<f32>::read_npy(bytes) {
        Ok(array) => Ok(array),
        Err(f32_err) => match ArrayD::<f64>::read_npy(bytes) {
            Ok(array) => Ok(array.mapv(|v| v as f32)),
            Err(_) => Err(format!("not a readable f32/f64 .npy array: {f32_err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};
    use ndarray_npy::write_npy;
    use tempfile::TempDir;

    #[test]
    fn loads_f32_trajectory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latents.npy");
        let array = Array3::<f32>::from_shape_fn((4, 2, 3), |(s, i, j)| (s * 6 + i * 3 + j) as f32);
        write_npy(&path, &array).unwrap();

        let seq = load_latents(&path).unwrap();
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.state_shape(), &[2, 3]);
        assert_eq!(seq.state(1)[0], 6.0);
    }

    #[test]
    fn converts_f64_trajectory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latents.npy");
        let array = ArrayD::<f64>::from_shape_vec(IxDyn(&[2, 2]), vec![0.5, 1.5, 2.5, 3.5]).unwrap();
        write_npy(&path, &array).unwrap();

        let seq = load_latents(&path).unwrap();
        assert_eq!(seq.state(1), &[2.5, 3.5]);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load_latents(&dir.path().join("nope.npy")).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latents.npy");
        std::fs::write(&path, b"definitely not numpy").unwrap();
        assert!(matches!(
            load_latents(&path),
            Err(ArtifactError::Malformed { .. })
        ));
    }
}
