//! SIMD-accelerated distance kernels for latent trajectories.
//!
//! This module provides a `DistanceKernel` trait with CPU-specific implementations.
//! At runtime, [`detect_isa`] determines the best available instruction set and
//! [`best_kernel`] returns the fastest implementation for the current CPU.
//!
//! All kernels read `f32` latents and accumulate in `f64`, so trajectories with
//! tens of thousands of elements per state do not lose precision.
//!
//! # Supported ISA levels
//!
//! - **Generic**: Pure-Rust scalar fallback, works everywhere
//! - **AVX2**: 256-bit SIMD for x86_64 systems with AVX2 support

pub mod avx2;
pub mod generic;

/// Instruction set architecture level detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsaLevel {
    /// Pure-Rust scalar operations, no SIMD.
    Generic,
    /// x86_64 AVX2 (256-bit vectors).
    Avx2,
}

impl std::fmt::Display for IsaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsaLevel::Generic => write!(f, "Generic (scalar)"),
            IsaLevel::Avx2 => write!(f, "AVX2 (256-bit)"),
        }
    }
}

/// Detect the best ISA level available on the current CPU.
pub fn detect_isa() -> IsaLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return IsaLevel::Avx2;
        }
    }
    IsaLevel::Generic
}

/// Trait for SIMD-accelerated distance kernels over flat `f32` vectors.
///
/// Slices passed to a kernel must have the same length.
pub trait DistanceKernel: Send + Sync {
    /// The ISA level this kernel targets.
    fn isa_level(&self) -> IsaLevel;

    /// Squared Euclidean distance `Σ (a_i − b_i)²`.
    ///
    /// The difference is taken in `f32`, the square and sum in `f64`.
    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f64;

    /// Inner product `Σ a_i · b_i` accumulated in `f64`.
    fn dot(&self, a: &[f32], b: &[f32]) -> f64;
}

/// Return the best available kernel for the current CPU.
pub fn best_kernel() -> Box<dyn DistanceKernel> {
    match detect_isa() {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => Box::new(avx2::Avx2Kernel),
        _ => Box::new(generic::GenericKernel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_isa_returns_valid_level() {
        let level = detect_isa();
        assert!(level >= IsaLevel::Generic);
    }

    #[test]
    fn best_kernel_returns_working_kernel() {
        let kernel = best_kernel();
        assert!(kernel.isa_level() >= IsaLevel::Generic);
        assert_eq!(kernel.squared_l2(&[3.0, 0.0], &[0.0, 4.0]), 25.0);
    }

    /// Run the full kernel test suite against any implementation.
    pub fn kernel_conformance_tests(kernel: &dyn DistanceKernel) {
        // Lengths that exercise both the vector body and the scalar tail.
        for len in [0usize, 1, 7, 8, 9, 64, 131] {
            let a: Vec<f32> = (0..len).map(|i| i as f32 * 0.5).collect();
            let b: Vec<f32> = (0..len).map(|i| 1.0 - i as f32 * 0.25).collect();

            let expected_sq: f64 = a
                .iter()
                .zip(&b)
                .map(|(&x, &y)| {
                    let d = (x - y) as f64;
                    d * d
                })
                .sum();
            let expected_dot: f64 = a.iter().zip(&b).map(|(&x, &y)| x as f64 * y as f64).sum();

            let sq = kernel.squared_l2(&a, &b);
            let dot = kernel.dot(&a, &b);
            assert!(
                (sq - expected_sq).abs() <= 1e-9 * expected_sq.max(1.0),
                "squared_l2 mismatch at len {len}: {sq} vs {expected_sq}"
            );
            assert!(
                (dot - expected_dot).abs() <= 1e-9 * expected_dot.abs().max(1.0),
                "dot mismatch at len {len}: {dot} vs {expected_dot}"
            );

            // Distance to self is exactly zero.
            assert_eq!(kernel.squared_l2(&a, &a), 0.0);
        }
    }

    #[test]
    fn generic_kernel_conformance() {
        kernel_conformance_tests(&generic::GenericKernel);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_kernel_conformance() {
        if detect_isa() >= IsaLevel::Avx2 {
            kernel_conformance_tests(&avx2::Avx2Kernel);
        }
    }
}
