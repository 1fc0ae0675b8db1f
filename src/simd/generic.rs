//! Pure-Rust scalar fallback for distance kernels.
//!
//! This implementation works on all platforms and serves as the reference
//! implementation for correctness testing.

use super::{DistanceKernel, IsaLevel};

/// Pure-Rust scalar distance kernel, no SIMD intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct GenericKernel;

impl DistanceKernel for GenericKernel {
    fn isa_level(&self) -> IsaLevel {
        IsaLevel::Generic
    }

    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        a.iter()
            .zip(b.iter())
            .map(|(&av, &bv)| {
                let d = (av - bv) as f64;
                d * d
            })
            .sum()
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        a.iter()
            .zip(b.iter())
            .map(|(&av, &bv)| av as f64 * bv as f64)
            .sum()
    }
}
