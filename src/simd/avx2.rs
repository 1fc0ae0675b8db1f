//! AVX2 (256-bit) SIMD kernel for x86_64 distance operations.
//!
//! Processes 8 `f32` lanes per iteration, widening to two 4-lane `f64`
//! accumulators. Falls through to scalar code for tail elements.

use super::{DistanceKernel, IsaLevel};

/// AVX2-accelerated distance kernel.
///
/// Uses 256-bit SIMD for bulk operations and scalar fallback for tails.
#[derive(Debug, Clone, Copy)]
pub struct Avx2Kernel;

#[cfg(target_arch = "x86_64")]
impl DistanceKernel for Avx2Kernel {
    fn isa_level(&self) -> IsaLevel {
        IsaLevel::Avx2
    }

    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f64 {
        debug_assert_eq!(a.len(), b.len());

        if is_x86_feature_detected!("avx2") {
            // Safety: we've confirmed AVX2 support at runtime.
            unsafe { self.squared_l2_avx2(a, b) }
        } else {
            super::generic::GenericKernel.squared_l2(a, b)
        }
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f64 {
        debug_assert_eq!(a.len(), b.len());

        if is_x86_feature_detected!("avx2") {
            unsafe { self.dot_avx2(a, b) }
        } else {
            super::generic::GenericKernel.dot(a, b)
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Avx2Kernel {
    #[target_feature(enable = "avx2")]
    unsafe fn squared_l2_avx2(&self, a: &[f32], b: &[f32]) -> f64 {
        use std::arch::x86_64::*;

        let len = a.len().min(b.len());
        let chunks = len / 8;

        let total = unsafe {
            let mut acc_lo = _mm256_setzero_pd();
            let mut acc_hi = _mm256_setzero_pd();

            for i in 0..chunks {
                let offset = i * 8;
                let va = _mm256_loadu_ps(a.as_ptr().add(offset));
                let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
                let diff = _mm256_sub_ps(va, vb);

                let lo = _mm256_cvtps_pd(_mm256_castps256_ps128(diff));
                let hi = _mm256_cvtps_pd(_mm256_extractf128_ps(diff, 1));
                acc_lo = _mm256_add_pd(acc_lo, _mm256_mul_pd(lo, lo));
                acc_hi = _mm256_add_pd(acc_hi, _mm256_mul_pd(hi, hi));
            }

            hsum_pd(_mm256_add_pd(acc_lo, acc_hi))
        };

        // Scalar tail
        let tail_start = chunks * 8;
        let tail: f64 = a[tail_start..len]
            .iter()
            .zip(&b[tail_start..len])
            .map(|(&av, &bv)| {
                let d = (av - bv) as f64;
                d * d
            })
            .sum();
        total + tail
    }

    #[target_feature(enable = "avx2")]
    unsafe fn dot_avx2(&self, a: &[f32], b: &[f32]) -> f64 {
        use std::arch::x86_64::*;

        let len = a.len().min(b.len());
        let chunks = len / 8;

        let total = unsafe {
            let mut acc_lo = _mm256_setzero_pd();
            let mut acc_hi = _mm256_setzero_pd();

            for i in 0..chunks {
                let offset = i * 8;
                let va = _mm256_loadu_ps(a.as_ptr().add(offset));
                let vb = _mm256_loadu_ps(b.as_ptr().add(offset));

                let a_lo = _mm256_cvtps_pd(_mm256_castps256_ps128(va));
                let a_hi = _mm256_cvtps_pd(_mm256_extractf128_ps(va, 1));
                let b_lo = _mm256_cvtps_pd(_mm256_castps256_ps128(vb));
                let b_hi = _mm256_cvtps_pd(_mm256_extractf128_ps(vb, 1));
                acc_lo = _mm256_add_pd(acc_lo, _mm256_mul_pd(a_lo, b_lo));
                acc_hi = _mm256_add_pd(acc_hi, _mm256_mul_pd(a_hi, b_hi));
            }

            hsum_pd(_mm256_add_pd(acc_lo, acc_hi))
        };

        let tail_start = chunks * 8;
        let tail: f64 = a[tail_start..len]
            .iter()
            .zip(&b[tail_start..len])
            .map(|(&av, &bv)| av as f64 * bv as f64)
            .sum();
        total + tail
    }
}

/// Horizontal sum of 4 packed f64 values in a __m256d register.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum_pd(v: std::arch::x86_64::__m256d) -> f64 {
    use std::arch::x86_64::*;
    let lo = _mm256_castpd256_pd128(v);
    let hi = _mm256_extractf128_pd(v, 1);
    let sum128 = _mm_add_pd(lo, hi);
    let high64 = _mm_unpackhi_pd(sum128, sum128);
    _mm_cvtsd_f64(_mm_add_sd(sum128, high64))
}

// Provide a stub for non-x86_64 targets so the module compiles.
#[cfg(not(target_arch = "x86_64"))]
impl DistanceKernel for Avx2Kernel {
    fn isa_level(&self) -> IsaLevel {
        IsaLevel::Generic
    }
    fn squared_l2(&self, a: &[f32], b: &[f32]) -> f64 {
        super::generic::GenericKernel.squared_l2(a, b)
    }
    fn dot(&self, a: &[f32], b: &[f32]) -> f64 {
        super::generic::GenericKernel.dot(a, b)
    }
}
