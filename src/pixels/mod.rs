//! Bulk pixel kernels: locate the first/last differing pixel of two runs,
//! and copy pixels into wire order (big-endian RGB565).
//!
//! Every kernel has a portable implementation; x86_64 additionally gets an
//! SSE2 scan picked once at runtime. All variants return identical offsets.

mod parallel;
mod scalar;
#[cfg(target_arch = "x86_64")]
mod simd_x86;

use std::sync::OnceLock;

use crate::env_config::define_env_flag;
use crate::framebuffer::Framebuffer;
use parallel::{install_compare_pool, parallel_chunk_rows, should_parallelize};

const COUNT_PARALLEL_MIN_PIXELS: usize = 262_144;
const COUNT_PARALLEL_MIN_CHUNK_PIXELS: usize = 65_536;
const COUNT_PARALLEL_MAX_WORKERS: usize = 4;

type ScanKernel = unsafe fn(*const u16, *const u16, usize) -> Option<usize>;

define_env_flag!(enabled_unless(simd_kernels_enabled, "FBMIRROR_DISABLE_SIMD"));

/// Pre-initialize the comparison pool and kernel selection so the first
/// frame doesn't pay the cost. Safe to call multiple times.
pub fn warmup() {
    parallel::warmup_pool(COUNT_PARALLEL_MAX_WORKERS);
    let _ = first_kernel();
    let _ = last_kernel();
}

/// Whether [`warmup`] (or a parallel count) already built the pool.
pub fn is_warm() -> bool {
    parallel::compare_pool_initialized()
}

#[inline]
fn first_kernel() -> ScanKernel {
    static KERNEL: OnceLock<ScanKernel> = OnceLock::new();
    *KERNEL.get_or_init(select_first_kernel)
}

#[inline]
fn last_kernel() -> ScanKernel {
    static KERNEL: OnceLock<ScanKernel> = OnceLock::new();
    *KERNEL.get_or_init(select_last_kernel)
}

fn select_first_kernel() -> ScanKernel {
    #[cfg(target_arch = "x86_64")]
    {
        if simd_kernels_enabled() && std::arch::is_x86_feature_detected!("sse2") {
            return simd_x86::first_difference_sse2;
        }
    }

    scalar::first_difference_scalar_unchecked
}

fn select_last_kernel() -> ScanKernel {
    #[cfg(target_arch = "x86_64")]
    {
        if simd_kernels_enabled() && std::arch::is_x86_feature_detected!("sse2") {
            return simd_x86::last_difference_sse2;
        }
    }

    scalar::last_difference_scalar_unchecked
}

/// Offset of the first position where `a` and `b` differ, scanning the
/// common prefix of both slices.
#[inline]
pub fn first_difference(a: &[u16], b: &[u16]) -> Option<usize> {
    let len = a.len().min(b.len());
    // SAFETY: both pointers are valid for `len` reads.
    unsafe { first_kernel()(a.as_ptr(), b.as_ptr(), len) }
}

/// Offset of the last position where `a` and `b` differ.
#[inline]
pub fn last_difference(a: &[u16], b: &[u16]) -> Option<usize> {
    let len = a.len().min(b.len());
    // SAFETY: both pointers are valid for `len` reads.
    unsafe { last_kernel()(a.as_ptr(), b.as_ptr(), len) }
}

/// Copies `src` into `dst` as big-endian RGB565. `dst` must hold at least
/// `2 * src.len()` bytes.
#[inline]
pub fn copy_swap_to_wire(src: &[u16], dst: &mut [u8]) {
    debug_assert!(dst.len() >= src.len() * 2);
    scalar::copy_swap_scalar(src, dst);
}

/// [`copy_swap_to_wire`] that also stores every source pixel into `prev`,
/// so the previous-frame buffer is refreshed in the same pass.
#[inline]
pub fn copy_swap_and_update(src: &[u16], prev: &mut [u16], dst: &mut [u8]) {
    debug_assert!(prev.len() >= src.len());
    debug_assert!(dst.len() >= src.len() * 2);
    scalar::copy_swap_update_scalar(src, prev, dst);
}

fn count_rows(cur: &Framebuffer, prev: &Framebuffer, rows: std::ops::Range<u32>) -> usize {
    rows.map(|y| {
        cur.row(y)
            .iter()
            .zip(prev.row(y))
            .filter(|(a, b)| a != b)
            .count()
    })
    .sum()
}

/// Number of visible pixels that differ between two equally sized frames.
/// Large frames are split row-wise across the comparison pool.
pub fn count_changed_pixels(cur: &Framebuffer, prev: &Framebuffer) -> usize {
    let height = cur.height().min(prev.height());
    let width = cur.width() as usize;
    let pixel_count = width * height as usize;

    if should_parallelize(
        pixel_count,
        COUNT_PARALLEL_MIN_PIXELS,
        COUNT_PARALLEL_MIN_CHUNK_PIXELS,
        COUNT_PARALLEL_MAX_WORKERS,
    ) {
        if let Some(chunk_rows) = parallel_chunk_rows(
            width,
            height as usize,
            COUNT_PARALLEL_MIN_CHUNK_PIXELS,
            COUNT_PARALLEL_MAX_WORKERS,
        ) {
            use rayon::prelude::*;
            let chunk_rows = chunk_rows as u32;
            let chunk_count = height.div_ceil(chunk_rows);
            return install_compare_pool(COUNT_PARALLEL_MAX_WORKERS, || {
                (0..chunk_count)
                    .into_par_iter()
                    .map(|chunk| {
                        let start = chunk * chunk_rows;
                        let end = (start + chunk_rows).min(height);
                        count_rows(cur, prev, start..end)
                    })
                    .sum()
            });
        }
    }

    count_rows(cur, prev, 0..height)
}
