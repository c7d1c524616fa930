use super::scalar::{first_difference_scalar_unchecked, last_difference_scalar_unchecked};

/// Bit mask (one bit per byte, two per pixel) of lanes that differ in the
/// 8 pixels at `a` and `b`.
#[target_feature(enable = "sse2")]
#[inline]
unsafe fn sse2_diff_mask(a: *const u16, b: *const u16) -> u32 {
    use std::arch::x86_64::{__m128i, _mm_cmpeq_epi16, _mm_loadu_si128, _mm_movemask_epi8};

    let equal = unsafe {
        let va = _mm_loadu_si128(a as *const __m128i);
        let vb = _mm_loadu_si128(b as *const __m128i);
        _mm_movemask_epi8(_mm_cmpeq_epi16(va, vb)) as u32
    };
    !equal & 0xFFFF
}

#[target_feature(enable = "sse2")]
pub(crate) unsafe fn first_difference_sse2(
    a: *const u16,
    b: *const u16,
    len: usize,
) -> Option<usize> {
    let mut i = 0;
    while i + 8 <= len {
        let diff = unsafe { sse2_diff_mask(a.add(i), b.add(i)) };
        if diff != 0 {
            return Some(i + diff.trailing_zeros() as usize / 2);
        }
        i += 8;
    }

    unsafe { first_difference_scalar_unchecked(a.add(i), b.add(i), len - i) }.map(|off| i + off)
}

#[target_feature(enable = "sse2")]
pub(crate) unsafe fn last_difference_sse2(
    a: *const u16,
    b: *const u16,
    len: usize,
) -> Option<usize> {
    let mut end = len;
    while end >= 8 {
        let start = end - 8;
        let diff = unsafe { sse2_diff_mask(a.add(start), b.add(start)) };
        if diff != 0 {
            let high_byte = 31 - diff.leading_zeros() as usize;
            return Some(start + high_byte / 2);
        }
        end = start;
    }

    unsafe { last_difference_scalar_unchecked(a, b, end) }
}
