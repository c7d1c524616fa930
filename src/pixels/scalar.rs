#[inline(always)]
unsafe fn read_quad(ptr: *const u16) -> u64 {
    unsafe { std::ptr::read_unaligned(ptr as *const u64) }
}

pub(crate) unsafe fn first_difference_scalar_unchecked(
    a: *const u16,
    b: *const u16,
    len: usize,
) -> Option<usize> {
    let mut i = 0;

    while i + 4 <= len {
        let differs = unsafe { read_quad(a.add(i)) != read_quad(b.add(i)) };
        if differs {
            break;
        }
        i += 4;
    }

    while i < len {
        let differs = unsafe { *a.add(i) != *b.add(i) };
        if differs {
            return Some(i);
        }
        i += 1;
    }

    None
}

pub(crate) unsafe fn last_difference_scalar_unchecked(
    a: *const u16,
    b: *const u16,
    len: usize,
) -> Option<usize> {
    let mut end = len;

    while end >= 4 {
        let differs = unsafe { read_quad(a.add(end - 4)) != read_quad(b.add(end - 4)) };
        if differs {
            break;
        }
        end -= 4;
    }

    while end > 0 {
        let idx = end - 1;
        let differs = unsafe { *a.add(idx) != *b.add(idx) };
        if differs {
            return Some(idx);
        }
        end -= 1;
    }

    None
}

/// Writes each pixel as big-endian bytes, the order SPI panels expect.
pub(crate) fn copy_swap_scalar(src: &[u16], dst: &mut [u8]) {
    for (px, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&px.to_be_bytes());
    }
}

/// [`copy_swap_scalar`] that also mirrors every pixel into `prev`.
pub(crate) fn copy_swap_update_scalar(src: &[u16], prev: &mut [u16], dst: &mut [u8]) {
    for ((px, old), out) in src.iter().zip(prev.iter_mut()).zip(dst.chunks_exact_mut(2)) {
        *old = *px;
        out.copy_from_slice(&px.to_be_bytes());
    }
}
