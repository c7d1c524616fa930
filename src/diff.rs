//! Reduces a frame to the spans that differ from the previous frame.
//!
//! All strategies produce a row-ordered [`SpanList`] that covers every
//! changed pixel. `NoDiff` and `SingleRectangle` always emit a single span;
//! the scanline strategies emit one span per run of changed pixels and can
//! work on a single interlaced field.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::DiffStrategy;
use crate::error::MirrorResult;
use crate::framebuffer::Framebuffer;
use crate::pixels::{first_difference, last_difference};
use crate::span::{Span, SpanList};

/// Which rows a scanline diff visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rows {
    All,
    /// Every other row starting at the given parity (0 or 1).
    Field(u32),
}

impl Rows {
    fn iter(self, height: u32) -> impl Iterator<Item = u32> {
        let (start, step) = match self {
            Self::All => (0, 1),
            Self::Field(parity) => (parity & 1, 2),
        };
        (start..height).step_by(step)
    }
}

/// A diff strategy bound to its tuning.
#[derive(Clone, Debug)]
pub struct DiffEngine {
    strategy: DiffStrategy,
    merge_threshold: u32,
    alignment: Option<u32>,
}

impl DiffEngine {
    pub fn new(strategy: DiffStrategy, merge_threshold: u32, alignment: Option<u32>) -> Self {
        Self {
            strategy,
            merge_threshold,
            alignment,
        }
    }

    pub fn strategy(&self) -> DiffStrategy {
        self.strategy
    }

    /// Whether this strategy can limit itself to one interlaced field.
    pub fn supports_fields(&self) -> bool {
        matches!(
            self.strategy,
            DiffStrategy::ScanlineExact | DiffStrategy::ScanlineCoarse
        )
    }

    /// Diff `cur` against `prev` into `spans`, which is cleared first.
    /// `rows` is ignored by the single-span strategies.
    pub fn diff(
        &self,
        cur: &Framebuffer,
        prev: &Framebuffer,
        rows: Rows,
        spans: &mut SpanList,
    ) -> MirrorResult<()> {
        cur.ensure_same_geometry(prev)?;
        spans.clear();
        match self.strategy {
            DiffStrategy::NoDiff => no_diff(cur.width(), cur.height(), spans),
            DiffStrategy::SingleRectangle => single_rectangle(cur, prev, spans),
            DiffStrategy::ScanlineExact => scanline_exact(cur, prev, rows, self.merge_threshold, spans),
            DiffStrategy::ScanlineCoarse => {
                if coarse_compatible(cur) {
                    scanline_coarse(cur, prev, rows, spans);
                } else {
                    warn_coarse_fallback(cur);
                    scanline_exact(cur, prev, rows, self.merge_threshold, spans);
                }
            }
        }
        if let Some(alignment) = self.alignment {
            align_spans(spans, alignment, cur.width());
        }
        Ok(())
    }
}

/// The whole frame as one span.
pub fn no_diff(width: u32, height: u32, spans: &mut SpanList) {
    spans.push(Span::rect(0, 0, width, height));
}

fn first_changed_pixel(cur: &Framebuffer, prev: &Framebuffer) -> Option<(u32, u32)> {
    let width = cur.width();
    if cur.is_contiguous() {
        let pixels = cur.pixel_count();
        let at = first_difference(&cur.as_pixels()[..pixels], &prev.as_pixels()[..pixels])?;
        return Some((at as u32 % width, at as u32 / width));
    }
    (0..cur.height()).find_map(|y| first_difference(cur.row(y), prev.row(y)).map(|x| (x as u32, y)))
}

fn last_changed_pixel(cur: &Framebuffer, prev: &Framebuffer) -> Option<(u32, u32)> {
    let width = cur.width();
    if cur.is_contiguous() {
        let pixels = cur.pixel_count();
        let at = last_difference(&cur.as_pixels()[..pixels], &prev.as_pixels()[..pixels])?;
        return Some((at as u32 % width, at as u32 / width));
    }
    (0..cur.height())
        .rev()
        .find_map(|y| last_difference(cur.row(y), prev.row(y)).map(|x| (x as u32, y)))
}

fn column_changed(cur: &Framebuffer, prev: &Framebuffer, x: u32, rows: std::ops::RangeInclusive<u32>) -> bool {
    rows.into_iter().any(|y| cur.pixel(x, y) != prev.pixel(x, y))
}

/// One box around every changed pixel. The last row of the span stops one
/// past the last changed pixel in raster order.
pub fn single_rectangle(cur: &Framebuffer, prev: &Framebuffer, spans: &mut SpanList) {
    let Some((first_x, min_y)) = first_changed_pixel(cur, prev) else {
        return;
    };
    let Some((last_x, max_y)) = last_changed_pixel(cur, prev) else {
        return;
    };

    let (lo, hi) = (first_x.min(last_x), first_x.max(last_x));
    let left = (0..lo)
        .find(|&x| column_changed(cur, prev, x, min_y..=max_y))
        .unwrap_or(lo);
    let right = (hi + 1..cur.width())
        .rev()
        .find(|&x| column_changed(cur, prev, x, min_y..=max_y))
        .unwrap_or(hi);

    spans.push(Span::new(left, right + 1, min_y, max_y + 1, last_x + 1));
}

/// Per-row runs of changed pixels. A run keeps going across up to
/// `merge_threshold` unchanged pixels.
pub fn scanline_exact(
    cur: &Framebuffer,
    prev: &Framebuffer,
    rows: Rows,
    merge_threshold: u32,
    spans: &mut SpanList,
) {
    let width = cur.width() as usize;
    for y in rows.iter(cur.height()) {
        let row = cur.row(y);
        let prev_row = prev.row(y);
        let mut x = 0usize;
        while x < width {
            let Some(offset) = first_difference(&row[x..], &prev_row[x..]) else {
                break;
            };
            let start = x + offset;
            let mut end = start + 1;
            let mut unchanged = 0u32;
            let mut next = end;
            while next < width {
                if row[next] != prev_row[next] {
                    end = next + 1;
                    unchanged = 0;
                } else {
                    unchanged += 1;
                    if unchanged > merge_threshold {
                        break;
                    }
                }
                next += 1;
            }
            spans.push(Span::row_run(y, start as u32, end as u32));
            // `next` is either the row end or an unchanged pixel.
            x = next + 1;
        }
    }
}

/// Packs four pixels into one word, first pixel in the low bits.
#[inline(always)]
fn quad(pixels: &[u16]) -> u64 {
    pixels[0] as u64
        | (pixels[1] as u64) << 16
        | (pixels[2] as u64) << 32
        | (pixels[3] as u64) << 48
}

/// Whether the frame geometry allows comparing rows four pixels at a time.
pub fn coarse_compatible(frame: &Framebuffer) -> bool {
    frame.width() % 4 == 0 && frame.stride() % 4 == 0
}

fn warn_coarse_fallback(frame: &Framebuffer) {
    static WARNED: AtomicBool = AtomicBool::new(false);
    if !WARNED.swap(true, Ordering::Relaxed) {
        log::warn!(
            "coarse diff needs width and stride divisible by 4 (got {}x{}, stride {}); using the exact diff",
            frame.width(),
            frame.height(),
            frame.stride()
        );
    }
}

/// Per-row runs found four pixels at a time. A run ends at the first group
/// of four unchanged pixels; a run that reaches the last group extends to
/// the row end.
pub fn scanline_coarse(cur: &Framebuffer, prev: &Framebuffer, rows: Rows, spans: &mut SpanList) {
    let width = cur.width();
    let groups = (width / 4) as usize;
    for y in rows.iter(cur.height()) {
        let row = cur.row(y);
        let prev_row = prev.row(y);
        let diff_at = |g: usize| quad(&row[g * 4..g * 4 + 4]) ^ quad(&prev_row[g * 4..g * 4 + 4]);

        let mut g = 0usize;
        while g < groups {
            let diff = diff_at(g);
            if diff == 0 {
                g += 1;
                continue;
            }
            let start = (g * 4) as u32 + diff.trailing_zeros() / 16;
            let mut last_diff = diff;
            let mut last_group = g;
            g += 1;
            while g < groups {
                let diff = diff_at(g);
                if diff == 0 {
                    break;
                }
                last_diff = diff;
                last_group = g;
                g += 1;
            }
            let end = if g >= groups {
                width
            } else {
                ((last_group * 4) as u32 + 4 - last_diff.leading_zeros() / 16).min(width)
            };
            spans.push(Span::row_run(y, start, end));
            g += 1;
        }
    }
}

/// Round span columns outward to multiples of `alignment`, clamped to the
/// frame width.
pub fn align_spans(spans: &mut SpanList, alignment: u32, width: u32) {
    if alignment <= 1 {
        return;
    }
    let ids: Vec<_> = spans.iter_ids().map(|(id, _)| id).collect();
    for id in ids {
        let span = spans.get_mut(id);
        span.x -= span.x % alignment;
        span.end_x = span.end_x.next_multiple_of(alignment).min(width);
        span.last_scan_end_x = span.last_scan_end_x.next_multiple_of(alignment).min(width);
        span.refresh_size();
    }
}
