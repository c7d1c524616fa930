//! Coalesces nearby spans so that fewer transfers pay the fixed
//! per-span command overhead.

use crate::framebuffer::BYTES_PER_PIXEL;
use crate::span::{Span, SpanList, covered_pixels};

/// Smallest span shape covering both `a` and `b`, with `a.y <= b.y`.
#[inline(always)]
fn union(a: &Span, b: &Span) -> (u32, u32, u32, u32, u32) {
    let x = a.x.min(b.x);
    let y = a.y.min(b.y);
    let end_x = a.end_x.max(b.end_x);
    let end_y = a.end_y.max(b.end_y);
    let last_scan_end_x = if end_y > a.end_y {
        b.last_scan_end_x
    } else if end_y > b.end_y {
        a.last_scan_end_x
    } else {
        a.last_scan_end_x.max(b.last_scan_end_x)
    };
    (x, end_x, y, end_y, last_scan_end_x)
}

/// Merge pairs of spans whose union wastes at most `threshold` pixels and
/// stays within `max_task_bytes` of pixel payload. Only meaningful for
/// progressive span lists.
pub fn merge_spans(spans: &mut SpanList, threshold: u32, max_task_bytes: usize) {
    let mut cursor = spans.head();
    while let Some(i) = cursor {
        let mut prev = i;
        let mut candidate = spans.get(i).next();
        while let Some(j) = candidate {
            let a = *spans.get(i);
            let b = *spans.get(j);
            // Sorted by `y`: nothing after `j` is any closer.
            if b.y > a.end_y {
                break;
            }

            let (x, end_x, y, end_y, last_scan_end_x) = union(&a, &b);
            let merged_size = covered_pixels(x, end_x, y, end_y, last_scan_end_x);
            let wasted = merged_size as i64 - a.size as i64 - b.size as i64;
            let fits = merged_size as usize * BYTES_PER_PIXEL <= max_task_bytes;
            if wasted <= threshold as i64 && fits {
                let target = spans.get_mut(i);
                target.x = x;
                target.y = y;
                target.end_x = end_x;
                target.end_y = end_y;
                target.last_scan_end_x = last_scan_end_x;
                target.size = merged_size;
                spans.unlink_after(prev);
                candidate = spans.get(prev).next();
            } else {
                prev = j;
                candidate = b.next();
            }
        }
        cursor = spans.get(i).next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SPI_TASK_SIZE;

    fn list(spans: &[Span]) -> SpanList {
        let mut list = SpanList::new();
        for span in spans {
            list.push(*span);
        }
        list
    }

    #[test]
    fn close_runs_on_one_row_merge() {
        // Changed pixels at x=3 and x=6 with two unchanged pixels between.
        let mut spans = list(&[Span::row_run(0, 3, 4), Span::row_run(0, 6, 7)]);
        let before = spans.total_pixels();
        merge_spans(&mut spans, 4, MAX_SPI_TASK_SIZE);
        let merged: Vec<Span> = spans.iter().copied().collect();
        assert_eq!(merged, vec![Span::row_run(0, 3, 7)]);
        assert_eq!(spans.total_pixels() - before, 2);
    }

    #[test]
    fn distant_runs_stay_apart() {
        let mut spans = list(&[Span::row_run(0, 0, 2), Span::row_run(0, 20, 22)]);
        merge_spans(&mut spans, 4, MAX_SPI_TASK_SIZE);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn stacked_rows_become_a_box() {
        let mut spans = list(&[
            Span::row_run(0, 2, 8),
            Span::row_run(1, 2, 8),
            Span::row_run(2, 2, 5),
        ]);
        merge_spans(&mut spans, 4, MAX_SPI_TASK_SIZE);
        let merged: Vec<Span> = spans.iter().copied().collect();
        assert_eq!(merged, vec![Span::new(2, 8, 0, 3, 5)]);
        assert_eq!(merged[0].size, 6 + 6 + 3);
    }

    #[test]
    fn enlarged_span_picks_up_later_candidates() {
        // The second row only becomes reachable once the first merge grew
        // the span's bottom edge.
        let mut spans = list(&[
            Span::row_run(0, 0, 4),
            Span::row_run(0, 6, 8),
            Span::row_run(1, 0, 8),
            Span::row_run(2, 0, 8),
        ]);
        merge_spans(&mut spans, 4, MAX_SPI_TASK_SIZE);
        let merged: Vec<Span> = spans.iter().copied().collect();
        assert_eq!(merged, vec![Span::rect(0, 0, 8, 3)]);
    }

    #[test]
    fn task_size_limit_blocks_merge() {
        let mut spans = list(&[Span::row_run(0, 0, 10), Span::row_run(1, 0, 10)]);
        merge_spans(&mut spans, 4, 30);
        assert_eq!(spans.len(), 2);
        merge_spans(&mut spans, 4, 40);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn merged_cover_is_superset() {
        let input = [
            Span::row_run(0, 1, 3),
            Span::row_run(0, 5, 6),
            Span::row_run(1, 0, 2),
            Span::row_run(3, 7, 9),
        ];
        let mut spans = list(&input);
        merge_spans(&mut spans, 6, MAX_SPI_TASK_SIZE);
        for original in &input {
            for y in original.y..original.end_y {
                let (start, end) = original.row_extent(y).unwrap();
                for x in start..end {
                    assert!(spans.iter().any(|s| s.covers(x, y)), "lost ({x},{y})");
                }
            }
        }
    }
}
