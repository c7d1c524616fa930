//! Changed-region descriptors produced by the diff engine.
//!
//! A [`Span`] covers rows `[y, end_y)` and columns `[x, end_x)`, except that
//! its last row stops at `last_scan_end_x`. Scanline diffs therefore describe
//! a "staircase" rather than a plain box. Spans live in a [`SpanList`], a flat
//! arena whose nodes are linked by index in non-decreasing `y` order.

/// Index of a span inside its [`SpanList`].
pub type SpanId = usize;

#[derive(Clone, Copy, Debug)]
pub struct Span {
    pub x: u32,
    pub end_x: u32,
    pub y: u32,
    pub end_y: u32,
    pub last_scan_end_x: u32,
    /// Exact number of pixels covered, not the bounding-box area.
    pub size: u32,
    next: Option<SpanId>,
}

impl Span {
    pub fn new(x: u32, end_x: u32, y: u32, end_y: u32, last_scan_end_x: u32) -> Self {
        debug_assert!(x < end_x && y < end_y);
        debug_assert!(last_scan_end_x > x && last_scan_end_x <= end_x);
        Self {
            x,
            end_x,
            y,
            end_y,
            last_scan_end_x,
            size: covered_pixels(x, end_x, y, end_y, last_scan_end_x),
            next: None,
        }
    }

    /// A single-row run `[x, end_x)` on row `y`.
    pub fn row_run(y: u32, x: u32, end_x: u32) -> Self {
        Self::new(x, end_x, y, y + 1, end_x)
    }

    /// An untruncated box.
    pub fn rect(x: u32, y: u32, end_x: u32, end_y: u32) -> Self {
        Self::new(x, end_x, y, end_y, end_x)
    }

    pub fn next(&self) -> Option<SpanId> {
        self.next
    }

    pub fn width(&self) -> u32 {
        self.end_x - self.x
    }

    pub fn rows(&self) -> u32 {
        self.end_y - self.y
    }

    pub fn is_multiline(&self) -> bool {
        self.end_y - self.y > 1
    }

    /// Recompute `size` after a boundary was moved.
    pub fn refresh_size(&mut self) {
        self.size = covered_pixels(self.x, self.end_x, self.y, self.end_y, self.last_scan_end_x);
    }

    /// Column range covered on row `row`, if the row is inside the span.
    pub fn row_extent(&self, row: u32) -> Option<(u32, u32)> {
        if row < self.y || row >= self.end_y {
            return None;
        }
        if row + 1 == self.end_y {
            Some((self.x, self.last_scan_end_x))
        } else {
            Some((self.x, self.end_x))
        }
    }

    pub fn covers(&self, px: u32, py: u32) -> bool {
        self.row_extent(py)
            .is_some_and(|(start, end)| px >= start && px < end)
    }
}

/// Spans compare by shape; list links are ignored.
impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x
            && self.end_x == other.end_x
            && self.y == other.y
            && self.end_y == other.end_y
            && self.last_scan_end_x == other.last_scan_end_x
            && self.size == other.size
    }
}

impl Eq for Span {}

#[inline(always)]
pub(crate) fn covered_pixels(x: u32, end_x: u32, y: u32, end_y: u32, last_scan_end_x: u32) -> u32 {
    (end_x - x) * (end_y - y - 1) + (last_scan_end_x - x)
}

/// Arena of spans linked in row order, reused across frames.
#[derive(Clone, Debug, Default)]
pub struct SpanList {
    nodes: Vec<Span>,
    head: Option<SpanId>,
    tail: Option<SpanId>,
}

impl SpanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocates room for the worst case of a `width * height` frame: a
    /// diff can never produce more than one span per two pixels.
    pub fn for_frame(width: u32, height: u32) -> Self {
        let capacity = (width as usize * height as usize).div_ceil(2) + 1;
        Self {
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Appends a span at the end of the list. Callers push in row order.
    pub fn push(&mut self, mut span: Span) -> SpanId {
        debug_assert!(self.tail.is_none_or(|t| self.nodes[t].y <= span.y));
        span.next = None;
        let id = self.nodes.len();
        self.nodes.push(span);
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    pub fn head(&self) -> Option<SpanId> {
        self.head
    }

    pub fn get(&self, id: SpanId) -> &Span {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: SpanId) -> &mut Span {
        &mut self.nodes[id]
    }

    /// Unlinks the node following `prev`. The arena slot stays allocated
    /// until the next [`clear`](Self::clear).
    pub fn unlink_after(&mut self, prev: SpanId) {
        let Some(victim) = self.nodes[prev].next else {
            return;
        };
        self.nodes[prev].next = self.nodes[victim].next;
        if self.tail == Some(victim) {
            self.tail = Some(prev);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of linked spans.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Linked spans paired with their ids.
    pub fn iter_ids(&self) -> impl Iterator<Item = (SpanId, &Span)> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            let span = &self.nodes[id];
            cursor = span.next;
            Some((id, span))
        })
    }

    /// Sum of `size` over linked spans.
    pub fn total_pixels(&self) -> u64 {
        self.iter().map(|s| s.size as u64).sum()
    }
}

pub struct SpanIter<'a> {
    list: &'a SpanList,
    cursor: Option<SpanId>,
}

impl<'a> Iterator for SpanIter<'a> {
    type Item = &'a Span;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let span = &self.list.nodes[id];
        self.cursor = span.next;
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_truncated_last_row() {
        // Rows 1..4, columns 2..10, last row stops at column 5.
        let span = Span::new(2, 10, 1, 4, 5);
        assert_eq!(span.size, 8 * 2 + 3);
        let mut counted = 0;
        for y in 0..6 {
            for x in 0..12 {
                if span.covers(x, y) {
                    counted += 1;
                }
            }
        }
        assert_eq!(counted, span.size);
    }

    #[test]
    fn single_row_span_size_is_run_length() {
        let span = Span::row_run(7, 3, 9);
        assert_eq!(span.size, 6);
        assert!(!span.is_multiline());
        assert_eq!(span.row_extent(7), Some((3, 9)));
        assert_eq!(span.row_extent(8), None);
    }

    #[test]
    fn unlink_keeps_order_and_tail() {
        let mut list = SpanList::for_frame(16, 16);
        let a = list.push(Span::row_run(0, 0, 2));
        list.push(Span::row_run(1, 0, 2));
        let c = list.push(Span::row_run(2, 0, 2));
        list.unlink_after(a);
        assert_eq!(list.len(), 2);
        let ys: Vec<u32> = list.iter().map(|s| s.y).collect();
        assert_eq!(ys, vec![0, 2]);
        list.unlink_after(a);
        assert_eq!(list.len(), 1);
        // New pushes must link after the surviving tail, not the removed one.
        let d = list.push(Span::row_run(3, 1, 4));
        assert_eq!(list.get(a).next(), Some(d));
        assert_ne!(c, d);
    }

    #[test]
    fn clear_resets_links() {
        let mut list = SpanList::new();
        list.push(Span::rect(0, 0, 4, 4));
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.total_pixels(), 0);
    }
}
