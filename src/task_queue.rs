//! Single-producer/single-consumer ring of serialized bus tasks.
//!
//! Every task is a 16-byte little-endian header followed by its payload,
//! stored contiguously. When a task does not fit before the end of the ring
//! the producer writes a header with command `0` (the wrap sentinel) and
//! continues at offset 0. `head` is written only by the consumer and `tail`
//! only by the producer, so neither side takes a lock on the hot path.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{MirrorError, MirrorResult};
use crate::sync::{EventCounter, ShutdownSignal};

pub const TASK_HEADER_BYTES: usize = 16;

/// Command byte reserved for the wrap sentinel.
pub const WRAP_SENTINEL: u8 = 0;

/// Where the consumer finds the bytes it sends after the command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Bytes stored in the ring right after the header.
    Inline,
    /// Pixels gathered from the current frame at send time.
    Framebuffer,
}

impl PayloadKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Inline => 0,
            Self::Framebuffer => 1,
        }
    }

    fn from_byte(byte: u8) -> Self {
        if byte == 1 { Self::Framebuffer } else { Self::Inline }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskHeader {
    /// Payload bytes stored in the ring.
    pub size: u32,
    pub cmd: u8,
    pub kind: PayloadKind,
    /// Span width in pixels for framebuffer-sourced tasks.
    pub width: u16,
    /// Bytes clocked out after the command.
    pub wire_len: u32,
    /// First pixel index for framebuffer-sourced tasks.
    pub fb_offset: u32,
}

impl TaskHeader {
    fn encode(&self) -> [u8; TASK_HEADER_BYTES] {
        let mut out = [0u8; TASK_HEADER_BYTES];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4] = self.cmd;
        out[5] = self.kind.to_byte();
        out[6..8].copy_from_slice(&self.width.to_le_bytes());
        out[8..12].copy_from_slice(&self.wire_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.fb_offset.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            size: word(0),
            cmd: bytes[4],
            kind: PayloadKind::from_byte(bytes[5]),
            width: u16::from_le_bytes([bytes[6], bytes[7]]),
            wire_len: word(8),
            fb_offset: word(12),
        }
    }

    fn footprint(&self) -> usize {
        TASK_HEADER_BYTES + self.size as usize
    }
}

struct TaskRing {
    buffer: Box<[UnsafeCell<u8>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    bytes_queued: AtomicUsize,
    command_bytes: usize,
    /// Bumped by the consumer whenever `head` moves.
    head_event: Arc<EventCounter>,
    /// Bumped by the producer when it publishes to an idle consumer.
    tail_event: Arc<EventCounter>,
    shutdown: Arc<ShutdownSignal>,
}

// SAFETY: the producer only writes bytes in `[tail, new_tail)`, which the
// consumer never reads until `tail` is published past them with release
// ordering, and the consumer only reads `[head, tail)`, which the producer
// does not touch until `head` moves on.
unsafe impl Sync for TaskRing {}

impl TaskRing {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// # Safety
    /// The caller must own `[offset, offset + len)` under the single-writer
    /// discipline described on [`TaskRing`].
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity());
        unsafe { std::slice::from_raw_parts_mut(self.base().add(offset), len) }
    }

    /// # Safety
    /// `[offset, offset + len)` must hold a committed, unretired task.
    unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity());
        unsafe { std::slice::from_raw_parts(self.base().add(offset), len) }
    }

    fn cost(&self, header: &TaskHeader) -> usize {
        header.wire_len as usize + self.command_bytes
    }
}

/// Create a ring of `capacity` bytes. `command_bytes` is the wire size of a
/// command word and counts towards [`TaskProducer::bytes_queued`].
pub fn task_queue(
    capacity: usize,
    command_bytes: usize,
    shutdown: &Arc<ShutdownSignal>,
) -> MirrorResult<(TaskProducer, TaskConsumer)> {
    if capacity < 3 * TASK_HEADER_BYTES || capacity > u32::MAX as usize {
        return Err(MirrorError::InvalidConfig(format!(
            "task queue capacity {capacity} is out of range"
        )));
    }
    let head_event = Arc::new(EventCounter::new());
    let tail_event = Arc::new(EventCounter::new());
    shutdown.register(head_event.clone());
    shutdown.register(tail_event.clone());

    let ring = Arc::new(TaskRing {
        buffer: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        bytes_queued: AtomicUsize::new(0),
        command_bytes,
        head_event,
        tail_event,
        shutdown: shutdown.clone(),
    });
    Ok((
        TaskProducer { ring: ring.clone() },
        TaskConsumer { ring },
    ))
}

/// Writing end of the ring. Not `Clone`: there is exactly one producer.
pub struct TaskProducer {
    ring: Arc<TaskRing>,
}

impl TaskProducer {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bus bytes (commands plus payloads) committed but not yet retired.
    pub fn bytes_queued(&self) -> usize {
        self.ring.bytes_queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.head.load(Ordering::Acquire) == self.ring.tail.load(Ordering::Acquire)
    }

    /// Largest payload a single task may carry.
    pub fn max_payload(&self) -> usize {
        self.capacity() - 2 * TASK_HEADER_BYTES - 1
    }

    /// Reserve a task whose payload is stored in the ring.
    pub fn allocate(&mut self, cmd: u8, payload_bytes: usize) -> MirrorResult<TaskWriter<'_>> {
        let header = TaskHeader {
            size: payload_bytes as u32,
            cmd,
            kind: PayloadKind::Inline,
            width: 0,
            wire_len: payload_bytes as u32,
            fb_offset: 0,
        };
        self.reserve(header, payload_bytes)
    }

    /// Reserve a task that tells the consumer to gather `pixels` pixels,
    /// `width` per row, starting at pixel index `fb_offset` of the current
    /// frame.
    pub fn allocate_framebuffer(
        &mut self,
        cmd: u8,
        fb_offset: u32,
        width: u16,
        pixels: u32,
    ) -> MirrorResult<TaskWriter<'_>> {
        let header = TaskHeader {
            size: 0,
            cmd,
            kind: PayloadKind::Framebuffer,
            width,
            wire_len: pixels * crate::framebuffer::BYTES_PER_PIXEL as u32,
            fb_offset,
        };
        self.reserve(header, 0)
    }

    /// Whether a task with `payload_bytes` of inline payload can be
    /// allocated right now without waiting for the consumer.
    pub fn fits_without_waiting(&self, payload_bytes: usize) -> bool {
        let ring = &*self.ring;
        let needed = TASK_HEADER_BYTES + payload_bytes;
        let mut tail = ring.tail.load(Ordering::Relaxed);
        let mut new_tail = tail + needed;
        let head = ring.head.load(Ordering::Acquire);
        if new_tail + TASK_HEADER_BYTES >= ring.capacity() {
            if head > tail || head == 0 {
                return false;
            }
            tail = 0;
            new_tail = needed;
        }
        !(head > tail && head <= new_tail)
    }

    fn reserve(&mut self, header: TaskHeader, payload_bytes: usize) -> MirrorResult<TaskWriter<'_>> {
        let ring = &*self.ring;
        let capacity = ring.capacity();
        let needed = TASK_HEADER_BYTES + payload_bytes;
        if needed + TASK_HEADER_BYTES >= capacity {
            return Err(MirrorError::TaskTooLarge {
                requested: payload_bytes,
                capacity: self.max_payload(),
            });
        }

        let mut tail = ring.tail.load(Ordering::Relaxed);
        let mut new_tail = tail + needed;
        if new_tail + TASK_HEADER_BYTES >= capacity {
            // The consumer must be at or behind `tail` (and off offset 0) so
            // that neither the sentinel nor the wrapped task lands on unread
            // data.
            self.wait_for_head(|head| head > tail || head == 0)?;
            let sentinel = TaskHeader {
                size: 0,
                cmd: WRAP_SENTINEL,
                kind: PayloadKind::Inline,
                width: 0,
                wire_len: 0,
                fb_offset: 0,
            };
            // SAFETY: `head <= tail`, so the consumer is not reading here.
            unsafe { ring.bytes_mut(tail, TASK_HEADER_BYTES) }.copy_from_slice(&sentinel.encode());
            ring.tail.store(0, Ordering::Release);
            if ring.head.load(Ordering::Acquire) == tail {
                ring.tail_event.signal();
            }
            log::trace!("task ring wrapped at offset {tail}");
            tail = 0;
            new_tail = needed;
        }

        self.wait_for_head(|head| head > tail && head <= new_tail)?;

        Ok(TaskWriter {
            ring,
            offset: tail,
            header,
        })
    }

    fn wait_for_head(&self, blocked: impl Fn(usize) -> bool) -> MirrorResult<()> {
        let ring = &*self.ring;
        loop {
            let seen = ring.head_event.load();
            if !blocked(ring.head.load(Ordering::Acquire)) {
                return Ok(());
            }
            if !ring.shutdown.is_running() {
                return Err(MirrorError::Canceled);
            }
            ring.head_event.wait_changed(seen, Some(Duration::from_millis(100)));
        }
    }

    /// Current write position, used to remember where a frame ended.
    pub fn tail_mark(&self) -> usize {
        self.ring.tail.load(Ordering::Relaxed)
    }

    /// Whether the consumer still has bytes queued before `mark`.
    pub fn backlog_before(&self, mark: usize) -> bool {
        let ring = &*self.ring;
        let capacity = ring.capacity();
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        (tail + capacity - head) % capacity > (tail + capacity - mark) % capacity
    }

    /// Block until every task committed before `mark` has been retired.
    /// Sleeps in coarse steps while a lot of bus time is still queued.
    pub fn wait_for_backlog(&self, mark: usize, usecs_per_byte: f64) -> MirrorResult<()> {
        let ring = &*self.ring;
        loop {
            let seen = ring.head_event.load();
            if !self.backlog_before(mark) {
                return Ok(());
            }
            if !ring.shutdown.is_running() {
                return Err(MirrorError::Canceled);
            }
            let remaining_us = self.bytes_queued() as f64 * usecs_per_byte * 0.4;
            if remaining_us > 1000.0 {
                std::thread::sleep(Duration::from_micros(500));
            } else {
                ring.head_event.wait_changed(seen, Some(Duration::from_micros(250)));
            }
        }
    }

    /// Block until the consumer has retired everything.
    pub fn wait_until_empty(&self) -> MirrorResult<()> {
        let mark = self.tail_mark();
        self.wait_for_backlog(mark, 0.0)
    }
}

/// A reserved but unpublished task. Dropping it without [`commit`] leaves
/// the ring unchanged.
///
/// [`commit`]: TaskWriter::commit
pub struct TaskWriter<'a> {
    ring: &'a TaskRing,
    offset: usize,
    header: TaskHeader,
}

impl TaskWriter<'_> {
    pub fn header(&self) -> &TaskHeader {
        &self.header
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: reserved for the producer by `reserve`.
        unsafe {
            self.ring
                .bytes_mut(self.offset + TASK_HEADER_BYTES, self.header.size as usize)
        }
    }

    /// Publish the task to the consumer.
    pub fn commit(self) {
        let ring = self.ring;
        // SAFETY: reserved for the producer by `reserve`.
        unsafe { ring.bytes_mut(self.offset, TASK_HEADER_BYTES) }
            .copy_from_slice(&self.header.encode());
        ring.bytes_queued
            .fetch_add(ring.cost(&self.header), Ordering::AcqRel);
        let new_tail = self.offset + self.header.footprint();
        // SeqCst pairs with `retire` and `is_empty`: a consumer that has just
        // caught up must either see the new tail or be seen idle here.
        ring.tail.store(new_tail, Ordering::SeqCst);
        if ring.head.load(Ordering::SeqCst) == self.offset {
            ring.tail_event.signal();
        }
    }
}

/// Reading end of the ring. Not `Clone`: there is exactly one consumer.
pub struct TaskConsumer {
    ring: Arc<TaskRing>,
}

impl TaskConsumer {
    pub fn is_empty(&self) -> bool {
        self.ring.head.load(Ordering::Relaxed) == self.ring.tail.load(Ordering::SeqCst)
    }

    pub fn bytes_queued(&self) -> usize {
        self.ring.bytes_queued.load(Ordering::Acquire)
    }

    /// Peek the oldest committed task, following a wrap sentinel if one
    /// is at the head.
    pub fn dequeue(&mut self) -> Option<Task<'_>> {
        let ring = &*self.ring;
        let mut head = ring.head.load(Ordering::Relaxed);
        let mut tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: `head != tail`, so a committed header starts at `head`.
        let mut header = TaskHeader::decode(unsafe { ring.bytes(head, TASK_HEADER_BYTES) });
        if header.cmd == WRAP_SENTINEL {
            head = 0;
            ring.head.store(0, Ordering::Release);
            ring.head_event.signal();
            tail = ring.tail.load(Ordering::Acquire);
            if tail == 0 {
                return None;
            }
            // SAFETY: as above, after the wrap.
            header = TaskHeader::decode(unsafe { ring.bytes(0, TASK_HEADER_BYTES) });
        }
        Some(Task {
            ring,
            offset: head,
            header,
        })
    }

    /// Block until a task is available. Returns `false` on shutdown.
    pub fn wait_for_task(&self, timeout: Option<Duration>) -> bool {
        let ring = &*self.ring;
        loop {
            let seen = ring.tail_event.load();
            if !self.is_empty() {
                return true;
            }
            if !ring.shutdown.is_running() {
                return false;
            }
            let now = ring.tail_event.wait_changed(seen, timeout);
            if timeout.is_some() && now == seen {
                return !self.is_empty();
            }
        }
    }
}

/// A committed task at the head of the ring.
pub struct Task<'a> {
    ring: &'a TaskRing,
    offset: usize,
    header: TaskHeader,
}

impl Task<'_> {
    pub fn header(&self) -> &TaskHeader {
        &self.header
    }

    pub fn cmd(&self) -> u8 {
        self.header.cmd
    }

    pub fn kind(&self) -> PayloadKind {
        self.header.kind
    }

    /// Bytes sent after the command word.
    pub fn wire_len(&self) -> usize {
        self.header.wire_len as usize
    }

    /// Bytes the task puts on the bus: the command word plus [`Self::wire_len`].
    pub fn bus_bytes(&self) -> usize {
        self.ring.cost(&self.header)
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: the task is committed and not yet retired.
        unsafe {
            self.ring
                .bytes(self.offset + TASK_HEADER_BYTES, self.header.size as usize)
        }
    }

    /// Offset of the task header in the ring.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Release the task's bytes back to the producer.
    pub fn retire(self) {
        let ring = self.ring;
        ring.bytes_queued
            .fetch_sub(ring.cost(&self.header), Ordering::AcqRel);
        ring.head
            .store(self.offset + self.header.footprint(), Ordering::SeqCst);
        ring.head_event.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (TaskProducer, TaskConsumer) {
        task_queue(capacity, 1, &ShutdownSignal::new()).unwrap()
    }

    fn push(producer: &mut TaskProducer, cmd: u8, payload: &[u8]) -> usize {
        let mut writer = producer.allocate(cmd, payload.len()).unwrap();
        writer.payload_mut().copy_from_slice(payload);
        let offset = writer.offset;
        writer.commit();
        offset
    }

    #[test]
    fn tasks_come_out_in_commit_order() {
        let (mut producer, mut consumer) = queue(256);
        push(&mut producer, 0x2A, &[0, 1, 0, 9]);
        push(&mut producer, 0x2C, &[0xAB; 6]);
        assert_eq!(producer.bytes_queued(), 5 + 7);

        let task = consumer.dequeue().unwrap();
        assert_eq!(task.cmd(), 0x2A);
        assert_eq!(task.payload(), &[0, 1, 0, 9]);
        task.retire();
        let task = consumer.dequeue().unwrap();
        assert_eq!(task.cmd(), 0x2C);
        assert_eq!(task.wire_len(), 6);
        task.retire();
        assert!(consumer.dequeue().is_none());
        assert_eq!(producer.bytes_queued(), 0);
    }

    #[test]
    fn uncommitted_task_is_invisible() {
        let (mut producer, mut consumer) = queue(128);
        let writer = producer.allocate(0x2C, 4).unwrap();
        assert!(consumer.dequeue().is_none());
        drop(writer);
        assert!(consumer.dequeue().is_none());
    }

    #[test]
    fn wrap_writes_sentinel_and_restarts_at_zero() {
        // Three tasks of 24 bytes (header + 8) end at 72. A fourth would end
        // at 96, and 96 + 16 >= 100, so it must wrap.
        let (mut producer, mut consumer) = queue(100);
        for cmd in 1..=3u8 {
            push(&mut producer, cmd, &[cmd; 8]);
        }
        assert_eq!(producer.tail_mark(), 72);

        // Drain two tasks so the producer may wrap: head must be > 0 and
        // not ahead of tail.
        for _ in 0..2 {
            consumer.dequeue().unwrap().retire();
        }

        let offset = push(&mut producer, 4, &[4; 8]);
        assert_eq!(offset, 0);
        assert_eq!(producer.tail_mark(), 24);

        let sentinel = TaskHeader::decode(unsafe { producer.ring.bytes(72, TASK_HEADER_BYTES) });
        assert_eq!(sentinel.cmd, WRAP_SENTINEL);

        let third = consumer.dequeue().unwrap();
        assert_eq!(third.cmd(), 3);
        third.retire();
        let fourth = consumer.dequeue().unwrap();
        assert_eq!(fourth.cmd(), 4);
        assert_eq!(fourth.offset(), 0);
        fourth.retire();
        assert!(consumer.dequeue().is_none());
    }

    #[test]
    fn oversized_task_is_rejected() {
        let (mut producer, _consumer) = queue(64);
        assert!(matches!(
            producer.allocate(0x2C, 40),
            Err(MirrorError::TaskTooLarge { requested: 40, .. })
        ));
        assert!(producer.allocate(0x2C, producer.max_payload()).is_ok());
    }

    #[test]
    fn full_ring_reports_backpressure() {
        let (mut producer, mut consumer) = queue(100);
        push(&mut producer, 1, &[0; 8]);
        push(&mut producer, 2, &[0; 8]);
        push(&mut producer, 3, &[0; 8]);
        assert!(!producer.fits_without_waiting(8));
        // Head at 24 would coincide with the wrapped task's end.
        consumer.dequeue().unwrap().retire();
        assert!(!producer.fits_without_waiting(8));
        consumer.dequeue().unwrap().retire();
        assert!(producer.fits_without_waiting(8));
    }

    #[test]
    fn backlog_tracks_frame_marks() {
        let (mut producer, mut consumer) = queue(256);
        push(&mut producer, 1, &[0; 4]);
        let mark = producer.tail_mark();
        push(&mut producer, 2, &[0; 4]);
        assert!(producer.backlog_before(mark));
        consumer.dequeue().unwrap().retire();
        assert!(!producer.backlog_before(mark));
    }

    #[test]
    fn framebuffer_tasks_carry_gather_parameters() {
        let (mut producer, mut consumer) = queue(128);
        producer.allocate_framebuffer(0x2C, 645, 10, 25).unwrap().commit();
        let task = consumer.dequeue().unwrap();
        assert_eq!(task.kind(), PayloadKind::Framebuffer);
        assert_eq!(task.header().fb_offset, 645);
        assert_eq!(task.header().width, 10);
        assert_eq!(task.wire_len(), 50);
        assert!(task.payload().is_empty());
    }

    #[test]
    fn producer_and_consumer_threads_keep_order() {
        let shutdown = ShutdownSignal::new();
        let (mut producer, mut consumer) = task_queue(200, 1, &shutdown).unwrap();
        let writer = std::thread::spawn(move || {
            for i in 0..2000u32 {
                let len = (i % 13) as usize + 1;
                let mut task = producer.allocate(1 + (i % 200) as u8, len).unwrap();
                task.payload_mut().fill(i as u8);
                task.commit();
            }
        });

        let mut seen = 0u32;
        while seen < 2000 {
            if !consumer.wait_for_task(Some(Duration::from_secs(5))) {
                break;
            }
            while let Some(task) = consumer.dequeue() {
                assert_eq!(task.cmd(), 1 + (seen % 200) as u8);
                assert_eq!(task.payload().len(), (seen % 13) as usize + 1);
                assert!(task.payload().iter().all(|&b| b == seen as u8));
                task.retire();
                seen += 1;
            }
        }
        writer.join().unwrap();
        assert_eq!(seen, 2000);
    }

    #[test]
    fn shutdown_cancels_blocked_producer() {
        let shutdown = ShutdownSignal::new();
        let (mut producer, _consumer) = task_queue(100, 1, &shutdown).unwrap();
        for _ in 0..3 {
            producer.allocate(1, 8).unwrap().commit();
        }
        let stopper = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.stop();
        });
        assert!(matches!(producer.allocate(1, 8), Err(MirrorError::Canceled)));
        handle.join().unwrap();
    }
}
