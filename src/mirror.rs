//! The mirror loop: take the newest frame, diff it against what the panel
//! shows, and turn the changed spans into cursor and pixel tasks.
//!
//! [`MirrorHandle`] wires the whole pipeline together: the frame poller,
//! the mirror loop on its own thread and either a dedicated bus thread or an
//! inline drain in the single-thread topology.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bus::{BusWorker, drain_queue};
use crate::config::{DiffStrategy, InterlacePolicy, MirrorConfig, Topology};
use crate::diff::{DiffEngine, Rows};
use crate::error::{MirrorError, MirrorResult};
use crate::framebuffer::{BYTES_PER_PIXEL, Framebuffer};
use crate::merge::merge_spans;
use crate::panel::{DISPLAY_OFF, DISPLAY_ON, PanelProfile, SET_CURSOR_X, SET_CURSOR_Y, WRITE_PIXELS};
use crate::pixels::{copy_swap_and_update, copy_swap_to_wire, count_changed_pixels};
use crate::source::{FrameExchange, FramePoller, FrameSource};
use crate::span::{Span, SpanId, SpanList};
use crate::sync::ShutdownSignal;
use crate::task_queue::{TaskConsumer, TaskProducer, task_queue};
use crate::timing::FrameTimingPredictor;
use crate::transfer::{FramePair, TransferBackend};

/// Window over which the displayed frame rate is measured.
pub const FRAMERATE_HISTORY_LENGTH: Duration = Duration::from_millis(400);

/// Slack on top of the predicted arrival when pacing interlaced fields.
const INTERLACE_THROTTLE_SLACK: Duration = Duration::from_micros(750);
const MAX_INTERLACE_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct MirrorStats {
    pub cycles: AtomicU64,
    pub frames_submitted: AtomicU64,
    pub interlaced_frames: AtomicU64,
    /// Frames published by the poller that the loop never looked at.
    pub frames_skipped: AtomicU64,
    pub bytes_submitted: AtomicU64,
    pub spans_submitted: AtomicU64,
    pub changed_pixels: AtomicU64,
    /// Source polls that found nothing new.
    pub wasted_polls: AtomicU64,
    displayed_fps: AtomicU64,
}

impl MirrorStats {
    pub fn displayed_fps(&self) -> f64 {
        f64::from_bits(self.displayed_fps.load(Ordering::Relaxed))
    }

    fn set_displayed_fps(&self, fps: f64) {
        self.displayed_fps.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            interlaced_frames: self.interlaced_frames.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            bytes_submitted: self.bytes_submitted.load(Ordering::Relaxed),
            spans_submitted: self.spans_submitted.load(Ordering::Relaxed),
            changed_pixels: self.changed_pixels.load(Ordering::Relaxed),
            wasted_polls: self.wasted_polls.load(Ordering::Relaxed),
            displayed_fps: self.displayed_fps(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MirrorStatsSnapshot {
    pub cycles: u64,
    pub frames_submitted: u64,
    pub interlaced_frames: u64,
    pub frames_skipped: u64,
    pub bytes_submitted: u64,
    pub spans_submitted: u64,
    pub changed_pixels: u64,
    pub wasted_polls: u64,
    pub displayed_fps: f64,
}

/// Outcome of one [`MirrorLoop::cycle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub new_frame: bool,
    pub interlaced: bool,
    pub changed_pixels: usize,
    pub spans: usize,
    /// Bytes queued for the bus, command words included.
    pub bytes: usize,
}

/// Window origin the panel will write the next pixel task to.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    x: i64,
    y: i64,
    end_x: u32,
}

struct InlineBus {
    consumer: TaskConsumer,
    backend: Box<dyn TransferBackend>,
}

pub struct MirrorLoop {
    config: MirrorConfig,
    panel: PanelProfile,
    engine: DiffEngine,
    interlace: InterlacePolicy,
    merge_threshold: u32,
    max_task_bytes: usize,
    full_cursor_windows: bool,
    keep_previous: bool,
    usecs_per_byte: f64,
    timeslice: Duration,

    producer: TaskProducer,
    inline: Option<InlineBus>,
    exchange: Arc<FrameExchange>,
    shutdown: Arc<ShutdownSignal>,

    current: Framebuffer,
    previous: Framebuffer,
    spans: SpanList,
    cursor: Cursor,
    parity: u32,
    interlaced: bool,
    prev_frame_end: usize,
    cur_frame_end: usize,

    display_off: bool,
    contents_last_changed: Instant,
    history: VecDeque<(Instant, bool)>,
    stats: Arc<MirrorStats>,
}

impl MirrorLoop {
    /// `inline` carries the consumer side of the queue when the loop drains
    /// it itself; it must be present exactly in the single-thread topology.
    pub fn new(
        config: MirrorConfig,
        panel: PanelProfile,
        producer: TaskProducer,
        inline: Option<(TaskConsumer, Box<dyn TransferBackend>)>,
        exchange: Arc<FrameExchange>,
        shutdown: Arc<ShutdownSignal>,
    ) -> MirrorResult<Self> {
        config.validate(&panel)?;
        let (width, height) = exchange.dimensions();
        if width > panel.width || height > panel.height {
            return Err(MirrorError::DimensionMismatch {
                expected: (panel.width, panel.height),
                actual: (width, height),
            });
        }
        let single_thread = config.topology == Topology::SingleThread;
        if single_thread != inline.is_some() {
            return Err(MirrorError::InvalidConfig(
                "the single-thread topology drains the queue inline and no other topology may"
                    .into(),
            ));
        }

        let merge_threshold = config.merge_threshold_for(&panel);
        let engine = DiffEngine::new(config.diff_strategy, merge_threshold, config.span_alignment);

        Ok(Self {
            interlace: config.effective_interlace(),
            merge_threshold,
            max_task_bytes: config.max_task_bytes(),
            full_cursor_windows: config.full_cursor_windows(),
            keep_previous: config.diff_strategy != DiffStrategy::NoDiff,
            usecs_per_byte: config.bus_usecs_per_byte(),
            timeslice: config.timeslice_for(&panel),
            engine,
            producer,
            inline: inline.map(|(consumer, backend)| InlineBus { consumer, backend }),
            exchange,
            shutdown,
            current: Framebuffer::new(width, height)?,
            previous: Framebuffer::new(width, height)?,
            spans: SpanList::new(),
            cursor: Cursor {
                x: -1,
                y: -1,
                end_x: width,
            },
            parity: 0,
            interlaced: false,
            prev_frame_end: 0,
            cur_frame_end: 0,
            display_off: false,
            contents_last_changed: Instant::now(),
            history: VecDeque::new(),
            stats: Arc::new(MirrorStats::default()),
            config,
            panel,
        })
    }

    pub fn stats(&self) -> &Arc<MirrorStats> {
        &self.stats
    }

    pub fn is_display_off(&self) -> bool {
        self.display_off
    }

    /// Send the panel's init sequence, honoring the delay after each step.
    pub fn initialize_panel(&mut self) -> MirrorResult<()> {
        let steps = self.panel.init_sequence.clone();
        for step in &steps {
            self.queue_command(step.command, &step.params)?;
            if !step.delay.is_zero() {
                self.flush()?;
                std::thread::sleep(step.delay);
            }
        }
        self.flush()?;
        log::info!(
            "{} initialized ({} steps), mirroring {}x{}",
            self.panel.name,
            steps.len(),
            self.current.width(),
            self.current.height()
        );
        Ok(())
    }

    /// Cycle until shutdown is requested.
    pub fn run(&mut self) -> MirrorResult<()> {
        while self.shutdown.is_running() {
            match self.cycle() {
                Ok(_) => {}
                Err(MirrorError::Canceled) => break,
                Err(error) => return Err(error),
            }
        }
        if let Some(inline) = self.inline.as_mut() {
            let mut frames = FramePair {
                current: &self.current,
                previous: &mut self.previous,
            };
            drain_queue(&mut inline.consumer, inline.backend.as_mut(), Some(&mut frames))?;
            inline.backend.wait_until_idle()?;
        }
        Ok(())
    }

    /// Wait for work, then diff and submit one frame or field.
    /// Returns [`MirrorError::Canceled`] once shutdown is requested.
    pub fn cycle(&mut self) -> MirrorResult<CycleReport> {
        let prev_interlaced = self.interlaced;
        self.wait_for_work(prev_interlaced)?;
        self.producer
            .wait_for_backlog(self.prev_frame_end, self.usecs_per_byte)?;

        let now = Instant::now();
        while self
            .history
            .front()
            .is_some_and(|&(at, _)| now.saturating_duration_since(at) > FRAMERATE_HISTORY_LENGTH)
        {
            self.history.pop_front();
        }

        let taken = if self.exchange.pending() > 0 {
            self.exchange.take(&mut self.current)?
        } else {
            0
        };
        let new_frame = taken > 0;
        if taken > 1 {
            self.stats
                .frames_skipped
                .fetch_add(u64::from(taken - 1), Ordering::Relaxed);
        }

        let changed = if new_frame {
            count_changed_pixels(&self.current, &self.previous)
        } else {
            0
        };
        let interlaced = self.should_interlace(changed, now);
        if interlaced {
            self.parity = 1 - self.parity;
        }
        self.interlaced = interlaced;

        self.spans.clear();
        if new_frame || prev_interlaced {
            let rows = if interlaced {
                Rows::Field(self.parity)
            } else {
                Rows::All
            };
            self.engine
                .diff(&self.current, &self.previous, rows, &mut self.spans)?;
            if !interlaced {
                merge_spans(&mut self.spans, self.merge_threshold, self.max_task_bytes);
            }
        }

        let (spans, bytes) = if self.display_off {
            (0, 0)
        } else {
            self.submit_spans()?
        };

        if bytes > 0 {
            self.prev_frame_end = self.cur_frame_end;
            self.cur_frame_end = self.producer.tail_mark();
            self.history.push_back((now, interlaced || prev_interlaced));
            self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
            if interlaced {
                self.stats.interlaced_frames.fetch_add(1, Ordering::Relaxed);
            }
            self.stats
                .bytes_submitted
                .fetch_add(bytes as u64, Ordering::Relaxed);
            self.stats
                .spans_submitted
                .fetch_add(spans as u64, Ordering::Relaxed);
        }
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .changed_pixels
            .fetch_add(changed as u64, Ordering::Relaxed);
        self.stats
            .wasted_polls
            .store(self.exchange.wasted_polls(), Ordering::Relaxed);
        self.stats
            .set_displayed_fps(self.history.len() as f64 / FRAMERATE_HISTORY_LENGTH.as_secs_f64());

        self.update_display_power(changed, now)?;

        log::debug!(
            "cycle: new={new_frame} interlaced={interlaced} changed={changed} spans={spans} bytes={bytes}"
        );
        Ok(CycleReport {
            new_frame,
            interlaced,
            changed_pixels: changed,
            spans,
            bytes,
        })
    }

    fn wait_for_work(&mut self, prev_interlaced: bool) -> MirrorResult<()> {
        if prev_interlaced {
            // The other field is still owed; only pace it.
            if self.config.throttle_interlacing {
                let now = Instant::now();
                let predicted = self.exchange.predictor().predict_next_arrival(now);
                let wait = (predicted + INTERLACE_THROTTLE_SLACK)
                    .saturating_duration_since(now)
                    .clamp(Duration::from_micros(1), MAX_INTERLACE_THROTTLE);
                self.exchange.wait_for_frame(Some(wait));
            }
        } else {
            let started = Instant::now();
            let display_off_after = self.config.display_off_after;
            while self.exchange.pending() == 0 {
                if !self.shutdown.is_running() {
                    return Err(MirrorError::Canceled);
                }
                match display_off_after {
                    Some(limit) if !self.display_off => {
                        let waited = started.elapsed();
                        if waited >= limit {
                            self.set_display_power(false)?;
                            continue;
                        }
                        self.exchange.wait_for_frame(Some(limit - waited));
                    }
                    _ => {
                        self.exchange.wait_for_frame(None);
                    }
                }
            }
        }
        if !self.shutdown.is_running() {
            return Err(MirrorError::Canceled);
        }
        Ok(())
    }

    fn should_interlace(&mut self, changed: usize, now: Instant) -> bool {
        match self.interlace {
            InterlacePolicy::Never => false,
            InterlacePolicy::Always => changed > 0,
            InterlacePolicy::Adaptive => {
                let estimate = self.exchange.predictor().estimate_interval(now);
                let input_fps = 1.0 / estimate.as_secs_f64().max(1e-6);
                let desired_fps = input_fps.min(f64::from(self.config.target_fps)).max(1.0);
                let budget_us = self.timeslice.as_secs_f64() * 1e6 / desired_fps;
                let bytes = changed * BYTES_PER_PIXEL
                    + self.current.height() as usize * 2
                    + self.producer.bytes_queued();
                bytes as f64 * self.usecs_per_byte > budget_us
            }
        }
    }

    fn submit_spans(&mut self) -> MirrorResult<(usize, usize)> {
        let width = self.current.width();
        let height = self.current.height();
        let must_send_window = self.panel.must_send_full_cursor_window;
        let mut submitted = 0;
        let mut bytes = 0;

        let mut next = self.spans.head();
        while let Some(id) = next {
            let mut span = *self.spans.get(id);
            next = span.next();

            // Pixel tasks under four bytes cannot be sent through DMA.
            if self.full_cursor_windows && span.size == 1 {
                widen_single_pixel(&mut span, width);
            }

            if self.cursor.y != i64::from(span.y) {
                bytes += if self.full_cursor_windows || must_send_window {
                    self.queue_window(SET_CURSOR_Y, span.y, height - 1)?
                } else {
                    self.queue_cursor_move(SET_CURSOR_Y, span.y)?
                };
                self.cursor.y = i64::from(span.y);
            }

            let x = i64::from(span.x);
            if span.is_multiline() && (self.cursor.x != x || self.cursor.end_x != span.end_x) {
                bytes += self.queue_window(SET_CURSOR_X, span.x, span.end_x - 1)?;
                self.cursor.x = x;
                self.cursor.end_x = span.end_x;
            } else if self.full_cursor_windows {
                if self.cursor.x != x || self.cursor.end_x < span.end_x {
                    bytes += self.queue_window(SET_CURSOR_X, span.x, width - 1)?;
                    self.cursor.x = x;
                    self.cursor.end_x = width;
                }
            } else if self.cursor.end_x < span.end_x {
                // Open the window wide enough for the next multiline span
                // too, so it does not need a window of its own.
                let end_x = self.next_multiline_end_x(next, span.end_x, width);
                bytes += self.queue_window(SET_CURSOR_X, span.x, end_x - 1)?;
                self.cursor.x = x;
                self.cursor.end_x = end_x;
            } else if self.cursor.x != x {
                bytes += if must_send_window {
                    self.queue_window(SET_CURSOR_X, span.x, self.cursor.end_x - 1)?
                } else {
                    self.queue_cursor_move(SET_CURSOR_X, span.x)?
                };
                self.cursor.x = x;
            }

            bytes += self.queue_pixels(&span)?;
            submitted += 1;
        }
        Ok((submitted, bytes))
    }

    fn next_multiline_end_x(&self, from: Option<SpanId>, end_x: u32, width: u32) -> u32 {
        let mut next = from;
        while let Some(id) = next {
            let span = self.spans.get(id);
            if span.is_multiline() {
                return if span.end_x >= end_x { span.end_x } else { width };
            }
            next = span.next();
        }
        width
    }

    fn queue_command(&mut self, command: u8, params: &[u8]) -> MirrorResult<usize> {
        self.make_room(params.len())?;
        let mut task = self.producer.allocate(command, params.len())?;
        task.payload_mut().copy_from_slice(params);
        task.commit();
        self.run_inline()?;
        Ok(params.len() + self.panel.command_bytes())
    }

    fn queue_cursor_move(&mut self, command: u8, start: u32) -> MirrorResult<usize> {
        let mut params = [0u8; 4];
        let len = self.panel.encode_cursor_move(coordinate(start)?, &mut params);
        self.queue_command(command, &params[..len])
    }

    fn queue_window(&mut self, command: u8, start: u32, end: u32) -> MirrorResult<usize> {
        let mut params = [0u8; 8];
        let len = self
            .panel
            .encode_window(coordinate(start)?, coordinate(end)?, &mut params);
        self.queue_command(command, &params[..len])
    }

    fn queue_pixels(&mut self, span: &Span) -> MirrorResult<usize> {
        let pixel_bytes = span.size as usize * BYTES_PER_PIXEL;
        if self.config.offload_pixel_copy {
            self.make_room(0)?;
            let offset = u32::try_from(self.current.index_of(span.x, span.y)).map_err(|_| {
                MirrorError::InvalidConfig("framebuffer too large to offload the pixel copy".into())
            })?;
            let width = u16::try_from(span.end_x - span.x).map_err(|_| {
                MirrorError::InvalidConfig(format!("span width {} overflows", span.end_x - span.x))
            })?;
            self.producer
                .allocate_framebuffer(WRITE_PIXELS, offset, width, span.size)?
                .commit();
        } else {
            self.make_room(pixel_bytes)?;
            let mut task = self.producer.allocate(WRITE_PIXELS, pixel_bytes)?;
            let out = task.payload_mut();
            let mut written = 0;
            for y in span.y..span.end_y {
                let end_x = if y + 1 == span.end_y {
                    span.last_scan_end_x
                } else {
                    span.end_x
                };
                let (start, end) = (span.x as usize, end_x as usize);
                let len = (end - start) * BYTES_PER_PIXEL;
                let dst = &mut out[written..written + len];
                let src = &self.current.row(y)[start..end];
                if self.keep_previous {
                    copy_swap_and_update(src, &mut self.previous.row_mut(y)[start..end], dst);
                } else {
                    copy_swap_to_wire(src, dst);
                }
                written += len;
            }
            task.commit();
        }
        self.run_inline()?;
        Ok(pixel_bytes + self.panel.command_bytes())
    }

    /// In the single-thread topology, drain the queue first if the next
    /// task would otherwise block on space nobody is freeing.
    fn make_room(&mut self, payload_bytes: usize) -> MirrorResult<()> {
        if self.inline.is_some() && !self.producer.fits_without_waiting(payload_bytes) {
            self.run_inline()?;
        }
        Ok(())
    }

    fn run_inline(&mut self) -> MirrorResult<()> {
        if let Some(inline) = self.inline.as_mut() {
            let mut frames = FramePair {
                current: &self.current,
                previous: &mut self.previous,
            };
            drain_queue(&mut inline.consumer, inline.backend.as_mut(), Some(&mut frames))?;
        }
        Ok(())
    }

    /// Wait until everything queued so far is on the wire.
    fn flush(&mut self) -> MirrorResult<()> {
        if self.inline.is_some() {
            self.run_inline()?;
            if let Some(inline) = self.inline.as_mut() {
                inline.backend.wait_until_idle()?;
            }
            Ok(())
        } else {
            self.producer.wait_until_empty()
        }
    }

    fn set_display_power(&mut self, on: bool) -> MirrorResult<()> {
        self.queue_command(if on { DISPLAY_ON } else { DISPLAY_OFF }, &[])?;
        self.display_off = !on;
        log::info!("display turned {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn update_display_power(&mut self, changed: usize, now: Instant) -> MirrorResult<()> {
        let Some(limit) = self.config.display_off_after else {
            return Ok(());
        };
        let fraction = changed as f64 / self.current.pixel_count().max(1) as f64;
        if fraction > self.config.inactive_fraction {
            self.contents_last_changed = now;
            // Only the panel wakes here. The changes that woke it go out
            // with the next source frame.
            if self.display_off {
                self.set_display_power(true)?;
            }
        } else if !self.display_off && now.saturating_duration_since(self.contents_last_changed) > limit {
            self.set_display_power(false)?;
        }
        Ok(())
    }
}

fn coordinate(value: u32) -> MirrorResult<u16> {
    u16::try_from(value)
        .map_err(|_| MirrorError::InvalidConfig(format!("coordinate {value} does not fit the panel")))
}

fn widen_single_pixel(span: &mut Span, width: u32) {
    if span.end_x < width {
        span.end_x += 1;
        span.last_scan_end_x += 1;
    } else if span.x > 0 {
        span.x -= 1;
    } else {
        return;
    }
    span.size += 1;
}

/// A running pipeline. Dropping it stops every thread and joins them.
pub struct MirrorHandle {
    shutdown: Arc<ShutdownSignal>,
    stats: Arc<MirrorStats>,
    exchange: Arc<FrameExchange>,
    poller: Option<FramePoller>,
    bus: Option<BusWorker>,
    mirror_thread: Option<JoinHandle<()>>,
}

impl MirrorHandle {
    /// Start mirroring `source` onto `panel` through `backend`.
    ///
    /// `shutdown` must be the signal the backend was built with, so that
    /// stopping the pipeline also aborts waits inside the backend.
    pub fn start(
        source: Box<dyn FrameSource>,
        backend: Box<dyn TransferBackend>,
        panel: PanelProfile,
        config: MirrorConfig,
        shutdown: &Arc<ShutdownSignal>,
    ) -> MirrorResult<Self> {
        config.validate(&panel)?;
        let (width, height) = source.dimensions();
        if width > panel.width || height > panel.height {
            return Err(MirrorError::DimensionMismatch {
                expected: (panel.width, panel.height),
                actual: (width, height),
            });
        }

        crate::pixels::warmup();
        let now = Instant::now();
        let mut predictor = FrameTimingPredictor::from_config(&config, now);
        predictor.warm_fill(now);
        let exchange = FrameExchange::new(width, height, predictor, shutdown)?;
        let (producer, consumer) =
            task_queue(config.queue_bytes_for(&panel), panel.command_bytes(), shutdown)?;

        let (bus, inline) = match config.topology {
            Topology::DedicatedBusThread => (Some(BusWorker::spawn(consumer, backend, shutdown)?), None),
            Topology::SingleThread => (None, Some((consumer, backend))),
        };

        log::info!(
            "mirroring {width}x{height} to {} ({:?}, {:?}, {:?})",
            panel.name,
            config.transfer_mode,
            config.topology,
            config.diff_strategy
        );
        let mut mirror = MirrorLoop::new(config, panel, producer, inline, exchange.clone(), shutdown.clone())?;
        let stats = mirror.stats().clone();
        let poller = FramePoller::spawn(source, exchange.clone(), shutdown)?;

        let thread_shutdown = shutdown.clone();
        let mirror_thread = std::thread::Builder::new()
            .name("fbmirror-main".to_string())
            .spawn(move || {
                match mirror.initialize_panel().and_then(|()| mirror.run()) {
                    Ok(()) | Err(MirrorError::Canceled) => log::info!("mirror loop stopped"),
                    Err(error) => thread_shutdown.fail(error),
                }
                thread_shutdown.stop();
            })
            .map_err(|e| {
                MirrorError::Platform(anyhow::anyhow!("failed to spawn mirror thread: {e}"))
            })?;

        Ok(Self {
            shutdown: shutdown.clone(),
            stats,
            exchange,
            poller: Some(poller),
            bus,
            mirror_thread: Some(mirror_thread),
        })
    }

    pub fn stats(&self) -> MirrorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn frames_published(&self) -> u64 {
        self.exchange.frames_published()
    }

    pub fn shutdown_signal(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// Ask the pipeline to stop. Counts as one shutdown request.
    pub fn stop(&self) {
        self.shutdown.request();
    }

    pub fn is_running(&self) -> bool {
        self.mirror_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for every thread to exit and return the first fatal error.
    pub fn join(mut self) -> MirrorResult<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> MirrorResult<()> {
        let mut panicked = false;
        if let Some(handle) = self.mirror_thread.take() {
            panicked |= handle.join().is_err();
        }
        self.shutdown.stop();
        if let Some(poller) = self.poller.take() {
            panicked |= matches!(poller.join(), Err(MirrorError::WorkerDead));
        }
        if let Some(bus) = self.bus.take() {
            panicked |= matches!(bus.join(), Err(MirrorError::WorkerDead));
        }
        if let Some(error) = self.shutdown.fatal_error() {
            return Err(error);
        }
        if panicked {
            return Err(MirrorError::WorkerDead);
        }
        Ok(())
    }
}

impl Drop for MirrorHandle {
    fn drop(&mut self) {
        if self.mirror_thread.is_some() {
            self.shutdown.stop();
            let _ = self.join_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferMode;
    use crate::hw::{DmaMemory, PanelModel, SimulatedBus, WireTap};
    use crate::source::TestPattern;
    use crate::transfer::{DmaBackend, PolledBackend};

    struct Rig {
        mirror: MirrorLoop,
        exchange: Arc<FrameExchange>,
        tap: WireTap,
        shutdown: Arc<ShutdownSignal>,
    }

    fn rig(mut config: MirrorConfig, width: u32, height: u32) -> Rig {
        config.topology = Topology::SingleThread;
        config.spi_clock_divisor = 2;
        config.dma.idle_timeout = Duration::from_millis(20);
        config.dma.kickoff_timeout = Duration::from_millis(20);
        config.dma.poll_interval = Duration::from_millis(1);
        let panel = PanelProfile::ili9341().with_resolution(width, height);
        let shutdown = ShutdownSignal::new();
        let tap = WireTap::with_panel(PanelModel::new(width, height, false));
        let bus = SimulatedBus::new(DmaMemory::new(256, 64 * 1024), tap.clone());
        let backend: Box<dyn TransferBackend> = if config.transfer_mode == TransferMode::Polled {
            Box::new(PolledBackend::new(bus, false))
        } else {
            Box::new(DmaBackend::new(bus, &config, &panel, &shutdown).unwrap())
        };
        let predictor = FrameTimingPredictor::from_config(&config, Instant::now());
        let exchange = FrameExchange::new(width, height, predictor, &shutdown).unwrap();
        let (producer, consumer) = task_queue(
            config.queue_bytes_for(&panel),
            panel.command_bytes(),
            &shutdown,
        )
        .unwrap();
        let mirror = MirrorLoop::new(
            config,
            panel,
            producer,
            Some((consumer, backend)),
            exchange.clone(),
            shutdown.clone(),
        )
        .unwrap();
        Rig {
            mirror,
            exchange,
            tap,
            shutdown,
        }
    }

    fn pattern(width: u32, height: u32) -> Framebuffer {
        let mut frame = Framebuffer::new(width, height).unwrap();
        TestPattern::new(width, height, 60).with_bar(4, 3).render(&mut frame);
        frame
    }

    fn shown(tap: &WireTap) -> Vec<u16> {
        tap.with_panel_model(|panel| panel.pixels().to_vec()).unwrap()
    }

    fn command_count(tap: &WireTap, command: u8) -> u64 {
        tap.with_panel_model(|panel| panel.command_count(command)).unwrap()
    }

    fn never_interlace() -> MirrorConfig {
        MirrorConfig {
            transfer_mode: TransferMode::Polled,
            interlace: InterlacePolicy::Never,
            ..MirrorConfig::default()
        }
    }

    #[test]
    fn first_frame_is_painted_then_only_changes_are_sent() {
        let mut rig = rig(never_interlace(), 32, 16);
        let mut frame = pattern(32, 16);
        rig.exchange.publish(&frame).unwrap();

        let report = rig.mirror.cycle().unwrap();
        assert!(report.new_frame);
        assert!(!report.interlaced);
        assert_eq!(report.changed_pixels, 32 * 16);
        assert_eq!(shown(&rig.tap), frame.as_pixels());

        frame.set_pixel(5, 7, 0x1234);
        frame.set_pixel(20, 9, 0x4321);
        rig.exchange.publish(&frame).unwrap();
        let report = rig.mirror.cycle().unwrap();
        assert_eq!(report.changed_pixels, 2);
        assert_eq!(report.spans, 2);
        assert!(report.bytes < 64);
        assert_eq!(shown(&rig.tap), frame.as_pixels());
        assert_eq!(rig.mirror.stats().snapshot().frames_submitted, 2);
    }

    #[test]
    fn cursor_is_only_moved_when_needed() {
        let mut rig = rig(never_interlace(), 32, 16);
        let mut frame = pattern(32, 16);
        rig.exchange.publish(&frame).unwrap();
        rig.mirror.cycle().unwrap();
        // One merged rectangle: one Y move, one X window, one pixel task.
        assert_eq!(command_count(&rig.tap, SET_CURSOR_Y), 1);
        assert_eq!(command_count(&rig.tap, SET_CURSOR_X), 1);
        assert_eq!(command_count(&rig.tap, WRITE_PIXELS), 1);

        frame.set_pixel(3, 5, 0x0001);
        rig.exchange.publish(&frame).unwrap();
        rig.mirror.cycle().unwrap();
        assert_eq!(command_count(&rig.tap, SET_CURSOR_Y), 2);
        assert_eq!(command_count(&rig.tap, SET_CURSOR_X), 2);

        // Same column on the next row: only Y moves.
        frame.set_pixel(3, 6, 0x0002);
        rig.exchange.publish(&frame).unwrap();
        rig.mirror.cycle().unwrap();
        assert_eq!(command_count(&rig.tap, SET_CURSOR_Y), 3);
        assert_eq!(command_count(&rig.tap, SET_CURSOR_X), 2);
        assert_eq!(command_count(&rig.tap, WRITE_PIXELS), 3);
        assert_eq!(shown(&rig.tap), frame.as_pixels());
    }

    #[test]
    fn interlaced_update_finishes_with_the_other_field() {
        let config = MirrorConfig {
            transfer_mode: TransferMode::Polled,
            interlace: InterlacePolicy::Always,
            throttle_interlacing: false,
            ..MirrorConfig::default()
        };
        let mut rig = rig(config, 32, 16);
        let frame = pattern(32, 16);
        rig.exchange.publish(&frame).unwrap();

        let report = rig.mirror.cycle().unwrap();
        assert!(report.interlaced);
        let panel = shown(&rig.tap);
        let matching_rows = (0..16usize)
            .filter(|&y| panel[y * 32..(y + 1) * 32] == *frame.row(y as u32))
            .count();
        assert_eq!(matching_rows, 8);

        // No new frame, but the field left behind is still owed.
        let report = rig.mirror.cycle().unwrap();
        assert!(!report.new_frame);
        assert!(!report.interlaced);
        assert!(report.bytes > 0);
        assert_eq!(shown(&rig.tap), frame.as_pixels());
        assert_eq!(rig.mirror.stats().snapshot().interlaced_frames, 1);
    }

    #[test]
    fn offloaded_dma_copy_updates_the_previous_frame() {
        let config = MirrorConfig {
            transfer_mode: TransferMode::DmaAllTasks,
            interlace: InterlacePolicy::Never,
            offload_pixel_copy: true,
            ..MirrorConfig::default()
        };
        let mut rig = rig(config, 64, 40);
        let mut frame = pattern(64, 40);
        rig.exchange.publish(&frame).unwrap();
        rig.mirror.cycle().unwrap();
        assert_eq!(shown(&rig.tap), frame.as_pixels());

        // Identical content: nothing left to send.
        rig.exchange.publish(&frame).unwrap();
        let report = rig.mirror.cycle().unwrap();
        assert_eq!(report.spans, 0);
        assert_eq!(report.bytes, 0);

        // A single pixel at the right edge is widened to the left.
        frame.set_pixel(63, 5, 0xBEEF);
        rig.exchange.publish(&frame).unwrap();
        let report = rig.mirror.cycle().unwrap();
        assert_eq!(report.spans, 1);
        assert_eq!(shown(&rig.tap), frame.as_pixels());
    }

    #[test]
    fn idle_display_is_turned_off_and_back_on() {
        let config = MirrorConfig {
            display_off_after: Some(Duration::from_millis(30)),
            ..never_interlace()
        };
        let mut rig = rig(config, 32, 16);
        let frame = pattern(32, 16);
        rig.exchange.publish(&frame).unwrap();
        rig.mirror.cycle().unwrap();

        let mut changed = frame.clone();
        changed.fill(0x0F0F);
        let exchange = rig.exchange.clone();
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            exchange.publish(&changed).unwrap();
            changed
        });

        let report = rig.mirror.cycle().unwrap();
        let changed = publisher.join().unwrap();
        assert_eq!(command_count(&rig.tap, DISPLAY_OFF), 1);
        assert_eq!(command_count(&rig.tap, DISPLAY_ON), 1);
        // Pixels are held back while the display is off.
        assert_eq!(report.bytes, 0);
        assert!(!rig.mirror.is_display_off());
        assert_ne!(shown(&rig.tap), changed.as_pixels());

        rig.exchange.publish(&changed).unwrap();
        rig.mirror.cycle().unwrap();
        assert_eq!(shown(&rig.tap), changed.as_pixels());
    }

    #[test]
    fn cycle_is_canceled_on_shutdown() {
        let mut rig = rig(never_interlace(), 16, 8);
        rig.shutdown.request();
        assert!(matches!(rig.mirror.cycle(), Err(MirrorError::Canceled)));
    }

    #[test]
    fn oversized_source_is_rejected() {
        let panel = PanelProfile::ili9341().with_resolution(16, 8);
        let shutdown = ShutdownSignal::new();
        let tap = WireTap::recording();
        let backend = Box::new(PolledBackend::new(
            SimulatedBus::new(DmaMemory::new(8, 64), tap),
            false,
        ));
        let result = MirrorHandle::start(
            Box::new(TestPattern::new(32, 8, 60)),
            backend,
            panel,
            never_interlace(),
            &shutdown,
        );
        assert!(matches!(result, Err(MirrorError::DimensionMismatch { .. })));
    }

    #[test]
    fn handle_mirrors_until_stopped() {
        let config = MirrorConfig {
            spi_clock_divisor: 2,
            ..MirrorConfig::default()
        };
        let panel = PanelProfile::ili9341().with_resolution(64, 40);
        let shutdown = ShutdownSignal::new();
        let tap = WireTap::with_panel(PanelModel::new(64, 40, false));
        let bus = SimulatedBus::new(DmaMemory::new(256, 64 * 1024), tap.clone());
        let backend = Box::new(DmaBackend::new(bus, &config, &panel, &shutdown).unwrap());
        let handle = MirrorHandle::start(
            Box::new(TestPattern::new(64, 40, 120)),
            backend,
            panel,
            config,
            &shutdown,
        )
        .unwrap();
        assert!(crate::pixels::is_warm());

        std::thread::sleep(Duration::from_millis(400));
        assert!(handle.is_running());
        handle.stop();
        let stats = handle.stats();
        handle.join().unwrap();

        assert!(stats.frames_submitted >= 1);
        assert_eq!(tap.dropped_bytes(), 0);
        assert!(command_count(&tap, DISPLAY_ON) >= 1);
        assert!(tap.with_panel_model(|panel| panel.pixels_written()).unwrap() > 0);
    }
}
