//! Frame acquisition.
//!
//! A [`FramePoller`] thread snapshots a [`FrameSource`] when the timing
//! predictor expects a new frame, keeps only snapshots whose pixels
//! actually changed, and publishes them through a [`FrameExchange`] that the
//! mirror loop waits on.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{MirrorError, MirrorResult};
use crate::framebuffer::Framebuffer;
use crate::sync::{EventCounter, ShutdownSignal};
use crate::timing::FrameTimingPredictor;

/// Do not bother sleeping when the next frame is due sooner than this.
const MIN_POLL_SLEEP: Duration = Duration::from_micros(150);

/// Without arrival prediction, the poller wakes this much before one target
/// interval has passed since the last new frame.
const EARLY_POLL: Duration = Duration::from_micros(500);

/// Something that can produce RGB565 frames on demand.
pub trait FrameSource: Send {
    /// Frame size in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Copy the current contents into `frame`. Failures are not retried.
    fn capture(&mut self, frame: &mut Framebuffer) -> MirrorResult<()>;
}

/// Hand-off point between the poller and the mirror loop.
pub struct FrameExchange {
    latest: Mutex<Framebuffer>,
    pending: AtomicU32,
    published: AtomicU64,
    wasted_polls: AtomicU64,
    wake: Arc<EventCounter>,
    predictor: Mutex<FrameTimingPredictor>,
    shutdown: Arc<ShutdownSignal>,
}

impl FrameExchange {
    pub fn new(
        width: u32,
        height: u32,
        predictor: FrameTimingPredictor,
        shutdown: &Arc<ShutdownSignal>,
    ) -> MirrorResult<Arc<Self>> {
        let wake = Arc::new(EventCounter::new());
        shutdown.register(wake.clone());
        Ok(Arc::new(Self {
            latest: Mutex::new(Framebuffer::new(width, height)?),
            pending: AtomicU32::new(0),
            published: AtomicU64::new(0),
            wasted_polls: AtomicU64::new(0),
            wake,
            predictor: Mutex::new(predictor),
            shutdown: shutdown.clone(),
        }))
    }

    fn latest(&self) -> MutexGuard<'_, Framebuffer> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn predictor(&self) -> MutexGuard<'_, FrameTimingPredictor> {
        self.predictor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.latest().dimensions()
    }

    /// Make `frame` the latest frame and wake the mirror loop.
    pub fn publish(&self, frame: &Framebuffer) -> MirrorResult<()> {
        self.latest().copy_from(frame)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.wake.signal();
        Ok(())
    }

    /// Frames published since the last [`take`](Self::take).
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn wasted_polls(&self) -> u64 {
        self.wasted_polls.load(Ordering::Relaxed)
    }

    pub(crate) fn note_wasted_poll(&self) {
        self.wasted_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the latest frame into `into` and reset the pending count.
    /// Returns how many frames were published since the previous take; more
    /// than one means the loop skipped frames.
    pub fn take(&self, into: &mut Framebuffer) -> MirrorResult<u32> {
        let latest = self.latest();
        into.copy_from(&latest)?;
        Ok(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Block until a frame is pending, shutdown is requested or `timeout`
    /// passes. Returns whether a frame is pending.
    pub fn wait_for_frame(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.wake.load();
            if self.pending() > 0 {
                return true;
            }
            if !self.shutdown.is_running() {
                return false;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.wake.wait_changed(seen, remaining);
        }
    }
}

/// Handle to the polling thread. Dropping it stops the thread.
pub struct FramePoller {
    shutdown: Arc<ShutdownSignal>,
    join_handle: Option<JoinHandle<()>>,
}

impl FramePoller {
    pub fn spawn(
        source: Box<dyn FrameSource>,
        exchange: Arc<FrameExchange>,
        shutdown: &Arc<ShutdownSignal>,
    ) -> MirrorResult<Self> {
        let thread_shutdown = shutdown.clone();
        let join_handle = std::thread::Builder::new()
            .name("fbmirror-poll".to_string())
            .spawn(move || {
                let mut source = source;
                match poll_loop(source.as_mut(), &exchange, &thread_shutdown) {
                    Ok(()) | Err(MirrorError::Canceled) => log::info!("frame poller stopped"),
                    Err(error) => thread_shutdown.fail(error),
                }
            })
            .map_err(|e| {
                MirrorError::Platform(anyhow::anyhow!("failed to spawn frame poller thread: {e}"))
            })?;

        Ok(Self {
            shutdown: shutdown.clone(),
            join_handle: Some(join_handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn join(mut self) -> MirrorResult<()> {
        if let Some(handle) = self.join_handle.take() {
            handle.join().map_err(|_| MirrorError::WorkerDead)?;
        }
        match self.shutdown.fatal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for FramePoller {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            self.shutdown.stop();
            let _ = handle.join();
        }
    }
}

/// Sleep until the predictor expects the next frame.
fn sleep_until_expected(exchange: &FrameExchange, last_new_frame: Instant) {
    let now = Instant::now();
    let (predicting, wake_at) = {
        let mut predictor = exchange.predictor();
        if predictor.sleeps_before_polls() {
            (true, predictor.predict_next_arrival(now))
        } else {
            let earliest = last_new_frame + predictor.target_interval();
            (false, earliest.checked_sub(EARLY_POLL).unwrap_or(earliest))
        }
    };
    let wait = wake_at.saturating_duration_since(now);
    if predicting {
        if wait > MIN_POLL_SLEEP {
            std::thread::sleep(wait - MIN_POLL_SLEEP);
        }
    } else if !wait.is_zero() {
        std::thread::sleep(wait);
    }
}

/// Capture, compare and publish until shutdown. A capture failure ends the
/// loop with [`MirrorError::AcquisitionFailed`].
pub fn poll_loop(
    source: &mut dyn FrameSource,
    exchange: &FrameExchange,
    shutdown: &ShutdownSignal,
) -> MirrorResult<()> {
    let (width, height) = exchange.dimensions();
    if source.dimensions() != (width, height) {
        return Err(MirrorError::DimensionMismatch {
            expected: (width, height),
            actual: source.dimensions(),
        });
    }
    let mut snapshot = Framebuffer::new(width, height)?;
    let mut last_published = Framebuffer::new(width, height)?;
    let mut have_published = false;
    let mut last_new_frame = Instant::now();

    while shutdown.is_running() {
        sleep_until_expected(exchange, last_new_frame);
        if !shutdown.is_running() {
            break;
        }

        let polled_at = Instant::now();
        exchange.predictor().note_poll(polled_at);
        source.capture(&mut snapshot).map_err(|error| match error {
            MirrorError::AcquisitionFailed(_) => error,
            other => MirrorError::AcquisitionFailed(other.to_string()),
        })?;

        let is_new = !have_published || snapshot.as_pixels() != last_published.as_pixels();
        if !is_new {
            exchange.predictor().relax_eagerness();
            exchange.note_wasted_poll();
            continue;
        }

        {
            let mut predictor = exchange.predictor();
            predictor.record_arrival(polled_at);
            predictor.bump_eagerness();
        }
        last_new_frame = polled_at;
        last_published.copy_from(&snapshot)?;
        have_published = true;
        exchange.publish(&snapshot)?;
    }
    Ok(())
}

/// Synthetic source: a gradient background with a vertical bar that moves
/// a few pixels every frame interval.
#[derive(Debug)]
pub struct TestPattern {
    width: u32,
    height: u32,
    bar_width: u32,
    step: u32,
    position: u32,
    frame_interval: Duration,
    last_step: Option<Instant>,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            bar_width: (width / 10).max(1),
            step: 2,
            position: 0,
            frame_interval: Duration::from_micros(1_000_000 / u64::from(fps.max(1))),
            last_step: None,
        }
    }

    pub fn with_bar(mut self, bar_width: u32, step: u32) -> Self {
        self.bar_width = bar_width.max(1);
        self.step = step;
        self
    }

    /// Column where the bar currently starts.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Move the bar one step.
    pub fn advance(&mut self) {
        self.position = (self.position + self.step) % self.width.max(1);
    }

    pub fn render(&self, frame: &mut Framebuffer) {
        for y in 0..frame.height() {
            let shade = ((y * 31) / self.height.max(1)) as u16;
            let row = frame.row_mut(y);
            for (x, pixel) in row.iter_mut().enumerate() {
                let x = x as u32;
                let offset = (x + self.width - self.position) % self.width;
                *pixel = if offset < self.bar_width {
                    0xFFFF
                } else {
                    (shade << 11) | (((x * 63) / self.width) as u16) << 5
                };
            }
        }
    }
}

impl FrameSource for TestPattern {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self, frame: &mut Framebuffer) -> MirrorResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(MirrorError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: frame.dimensions(),
            });
        }
        let now = Instant::now();
        match self.last_step {
            None => self.last_step = Some(now),
            Some(last) if now.duration_since(last) >= self.frame_interval => {
                self.advance();
                self.last_step = Some(now);
            }
            Some(_) => {}
        }
        self.render(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        frames: Vec<u16>,
        calls: usize,
        fail_after: usize,
    }

    impl FrameSource for Scripted {
        fn dimensions(&self) -> (u32, u32) {
            (4, 2)
        }

        fn capture(&mut self, frame: &mut Framebuffer) -> MirrorResult<()> {
            if self.calls >= self.fail_after {
                return Err(MirrorError::AcquisitionFailed("snapshot failed".into()));
            }
            let value = self.frames[self.calls.min(self.frames.len() - 1)];
            self.calls += 1;
            frame.fill(value);
            Ok(())
        }
    }

    fn exchange(shutdown: &Arc<ShutdownSignal>) -> Arc<FrameExchange> {
        let predictor = FrameTimingPredictor::new(1000, false, false, Instant::now());
        FrameExchange::new(4, 2, predictor, shutdown).unwrap()
    }

    #[test]
    fn only_changed_frames_are_published() {
        let shutdown = ShutdownSignal::new();
        let exchange = exchange(&shutdown);
        let mut source = Scripted {
            frames: vec![1, 1, 2, 2, 2, 3],
            calls: 0,
            fail_after: 6,
        };

        let err = poll_loop(&mut source, &exchange, &shutdown).unwrap_err();
        assert!(matches!(err, MirrorError::AcquisitionFailed(_)));
        assert_eq!(exchange.frames_published(), 3);
        assert_eq!(exchange.wasted_polls(), 3);
        assert_eq!(exchange.predictor().len(), 3);

        let mut frame = Framebuffer::new(4, 2).unwrap();
        assert_eq!(exchange.take(&mut frame).unwrap(), 3);
        assert!(frame.as_pixels().iter().all(|&p| p == 3));
        assert_eq!(exchange.pending(), 0);
    }

    #[test]
    fn wait_for_frame_times_out_and_wakes() {
        let shutdown = ShutdownSignal::new();
        let exchange = exchange(&shutdown);
        assert!(!exchange.wait_for_frame(Some(Duration::from_millis(5))));

        let frame = Framebuffer::new(4, 2).unwrap();
        let publisher = {
            let exchange = exchange.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                exchange.publish(&frame).unwrap();
            })
        };
        assert!(exchange.wait_for_frame(Some(Duration::from_secs(5))));
        publisher.join().unwrap();
    }

    #[test]
    fn shutdown_releases_waiters() {
        let shutdown = ShutdownSignal::new();
        let exchange = exchange(&shutdown);
        let stopper = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                shutdown.request();
            })
        };
        assert!(!exchange.wait_for_frame(None));
        stopper.join().unwrap();
    }

    #[test]
    fn poller_thread_reports_capture_failure() {
        let shutdown = ShutdownSignal::new();
        let exchange = exchange(&shutdown);
        let source = Scripted {
            frames: vec![7],
            calls: 0,
            fail_after: 2,
        };
        let poller = FramePoller::spawn(Box::new(source), exchange.clone(), &shutdown).unwrap();
        let err = poller.join().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(exchange.frames_published(), 1);
        assert!(!shutdown.is_running());
    }

    #[test]
    fn test_pattern_bar_moves() {
        let mut pattern = TestPattern::new(20, 4, 60).with_bar(3, 2);
        let mut frame = Framebuffer::new(20, 4).unwrap();
        pattern.render(&mut frame);
        assert_eq!(&frame.row(0)[0..4], &[0xFFFF, 0xFFFF, 0xFFFF, frame.row(0)[3]]);
        assert_ne!(frame.pixel(3, 0), 0xFFFF);

        pattern.advance();
        pattern.render(&mut frame);
        assert_eq!(pattern.position(), 2);
        assert_ne!(frame.pixel(1, 0), 0xFFFF);
        assert_eq!(frame.pixel(2, 3), 0xFFFF);
        assert_eq!(frame.pixel(4, 3), 0xFFFF);
        assert_ne!(frame.pixel(5, 3), 0xFFFF);
    }
}
