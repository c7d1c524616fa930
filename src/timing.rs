//! Frame arrival prediction.
//!
//! The source offers no "new frame" event, so the poller has to guess when
//! the next frame lands. [`FrameTimingPredictor`] keeps a short history of
//! observed arrivals and extrapolates from it. The estimate reacts to
//! content speeding up within one frame but relaxes only gradually when
//! content slows down: a missed frame is worse than a wasted poll.

use std::time::{Duration, Instant};

use crate::config::MirrorConfig;

/// Number of arrival timestamps kept.
pub const HISTOGRAM_SIZE: usize = 240;

/// Arrivals older than this (relative to the newest one) are dropped, so a
/// drop from 60 Hz to 1 Hz is reflected within ten seconds.
pub const HISTOGRAM_MAX_SAMPLE_AGE: Duration = Duration::from_secs(10);

/// Longest interval the estimator ever reports while frames keep coming.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_millis(100);

const IDLE_AFTER: Duration = Duration::from_secs(5);
const DEEP_IDLE_AFTER: Duration = Duration::from_secs(60);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEEP_IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Each point of eagerness shaves this much off the estimated interval.
const EAGERNESS_STEP_US: u64 = 1000;

#[derive(Clone, Debug)]
pub struct FrameTimingPredictor {
    arrivals: [Instant; HISTOGRAM_SIZE],
    /// Slot the next arrival is written to.
    tail: usize,
    len: usize,
    eagerness: u32,
    last_poll: Instant,
    target_interval: Duration,
    predict_arrivals: bool,
    sleep_when_idle: bool,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl FrameTimingPredictor {
    pub fn new(target_fps: u32, predict_arrivals: bool, sleep_when_idle: bool, now: Instant) -> Self {
        Self {
            arrivals: [now; HISTOGRAM_SIZE],
            tail: 0,
            len: 0,
            eagerness: 0,
            last_poll: now,
            target_interval: Duration::from_micros(1_000_000 / u64::from(target_fps.max(1))),
            predict_arrivals,
            sleep_when_idle,
        }
    }

    pub fn from_config(config: &MirrorConfig, now: Instant) -> Self {
        Self::new(
            config.target_fps,
            config.predict_frame_arrivals,
            config.sleep_when_idle,
            now,
        )
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    /// Number of arrivals currently in the history.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn eagerness(&self) -> u32 {
        self.eagerness
    }

    /// Whether pollers should sleep until [`predict_next_arrival`].
    ///
    /// [`predict_next_arrival`]: Self::predict_next_arrival
    pub fn sleeps_before_polls(&self) -> bool {
        self.predict_arrivals || self.sleep_when_idle
    }

    /// `index` 0 is the newest arrival.
    fn recent(&self, index: usize) -> Instant {
        debug_assert!(index < self.len);
        self.arrivals[(self.tail + HISTOGRAM_SIZE - 1 - index) % HISTOGRAM_SIZE]
    }

    pub fn most_recent_arrival(&self) -> Option<Instant> {
        (self.len > 0).then(|| self.recent(0))
    }

    pub fn record_arrival(&mut self, at: Instant) {
        self.arrivals[self.tail] = at;
        self.tail = (self.tail + 1) % HISTOGRAM_SIZE;
        if self.len < HISTOGRAM_SIZE {
            self.len += 1;
        }
        while self.len > 1 && at.saturating_duration_since(self.recent(self.len - 1)) > HISTOGRAM_MAX_SAMPLE_AGE {
            self.len -= 1;
        }
    }

    /// Fill the history with arrivals at the target rate leading up to
    /// `now`, so the first predictions assume full-rate content.
    pub fn warm_fill(&mut self, now: Instant) {
        let step = micros(self.target_interval);
        for i in 0..HISTOGRAM_SIZE as u64 {
            let back = Duration::from_micros(step * (HISTOGRAM_SIZE as u64 - i));
            if let Some(at) = now.checked_sub(back) {
                self.record_arrival(at);
            }
        }
    }

    /// Remember when the source was last polled; idle predictions are
    /// relative to it.
    pub fn note_poll(&mut self, at: Instant) {
        self.last_poll = at;
    }

    /// A poll found a new frame: snapshot a little earlier next time.
    pub fn bump_eagerness(&mut self) {
        self.eagerness = self.eagerness.saturating_add(1);
    }

    /// A poll found nothing: back off geometrically.
    pub fn relax_eagerness(&mut self) {
        self.eagerness /= 2;
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if !self.sleep_when_idle || self.len == 0 {
            return None;
        }
        Some(now.saturating_duration_since(self.recent(0)))
    }

    /// Expected interval between source frames.
    pub fn estimate_interval(&mut self, now: Instant) -> Duration {
        if self.len == 0 {
            return self.target_interval;
        }
        if let Some(idle) = self.idle_for(now) {
            if idle > DEEP_IDLE_AFTER {
                self.len = 1;
                return DEEP_IDLE_INTERVAL;
            }
            if idle > IDLE_AFTER {
                return IDLE_POLL_INTERVAL;
            }
        }
        if !self.predict_arrivals {
            return self.target_interval;
        }
        if self.len < 2 {
            return MAX_FRAME_INTERVAL;
        }

        let cap = micros(MAX_FRAME_INTERVAL);
        let mut intervals: Vec<u64> = (0..self.len - 1)
            .map(|i| micros(self.recent(i).saturating_duration_since(self.recent(i + 1))).min(cap))
            .collect();
        intervals.sort_unstable();

        let eagerness = self.eagerness as usize;
        let percentile = ((self.len - 1) * 2 / 5).saturating_sub(eagerness);
        let latest = micros(self.recent(0).saturating_duration_since(self.recent(1)));
        let target = micros(self.target_interval);

        let mut interval = intervals[percentile].min(latest);
        interval = interval
            .saturating_sub(u64::from(self.eagerness) * EAGERNESS_STEP_US)
            .max(target)
            .min(cap);
        Duration::from_micros(interval.max(target))
    }

    /// When the next source frame is expected, never earlier than `now`
    /// unless a frame was just missed, in which case `now` is returned.
    pub fn predict_next_arrival(&mut self, now: Instant) -> Instant {
        let most_recent = self.most_recent_arrival().unwrap_or(now);
        if let Some(idle) = self.idle_for(now) {
            if idle > DEEP_IDLE_AFTER {
                self.len = 1;
                return self.last_poll + IDLE_POLL_INTERVAL;
            }
            if idle > IDLE_AFTER {
                return self.last_poll + IDLE_POLL_INTERVAL;
            }
        }

        let interval = micros(self.estimate_interval(now)).max(1);
        let elapsed = micros(now.saturating_duration_since(most_recent));
        let k = elapsed.div_ceil(interval);
        let next = most_recent + Duration::from_micros(k * interval);
        let Some(missed) = k.checked_sub(1).map(|k| most_recent + Duration::from_micros(k * interval)) else {
            return next;
        };

        if missed > most_recent && micros(now.saturating_duration_since(missed)) < interval / 3 {
            now
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    fn feed(predictor: &mut FrameTimingPredictor, start: Instant, interval_us: u64, count: u64) -> Instant {
        let mut at = start;
        for _ in 0..count {
            at += us(interval_us);
            predictor.record_arrival(at);
        }
        at
    }

    #[test]
    fn empty_history_assumes_target_rate() {
        let now = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, now);
        assert_eq!(predictor.estimate_interval(now), us(16_666));
    }

    #[test]
    fn constant_stream_converges_to_its_interval() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 25_000, 40);
        assert_eq!(predictor.estimate_interval(last), us(25_000));
    }

    #[test]
    fn faster_content_is_tracked_immediately() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 50_000, 100);
        assert_eq!(predictor.estimate_interval(last), us(50_000));

        let last = feed(&mut predictor, last, 25_000, 1);
        assert_eq!(predictor.estimate_interval(last), us(25_000));
    }

    #[test]
    fn slower_content_relaxes_gradually() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 20_000, 100);

        // A couple of slow frames do not move the 40th percentile.
        let mid = feed(&mut predictor, last, 40_000, 5);
        let estimate = predictor.estimate_interval(mid);
        assert_eq!(estimate, us(20_000));

        // Once most of the history is slow, the estimate follows.
        let end = feed(&mut predictor, mid, 40_000, 200);
        assert_eq!(predictor.estimate_interval(end), us(40_000));
    }

    #[test]
    fn warm_fill_starts_at_target_rate() {
        let now = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, now);
        predictor.warm_fill(now);
        assert_eq!(predictor.len(), HISTOGRAM_SIZE);
        let estimate = predictor.estimate_interval(now);
        assert!(estimate >= us(16_666) && estimate <= us(16_667), "{estimate:?}");
    }

    #[test]
    fn eagerness_biases_towards_shorter_intervals() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(30, true, true, t0);
        let last = feed(&mut predictor, t0, 40_000, 50);
        for _ in 0..3 {
            predictor.bump_eagerness();
        }
        assert_eq!(predictor.estimate_interval(last), us(37_000));
        predictor.relax_eagerness();
        assert_eq!(predictor.eagerness(), 1);
        predictor.relax_eagerness();
        assert_eq!(predictor.eagerness(), 0);
    }

    #[test]
    fn estimate_never_exceeds_ceiling() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 400_000, 10);
        assert_eq!(predictor.estimate_interval(last), MAX_FRAME_INTERVAL);
    }

    #[test]
    fn old_samples_expire() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        feed(&mut predictor, t0, 1_000_000, 20);
        assert_eq!(predictor.len(), 11);
    }

    #[test]
    fn idle_source_backs_off() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 16_667, 30);

        let later = last + Duration::from_secs(6);
        predictor.note_poll(later);
        assert_eq!(predictor.estimate_interval(later), IDLE_POLL_INTERVAL);
        assert_eq!(predictor.predict_next_arrival(later), later + IDLE_POLL_INTERVAL);

        let much_later = last + Duration::from_secs(61);
        assert_eq!(predictor.estimate_interval(much_later), DEEP_IDLE_INTERVAL);
        assert_eq!(predictor.len(), 1);
    }

    #[test]
    fn prediction_extrapolates_on_the_interval_grid() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 20_000, 30);

        assert_eq!(predictor.predict_next_arrival(last + us(5_000)), last + us(20_000));
        assert_eq!(predictor.predict_next_arrival(last + us(50_000)), last + us(60_000));
    }

    #[test]
    fn just_missed_frame_is_due_now() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(60, true, true, t0);
        let last = feed(&mut predictor, t0, 20_000, 30);

        let now = last + us(45_000);
        assert_eq!(predictor.predict_next_arrival(now), now);
    }

    #[test]
    fn prediction_disabled_uses_target_interval() {
        let t0 = Instant::now();
        let mut predictor = FrameTimingPredictor::new(50, false, false, t0);
        let last = feed(&mut predictor, t0, 40_000, 30);
        assert_eq!(predictor.estimate_interval(last), us(20_000));
    }
}
