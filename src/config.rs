//! Runtime selection of the diff, interlace and transfer strategies, plus
//! the tuning constants of the pipeline.
//!
//! Everything here is chosen once at startup. [`MirrorConfig::from_env`]
//! overlays `FBMIRROR_*` environment variables on [`MirrorConfig::default`],
//! and [`MirrorConfig::validate`] rejects combinations that cannot work.

use std::time::Duration;

use crate::env_config::{
    env_var_bool, env_var_choice, env_var_positive_f64, env_var_positive_u64,
};
use crate::error::{MirrorError, MirrorResult};
use crate::panel::PanelProfile;
use crate::task_queue::TASK_HEADER_BYTES;

/// Largest pixel payload (bytes) a merge may produce when tasks are allowed
/// to go through the polled path.
pub const MAX_SPI_TASK_SIZE: usize = 65528;

/// Merge threshold used when every task is sent through DMA: restarting a
/// DMA transfer costs about as much as 320 pixels.
pub const ALL_TASKS_DMA_MERGE_THRESHOLD: u32 = 320;

/// How the changed region of a frame is located.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffStrategy {
    /// Send the whole frame every cycle.
    NoDiff,
    /// One bounding box around every changed pixel.
    SingleRectangle,
    /// Per-row runs, compared one pixel at a time.
    ScanlineExact,
    /// Per-row runs, compared four pixels at a time.
    ScanlineCoarse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterlacePolicy {
    Never,
    Always,
    /// Interlace only when the progressive update would not fit the
    /// per-frame bus budget.
    Adaptive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// CPU writes every byte into the SPI FIFO.
    Polled,
    /// Large pixel tasks go through DMA, small ones stay polled.
    Dma,
    /// Every task goes through DMA. Cursor tasks carry full windows and
    /// spans are widened to even pixel counts.
    DmaAllTasks,
}

/// Whether the queue is drained by a dedicated bus thread or inline by the
/// producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    DedicatedBusThread,
    SingleThread,
}

/// DMA channel assignment and safety timeouts.
#[derive(Clone, Debug)]
pub struct DmaConfig {
    pub tx_channel: u8,
    pub rx_channel: u8,
    /// Number of control blocks in the descriptor pool.
    pub control_blocks: usize,
    /// Size of the uncached staging area. `0` sizes it to twice the task
    /// queue.
    pub staging_bytes: usize,
    /// How long `wait_until_idle` tolerates an ACTIVE channel.
    pub idle_timeout: Duration,
    /// How long a new transfer waits for the previous one before the engine
    /// is declared stalled.
    pub kickoff_timeout: Duration,
    /// Poll period while waiting for channels to go idle.
    pub poll_interval: Duration,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            tx_channel: 7,
            rx_channel: 1,
            control_blocks: 1024,
            staging_bytes: 0,
            idle_timeout: Duration::from_secs(2),
            kickoff_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(250),
        }
    }
}

/// Configuration of one mirror pipeline.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub diff_strategy: DiffStrategy,
    pub interlace: InterlacePolicy,
    /// After an interlaced cycle, wait for the predicted next source frame
    /// instead of immediately sending the other field.
    pub throttle_interlacing: bool,
    pub transfer_mode: TransferMode,
    pub topology: Topology,
    /// Let the bus side gather, byte-swap and copy pixels straight out of
    /// the current frame instead of staging them in the queue. Only
    /// possible when the producer also drains the queue.
    pub offload_pixel_copy: bool,
    /// Target display refresh rate.
    pub target_fps: u32,
    /// Overrides the panel's span merge threshold (pixels).
    pub merge_threshold: Option<u32>,
    /// Round span columns outward to a multiple of this many pixels after
    /// diffing.
    pub span_alignment: Option<u32>,
    /// Sleep until the predicted arrival of the next source frame.
    pub predict_frame_arrivals: bool,
    /// Back off polling when the source stops producing frames.
    pub sleep_when_idle: bool,
    /// Bus time a single frame may use before the loop switches to
    /// interlacing, expressed per second of updates. `None` picks the
    /// panel/topology default.
    pub update_timeslice: Option<Duration>,
    /// SPI core clock in Hz.
    pub spi_core_hz: u32,
    /// SPI clock divisor (even).
    pub spi_clock_divisor: u32,
    /// Stop updating the panel after this much inactivity.
    pub display_off_after: Option<Duration>,
    /// Fraction of the screen that must change for a frame to count as
    /// activity.
    pub inactive_fraction: f64,
    /// Task ring size in bytes. `None` picks three drawable frames.
    pub queue_bytes: Option<usize>,
    pub dma: DmaConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            diff_strategy: DiffStrategy::ScanlineExact,
            interlace: InterlacePolicy::Adaptive,
            throttle_interlacing: true,
            transfer_mode: TransferMode::Dma,
            topology: Topology::DedicatedBusThread,
            offload_pixel_copy: false,
            target_fps: 60,
            merge_threshold: None,
            span_alignment: None,
            predict_frame_arrivals: true,
            sleep_when_idle: true,
            update_timeslice: None,
            spi_core_hz: 400_000_000,
            spi_clock_divisor: 6,
            display_off_after: None,
            inactive_fraction: 0.05,
            queue_bytes: None,
            dma: DmaConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Defaults overlaid with `FBMIRROR_*` environment variables.
    pub fn from_env() -> MirrorResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = env_var_choice("FBMIRROR_DIFF") {
            config.diff_strategy = match raw.as_str() {
                "none" | "no-diff" => DiffStrategy::NoDiff,
                "rect" | "single-rect" | "single-rectangle" => DiffStrategy::SingleRectangle,
                "exact" | "scanline" => DiffStrategy::ScanlineExact,
                "coarse" => DiffStrategy::ScanlineCoarse,
                other => return Err(unknown_choice("FBMIRROR_DIFF", other)),
            };
        }
        if let Some(raw) = env_var_choice("FBMIRROR_INTERLACE") {
            config.interlace = match raw.as_str() {
                "never" => InterlacePolicy::Never,
                "always" => InterlacePolicy::Always,
                "adaptive" | "auto" => InterlacePolicy::Adaptive,
                other => return Err(unknown_choice("FBMIRROR_INTERLACE", other)),
            };
        }
        if let Some(raw) = env_var_choice("FBMIRROR_TRANSFER") {
            config.transfer_mode = match raw.as_str() {
                "polled" => TransferMode::Polled,
                "dma" => TransferMode::Dma,
                "dma-all" | "dma-all-tasks" => TransferMode::DmaAllTasks,
                other => return Err(unknown_choice("FBMIRROR_TRANSFER", other)),
            };
        }
        if let Some(single) = env_var_bool("FBMIRROR_SINGLE_THREAD") {
            config.topology = if single {
                Topology::SingleThread
            } else {
                Topology::DedicatedBusThread
            };
        }
        if let Some(value) = env_var_bool("FBMIRROR_OFFLOAD_PIXEL_COPY") {
            config.offload_pixel_copy = value;
        }
        if let Some(value) = env_var_bool("FBMIRROR_THROTTLE_INTERLACING") {
            config.throttle_interlacing = value;
        }
        if let Some(value) = env_var_bool("FBMIRROR_PREDICT_ARRIVALS") {
            config.predict_frame_arrivals = value;
        }
        if let Some(value) = env_var_bool("FBMIRROR_SLEEP_WHEN_IDLE") {
            config.sleep_when_idle = value;
        }
        if let Some(fps) = env_var_positive_u64("FBMIRROR_TARGET_FPS") {
            config.target_fps = u32::try_from(fps).unwrap_or(u32::MAX);
        }
        if let Some(threshold) = env_var_positive_u64("FBMIRROR_MERGE_THRESHOLD") {
            config.merge_threshold = Some(u32::try_from(threshold).unwrap_or(u32::MAX));
        }
        if let Some(align) = env_var_positive_u64("FBMIRROR_SPAN_ALIGNMENT") {
            config.span_alignment = Some(u32::try_from(align).unwrap_or(u32::MAX));
        }
        if let Some(us) = env_var_positive_u64("FBMIRROR_UPDATE_TIMESLICE_US") {
            config.update_timeslice = Some(Duration::from_micros(us));
        }
        if let Some(hz) = env_var_positive_u64("FBMIRROR_SPI_CORE_HZ") {
            config.spi_core_hz = u32::try_from(hz).unwrap_or(u32::MAX);
        }
        if let Some(divisor) = env_var_positive_u64("FBMIRROR_SPI_DIVISOR") {
            config.spi_clock_divisor = u32::try_from(divisor).unwrap_or(u32::MAX);
        }
        if let Some(secs) = env_var_positive_f64("FBMIRROR_DISPLAY_OFF_AFTER_SECS") {
            config.display_off_after = Some(Duration::from_secs_f64(secs));
        }
        if let Some(bytes) = env_var_positive_u64("FBMIRROR_QUEUE_BYTES") {
            config.queue_bytes = Some(bytes as usize);
        }

        Ok(config)
    }

    pub fn validate(&self, panel: &PanelProfile) -> MirrorResult<()> {
        if self.target_fps == 0 {
            return Err(MirrorError::InvalidConfig("target_fps must be > 0".into()));
        }
        if self.offload_pixel_copy && self.topology != Topology::SingleThread {
            return Err(MirrorError::InvalidConfig(
                "offloading the pixel copy to the bus side needs the single-thread topology"
                    .into(),
            ));
        }
        if self.transfer_mode == TransferMode::DmaAllTasks && panel.bus_is_16_bits_wide {
            return Err(MirrorError::InvalidConfig(format!(
                "{} has a 16-bit wide bus, which cannot send every task through DMA",
                panel.name
            )));
        }
        if self.spi_clock_divisor < 2 || self.spi_clock_divisor % 2 != 0 {
            return Err(MirrorError::InvalidConfig(format!(
                "SPI clock divisor must be an even number >= 2, got {}",
                self.spi_clock_divisor
            )));
        }
        if let Some(align) = self.span_alignment {
            if align == 0 {
                return Err(MirrorError::InvalidConfig("span alignment must be > 0".into()));
            }
        }
        if !(0.0..=1.0).contains(&self.inactive_fraction) {
            return Err(MirrorError::InvalidConfig(format!(
                "inactive fraction {} is outside [0, 1]",
                self.inactive_fraction
            )));
        }
        let minimum_queue = 2 * TASK_HEADER_BYTES + panel.window_task_bytes() + TASK_HEADER_BYTES;
        let queue = self.queue_bytes_for(panel);
        if queue < minimum_queue {
            return Err(MirrorError::InvalidConfig(format!(
                "task queue of {queue} bytes is smaller than the {minimum_queue} byte minimum"
            )));
        }
        if self.transfer_mode != TransferMode::Polled && self.dma.control_blocks < 8 {
            return Err(MirrorError::InvalidConfig(
                "DMA control block pool needs at least 8 blocks".into(),
            ));
        }
        Ok(())
    }

    /// Diff strategies that cannot split a frame into fields force
    /// progressive updates.
    pub fn effective_interlace(&self) -> InterlacePolicy {
        match self.diff_strategy {
            DiffStrategy::NoDiff | DiffStrategy::SingleRectangle => InterlacePolicy::Never,
            _ => self.interlace,
        }
    }

    pub fn merge_threshold_for(&self, panel: &PanelProfile) -> u32 {
        if let Some(threshold) = self.merge_threshold {
            return threshold;
        }
        if self.transfer_mode == TransferMode::DmaAllTasks {
            return ALL_TASKS_DMA_MERGE_THRESHOLD;
        }
        panel.merge_threshold
    }

    /// Upper bound on the byte size of a merged pixel task.
    pub fn max_task_bytes(&self) -> usize {
        if self.transfer_mode == TransferMode::DmaAllTasks {
            usize::MAX
        } else {
            MAX_SPI_TASK_SIZE
        }
    }

    pub fn queue_bytes_for(&self, panel: &PanelProfile) -> usize {
        self.queue_bytes
            .unwrap_or_else(|| panel.frame_bytes() * 3)
    }

    pub fn timeslice_for(&self, panel: &PanelProfile) -> Duration {
        if let Some(timeslice) = self.update_timeslice {
            return timeslice;
        }
        if self.topology == Topology::SingleThread {
            return Duration::from_millis(250);
        }
        panel.default_timeslice
    }

    /// Microseconds the bus needs to shift out one byte.
    pub fn bus_usecs_per_byte(&self) -> f64 {
        1_000_000.0 * 8.0 * self.spi_clock_divisor as f64 / self.spi_core_hz as f64
    }

    pub fn target_frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.target_fps.max(1) as u64)
    }

    /// Whether every cursor task must carry a full window rather than a
    /// two-byte cursor move.
    pub fn full_cursor_windows(&self) -> bool {
        self.transfer_mode == TransferMode::DmaAllTasks || self.span_alignment.is_some()
    }
}

fn unknown_choice(var: &str, value: &str) -> MirrorError {
    MirrorError::InvalidConfig(format!("unrecognized value {value:?} for {var}"))
}
