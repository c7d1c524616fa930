//! The consuming side of the task queue.
//!
//! With a dedicated bus thread, [`BusWorker`] owns the [`TaskConsumer`] and
//! the [`TransferBackend`] and executes tasks as they are committed. In the
//! single-thread topology the mirror loop calls [`drain_queue`] itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crate::error::{MirrorError, MirrorResult};
use crate::sync::ShutdownSignal;
use crate::task_queue::TaskConsumer;
use crate::transfer::{FramePair, TransferBackend};

/// What one [`drain_queue`] call executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub tasks: usize,
    /// Bytes put on the bus, command words included.
    pub bytes: usize,
}

/// Execute every committed task in queue order and retire it.
///
/// `frames` is required once a framebuffer-sourced task comes up. The task
/// that failed is still retired so the producer never waits on it.
pub fn drain_queue(
    consumer: &mut TaskConsumer,
    backend: &mut dyn TransferBackend,
    mut frames: Option<&mut FramePair<'_>>,
) -> MirrorResult<Drained> {
    let mut drained = Drained::default();
    while let Some(task) = consumer.dequeue() {
        let bytes = task.bus_bytes();
        let result = backend.execute(&task, frames.as_deref_mut());
        task.retire();
        result?;
        drained.tasks += 1;
        drained.bytes += bytes;
    }
    Ok(drained)
}

#[derive(Debug, Default)]
pub struct BusStats {
    pub tasks: AtomicU64,
    pub bytes: AtomicU64,
    /// Times the worker found the queue empty and parked.
    pub idle_waits: AtomicU64,
}

impl BusStats {
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            tasks: self.tasks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            idle_waits: self.idle_waits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub tasks: u64,
    pub bytes: u64,
    pub idle_waits: u64,
}

/// Handle to the bus thread. Dropping it stops the thread and joins it.
pub struct BusWorker {
    shutdown: Arc<ShutdownSignal>,
    stats: Arc<BusStats>,
    join_handle: Option<JoinHandle<()>>,
}

impl BusWorker {
    pub fn spawn(
        consumer: TaskConsumer,
        backend: Box<dyn TransferBackend>,
        shutdown: &Arc<ShutdownSignal>,
    ) -> MirrorResult<Self> {
        let stats = Arc::new(BusStats::default());
        let thread_stats = stats.clone();
        let thread_shutdown = shutdown.clone();

        let join_handle = std::thread::Builder::new()
            .name("fbmirror-bus".to_string())
            .spawn(move || {
                match bus_loop(consumer, backend, &thread_shutdown, &thread_stats) {
                    Ok(()) | Err(MirrorError::Canceled) => log::info!("bus thread stopped"),
                    Err(error) => thread_shutdown.fail(error),
                }
            })
            .map_err(|e| {
                MirrorError::Platform(anyhow::anyhow!("failed to spawn bus thread: {e}"))
            })?;

        Ok(Self {
            shutdown: shutdown.clone(),
            stats,
            join_handle: Some(join_handle),
        })
    }

    pub fn stats(&self) -> &Arc<BusStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the thread to exit. The thread only exits once shutdown
    /// was requested or it hit a fatal error, which is returned here.
    pub fn join(mut self) -> MirrorResult<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> MirrorResult<()> {
        if let Some(handle) = self.join_handle.take() {
            handle.join().map_err(|_| MirrorError::WorkerDead)?;
        }
        match self.shutdown.fatal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for BusWorker {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.shutdown.stop();
            let _ = self.join_inner();
        }
    }
}

fn bus_loop(
    mut consumer: TaskConsumer,
    mut backend: Box<dyn TransferBackend>,
    shutdown: &ShutdownSignal,
    stats: &BusStats,
) -> MirrorResult<()> {
    loop {
        if consumer.is_empty() {
            stats.idle_waits.fetch_add(1, Ordering::Relaxed);
        }
        // Returns false only once shutdown is requested and nothing is left.
        if !consumer.wait_for_task(None) {
            break;
        }
        let drained = drain_queue(&mut consumer, backend.as_mut(), None)?;
        stats.tasks.fetch_add(drained.tasks as u64, Ordering::Relaxed);
        stats.bytes.fetch_add(drained.bytes as u64, Ordering::Relaxed);
        if !shutdown.is_running() && consumer.is_empty() {
            break;
        }
    }
    backend.wait_until_idle()
}
