pub mod bus;
pub mod config;
pub mod diff;
pub(crate) mod env_config;
pub mod error;
pub mod framebuffer;
pub mod hw;
pub mod merge;
pub mod mirror;
pub mod panel;
pub mod pixels;
pub mod source;
pub mod span;
pub mod sync;
pub mod task_queue;
pub mod timing;
pub mod transfer;

use std::sync::Arc;

use error::MirrorResult;

pub use config::{DiffStrategy, DmaConfig, InterlacePolicy, MirrorConfig, Topology, TransferMode};
pub use error::{MirrorError, MirrorErrorClass};
pub use framebuffer::Framebuffer;
pub use mirror::{CycleReport, MirrorHandle, MirrorLoop, MirrorStats, MirrorStatsSnapshot};
pub use panel::PanelProfile;
pub use source::{FrameExchange, FrameSource, TestPattern};
pub use sync::ShutdownSignal;
pub use transfer::{DmaBackend, PolledBackend, TransferBackend};

/// Start mirroring `source` with the configuration taken from the
/// environment, using `make_backend` to build the transfer backend for the
/// chosen mode.
pub fn mirror_from_env<F>(
    source: Box<dyn FrameSource>,
    panel: PanelProfile,
    make_backend: F,
) -> MirrorResult<MirrorHandle>
where
    F: FnOnce(&MirrorConfig, &PanelProfile, &Arc<ShutdownSignal>) -> MirrorResult<Box<dyn TransferBackend>>,
{
    let config = MirrorConfig::from_env()?;
    let shutdown = ShutdownSignal::new();
    let backend = make_backend(&config, &panel, &shutdown)?;
    MirrorHandle::start(source, backend, panel, config, &shutdown)
}
