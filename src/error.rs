use std::fmt;
use std::time::Duration;

use crate::hw::RegisterDump;

#[derive(Debug)]
pub enum MirrorError {
    InvalidConfig(String),

    /// Source and working framebuffers disagree on geometry.
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// A single task can never fit the ring, no matter how far the
    /// consumer drains it.
    TaskTooLarge {
        requested: usize,
        capacity: usize,
    },

    AcquisitionFailed(String),

    /// A DMA channel kept its ACTIVE bit set past the stall timeout.
    HardwareStall {
        channel: &'static str,
        waited: Duration,
        registers: RegisterDump,
    },

    /// Another process reprogrammed one of our DMA channels.
    ChannelStolen {
        channel: u8,
        detail: String,
    },

    WorkerDead,

    Canceled,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl MirrorError {
    pub fn class(&self) -> MirrorErrorClass {
        match self {
            Self::InvalidConfig(_) | Self::DimensionMismatch { .. } => {
                MirrorErrorClass::InvalidInput
            }
            Self::TaskTooLarge { .. } => MirrorErrorClass::Unsupported,
            Self::WorkerDead | Self::Canceled => MirrorErrorClass::Transient,
            Self::AcquisitionFailed(_)
            | Self::HardwareStall { .. }
            | Self::ChannelStolen { .. }
            | Self::Platform(_) => MirrorErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), MirrorErrorClass::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), MirrorErrorClass::Fatal)
    }

    /// Copy of this error that can be stored in shared shutdown state and
    /// handed to another thread. `Platform` keeps only its formatted chain.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::DimensionMismatch { expected, actual } => Self::DimensionMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::TaskTooLarge {
                requested,
                capacity,
            } => Self::TaskTooLarge {
                requested: *requested,
                capacity: *capacity,
            },
            Self::AcquisitionFailed(s) => Self::AcquisitionFailed(s.clone()),
            Self::HardwareStall {
                channel,
                waited,
                registers,
            } => Self::HardwareStall {
                channel,
                waited: *waited,
                registers: *registers,
            },
            Self::ChannelStolen { channel, detail } => Self::ChannelStolen {
                channel: *channel,
                detail: detail.clone(),
            },
            Self::WorkerDead => Self::WorkerDead,
            Self::Canceled => Self::Canceled,
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(message) => write!(f, "invalid mirror configuration: {message}"),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "framebuffer is {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::TaskTooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "task of {requested} bytes can never fit a {capacity} byte task ring"
            ),
            Self::AcquisitionFailed(message) => {
                write!(f, "failed to snapshot source framebuffer: {message}")
            }
            Self::HardwareStall {
                channel,
                waited,
                registers,
            } => write!(
                f,
                "DMA {channel} channel still active after {waited:?}: {registers}"
            ),
            Self::ChannelStolen { channel, detail } => {
                write!(f, "DMA channel {channel} was taken over by another user: {detail}")
            }
            Self::WorkerDead => write!(f, "mirror worker is not running"),
            Self::Canceled => write!(f, "operation canceled by shutdown"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
