//! Error taxonomy for the media pipeline
//!
//! Build paths fail fast and roll back; teardown paths keep going and report
//! the first error they hit. Both surface through [`PipelineError`].

use std::time::Duration;

use crate::capability::{CapOp, ChannelHandle, ChannelKind};

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by orchestrator mutators and session controls
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing parameter or unsupported mode combination, detected before
    /// any hardware mutation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A channel operation failed mid-build (or mid-teardown)
    #[error("{op} on {target} failed: {source}")]
    Capability {
        op: CapOp,
        target: String,
        #[source]
        source: CapabilityError,
    },

    /// A fetch call timed out; pumps count it and keep going
    #[error("fetch on {0} timed out")]
    Timeout(ChannelHandle),

    /// A worker did not observe its stop flag in time
    #[error("worker '{name}' did not stop within {timeout:?}")]
    Drain { name: String, timeout: Duration },

    #[error("failed to spawn worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Recording and photo capture are mutually exclusive
    #[error("cannot start {requested} while {active} is active")]
    SessionConflict {
        requested: &'static str,
        active: &'static str,
    },

    #[error("photo capture still in progress ({remaining} remaining)")]
    PhotoInProgress { remaining: u32 },

    #[error("orchestrator control thread is gone")]
    ServiceClosed,

    #[error("playback: {0}")]
    Playback(#[from] PlaybackError),
}

impl PipelineError {
    pub(crate) fn capability(op: CapOp, target: impl ToString, source: CapabilityError) -> Self {
        PipelineError::Capability {
            op,
            target: target.to_string(),
            source,
        }
    }

    /// True for errors that leave hardware state untouched
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::InvalidState(_)
                | PipelineError::SessionConflict { .. }
                | PipelineError::PhotoInProgress { .. }
        )
    }
}

/// Parameter and tuning errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required parameter '{0}' is missing")]
    Missing(String),

    #[error("parameter '{key}' has invalid value '{value}'")]
    Invalid { key: String, value: String },

    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("parameter file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`MediaCapability`](crate::capability::MediaCapability)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("channel {0} does not exist")]
    NotFound(ChannelHandle),

    #[error("channel {0} is busy (still bound or receiving)")]
    Busy(ChannelHandle),

    #[error("{0} -> {1} is not bound")]
    NotBound(ChannelHandle, ChannelHandle),

    #[error("{0} -> {1} is already bound")]
    AlreadyBound(ChannelHandle, ChannelHandle),

    #[error("channel {0} is not enabled")]
    NotEnabled(ChannelHandle),

    #[error("no free {0} channel")]
    Exhausted(ChannelKind),

    #[error("unit from slot {slot} is not outstanding on {handle}")]
    UnknownUnit { handle: ChannelHandle, slot: u32 },

    #[error("media server rejected the call (status {0:#x})")]
    Rejected(i32),

    #[error("injected failure")]
    Injected,
}

impl CapabilityError {
    /// Map a media-server status word to an error; zero is success
    pub fn from_status(status: i32, handle: ChannelHandle) -> std::result::Result<(), Self> {
        match status {
            0 => Ok(()),
            STATUS_UNEXIST => Err(CapabilityError::NotFound(handle)),
            STATUS_BUSY => Err(CapabilityError::Busy(handle)),
            STATUS_NOT_PERM => Err(CapabilityError::NotEnabled(handle)),
            STATUS_NOBUF => Err(CapabilityError::Exhausted(handle.kind)),
            other => Err(CapabilityError::Rejected(other)),
        }
    }
}

const STATUS_UNEXIST: i32 = 0xa002_8005_u32 as i32;
const STATUS_BUSY: i32 = 0xa002_8012_u32 as i32;
const STATUS_NOT_PERM: i32 = 0xa002_8009_u32 as i32;
const STATUS_NOBUF: i32 = 0xa002_800e_u32 as i32;

/// Errors reported by a [`Demuxer`](crate::playback::Demuxer)
#[derive(Debug, Clone, thiserror::Error)]
pub enum DemuxError {
    #[error("cannot open '{0}'")]
    Open(String),

    #[error("no {0} track in file")]
    NoTrack(&'static str),

    #[error("read failed: {0}")]
    Read(String),

    #[error("seek to {0} ms failed")]
    Seek(u64),
}

/// Playback session errors
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("no file is loaded")]
    NoFile,

    #[error("{track} track cannot go from {from:?} on {event:?}")]
    InvalidTransition {
        track: &'static str,
        from: crate::playback::TrackStatus,
        event: crate::playback::TrackEvent,
    },

    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error("session has been destroyed")]
    Destroyed,
}

/// Errors from frame sinks; logged by pumps, never fatal
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink '{0}' is full, unit dropped")]
    Full(String),

    #[error("sink '{0}' is disconnected")]
    Disconnected(String),

    #[error("sink I/O: {0}")]
    Io(#[from] std::io::Error),
}
