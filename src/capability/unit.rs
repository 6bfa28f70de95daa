use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::ChannelHandle;

/// A unit fetched from a channel: an encoded packet, a JPEG, or a raw frame
///
/// Holds a hardware buffer slot until handed back through
/// [`MediaCapability::release`](super::MediaCapability::release).
#[derive(Debug)]
pub struct Unit {
    /// Payload - shared, so sinks can keep it without copying
    pub data: Bytes,

    pub meta: Arc<UnitMetadata>,

    /// When the pump received it, for latency tracking
    pub fetched_at: Instant,
}

/// Unit metadata
#[derive(Debug, Clone)]
pub struct UnitMetadata {
    pub source: ChannelHandle,
    pub sequence: u64,
    pub pts: Duration,
    pub kind: UnitKind,
    /// Buffer slot inside the media server
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    KeyFrame,
    DeltaFrame,
    Jpeg,
    Raw,
}

impl Unit {
    pub fn is_keyframe(&self) -> bool {
        matches!(self.meta.kind, UnitKind::KeyFrame | UnitKind::Jpeg)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A demuxed packet pushed into a decode or audio output channel
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub pts_ms: u64,
    pub keyframe: bool,
}
