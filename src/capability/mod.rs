//! Media capability interface
//!
//! The vendor media server owns every hardware channel. The core only ever
//! talks to it through [`MediaCapability`]; a software implementation lives in
//! [`sim`] for the binary and the tests.

pub mod sim;
pub mod unit;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

pub use sim::SimulatedCapability;
pub use unit::{Packet, Unit, UnitKind};

pub type CapResult<T> = std::result::Result<T, CapabilityError>;

/// Hardware channel families exposed by the media server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    Vi,
    Gdc,
    Vpss,
    Venc,
    Jpeg,
    Rgn,
    Vo,
    Vdec,
    Ai,
    Ao,
    Adec,
    Aenc,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Vi => "VI",
            ChannelKind::Gdc => "GDC",
            ChannelKind::Vpss => "VPSS",
            ChannelKind::Venc => "VENC",
            ChannelKind::Jpeg => "JPEG",
            ChannelKind::Rgn => "RGN",
            ChannelKind::Vo => "VO",
            ChannelKind::Vdec => "VDEC",
            ChannelKind::Ai => "AI",
            ChannelKind::Ao => "AO",
            ChannelKind::Adec => "ADEC",
            ChannelKind::Aenc => "AENC",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier of a created channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle {
    pub kind: ChannelKind,
    pub id: u32,
}

impl ChannelHandle {
    pub const fn new(kind: ChannelKind, id: u32) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.id)
    }
}

/// Channel operations, used for error context and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapOp {
    Create,
    SetAttr,
    Enable,
    Disable,
    Bind,
    Unbind,
    StartReceiving,
    StopReceiving,
    Fetch,
    Release,
    Submit,
    Destroy,
}

impl fmt::Display for CapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapOp::Create => "create",
            CapOp::SetAttr => "set_attr",
            CapOp::Enable => "enable",
            CapOp::Disable => "disable",
            CapOp::Bind => "bind",
            CapOp::Unbind => "unbind",
            CapOp::StartReceiving => "start_receiving",
            CapOp::StopReceiving => "stop_receiving",
            CapOp::Fetch => "fetch",
            CapOp::Release => "release",
            CapOp::Submit => "submit",
            CapOp::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Pixel layouts the pipeline asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Nv16,
    Fbc0,
    Rgb888,
    Bayer10,
    Bayer12,
}

/// Bitstream codecs for encoder and decoder channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Mjpeg,
    Jpeg,
    Aac,
    G711a,
    Pcm,
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "H.264" | "H264" => Ok(Codec::H264),
            "H.265" | "H265" | "HEVC" => Ok(Codec::H265),
            "MJPEG" => Ok(Codec::Mjpeg),
            "JPEG" => Ok(Codec::Jpeg),
            "AAC" => Ok(Codec::Aac),
            "G711A" => Ok(Codec::G711a),
            "PCM" => Ok(Codec::Pcm),
            other => Err(format!("unknown codec '{other}'")),
        }
    }
}

/// Frame geometry shared by most video channel attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Per-kind channel attributes handed to `create`/`set_attr`
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelAttr {
    Vi {
        geometry: Geometry,
        fps: u32,
        format: PixelFormat,
        buffer_count: u32,
        smart_ae: bool,
    },
    Gdc {
        geometry: Geometry,
        buffer_count: u32,
    },
    Vpss {
        input: Geometry,
        output: Geometry,
        format: PixelFormat,
    },
    Venc {
        geometry: Geometry,
        codec: Codec,
        bitrate_kbps: u32,
        gop: u32,
        src_fps: u32,
        dst_fps: u32,
        buffer_count: u32,
        memc: bool,
    },
    Jpeg {
        geometry: Geometry,
        quality: u32,
    },
    Rgn {
        attach_to: ChannelHandle,
        geometry: Geometry,
    },
    Vo {
        geometry: Geometry,
        format: PixelFormat,
    },
    Vdec {
        geometry: Geometry,
        codec: Codec,
    },
    Audio {
        codec: Codec,
        sample_rate: u32,
        channels: u32,
    },
}

/// How many units a channel should accept once receiving starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveCount {
    Count(u32),
    Unlimited,
}

/// Result of one `fetch`
#[derive(Debug)]
pub enum FetchOutcome {
    Unit(Unit),
    Timeout,
    Eof,
}

/// The vendor media server's channel interface
///
/// Every call is synchronous. `fetch` blocks for at most `timeout`.
/// A fetched [`Unit`] must go back through `release` exactly once; `release`
/// takes it by value so a unit cannot be handed back twice.
pub trait MediaCapability: Send + Sync {
    fn create(&self, kind: ChannelKind, attr: &ChannelAttr) -> CapResult<ChannelHandle>;

    fn set_attr(&self, handle: ChannelHandle, attr: &ChannelAttr) -> CapResult<()>;

    fn enable(&self, handle: ChannelHandle) -> CapResult<()>;

    fn disable(&self, handle: ChannelHandle) -> CapResult<()>;

    fn bind(&self, src: ChannelHandle, dst: ChannelHandle) -> CapResult<()>;

    fn unbind(&self, src: ChannelHandle, dst: ChannelHandle) -> CapResult<()>;

    fn start_receiving(&self, handle: ChannelHandle, count: ReceiveCount) -> CapResult<()>;

    fn stop_receiving(&self, handle: ChannelHandle) -> CapResult<()>;

    fn fetch(&self, handle: ChannelHandle, timeout: Duration) -> CapResult<FetchOutcome>;

    fn release(&self, handle: ChannelHandle, unit: Unit) -> CapResult<()>;

    /// Push a demuxed packet into a decoder/output channel
    fn submit(&self, handle: ChannelHandle, packet: &Packet) -> CapResult<()>;

    fn destroy(&self, handle: ChannelHandle) -> CapResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        let handle = ChannelHandle::new(ChannelKind::Venc, 2);
        assert_eq!(handle.to_string(), "VENC[2]");
    }

    #[test]
    fn test_codec_parse() {
        assert_eq!("H.265".parse::<Codec>(), Ok(Codec::H265));
        assert_eq!("h264".parse::<Codec>(), Ok(Codec::H264));
        assert!("vp9".parse::<Codec>().is_err());
    }
}
