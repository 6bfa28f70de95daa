//! Per-channel attributes derived from the current selection and parameters

use crate::capability::{ChannelAttr, Codec, Geometry, PixelFormat};
use crate::error::ConfigError;
use crate::params::{ParameterStore, ParamsExt};
use crate::BufferConfig;

use super::mode::Mode;
use super::selector::Selection;

pub const KEY_ENABLE_RECORD: &str = "video.source:enable_record";
pub const KEY_ENABLE_DISPLAY: &str = "video.source:enable_display";
pub const KEY_ENABLE_RTSP: &str = "video.source:enable_rtsp";
pub const KEY_ENABLE_RAW_TAP: &str = "video.source:enable_raw_tap";
pub const KEY_ENABLE_MEMC: &str = "video.source:enable_memc";
pub const KEY_SMART_AE: &str = "isp.0:smart_ae";
pub const KEY_TIME_LAPSE_INTERVAL: &str = "video.source:time_lapse_interval";
pub const KEY_OSD_ENABLE: &str = "osd.0:enable";

/// Display path attributes
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayAttr {
    pub vpss: ChannelAttr,
    pub vo: ChannelAttr,
}

/// Everything needed to build one pipeline, recomputed on every transition
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAttr {
    pub selection: Selection,
    pub vi: ChannelAttr,
    /// Record encoder; absent in photo mode
    pub main: Option<ChannelAttr>,
    /// GDC warp stage; present when EIS is on
    pub gdc: Option<ChannelAttr>,
    /// RTSP sub stream encoder
    pub sub: Option<ChannelAttr>,
    /// Photo encoder; photo mode only
    pub photo: Option<ChannelAttr>,
    pub display: Option<DisplayAttr>,
    /// OSD overlay geometry on the record encoder
    pub osd: Option<Geometry>,
    pub raw_tap: bool,
    /// Start recording as part of the build
    pub record_on_init: bool,
    /// Target output rate of the record encoder
    pub record_fps: u32,
}

impl PipelineAttr {
    pub fn derive(
        selection: Selection,
        params: &dyn ParameterStore,
        buffers: &BufferConfig,
    ) -> Result<Self, ConfigError> {
        let sensor = selection.sensor;
        let mode = selection.mode;

        let vi = ChannelAttr::Vi {
            geometry: sensor.geometry,
            fps: sensor.fps,
            format: PixelFormat::Nv12,
            buffer_count: buffers.vi,
            smart_ae: params.get_bool(KEY_SMART_AE, false)?,
        };

        let (main, record_fps) = if mode == Mode::Photo {
            (None, 0)
        } else {
            let geometry = Geometry::new(
                params.get_or("video.0:width", sensor.geometry.width)?,
                params.get_or("video.0:height", sensor.geometry.height)?,
            );
            // Time lapse keeps one frame per interval: dst/src = 1/(fps*interval)
            let (src_fps, dst_fps) = match mode {
                Mode::TimeLapse => {
                    let interval: u32 = params.get_or(KEY_TIME_LAPSE_INTERVAL, 1)?;
                    let src_fps = sensor.fps.checked_mul(interval.max(1)).ok_or_else(|| {
                        ConfigError::Invalid {
                            key: KEY_TIME_LAPSE_INTERVAL.to_string(),
                            value: interval.to_string(),
                        }
                    })?;
                    (src_fps, 1)
                }
                _ => (sensor.fps, sensor.fps),
            };
            let attr = ChannelAttr::Venc {
                geometry,
                codec: codec(params, "video.0:codec", Codec::H265)?,
                bitrate_kbps: params.get_or("video.0:bitrate", 20_000)?,
                gop: params.get_or("video.0:gop", sensor.fps)?,
                src_fps,
                dst_fps,
                buffer_count: buffers.venc,
                memc: params.get_bool(KEY_ENABLE_MEMC, false)?,
            };
            (Some(attr), dst_fps)
        };

        let gdc = match &main {
            Some(ChannelAttr::Venc { geometry, .. }) if selection.uses_gdc() => {
                Some(ChannelAttr::Gdc {
                    geometry: *geometry,
                    buffer_count: buffers.gdc,
                })
            }
            _ => None,
        };

        let sub = if params.get_bool(KEY_ENABLE_RTSP, false)? {
            let fps = sensor.fps.min(30);
            Some(ChannelAttr::Venc {
                geometry: Geometry::new(
                    params.get_or("video.1:width", 1280)?,
                    params.get_or("video.1:height", 720)?,
                ),
                codec: codec(params, "video.1:codec", Codec::H264)?,
                bitrate_kbps: params.get_or("video.1:bitrate", 2_000)?,
                gop: params.get_or("video.1:gop", fps)?,
                src_fps: sensor.fps,
                dst_fps: fps,
                buffer_count: buffers.venc,
                memc: false,
            })
        } else {
            None
        };

        let photo = if mode == Mode::Photo {
            Some(ChannelAttr::Jpeg {
                geometry: Geometry::new(
                    params.get_or("video.2:width", sensor.geometry.width)?,
                    params.get_or("video.2:height", sensor.geometry.height)?,
                ),
                quality: params.get_or("video.2:quality", 90)?,
            })
        } else {
            None
        };

        let display = if params.get_bool(KEY_ENABLE_DISPLAY, false)? {
            let panel = Geometry::new(
                params.get_or("display.0:width", 1280)?,
                params.get_or("display.0:height", 720)?,
            );
            Some(DisplayAttr {
                vpss: ChannelAttr::Vpss {
                    input: sensor.geometry,
                    output: panel,
                    format: PixelFormat::Nv12,
                },
                vo: ChannelAttr::Vo {
                    geometry: panel,
                    format: PixelFormat::Rgb888,
                },
            })
        } else {
            None
        };

        let osd = match &main {
            Some(ChannelAttr::Venc { geometry, .. }) if params.get_bool(KEY_OSD_ENABLE, false)? => {
                Some(*geometry)
            }
            _ => None,
        };

        Ok(Self {
            vi,
            main,
            gdc,
            sub,
            photo,
            display,
            osd,
            raw_tap: params.get_bool(KEY_ENABLE_RAW_TAP, false)?,
            record_on_init: mode != Mode::Photo && params.get_bool(KEY_ENABLE_RECORD, true)?,
            record_fps,
            selection,
        })
    }
}

fn codec(params: &dyn ParameterStore, key: &str, default: Codec) -> Result<Codec, ConfigError> {
    params.get_or(key, default)
}
