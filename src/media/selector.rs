//! Record mode selection
//!
//! Maps (mode, EIS, HDR, parameters) to the sensor format and ISP tuning the
//! pipeline has to request. Precedence:
//!
//! * slow motion forces EIS off, linear HDR and the binning sensor geometry
//! * time lapse forces linear HDR
//! * otherwise HDR picks the sensor geometry and EIS only decides whether the
//!   GDC stage joins the record path

use tracing::{debug, instrument};

use super::mode::{AiqWorkingMode, EisMode, HdrMode, Mode};
use crate::capability::Geometry;
use crate::error::ConfigError;
use crate::params::{ParameterStore, ParamsExt};

pub const KEY_MODE: &str = "video.source:mode";
pub const KEY_EIS: &str = "video.source:eis_mode";
pub const KEY_HDR: &str = "isp.0:hdr_mode";
pub const KEY_SLOW_MOTION_RATIO: &str = "video.source:slow_motion_ratio";

/// Linear sensor format used when the parameters carry none
const DEFAULT_LINEAR: SensorFormat = SensorFormat {
    geometry: Geometry::new(3840, 2160),
    fps: 30,
    bits: 10,
};

/// Sensor readout configurations described in the parameter store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorVariant {
    Linear,
    DagHdr,
    StaggeredHdr,
    Binning,
}

impl SensorVariant {
    /// Parameter section holding this variant's geometry
    pub fn section(self) -> &'static str {
        match self {
            SensorVariant::Linear => "sensor.linear",
            SensorVariant::DagHdr => "sensor.dag_hdr",
            SensorVariant::StaggeredHdr => "sensor.staggered_hdr",
            SensorVariant::Binning => "sensor.binning",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            SensorVariant::Linear => "linear",
            SensorVariant::DagHdr => "dag_hdr",
            SensorVariant::StaggeredHdr => "staggered_hdr",
            SensorVariant::Binning => "binning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorFormat {
    pub geometry: Geometry,
    pub fps: u32,
    pub bits: u32,
}

/// Outcome of one selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub mode: Mode,
    /// EIS after mode overrides
    pub eis: EisMode,
    /// HDR after mode overrides
    pub hdr: HdrMode,
    pub variant: SensorVariant,
    pub sensor: SensorFormat,
    pub iq_profile: String,
    pub aiq_mode: AiqWorkingMode,
}

impl Selection {
    /// Whether GDC sits between VI and the record encoder
    pub fn uses_gdc(&self) -> bool {
        self.eis != EisMode::Off
    }
}

/// Stateless selector; all inputs come from the parameter store
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordModeSelector;

impl RecordModeSelector {
    /// Read the current mode settings from `params` and select
    pub fn select(&self, params: &dyn ParameterStore) -> Result<Selection, ConfigError> {
        let mode = params.get_or(KEY_MODE, Mode::Video)?;
        let eis = params.get_or(KEY_EIS, EisMode::Off)?;
        let hdr = params.get_or(KEY_HDR, HdrMode::Linear)?;
        self.choose(mode, eis, hdr, params)
    }

    #[instrument(skip(self, params), level = "debug")]
    pub fn choose(
        &self,
        mode: Mode,
        eis: EisMode,
        hdr: HdrMode,
        params: &dyn ParameterStore,
    ) -> Result<Selection, ConfigError> {
        let (eis, hdr) = match mode {
            Mode::SlowMotion => (EisMode::Off, HdrMode::Linear),
            Mode::TimeLapse => (eis, HdrMode::Linear),
            Mode::Video | Mode::Photo => (eis, hdr),
        };

        if !eis.is_supported() {
            return Err(ConfigError::UnsupportedCombination(format!(
                "EIS mode {eis} is not supported"
            )));
        }

        let variant = match (mode, hdr) {
            (Mode::SlowMotion, _) => SensorVariant::Binning,
            (_, HdrMode::Linear) => SensorVariant::Linear,
            (_, HdrMode::Dag) => SensorVariant::DagHdr,
            (_, HdrMode::Staggered) => SensorVariant::StaggeredHdr,
        };

        let sensor = match variant {
            SensorVariant::Linear => {
                read_sensor(params, variant)?.unwrap_or(DEFAULT_LINEAR)
            }
            SensorVariant::Binning => match read_sensor(params, variant)? {
                Some(format) => format,
                None => binned_from_linear(params)?,
            },
            SensorVariant::DagHdr | SensorVariant::StaggeredHdr => read_sensor(params, variant)?
                .ok_or_else(|| {
                    ConfigError::UnsupportedCombination(format!(
                        "{hdr} HDR requested but {} is not configured",
                        variant.section()
                    ))
                })?,
        };

        let aiq_mode = match hdr {
            HdrMode::Staggered => AiqWorkingMode::Hdr2,
            HdrMode::Linear | HdrMode::Dag => AiqWorkingMode::Normal,
        };

        let sensor_name: String = params.get_or("sensor.0:name", "sensor".to_string())?;
        let iq_profile = format!("{}_{}", sensor_name, variant.suffix());

        let selection = Selection {
            mode,
            eis,
            hdr,
            variant,
            sensor,
            iq_profile,
            aiq_mode,
        };
        debug!(
            "Selected {} {}@{} {}bit, iq {}",
            variant.suffix(),
            sensor.geometry,
            sensor.fps,
            sensor.bits,
            selection.iq_profile
        );
        Ok(selection)
    }

    /// Record the effective choice for observability; user preferences are
    /// left alone
    pub fn write_back(&self, selection: &Selection, params: &dyn ParameterStore) {
        params.set_value("isp.0:force_iq_name", &selection.iq_profile);
        params.set_value("isp.0:aiq_mode", selection.aiq_mode);
        params.set_value("video.source:effective_eis", selection.eis);
        params.set_value("isp.0:effective_hdr", selection.hdr);
    }
}

/// Geometry for `variant`, or `None` when its section is absent
fn read_sensor(
    params: &dyn ParameterStore,
    variant: SensorVariant,
) -> Result<Option<SensorFormat>, ConfigError> {
    let section = variant.section();
    let width_key = format!("{section}:width");
    if params.get(&width_key).is_none() {
        return Ok(None);
    }

    let width = params.require(&width_key)?;
    let height = params.require(&format!("{section}:height"))?;
    let fps = params.get_or(&format!("{section}:fps"), 30)?;
    let bits = params.get_or(&format!("{section}:bits"), 10)?;
    Ok(Some(SensorFormat {
        geometry: Geometry::new(width, height),
        fps,
        bits,
    }))
}

/// 2x2 binning of the linear readout, sped up by the slow-motion ratio
fn binned_from_linear(params: &dyn ParameterStore) -> Result<SensorFormat, ConfigError> {
    let linear = read_sensor(params, SensorVariant::Linear)?.unwrap_or(DEFAULT_LINEAR);
    let ratio: u32 = params.get_or(KEY_SLOW_MOTION_RATIO, 4)?;
    let fps = linear
        .fps
        .checked_mul(ratio.max(1))
        .ok_or_else(|| ConfigError::Invalid {
            key: KEY_SLOW_MOTION_RATIO.to_string(),
            value: ratio.to_string(),
        })?;
    Ok(SensorFormat {
        geometry: Geometry::new(linear.geometry.width / 2, linear.geometry.height / 2),
        fps,
        bits: linear.bits,
    })
}
