use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Process-wide operating mode; decides which channel set exists at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Video,
    Photo,
    SlowMotion,
    TimeLapse,
}

/// Electronic image stabilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EisMode {
    #[default]
    Off,
    NormalSteady,
    /// Not supported by the GDC firmware
    HorizonSteady,
    /// Not supported by the GDC firmware
    DistortionCorrection,
}

impl EisMode {
    pub fn is_supported(self) -> bool {
        matches!(self, EisMode::Off | EisMode::NormalSteady)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrMode {
    #[default]
    Linear,
    /// In-sensor dual-gain HDR
    Dag,
    /// Two staggered exposures merged by the ISP
    Staggered,
}

/// ISP auto-algorithm working mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AiqWorkingMode {
    Normal,
    Hdr2,
}

macro_rules! string_enum {
    ($ty:ty, $what:literal, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(format!("unknown {} '{}'", $what, other)),
                }
            }
        }
    };
}

string_enum!(Mode, "mode", {
    Mode::Video => "video",
    Mode::Photo => "photo",
    Mode::SlowMotion => "slow_motion",
    Mode::TimeLapse => "time_lapse",
});

string_enum!(EisMode, "eis mode", {
    EisMode::Off => "off",
    EisMode::NormalSteady => "normal_steady",
    EisMode::HorizonSteady => "horizon_steady",
    EisMode::DistortionCorrection => "distortion_correction",
});

string_enum!(HdrMode, "hdr mode", {
    HdrMode::Linear => "linear",
    HdrMode::Dag => "dag",
    HdrMode::Staggered => "staggered",
});

string_enum!(AiqWorkingMode, "aiq mode", {
    AiqWorkingMode::Normal => "normal",
    AiqWorkingMode::Hdr2 => "hdr2",
});
