//! Operating modes and what they imply for the pipeline

pub mod attr;
pub mod mode;
pub mod selector;

pub use attr::{DisplayAttr, PipelineAttr};
pub use mode::{AiqWorkingMode, EisMode, HdrMode, Mode};
pub use selector::{RecordModeSelector, Selection, SensorFormat, SensorVariant};
