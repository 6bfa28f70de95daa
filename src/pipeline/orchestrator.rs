//! Pipeline lifecycle
//!
//! [`PipelineOrchestrator`] is the only component that creates, binds and
//! destroys channels. Every mode change is a full teardown and rebuild;
//! the bind graph is never patched in place. Parameters are re-read from the
//! store on every build.
//!
//! Build order:
//!
//! ```text
//! VI  -> [VPSS -> VO]            display
//!     -> VENC main               all modes but photo
//!     -> VENC sub  (+ pump)      rtsp, fed from VPSS when present
//!     -> JPEG                    photo mode
//!     -> raw tap pump on VI
//! record: start receiving VENC, pump, [GDC], [RGN], bind VI -> [GDC] -> VENC
//! ```
//!
//! Teardown stops every pump before touching channels, then undoes the
//! remaining steps newest-first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::stages::StageStack;
use crate::capability::{
    CapOp, ChannelAttr, ChannelHandle, ChannelKind, MediaCapability, ReceiveCount,
};
use crate::error::{ConfigError, PipelineError, Result};
use crate::media::attr::{
    KEY_ENABLE_MEMC, KEY_ENABLE_RECORD, KEY_ENABLE_RTSP, KEY_SMART_AE,
};
use crate::media::selector::{KEY_EIS, KEY_HDR, KEY_MODE};
use crate::media::{EisMode, HdrMode, Mode, PipelineAttr, RecordModeSelector};
use crate::params::{ParameterStore, ParamsExt};
use crate::pump::{FrameSink, PumpSpec, PumpStats, Sinks, StreamKind, StreamPump};
use crate::{Config, CONFIG};

/// Result of a mutator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// False when the call was a no-op
    pub changed: bool,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn unchanged() -> Self {
        Self {
            changed: false,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Building,
    Built { recording: bool, photo: bool },
    TearingDown,
}

/// Every externally driven transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Init,
    Deinit,
    Restart,
    SetMode(Mode),
    SetEisMode(EisMode),
    SetHdr(HdrMode),
    SetMemc(bool),
    SetSmartAe(bool),
    SetRtsp(bool),
    SetDebugMode(bool),
    StartRecord,
    StopRecord,
    StartPhoto(u32),
    StopPhoto,
    EnterSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoProgress {
    pub taken: u32,
    pub max: u32,
    pub finished: bool,
}

impl PhotoProgress {
    pub fn remaining(&self) -> u32 {
        self.max - self.taken.min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecordStatus {
    pub active: bool,
    /// Timestamp of the first recorded unit
    pub first_pts: Option<Duration>,
    pub elapsed: Option<Duration>,
    pub units: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Building,
    TearingDown,
}

struct RecordSession {
    stack: StageStack,
    started: Instant,
    stats: Arc<PumpStats>,
}

struct PhotoSession {
    stack: StageStack,
    max: u32,
    stats: Arc<PumpStats>,
}

impl PhotoSession {
    fn taken(&self) -> u32 {
        u32::try_from(self.stats.units()).unwrap_or(u32::MAX)
    }

    fn progress(&self) -> PhotoProgress {
        let taken = self.taken();
        PhotoProgress {
            taken,
            max: self.max,
            finished: taken >= self.max,
        }
    }

    /// The pump has exited, so the unit count is final
    fn is_drained(&mut self) -> bool {
        self.stack
            .pump_mut(StreamKind::Photo)
            .map_or(true, |pump| pump.is_finished())
    }
}

struct Built {
    attr: PipelineAttr,
    base: StageStack,
    vi: ChannelHandle,
    main: Option<ChannelHandle>,
    jpeg: Option<ChannelHandle>,
    record: Option<RecordSession>,
    photo: Option<PhotoSession>,
}

pub struct PipelineOrchestrator {
    caps: Arc<dyn MediaCapability>,
    params: Arc<dyn ParameterStore>,
    config: Arc<Config>,
    selector: RecordModeSelector,
    sinks: HashMap<StreamKind, Sinks>,
    verbose: Arc<AtomicBool>,
    phase: Phase,
    built: Option<Built>,
}

impl PipelineOrchestrator {
    /// Uses the global [`CONFIG`] snapshot
    pub fn new(caps: Arc<dyn MediaCapability>, params: Arc<dyn ParameterStore>) -> Self {
        Self::with_config(caps, params, CONFIG.load_full())
    }

    pub fn with_config(
        caps: Arc<dyn MediaCapability>,
        params: Arc<dyn ParameterStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            caps,
            params,
            config,
            selector: RecordModeSelector,
            sinks: HashMap::new(),
            verbose: Arc::new(AtomicBool::new(false)),
            phase: Phase::Idle,
            built: None,
        }
    }

    /// Register a sink for pumps started from now on
    pub fn add_sink(&mut self, stream: StreamKind, sink: Arc<dyn FrameSink>) {
        self.sinks.entry(stream).or_default().push(sink);
    }

    pub fn state(&self) -> PipelineState {
        match self.phase {
            Phase::Building => PipelineState::Building,
            Phase::TearingDown => PipelineState::TearingDown,
            Phase::Idle => match &self.built {
                None => PipelineState::Uninitialized,
                Some(built) => PipelineState::Built {
                    recording: built.record.is_some(),
                    photo: built.photo.is_some(),
                },
            },
        }
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.built.as_ref().is_some_and(|b| b.record.is_some())
    }

    /// Attributes of the current build
    pub fn attr(&self) -> Option<&PipelineAttr> {
        self.built.as_ref().map(|b| &b.attr)
    }

    pub fn mode(&self) -> Result<Mode> {
        Ok(self.params.get_or(KEY_MODE, Mode::Video)?)
    }

    pub fn record_status(&self) -> RecordStatus {
        match self.built.as_ref().and_then(|b| b.record.as_ref()) {
            Some(record) => {
                let snapshot = record.stats.snapshot();
                RecordStatus {
                    active: true,
                    first_pts: snapshot.first_pts,
                    elapsed: Some(record.started.elapsed()),
                    units: snapshot.units,
                }
            }
            None => RecordStatus::default(),
        }
    }

    pub fn photo_progress(&self) -> Option<PhotoProgress> {
        self.built
            .as_ref()
            .and_then(|b| b.photo.as_ref())
            .map(PhotoSession::progress)
    }

    /// Block until the photo pump has exited on its own
    pub fn wait_photo(&mut self, timeout: Duration) -> bool {
        let Some(photo) = self.built.as_mut().and_then(|b| b.photo.as_mut()) else {
            return true;
        };
        photo
            .stack
            .pump_mut(StreamKind::Photo)
            .map_or(true, |pump| pump.wait(timeout))
    }

    /// Single entry point for every transition
    pub fn handle(&mut self, command: Command) -> Result<Outcome> {
        match command {
            Command::Init => self.init(),
            Command::Deinit => self.deinit(),
            Command::Restart => self.restart(),
            Command::SetMode(mode) => self.set_mode(mode),
            Command::SetEisMode(eis) => self.set_eis_mode(eis),
            Command::SetHdr(hdr) => self.set_hdr(hdr),
            Command::SetMemc(on) => self.set_memc_enabled(on),
            Command::SetSmartAe(on) => self.set_smart_ae(on),
            Command::SetRtsp(on) => self.set_rtsp_enabled(on),
            Command::SetDebugMode(on) => Ok(self.set_debug_mode(on)),
            Command::StartRecord => self.start_record(),
            Command::StopRecord => self.stop_record(),
            Command::StartPhoto(max) => self.start_photo(max),
            Command::StopPhoto => self.stop_photo(),
            Command::EnterSleep => self.enter_sleep(),
        }
    }

    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<Outcome> {
        if self.built.is_some() {
            return Ok(Outcome::unchanged());
        }
        let started = Instant::now();

        let attr = self.plan()?;
        self.selector.write_back(&attr.selection, self.params.as_ref());

        self.phase = Phase::Building;
        let built = self.build(attr);
        self.phase = Phase::Idle;

        let built = match built {
            Ok(built) => built,
            Err(e) => {
                error!("Pipeline build failed: {}", e);
                return Err(e);
            }
        };
        info!(
            "Pipeline built: {} mode, eis {}, hdr {}, recording {}",
            built.attr.selection.mode,
            built.attr.selection.eis,
            built.attr.selection.hdr,
            built.record.is_some()
        );
        self.built = Some(built);
        Ok(self.finish("init", started))
    }

    /// Tear everything down, best effort
    #[instrument(skip(self))]
    pub fn deinit(&mut self) -> Result<Outcome> {
        let Some(mut built) = self.built.take() else {
            return Ok(Outcome::unchanged());
        };
        let started = Instant::now();
        self.phase = Phase::TearingDown;

        let mut first = None;
        if let Some(mut photo) = built.photo.take() {
            info!("Stopping photo capture for teardown");
            if let Err(e) = photo.stack.unwind() {
                first.get_or_insert(e);
            }
        }
        if let Some(mut record) = built.record.take() {
            info!("Stopping recording for teardown");
            if let Err(e) = record.stack.unwind() {
                first.get_or_insert(e);
            }
        }
        if let Err(e) = built.base.unwind() {
            first.get_or_insert(e);
        }
        self.phase = Phase::Idle;

        match first {
            Some(e) => {
                error!("Pipeline teardown incomplete: {}", e);
                Err(e)
            }
            None => {
                info!("Pipeline torn down");
                Ok(self.finish("deinit", started))
            }
        }
    }

    pub fn restart(&mut self) -> Result<Outcome> {
        let started = Instant::now();
        let torn = self.deinit();
        self.init()?;
        torn?;
        Ok(self.finish("restart", started))
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<Outcome> {
        let current: Mode = self.params.get_or(KEY_MODE, Mode::Video)?;
        if current == mode {
            return Ok(Outcome::unchanged());
        }
        info!("Mode {} -> {}", current, mode);
        self.reconfigure(KEY_MODE, mode.to_string(), "set_mode")
    }

    pub fn set_eis_mode(&mut self, eis: EisMode) -> Result<Outcome> {
        let current: EisMode = self.params.get_or(KEY_EIS, EisMode::Off)?;
        if current == eis {
            return Ok(Outcome::unchanged());
        }
        info!("EIS {} -> {}", current, eis);
        self.reconfigure(KEY_EIS, eis.to_string(), "set_eis_mode")
    }

    pub fn set_hdr(&mut self, hdr: HdrMode) -> Result<Outcome> {
        let current: HdrMode = self.params.get_or(KEY_HDR, HdrMode::Linear)?;
        if current == hdr {
            return Ok(Outcome::unchanged());
        }
        info!("HDR {} -> {}", current, hdr);
        self.reconfigure(KEY_HDR, hdr.to_string(), "set_hdr")
    }

    pub fn set_memc_enabled(&mut self, enabled: bool) -> Result<Outcome> {
        if self.params.get_bool(KEY_ENABLE_MEMC, false)? == enabled {
            return Ok(Outcome::unchanged());
        }
        self.reconfigure(KEY_ENABLE_MEMC, flag(enabled), "set_memc")
    }

    pub fn set_rtsp_enabled(&mut self, enabled: bool) -> Result<Outcome> {
        if self.params.get_bool(KEY_ENABLE_RTSP, false)? == enabled {
            return Ok(Outcome::unchanged());
        }
        self.reconfigure(KEY_ENABLE_RTSP, flag(enabled), "set_rtsp")
    }

    /// Applied live to VI, no rebuild
    pub fn set_smart_ae(&mut self, enabled: bool) -> Result<Outcome> {
        if self.params.get_bool(KEY_SMART_AE, false)? == enabled {
            return Ok(Outcome::unchanged());
        }
        let started = Instant::now();

        if let Some(built) = self.built.as_mut() {
            let mut vi = built.attr.vi.clone();
            if let ChannelAttr::Vi { smart_ae, .. } = &mut vi {
                *smart_ae = enabled;
            }
            self.caps
                .set_attr(built.vi, &vi)
                .map_err(|e| PipelineError::capability(CapOp::SetAttr, built.vi, e))?;
            built.attr.vi = vi;
        }
        self.params.set(KEY_SMART_AE, &flag(enabled));
        Ok(self.finish("set_smart_ae", started))
    }

    /// Toggle per-unit pump logging; running pumps pick it up immediately
    pub fn set_debug_mode(&mut self, enabled: bool) -> Outcome {
        let previous = self.verbose.swap(enabled, Ordering::Relaxed);
        Outcome {
            changed: previous != enabled,
            elapsed: Duration::ZERO,
        }
    }

    #[instrument(skip(self))]
    pub fn start_record(&mut self) -> Result<Outcome> {
        let Some(built) = self.built.as_ref() else {
            return Err(PipelineError::InvalidState("pipeline is not built".into()));
        };
        if built.photo.is_some() {
            return Err(PipelineError::SessionConflict {
                requested: "recording",
                active: "photo capture",
            });
        }
        let Some(venc) = built.main else {
            debug!("No record encoder in {} mode", built.attr.selection.mode);
            return Ok(Outcome::unchanged());
        };
        if built.record.is_some() {
            return Ok(Outcome::unchanged());
        }

        let started = Instant::now();
        let attr = built.attr.clone();
        let vi = built.vi;
        let session = self.open_record(&attr, vi, venc)?;
        if let Some(built) = self.built.as_mut() {
            built.record = Some(session);
        }
        self.params.set(KEY_ENABLE_RECORD, "1");
        info!("Recording started");
        Ok(self.finish("start_record", started))
    }

    /// Pump join, unbinds, RGN, GDC, then stop receiving
    ///
    /// A pump that does not drain leaves the session untouched so the call
    /// can be retried.
    #[instrument(skip(self))]
    pub fn stop_record(&mut self) -> Result<Outcome> {
        let Some(built) = self.built.as_mut() else {
            return Ok(Outcome::unchanged());
        };
        let Some(record) = built.record.as_mut() else {
            return Ok(Outcome::unchanged());
        };
        let started = Instant::now();

        record.stack.stop_pumps()?;
        let result = match built.record.take() {
            Some(mut record) => record.stack.unwind(),
            None => Ok(()),
        };
        self.params.set(KEY_ENABLE_RECORD, "0");
        result?;

        info!("Recording stopped");
        Ok(self.finish("stop_record", started))
    }

    #[instrument(skip(self))]
    pub fn start_photo(&mut self, max: u32) -> Result<Outcome> {
        let Some(built) = self.built.as_mut() else {
            return Err(PipelineError::InvalidState("pipeline is not built".into()));
        };
        if built.record.is_some() {
            return Err(PipelineError::SessionConflict {
                requested: "photo capture",
                active: "recording",
            });
        }
        let Some(jpeg) = built.jpeg else {
            return Err(PipelineError::InvalidState(format!(
                "photo capture needs photo mode, pipeline is in {} mode",
                built.attr.selection.mode
            )));
        };
        if max == 0 {
            return Err(PipelineError::InvalidState(
                "photo count must be at least 1".into(),
            ));
        }
        if let Some(previous) = built.photo.as_mut() {
            if !previous.is_drained() {
                return Err(PipelineError::InvalidState(
                    "photo capture already running".into(),
                ));
            }
            if let Some(mut previous) = built.photo.take() {
                previous.stack.unwind()?;
            }
        }

        let started = Instant::now();
        let vi = built.vi;
        let session = self.open_photo(vi, jpeg, max)?;
        if let Some(built) = self.built.as_mut() {
            built.photo = Some(session);
        }
        info!("Photo capture of {} started", max);
        Ok(self.finish("start_photo", started))
    }

    /// Only valid with no session or once the pump has drained
    #[instrument(skip(self))]
    pub fn stop_photo(&mut self) -> Result<Outcome> {
        let Some(built) = self.built.as_mut() else {
            return Ok(Outcome::unchanged());
        };
        let Some(photo) = built.photo.as_mut() else {
            return Ok(Outcome::unchanged());
        };
        if !photo.is_drained() {
            return Err(PipelineError::PhotoInProgress {
                remaining: photo.progress().remaining(),
            });
        }

        let started = Instant::now();
        if let Some(mut photo) = built.photo.take() {
            let taken = photo.taken();
            photo.stack.unwind()?;
            info!("Photo capture finished with {} units", taken);
        }
        Ok(self.finish("stop_photo", started))
    }

    /// Stop sessions and power the pipeline down; `init` wakes it
    pub fn enter_sleep(&mut self) -> Result<Outcome> {
        info!("Entering sleep");
        self.deinit()
    }

    /// Validate the current parameters without touching hardware
    fn plan(&self) -> std::result::Result<PipelineAttr, ConfigError> {
        let selection = self.selector.select(self.params.as_ref())?;
        PipelineAttr::derive(selection, self.params.as_ref(), &self.config.buffers)
    }

    /// Persist `key`, then rebuild if built
    ///
    /// The new value is validated first; on a config error the previous
    /// value is restored and no channel is touched.
    fn reconfigure(&mut self, key: &str, value: String, op: &'static str) -> Result<Outcome> {
        let previous = self.params.get(key);
        self.params.set(key, &value);
        if let Err(e) = self.plan() {
            match previous {
                Some(previous) => self.params.set(key, &previous),
                None => {
                    self.params.remove(key);
                }
            }
            warn!("Rejected {} = {}: {}", key, value, e);
            return Err(e.into());
        }

        let started = Instant::now();
        if self.built.is_some() {
            if self.is_recording() {
                info!("Stopping active recording for {}", op);
            }
            let torn = self.deinit();
            let rebuilt = self.init();
            torn?;
            rebuilt?;
        }
        Ok(self.finish(op, started))
    }

    fn build(&self, attr: PipelineAttr) -> Result<Built> {
        let mut base = StageStack::new(
            self.caps.clone(),
            "pipeline",
            self.config.pump.drain_timeout(),
        );
        let (vi, main, jpeg) = match self.build_base(&attr, &mut base) {
            Ok(handles) => handles,
            Err(e) => return Err(base.rollback(e)),
        };

        let record = match main {
            Some(venc) if attr.record_on_init => match self.open_record(&attr, vi, venc) {
                Ok(session) => Some(session),
                Err(e) => return Err(base.rollback(e)),
            },
            _ => None,
        };

        Ok(Built {
            attr,
            base,
            vi,
            main,
            jpeg,
            record,
            photo: None,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_base(
        &self,
        attr: &PipelineAttr,
        base: &mut StageStack,
    ) -> Result<(ChannelHandle, Option<ChannelHandle>, Option<ChannelHandle>)> {
        let vi = base.create_enabled(ChannelKind::Vi, &attr.vi)?;

        let vpss = match &attr.display {
            Some(display) => {
                let vpss = base.create_enabled(ChannelKind::Vpss, &display.vpss)?;
                base.bind(vi, vpss)?;
                // VO only binds once its layer is enabled
                let vo = base.create_enabled(ChannelKind::Vo, &display.vo)?;
                base.bind(vpss, vo)?;
                Some(vpss)
            }
            None => None,
        };

        let main = match &attr.main {
            Some(venc) => Some(base.create_enabled(ChannelKind::Venc, venc)?),
            None => None,
        };

        if let Some(sub_attr) = &attr.sub {
            let sub = base.create_enabled(ChannelKind::Venc, sub_attr)?;
            base.start_receiving(sub, ReceiveCount::Unlimited)?;
            let fps = match sub_attr {
                ChannelAttr::Venc { dst_fps, .. } => *dst_fps,
                _ => 0,
            };
            let pump = self.start_pump(
                PumpSpec::new(StreamKind::Sub, sub, &self.config.pump).target_fps(fps),
            )?;
            base.push_pump(pump);
            base.bind(vpss.unwrap_or(vi), sub)?;
        }

        let jpeg = match &attr.photo {
            Some(photo) => Some(base.create_enabled(ChannelKind::Jpeg, photo)?),
            None => None,
        };

        if attr.raw_tap {
            let pump = self.start_pump(
                PumpSpec::new(StreamKind::RawTap, vi, &self.config.pump)
                    .target_fps(attr.selection.sensor.fps),
            )?;
            base.push_pump(pump);
        }

        Ok((vi, main, jpeg))
    }

    fn open_record(
        &self,
        attr: &PipelineAttr,
        vi: ChannelHandle,
        venc: ChannelHandle,
    ) -> Result<RecordSession> {
        let mut stack = StageStack::new(
            self.caps.clone(),
            "record",
            self.config.pump.drain_timeout(),
        );
        match self.record_steps(&mut stack, attr, vi, venc) {
            Ok(stats) => Ok(RecordSession {
                stack,
                started: Instant::now(),
                stats,
            }),
            Err(e) => Err(stack.rollback(e)),
        }
    }

    fn record_steps(
        &self,
        stack: &mut StageStack,
        attr: &PipelineAttr,
        vi: ChannelHandle,
        venc: ChannelHandle,
    ) -> Result<Arc<PumpStats>> {
        stack.start_receiving(venc, ReceiveCount::Unlimited)?;

        let pump = self.start_pump(
            PumpSpec::new(StreamKind::Main, venc, &self.config.pump).target_fps(attr.record_fps),
        )?;
        let stats = pump.stats_handle();
        stack.push_pump(pump);

        let gdc = match &attr.gdc {
            Some(gdc) => Some(stack.create_enabled(ChannelKind::Gdc, gdc)?),
            None => None,
        };

        if let Some(geometry) = attr.osd {
            stack.create(
                ChannelKind::Rgn,
                &ChannelAttr::Rgn {
                    attach_to: venc,
                    geometry,
                },
            )?;
        }

        match gdc {
            Some(gdc) => {
                stack.bind(vi, gdc)?;
                stack.bind(gdc, venc)?;
            }
            None => stack.bind(vi, venc)?,
        }
        Ok(stats)
    }

    fn open_photo(&self, vi: ChannelHandle, jpeg: ChannelHandle, max: u32) -> Result<PhotoSession> {
        let mut stack = StageStack::new(
            self.caps.clone(),
            "photo",
            self.config.pump.drain_timeout(),
        );
        let steps = |stack: &mut StageStack| -> Result<Arc<PumpStats>> {
            stack.start_receiving(jpeg, ReceiveCount::Count(max))?;
            let pump = self.start_pump(
                PumpSpec::new(StreamKind::Photo, jpeg, &self.config.pump).limit(max),
            )?;
            let stats = pump.stats_handle();
            stack.push_pump(pump);
            stack.bind(vi, jpeg)?;
            Ok(stats)
        };
        match steps(&mut stack) {
            Ok(stats) => Ok(PhotoSession { stack, max, stats }),
            Err(e) => Err(stack.rollback(e)),
        }
    }

    fn start_pump(&self, spec: PumpSpec) -> Result<StreamPump> {
        let sinks = self.sinks.get(&spec.stream).cloned().unwrap_or_default();
        StreamPump::start(
            self.caps.clone(),
            spec,
            sinks,
            &self.config.pump,
            self.verbose.clone(),
        )
    }

    fn finish(&self, op: &'static str, started: Instant) -> Outcome {
        let elapsed = started.elapsed();
        metrics::histogram!("rkcam_transition_seconds", "op" => op).record(elapsed.as_secs_f64());
        debug!("{} took {:?}", op, elapsed);
        Outcome {
            changed: true,
            elapsed,
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            error!("Teardown on drop failed: {}", e);
        }
    }
}

fn flag(enabled: bool) -> String {
    if enabled { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SimulatedCapability;
    use crate::params::MemoryParams;

    fn fast_config() -> Arc<Config> {
        let mut config = Config::default();
        config.pump.fetch_timeout_ms = 10;
        config.pump.photo_fetch_timeout_ms = 10;
        config.pump.drain_timeout_ms = 1000;
        Arc::new(config)
    }

    fn setup(pairs: &[(&str, &str)]) -> (Arc<SimulatedCapability>, PipelineOrchestrator) {
        let sim = SimulatedCapability::new()
            .with_frame_interval(Duration::from_millis(2))
            .into_shared();
        let params = Arc::new(MemoryParams::from_pairs(pairs.iter().copied()));
        let orchestrator = PipelineOrchestrator::with_config(sim.clone(), params, fast_config());
        (sim, orchestrator)
    }

    #[test]
    fn test_state_follows_lifecycle() {
        let (_sim, mut orch) = setup(&[]);
        assert_eq!(orch.state(), PipelineState::Uninitialized);

        orch.init().unwrap();
        assert_eq!(
            orch.state(),
            PipelineState::Built {
                recording: true,
                photo: false
            }
        );

        orch.stop_record().unwrap();
        assert_eq!(
            orch.state(),
            PipelineState::Built {
                recording: false,
                photo: false
            }
        );

        orch.deinit().unwrap();
        assert_eq!(orch.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn test_init_is_idempotent() {
        let (sim, mut orch) = setup(&[]);
        assert!(orch.init().unwrap().changed);
        let calls = sim.control_calls().len();
        assert!(!orch.init().unwrap().changed);
        assert_eq!(sim.control_calls().len(), calls);
    }

    #[test]
    fn test_start_record_requires_pipeline() {
        let (sim, mut orch) = setup(&[]);
        assert!(matches!(
            orch.start_record(),
            Err(PipelineError::InvalidState(_))
        ));
        assert_eq!(sim.call_count(), 0);
    }

    #[test]
    fn test_stop_record_persists_choice() {
        let (_sim, mut orch) = setup(&[]);
        orch.init().unwrap();
        orch.stop_record().unwrap();
        orch.restart().unwrap();
        assert!(!orch.is_recording());

        orch.start_record().unwrap();
        orch.restart().unwrap();
        assert!(orch.is_recording());
    }

    #[test]
    fn test_config_error_restores_parameter() {
        let (sim, mut orch) = setup(&[]);
        orch.init().unwrap();
        let calls = sim.control_calls().len();

        let err = orch.set_hdr(HdrMode::Staggered).unwrap_err();
        assert!(err.is_pre_mutation());
        assert_eq!(sim.control_calls().len(), calls);
        assert_eq!(orch.params.get(KEY_HDR), None);
        assert!(orch.is_built());
    }

    #[test]
    fn test_set_mode_while_unbuilt_only_persists() {
        let (sim, mut orch) = setup(&[]);
        assert!(orch.set_mode(Mode::Photo).unwrap().changed);
        assert_eq!(sim.call_count(), 0);
        assert_eq!(orch.mode().unwrap(), Mode::Photo);
    }

    #[test]
    fn test_smart_ae_applies_live() {
        let (sim, mut orch) = setup(&[]);
        orch.init().unwrap();
        sim.clear_calls();

        assert!(orch.set_smart_ae(true).unwrap().changed);
        let vi = sim.live_of_kind(ChannelKind::Vi)[0];
        assert_eq!(
            sim.control_calls(),
            vec![crate::capability::sim::CapCall::SetAttr(vi)]
        );
        assert!(matches!(
            sim.attr_of(vi),
            Some(ChannelAttr::Vi { smart_ae: true, .. })
        ));
        assert!(!orch.set_smart_ae(true).unwrap().changed);
    }

    #[test]
    fn test_debug_mode_toggle() {
        let (sim, mut orch) = setup(&[]);
        assert!(orch.set_debug_mode(true).changed);
        assert!(!orch.set_debug_mode(true).changed);
        assert_eq!(sim.call_count(), 0);
    }
}
