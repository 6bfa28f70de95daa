//! Stream pumps
//!
//! One worker per output channel: fetch a unit, hand it to the sinks, release
//! it. Every fetched unit is released exactly once; `release` takes the unit
//! by value, so the loop cannot hand it back twice.

pub mod sink;
pub mod stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capability::{ChannelHandle, FetchOutcome, MediaCapability, Unit};
use crate::error::{PipelineError, Result, SinkError};
use crate::pipeline::worker::{StopToken, WorkerHandle};
use crate::PumpConfig;

pub use sink::{ChannelSink, FileSink, FrameSink, SinkFrame};
pub use stats::{PumpSnapshot, PumpStats};

use stats::FpsMonitor;

/// Which output a pump drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    /// Record encoder
    Main,
    /// RTSP encoder
    Sub,
    /// JPEG encoder
    Photo,
    /// Raw VI frames for USB/NPU consumers
    RawTap,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Main => "main",
            StreamKind::Sub => "sub",
            StreamKind::Photo => "photo",
            StreamKind::RawTap => "raw_tap",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared list of sinks
pub type Sinks = Vec<Arc<dyn FrameSink>>;

/// What to pump and how
#[derive(Debug, Clone)]
pub struct PumpSpec {
    pub stream: StreamKind,
    pub handle: ChannelHandle,
    /// Expected output rate, for diagnostics only; 0 disables the check
    pub target_fps: u32,
    /// Exit on its own after this many units
    pub limit: Option<u32>,
    pub fetch_timeout: Duration,
}

impl PumpSpec {
    pub fn new(stream: StreamKind, handle: ChannelHandle, tuning: &PumpConfig) -> Self {
        let fetch_timeout = match stream {
            StreamKind::Photo => tuning.photo_fetch_timeout(),
            _ => tuning.fetch_timeout(),
        };
        Self {
            stream,
            handle,
            target_fps: 0,
            limit: None,
            fetch_timeout,
        }
    }

    pub fn target_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

struct PumpContext {
    caps: Arc<dyn MediaCapability>,
    spec: PumpSpec,
    sinks: Sinks,
    stats: Arc<PumpStats>,
    verbose: Arc<AtomicBool>,
    diag_interval: u64,
    fps_tolerance: f64,
    error_backoff: Duration,
}

/// A running pump; dropping it stops and joins the worker
pub struct StreamPump {
    stream: StreamKind,
    handle: ChannelHandle,
    worker: WorkerHandle,
    stats: Arc<PumpStats>,
}

impl StreamPump {
    /// Spawn the pump thread; the channel must already be receiving
    pub fn start(
        caps: Arc<dyn MediaCapability>,
        spec: PumpSpec,
        sinks: Sinks,
        tuning: &PumpConfig,
        verbose: Arc<AtomicBool>,
    ) -> Result<Self> {
        let stream = spec.stream;
        let handle = spec.handle;
        let stats = Arc::new(PumpStats::default());
        let ctx = PumpContext {
            caps,
            spec,
            sinks,
            stats: stats.clone(),
            verbose,
            diag_interval: tuning.diag_interval,
            fps_tolerance: tuning.fps_tolerance,
            error_backoff: tuning.error_backoff(),
        };

        let worker = WorkerHandle::spawn(
            format!("pump-{}", stream.as_str()),
            tuning.drain_timeout(),
            move |stop| ctx.run(stop),
        )?;

        Ok(Self {
            stream,
            handle,
            worker,
            stats,
        })
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn stats(&self) -> PumpSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<PumpStats> {
        self.stats.clone()
    }

    /// True once the loop has exited, e.g. after reaching its unit limit
    pub fn is_finished(&mut self) -> bool {
        self.worker.is_finished()
    }

    pub fn wait(&mut self, timeout: Duration) -> bool {
        self.worker.wait(timeout)
    }

    /// Clear the run flag and join; see [`WorkerHandle::stop`]
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.worker.stop(timeout)
    }
}

impl fmt::Debug for StreamPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPump")
            .field("stream", &self.stream)
            .field("handle", &self.handle)
            .field("worker", &self.worker.name())
            .finish()
    }
}

impl PumpContext {
    fn run(self, stop: StopToken) {
        let stream = self.spec.stream;
        let handle = self.spec.handle;
        let label = stream.as_str();
        info!("{} pump started on {}", stream, handle);

        let mut fps = FpsMonitor::new(
            stream,
            self.spec.target_fps,
            self.diag_interval,
            self.fps_tolerance,
        );
        let mut taken: u32 = 0;

        // The flag is only checked between fetches
        while !stop.is_stopped() {
            if self.spec.limit.is_some_and(|limit| taken >= limit) {
                info!("{} pump collected {} units", stream, taken);
                break;
            }

            match self.caps.fetch(handle, self.spec.fetch_timeout) {
                Ok(FetchOutcome::Unit(unit)) => {
                    taken += 1;
                    self.stats.record_unit(unit.meta.pts);
                    metrics::counter!("rkcam_pump_units_total", "stream" => label).increment(1);

                    self.dispatch(&unit);
                    if let Err(e) = self.caps.release(handle, unit) {
                        error!("Failed to release unit on {}: {}", handle, e);
                        self.stats.record_error();
                    }
                    fps.tick(&self.stats);
                }
                Ok(FetchOutcome::Timeout) => {
                    self.stats.record_timeout();
                    metrics::counter!("rkcam_pump_timeouts_total", "stream" => label)
                        .increment(1);
                    debug!("{} after {:?}", PipelineError::Timeout(handle), self.spec.fetch_timeout);
                }
                Ok(FetchOutcome::Eof) => {
                    info!("{} reached end of stream", handle);
                    break;
                }
                Err(e) => {
                    warn!("Fetch on {} failed: {}", handle, e);
                    self.stats.record_error();
                    thread::sleep(self.error_backoff);
                }
            }
        }

        info!("{} pump exiting after {} units", stream, taken);
    }

    fn dispatch(&self, unit: &Unit) {
        let stream = self.spec.stream;
        if self.verbose.load(Ordering::Relaxed) {
            debug!(
                "{} unit #{} pts {:?} {} bytes{}",
                stream,
                unit.meta.sequence,
                unit.meta.pts,
                unit.len(),
                if unit.is_keyframe() { " key" } else { "" }
            );
        }

        for sink in &self.sinks {
            match sink.accept(stream, unit) {
                Ok(()) => {}
                Err(SinkError::Full(name)) => {
                    debug!("Sink '{}' full, dropping {} unit", name, stream);
                    self.stats.record_sink_error();
                }
                Err(e) => {
                    warn!("Sink '{}' rejected {} unit: {}", sink.name(), stream, e);
                    self.stats.record_sink_error();
                }
            }
        }
    }
}
