//! Pump statistics, shared lock-free between a pump and its observers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{debug, warn};

use super::StreamKind;

const NO_PTS: u64 = u64::MAX;

struct Counters {
    units: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    sink_errors: AtomicU64,
    first_pts_us: AtomicU64,
    /// Last measured fps, in thousandths
    fps_milli: AtomicU64,
}

/// Per-pump counters
pub struct PumpStats {
    counters: CachePadded<Counters>,
}

/// Point-in-time copy of [`PumpStats`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpSnapshot {
    pub units: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub sink_errors: u64,
    pub first_pts: Option<Duration>,
    pub fps: f64,
}

impl Default for PumpStats {
    fn default() -> Self {
        Self {
            counters: CachePadded::new(Counters {
                units: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                sink_errors: AtomicU64::new(0),
                first_pts_us: AtomicU64::new(NO_PTS),
                fps_milli: AtomicU64::new(0),
            }),
        }
    }
}

impl PumpStats {
    pub fn record_unit(&self, pts: Duration) {
        let _ = self.counters.first_pts_us.compare_exchange(
            NO_PTS,
            pts.as_micros() as u64,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.counters.units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn units(&self) -> u64 {
        self.counters.units.load(Ordering::Relaxed)
    }

    fn set_fps(&self, fps: f64) {
        self.counters
            .fps_milli
            .store((fps * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PumpSnapshot {
        let first = self.counters.first_pts_us.load(Ordering::Relaxed);
        PumpSnapshot {
            units: self.counters.units.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            sink_errors: self.counters.sink_errors.load(Ordering::Relaxed),
            first_pts: (first != NO_PTS).then(|| Duration::from_micros(first)),
            fps: self.counters.fps_milli.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Achieved-rate check run from the pump loop every `interval` units
pub(crate) struct FpsMonitor {
    stream: StreamKind,
    target: u32,
    interval: u64,
    tolerance: f64,
    window_start: Instant,
    window_units: u64,
}

impl FpsMonitor {
    pub fn new(stream: StreamKind, target: u32, interval: u64, tolerance: f64) -> Self {
        Self {
            stream,
            target,
            interval: interval.max(1),
            tolerance,
            window_start: Instant::now(),
            window_units: 0,
        }
    }

    /// Count one unit; returns the measured fps when a window closes
    pub fn tick(&mut self, stats: &PumpStats) -> Option<f64> {
        self.window_units += 1;
        if self.window_units < self.interval {
            return None;
        }

        let elapsed = self.window_start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.window_units as f64 / elapsed
        } else {
            0.0
        };
        self.window_start = Instant::now();
        self.window_units = 0;

        stats.set_fps(fps);
        metrics::gauge!("rkcam_pump_fps", "stream" => self.stream.as_str()).set(fps);

        if self.target > 0 {
            let target = f64::from(self.target);
            if (fps - target).abs() / target > self.tolerance {
                warn!(
                    "{} stream running at {:.1} fps, expected {}",
                    self.stream, fps, self.target
                );
            } else {
                debug!("{} stream at {:.1} fps", self.stream, fps);
            }
        }
        Some(fps)
    }
}
