//! Ordered channel operations with undo
//!
//! Each successful step pushes its inverse. `unwind` stops every pump first,
//! then replays the remaining inverses newest-first, so unbinds run before
//! disables and disables before destroys. Build errors roll back through the
//! same path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::capability::{
    CapOp, ChannelAttr, ChannelHandle, ChannelKind, MediaCapability, ReceiveCount,
};
use crate::error::{PipelineError, Result};
use crate::pump::{StreamKind, StreamPump};

#[derive(Debug)]
enum Undo {
    Destroy(ChannelHandle),
    Disable(ChannelHandle),
    Unbind(ChannelHandle, ChannelHandle),
    StopReceiving(ChannelHandle),
    Pump(StreamPump),
}

pub struct StageStack {
    caps: Arc<dyn MediaCapability>,
    label: &'static str,
    drain_timeout: Duration,
    undo: Vec<Undo>,
}

impl StageStack {
    pub fn new(caps: Arc<dyn MediaCapability>, label: &'static str, drain_timeout: Duration) -> Self {
        Self {
            caps,
            label,
            drain_timeout,
            undo: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    pub fn create(&mut self, kind: ChannelKind, attr: &ChannelAttr) -> Result<ChannelHandle> {
        let handle = self
            .caps
            .create(kind, attr)
            .map_err(|e| PipelineError::capability(CapOp::Create, kind, e))?;
        debug!("[{}] created {}", self.label, handle);
        self.undo.push(Undo::Destroy(handle));
        Ok(handle)
    }

    pub fn enable(&mut self, handle: ChannelHandle) -> Result<()> {
        self.caps
            .enable(handle)
            .map_err(|e| PipelineError::capability(CapOp::Enable, handle, e))?;
        self.undo.push(Undo::Disable(handle));
        Ok(())
    }

    /// Create and enable; the usual first two steps of every stage
    pub fn create_enabled(&mut self, kind: ChannelKind, attr: &ChannelAttr) -> Result<ChannelHandle> {
        let handle = self.create(kind, attr)?;
        self.enable(handle)?;
        Ok(handle)
    }

    pub fn bind(&mut self, src: ChannelHandle, dst: ChannelHandle) -> Result<()> {
        self.caps
            .bind(src, dst)
            .map_err(|e| PipelineError::capability(CapOp::Bind, format!("{src} -> {dst}"), e))?;
        debug!("[{}] bound {} -> {}", self.label, src, dst);
        self.undo.push(Undo::Unbind(src, dst));
        Ok(())
    }

    pub fn start_receiving(&mut self, handle: ChannelHandle, count: ReceiveCount) -> Result<()> {
        self.caps
            .start_receiving(handle, count)
            .map_err(|e| PipelineError::capability(CapOp::StartReceiving, handle, e))?;
        self.undo.push(Undo::StopReceiving(handle));
        Ok(())
    }

    pub fn push_pump(&mut self, pump: StreamPump) {
        self.undo.push(Undo::Pump(pump));
    }

    pub fn pump_mut(&mut self, stream: StreamKind) -> Option<&mut StreamPump> {
        self.undo.iter_mut().find_map(|entry| match entry {
            Undo::Pump(pump) if pump.stream() == stream => Some(pump),
            _ => None,
        })
    }

    pub fn pumps(&self) -> impl Iterator<Item = &StreamPump> {
        self.undo.iter().filter_map(|entry| match entry {
            Undo::Pump(pump) => Some(pump),
            _ => None,
        })
    }

    /// Stop and join every pump; pumps that fail to drain stay in the stack
    pub fn stop_pumps(&mut self) -> Result<()> {
        let timeout = self.drain_timeout;
        let mut first = None;
        self.undo.retain_mut(|entry| match entry {
            Undo::Pump(pump) => match pump.stop(timeout) {
                Ok(()) => false,
                Err(e) => {
                    first.get_or_insert(e);
                    true
                }
            },
            _ => true,
        });
        first.map_or(Ok(()), Err)
    }

    /// Undo everything, best effort; returns the first error seen
    pub fn unwind(&mut self) -> Result<()> {
        let mut first = self.stop_pumps().err();
        if let Some(e) = &first {
            error!("[{}] {}; tearing down anyway", self.label, e);
        }

        while let Some(entry) = self.undo.pop() {
            if let Err(e) = self.undo_one(entry) {
                error!("[{}] teardown step failed: {}", self.label, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Unwind after a failed build, keeping the build error as the result
    pub fn rollback(&mut self, cause: PipelineError) -> PipelineError {
        warn!("[{}] build failed ({}), rolling back", self.label, cause);
        if let Err(e) = self.unwind() {
            warn!("[{}] rollback incomplete: {}", self.label, e);
        }
        cause
    }

    fn undo_one(&self, entry: Undo) -> Result<()> {
        let caps = &self.caps;
        match entry {
            Undo::Destroy(handle) => {
                caps.destroy(handle)
                    .map_err(|e| PipelineError::capability(CapOp::Destroy, handle, e))?;
                debug!("[{}] destroyed {}", self.label, handle);
            }
            Undo::Disable(handle) => caps
                .disable(handle)
                .map_err(|e| PipelineError::capability(CapOp::Disable, handle, e))?,
            Undo::Unbind(src, dst) => {
                caps.unbind(src, dst).map_err(|e| {
                    PipelineError::capability(CapOp::Unbind, format!("{src} -> {dst}"), e)
                })?;
                debug!("[{}] unbound {} -> {}", self.label, src, dst);
            }
            Undo::StopReceiving(handle) => caps
                .stop_receiving(handle)
                .map_err(|e| PipelineError::capability(CapOp::StopReceiving, handle, e))?,
            // A pump that would not drain: dropping it waits once more, then detaches
            Undo::Pump(pump) => drop(pump),
        }
        Ok(())
    }
}

impl Drop for StageStack {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            warn!("[{}] dropped with {} live steps", self.label, self.undo.len());
            if let Err(e) = self.unwind() {
                warn!("[{}] teardown on drop incomplete: {}", self.label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::sim::CapCall;
    use crate::capability::{Codec, Geometry, PixelFormat, SimulatedCapability};

    fn vi_attr() -> ChannelAttr {
        ChannelAttr::Vi {
            geometry: Geometry::new(1280, 720),
            fps: 30,
            format: PixelFormat::Nv12,
            buffer_count: 4,
            smart_ae: false,
        }
    }

    fn venc_attr() -> ChannelAttr {
        ChannelAttr::Venc {
            geometry: Geometry::new(1280, 720),
            codec: Codec::H264,
            bitrate_kbps: 4000,
            gop: 30,
            src_fps: 30,
            dst_fps: 30,
            buffer_count: 4,
            memc: false,
        }
    }

    #[test]
    fn test_unwind_reverses_order() {
        let sim = SimulatedCapability::new().into_shared();
        let mut stack = StageStack::new(sim.clone(), "test", Duration::from_secs(1));

        let vi = stack.create_enabled(ChannelKind::Vi, &vi_attr()).unwrap();
        let venc = stack.create_enabled(ChannelKind::Venc, &venc_attr()).unwrap();
        stack.bind(vi, venc).unwrap();
        sim.clear_calls();

        stack.unwind().unwrap();
        assert_eq!(
            sim.calls(),
            vec![
                CapCall::Unbind(vi, venc),
                CapCall::Disable(venc),
                CapCall::Destroy(venc),
                CapCall::Disable(vi),
                CapCall::Destroy(vi),
            ]
        );
        assert!(stack.is_empty());
        assert_eq!(sim.live_count(), 0);
    }

    #[test]
    fn test_unwind_continues_after_failure() {
        let sim = SimulatedCapability::new().into_shared();
        let mut stack = StageStack::new(sim.clone(), "test", Duration::from_secs(1));
        let vi = stack.create_enabled(ChannelKind::Vi, &vi_attr()).unwrap();
        let venc = stack.create_enabled(ChannelKind::Venc, &venc_attr()).unwrap();

        sim.fail_nth(CapOp::Destroy, Some(ChannelKind::Venc), 1);
        let err = stack.unwind().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Capability {
                op: CapOp::Destroy,
                ..
            }
        ));
        // VI still went away
        assert_eq!(sim.live_handles(), vec![venc]);
        assert!(!sim.live_handles().contains(&vi));
    }

    #[test]
    fn test_drop_unwinds_remaining_steps() {
        let sim = SimulatedCapability::new().into_shared();
        let mut stack = StageStack::new(sim.clone(), "test", Duration::from_secs(1));
        let vi = stack.create_enabled(ChannelKind::Vi, &vi_attr()).unwrap();
        let venc = stack.create_enabled(ChannelKind::Venc, &venc_attr()).unwrap();
        stack.bind(vi, venc).unwrap();

        sim.fail_nth(CapOp::Destroy, Some(ChannelKind::Venc), 1);
        drop(stack);

        assert!(sim.live_binds().is_empty());
        assert_eq!(sim.live_handles(), vec![venc]);
    }
}
