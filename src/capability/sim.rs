//! Software media server
//!
//! Implements [`MediaCapability`] without hardware. It keeps the rules the
//! real media server enforces (a bound channel cannot be disabled or
//! destroyed, a disabled channel cannot be bound, outstanding units pin their
//! channel) and records every accepted call so callers can check ordering.
//! Encoders produce synthetic units at a fixed interval once they are
//! receiving and have an upstream bind.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use super::{
    CapOp, CapResult, ChannelAttr, ChannelHandle, ChannelKind, FetchOutcome, MediaCapability,
    Packet, ReceiveCount, Unit, UnitKind,
};
use crate::capability::unit::UnitMetadata;
use crate::error::CapabilityError;

/// Live channels allowed per kind before `create` reports exhaustion
const MAX_LIVE_PER_KIND: usize = 8;

/// One accepted call, as seen by the media server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapCall {
    Create(ChannelHandle),
    SetAttr(ChannelHandle),
    Enable(ChannelHandle),
    Disable(ChannelHandle),
    Bind(ChannelHandle, ChannelHandle),
    Unbind(ChannelHandle, ChannelHandle),
    StartReceiving(ChannelHandle, ReceiveCount),
    StopReceiving(ChannelHandle),
    /// Recorded for every fetch attempt, whatever it returns
    Fetch(ChannelHandle),
    Release(ChannelHandle),
    Submit(ChannelHandle),
    Destroy(ChannelHandle),
}

impl CapCall {
    pub fn op(&self) -> CapOp {
        match self {
            CapCall::Create(_) => CapOp::Create,
            CapCall::SetAttr(_) => CapOp::SetAttr,
            CapCall::Enable(_) => CapOp::Enable,
            CapCall::Disable(_) => CapOp::Disable,
            CapCall::Bind(..) => CapOp::Bind,
            CapCall::Unbind(..) => CapOp::Unbind,
            CapCall::StartReceiving(..) => CapOp::StartReceiving,
            CapCall::StopReceiving(_) => CapOp::StopReceiving,
            CapCall::Fetch(_) => CapOp::Fetch,
            CapCall::Release(_) => CapOp::Release,
            CapCall::Submit(_) => CapOp::Submit,
            CapCall::Destroy(_) => CapOp::Destroy,
        }
    }

    /// True if the call names `handle` on either side
    pub fn involves(&self, handle: ChannelHandle) -> bool {
        match *self {
            CapCall::Bind(src, dst) | CapCall::Unbind(src, dst) => src == handle || dst == handle,
            CapCall::Create(h)
            | CapCall::SetAttr(h)
            | CapCall::Enable(h)
            | CapCall::Disable(h)
            | CapCall::StartReceiving(h, _)
            | CapCall::StopReceiving(h)
            | CapCall::Fetch(h)
            | CapCall::Release(h)
            | CapCall::Submit(h)
            | CapCall::Destroy(h) => h == handle,
        }
    }
}

#[derive(Debug)]
struct FailRule {
    op: CapOp,
    kind: Option<ChannelKind>,
    remaining: usize,
}

#[derive(Debug)]
struct SimChannel {
    attr: ChannelAttr,
    enabled: bool,
    receiving: Option<ReceiveCount>,
    produced: u64,
    next_slot: u32,
    outstanding: HashSet<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: HashMap<ChannelKind, u32>,
    channels: BTreeMap<ChannelHandle, SimChannel>,
    binds: BTreeSet<(ChannelHandle, ChannelHandle)>,
    log: Vec<CapCall>,
    failures: Vec<FailRule>,
}

impl SimState {
    /// Consume a matching failure rule, if this call is the one it targets
    fn check_failure(&mut self, op: CapOp, kind: ChannelKind) -> CapResult<()> {
        let position = self
            .failures
            .iter_mut()
            .position(|rule| {
                if rule.op != op || rule.kind.is_some_and(|k| k != kind) {
                    return false;
                }
                rule.remaining -= 1;
                rule.remaining == 0
            });
        match position {
            Some(index) => {
                self.failures.remove(index);
                Err(CapabilityError::Injected)
            }
            None => Ok(()),
        }
    }

    fn channel(&self, handle: ChannelHandle) -> CapResult<&SimChannel> {
        self.channels
            .get(&handle)
            .ok_or(CapabilityError::NotFound(handle))
    }

    fn channel_mut(&mut self, handle: ChannelHandle) -> CapResult<&mut SimChannel> {
        self.channels
            .get_mut(&handle)
            .ok_or(CapabilityError::NotFound(handle))
    }

    fn is_bound(&self, handle: ChannelHandle) -> bool {
        self.binds
            .iter()
            .any(|&(src, dst)| src == handle || dst == handle)
    }

    fn has_upstream(&self, handle: ChannelHandle) -> bool {
        self.binds.iter().any(|&(_, dst)| dst == handle)
    }

    fn has_overlay(&self, handle: ChannelHandle) -> bool {
        self.channels.values().any(|ch| {
            matches!(ch.attr, ChannelAttr::Rgn { attach_to, .. } if attach_to == handle)
        })
    }

    /// Whether a fetch on `handle` would yield a unit right now
    fn can_produce(&self, handle: ChannelHandle) -> bool {
        let Some(ch) = self.channels.get(&handle) else {
            return false;
        };
        if !ch.enabled {
            return false;
        }
        match handle.kind {
            ChannelKind::Vi => true,
            ChannelKind::Gdc | ChannelKind::Vpss => self.has_upstream(handle),
            ChannelKind::Venc | ChannelKind::Jpeg => {
                let quota_left = match ch.receiving {
                    Some(ReceiveCount::Unlimited) => true,
                    Some(ReceiveCount::Count(n)) => ch.produced < u64::from(n),
                    None => false,
                };
                quota_left && self.has_upstream(handle)
            }
            _ => false,
        }
    }
}

/// In-process stand-in for the vendor media server
pub struct SimulatedCapability {
    state: Mutex<SimState>,
    frame_interval: Duration,
    payload_size: usize,
}

impl Default for SimulatedCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCapability {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            frame_interval: Duration::from_millis(33),
            payload_size: 512,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the `nth` (1-based) future call of `op` fail, optionally only
    /// counting calls on channels of `kind`
    pub fn fail_nth(&self, op: CapOp, kind: Option<ChannelKind>, nth: usize) {
        assert!(nth > 0, "nth is 1-based");
        self.state().failures.push(FailRule {
            op,
            kind,
            remaining: nth,
        });
    }

    pub fn calls(&self) -> Vec<CapCall> {
        self.state().log.clone()
    }

    /// Calls that change channel state; fetch and release traffic left out
    pub fn control_calls(&self) -> Vec<CapCall> {
        self.state()
            .log
            .iter()
            .filter(|call| !matches!(call, CapCall::Fetch(_) | CapCall::Release(_)))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().log.clear();
    }

    pub fn call_count(&self) -> usize {
        self.state().log.len()
    }

    pub fn live_handles(&self) -> Vec<ChannelHandle> {
        self.state().channels.keys().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.state().channels.len()
    }

    pub fn live_of_kind(&self, kind: ChannelKind) -> Vec<ChannelHandle> {
        self.state()
            .channels
            .keys()
            .filter(|h| h.kind == kind)
            .copied()
            .collect()
    }

    pub fn live_binds(&self) -> Vec<(ChannelHandle, ChannelHandle)> {
        self.state().binds.iter().copied().collect()
    }

    pub fn is_receiving(&self, handle: ChannelHandle) -> bool {
        self.state()
            .channels
            .get(&handle)
            .is_some_and(|ch| ch.receiving.is_some())
    }

    /// Units fetched but not yet released, across all channels
    pub fn outstanding_units(&self) -> usize {
        self.state()
            .channels
            .values()
            .map(|ch| ch.outstanding.len())
            .sum()
    }

    pub fn attr_of(&self, handle: ChannelHandle) -> Option<ChannelAttr> {
        self.state().channels.get(&handle).map(|ch| ch.attr.clone())
    }

    /// Number of logged calls of `op` that involve `handle`
    pub fn count_for(&self, op: CapOp, handle: ChannelHandle) -> usize {
        self.state()
            .log
            .iter()
            .filter(|call| call.op() == op && call.involves(handle))
            .count()
    }

    pub fn count_op(&self, op: CapOp) -> usize {
        self.state()
            .log
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    fn make_unit(&self, handle: ChannelHandle, ch: &mut SimChannel) -> Unit {
        let sequence = ch.produced;
        ch.produced += 1;
        let slot = ch.next_slot;
        ch.next_slot = ch.next_slot.wrapping_add(1);
        ch.outstanding.insert(slot);

        let (kind, fps) = match &ch.attr {
            ChannelAttr::Venc { gop, dst_fps, .. } => {
                let gop = u64::from((*gop).max(1));
                let kind = if sequence % gop == 0 {
                    UnitKind::KeyFrame
                } else {
                    UnitKind::DeltaFrame
                };
                (kind, *dst_fps)
            }
            ChannelAttr::Jpeg { .. } => (UnitKind::Jpeg, 1),
            ChannelAttr::Vi { fps, .. } => (UnitKind::Raw, *fps),
            _ => (UnitKind::Raw, 30),
        };
        let pts = Duration::from_micros(sequence * 1_000_000 / u64::from(fps.max(1)));
        // Byte pattern encodes the sequence so consumers can spot reordering
        let data = Bytes::from(vec![(sequence & 0xff) as u8; self.payload_size]);

        Unit {
            data,
            meta: Arc::new(UnitMetadata {
                source: handle,
                sequence,
                pts,
                kind,
                slot,
            }),
            fetched_at: Instant::now(),
        }
    }
}

impl MediaCapability for SimulatedCapability {
    fn create(&self, kind: ChannelKind, attr: &ChannelAttr) -> CapResult<ChannelHandle> {
        let mut st = self.state();
        st.check_failure(CapOp::Create, kind)?;

        let live = st.channels.keys().filter(|h| h.kind == kind).count();
        if live >= MAX_LIVE_PER_KIND {
            return Err(CapabilityError::Exhausted(kind));
        }
        if let ChannelAttr::Rgn { attach_to, .. } = attr {
            st.channel(*attach_to)?;
        }

        let id = st.next_id.entry(kind).or_insert(0);
        let handle = ChannelHandle::new(kind, *id);
        *id += 1;

        st.channels.insert(
            handle,
            SimChannel {
                attr: attr.clone(),
                enabled: false,
                receiving: None,
                produced: 0,
                next_slot: 0,
                outstanding: HashSet::new(),
            },
        );
        st.log.push(CapCall::Create(handle));
        trace!("sim: created {}", handle);
        Ok(handle)
    }

    fn set_attr(&self, handle: ChannelHandle, attr: &ChannelAttr) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::SetAttr, handle.kind)?;
        st.channel_mut(handle)?.attr = attr.clone();
        st.log.push(CapCall::SetAttr(handle));
        Ok(())
    }

    fn enable(&self, handle: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Enable, handle.kind)?;
        st.channel_mut(handle)?.enabled = true;
        st.log.push(CapCall::Enable(handle));
        Ok(())
    }

    fn disable(&self, handle: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Disable, handle.kind)?;
        if st.is_bound(handle) {
            return Err(CapabilityError::Busy(handle));
        }
        st.channel_mut(handle)?.enabled = false;
        st.log.push(CapCall::Disable(handle));
        Ok(())
    }

    fn bind(&self, src: ChannelHandle, dst: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Bind, dst.kind)?;
        for handle in [src, dst] {
            if !st.channel(handle)?.enabled {
                return Err(CapabilityError::NotEnabled(handle));
            }
        }
        if !st.binds.insert((src, dst)) {
            return Err(CapabilityError::AlreadyBound(src, dst));
        }
        st.log.push(CapCall::Bind(src, dst));
        Ok(())
    }

    fn unbind(&self, src: ChannelHandle, dst: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Unbind, dst.kind)?;
        if !st.binds.remove(&(src, dst)) {
            return Err(CapabilityError::NotBound(src, dst));
        }
        st.log.push(CapCall::Unbind(src, dst));
        Ok(())
    }

    fn start_receiving(&self, handle: ChannelHandle, count: ReceiveCount) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::StartReceiving, handle.kind)?;
        let ch = st.channel_mut(handle)?;
        ch.receiving = Some(count);
        ch.produced = 0;
        st.log.push(CapCall::StartReceiving(handle, count));
        Ok(())
    }

    fn stop_receiving(&self, handle: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::StopReceiving, handle.kind)?;
        st.channel_mut(handle)?.receiving = None;
        st.log.push(CapCall::StopReceiving(handle));
        Ok(())
    }

    fn fetch(&self, handle: ChannelHandle, timeout: Duration) -> CapResult<FetchOutcome> {
        let ready = {
            let mut st = self.state();
            st.log.push(CapCall::Fetch(handle));
            st.check_failure(CapOp::Fetch, handle.kind)?;
            st.channel(handle)?;
            st.can_produce(handle)
        };

        if !ready {
            thread::sleep(timeout);
            return Ok(FetchOutcome::Timeout);
        }

        thread::sleep(self.frame_interval.min(timeout));

        let mut st = self.state();
        if !st.can_produce(handle) {
            return Ok(FetchOutcome::Timeout);
        }
        let ch = st.channel_mut(handle)?;
        let unit = self.make_unit(handle, ch);
        Ok(FetchOutcome::Unit(unit))
    }

    fn release(&self, handle: ChannelHandle, unit: Unit) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Release, handle.kind)?;
        let slot = unit.meta.slot;
        if !st.channel_mut(handle)?.outstanding.remove(&slot) {
            return Err(CapabilityError::UnknownUnit { handle, slot });
        }
        st.log.push(CapCall::Release(handle));
        Ok(())
    }

    fn submit(&self, handle: ChannelHandle, _packet: &Packet) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Submit, handle.kind)?;
        if !st.channel(handle)?.enabled {
            return Err(CapabilityError::NotEnabled(handle));
        }
        st.log.push(CapCall::Submit(handle));
        Ok(())
    }

    fn destroy(&self, handle: ChannelHandle) -> CapResult<()> {
        let mut st = self.state();
        st.check_failure(CapOp::Destroy, handle.kind)?;
        let ch = st.channel(handle)?;
        let pinned = ch.enabled || ch.receiving.is_some() || !ch.outstanding.is_empty();
        if pinned || st.is_bound(handle) || st.has_overlay(handle) {
            return Err(CapabilityError::Busy(handle));
        }
        st.channels.remove(&handle);
        st.log.push(CapCall::Destroy(handle));
        trace!("sim: destroyed {}", handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Codec, Geometry, PixelFormat};

    fn vi_attr() -> ChannelAttr {
        ChannelAttr::Vi {
            geometry: Geometry::new(1920, 1080),
            fps: 30,
            format: PixelFormat::Nv12,
            buffer_count: 4,
            smart_ae: false,
        }
    }

    fn venc_attr() -> ChannelAttr {
        ChannelAttr::Venc {
            geometry: Geometry::new(1920, 1080),
            codec: Codec::H264,
            bitrate_kbps: 8000,
            gop: 2,
            src_fps: 30,
            dst_fps: 30,
            buffer_count: 4,
            memc: false,
        }
    }

    fn sim() -> SimulatedCapability {
        SimulatedCapability::new().with_frame_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_bind_requires_enabled() {
        let caps = sim();
        let vi = caps.create(ChannelKind::Vi, &vi_attr()).expect("vi");
        let venc = caps.create(ChannelKind::Venc, &venc_attr()).expect("venc");
        caps.enable(vi).expect("enable vi");
        assert_eq!(caps.bind(vi, venc), Err(CapabilityError::NotEnabled(venc)));
        caps.enable(venc).expect("enable venc");
        caps.bind(vi, venc).expect("bind");
        assert_eq!(caps.live_binds(), vec![(vi, venc)]);
    }

    #[test]
    fn test_destroy_refuses_bound_channel() {
        let caps = sim();
        let vi = caps.create(ChannelKind::Vi, &vi_attr()).expect("vi");
        let venc = caps.create(ChannelKind::Venc, &venc_attr()).expect("venc");
        caps.enable(vi).expect("enable vi");
        caps.enable(venc).expect("enable venc");
        caps.bind(vi, venc).expect("bind");

        assert_eq!(caps.disable(venc), Err(CapabilityError::Busy(venc)));
        caps.unbind(vi, venc).expect("unbind");
        caps.disable(venc).expect("disable");
        caps.destroy(venc).expect("destroy");
        assert_eq!(caps.live_handles(), vec![vi]);
    }

    #[test]
    fn test_fetch_and_release() {
        let caps = sim();
        let vi = caps.create(ChannelKind::Vi, &vi_attr()).expect("vi");
        let venc = caps.create(ChannelKind::Venc, &venc_attr()).expect("venc");
        caps.enable(vi).expect("enable vi");
        caps.enable(venc).expect("enable venc");

        // Not receiving yet
        let outcome = caps.fetch(venc, Duration::from_millis(1)).expect("fetch");
        assert!(matches!(outcome, FetchOutcome::Timeout));

        caps.bind(vi, venc).expect("bind");
        caps.start_receiving(venc, ReceiveCount::Unlimited)
            .expect("start");
        let FetchOutcome::Unit(unit) = caps.fetch(venc, Duration::from_millis(50)).expect("fetch")
        else {
            panic!("expected a unit");
        };
        assert!(unit.is_keyframe());
        assert_eq!(caps.outstanding_units(), 1);

        caps.release(venc, unit).expect("release");
        assert_eq!(caps.outstanding_units(), 0);
    }

    #[test]
    fn test_receive_count_limits_units() {
        let caps = sim();
        let vi = caps.create(ChannelKind::Vi, &vi_attr()).expect("vi");
        let jpeg = caps
            .create(
                ChannelKind::Jpeg,
                &ChannelAttr::Jpeg {
                    geometry: Geometry::new(1920, 1080),
                    quality: 90,
                },
            )
            .expect("jpeg");
        caps.enable(vi).expect("enable vi");
        caps.enable(jpeg).expect("enable jpeg");
        caps.bind(vi, jpeg).expect("bind");
        caps.start_receiving(jpeg, ReceiveCount::Count(2))
            .expect("start");

        for _ in 0..2 {
            match caps.fetch(jpeg, Duration::from_millis(50)).expect("fetch") {
                FetchOutcome::Unit(unit) => caps.release(jpeg, unit).expect("release"),
                other => panic!("expected unit, got {other:?}"),
            }
        }
        let outcome = caps.fetch(jpeg, Duration::from_millis(1)).expect("fetch");
        assert!(matches!(outcome, FetchOutcome::Timeout));
    }

    #[test]
    fn test_fail_nth_create() {
        let caps = sim();
        caps.fail_nth(CapOp::Create, None, 2);
        caps.create(ChannelKind::Vi, &vi_attr()).expect("first create");
        assert_eq!(
            caps.create(ChannelKind::Venc, &venc_attr()),
            Err(CapabilityError::Injected)
        );
        caps.create(ChannelKind::Venc, &venc_attr())
            .expect("third create");
        assert_eq!(caps.count_op(CapOp::Create), 2);
    }
}
