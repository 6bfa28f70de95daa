//! Stream pump tests: unit accounting, bounded sessions and idle channels.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rkcam::capability::sim::CapCall;
use rkcam::capability::{
    CapOp, ChannelAttr, ChannelHandle, ChannelKind, Codec, Geometry, MediaCapability,
    PixelFormat, ReceiveCount, SimulatedCapability,
};
use rkcam::pump::{ChannelSink, FrameSink, PumpSpec, StreamKind, StreamPump};
use rkcam::PumpConfig;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

fn init_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

fn tuning() -> PumpConfig {
    let mut config = rkcam::Config::default().pump;
    config.fetch_timeout_ms = 10;
    config.photo_fetch_timeout_ms = 10;
    config.drain_timeout_ms = 1000;
    config
}

fn sim() -> Arc<SimulatedCapability> {
    init_logging();
    SimulatedCapability::new()
        .with_frame_interval(Duration::from_millis(2))
        .into_shared()
}

fn vi(sim: &SimulatedCapability) -> ChannelHandle {
    let vi = sim
        .create(
            ChannelKind::Vi,
            &ChannelAttr::Vi {
                geometry: Geometry::new(1920, 1080),
                fps: 30,
                format: PixelFormat::Nv12,
                buffer_count: 4,
                smart_ae: false,
            },
        )
        .unwrap();
    sim.enable(vi).unwrap();
    vi
}

fn encoder(sim: &SimulatedCapability, kind: ChannelKind) -> ChannelHandle {
    let attr = match kind {
        ChannelKind::Jpeg => ChannelAttr::Jpeg {
            geometry: Geometry::new(1920, 1080),
            quality: 90,
        },
        _ => ChannelAttr::Venc {
            geometry: Geometry::new(1920, 1080),
            codec: Codec::H265,
            bitrate_kbps: 8000,
            gop: 30,
            src_fps: 30,
            dst_fps: 30,
            buffer_count: 4,
            memc: false,
        },
    };
    let handle = sim.create(kind, &attr).unwrap();
    sim.enable(handle).unwrap();
    handle
}

fn start(
    sim: &Arc<SimulatedCapability>,
    spec: PumpSpec,
    sinks: Vec<Arc<dyn FrameSink>>,
) -> StreamPump {
    StreamPump::start(
        sim.clone(),
        spec,
        sinks,
        &tuning(),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap()
}

#[test]
fn test_bounded_pump_stops_at_limit() {
    let sim = sim();
    let vi = vi(&sim);
    let jpeg = encoder(&sim, ChannelKind::Jpeg);
    let (sink, rx) = ChannelSink::bounded("photos", 16);

    sim.start_receiving(jpeg, ReceiveCount::Count(5)).unwrap();
    let mut pump = start(
        &sim,
        PumpSpec::new(StreamKind::Photo, jpeg, &tuning()).limit(5),
        vec![Arc::new(sink)],
    );
    sim.bind(vi, jpeg).unwrap();

    assert!(pump.wait(Duration::from_secs(5)));
    assert_eq!(pump.stats().units, 5);
    assert_eq!(sim.count_for(CapOp::Release, jpeg), 5);
    assert_eq!(sim.outstanding_units(), 0);

    // Nothing fetched after the fifth release
    let calls = sim.calls();
    let last_release = calls
        .iter()
        .rposition(|c| *c == CapCall::Release(jpeg))
        .unwrap();
    assert!(!calls[last_release..].contains(&CapCall::Fetch(jpeg)));

    let frames: Vec<_> = rx.try_iter().collect();
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.stream == StreamKind::Photo));
    assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));

    pump.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_every_fetched_unit_is_released() {
    let sim = sim();
    let vi = vi(&sim);
    let venc = encoder(&sim, ChannelKind::Venc);

    sim.start_receiving(venc, ReceiveCount::Unlimited).unwrap();
    let mut pump = start(
        &sim,
        PumpSpec::new(StreamKind::Main, venc, &tuning()).target_fps(30),
        Vec::new(),
    );
    sim.bind(vi, venc).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    pump.stop(Duration::from_secs(1)).unwrap();

    let units = pump.stats().units;
    assert!(units > 0);
    assert_eq!(sim.count_for(CapOp::Release, venc) as u64, units);
    assert_eq!(sim.outstanding_units(), 0);
    assert!(pump.stats().first_pts.is_some());

    // Channel teardown is possible once the pump is gone
    sim.unbind(vi, venc).unwrap();
    sim.stop_receiving(venc).unwrap();
    sim.disable(venc).unwrap();
    sim.destroy(venc).unwrap();
}

#[test]
fn test_idle_channel_only_times_out() {
    let sim = sim();
    let venc = encoder(&sim, ChannelKind::Venc);

    sim.start_receiving(venc, ReceiveCount::Unlimited).unwrap();
    let mut pump = start(&sim, PumpSpec::new(StreamKind::Sub, venc, &tuning()), Vec::new());

    std::thread::sleep(Duration::from_millis(60));
    pump.stop(Duration::from_secs(1)).unwrap();

    let stats = pump.stats();
    assert_eq!(stats.units, 0);
    assert!(stats.timeouts > 0);
    assert!(stats.first_pts.is_none());
    assert_eq!(sim.count_for(CapOp::Release, venc), 0);
}

#[test]
fn test_full_sink_does_not_stall_pump() {
    let sim = sim();
    let vi = vi(&sim);
    let venc = encoder(&sim, ChannelKind::Venc);
    let (sink, rx) = ChannelSink::bounded("slow", 2);

    sim.start_receiving(venc, ReceiveCount::Unlimited).unwrap();
    let mut pump = start(
        &sim,
        PumpSpec::new(StreamKind::Main, venc, &tuning()),
        vec![Arc::new(sink)],
    );
    sim.bind(vi, venc).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    pump.stop(Duration::from_secs(1)).unwrap();

    let stats = pump.stats();
    assert!(stats.units > 2);
    assert_eq!(stats.sink_errors, stats.units - 2);
    assert_eq!(rx.len(), 2);
    assert_eq!(sim.outstanding_units(), 0);
}
