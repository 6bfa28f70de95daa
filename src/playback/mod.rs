//! Clip playback
//!
//! A [`PlaybackSession`] opens a clip, builds VDEC -> VO and ADEC -> AO, and
//! runs one thread per track. Each thread reads from the shared demuxer under
//! a mutex, then submits outside it. Events reach the UI through a bounded
//! queue it polls once per tick.

pub mod demux;
pub mod track;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::capability::{ChannelAttr, ChannelHandle, ChannelKind, MediaCapability, PixelFormat};
use crate::error::{DemuxError, PipelineError, PlaybackError, Result};
use crate::pipeline::stages::StageStack;
use crate::pipeline::worker::{StopToken, WorkerHandle};
use crate::PlaybackConfig;

pub use demux::{
    AudioInfo, DemuxRead, Demuxer, DemuxerOpener, MediaInfo, MemoryClip, MemoryDemuxer,
    MemoryOpener, TrackType, VideoInfo,
};
pub use track::{TrackEvent, TrackStatus};

/// Events delivered to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Play,
    Pause,
    Stop,
    /// Every enabled track reached the end
    Eof,
    Error(String),
}

/// Status of both tracks; one lock so end-of-file checks see a consistent pair
#[derive(Debug, Clone, Copy)]
struct Statuses {
    video: Option<TrackStatus>,
    audio: Option<TrackStatus>,
}

impl Statuses {
    fn get(&self, track: TrackType) -> Option<TrackStatus> {
        match track {
            TrackType::Video => self.video,
            TrackType::Audio => self.audio,
        }
    }

    fn slot(&mut self, track: TrackType) -> &mut Option<TrackStatus> {
        match track {
            TrackType::Video => &mut self.video,
            TrackType::Audio => &mut self.audio,
        }
    }

    fn other(track: TrackType) -> TrackType {
        match track {
            TrackType::Video => TrackType::Audio,
            TrackType::Audio => TrackType::Video,
        }
    }
}

/// State shared between the session and its track threads
struct Shared {
    demuxer: Mutex<Box<dyn Demuxer>>,
    statuses: Mutex<Statuses>,
    video_pts: AtomicU64,
    audio_pts: AtomicU64,
    info: MediaInfo,
    events: Sender<PlayerEvent>,
}

impl Shared {
    fn demuxer(&self) -> MutexGuard<'_, Box<dyn Demuxer>> {
        self.demuxer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn statuses(&self) -> MutexGuard<'_, Statuses> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self, track: TrackType) -> Option<TrackStatus> {
        self.statuses().get(track)
    }

    fn pts(&self, track: TrackType) -> &AtomicU64 {
        match track {
            TrackType::Video => &self.video_pts,
            TrackType::Audio => &self.audio_pts,
        }
    }

    /// Apply `event` to `track`; illegal transitions are reported, not applied
    fn transition(&self, track: TrackType, event: TrackEvent) -> std::result::Result<(), PlaybackError> {
        let mut statuses = self.statuses();
        let slot = statuses.slot(track);
        let Some(from) = *slot else {
            return Ok(());
        };
        let next = from.next(event).ok_or(PlaybackError::InvalidTransition {
            track: track.as_str(),
            from,
            event,
        })?;
        *slot = Some(next);
        Ok(())
    }

    fn emit(&self, event: PlayerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Player event queue full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn seek(&self, track: TrackType, position_ms: u64) -> std::result::Result<(), PlaybackError> {
        self.demuxer().seek(track, position_ms)?;
        self.pts(track).store(position_ms, Ordering::Relaxed);
        Ok(())
    }

    /// Rewind and pause `track`; fire `Eof` only if no other track still runs
    fn finish_track(&self, track: TrackType) {
        if let Err(e) = self.seek(track, 0) {
            warn!("Rewinding {} track failed: {}", track.as_str(), e);
        }
        let last = {
            let mut statuses = self.statuses();
            if let Some(status) = statuses.slot(track) {
                *status = status.next(TrackEvent::Eof).unwrap_or(TrackStatus::Pause);
            }
            statuses.get(Statuses::other(track)) != Some(TrackStatus::Running)
        };
        debug!("{} track reached end of file", track.as_str());
        if last {
            info!("Playback reached end of file");
            self.emit(PlayerEvent::Eof);
        }
    }
}

struct TrackLoop {
    shared: Arc<Shared>,
    caps: Arc<dyn MediaCapability>,
    track: TrackType,
    sink: ChannelHandle,
    packet_interval: Duration,
    idle_wait: Duration,
    sync_cap_frames: u32,
}

impl TrackLoop {
    fn run(self, stop: StopToken) {
        let name = self.track.as_str();
        debug!("{} track loop started", name);

        while !stop.is_stopped() {
            if self.shared.status(self.track) != Some(TrackStatus::Running) {
                thread::sleep(self.idle_wait);
                continue;
            }
            if self.track == TrackType::Audio {
                self.throttle_audio();
            }

            let read = self.shared.demuxer().read(self.track);
            match read {
                Ok(DemuxRead::Packet(packet)) => {
                    self.shared
                        .pts(self.track)
                        .store(packet.pts_ms, Ordering::Relaxed);
                    if let Err(e) = self.caps.submit(self.sink, &packet) {
                        warn!("Submitting {} packet to {} failed: {}", name, self.sink, e);
                    }
                    thread::sleep(self.packet_interval);
                }
                Ok(DemuxRead::Eof) => self.shared.finish_track(self.track),
                Err(e) => {
                    error!("Reading {} track failed: {}", name, e);
                    if let Err(e) = self.shared.transition(self.track, TrackEvent::Error) {
                        debug!("{}", e);
                    }
                    self.shared.emit(PlayerEvent::Error(e.to_string()));
                }
            }
        }
        debug!("{} track loop exiting", name);
    }

    /// Sleep while audio is more than one video frame ahead, capped
    fn throttle_audio(&self) {
        let Some(video) = &self.shared.info.video else {
            return;
        };
        if self.shared.status(TrackType::Video) != Some(TrackStatus::Running) {
            return;
        }
        let interval = video.frame_interval_ms();
        let audio = self.shared.audio_pts.load(Ordering::Relaxed);
        let video_pts = self.shared.video_pts.load(Ordering::Relaxed);
        let ahead = audio.saturating_sub(video_pts);
        if ahead > interval {
            let cap = interval * u64::from(self.sync_cap_frames);
            thread::sleep(Duration::from_millis(ahead.min(cap)));
        }
    }
}

struct Loaded {
    path: PathBuf,
    shared: Arc<Shared>,
    stack: StageStack,
    workers: Vec<WorkerHandle>,
}

/// Playback of one clip at a time
pub struct PlaybackSession {
    caps: Arc<dyn MediaCapability>,
    opener: Arc<dyn DemuxerOpener>,
    config: PlaybackConfig,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    loaded: Option<Loaded>,
    destroyed: bool,
}

impl PlaybackSession {
    pub fn create(
        caps: Arc<dyn MediaCapability>,
        opener: Arc<dyn DemuxerOpener>,
        config: &PlaybackConfig,
    ) -> Self {
        let (events_tx, events_rx) = flume::bounded(config.event_queue_depth.max(1));
        Self {
            caps,
            opener,
            config: config.clone(),
            events_tx,
            events_rx,
            loaded: None,
            destroyed: false,
        }
    }

    /// Next pending event, without blocking
    pub fn poll_event(&self) -> Option<PlayerEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Receiver for consumers that prefer to block or await
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    pub fn file(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.path.as_path())
    }

    pub fn status(&self, track: TrackType) -> Option<TrackStatus> {
        self.loaded
            .as_ref()
            .and_then(|l| l.shared.status(track))
    }

    /// Open `path` and build its decode paths; replaces any loaded clip
    pub fn set_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.check_alive()?;
        let path = path.as_ref();
        if self.loaded.is_some() {
            self.remove_file()?;
        }

        let demuxer = self.opener.open(path).map_err(PlaybackError::from)?;
        let info = demuxer.info().clone();
        let mut stack = StageStack::new(self.caps.clone(), "playback", self.config.drain_timeout());

        let (video_sink, audio_sink) = match build_outputs(&mut stack, &info) {
            Ok(sinks) => sinks,
            Err(e) => return Err(stack.rollback(e)),
        };

        let statuses = Statuses {
            video: video_sink.map(|_| TrackStatus::Uninitialized),
            audio: audio_sink.map(|_| TrackStatus::Uninitialized),
        };
        let shared = Arc::new(Shared {
            demuxer: Mutex::new(demuxer),
            statuses: Mutex::new(statuses),
            video_pts: AtomicU64::new(0),
            audio_pts: AtomicU64::new(0),
            info: info.clone(),
            events: self.events_tx.clone(),
        });
        for track in [TrackType::Video, TrackType::Audio] {
            shared.transition(track, TrackEvent::SetFile)?;
        }

        let mut workers = Vec::new();
        let tracks = [
            (TrackType::Video, video_sink, info.video.as_ref().map(VideoInfo::frame_interval_ms)),
            (TrackType::Audio, audio_sink, info.audio.as_ref().map(|a| a.packet_ms)),
        ];
        for (track, sink, interval_ms) in tracks {
            let (Some(sink), Some(interval_ms)) = (sink, interval_ms) else {
                continue;
            };
            let body = TrackLoop {
                shared: shared.clone(),
                caps: self.caps.clone(),
                track,
                sink,
                packet_interval: Duration::from_millis(interval_ms),
                idle_wait: self.config.idle_wait(),
                sync_cap_frames: self.config.sync_cap_frames,
            };
            match WorkerHandle::spawn(
                format!("player-{}", track.as_str()),
                self.config.drain_timeout(),
                move |stop| body.run(stop),
            ) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    drop(workers);
                    return Err(stack.rollback(e));
                }
            }
        }

        info!("Loaded {} ({} ms)", path.display(), info.duration_ms);
        self.loaded = Some(Loaded {
            path: path.to_path_buf(),
            shared,
            stack,
            workers,
        });
        Ok(())
    }

    pub fn play(&mut self) -> Result<()> {
        self.apply(TrackEvent::Play)?;
        self.emit(PlayerEvent::Play);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.apply(TrackEvent::Pause)?;
        self.emit(PlayerEvent::Pause);
        Ok(())
    }

    /// Pause and rewind both tracks
    pub fn stop(&mut self) -> Result<()> {
        self.apply(TrackEvent::Stop)?;
        let shared = &self.loaded()?.shared;
        for track in [TrackType::Video, TrackType::Audio] {
            if shared.status(track).is_some() {
                shared.seek(track, 0)?;
            }
        }
        self.emit(PlayerEvent::Stop);
        Ok(())
    }

    pub fn seek_video(&mut self, position_ms: u64) -> Result<()> {
        self.seek(TrackType::Video, position_ms)
    }

    pub fn seek_audio(&mut self, position_ms: u64) -> Result<()> {
        self.seek(TrackType::Audio, position_ms)
    }

    pub fn duration(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.loaded()?.shared.info.duration_ms))
    }

    /// Video position if the clip has video, audio otherwise
    pub fn position(&self) -> Result<Duration> {
        let shared = &self.loaded()?.shared;
        let track = if shared.info.video.is_some() {
            TrackType::Video
        } else {
            TrackType::Audio
        };
        Ok(Duration::from_millis(shared.pts(track).load(Ordering::Relaxed)))
    }

    /// Stop the track threads, then unbind and destroy the decode paths
    pub fn remove_file(&mut self) -> Result<()> {
        let Some(mut loaded) = self.loaded.take() else {
            return Ok(());
        };

        let mut first = None;
        for worker in &mut loaded.workers {
            if let Err(e) = worker.stop(self.config.drain_timeout()) {
                error!("{}", e);
                first.get_or_insert(e);
            }
        }
        loaded.workers.clear();

        for track in [TrackType::Video, TrackType::Audio] {
            let _ = loaded.shared.transition(track, TrackEvent::Remove);
        }
        if let Err(e) = loaded.stack.unwind() {
            first.get_or_insert(e);
        }
        info!("Unloaded {}", loaded.path.display());
        first.map_or(Ok(()), Err)
    }

    /// Release everything; the session is unusable afterwards
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        let result = self.remove_file();
        self.destroyed = true;
        result
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(PlaybackError::Destroyed.into());
        }
        Ok(())
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.check_alive()?;
        self.loaded
            .as_ref()
            .ok_or_else(|| PlaybackError::NoFile.into())
    }

    /// Apply `event` to every track the clip has
    fn apply(&self, event: TrackEvent) -> Result<()> {
        let shared = &self.loaded()?.shared;
        for track in [TrackType::Video, TrackType::Audio] {
            shared.transition(track, event)?;
        }
        Ok(())
    }

    fn seek(&mut self, track: TrackType, position_ms: u64) -> Result<()> {
        let shared = &self.loaded()?.shared;
        if shared.status(track).is_none() {
            return Err(PlaybackError::from(DemuxError::NoTrack(track.as_str())).into());
        }
        shared.seek(track, position_ms)?;
        Ok(())
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(loaded) = &self.loaded {
            loaded.shared.emit(event);
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Playback teardown failed: {}", e);
        }
    }
}

/// VDEC -> VO and ADEC -> AO for whichever tracks the clip has
fn build_outputs(
    stack: &mut StageStack,
    info: &MediaInfo,
) -> std::result::Result<(Option<ChannelHandle>, Option<ChannelHandle>), PipelineError> {
    let video = match &info.video {
        Some(video) => {
            let vdec = stack.create_enabled(
                ChannelKind::Vdec,
                &ChannelAttr::Vdec {
                    geometry: video.geometry,
                    codec: video.codec,
                },
            )?;
            let vo = stack.create_enabled(
                ChannelKind::Vo,
                &ChannelAttr::Vo {
                    geometry: video.geometry,
                    format: PixelFormat::Rgb888,
                },
            )?;
            stack.bind(vdec, vo)?;
            Some(vdec)
        }
        None => None,
    };

    let audio = match &info.audio {
        Some(audio) => {
            let attr = ChannelAttr::Audio {
                codec: audio.codec,
                sample_rate: audio.sample_rate,
                channels: audio.channels,
            };
            let adec = stack.create_enabled(ChannelKind::Adec, &attr)?;
            let ao = stack.create_enabled(ChannelKind::Ao, &attr)?;
            stack.bind(adec, ao)?;
            Some(adec)
        }
        None => None,
    };

    Ok((video, audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::sim::SimulatedCapability;
    use crate::capability::{CapOp, Codec, Geometry};

    const CLIP: &str = "/clips/test.mp4";

    fn fast_config() -> PlaybackConfig {
        PlaybackConfig {
            idle_wait_ms: 2,
            event_queue_depth: 16,
            sync_cap_frames: 4,
            drain_timeout_ms: 2000,
        }
    }

    fn session(clip: MemoryClip) -> (Arc<SimulatedCapability>, PlaybackSession) {
        let sim = Arc::new(SimulatedCapability::new());
        let opener = MemoryOpener::new();
        opener.register(CLIP, clip);
        let session = PlaybackSession::create(sim.clone(), Arc::new(opener), &fast_config());
        (sim, session)
    }

    fn next_event(session: &PlaybackSession) -> PlayerEvent {
        session
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("no player event")
    }

    #[test]
    fn test_controls_need_a_file() {
        let (_sim, mut session) = session(MemoryClip::new());
        assert!(matches!(
            session.play(),
            Err(PipelineError::Playback(PlaybackError::NoFile))
        ));
        assert!(matches!(
            session.set_file("/clips/missing.mp4"),
            Err(PipelineError::Playback(PlaybackError::Demux(DemuxError::Open(_))))
        ));
    }

    #[test]
    fn test_plays_to_eof_and_rewinds() {
        let clip = MemoryClip::new().with_video(Codec::H264, Geometry::new(640, 480), 100, 200);
        let (sim, mut session) = session(clip);

        session.set_file(CLIP).unwrap();
        assert_eq!(session.status(TrackType::Video), Some(TrackStatus::Pause));
        assert_eq!(session.status(TrackType::Audio), None);
        assert_eq!(session.duration().unwrap(), Duration::from_millis(200));

        session.play().unwrap();
        assert_eq!(next_event(&session), PlayerEvent::Play);
        assert_eq!(next_event(&session), PlayerEvent::Eof);
        assert_eq!(session.status(TrackType::Video), Some(TrackStatus::Pause));
        assert_eq!(session.position().unwrap(), Duration::ZERO);
        assert_eq!(sim.count_op(CapOp::Submit), 20);

        session.destroy().unwrap();
        assert_eq!(sim.live_count(), 0);
    }

    #[test]
    fn test_read_error_pauses_track() {
        let clip = MemoryClip::new()
            .with_video(Codec::H264, Geometry::new(640, 480), 100, 500)
            .fail_video_at(3);
        let (_sim, mut session) = session(clip);

        session.set_file(CLIP).unwrap();
        session.play().unwrap();
        assert_eq!(next_event(&session), PlayerEvent::Play);
        assert!(matches!(next_event(&session), PlayerEvent::Error(_)));
        assert_eq!(session.status(TrackType::Video), Some(TrackStatus::Pause));

        // Resumes past the bad packet
        session.play().unwrap();
        assert_eq!(next_event(&session), PlayerEvent::Play);
        assert_eq!(next_event(&session), PlayerEvent::Eof);
    }

    #[test]
    fn test_destroyed_session_refuses_controls() {
        let clip = MemoryClip::new().with_audio(Codec::Aac, 48_000, 2, 20, 200);
        let (sim, mut session) = session(clip);

        session.set_file(CLIP).unwrap();
        assert!(matches!(
            session.seek_video(0),
            Err(PipelineError::Playback(PlaybackError::Demux(DemuxError::NoTrack("video"))))
        ));
        session.seek_audio(100).unwrap();
        assert_eq!(session.position().unwrap(), Duration::from_millis(100));

        session.destroy().unwrap();
        assert_eq!(sim.live_count(), 0);
        assert!(matches!(
            session.play(),
            Err(PipelineError::Playback(PlaybackError::Destroyed))
        ));
        assert!(matches!(
            session.set_file(CLIP),
            Err(PipelineError::Playback(PlaybackError::Destroyed))
        ));
    }
}
