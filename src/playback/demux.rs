//! Demuxer interface and an in-memory clip source

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

use crate::capability::{Codec, Geometry, Packet};
use crate::error::DemuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Video,
    Audio,
}

impl TrackType {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub codec: Codec,
    pub geometry: Geometry,
    pub fps: u32,
}

impl VideoInfo {
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / u64::from(self.fps.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u32,
    /// Duration covered by one packet
    pub packet_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub enum DemuxRead {
    Packet(Packet),
    Eof,
}

/// Container reader; one instance is shared by both track loops behind a
/// mutex
pub trait Demuxer: Send {
    fn info(&self) -> &MediaInfo;

    fn read(&mut self, track: TrackType) -> Result<DemuxRead, DemuxError>;

    fn seek(&mut self, track: TrackType, position_ms: u64) -> Result<(), DemuxError>;
}

pub trait DemuxerOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, DemuxError>;
}

/// A clip held in memory: fixed packet lists per track
#[derive(Debug, Clone, Default)]
pub struct MemoryClip {
    info: MediaInfo,
    video: Vec<Packet>,
    audio: Vec<Packet>,
    fail_video_at: Option<usize>,
}

impl MemoryClip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, codec: Codec, geometry: Geometry, fps: u32, duration_ms: u64) -> Self {
        let info = VideoInfo {
            codec,
            geometry,
            fps,
        };
        let step = info.frame_interval_ms().max(1);
        let gop = u64::from(fps.max(1));
        self.video = (0..duration_ms / step)
            .map(|i| Packet {
                data: Bytes::from(vec![0u8; 256]),
                pts_ms: i * step,
                keyframe: i % gop == 0,
            })
            .collect();
        self.info.video = Some(info);
        self.info.duration_ms = self.info.duration_ms.max(duration_ms);
        self
    }

    pub fn with_audio(
        mut self,
        codec: Codec,
        sample_rate: u32,
        channels: u32,
        packet_ms: u64,
        duration_ms: u64,
    ) -> Self {
        let step = packet_ms.max(1);
        self.audio = (0..duration_ms / step)
            .map(|i| Packet {
                data: Bytes::from(vec![0u8; 64]),
                pts_ms: i * step,
                keyframe: true,
            })
            .collect();
        self.info.audio = Some(AudioInfo {
            codec,
            sample_rate,
            channels,
            packet_ms: step,
        });
        self.info.duration_ms = self.info.duration_ms.max(duration_ms);
        self
    }

    /// Make the video read of packet `index` fail
    pub fn fail_video_at(mut self, index: usize) -> Self {
        self.fail_video_at = Some(index);
        self
    }

    pub fn into_demuxer(self) -> MemoryDemuxer {
        MemoryDemuxer {
            clip: self,
            video_pos: 0,
            audio_pos: 0,
        }
    }
}

pub struct MemoryDemuxer {
    clip: MemoryClip,
    video_pos: usize,
    audio_pos: usize,
}

impl Demuxer for MemoryDemuxer {
    fn info(&self) -> &MediaInfo {
        &self.clip.info
    }

    fn read(&mut self, track: TrackType) -> Result<DemuxRead, DemuxError> {
        let (packets, pos) = match track {
            TrackType::Video => (&self.clip.video, &mut self.video_pos),
            TrackType::Audio => (&self.clip.audio, &mut self.audio_pos),
        };
        if track == TrackType::Video && self.clip.fail_video_at == Some(*pos) {
            // Fails once; the next read moves past the bad packet
            *pos += 1;
            return Err(DemuxError::Read(format!("corrupt video packet {}", *pos - 1)));
        }
        match packets.get(*pos) {
            Some(packet) => {
                *pos += 1;
                Ok(DemuxRead::Packet(packet.clone()))
            }
            None => Ok(DemuxRead::Eof),
        }
    }

    fn seek(&mut self, track: TrackType, position_ms: u64) -> Result<(), DemuxError> {
        let (packets, pos) = match track {
            TrackType::Video => (&self.clip.video, &mut self.video_pos),
            TrackType::Audio => (&self.clip.audio, &mut self.audio_pos),
        };
        if position_ms > self.clip.info.duration_ms {
            return Err(DemuxError::Seek(position_ms));
        }
        *pos = packets.partition_point(|p| p.pts_ms < position_ms);
        Ok(())
    }
}

/// Serves registered [`MemoryClip`]s by path
#[derive(Default)]
pub struct MemoryOpener {
    clips: Mutex<HashMap<PathBuf, MemoryClip>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<PathBuf>, clip: MemoryClip) {
        self.clips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), clip);
    }
}

impl DemuxerOpener for MemoryOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, DemuxError> {
        let clips = self.clips.lock().unwrap_or_else(PoisonError::into_inner);
        let clip = clips
            .get(path)
            .cloned()
            .ok_or_else(|| DemuxError::Open(path.display().to_string()))?;
        if clip.info.video.is_none() && clip.info.audio.is_none() {
            return Err(DemuxError::NoTrack("audio or video"));
        }
        Ok(Box::new(clip.into_demuxer()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip() -> MemoryClip {
        MemoryClip::new()
            .with_video(Codec::H264, Geometry::new(640, 480), 10, 500)
            .with_audio(Codec::Aac, 48_000, 2, 20, 500)
    }

    #[test]
    fn test_tracks_read_independently() {
        let mut demux = clip().into_demuxer();
        for expected in [0, 100, 200] {
            match demux.read(TrackType::Video).unwrap() {
                DemuxRead::Packet(p) => assert_eq!(p.pts_ms, expected),
                DemuxRead::Eof => panic!("early eof"),
            }
        }
        match demux.read(TrackType::Audio).unwrap() {
            DemuxRead::Packet(p) => assert_eq!(p.pts_ms, 0),
            DemuxRead::Eof => panic!("early eof"),
        }
    }

    #[test]
    fn test_eof_then_seek_back() {
        let mut demux = clip().into_demuxer();
        for _ in 0..5 {
            assert!(matches!(demux.read(TrackType::Video), Ok(DemuxRead::Packet(_))));
        }
        assert!(matches!(demux.read(TrackType::Video), Ok(DemuxRead::Eof)));

        demux.seek(TrackType::Video, 0).unwrap();
        assert!(matches!(demux.read(TrackType::Video), Ok(DemuxRead::Packet(p)) if p.pts_ms == 0));
        assert!(matches!(
            demux.seek(TrackType::Video, 10_000),
            Err(DemuxError::Seek(10_000))
        ));
    }

    #[test]
    fn test_opener_unknown_path() {
        let opener = MemoryOpener::new();
        opener.register("/clips/a.mp4", clip());
        assert!(opener.open(Path::new("/clips/a.mp4")).is_ok());
        assert!(matches!(
            opener.open(Path::new("/clips/b.mp4")),
            Err(DemuxError::Open(_))
        ));
    }
}
