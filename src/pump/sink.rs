//! Frame sinks fed by stream pumps
//!
//! A sink must not block: pumps call it between fetch and release while the
//! unit still pins a hardware buffer.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tracing::debug;

use super::StreamKind;
use crate::capability::Unit;
use crate::error::SinkError;

/// Consumer of fetched units (storage, RTSP/RTMP, USB gadget, display)
pub trait FrameSink: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, stream: StreamKind, unit: &Unit) -> Result<(), SinkError>;
}

/// What a [`ChannelSink`] hands downstream; the payload is shared, not copied
#[derive(Debug, Clone)]
pub struct SinkFrame {
    pub stream: StreamKind,
    pub data: Bytes,
    pub pts: Duration,
    pub sequence: u64,
    pub keyframe: bool,
}

/// Forwards units into a bounded queue, dropping when the consumer lags
pub struct ChannelSink {
    name: String,
    tx: Sender<SinkFrame>,
}

impl ChannelSink {
    pub fn bounded(name: impl Into<String>, depth: usize) -> (Self, Receiver<SinkFrame>) {
        let (tx, rx) = flume::bounded(depth);
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

impl FrameSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, stream: StreamKind, unit: &Unit) -> Result<(), SinkError> {
        let frame = SinkFrame {
            stream,
            data: unit.data.clone(),
            pts: unit.meta.pts,
            sequence: unit.meta.sequence,
            keyframe: unit.is_keyframe(),
        };
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full(self.name.clone()),
            TrySendError::Disconnected(_) => SinkError::Disconnected(self.name.clone()),
        })
    }
}

/// Storage writer
///
/// Streams append to `<dir>/<stream>.bin`, starting at the first keyframe.
/// Photos go to one file each, `<dir>/photo_<sequence>.jpg`.
pub struct FileSink {
    dir: PathBuf,
    streams: Mutex<HashMap<StreamKind, File>>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn stream_path(&self, stream: StreamKind) -> PathBuf {
        self.dir.join(format!("{}.bin", stream.as_str()))
    }

    pub fn photo_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("photo_{sequence:04}.jpg"))
    }
}

impl FrameSink for FileSink {
    fn name(&self) -> &str {
        "storage"
    }

    fn accept(&self, stream: StreamKind, unit: &Unit) -> Result<(), SinkError> {
        if stream == StreamKind::Photo {
            let path = self.photo_path(unit.meta.sequence);
            fs::write(&path, &unit.data)?;
            debug!("Saved {}", path.display());
            return Ok(());
        }

        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if !streams.contains_key(&stream) {
            // Nothing decodable before the first keyframe
            if !unit.is_keyframe() {
                return Ok(());
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.stream_path(stream))?;
            streams.insert(stream, file);
        }
        if let Some(file) = streams.get_mut(&stream) {
            file.write_all(&unit.data)?;
        }
        Ok(())
    }
}
