//! Медиа на стороне участника: захват (sender) и входящий поток (receiver).
//! Сам захват камеры/микрофона реализуется снаружи через [`MediaCapture`].

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    User,
    #[default]
    Environment,
}

/// Подсказки для устройства захвата
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureHints {
    pub facing: Facing,
    pub width: u32,
    pub height: u32,
    pub audio: bool,
}

impl Default for CaptureHints {
    fn default() -> Self {
        Self {
            facing: Facing::Environment,
            width: 640,
            height: 480,
            audio: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Описание медиа-трека
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Захваченный локальный поток
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;

    /// Остановить захват
    fn stop(&self);
}

/// Устройство захвата. Ошибка доступа возвращается как `Error::Capture`.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn open(&self, hints: &CaptureHints) -> Result<Box<dyn LocalMedia>>;
}

/// Входящий поток receiver
#[derive(Clone)]
pub struct RemoteMedia {
    pub track: MediaTrack,
    pub remote: Option<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(track: MediaTrack) -> Self {
        Self {
            track,
            remote: None,
        }
    }

    pub fn from_track(remote: Arc<TrackRemote>) -> Self {
        let kind = if remote.kind() == RTPCodecType::Audio {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };
        Self {
            track: MediaTrack {
                id: remote.id(),
                stream_id: remote.stream_id(),
                kind,
            },
            remote: Some(remote),
        }
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("track", &self.track)
            .field("attached", &self.remote.is_some())
            .finish()
    }
}
