use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const UNKNOWN_TRACK_TITLE: &str = "Unknown track";

/// Directly playable representation of a track as produced by the search/URL collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_url: String,
    pub page_url: String,
    pub title: String,
    pub duration_secs: Option<u64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    /// What the user typed, or the playlist item query it was expanded from.
    pub query: String,
    pub source_url: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub requester: u64,
}

impl Track {
    pub fn from_descriptor(query: &str, descriptor: StreamDescriptor, requester: u64) -> Self {
        Track {
            query: query.to_string(),
            source_url: descriptor.page_url,
            title: descriptor.title,
            duration: descriptor.duration_secs.map(Duration::from_secs),
            thumbnail: descriptor.thumbnail,
            uploader: descriptor.uploader,
            requester,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    /// Monotonic per-session sequence number, assigned on enqueue.
    pub id: u64,
    pub track: Track,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    #[default]
    Off,
    Single,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => write!(f, "off"),
            LoopMode::Single => write!(f, "track"),
            LoopMode::Queue => write!(f, "queue"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused)
    }
}
