use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{children_to_reader, Codec, Container, Input, Metadata};
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::{MusicError, MusicResult, VoiceConnectionError};
use crate::models::StreamDescriptor;

const FFMPEG_BEFORE_OPTIONS: [&str; 6] = [
    "-reconnect",
    "1",
    "-reconnect_streamed",
    "1",
    "-reconnect_delay_max",
    "5",
];

// Always decoded to 48kHz stereo float PCM.
const FFMPEG_OPTIONS: [&str; 10] = [
    "-vn", "-f", "s16le", "-ac", "2", "-ar", "48000", "-acodec", "pcm_f32le", "-",
];

/// A track that stops this far before its advertised duration ended abnormally.
const EARLY_END_TOLERANCE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    Finished,
    /// The transport dropped mid-track.
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub guild_id: u64,
    pub play_id: u64,
    pub outcome: TrackOutcome,
}

/// Handed to the output with every started track; fired exactly once when it ends.
#[derive(Clone)]
pub struct CompletionSignal {
    guild_id: u64,
    play_id: u64,
    sender: UnboundedSender<Completion>,
}

impl CompletionSignal {
    pub(crate) fn new(guild_id: u64, play_id: u64, sender: UnboundedSender<Completion>) -> Self {
        CompletionSignal {
            guild_id,
            play_id,
            sender,
        }
    }

    pub fn completion(&self, outcome: TrackOutcome) -> Completion {
        Completion {
            guild_id: self.guild_id,
            play_id: self.play_id,
            outcome,
        }
    }

    pub fn fire(&self, outcome: TrackOutcome) {
        if self.sender.send(self.completion(outcome)).is_err() {
            debug!("Player is gone, dropping completion for guild {}", self.guild_id);
        }
    }
}

/// Control over a track that is currently streaming.
pub trait OutputHandle: Send + Sync {
    fn set_volume(&self, volume: f32) -> MusicResult<()>;

    fn pause(&self) -> MusicResult<()>;

    fn resume(&self) -> MusicResult<()>;

    fn stop(&self);
}

/// The voice transport: joins channels and turns stream URLs into audio.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()>;

    async fn disconnect(&self, guild_id: u64);

    async fn start_output(
        &self,
        guild_id: u64,
        stream: &StreamDescriptor,
        volume: f32,
        signal: CompletionSignal,
    ) -> MusicResult<Box<dyn OutputHandle>>;
}

pub struct SongbirdOutput {
    manager: Arc<Songbird>,
}

impl SongbirdOutput {
    pub fn new(manager: Arc<Songbird>) -> Self {
        SongbirdOutput { manager }
    }
}

#[async_trait]
impl AudioOutput for SongbirdOutput {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()> {
        let (handler_lock, result) = self.manager.join(GuildId(guild_id), ChannelId(channel_id)).await;

        result.map_err(|why| VoiceConnectionError::Join(why.to_string()))?;

        let mut handler = handler_lock.lock().await;

        if handler.is_deaf() {
            debug!("Already deafened in guild {guild_id}");
        } else if let Err(e) = handler.deafen(true).await {
            info!("Deafen failed due to {e:?}");
        }

        Ok(())
    }

    async fn disconnect(&self, guild_id: u64) {
        let guild_id = GuildId(guild_id);

        if self.manager.get(guild_id).is_some() {
            if let Err(e) = self.manager.remove(guild_id).await {
                warn!("Leaving voice in guild {} failed: {e:?}", guild_id.0);
            }
        }
    }

    async fn start_output(
        &self,
        guild_id: u64,
        stream: &StreamDescriptor,
        volume: f32,
        signal: CompletionSignal,
    ) -> MusicResult<Box<dyn OutputHandle>> {
        let handler_lock = self
            .manager
            .get(GuildId(guild_id))
            .ok_or(VoiceConnectionError::NotConnected)?;

        let source = stereo_source(stream)?;

        let mut handler = handler_lock.lock().await;

        handler.stop(); // Just in case something was playing before
        let track_handle = handler.play_source(source);

        track_handle
            .set_volume(volume)
            .map_err(|why| MusicError::OutputStream(why.to_string()))?;

        track_handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    signal,
                    expected: stream.duration_secs.map(Duration::from_secs),
                },
            )
            .map_err(|why| MusicError::OutputStream(why.to_string()))?;

        Ok(Box::new(SongbirdTrack(track_handle)))
    }
}

/// Spawns ffmpeg for `stream`. The decoder always emits stereo, so the input is
/// flagged stereo up front instead of trusting an ffprobe of the remote URL.
fn stereo_source(stream: &StreamDescriptor) -> MusicResult<Input> {
    let ffmpeg = Command::new("ffmpeg")
        .args(FFMPEG_BEFORE_OPTIONS)
        .arg("-i")
        .arg(&stream.stream_url)
        .args(FFMPEG_OPTIONS)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|why| MusicError::OutputStream(format!("ffmpeg did not start: {why}")))?;

    Ok(Input::new(
        true,
        children_to_reader::<f32>(vec![ffmpeg]),
        Codec::FloatPcm,
        Container::Raw,
        Some(stream_metadata(stream)),
    ))
}

fn stream_metadata(stream: &StreamDescriptor) -> Metadata {
    Metadata {
        title: Some(stream.title.clone()),
        source_url: Some(stream.page_url.clone()),
        duration: stream.duration_secs.map(Duration::from_secs),
        channels: Some(2),
        sample_rate: Some(48_000),
        ..Default::default()
    }
}

struct SongbirdTrack(TrackHandle);

impl OutputHandle for SongbirdTrack {
    fn set_volume(&self, volume: f32) -> MusicResult<()> {
        self.0
            .set_volume(volume)
            .map_err(|why| MusicError::OutputStream(why.to_string()))
    }

    fn pause(&self) -> MusicResult<()> {
        self.0.pause().map_err(|why| MusicError::OutputStream(why.to_string()))
    }

    fn resume(&self) -> MusicResult<()> {
        self.0.play().map_err(|why| MusicError::OutputStream(why.to_string()))
    }

    fn stop(&self) {
        if let Err(why) = self.0.stop() {
            debug!("Stopping track failed: {why:?}");
        }
    }
}

struct TrackEndNotifier {
    signal: CompletionSignal,
    expected: Option<Duration>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered");

        let ended_early = match (ctx, self.expected) {
            (EventContext::Track(tracks), Some(expected)) => tracks
                .iter()
                .any(|(state, _)| state.position + EARLY_END_TOLERANCE < expected),
            _ => false,
        };

        if ended_early {
            warn!("Track ended before its advertised duration, treating the stream as dropped");
            self.signal.fire(TrackOutcome::Errored);
        } else {
            self.signal.fire(TrackOutcome::Finished);
        }

        None
    }
}
