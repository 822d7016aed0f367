use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::error::{InvalidArgument, MusicError, MusicResult, VoiceConnectionError};
use crate::models::{LoopMode, PlaybackState, QueueEntry, Track};
use crate::output::{AudioOutput, Completion, CompletionSignal, TrackOutcome};
use crate::resolver::TrackResolver;
use crate::session::registry::SessionRegistry;
use crate::session::{QueueSnapshot, SessionRef, SessionSettings, TeardownReason, VoiceConnection};

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Things worth telling the guild about that happen outside of a command.
#[derive(Clone, Debug)]
pub enum PlayerEvent {
    NowPlaying {
        guild_id: u64,
        text_channel_id: u64,
        track: Track,
        volume: f32,
    },
    TrackFailed {
        guild_id: u64,
        text_channel_id: u64,
        title: String,
        error: MusicError,
    },
    PlaylistFinished {
        guild_id: u64,
        text_channel_id: u64,
        added: usize,
        failed: usize,
        truncated: bool,
    },
    Disconnected {
        guild_id: u64,
        text_channel_id: u64,
        reason: TeardownReason,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlayOutcome {
    Started(Track),
    Queued {
        track: Track,
        position: usize,
    },
    Playlist {
        first: Track,
        started: bool,
        pending: usize,
        failed: usize,
    },
}

/// Drives every guild's session: queue advancement, loop handling and the
/// hand-off to the audio output.
pub struct PlaybackController {
    registry: SessionRegistry,
    resolver: Arc<TrackResolver>,
    output: Arc<dyn AudioOutput>,
    idle_timeout: Duration,
    completions: UnboundedSender<Completion>,
    events: UnboundedSender<PlayerEvent>,
}

impl PlaybackController {
    /// Builds the controller and spawns its completion listener and idle reaper.
    pub fn start(
        settings: SessionSettings,
        idle_timeout: Duration,
        resolver: Arc<TrackResolver>,
        output: Arc<dyn AudioOutput>,
    ) -> (Arc<Self>, UnboundedReceiver<PlayerEvent>) {
        let (completions, mut completion_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(PlaybackController {
            registry: SessionRegistry::new(settings),
            resolver,
            output,
            idle_timeout,
            completions,
            events,
        });

        let listener = Arc::downgrade(&controller);
        tokio::spawn(async move {
            while let Some(completion) = completion_rx.recv().await {
                let Some(controller) = listener.upgrade() else {
                    break;
                };
                tokio::spawn(async move { controller.handle_completion(completion).await });
            }
        });

        let reaper = Arc::downgrade(&controller);
        let period = (idle_timeout / 4).clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(controller) = reaper.upgrade() else {
                    break;
                };
                controller.reap_idle().await;
            }
        });

        (controller, event_rx)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Joins (or moves to) `voice_channel_id`. Returns false if already there.
    pub async fn join(&self, guild_id: u64, voice_channel_id: u64, text_channel_id: u64) -> MusicResult<bool> {
        let session_ref = self.registry.get_or_create(guild_id).await;
        let mut session = session_ref.lock().await;

        let connection = VoiceConnection {
            channel_id: voice_channel_id,
            text_channel_id,
        };

        match session.connection() {
            Some(current) if current.channel_id == voice_channel_id => {
                session.attach(connection);
                return Ok(false);
            }
            Some(_) if session.state() != PlaybackState::Idle => {
                return Err(VoiceConnectionError::AlreadyConnectedElsewhere.into());
            }
            _ => {}
        }

        if let Err(why) = self.output.connect(guild_id, voice_channel_id).await {
            warn!("Joining channel {voice_channel_id} in guild {guild_id} failed: {why}");

            if session.connection().is_none() {
                drop(session);
                self.registry.remove(guild_id).await;
            }

            return Err(why);
        }

        session.attach(connection);
        info!("Joined channel {voice_channel_id} in guild {guild_id}");

        Ok(true)
    }

    pub async fn leave(&self, guild_id: u64) -> MusicResult<()> {
        self.teardown(guild_id, TeardownReason::Command)
            .await
            .map(|_| ())
            .ok_or_else(|| VoiceConnectionError::NotConnected.into())
    }

    /// Someone moved the bot to another channel of the guild.
    pub async fn bot_moved(&self, guild_id: u64, channel_id: u64) {
        let Some(session_ref) = self.registry.get(guild_id).await else {
            return;
        };

        let mut session = session_ref.lock().await;
        let Some(connection) = session.connection() else {
            return;
        };

        if connection.channel_id != channel_id {
            info!("Bot was moved from channel {} to {channel_id} in guild {guild_id}", connection.channel_id);
            session.attach(VoiceConnection {
                channel_id,
                ..connection
            });
            session.set_alone(false);
        }
    }

    /// The bot was removed from voice by someone else.
    pub async fn bot_disconnected(&self, guild_id: u64) {
        if self.teardown(guild_id, TeardownReason::Disconnected).await.is_some() {
            info!("Bot was disconnected from voice in guild {guild_id}");
        }
    }

    async fn teardown(&self, guild_id: u64, reason: TeardownReason) -> Option<VoiceConnection> {
        let connection = self.registry.remove(guild_id).await?;

        if reason != TeardownReason::Disconnected {
            self.output.disconnect(guild_id).await;
        }

        info!("Left voice in guild {guild_id} ({reason:?})");

        if reason != TeardownReason::Command {
            self.emit(PlayerEvent::Disconnected {
                guild_id,
                text_channel_id: connection.text_channel_id,
                reason,
            });
        }

        Some(connection)
    }

    /// Resolves `input`, enqueues it and starts playback if nothing is playing.
    pub async fn play(self: &Arc<Self>, guild_id: u64, requester: u64, input: &str) -> MusicResult<PlayOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Err(InvalidArgument::MissingQuery.into());
        }

        let session_ref = self.connected_session(guild_id).await?;

        {
            let session = session_ref.lock().await;
            if !session.has_capacity() {
                return Err(MusicError::QueueFull { max: session.max_queue_size() });
            }
        }

        info!("User input is {input}");

        let resolved = self.resolver.resolve_request(input, requester).await?;

        let is_playlist = resolved.is_playlist();
        let pending = resolved.remaining.len();
        let failed = resolved.failed.len();

        let (position, was_idle) = {
            let mut session = session_ref.lock().await;

            let text_channel_id = session
                .connection()
                .filter(|_| !session.is_closed())
                .map(|connection| connection.text_channel_id)
                .ok_or(VoiceConnectionError::NotConnected)?;

            let was_idle = session.state() == PlaybackState::Idle && session.queue().is_empty();
            let position = session.enqueue(resolved.first.clone())?;

            // Tracked in the same critical section as the enqueue.
            if pending > 0 {
                let task = self.spawn_playlist(
                    &session_ref,
                    (guild_id, text_channel_id),
                    resolved.remaining,
                    requester,
                    failed,
                );
                session.track_background(task);
            }

            (position, was_idle)
        };

        self.advance(&session_ref).await;

        if !is_playlist {
            return Ok(if was_idle {
                PlayOutcome::Started(resolved.first)
            } else {
                PlayOutcome::Queued {
                    track: resolved.first,
                    position,
                }
            });
        }

        Ok(PlayOutcome::Playlist {
            first: resolved.first,
            started: was_idle,
            pending,
            failed,
        })
    }

    /// Appends the rest of a playlist in playlist order while the first track already plays.
    fn spawn_playlist(
        self: &Arc<Self>,
        session_ref: &SessionRef,
        (guild_id, text_channel_id): (u64, u64),
        queries: Vec<String>,
        requester: u64,
        failed_upfront: usize,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let session_ref = Arc::clone(session_ref);
        let span = info_span!("playlist", guild_id, items = queries.len());

        tokio::spawn(
            async move {
                let mut results = controller.resolver.resolve_in_order(queries, requester);
                let mut added = 0;
                let mut failed = failed_upfront;
                let mut truncated = false;

                while let Some((query, result)) = results.next().await {
                    let track = match result {
                        Ok(track) => track,
                        Err(why) => {
                            warn!("Skipping playlist item {query}: {why}");
                            failed += 1;
                            continue;
                        }
                    };

                    let next = {
                        let mut session = session_ref.lock().await;
                        if session.is_closed() {
                            return;
                        }

                        if let Err(why) = session.enqueue(track) {
                            warn!("Playlist truncated: {why}");
                            truncated = true;
                            break;
                        }

                        added += 1;
                        session.begin_loading()
                    };

                    if next.is_some() {
                        // Loading runs detached so cancelling this task never strands a track mid-load.
                        let controller = Arc::clone(&controller);
                        let session_ref = Arc::clone(&session_ref);
                        tokio::spawn(async move { controller.load(&session_ref, next).await });
                    }
                }

                info!("Playlist expansion done: {added} added, {failed} failed");

                controller.emit(PlayerEvent::PlaylistFinished {
                    guild_id,
                    text_channel_id,
                    added,
                    failed,
                    truncated,
                });
            }
            .instrument(span),
        )
    }

    /// `Idle -> Loading` if there is anything to play.
    async fn advance(&self, session_ref: &SessionRef) {
        let next = session_ref.lock().await.begin_loading();
        self.load(session_ref, next).await;
    }

    /// `Loading -> Playing`, or on failure drop the entry and try the next one.
    async fn load(&self, session_ref: &SessionRef, mut next: Option<(u64, QueueEntry)>) {
        while let Some((play_id, entry)) = next.take() {
            let stream = self.resolver.stream_for(&entry.track).await;

            let (guild_id, volume) = {
                let session = session_ref.lock().await;
                if !session.is_loading(play_id) {
                    debug!("Load of {} was superseded", entry.track.title);
                    return;
                }

                (session.guild_id(), session.volume())
            };

            // Not holding the session lock: opening a stream can take seconds.
            let started = match stream {
                Ok(stream) => {
                    let signal = CompletionSignal::new(guild_id, play_id, self.completions.clone());
                    self.output.start_output(guild_id, &stream, volume, signal).await
                }
                Err(why) => Err(why.into()),
            };

            let mut session = session_ref.lock().await;
            if !session.is_loading(play_id) {
                debug!("Load of {} was superseded while starting", entry.track.title);
                if let Ok(handle) = started {
                    handle.stop();
                }
                return;
            }

            match started {
                Ok(handle) => {
                    session.start_playing(play_id, handle, volume);
                    let volume = session.volume();
                    info!("Guild {guild_id} now playing {} - {}", entry.track.title, entry.track.source_url);

                    if let Some(connection) = session.connection() {
                        self.emit(PlayerEvent::NowPlaying {
                            guild_id,
                            text_channel_id: connection.text_channel_id,
                            track: entry.track,
                            volume,
                        });
                    }
                }
                Err(why) => {
                    warn!(
                        "Could not play {} (requested as {:?}) in guild {guild_id}: {why}",
                        entry.track.title, entry.track.query
                    );
                    session.loading_failed(play_id);

                    if let Some(connection) = session.connection() {
                        self.emit(PlayerEvent::TrackFailed {
                            guild_id,
                            text_channel_id: connection.text_channel_id,
                            title: entry.track.title,
                            error: why,
                        });
                    }

                    next = session.begin_loading();
                }
            }
        }
    }

    /// Consumes a completion signal from the output: advance according to the loop mode.
    pub async fn handle_completion(&self, completion: Completion) {
        let Some(session_ref) = self.registry.get(completion.guild_id).await else {
            return;
        };

        let next = {
            let mut session = session_ref.lock().await;

            if !session.accepts_completion(completion.play_id) {
                debug!("Ignoring stale completion for play {}", completion.play_id);
                return;
            }

            if completion.outcome == TrackOutcome::Errored {
                warn!("Output stream dropped in guild {}, advancing", completion.guild_id);
            }

            session.record_outcome(completion.outcome);
            session.finish_current(false);
            session.begin_loading()
        };

        self.load(&session_ref, next).await;
    }

    /// Drops the current track regardless of loop-single. Returns what was skipped.
    pub async fn skip(&self, guild_id: u64) -> MusicResult<Option<Track>> {
        let session_ref = self.connected_session(guild_id).await?;

        let (skipped, next) = {
            let mut session = session_ref.lock().await;

            if session.now_playing().is_none() && session.queue().is_empty() {
                return Err(MusicError::NothingPlaying);
            }

            let skipped = session.finish_current(true);
            (skipped, session.begin_loading())
        };

        info!("Skipped in guild {guild_id}");
        self.load(&session_ref, next).await;

        Ok(skipped.map(|entry| entry.track))
    }

    /// Clears now-playing and the queue. Returns how many queued entries were dropped.
    pub async fn stop(&self, guild_id: u64) -> MusicResult<usize> {
        let session_ref = self.connected_session(guild_id).await?;
        let cleared = session_ref.lock().await.stop();

        info!("Stopped playback in guild {guild_id}, {cleared} queued tracks dropped");

        Ok(cleared)
    }

    pub async fn pause(&self, guild_id: u64) -> MusicResult<()> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.pause()
    }

    pub async fn resume(&self, guild_id: u64) -> MusicResult<()> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.resume()
    }

    /// Sets the volume from a 0-100 percentage.
    pub async fn set_volume(&self, guild_id: u64, percent: i64) -> MusicResult<f32> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.set_volume_percent(percent)
    }

    pub async fn toggle_loop(&self, guild_id: u64) -> MusicResult<LoopMode> {
        let session_ref = self.connected_session(guild_id).await?;
        let mode = session_ref.lock().await.toggle_loop();
        Ok(mode)
    }

    pub async fn toggle_loop_queue(&self, guild_id: u64) -> MusicResult<LoopMode> {
        let session_ref = self.connected_session(guild_id).await?;
        let mode = session_ref.lock().await.toggle_loop_queue();
        Ok(mode)
    }

    pub async fn shuffle(&self, guild_id: u64) -> MusicResult<usize> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.shuffle()
    }

    /// Removes the 1-based `position` from the queue.
    pub async fn remove(&self, guild_id: u64, position: i64) -> MusicResult<Track> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.remove(position).map(|entry| entry.track)
    }

    /// Empties the queue and cancels pending playlist appends; now-playing is kept.
    pub async fn clear(&self, guild_id: u64) -> MusicResult<usize> {
        let session_ref = self.connected_session(guild_id).await?;
        let mut session = session_ref.lock().await;
        session.cancel_background();
        Ok(session.clear())
    }

    pub async fn queue(&self, guild_id: u64) -> Option<QueueSnapshot> {
        let session_ref = self.registry.get(guild_id).await?;
        let snapshot = session_ref.lock().await.snapshot();
        Some(snapshot)
    }

    pub async fn voice_channel(&self, guild_id: u64) -> Option<u64> {
        let session_ref = self.registry.get(guild_id).await?;
        let connection = session_ref.lock().await.connection();
        connection.map(|connection| connection.channel_id)
    }

    /// Starts or stops the alone-timer of a guild.
    pub async fn set_alone(&self, guild_id: u64, alone: bool) {
        if let Some(session_ref) = self.registry.get(guild_id).await {
            session_ref.lock().await.set_alone(alone);
        }
    }

    /// Tears down every session that sat idle or alone for longer than the idle timeout.
    pub async fn reap_idle(&self) {
        let now = Instant::now();

        for guild_id in self.registry.guild_ids().await {
            let Some(session_ref) = self.registry.get(guild_id).await else {
                continue;
            };

            let due = session_ref.lock().await.teardown_due(now, self.idle_timeout);

            if let Some(reason) = due {
                info!("Guild {guild_id} reached the idle timeout ({reason:?})");
                self.teardown(guild_id, reason).await;
            }
        }
    }

    async fn connected_session(&self, guild_id: u64) -> MusicResult<SessionRef> {
        let session_ref = self
            .registry
            .get(guild_id)
            .await
            .ok_or(VoiceConnectionError::NotConnected)?;

        let connected = session_ref.lock().await.connection().is_some();
        if !connected {
            return Err(VoiceConnectionError::NotConnected.into());
        }

        Ok(session_ref)
    }

    fn emit(&self, event: PlayerEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for player events");
        }
    }

    #[cfg(test)]
    pub(crate) async fn settle(&self, guild_id: u64) {
        let Some(session_ref) = self.registry.get(guild_id).await else {
            return;
        };

        let tasks = session_ref.lock().await.take_background();
        for task in tasks {
            let _ = task.await;
        }
    }
}
