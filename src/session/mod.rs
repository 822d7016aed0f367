use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{InvalidArgument, MusicError, MusicResult};
use crate::models::{LoopMode, PlaybackState, QueueEntry, Track};
use crate::output::{OutputHandle, TrackOutcome};

pub mod registry;

pub type SessionRef = Arc<Mutex<GuildSession>>;

/// Back-to-back stream failures of one looped entry before loop-single is given up.
const MAX_LOOPED_FAILURES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionSettings {
    pub default_volume: f32,
    pub max_queue_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoiceConnection {
    pub channel_id: u64,
    /// Where announcements for this session go.
    pub text_channel_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownReason {
    Command,
    Idle,
    Alone,
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct QueueSnapshot {
    pub now_playing: Option<Track>,
    pub state: PlaybackState,
    pub upcoming: Vec<Track>,
    pub loop_mode: LoopMode,
    pub volume: f32,
}

/// Per-guild playback state. Only the registry constructs these.
pub struct GuildSession {
    guild_id: u64,
    queue: VecDeque<QueueEntry>,
    now_playing: Option<QueueEntry>,
    state: PlaybackState,
    loop_mode: LoopMode,
    volume: f32,
    max_queue_size: usize,
    connection: Option<VoiceConnection>,
    output: Option<Box<dyn OutputHandle>>,
    /// Bumped whenever the current track changes; stale completions and loads carry an old value.
    play_id: u64,
    next_entry_id: u64,
    idle_since: Option<Instant>,
    alone_since: Option<Instant>,
    background: Vec<JoinHandle<()>>,
    /// Entry id and count of consecutive errored completions.
    failures: Option<(u64, u32)>,
    closed: bool,
}

impl GuildSession {
    fn new(guild_id: u64, settings: SessionSettings) -> Self {
        GuildSession {
            guild_id,
            queue: VecDeque::new(),
            now_playing: None,
            state: PlaybackState::Idle,
            loop_mode: LoopMode::Off,
            volume: settings.default_volume,
            max_queue_size: settings.max_queue_size,
            connection: None,
            output: None,
            play_id: 0,
            next_entry_id: 0,
            idle_since: Some(Instant::now()),
            alone_since: None,
            background: Vec::new(),
            failures: None,
            closed: false,
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn queue(&self) -> &VecDeque<QueueEntry> {
        &self.queue
    }

    pub fn now_playing(&self) -> Option<&QueueEntry> {
        self.now_playing.as_ref()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn connection(&self) -> Option<VoiceConnection> {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            now_playing: self.now_playing.as_ref().map(|entry| entry.track.clone()),
            state: self.state,
            upcoming: self.queue.iter().map(|entry| entry.track.clone()).collect(),
            loop_mode: self.loop_mode,
            volume: self.volume,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.queue.len() < self.max_queue_size
    }

    /// Appends a track and returns its 1-based position.
    pub fn enqueue(&mut self, track: Track) -> MusicResult<usize> {
        if !self.has_capacity() {
            return Err(MusicError::QueueFull { max: self.max_queue_size });
        }

        self.next_entry_id += 1;
        self.queue.push_back(QueueEntry {
            id: self.next_entry_id,
            track,
        });

        Ok(self.queue.len())
    }

    /// Removes the entry at a 1-based `position`.
    pub fn remove(&mut self, position: i64) -> MusicResult<QueueEntry> {
        let len = self.queue.len();

        let index = usize::try_from(position)
            .ok()
            .filter(|position| (1..=len).contains(position))
            .map(|position| position - 1)
            .ok_or(InvalidArgument::Position { position, len })?;

        self.queue
            .remove(index)
            .ok_or_else(|| InvalidArgument::Position { position, len }.into())
    }

    pub fn shuffle(&mut self) -> MusicResult<usize> {
        self.shuffle_with(&mut thread_rng())
    }

    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> MusicResult<usize> {
        if self.queue.len() < 2 {
            return Err(InvalidArgument::NotEnoughTracks.into());
        }

        self.queue.make_contiguous().shuffle(rng);

        Ok(self.queue.len())
    }

    /// Empties the queue, leaving now-playing alone. Returns how many entries went away.
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    pub fn set_volume_percent(&mut self, percent: i64) -> MusicResult<f32> {
        if !(0..=100).contains(&percent) {
            return Err(InvalidArgument::Volume(percent).into());
        }

        let volume = percent as f32 / 100.0;

        if let Some(output) = &self.output {
            output.set_volume(volume)?;
        }

        self.volume = volume;

        Ok(volume)
    }

    /// Cycles off <-> single-track. Leaves whole-queue mode if it was on.
    pub fn toggle_loop(&mut self) -> LoopMode {
        self.loop_mode = match self.loop_mode {
            LoopMode::Single => LoopMode::Off,
            _ => LoopMode::Single,
        };
        self.loop_mode
    }

    /// Cycles off <-> whole-queue. Leaves single-track mode if it was on.
    pub fn toggle_loop_queue(&mut self) -> LoopMode {
        self.loop_mode = match self.loop_mode {
            LoopMode::Queue => LoopMode::Off,
            _ => LoopMode::Queue,
        };
        self.loop_mode
    }

    pub(crate) fn attach(&mut self, connection: VoiceConnection) {
        self.connection = Some(connection);
        if self.state == PlaybackState::Idle {
            self.idle_since = Some(Instant::now());
        }
    }

    pub(crate) fn is_loading(&self, play_id: u64) -> bool {
        !self.closed && self.state == PlaybackState::Loading && self.play_id == play_id
    }

    /// `Idle -> Loading`: moves the head of the queue into now-playing.
    pub(crate) fn begin_loading(&mut self) -> Option<(u64, QueueEntry)> {
        if self.closed || self.connection.is_none() || self.state != PlaybackState::Idle {
            return None;
        }

        let entry = self.queue.pop_front()?;

        self.play_id += 1;
        self.state = PlaybackState::Loading;
        self.now_playing = Some(entry.clone());

        debug!(
            "Guild {} loading {} (entry {}, play {})",
            self.guild_id, entry.track.title, entry.id, self.play_id
        );

        Some((self.play_id, entry))
    }

    /// `Loading -> Playing`. `opened_at` is the volume the output was started with.
    pub(crate) fn start_playing(&mut self, play_id: u64, output: Box<dyn OutputHandle>, opened_at: f32) -> bool {
        if !self.is_loading(play_id) {
            output.stop();
            return false;
        }

        if opened_at != self.volume {
            if let Err(why) = output.set_volume(self.volume) {
                warn!("Guild {} could not apply volume {}: {why}", self.guild_id, self.volume);
            }
        }

        self.output = Some(output);
        self.state = PlaybackState::Playing;
        self.idle_since = None;

        true
    }

    /// `Loading -> Idle` after a failed load; the entry is dropped.
    pub(crate) fn loading_failed(&mut self, play_id: u64) -> Option<QueueEntry> {
        if !self.is_loading(play_id) {
            return None;
        }

        self.state = PlaybackState::Idle;
        self.idle_since = Some(Instant::now());
        self.now_playing.take()
    }

    fn halt(&mut self) -> Option<QueueEntry> {
        if let Some(output) = self.output.take() {
            output.stop();
        }

        self.play_id += 1;
        self.state = PlaybackState::Idle;
        self.idle_since = Some(Instant::now());

        self.now_playing.take()
    }

    /// Ends the current track and applies the loop mode. `skip` overrides loop-single.
    pub(crate) fn finish_current(&mut self, skip: bool) -> Option<QueueEntry> {
        let finished = self.halt()?;

        match self.loop_mode {
            LoopMode::Single if !skip => self.queue.push_front(finished.clone()),
            LoopMode::Queue => self.queue.push_back(finished.clone()),
            _ => {}
        }

        Some(finished)
    }

    /// Notes how the current track ended. Returns true when loop-single was dropped
    /// because the same entry kept failing.
    pub(crate) fn record_outcome(&mut self, outcome: TrackOutcome) -> bool {
        let Some(entry_id) = self.now_playing.as_ref().map(|entry| entry.id) else {
            return false;
        };

        if outcome == TrackOutcome::Finished {
            self.failures = None;
            return false;
        }

        let count = match self.failures {
            Some((id, count)) if id == entry_id => count + 1,
            _ => 1,
        };
        self.failures = Some((entry_id, count));

        if self.loop_mode == LoopMode::Single && count >= MAX_LOOPED_FAILURES {
            warn!("Guild {} entry {entry_id} failed {count} times in a row, leaving loop mode", self.guild_id);
            self.loop_mode = LoopMode::Off;
            self.failures = None;
            return true;
        }

        false
    }

    /// Accepts a completion signal if it belongs to the track that is playing right now.
    pub(crate) fn accepts_completion(&self, play_id: u64) -> bool {
        !self.closed && self.play_id == play_id && (self.state.is_active() || self.state == PlaybackState::Loading)
    }

    pub(crate) fn pause(&mut self) -> MusicResult<()> {
        match (self.state, &self.output) {
            (PlaybackState::Playing, Some(output)) => {
                output.pause()?;
                self.state = PlaybackState::Paused;
                Ok(())
            }
            _ => Err(MusicError::NothingPlaying),
        }
    }

    pub(crate) fn resume(&mut self) -> MusicResult<()> {
        match (self.state, &self.output) {
            (PlaybackState::Paused, Some(output)) => {
                output.resume()?;
                self.state = PlaybackState::Playing;
                Ok(())
            }
            _ => Err(MusicError::NotPaused),
        }
    }

    /// Clears now-playing and the queue. Loop-single is switched off, loop-queue is kept.
    pub(crate) fn stop(&mut self) -> usize {
        self.cancel_background();
        self.halt();

        if self.loop_mode == LoopMode::Single {
            self.loop_mode = LoopMode::Off;
        }

        self.clear()
    }

    pub(crate) fn track_background(&mut self, task: JoinHandle<()>) {
        self.background.retain(|task| !task.is_finished());
        self.background.push(task);
    }

    pub(crate) fn cancel_background(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn take_background(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.background)
    }

    /// Releases everything the session holds. Returns the connection it had, if any.
    fn close(&mut self) -> Option<VoiceConnection> {
        self.cancel_background();
        self.halt();
        self.queue.clear();
        self.closed = true;

        info!("Guild {} session closed", self.guild_id);

        self.connection.take()
    }

    pub(crate) fn set_alone(&mut self, alone: bool) {
        match (alone, self.alone_since) {
            (true, None) => self.alone_since = Some(Instant::now()),
            (false, Some(_)) => self.alone_since = None,
            _ => {}
        }
    }

    pub fn teardown_due(&self, now: Instant, timeout: Duration) -> Option<TeardownReason> {
        if self.closed || self.connection.is_none() {
            return None;
        }

        let expired = |since: Option<Instant>| since.is_some_and(|since| now.duration_since(since) >= timeout);

        if expired(self.alone_since) {
            Some(TeardownReason::Alone)
        } else if self.state == PlaybackState::Idle && expired(self.idle_since) {
            Some(TeardownReason::Idle)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::testing::{track, RecordingHandle};

    fn session(max_queue_size: usize) -> GuildSession {
        let mut session = GuildSession::new(
            1,
            SessionSettings {
                default_volume: 0.5,
                max_queue_size,
            },
        );
        session.attach(VoiceConnection { channel_id: 10, text_channel_id: 20 });
        session
    }

    fn titles(session: &GuildSession) -> Vec<String> {
        session.queue().iter().map(|entry| entry.track.title.clone()).collect()
    }

    fn play_next(session: &mut GuildSession) -> u64 {
        let (play_id, _) = session.begin_loading().expect("queue has a head");
        assert!(session.start_playing(play_id, Box::new(RecordingHandle::default()), 0.5));
        play_id
    }

    #[test]
    fn enqueue_up_to_capacity_then_rejects() {
        let mut session = session(5);

        for i in 0..5 {
            assert_eq!(session.enqueue(track(&format!("t{i}"))).unwrap(), i + 1);
        }
        assert_eq!(session.queue().len(), 5);

        let before = titles(&session);
        assert_eq!(session.enqueue(track("overflow")).unwrap_err(), MusicError::QueueFull { max: 5 });
        assert_eq!(titles(&session), before);
    }

    #[test]
    fn remove_uses_one_based_positions() {
        let mut session = session(10);
        for name in ["a", "b", "c"] {
            session.enqueue(track(name)).unwrap();
        }

        assert_eq!(session.remove(1).unwrap().track.title, "a");
        assert_eq!(session.remove(2).unwrap().track.title, "c");
        assert_eq!(titles(&session), ["b"]);

        assert_eq!(
            session.remove(0).unwrap_err(),
            MusicError::InvalidArgument(InvalidArgument::Position { position: 0, len: 1 })
        );
        assert!(session.remove(2).is_err());
        assert!(session.remove(-3).is_err());
        assert_eq!(titles(&session), ["b"]);
    }

    #[test]
    fn remove_on_empty_queue_fails_without_mutation() {
        let mut session = session(10);

        assert_eq!(
            session.remove(1).unwrap_err(),
            MusicError::InvalidArgument(InvalidArgument::Position { position: 1, len: 0 })
        );
        assert!(session.queue().is_empty());
        assert_eq!(session.state(), PlaybackState::Idle);
    }

    #[test]
    fn shuffle_preserves_entries() {
        let mut session = session(50);
        for i in 0..20 {
            session.enqueue(track(&format!("t{i}"))).unwrap();
        }

        let mut before = titles(&session);
        session.shuffle().unwrap();
        let mut after = titles(&session);

        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn shuffle_is_roughly_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        let trials = 6000;

        for _ in 0..trials {
            let mut session = session(10);
            for name in ["a", "b", "c"] {
                session.enqueue(track(name)).unwrap();
            }
            session.shuffle_with(&mut rng).unwrap();
            *counts.entry(titles(&session)).or_default() += 1;
        }

        assert_eq!(counts.len(), 6);
        for count in counts.values() {
            assert!((800..=1200).contains(count), "skewed permutation count {count}");
        }
    }

    #[test]
    fn shuffle_needs_two_entries() {
        let mut session = session(10);
        session.enqueue(track("solo")).unwrap();

        assert_eq!(
            session.shuffle().unwrap_err(),
            MusicError::from(InvalidArgument::NotEnoughTracks)
        );
    }

    #[test]
    fn clear_keeps_now_playing() {
        let mut session = session(10);
        for name in ["a", "b", "c"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);

        assert_eq!(session.clear(), 2);
        assert_eq!(session.now_playing().unwrap().track.title, "a");
        assert_eq!(session.state(), PlaybackState::Playing);
    }

    #[test]
    fn loop_single_requeues_the_finished_track_at_the_front() {
        let mut session = session(10);
        for name in ["a", "b"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);
        session.toggle_loop();
        let len_before = session.queue().len();

        session.finish_current(false);
        play_next(&mut session);

        assert_eq!(session.now_playing().unwrap().track.title, "a");
        assert_eq!(session.queue().len(), len_before);
    }

    #[test]
    fn loop_single_gives_up_on_a_track_that_keeps_failing() {
        let mut session = session(10);
        for name in ["a", "b"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);
        session.toggle_loop();

        for _ in 0..2 {
            assert!(!session.record_outcome(TrackOutcome::Errored));
            session.finish_current(false);
            play_next(&mut session);
            assert_eq!(session.now_playing().unwrap().track.title, "a");
        }

        assert!(session.record_outcome(TrackOutcome::Errored));
        assert_eq!(session.loop_mode(), LoopMode::Off);

        session.finish_current(false);
        play_next(&mut session);
        assert_eq!(session.now_playing().unwrap().track.title, "b");
    }

    #[test]
    fn a_clean_finish_resets_the_failure_count() {
        let mut session = session(10);
        session.enqueue(track("a")).unwrap();
        play_next(&mut session);
        session.toggle_loop();

        for outcome in [TrackOutcome::Errored, TrackOutcome::Errored, TrackOutcome::Finished, TrackOutcome::Errored] {
            assert!(!session.record_outcome(outcome));
            session.finish_current(false);
            play_next(&mut session);
        }

        assert_eq!(session.loop_mode(), LoopMode::Single);
    }

    #[test]
    fn a_completion_during_loading_is_accepted() {
        let mut session = session(10);
        session.enqueue(track("a")).unwrap();
        let (play_id, _) = session.begin_loading().unwrap();

        assert!(session.accepts_completion(play_id));
        session.finish_current(false);

        let handle = RecordingHandle::default();
        assert!(!session.start_playing(play_id, Box::new(handle.clone()), 0.5));
        assert!(handle.stopped());
        assert_eq!(session.state(), PlaybackState::Idle);
    }

    #[test]
    fn volume_set_while_loading_reaches_the_new_output() {
        let mut session = session(10);
        session.enqueue(track("a")).unwrap();
        let (play_id, _) = session.begin_loading().unwrap();
        session.set_volume_percent(20).unwrap();

        let handle = RecordingHandle::default();
        assert!(session.start_playing(play_id, Box::new(handle.clone()), 0.5));

        assert_eq!(handle.volume(), Some(0.2));
    }

    #[test]
    fn loop_queue_moves_the_finished_track_to_the_tail() {
        let mut session = session(10);
        for name in ["a", "b", "c"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);
        session.toggle_loop_queue();

        session.finish_current(false);
        play_next(&mut session);

        assert_eq!(session.now_playing().unwrap().track.title, "b");
        assert_eq!(titles(&session), ["c", "a"]);
    }

    #[test]
    fn skip_overrides_loop_single() {
        let mut session = session(10);
        for name in ["a", "b"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);
        session.toggle_loop();

        session.finish_current(true);
        play_next(&mut session);

        assert_eq!(session.now_playing().unwrap().track.title, "b");
        assert!(session.queue().is_empty());
    }

    #[test]
    fn loop_toggles_are_mutually_exclusive() {
        let mut session = session(10);

        assert_eq!(session.toggle_loop(), LoopMode::Single);
        assert_eq!(session.toggle_loop_queue(), LoopMode::Queue);
        assert_eq!(session.toggle_loop(), LoopMode::Single);
        assert_eq!(session.toggle_loop(), LoopMode::Off);
        assert_eq!(session.toggle_loop_queue(), LoopMode::Queue);
        assert_eq!(session.toggle_loop_queue(), LoopMode::Off);
    }

    #[test]
    fn out_of_range_volume_is_rejected_without_change() {
        let mut session = session(10);

        assert_eq!(
            session.set_volume_percent(150).unwrap_err(),
            MusicError::from(InvalidArgument::Volume(150))
        );
        assert!(session.set_volume_percent(-1).is_err());
        assert_eq!(session.volume(), 0.5);

        assert_eq!(session.set_volume_percent(80).unwrap(), 0.8);
        assert_eq!(session.volume(), 0.8);
    }

    #[test]
    fn volume_changes_reach_the_output() {
        let mut session = session(10);
        session.enqueue(track("a")).unwrap();
        let handle = RecordingHandle::default();
        let (play_id, _) = session.begin_loading().unwrap();
        session.start_playing(play_id, Box::new(handle.clone()), 0.5);

        session.set_volume_percent(30).unwrap();

        assert_eq!(handle.volume(), Some(0.3));
    }

    #[test]
    fn pause_and_resume_follow_the_state_machine() {
        let mut session = session(10);
        assert_eq!(session.pause().unwrap_err(), MusicError::NothingPlaying);

        session.enqueue(track("a")).unwrap();
        play_next(&mut session);

        assert_eq!(session.resume().unwrap_err(), MusicError::NotPaused);
        session.pause().unwrap();
        assert_eq!(session.state(), PlaybackState::Paused);
        session.resume().unwrap();
        assert_eq!(session.state(), PlaybackState::Playing);
        assert_eq!(session.now_playing().unwrap().track.title, "a");
    }

    #[test]
    fn stale_completions_are_rejected() {
        let mut session = session(10);
        session.enqueue(track("a")).unwrap();
        session.enqueue(track("b")).unwrap();
        let first = play_next(&mut session);

        session.finish_current(true);
        let second = play_next(&mut session);

        assert!(!session.accepts_completion(first));
        assert!(session.accepts_completion(second));
    }

    #[test]
    fn stop_clears_everything_but_keeps_loop_queue() {
        let mut session = session(10);
        for name in ["a", "b", "c"] {
            session.enqueue(track(name)).unwrap();
        }
        play_next(&mut session);
        session.toggle_loop_queue();

        assert_eq!(session.stop(), 2);
        assert!(session.now_playing().is_none());
        assert!(session.queue().is_empty());
        assert_eq!(session.state(), PlaybackState::Idle);
        assert_eq!(session.loop_mode(), LoopMode::Queue);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_and_alone_timers() {
        let timeout = Duration::from_secs(300);
        let mut session = session(10);

        assert_eq!(session.teardown_due(Instant::now(), timeout), None);
        tokio::time::advance(timeout).await;
        assert_eq!(session.teardown_due(Instant::now(), timeout), Some(TeardownReason::Idle));

        session.enqueue(track("a")).unwrap();
        play_next(&mut session);
        tokio::time::advance(timeout).await;
        assert_eq!(session.teardown_due(Instant::now(), timeout), None);

        session.set_alone(true);
        tokio::time::advance(timeout / 2).await;
        assert_eq!(session.teardown_due(Instant::now(), timeout), None);
        tokio::time::advance(timeout / 2).await;
        assert_eq!(session.teardown_due(Instant::now(), timeout), Some(TeardownReason::Alone));

        session.set_alone(false);
        assert_eq!(session.teardown_due(Instant::now(), timeout), None);
    }
}
