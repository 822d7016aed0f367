//! In-memory collaborators for exercising the player without network or voice.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serenity::async_trait;
use tokio::sync::Semaphore;

use crate::error::{MusicError, MusicResult, ResolutionError, VoiceConnectionError};
use crate::models::{StreamDescriptor, Track};
use crate::output::{AudioOutput, CompletionSignal, OutputHandle};
use crate::resolver::{MediaSource, PlaylistSource};

pub fn descriptor(query: &str) -> StreamDescriptor {
    let slug = query.replace(' ', "-");

    StreamDescriptor {
        stream_url: format!("https://stream.test/{slug}"),
        page_url: format!("https://video.test/{slug}"),
        title: query.to_string(),
        duration_secs: Some(180),
        thumbnail: None,
        uploader: None,
    }
}

pub fn track(title: &str) -> Track {
    Track::from_descriptor(title, descriptor(title), 1)
}

#[derive(Default)]
pub struct FakeMedia {
    failing: Mutex<HashSet<String>>,
    delays: HashMap<String, Duration>,
    gates: HashMap<String, Arc<Semaphore>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeMedia {
    pub fn failing(self, input: &str) -> Self {
        self.fail(input);
        self
    }

    pub fn delayed(mut self, input: &str, delay: Duration) -> Self {
        self.delays.insert(input.to_string(), delay);
        self
    }

    /// Resolution of `input` waits until a permit is added to `gate`.
    pub fn gated(mut self, input: &str, gate: Arc<Semaphore>) -> Self {
        self.gates.insert(input.to_string(), gate);
        self
    }

    pub fn fail(&self, input: &str) {
        self.failing.lock().unwrap().insert(input.to_string());
    }

    pub fn calls(&self, input: &str) -> usize {
        self.calls.lock().unwrap().get(input).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn resolve_search_or_url(&self, input: &str) -> Result<StreamDescriptor, ResolutionError> {
        *self.calls.lock().unwrap().entry(input.to_string()).or_default() += 1;

        if let Some(delay) = self.delays.get(input) {
            tokio::time::sleep(*delay).await;
        }

        if let Some(gate) = self.gates.get(input) {
            let _permit = gate.acquire().await.unwrap();
        }

        if self.failing.lock().unwrap().contains(input) {
            return Err(ResolutionError::NoResults);
        }

        Ok(descriptor(input))
    }
}

#[derive(Default)]
pub struct FakePlaylists {
    links: HashMap<String, Vec<String>>,
}

impl FakePlaylists {
    pub fn with(mut self, link: &str, queries: &[&str]) -> Self {
        self.links
            .insert(link.to_string(), queries.iter().map(|q| q.to_string()).collect());
        self
    }
}

#[async_trait]
impl PlaylistSource for FakePlaylists {
    fn name(&self) -> &'static str {
        "fake playlist"
    }

    fn matches(&self, input: &str) -> bool {
        self.links.contains_key(input)
    }

    async fn expand_playlist_link(&self, link: &str) -> Result<Vec<String>, ResolutionError> {
        self.links.get(link).cloned().ok_or(ResolutionError::NoResults)
    }
}

#[derive(Default)]
struct HandleState {
    volume: Option<f32>,
    paused: bool,
    stopped: bool,
}

#[derive(Clone, Default)]
pub struct RecordingHandle(Arc<Mutex<HandleState>>);

impl RecordingHandle {
    pub fn volume(&self) -> Option<f32> {
        self.0.lock().unwrap().volume
    }

    pub fn paused(&self) -> bool {
        self.0.lock().unwrap().paused
    }

    pub fn stopped(&self) -> bool {
        self.0.lock().unwrap().stopped
    }
}

impl OutputHandle for RecordingHandle {
    fn set_volume(&self, volume: f32) -> MusicResult<()> {
        self.0.lock().unwrap().volume = Some(volume);
        Ok(())
    }

    fn pause(&self) -> MusicResult<()> {
        self.0.lock().unwrap().paused = true;
        Ok(())
    }

    fn resume(&self) -> MusicResult<()> {
        self.0.lock().unwrap().paused = false;
        Ok(())
    }

    fn stop(&self) {
        self.0.lock().unwrap().stopped = true;
    }
}

pub struct Started {
    pub title: String,
    pub volume: f32,
    pub signal: CompletionSignal,
    pub handle: RecordingHandle,
}

#[derive(Default)]
pub struct FakeOutput {
    started: Mutex<Vec<Started>>,
    failing_titles: Mutex<HashSet<String>>,
    channels: Mutex<HashMap<u64, u64>>,
    refuse_joins: Mutex<bool>,
    start_gate: Mutex<Option<Arc<Semaphore>>>,
    attempts: AtomicUsize,
}

impl FakeOutput {
    pub fn fail_title(&self, title: &str) {
        self.failing_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn refuse_joins(&self) {
        *self.refuse_joins.lock().unwrap() = true;
    }

    /// Every later `start_output` waits for a permit on `gate`, like a slow stream probe.
    pub fn hold_starts(&self, gate: Arc<Semaphore>) {
        *self.start_gate.lock().unwrap() = Some(gate);
    }

    /// How many times `start_output` was entered, finished or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn started_titles(&self) -> Vec<String> {
        self.started.lock().unwrap().iter().map(|s| s.title.clone()).collect()
    }

    pub fn last_signal(&self) -> CompletionSignal {
        self.started.lock().unwrap().last().expect("a started track").signal.clone()
    }

    pub fn last_handle(&self) -> RecordingHandle {
        self.started.lock().unwrap().last().expect("a started track").handle.clone()
    }

    pub fn last_volume(&self) -> f32 {
        self.started.lock().unwrap().last().expect("a started track").volume
    }

    pub fn channel(&self, guild_id: u64) -> Option<u64> {
        self.channels.lock().unwrap().get(&guild_id).copied()
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> MusicResult<()> {
        if *self.refuse_joins.lock().unwrap() {
            return Err(VoiceConnectionError::Join("refused".to_string()).into());
        }

        self.channels.lock().unwrap().insert(guild_id, channel_id);
        Ok(())
    }

    async fn disconnect(&self, guild_id: u64) {
        self.channels.lock().unwrap().remove(&guild_id);
    }

    async fn start_output(
        &self,
        _guild_id: u64,
        stream: &StreamDescriptor,
        volume: f32,
        signal: CompletionSignal,
    ) -> MusicResult<Box<dyn OutputHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let gate = self.start_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.failing_titles.lock().unwrap().contains(&stream.title) {
            return Err(MusicError::OutputStream(format!("cannot open {}", stream.stream_url)));
        }

        let handle = RecordingHandle::default();
        self.started.lock().unwrap().push(Started {
            title: stream.title.clone(),
            volume,
            signal,
            handle: handle.clone(),
        });

        Ok(Box::new(handle))
    }
}
