use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serenity::async_trait;
use tracing::{debug, info, warn};

use crate::cache::StreamCache;
use crate::error::ResolutionError;
use crate::models::{StreamDescriptor, Track};

/// How many playlist items are resolved ahead of the one being appended.
const PLAYLIST_LOOKAHEAD: usize = 4;

/// Maps a search query or a direct URL to a playable stream.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn resolve_search_or_url(&self, input: &str) -> Result<StreamDescriptor, ResolutionError>;
}

/// Expands a shareable playlist/track link into plain queries, in playlist order.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, input: &str) -> bool;

    async fn expand_playlist_link(&self, link: &str) -> Result<Vec<String>, ResolutionError>;
}

/// Result of resolving a user request: the first playable track plus whatever
/// playlist items still have to be resolved in the background.
#[derive(Debug)]
pub struct Resolved {
    pub first: Track,
    pub remaining: Vec<String>,
    pub failed: Vec<(String, ResolutionError)>,
}

impl Resolved {
    pub fn is_playlist(&self) -> bool {
        !self.remaining.is_empty() || !self.failed.is_empty()
    }
}

pub struct TrackResolver {
    media: Arc<dyn MediaSource>,
    playlists: Vec<Arc<dyn PlaylistSource>>,
    cache: Arc<StreamCache>,
}

impl TrackResolver {
    pub fn new(media: Arc<dyn MediaSource>, cache: Arc<StreamCache>) -> Self {
        TrackResolver {
            media,
            playlists: Vec::new(),
            cache,
        }
    }

    pub fn with_playlists(mut self, source: Arc<dyn PlaylistSource>) -> Self {
        self.playlists.push(source);
        self
    }

    pub fn cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    fn playlist_source(&self, input: &str) -> Option<&Arc<dyn PlaylistSource>> {
        self.playlists.iter().find(|source| source.matches(input))
    }

    /// Resolves a user request. Playlist links resolve only up to the first
    /// playable item; the rest is returned unresolved so playback can start.
    pub async fn resolve_request(&self, input: &str, requester: u64) -> Result<Resolved, ResolutionError> {
        let Some(source) = self.playlist_source(input) else {
            let first = self.resolve(input, requester).await?;

            return Ok(Resolved {
                first,
                remaining: Vec::new(),
                failed: Vec::new(),
            });
        };

        info!("Detected {} link in {input}", source.name());

        let queries = source.expand_playlist_link(input).await?;
        let mut queries = queries.into_iter();
        let mut failed = Vec::new();

        for query in queries.by_ref() {
            match self.resolve(&query, requester).await {
                Ok(first) => {
                    return Ok(Resolved {
                        first,
                        remaining: queries.collect(),
                        failed,
                    });
                }
                Err(why) => {
                    warn!("Skipping playlist item {query}: {why}");
                    failed.push((query, why));
                }
            }
        }

        Err(failed
            .pop()
            .map(|(_, why)| why)
            .unwrap_or(ResolutionError::NoResults))
    }

    /// Resolves a single query or URL, consulting the stream cache first.
    pub async fn resolve(&self, input: &str, requester: u64) -> Result<Track, ResolutionError> {
        let descriptor = self.descriptor_for(input).await?;

        Ok(Track::from_descriptor(input, descriptor, requester))
    }

    /// Fresh stream for a queued track, right before it is handed to the output.
    pub async fn stream_for(&self, track: &Track) -> Result<StreamDescriptor, ResolutionError> {
        self.descriptor_for(&track.source_url).await
    }

    /// Resolves `queries` concurrently but yields results in the original order.
    pub fn resolve_in_order(
        self: &Arc<Self>,
        queries: Vec<String>,
        requester: u64,
    ) -> BoxStream<'static, (String, Result<Track, ResolutionError>)> {
        let resolver = Arc::clone(self);

        stream::iter(queries)
            .map(move |query| {
                let resolver = Arc::clone(&resolver);
                async move {
                    let result = resolver.resolve(&query, requester).await;
                    (query, result)
                }
            })
            .buffered(PLAYLIST_LOOKAHEAD)
            .boxed()
    }

    async fn descriptor_for(&self, input: &str) -> Result<StreamDescriptor, ResolutionError> {
        if let Some(descriptor) = self.cache.lookup(input).await {
            return Ok(descriptor);
        }

        debug!("Resolving {input}");

        let descriptor = self.media.resolve_search_or_url(input).await?;

        self.cache.store(input, descriptor.clone()).await;
        if descriptor.page_url != input {
            self.cache.store(&descriptor.page_url, descriptor.clone()).await;
        }

        Ok(descriptor)
    }
}
