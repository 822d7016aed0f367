use std::time::Duration;

use serde::Deserialize;
use serenity::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ResolutionError;
use crate::resolver::PlaylistSource;

const FLAT_PLAYLIST_TIMEOUT: Duration = Duration::from_secs(120);

/// One line of `yt-dlp --flat-playlist -j` output.
#[derive(Deserialize)]
struct PlaylistSong {
    id: Option<String>,
    url: Option<String>,
}

impl PlaylistSong {
    fn query(self) -> Option<String> {
        match (self.url, self.id) {
            (Some(url), _) if url.starts_with("http") => Some(url),
            (_, Some(id)) => Some(format!("https://www.youtube.com/watch?v={id}")),
            (Some(url), None) => Some(url),
            (None, None) => None,
        }
    }
}

/// Playlist URLs of the video host, expanded with `yt-dlp --flat-playlist`.
pub struct YoutubePlaylists;

pub fn is_youtube_playlist(input: &str) -> bool {
    input.starts_with("http") && (input.contains("&list=") || input.contains("?list="))
}

#[async_trait]
impl PlaylistSource for YoutubePlaylists {
    fn name(&self) -> &'static str {
        "YouTube playlist"
    }

    fn matches(&self, input: &str) -> bool {
        is_youtube_playlist(input)
    }

    async fn expand_playlist_link(&self, url: &str) -> Result<Vec<String>, ResolutionError> {
        info!("Getting songs from playlist {url}");

        let command = Command::new("yt-dlp")
            .arg("-j")
            .arg("--flat-playlist")
            .arg(url)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(FLAT_PLAYLIST_TIMEOUT, command)
            .await
            .map_err(|_| ResolutionError::Network(format!("yt-dlp timed out for {url}")))?
            .map_err(|why| ResolutionError::Failed(format!("yt-dlp command failed to start: {why}")))?;

        let error = String::from_utf8_lossy(&output.stderr);
        let result = String::from_utf8(output.stdout)
            .map_err(|_| ResolutionError::Failed("Error reading stdout".to_string()))?;

        if result.trim().is_empty() {
            warn!("yt-dlp returned no playlist entries for {url}: {}", error.trim());
            return Err(ResolutionError::NoResults);
        }

        Ok(songs_from_flat_playlist(&result))
    }
}

pub fn songs_from_flat_playlist(output: &str) -> Vec<String> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let queries: Vec<String> = lines
        .iter()
        .filter_map(|line| {
            let playlist_song: PlaylistSong = serde_json::from_str(line).ok()?;
            playlist_song.query()
        })
        .collect();

    if queries.len() < lines.len() {
        warn!("Some songs have been skipped due to errors during parsing");
    }

    queries
}
