use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serenity::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SpotifyCredentials;
use crate::error::ResolutionError;
use crate::resolver::PlaylistSource;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";

static SPOTIFY_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"open\.spotify\.com/(?:intl-[a-zA-Z-]+/)?(track|playlist|album)/([A-Za-z0-9]+)")
        .expect("valid spotify link pattern")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Track,
    Playlist,
    Album,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpotifyLink {
    pub kind: LinkKind,
    pub id: String,
}

pub fn parse_link(input: &str) -> Option<SpotifyLink> {
    let captures = SPOTIFY_LINK.captures(input)?;

    let kind = match &captures[1] {
        "track" => LinkKind::Track,
        "playlist" => LinkKind::Playlist,
        _ => LinkKind::Album,
    };

    Some(SpotifyLink {
        kind,
        id: captures[2].to_string(),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct SpotifyTrack {
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
}

#[derive(Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

impl SpotifyTrack {
    fn search_query(&self) -> String {
        match self.artists.first() {
            Some(artist) => format!("{} - {}", artist.name, self.name),
            None => self.name.clone(),
        }
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Turns playlist-service links into `"artist - title"` search queries.
pub struct Spotify {
    http: reqwest::Client,
    credentials: Option<SpotifyCredentials>,
    token: Mutex<Option<AccessToken>>,
}

impl Spotify {
    pub fn new(credentials: Option<SpotifyCredentials>) -> Self {
        if credentials.is_none() {
            info!("Spotify credentials not set, playlist-service links are disabled");
        }

        Spotify {
            http: reqwest::Client::new(),
            credentials,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ResolutionError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ResolutionError::Unsupported("Spotify credentials are not configured".to_string())
        })?;

        let mut token = self.token.lock().await;

        if let Some(current) = token.as_ref() {
            if current.expires_at > Instant::now() {
                return Ok(current.value.clone());
            }
        }

        debug!("Requesting a new Spotify access token");

        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(network_error)?
            .json()
            .await
            .map_err(network_error)?;

        // Refreshed a minute before the service expires it.
        let lifetime = Duration::from_secs(response.expires_in.saturating_sub(60));
        let value = response.access_token;

        *token = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ResolutionError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(network_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolutionError::NoResults);
        }

        response
            .error_for_status()
            .map_err(network_error)?
            .json()
            .await
            .map_err(|why| ResolutionError::Failed(format!("unexpected Spotify response: {why}")))
    }

    async fn collect_pages<T, F>(&self, first_url: String, mut to_query: F) -> Result<Vec<String>, ResolutionError>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> Option<String>,
    {
        let mut queries = Vec::new();
        let mut next = Some(first_url);

        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url).await?;
            queries.extend(page.items.into_iter().filter_map(&mut to_query));
            next = page.next;
        }

        Ok(queries)
    }
}

#[async_trait]
impl PlaylistSource for Spotify {
    fn name(&self) -> &'static str {
        "Spotify"
    }

    fn matches(&self, input: &str) -> bool {
        parse_link(input).is_some()
    }

    async fn expand_playlist_link(&self, link: &str) -> Result<Vec<String>, ResolutionError> {
        let SpotifyLink { kind, id } = parse_link(link)
            .ok_or_else(|| ResolutionError::Unsupported(format!("not a Spotify link: {link}")))?;

        let queries = match kind {
            LinkKind::Track => {
                let track: SpotifyTrack = self.get_json(&format!("{API_URL}/tracks/{id}")).await?;
                vec![track.search_query()]
            }
            LinkKind::Playlist => {
                let url = format!("{API_URL}/playlists/{id}/tracks?limit=100");
                self.collect_pages(url, |item: PlaylistItem| item.track.map(|track| track.search_query()))
                    .await?
            }
            LinkKind::Album => {
                let url = format!("{API_URL}/albums/{id}/tracks?limit=50");
                self.collect_pages(url, |track: SpotifyTrack| Some(track.search_query()))
                    .await?
            }
        };

        if queries.is_empty() {
            warn!("Spotify link {link} has no playable tracks");
            return Err(ResolutionError::NoResults);
        }

        info!("Spotify link {link} expanded to {} queries", queries.len());

        Ok(queries)
    }
}

fn network_error(why: reqwest::Error) -> ResolutionError {
    ResolutionError::Network(why.to_string())
}
