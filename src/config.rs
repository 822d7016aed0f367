use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub discord_token: String,
    pub prefix: String,
    /// Default volume, already scaled to 0.0-1.0.
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub idle_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_path: Option<PathBuf>,
    pub spotify: Option<SpotifyCredentials>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

const DEFAULT_PREFIX: &str = "!";
const DEFAULT_VOLUME_PERCENT: u8 = 50;
const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CACHE_TTL_SECS: u64 = 2 * 60 * 60;
const DEFAULT_CACHE_PATH: &str = "stream_cache.json";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let prefix = lookup("BOT_PREFIX")
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let volume_percent: u8 = parse_or(&lookup, "DEFAULT_VOLUME", DEFAULT_VOLUME_PERCENT)?;
        if volume_percent > 100 {
            return Err(ConfigError::Invalid { key: "DEFAULT_VOLUME", value: volume_percent.to_string() });
        }

        let max_queue_size: usize = parse_or(&lookup, "MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE)?;
        if max_queue_size == 0 {
            return Err(ConfigError::Invalid { key: "MAX_QUEUE_SIZE", value: "0".to_string() });
        }

        let idle_timeout = Duration::from_secs(parse_or(&lookup, "DISCONNECT_TIMEOUT", DEFAULT_IDLE_TIMEOUT_SECS)?);
        let cache_ttl = Duration::from_secs(parse_or(&lookup, "CACHE_TTL", DEFAULT_CACHE_TTL_SECS)?);

        let cache_path = match lookup("CACHE_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from(DEFAULT_CACHE_PATH)),
        };

        let spotify = match (lookup("SPOTIFY_CLIENT_ID"), lookup("SPOTIFY_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) if !client_id.is_empty() && !client_secret.is_empty() => {
                Some(SpotifyCredentials { client_id, client_secret })
            }
            _ => None,
        };

        Ok(Config {
            discord_token,
            prefix,
            default_volume: f32::from(volume_percent) / 100.0,
            max_queue_size,
            idle_timeout,
            cache_ttl,
            cache_path,
            spotify,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
