use std::time::Duration;

use serde::Deserialize;
use serenity::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ResolutionError;
use crate::models::{StreamDescriptor, UNKNOWN_TRACK_TITLE};
use crate::resolver::MediaSource;

const YTDLP_TIMEOUT: Duration = Duration::from_secs(60);

/// Subset of `yt-dlp -j` output we care about.
#[derive(Deserialize)]
struct VideoInfo {
    url: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
}

/// Search/URL resolution backed by the `yt-dlp` executable.
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        YtDlp {
            program: "yt-dlp".to_string(),
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

fn target_for(input: &str) -> String {
    if is_url(input) {
        input.to_string()
    } else {
        format!("ytsearch1:{input}")
    }
}

#[async_trait]
impl MediaSource for YtDlp {
    async fn resolve_search_or_url(&self, input: &str) -> Result<StreamDescriptor, ResolutionError> {
        let target = target_for(input);

        debug!("Running {} for {target}", self.program);

        let command = Command::new(&self.program)
            .arg("-j")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("-f")
            .arg("bestaudio/best")
            .arg(&target)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(YTDLP_TIMEOUT, command)
            .await
            .map_err(|_| ResolutionError::Network(format!("yt-dlp timed out for {target}")))?
            .map_err(|why| ResolutionError::Failed(format!("yt-dlp command failed to start: {why}")))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed for {target}: {}", error.trim());

            return Err(classify_failure(&error));
        }

        let result = String::from_utf8(output.stdout)
            .map_err(|_| ResolutionError::Failed("Error reading stdout".to_string()))?;

        parse_descriptor(&result)
    }
}

fn parse_descriptor(output: &str) -> Result<StreamDescriptor, ResolutionError> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or(ResolutionError::NoResults)?;

    let info: VideoInfo = serde_json::from_str(line)
        .map_err(|why| ResolutionError::Failed(format!("unexpected yt-dlp output: {why}")))?;

    let stream_url = info.url.ok_or(ResolutionError::NoResults)?;
    let page_url = info
        .webpage_url
        .or(info.original_url)
        .unwrap_or_else(|| stream_url.clone());

    Ok(StreamDescriptor {
        stream_url,
        page_url,
        title: info.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
        duration_secs: info.duration.filter(|d| *d >= 0.0).map(|d| d.round() as u64),
        thumbnail: info.thumbnail,
        uploader: info.uploader,
    })
}

fn classify_failure(stderr: &str) -> ResolutionError {
    let lower = stderr.to_lowercase();

    if lower.contains("confirm your age") || lower.contains("age-restricted") {
        ResolutionError::AgeRestricted
    } else if lower.contains("not available in your country") || lower.contains("geo restrict") {
        ResolutionError::RegionLocked
    } else if lower.contains("unable to download") || lower.contains("timed out") || lower.contains("name resolution") {
        ResolutionError::Network(stderr.trim().to_string())
    } else if lower.contains("unsupported url") {
        ResolutionError::Unsupported(stderr.trim().to_string())
    } else if lower.contains("video unavailable") || lower.contains("no video results") {
        ResolutionError::NoResults
    } else {
        ResolutionError::Failed(stderr.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_yt_dlp_from_the_path_by_default() {
        assert_eq!(YtDlp::new().program, "yt-dlp");
        assert_eq!(YtDlp::default().program, YtDlp::new().program);
    }

    #[test]
    fn searches_are_prefixed_and_urls_are_not() {
        assert_eq!(target_for("daft punk"), "ytsearch1:daft punk");
        assert_eq!(target_for("https://youtu.be/xyz"), "https://youtu.be/xyz");
    }

    #[test]
    fn parses_the_first_json_line() {
        let output = r#"{"url":"https://rr1.example/audio","webpage_url":"https://www.youtube.com/watch?v=abc","title":"Song","duration":212.4,"thumbnail":"https://i.example/abc.jpg","uploader":"Band","extra":1}
"#;

        let descriptor = parse_descriptor(output).unwrap();

        assert_eq!(descriptor.stream_url, "https://rr1.example/audio");
        assert_eq!(descriptor.page_url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(descriptor.title, "Song");
        assert_eq!(descriptor.duration_secs, Some(212));
        assert_eq!(descriptor.uploader.as_deref(), Some("Band"));
    }

    #[test]
    fn missing_fields_fall_back() {
        let descriptor = parse_descriptor(r#"{"url":"https://rr1.example/a"}"#).unwrap();

        assert_eq!(descriptor.title, UNKNOWN_TRACK_TITLE);
        assert_eq!(descriptor.page_url, "https://rr1.example/a");
        assert_eq!(descriptor.duration_secs, None);
    }

    #[test]
    fn empty_output_means_no_results() {
        assert_eq!(parse_descriptor("\n").unwrap_err(), ResolutionError::NoResults);
        assert_eq!(parse_descriptor(r#"{"title":"x"}"#).unwrap_err(), ResolutionError::NoResults);
    }

    #[test]
    fn failures_are_classified() {
        assert_eq!(
            classify_failure("ERROR: [youtube] abc: Sign in to confirm your age"),
            ResolutionError::AgeRestricted
        );
        assert_eq!(
            classify_failure("ERROR: The uploader has not made this video available in your country"),
            ResolutionError::RegionLocked
        );
        assert!(matches!(classify_failure("ERROR: Unable to download webpage"), ResolutionError::Network(_)));
        assert!(matches!(classify_failure("something odd"), ResolutionError::Failed(_)));
    }
}
