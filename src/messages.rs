use std::time::Duration;

use crate::error::MusicError;
use crate::models::{LoopMode, PlaybackState, Track};
use crate::session::{QueueSnapshot, TeardownReason};

pub const MUSIC_COLOR: u32 = 0x1DB954;
pub const ERROR_COLOR: u32 = 0xE74C3C;

const QUEUE_PAGE: usize = 10;
const QUEUE_TITLE_WIDTH: usize = 45;

/// Plain embed content, turned into a serenity embed at the edge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmbedContent {
    pub title: String,
    pub description: String,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub color: u32,
    pub fields: Vec<(String, String)>,
    pub footer: Option<String>,
}

/// `M:SS`, or `H:MM:SS` from one hour on.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let display_seconds = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:0>2}:{display_seconds:0>2}")
    } else {
        format!("{minutes}:{display_seconds:0>2}")
    }
}

fn duration_text(track: &Track) -> String {
    track.duration.map(format_duration).unwrap_or_else(|| "live".to_string())
}

fn shorten(title: &str, width: usize) -> String {
    if title.chars().count() <= width {
        return title.to_string();
    }

    let mut short: String = title.chars().take(width - 1).collect();
    short.push('…');
    short
}

pub fn help(prefix: &str) -> String {
    format!(
        r#"
**Commands:**
    **{prefix}play [URL|Title]** (p) - Plays or queues a track. Supports YouTube playlists and Spotify links.
    **{prefix}pause** - Pauses the current track.
    **{prefix}resume** (unpause) - Resumes the paused track.
    **{prefix}skip** (n, next) - Skips to the next track, even when looping a single track.
    **{prefix}stop** (s) - Stops playback and clears the queue.
    **{prefix}queue** (q, playlist) - Shows what is playing and what comes next.
    **{prefix}nowplaying** (np, current) - Shows the current track.
    **{prefix}loop** (l, repeat) - Loops the current track.
    **{prefix}loopqueue** (lq, queueloop) - Loops the whole queue.
    **{prefix}shuffle** (sh) - Reorders the queue randomly.
    **{prefix}remove [POSITION]** (rm) - Removes a track from the queue.
    **{prefix}clear** (cl) - Empties the queue, the current track keeps playing.
    **{prefix}volume [0-100]** (v) - Sets or shows the volume.
    **{prefix}join** (j, connect) - Joins your voice channel.
    **{prefix}leave** (dc, disconnect) - Leaves the voice channel.
    "#
    )
}

pub fn welcome(prefix: &str) -> EmbedContent {
    EmbedContent {
        title: "🎵 Thanks for adding me!".to_string(),
        description: format!(
            "I'm a music bot ready to play your favorite tunes!\n\n\
             **Get started:**\n\
             • `{prefix}join` - Join your voice channel\n\
             • `{prefix}play <song>` - Play a song\n\
             • `{prefix}help` - See all commands\n\n\
             **Supported sources:** YouTube, Spotify"
        ),
        color: MUSIC_COLOR,
        ..EmbedContent::default()
    }
}

pub fn now_playing(track: &Track, volume: f32) -> EmbedContent {
    let mut fields = vec![
        ("Duration".to_string(), duration_text(track)),
        ("Volume".to_string(), format!("{}%", (volume * 100.0).round() as u8)),
    ];

    if let Some(uploader) = &track.uploader {
        fields.push(("Uploader".to_string(), uploader.clone()));
    }

    EmbedContent {
        title: "🎶 Now Playing".to_string(),
        description: format!("**[{}]({})**", track.title, track.source_url),
        url: Some(track.source_url.clone()),
        thumbnail: track.thumbnail.clone(),
        color: MUSIC_COLOR,
        fields,
        footer: Some(format!("Requested by {}", requester_mention(track.requester))),
    }
}

fn requester_mention(requester: u64) -> String {
    format!("<@{requester}>")
}

pub fn queue_view(snapshot: &QueueSnapshot) -> EmbedContent {
    let mut lines = Vec::new();

    if let Some(track) = &snapshot.now_playing {
        let paused = if snapshot.state == PlaybackState::Paused { " (paused)" } else { "" };
        lines.push(format!(
            "**Now:** {} `{}`{paused}",
            shorten(&track.title, QUEUE_TITLE_WIDTH),
            duration_text(track)
        ));
        lines.push(String::new());
    }

    for (index, track) in snapshot.upcoming.iter().take(QUEUE_PAGE).enumerate() {
        lines.push(format!(
            "`{}.` {} `{}`",
            index + 1,
            shorten(&track.title, QUEUE_TITLE_WIDTH),
            duration_text(track)
        ));
    }

    if snapshot.upcoming.len() > QUEUE_PAGE {
        lines.push(format!("\n*And {} more...*", snapshot.upcoming.len() - QUEUE_PAGE));
    }

    if lines.is_empty() {
        lines.push("📭 The queue is empty!".to_string());
    }

    EmbedContent {
        title: "📜 Queue".to_string(),
        description: lines.join("\n"),
        color: MUSIC_COLOR,
        footer: Some(format!(
            "{} tracks in queue • Loop: {}",
            snapshot.upcoming.len(),
            snapshot.loop_mode
        )),
        ..EmbedContent::default()
    }
}

pub fn queued(track: &Track, position: usize) -> String {
    format!("✅ Added to queue: **{}** (position {position})", track.title)
}

pub fn started(track: &Track) -> String {
    format!("🎶 Playing **{}**", track.title)
}

pub fn playlist_queued(first: &Track, started: bool, pending: usize, failed: usize) -> String {
    let mut message = if started {
        format!("🎶 Playing **{}** from the playlist", first.title)
    } else {
        format!("✅ Added **{}** from the playlist", first.title)
    };

    if pending > 0 {
        message.push_str(&format!(", loading {pending} more in the background"));
    }

    if failed > 0 {
        message.push_str(&format!(" ({failed} could not be loaded)"));
    }

    message
}

pub fn playlist_finished(added: usize, failed: usize, truncated: bool) -> String {
    let mut message = format!("✅ Added **{added}** songs to queue!");

    if failed > 0 {
        message.push_str(&format!(" {failed} could not be loaded."));
    }

    if truncated {
        message.push_str(" The queue is full, the rest of the playlist was dropped.");
    }

    message
}

pub fn track_failed(title: &str, error: &MusicError) -> String {
    format!("⚠️ Skipping **{title}**: {}", error.user_message())
}

pub fn disconnected(reason: TeardownReason) -> &'static str {
    match reason {
        TeardownReason::Command => "👋 Disconnected from voice.",
        TeardownReason::Idle => "💤 Nothing played for a while, leaving the voice channel.",
        TeardownReason::Alone => "👋 Everyone left, so I did too.",
        TeardownReason::Disconnected => "🥺 Oh no! I got kicked from the voice channel...",
    }
}

pub fn loop_mode(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "➡️ Loop disabled.",
        LoopMode::Single => "🔂 Song loop enabled.",
        LoopMode::Queue => "🔁 Queue loop enabled.",
    }
}

pub fn volume(percent: u8) -> String {
    format!("🔊 Volume: **{percent}%**")
}

pub fn error(error: &MusicError) -> EmbedContent {
    EmbedContent {
        title: "Error".to_string(),
        description: error.user_message(),
        color: ERROR_COLOR,
        ..EmbedContent::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionError;
    use crate::testing::track;

    fn snapshot(now_playing: Option<Track>, upcoming: usize) -> QueueSnapshot {
        QueueSnapshot {
            state: if now_playing.is_some() { PlaybackState::Playing } else { PlaybackState::Idle },
            now_playing,
            upcoming: (1..=upcoming).map(|i| track(&format!("song {i}"))).collect(),
            loop_mode: LoopMode::Queue,
            volume: 0.5,
        }
    }

    #[test]
    fn durations_switch_to_hours_past_sixty_minutes() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(185)), "3:05");
        assert_eq!(format_duration(Duration::from_secs(3599)), "59:59");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1:00:00");
        assert_eq!(format_duration(Duration::from_secs(7384)), "2:03:04");
    }

    #[test]
    fn queue_view_shows_ten_entries_and_a_remainder() {
        let view = queue_view(&snapshot(Some(track("current")), 13));

        assert!(view.description.starts_with("**Now:** current `3:00`"));
        assert!(view.description.contains("`10.` song 10"));
        assert!(!view.description.contains("song 11"));
        assert!(view.description.contains("And 3 more"));
        assert_eq!(view.footer.as_deref(), Some("13 tracks in queue • Loop: queue"));
    }

    #[test]
    fn empty_queue_view_says_so() {
        let view = queue_view(&snapshot(None, 0));

        assert_eq!(view.description, "📭 The queue is empty!");
    }

    #[test]
    fn long_titles_are_shortened() {
        let long = "x".repeat(80);
        let view = queue_view(&QueueSnapshot {
            upcoming: vec![track(&long)],
            ..snapshot(None, 0)
        });

        assert!(view.description.contains(&format!("{}…", "x".repeat(44))));
    }

    #[test]
    fn now_playing_embed_carries_link_duration_and_requester() {
        let embed = now_playing(&track("track a"), 0.3);

        assert_eq!(embed.description, "**[track a](https://video.test/track-a)**");
        assert!(embed.fields.contains(&("Duration".to_string(), "3:00".to_string())));
        assert!(embed.fields.contains(&("Volume".to_string(), "30%".to_string())));
        assert_eq!(embed.footer.as_deref(), Some("Requested by <@1>"));
    }

    #[test]
    fn playlist_summaries_mention_failures_and_truncation() {
        assert_eq!(playlist_finished(4, 0, false), "✅ Added **4** songs to queue!");
        assert_eq!(
            playlist_finished(2, 1, true),
            "✅ Added **2** songs to queue! 1 could not be loaded. The queue is full, the rest of the playlist was dropped."
        );
        assert_eq!(
            playlist_queued(&track("q1"), true, 3, 1),
            "🎶 Playing **q1** from the playlist, loading 3 more in the background (1 could not be loaded)"
        );
    }

    #[test]
    fn failures_use_the_friendly_text() {
        let message = track_failed("q2", &MusicError::Resolution(ResolutionError::Network("503".to_string())));

        assert!(message.starts_with("⚠️ Skipping **q2**"));
        assert!(!message.contains("503"));
    }

    #[test]
    fn welcome_uses_the_configured_prefix() {
        let embed = welcome("?");

        assert!(embed.description.contains("`?join`"));
        assert!(embed.description.contains("`?play <song>`"));
        assert!(embed.description.contains("**Supported sources:** YouTube, Spotify"));
        assert_eq!(embed.color, MUSIC_COLOR);
    }

    #[test]
    fn help_lists_every_command() {
        let text = help("!");

        for command in [
            "play", "pause", "resume", "skip", "stop", "queue", "nowplaying", "loop", "loopqueue", "shuffle", "remove",
            "clear", "volume", "join", "leave",
        ] {
            assert!(text.contains(&format!("**!{command}")), "{command} missing");
        }
    }
}
