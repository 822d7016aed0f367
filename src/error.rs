use thiserror::Error;

/// Failure to turn a query, URL or playlist link into something playable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no results found")]
    NoResults,

    #[error("content is age restricted")]
    AgeRestricted,

    #[error("content is not available in this region")]
    RegionLocked,

    #[error("network failure: {0}")]
    Network(String),

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("resolution failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidArgument {
    #[error("volume {0} is outside 0-100")]
    Volume(i64),

    #[error("position {position} is outside 1-{len}")]
    Position { position: i64, len: usize },

    #[error("missing query")]
    MissingQuery,

    #[error("not enough tracks")]
    NotEnoughTracks,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceConnectionError {
    #[error("requesting user is not in a voice channel")]
    UserNotInVoice,

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("already playing in another voice channel")]
    AlreadyConnectedElsewhere,

    #[error("join failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MusicError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("queue is full ({max} tracks)")]
    QueueFull { max: usize },

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error(transparent)]
    VoiceConnection(#[from] VoiceConnectionError),

    #[error("output stream error: {0}")]
    OutputStream(String),

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("nothing is paused")]
    NotPaused,
}

pub type MusicResult<T> = Result<T, MusicError>;

impl MusicError {
    /// Text shown in the channel. Never carries diagnostic detail.
    pub fn user_message(&self) -> String {
        match self {
            MusicError::Resolution(ResolutionError::NoResults) => {
                "❌ I couldn't find any results for that.".to_string()
            }
            MusicError::Resolution(ResolutionError::AgeRestricted) => {
                "❌ That video is age restricted and can't be played.".to_string()
            }
            MusicError::Resolution(ResolutionError::RegionLocked) => {
                "❌ That video isn't available in my region.".to_string()
            }
            MusicError::Resolution(ResolutionError::Network(_)) => {
                "❌ I couldn't reach the music service, try again in a moment.".to_string()
            }
            MusicError::Resolution(ResolutionError::Unsupported(_)) => {
                "❌ This format isn't supported yet.".to_string()
            }
            MusicError::Resolution(ResolutionError::Failed(_)) => {
                "❌ This track couldn't be loaded.".to_string()
            }
            MusicError::QueueFull { max } => format!("❌ Queue is full! (Max: {max})"),
            MusicError::InvalidArgument(InvalidArgument::Volume(_)) => {
                "❌ Volume must be between 0 and 100!".to_string()
            }
            MusicError::InvalidArgument(InvalidArgument::Position { len: 0, .. }) => {
                "📭 The queue is empty!".to_string()
            }
            MusicError::InvalidArgument(InvalidArgument::Position { len, .. }) => {
                format!("❌ Invalid position! Must be between 1 and {len}")
            }
            MusicError::InvalidArgument(InvalidArgument::MissingQuery) => {
                "❌ Please provide a song name or URL!".to_string()
            }
            MusicError::InvalidArgument(InvalidArgument::NotEnoughTracks) => {
                "❌ Not enough songs in queue to shuffle!".to_string()
            }
            MusicError::VoiceConnection(VoiceConnectionError::UserNotInVoice) => {
                "❌ Join a voice channel first, I can't play music alone.".to_string()
            }
            MusicError::VoiceConnection(VoiceConnectionError::NotConnected) => {
                "❌ I'm not connected to any voice channel.".to_string()
            }
            MusicError::VoiceConnection(VoiceConnectionError::AlreadyConnectedElsewhere) => {
                "❌ I'm already playing music in another channel.".to_string()
            }
            MusicError::VoiceConnection(VoiceConnectionError::Join(_)) => {
                "❌ I couldn't join your voice channel.".to_string()
            }
            MusicError::OutputStream(_) => "❌ This track couldn't be played.".to_string(),
            MusicError::NothingPlaying => "❌ Nothing is playing right now.".to_string(),
            MusicError::NotPaused => "❌ Nothing is paused!".to_string(),
        }
    }
}
