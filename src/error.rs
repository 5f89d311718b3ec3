//! Error taxonomy for the playback core.
//!
//! Per-track failures ([`TrackError`]) are contained by the engine and turn
//! into skips. Caller-facing failures ([`PlaybackError`]) are returned to the
//! command layer without retry.

use std::time::Duration;
use thiserror::Error;

/// Failure of the metadata lookup for a single query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no results found for `{0}`")]
    NotFound(String),

    #[error("upstream provider error: {0}")]
    Upstream(String),
}

/// Failure turning a resolved track into something the output device can play.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializeError {
    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error("artifact I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MaterializeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Why a single queue entry could not be played. Always contained: the entry
/// is dropped and playback moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("output device rejected the track: {0}")]
    Device(String),
}

impl TrackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackError::Resolve(ResolveError::NotFound(_)) => ErrorKind::NotFound,
            TrackError::Resolve(ResolveError::Upstream(_)) => ErrorKind::UpstreamError,
            TrackError::Materialize(_) => ErrorKind::TranscodeError,
            TrackError::Timeout(_) => ErrorKind::Timeout,
            TrackError::Device(_) => ErrorKind::DeviceError,
        }
    }
}

/// Errors surfaced directly to whoever issued the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("you need to be in a voice channel to play music")]
    NoVoiceChannel,

    #[error("nothing is playing right now")]
    NothingPlaying,

    #[error("the queue is full (limit {limit})")]
    QueueFull { limit: usize },

    #[error("could not join the voice channel: {0}")]
    Connect(String),

    #[error("output device error: {0}")]
    Device(String),

    #[error("could not expand playlist: {0}")]
    Playlist(ResolveError),
}

impl PlaybackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlaybackError::NoVoiceChannel => ErrorKind::NoVoiceChannel,
            PlaybackError::NothingPlaying => ErrorKind::NothingPlaying,
            PlaybackError::QueueFull { .. } => ErrorKind::QueueFull,
            PlaybackError::Connect(_) | PlaybackError::Device(_) => ErrorKind::DeviceError,
            PlaybackError::Playlist(ResolveError::NotFound(_)) => ErrorKind::NotFound,
            PlaybackError::Playlist(ResolveError::Upstream(_)) => ErrorKind::UpstreamError,
        }
    }
}

/// Flat view of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoVoiceChannel,
    NotFound,
    UpstreamError,
    TranscodeError,
    Timeout,
    NothingPlaying,
    QueueFull,
    DeviceError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_error_kinds() {
        let not_found: TrackError = ResolveError::NotFound("x".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let transcode: TrackError = MaterializeError::Transcode("ffmpeg exited 1".into()).into();
        assert_eq!(transcode.kind(), ErrorKind::TranscodeError);

        assert_eq!(
            TrackError::Timeout(Duration::from_secs(30)).to_string(),
            "timed out after 30s"
        );
    }

    #[test]
    fn test_playback_error_kinds() {
        assert_eq!(PlaybackError::NoVoiceChannel.kind(), ErrorKind::NoVoiceChannel);
        assert_eq!(
            PlaybackError::Connect("gateway closed".into()).kind(),
            ErrorKind::DeviceError
        );
        assert_eq!(
            PlaybackError::Playlist(ResolveError::Upstream("503".into())).kind(),
            ErrorKind::UpstreamError
        );
    }
}
