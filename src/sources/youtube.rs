use anyhow::Context;
use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{sync::LazyLock, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{ResolvedTrack, SourceHandle, VideoProvider};
use crate::error::ResolveError;

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/|playlist\?)|youtu\.be/|music\.youtube\.com/)",
    )
    .expect("valid YouTube URL regex")
});

/// Video provider backed by the `yt-dlp` binary.
pub struct YouTubeClient {
    program: String,
    // Limit concurrent yt-dlp processes to stay clear of provider rate limits
    rate_limiter: Semaphore,
}

/// Information extracted by `yt-dlp --dump-json`.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: String,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    webpage_url: String,
    #[serde(default)]
    is_live: Option<bool>,
}

/// One line of `yt-dlp --flat-playlist --dump-json`.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: String,
    url: Option<String>,
}

impl YouTubeClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Whether `url` points at the video provider.
    pub fn is_youtube_url(url: &str) -> bool {
        YOUTUBE_URL.is_match(url)
    }

    /// Runs yt-dlp with the given arguments and returns its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, ResolveError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))
            .map_err(|e| ResolveError::Upstream(format!("{e:#}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(stderr.trim(), args.last().copied().unwrap_or_default()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// URL of the best audio-only format, fed to the transcoder.
    pub async fn stream_url(&self, url: &str) -> Result<String, ResolveError> {
        debug!("🎵 Fetching stream URL for: {}", url);

        let stdout = self
            .run(&["--no-playlist", "-f", "bestaudio/best", "--get-url", "--no-warnings", url])
            .await?;

        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl VideoProvider for YouTubeClient {
    async fn search(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
        info!("🔍 Searching YouTube: {}", query);

        let search_query = format!("ytsearch1:{query}");
        let stdout = self
            .run(&["--no-playlist", "--dump-json", "--skip-download", "--no-warnings", &search_query])
            .await?;

        let track = stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
            .map(info_to_track)
            .next()
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;

        info!("✅ Found on YouTube: {}", track.source.url);
        Ok(track)
    }

    async fn lookup(&self, url: &str) -> Result<ResolvedTrack, ResolveError> {
        debug!("📊 Fetching info for: {}", url);

        let stdout = self
            .run(&["--no-playlist", "--dump-json", "--skip-download", "--no-warnings", url])
            .await?;

        let info: YtDlpInfo = serde_json::from_str(stdout.trim())
            .map_err(|e| ResolveError::Upstream(format!("unreadable yt-dlp output: {e}")))?;
        Ok(info_to_track(info))
    }

    async fn playlist(&self, url: &str, limit: usize) -> Result<Vec<String>, ResolveError> {
        info!("📋 Fetching playlist: {}", url);

        let end = limit.to_string();
        let stdout = self
            .run(&["--flat-playlist", "--dump-json", "--playlist-end", &end, "--no-warnings", url])
            .await?;

        let entries: Vec<String> = stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<FlatEntry>(line).ok())
            .map(|entry| {
                entry
                    .url
                    .filter(|u| u.starts_with("http"))
                    .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", entry.id))
            })
            .take(limit)
            .collect();

        Ok(entries)
    }
}

fn info_to_track(info: YtDlpInfo) -> ResolvedTrack {
    if info.is_live.unwrap_or(false) {
        warn!("🔴 {} is a live stream", info.title);
    }

    let mut track = ResolvedTrack::new(SourceHandle::youtube(info.webpage_url), info.title);
    if let Some(author) = info.uploader.or(info.channel) {
        track = track.with_author(author);
    }
    if let Some(duration) = info.duration.filter(|d| d.is_finite() && *d > 0.0) {
        track = track.with_duration(Duration::from_secs_f64(duration));
    }
    if let Some(thumbnail) = info.thumbnail {
        track = track.with_artwork(thumbnail);
    }
    track
}

/// yt-dlp reports missing media and provider trouble the same way (non-zero
/// exit); the stderr text tells them apart.
fn classify_failure(stderr: &str, subject: &str) -> ResolveError {
    let lower = stderr.to_lowercase();
    let missing = [
        "video unavailable",
        "is not available",
        "does not exist",
        "private video",
        "http error 404",
    ];

    if missing.iter().any(|needle| lower.contains(needle)) {
        ResolveError::NotFound(subject.to_string())
    } else {
        ResolveError::Upstream(format!("yt-dlp error: {stderr}"))
    }
}
