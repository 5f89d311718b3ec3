//! # Source Materializer
//!
//! Turns a [`ResolvedTrack`] into a [`Payload`] the output device can play.
//!
//! - **Streaming**: the payload is the source handle itself; the device opens
//!   the stream lazily and reads it once.
//! - **Transcoded**: the audio is converted by `ffmpeg` into an mp3 artifact
//!   under the transcode directory and the payload points at that file.
//!
//! Artifact names are derived from a hash of the source URL (with a readable
//! title prefix), so two different tracks whose titles sanitize to the same
//! text never share a file. Artifacts are reference counted through the
//! [`ArtifactStore`]: the file disappears when the last holder lets go.

use async_process::Command;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::MaterializeError,
    sources::{ResolvedTrack, SourceHandle, SourceKind, YouTubeClient},
};

const ARTIFACT_EXTENSION: &str = "mp3";
const TITLE_PREFIX_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    Streaming,
    Transcoded,
}

impl FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "streaming" | "stream" => Ok(PlaybackMode::Streaming),
            "transcoded" | "transcode" | "ffmpeg" => Ok(PlaybackMode::Transcoded),
            other => Err(format!("unknown playback mode `{other}` (expected streaming or transcoded)")),
        }
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackMode::Streaming => f.write_str("streaming"),
            PlaybackMode::Transcoded => f.write_str("transcoded"),
        }
    }
}

/// What gets handed to the output device.
#[derive(Debug, Clone)]
pub enum Payload {
    Stream(SourceHandle),
    File(Artifact),
}

/// A resolved track together with its playable payload.
#[derive(Debug)]
pub struct MaterializedAudio {
    pub track: ResolvedTrack,
    pub payload: Payload,
    pub created_at: Instant,
}

impl MaterializedAudio {
    pub fn new(track: ResolvedTrack, payload: Payload) -> Self {
        Self {
            track,
            payload,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

#[async_trait]
pub trait Materializer: Send + Sync {
    async fn materialize(
        &self,
        track: &ResolvedTrack,
        mode: PlaybackMode,
    ) -> Result<Payload, MaterializeError>;
}

/// Registry of transcoded artifacts, shared by the materializer (writer) and
/// the cache (which releases artifacts on eviction).
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    live: Mutex<HashMap<PathBuf, Weak<ArtifactInner>>>,
}

/// Shared handle to one file in the artifact directory.
#[derive(Clone)]
pub struct Artifact {
    inner: Arc<ArtifactInner>,
}

struct ArtifactInner {
    path: PathBuf,
    store: Arc<StoreInner>,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Artifact").field(&self.inner.path).finish()
    }
}

impl Drop for ArtifactInner {
    fn drop(&mut self) {
        let mut live = self.store.live.lock();
        // Someone acquired the same path again after our last handle went away
        if live
            .get(&self.path)
            .is_some_and(|weak| weak.strong_count() > 0)
        {
            return;
        }
        live.remove(&self.path);

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("🧹 Removed artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️ Could not remove artifact {}: {}", self.path.display(), e),
        }
    }
}

impl ArtifactStore {
    /// Opens the artifact directory, creating it if needed. Files left over
    /// from a previous run have no owner and are purged.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut purged = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("🧹 Purged {} stale artifacts from {}", purged, dir.display());
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                live: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Returns the shared handle for `file_name`, pinning the path until every
    /// handle is dropped.
    pub fn acquire(&self, file_name: &str) -> Artifact {
        let path = self.inner.dir.join(file_name);
        let mut live = self.inner.live.lock();

        if let Some(inner) = live.get(&path).and_then(Weak::upgrade) {
            return Artifact { inner };
        }

        let inner = Arc::new(ArtifactInner {
            path: path.clone(),
            store: Arc::clone(&self.inner),
        });
        live.insert(path, Arc::downgrade(&inner));
        Artifact { inner }
    }

    /// Number of artifacts currently held by someone.
    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.inner
            .live
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// File name for a track's artifact: readable title prefix plus a hash of the
/// canonical source URL.
pub fn artifact_name(track: &ResolvedTrack) -> String {
    let digest = Sha256::digest(track.source.url.as_bytes());
    let hash: String = format!("{digest:x}").chars().take(16).collect();

    let title: String = sanitize_title(&track.title)
        .chars()
        .take(TITLE_PREFIX_CHARS)
        .collect();
    let title = title.trim();

    if title.is_empty() {
        format!("{hash}.{ARTIFACT_EXTENSION}")
    } else {
        format!("{title}-{hash}.{ARTIFACT_EXTENSION}")
    }
}

/// Strips characters that are unsafe in file names.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string()
}

/// Materializer backed by yt-dlp (stream URLs) and ffmpeg (transcoding).
pub struct SourceMaterializer {
    youtube: Arc<YouTubeClient>,
    store: ArtifactStore,
    ffmpeg: String,
    bitrate_kbps: u32,
}

impl SourceMaterializer {
    pub fn new(
        youtube: Arc<YouTubeClient>,
        store: ArtifactStore,
        ffmpeg: impl Into<String>,
        bitrate_kbps: u32,
    ) -> Self {
        Self {
            youtube,
            store,
            ffmpeg: ffmpeg.into(),
            bitrate_kbps,
        }
    }

    async fn transcode(&self, track: &ResolvedTrack) -> Result<Artifact, MaterializeError> {
        // Pin the path before looking at the disk so a concurrent release
        // cannot delete the file between the check and the hand-off.
        let artifact = self.store.acquire(&artifact_name(track));

        if tokio::fs::try_exists(artifact.path()).await? {
            debug!("♻️ Reusing artifact {}", artifact.path().display());
            return Ok(artifact);
        }

        let input = match track.source.kind {
            SourceKind::YouTube => self
                .youtube
                .stream_url(&track.source.url)
                .await
                .map_err(|e| MaterializeError::Transcode(e.to_string()))?,
            SourceKind::Direct => track.source.url.clone(),
        };

        // Write next to the final path and rename, so readers never see a
        // partially written artifact.
        let partial = tempfile::Builder::new()
            .prefix(".")
            .suffix(".part")
            .tempfile_in(self.store.dir())?;

        info!("🎚️ Transcoding: {}", track.title);
        let bitrate = format!("{}k", self.bitrate_kbps);
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(&input)
            .args(["-vn", "-b:a", &bitrate, "-f", "mp3"])
            .arg(partial.path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MaterializeError::Transcode(format!("failed to run {}: {e}", self.ffmpeg)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MaterializeError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        partial
            .persist(artifact.path())
            .map_err(|e| MaterializeError::from(e.error))?;
        info!("✅ Transcoded: {}", track.title);

        Ok(artifact)
    }
}

#[async_trait]
impl Materializer for SourceMaterializer {
    async fn materialize(
        &self,
        track: &ResolvedTrack,
        mode: PlaybackMode,
    ) -> Result<Payload, MaterializeError> {
        match mode {
            PlaybackMode::Streaming => Ok(Payload::Stream(track.source.clone())),
            PlaybackMode::Transcoded => self.transcode(track).await.map(Payload::File),
        }
    }
}
