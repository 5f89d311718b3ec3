pub mod spotify;
pub mod youtube;

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

use crate::error::ResolveError;

pub use spotify::SpotifyClient;
pub use youtube::YouTubeClient;

/// Where the playable audio for a track lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    pub url: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Page URL on the video provider; needs yt-dlp to reach the audio.
    YouTube,
    /// Direct media URL, readable as-is.
    Direct,
}

impl SourceHandle {
    pub fn youtube(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: SourceKind::YouTube,
        }
    }

    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: SourceKind::Direct,
        }
    }
}

/// Canonical metadata for a query, plus the handle to its audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrack {
    pub source: SourceHandle,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
    pub artwork: Option<String>,
}

impl ResolvedTrack {
    pub fn new(source: SourceHandle, title: impl Into<String>) -> Self {
        Self {
            source,
            title: title.into(),
            author: None,
            duration: None,
            artwork: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_artwork(mut self, artwork: impl Into<String>) -> Self {
        self.artwork = Some(artwork.into());
        self
    }
}

/// Track metadata from the cross-service catalog (Spotify). Carries no
/// playable audio; it only names what to search for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrack {
    pub name: String,
    pub artists: String,
    pub duration: Option<Duration>,
    pub artwork: Option<String>,
}

/// The shape of a query decides which provider handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// `open.spotify.com/track/...`
    SpotifyTrack,
    /// `open.spotify.com/playlist/...` or `/album/...`
    SpotifyCollection,
    /// `youtube.com/playlist?list=...`
    YouTubePlaylist,
    /// Single video page on the video provider.
    YouTubeVideo,
    /// Any other http(s) URL, played directly.
    DirectUrl,
    /// Free text, searched on the video provider.
    Search,
}

impl QueryKind {
    pub fn classify(query: &str) -> Self {
        let query = query.trim();
        let Ok(url) = Url::parse(query) else {
            return QueryKind::Search;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return QueryKind::Search;
        }

        let host = url.host_str().unwrap_or_default();
        if on_domain(host, "spotify.com") {
            let collection = url
                .path_segments()
                .into_iter()
                .flatten()
                .any(|segment| segment == "playlist" || segment == "album");
            return if collection {
                QueryKind::SpotifyCollection
            } else {
                QueryKind::SpotifyTrack
            };
        }

        if YouTubeClient::is_youtube_url(query) || on_domain(host, "youtube.com") {
            if url.path() == "/playlist" && url.query_pairs().any(|(k, _)| k == "list") {
                return QueryKind::YouTubePlaylist;
            }
            return QueryKind::YouTubeVideo;
        }

        QueryKind::DirectUrl
    }

    pub fn is_playlist(self) -> bool {
        matches!(self, QueryKind::YouTubePlaylist | QueryKind::SpotifyCollection)
    }
}

/// `host` is `domain` itself or one of its subdomains.
fn on_domain(host: &str, domain: &str) -> bool {
    host.strip_suffix(domain)
        .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
}

/// The video provider: turns searches and video URLs into playable tracks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// First search hit for free text.
    async fn search(&self, query: &str) -> Result<ResolvedTrack, ResolveError>;

    /// Metadata for a specific video URL.
    async fn lookup(&self, url: &str) -> Result<ResolvedTrack, ResolveError>;

    /// Ordered video URLs of a playlist, at most `limit` of them.
    async fn playlist(&self, url: &str, limit: usize) -> Result<Vec<String>, ResolveError>;
}

/// Cross-service catalog used only for naming tracks (Spotify).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackCatalog: Send + Sync {
    async fn track(&self, url: &str) -> Result<CatalogTrack, ResolveError>;

    /// Ordered track links of a playlist or album, at most `limit` of them.
    async fn collection(&self, url: &str, limit: usize) -> Result<Vec<String>, ResolveError>;
}

/// What the playback core needs from metadata lookup.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError>;

    /// Expands a playlist reference into one query per entry, in source order.
    async fn expand_playlist(&self, url: &str) -> Result<Vec<String>, ResolveError>;

    fn is_playlist(&self, query: &str) -> bool {
        QueryKind::classify(query).is_playlist()
    }
}

/// Dispatches queries to the provider their shape implies.
pub struct SourceManager {
    video: Arc<dyn VideoProvider>,
    catalog: Option<Arc<dyn TrackCatalog>>,
    playlist_limit: usize,
}

impl SourceManager {
    pub fn new(
        video: Arc<dyn VideoProvider>,
        catalog: Option<Arc<dyn TrackCatalog>>,
        playlist_limit: usize,
    ) -> Self {
        Self {
            video,
            catalog,
            playlist_limit,
        }
    }

    fn catalog(&self) -> Result<&Arc<dyn TrackCatalog>, ResolveError> {
        self.catalog
            .as_ref()
            .ok_or_else(|| ResolveError::Upstream("Spotify credentials are not configured".into()))
    }

    /// Spotify only names the track; the audio comes from a video search on
    /// "name artists". Spotify metadata wins where it is present.
    async fn resolve_spotify(&self, url: &str) -> Result<ResolvedTrack, ResolveError> {
        let info = self.catalog()?.track(url).await?;
        let search = format!("{} {}", info.name, info.artists);
        debug!("🔁 Spotify track mapped to search: {}", search);

        let found = self.video.search(&search).await?;
        Ok(ResolvedTrack {
            source: found.source,
            title: info.name,
            author: Some(info.artists).filter(|a| !a.is_empty()).or(found.author),
            duration: info.duration.or(found.duration),
            artwork: info.artwork.or(found.artwork),
        })
    }
}

#[async_trait]
impl MetadataResolver for SourceManager {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
        let query = query.trim();
        match QueryKind::classify(query) {
            QueryKind::SpotifyTrack => self.resolve_spotify(query).await,
            QueryKind::YouTubeVideo => self.video.lookup(query).await,
            QueryKind::DirectUrl => Ok(direct_track(query)),
            QueryKind::Search => self.video.search(query).await,
            QueryKind::YouTubePlaylist | QueryKind::SpotifyCollection => Err(ResolveError::Upstream(
                format!("`{query}` is a playlist, expand it before resolving"),
            )),
        }
    }

    async fn expand_playlist(&self, url: &str) -> Result<Vec<String>, ResolveError> {
        let url = url.trim();
        let entries = match QueryKind::classify(url) {
            QueryKind::SpotifyCollection => {
                self.catalog()?.collection(url, self.playlist_limit).await?
            }
            _ => self.video.playlist(url, self.playlist_limit).await?,
        };

        if entries.is_empty() {
            return Err(ResolveError::NotFound(url.to_string()));
        }

        info!("📋 Playlist expanded into {} entries", entries.len());
        Ok(entries.into_iter().take(self.playlist_limit).collect())
    }
}

/// Direct media links have no provider metadata; the file name stands in for
/// the title.
fn direct_track(url: &str) -> ResolvedTrack {
    let title = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| url.to_string());

    ResolvedTrack::new(SourceHandle::direct(url), title)
}
