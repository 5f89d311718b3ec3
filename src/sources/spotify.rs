use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::{CatalogTrack, TrackCatalog};
use crate::error::ResolveError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";
/// Largest page the collection endpoints hand out in one request.
const PAGE_LIMIT: usize = 50;

/// Spotify Web API client using the client-credentials flow.
pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<AccessToken>>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    artists: Vec<SpotifyArtist>,
    duration_ms: Option<u64>,
    album: Option<SpotifyAlbum>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<LinkedTrack>,
}

#[derive(Debug, Deserialize)]
struct LinkedTrack {
    external_urls: ExternalUrls,
}

#[derive(Debug, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

/// Kind of Spotify object a link points at, with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpotifyRef {
    Track(String),
    Playlist(String),
    Album(String),
}

impl SpotifyClient {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            token: RwLock::new(None),
        }
    }

    /// Returns a valid bearer token, requesting a new one when the cached one
    /// is about to expire.
    async fn access_token(&self) -> Result<String, ResolveError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ResolveError::Upstream(format!("Spotify token request failed: {e}")))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::Upstream(format!("Spotify token response: {e}")))?;

        info!("🔑 Spotify access token acquired");
        // Refresh a minute early so in-flight requests never carry a stale token
        let lifetime = Duration::from_secs(body.expires_in.saturating_sub(60));
        *slot = Some(AccessToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(body.access_token)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, subject: &str) -> Result<T, ResolveError> {
        let token = self.access_token().await?;
        let url = format!("{API_BASE}{path}");
        debug!("🎧 Spotify GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(format!("Spotify request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                Err(ResolveError::NotFound(subject.to_string()))
            }
            status if !status.is_success() => {
                Err(ResolveError::Upstream(format!("Spotify returned {status}")))
            }
            _ => response
                .json()
                .await
                .map_err(|e| ResolveError::Upstream(format!("Spotify response: {e}"))),
        }
    }
}

#[async_trait]
impl TrackCatalog for SpotifyClient {
    async fn track(&self, url: &str) -> Result<CatalogTrack, ResolveError> {
        let SpotifyRef::Track(id) = parse_link(url)? else {
            return Err(ResolveError::NotFound(url.to_string()));
        };

        let track: SpotifyTrack = self.get(&format!("/tracks/{id}"), url).await?;
        Ok(to_catalog_track(track))
    }

    async fn collection(&self, url: &str, limit: usize) -> Result<Vec<String>, ResolveError> {
        let limit = limit.clamp(1, PAGE_LIMIT);
        let links = match parse_link(url)? {
            SpotifyRef::Playlist(id) => {
                let page: Page<PlaylistItem> = self
                    .get(&format!("/playlists/{id}/tracks?limit={limit}"), url)
                    .await?;
                page.items
                    .into_iter()
                    .filter_map(|item| item.track)
                    .filter_map(|track| track.external_urls.spotify)
                    .collect()
            }
            SpotifyRef::Album(id) => {
                let page: Page<LinkedTrack> = self
                    .get(&format!("/albums/{id}/tracks?limit={limit}"), url)
                    .await?;
                page.items
                    .into_iter()
                    .filter_map(|track| track.external_urls.spotify)
                    .collect()
            }
            SpotifyRef::Track(_) => vec![url.to_string()],
        };

        Ok(links)
    }
}

fn to_catalog_track(track: SpotifyTrack) -> CatalogTrack {
    let artists = track
        .artists
        .iter()
        .map(|artist| artist.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    CatalogTrack {
        name: track.name,
        artists,
        duration: track.duration_ms.map(Duration::from_millis),
        artwork: track
            .album
            .and_then(|album| album.images.into_iter().next())
            .map(|image| image.url),
    }
}

/// Extracts the object kind and id from an `open.spotify.com` link. Locale
/// prefixes (`/intl-de/track/...`) and query strings are ignored.
fn parse_link(link: &str) -> Result<SpotifyRef, ResolveError> {
    let not_found = || ResolveError::NotFound(link.to_string());
    let url = Url::parse(link.trim()).map_err(|_| not_found())?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    segments
        .windows(2)
        .find_map(|pair| match pair {
            ["track", id] => Some(SpotifyRef::Track(id.to_string())),
            ["playlist", id] => Some(SpotifyRef::Playlist(id.to_string())),
            ["album", id] => Some(SpotifyRef::Album(id.to_string())),
            _ => None,
        })
        .ok_or_else(not_found)
}
