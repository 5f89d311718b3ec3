use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::audio::materializer::PlaybackMode;

#[derive(Debug, Clone)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub prefix: String,

    // Playback
    pub playback_mode: PlaybackMode,
    pub default_volume: f32,
    pub max_queue_size: Option<usize>,
    pub max_playlist_size: usize,

    // Transcoding
    pub transcode_dir: PathBuf,
    pub transcode_bitrate_kbps: u32,

    // Preprocessing cache
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub resolve_timeout: Duration,
    pub preprocess_concurrency: usize,

    // Providers
    pub spotify: Option<SpotifyCredentials>,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let spotify = match (optional("SPOTIFY_CLIENT_ID"), optional("SPOTIFY_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(SpotifyCredentials {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            prefix: optional("COMMAND_PREFIX").unwrap_or(defaults.prefix),

            playback_mode: var_or("PLAYBACK_MODE", defaults.playback_mode)?,
            default_volume: var_or("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: optional("MAX_QUEUE_SIZE")
                .map(|v| v.parse().context("MAX_QUEUE_SIZE must be a number"))
                .transpose()?,
            max_playlist_size: var_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,

            transcode_dir: optional("TRANSCODE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transcode_dir),
            transcode_bitrate_kbps: var_or("TRANSCODE_BITRATE", defaults.transcode_bitrate_kbps)?,

            cache_ttl: Duration::from_secs(var_or("CACHE_TTL", defaults.cache_ttl.as_secs())?),
            sweep_interval: Duration::from_secs(var_or(
                "CACHE_SWEEP_INTERVAL",
                defaults.sweep_interval.as_secs(),
            )?),
            resolve_timeout: Duration::from_secs(var_or(
                "RESOLVE_TIMEOUT",
                defaults.resolve_timeout.as_secs(),
            )?),
            preprocess_concurrency: var_or("PREPROCESS_CONCURRENCY", defaults.preprocess_concurrency)?,

            spotify,
            ytdlp_path: optional("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: optional("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
        };

        // Validate configuration before touching the filesystem
        config.validate()?;
        std::fs::create_dir_all(&config.transcode_dir).with_context(|| {
            format!("could not create {}", config.transcode_dir.display())
        })?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Transcode bitrate must be between 8 and 510 kbps
    /// - TTL, resolve timeout, sweep interval and concurrency must be > 0
    /// - Playlist cap must be > 0, queue limit (when set) must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN is empty");
        }

        if self.prefix.trim().is_empty() {
            anyhow::bail!("Command prefix cannot be empty");
        }

        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 2.0, got: {}", self.default_volume);
        }

        if !(8..=510).contains(&self.transcode_bitrate_kbps) {
            anyhow::bail!(
                "Transcode bitrate must be between 8 and 510 kbps, got: {}",
                self.transcode_bitrate_kbps
            );
        }

        if self.cache_ttl.is_zero() {
            anyhow::bail!("Cache TTL must be greater than 0");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("Cache sweep interval must be greater than 0");
        }

        if self.resolve_timeout.is_zero() {
            anyhow::bail!("Resolve timeout must be greater than 0");
        }

        if self.preprocess_concurrency == 0 {
            anyhow::bail!("Preprocess concurrency must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.max_queue_size == Some(0) {
            anyhow::bail!("Max queue size must be greater than 0 (leave it unset for no limit)");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging. Secrets
    /// are left out.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Commands: prefix `{}`\n  \
            Playback: {} mode, {}% vol, queue limit {}, playlist cap {}\n  \
            Transcode: {} at {}kbps\n  \
            Cache: {}s TTL, sweep every {}s, {}s resolve timeout, {} workers\n  \
            Providers: Spotify={}, yt-dlp={}, ffmpeg={}",
            self.prefix,
            self.playback_mode,
            (self.default_volume * 100.0) as u32,
            self.max_queue_size.map_or("none".to_string(), |n| n.to_string()),
            self.max_playlist_size,
            self.transcode_dir.display(),
            self.transcode_bitrate_kbps,
            self.cache_ttl.as_secs(),
            self.sweep_interval.as_secs(),
            self.resolve_timeout.as_secs(),
            self.preprocess_concurrency,
            self.spotify.is_some(),
            self.ytdlp_path,
            self.ffmpeg_path,
        )
    }
}

/// Default configuration values, used when a variable is not set.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no default token - must be provided)
            discord_token: String::new(),
            prefix: "!".to_string(),

            playback_mode: PlaybackMode::Streaming,
            default_volume: 0.5,
            max_queue_size: None,
            max_playlist_size: 50, // one provider page

            transcode_dir: "./ffmpeg_tmp".into(),
            transcode_bitrate_kbps: 320,

            cache_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            resolve_timeout: Duration::from_secs(60),
            preprocess_concurrency: 3,

            spotify: None,
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

/// A set, non-blank environment variable.
fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {key} (`{raw}`): {e}"))
}
