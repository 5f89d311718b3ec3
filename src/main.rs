use anyhow::{Context as _, Result};
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;
mod ui;

use crate::{
    audio::{
        materializer::{ArtifactStore, SourceMaterializer},
        output::SongbirdConnector,
        player::PlaybackEngine,
    },
    bot::Jukebox,
    cache::{CacheSettings, PreprocessCache},
    config::Config,
    sources::{spotify::SpotifyClient, youtube::YouTubeClient, MetadataResolver, SourceManager, TrackCatalog},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Jukebox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let http = reqwest::Client::builder()
        .user_agent(concat!("jukebox/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("could not build the HTTP client")?;

    // Metadata resolution
    let youtube = Arc::new(YouTubeClient::new(config.ytdlp_path.clone()));
    let catalog = config.spotify.as_ref().map(|credentials| {
        Arc::new(SpotifyClient::new(
            http.clone(),
            credentials.client_id.clone(),
            credentials.client_secret.clone(),
        )) as Arc<dyn TrackCatalog>
    });
    if catalog.is_none() {
        info!("Spotify credentials not set, Spotify links will be rejected");
    }
    let resolver: Arc<dyn MetadataResolver> = Arc::new(SourceManager::new(
        youtube.clone(),
        catalog,
        config.max_playlist_size,
    ));

    // Materialization and the preprocessing cache
    let store = ArtifactStore::open(&config.transcode_dir)
        .with_context(|| format!("could not open {}", config.transcode_dir.display()))?;
    let materializer = Arc::new(SourceMaterializer::new(
        youtube,
        store,
        config.ffmpeg_path.clone(),
        config.transcode_bitrate_kbps,
    ));
    let cache = Arc::new(PreprocessCache::new(
        resolver.clone(),
        materializer,
        CacheSettings {
            mode: config.playback_mode,
            ttl: config.cache_ttl,
            resolve_timeout: config.resolve_timeout,
            concurrency: config.preprocess_concurrency,
        },
    ));

    let shutdown = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(config.sweep_interval, shutdown.clone());

    // Voice output
    let songbird = Songbird::serenity();
    let connector = Arc::new(SongbirdConnector::new(
        songbird.clone(),
        http,
        config.ytdlp_path.clone(),
        config.default_volume,
    ));

    let engine = PlaybackEngine::new(cache, resolver, connector, config.max_queue_size);
    let handler = Jukebox::new(engine, config.prefix.clone());

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await
        .context("could not build the Discord client")?;

    let shard_manager = client.shard_manager.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        signal_shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Jukebox started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Cache sweeper ended abnormally: {:?}", e);
    }

    Ok(())
}

/// Checks that the external tools are runnable.
async fn health_check(config: &Config) -> Result<()> {
    let yt_dlp = async_process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("could not run {}", config.ytdlp_path))?;

    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await
        .with_context(|| format!("could not run {}", config.ffmpeg_path))?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("yt-dlp or ffmpeg is not working");
    }
}
