//! Output device and voice connector seams.
//!
//! The engine only talks to [`VoiceConnector`] and [`OutputConnection`]. The
//! songbird implementations live here too; device callbacks never call back
//! into the engine, they post [`DeviceEvent`]s on the session's channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{File, HttpRequest, Input, YoutubeDl},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::{
    audio::materializer::Payload,
    error::PlaybackError,
    sources::SourceKind,
};

/// Notification from the output device. The generation identifies which
/// `play` call the event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Idle { generation: u64 },
    Error { generation: u64, details: String },
}

impl DeviceEvent {
    pub fn generation(&self) -> u64 {
        match self {
            DeviceEvent::Idle { generation } | DeviceEvent::Error { generation, .. } => *generation,
        }
    }
}

/// Handed to the device with every payload; reports how that payload ended.
#[derive(Debug, Clone)]
pub struct DeviceEventSink {
    tx: mpsc::UnboundedSender<DeviceEvent>,
    generation: u64,
}

impl DeviceEventSink {
    pub fn new(tx: mpsc::UnboundedSender<DeviceEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn idle(&self) {
        // The session may already be gone; nobody is left to advance
        let _ = self.tx.send(DeviceEvent::Idle {
            generation: self.generation,
        });
    }

    pub fn error(&self, details: impl Into<String>) {
        let _ = self.tx.send(DeviceEvent::Error {
            generation: self.generation,
            details: details.into(),
        });
    }
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Box<dyn OutputConnection>, PlaybackError>;
}

/// A joined voice channel that can play one payload at a time.
#[async_trait]
pub trait OutputConnection: Send + Sync {
    /// Starts `payload`, replacing whatever was playing. Completion and
    /// errors are reported through `events`.
    async fn play(&self, payload: &Payload, events: DeviceEventSink) -> Result<(), PlaybackError>;

    /// Stops the current payload. The device reports it as idle.
    async fn stop_current(&self);

    /// Leaves the channel.
    async fn destroy(&self);
}

pub struct SongbirdConnector {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    ytdlp: &'static str,
    volume: f32,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client, ytdlp: String, volume: f32) -> Self {
        Self {
            manager,
            http,
            // songbird keeps the program name for the lifetime of every input
            ytdlp: Box::leak(ytdlp.into_boxed_str()),
            volume,
        }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Box<dyn OutputConnection>, PlaybackError> {
        info!("🔊 Joining voice channel {} in guild {}", channel_id, guild_id);

        match self.manager.join(guild_id, channel_id).await {
            Ok(call) => Ok(Box::new(SongbirdOutput {
                guild_id,
                call,
                manager: Arc::clone(&self.manager),
                http: self.http.clone(),
                ytdlp: self.ytdlp,
                volume: self.volume,
                current: Mutex::new(None),
            })),
            Err(e) => {
                // A failed join can leave a half-registered call behind
                let _ = self.manager.remove(guild_id).await;
                Err(PlaybackError::Connect(e.to_string()))
            }
        }
    }
}

struct SongbirdOutput {
    guild_id: GuildId,
    call: Arc<AsyncMutex<Call>>,
    manager: Arc<Songbird>,
    http: reqwest::Client,
    ytdlp: &'static str,
    volume: f32,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdOutput {
    fn input_for(&self, payload: &Payload) -> Input {
        match payload {
            Payload::Stream(source) => match source.kind {
                SourceKind::YouTube => {
                    YoutubeDl::new_ytdl_like(self.ytdlp, self.http.clone(), source.url.clone()).into()
                }
                SourceKind::Direct => HttpRequest::new(self.http.clone(), source.url.clone()).into(),
            },
            Payload::File(artifact) => File::new(artifact.path().to_path_buf()).into(),
        }
    }
}

#[async_trait]
impl OutputConnection for SongbirdOutput {
    async fn play(&self, payload: &Payload, events: DeviceEventSink) -> Result<(), PlaybackError> {
        let input = self.input_for(payload);

        let handle = {
            let mut call = self.call.lock().await;
            call.stop();
            call.play_input(input)
        };

        if let Err(e) = handle.set_volume(self.volume) {
            warn!("⚠️ Could not set volume in guild {}: {}", self.guild_id, e);
        }

        handle
            .add_event(Event::Track(TrackEvent::End), TrackEndNotifier { sink: events.clone() })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        handle
            .add_event(Event::Track(TrackEvent::Error), TrackErrorNotifier { sink: events })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        *self.current.lock() = Some(handle);
        Ok(())
    }

    async fn stop_current(&self) {
        let current = self.current.lock().take();
        if let Some(handle) = current {
            if let Err(e) = handle.stop() {
                debug!("Track in guild {} was already finished: {}", self.guild_id, e);
            }
        }
    }

    async fn destroy(&self) {
        self.current.lock().take();
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!("Voice connection for guild {} already gone: {}", self.guild_id, e);
        }
        info!("👋 Left voice in guild {}", self.guild_id);
    }
}

struct TrackEndNotifier {
    sink: DeviceEventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!("Track finished (generation {})", self.sink.generation());
        self.sink.idle();
        None
    }
}

struct TrackErrorNotifier {
    sink: DeviceEventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackErrorNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let details = match ctx {
            EventContext::Track(tracks) => tracks
                .first()
                .map(|(state, _)| format!("{:?}", state.playing))
                .unwrap_or_else(|| "unknown track error".to_string()),
            _ => "unknown track error".to_string(),
        };

        warn!("💥 Track error (generation {}): {}", self.sink.generation(), details);
        self.sink.error(details);
        None
    }
}
