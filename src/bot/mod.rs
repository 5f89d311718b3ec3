//! # Bot Module
//!
//! Discord front end for Jukebox.
//!
//! [`Jukebox`] implements Serenity's [`EventHandler`]:
//! - `message`: parses prefix commands and routes them to the playback engine
//! - `ready`: starts the task that announces device-driven advances
//! - `voice_state_update`: tears the session down when the bot is removed
//!   from a voice channel

use parking_lot::Mutex;
use serenity::{
    all::{Context, EventHandler, Message, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::audio::player::{PlaybackEngine, PlayerEvent};
use commands::Command;

pub struct Jukebox {
    pub engine: Arc<PlaybackEngine>,
    prefix: String,
    /// Taken by the first `ready`; reconnects keep the running announcer.
    announcements: Mutex<Option<broadcast::Receiver<PlayerEvent>>>,
}

impl Jukebox {
    pub fn new(engine: Arc<PlaybackEngine>, prefix: impl Into<String>) -> Self {
        let announcements = Mutex::new(Some(engine.subscribe()));
        Self {
            engine,
            prefix: prefix.into(),
            announcements,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl EventHandler for Jukebox {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());

        let receiver = self.announcements.lock().take();
        if let Some(receiver) = receiver {
            tokio::spawn(events::announce_player_events(ctx.http.clone(), receiver));
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(command) = Command::parse(&msg.content, &self.prefix) else {
            return;
        };

        if let Err(e) = handlers::handle_command(&ctx, &msg, guild_id, command, self).await {
            error!("Error handling command in guild {}: {:?}", guild_id, e);
            if let Err(e) = msg.reply(&ctx.http, handlers::COMMAND_FAILED).await {
                error!("Could not report the failure: {:?}", e);
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot disconnected from voice in guild {}", guild_id);
            self.engine.handle_disconnect(guild_id).await;
        }
    }
}
