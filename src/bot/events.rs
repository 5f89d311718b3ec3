use serenity::{builder::CreateMessage, http::Http, model::id::ChannelId};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use crate::{
    audio::player::{AdvanceOutcome, PlayerEvent},
    ui::embeds,
};

pub const QUEUE_FINISHED: &str = "Queue finished, leaving the voice channel.";

/// Messages announcing the result of an advance.
pub fn advance_messages(outcome: &AdvanceOutcome) -> Vec<CreateMessage> {
    let mut messages = Vec::new();

    match outcome {
        AdvanceOutcome::Playing {
            now_playing,
            skipped,
        } => {
            if let Some(notice) = embeds::skipped_notice(skipped) {
                messages.push(CreateMessage::new().content(notice));
            }
            messages.push(CreateMessage::new().embed(embeds::create_now_playing_embed(now_playing)));
        }
        AdvanceOutcome::Drained { skipped } => {
            if let Some(notice) = embeds::skipped_notice(skipped) {
                messages.push(CreateMessage::new().content(notice));
            }
            messages.push(CreateMessage::new().content(QUEUE_FINISHED));
        }
        AdvanceOutcome::Cancelled => {}
    }

    messages
}

pub async fn send_all(http: &Http, channel_id: ChannelId, messages: Vec<CreateMessage>) {
    for message in messages {
        if let Err(e) = channel_id.send_message(http, message).await {
            error!("Failed to send message to channel {}: {:?}", channel_id, e);
        }
    }
}

/// Forwards device-driven advances to the text channel of the session that
/// produced them. Runs until the engine is dropped.
pub async fn announce_player_events(http: Arc<Http>, mut events: broadcast::Receiver<PlayerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                send_all(&http, event.text_channel, advance_messages(&event.outcome)).await;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Announcer fell behind, {} player events dropped", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("Player event announcer stopped");
}
