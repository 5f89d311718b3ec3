use anyhow::Result;
use serenity::{
    builder::CreateMessage,
    model::{
        channel::Message,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    audio::player::{CallerContext, EnqueueOutcome, SkipOutcome, StopOutcome},
    bot::{commands::Command, events, Jukebox},
    ui::embeds,
};

pub const UNKNOWN_COMMAND: &str = "That command does not exist.";
pub const MISSING_QUERY: &str = "Please provide a song to play!";
pub const COMMAND_FAILED: &str = "There was an error trying to execute that command!";

/// Runs a parsed command for a guild message.
pub async fn handle_command(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    command: Command,
    bot: &Jukebox,
) -> Result<()> {
    info!(
        "📝 Command {}{} used by {} in guild {}",
        bot.prefix(),
        command.name(),
        msg.author.name,
        guild_id
    );

    match command {
        Command::Play { query } => handle_play(ctx, msg, guild_id, &query, bot).await?,
        Command::Stop => handle_stop(ctx, msg, guild_id, bot).await?,
        Command::Skip => handle_skip(ctx, msg, guild_id, bot).await?,
        Command::Queue => handle_queue(ctx, msg, guild_id, bot).await?,
        Command::Help => handle_help(ctx, msg, bot).await?,
        Command::Unknown(_) => {
            msg.reply(&ctx.http, UNKNOWN_COMMAND).await?;
        }
    }

    Ok(())
}

async fn handle_play(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    query: &str,
    bot: &Jukebox,
) -> Result<()> {
    if query.is_empty() {
        msg.reply(&ctx.http, MISSING_QUERY).await?;
        return Ok(());
    }

    let caller = CallerContext {
        guild_id,
        user_id: msg.author.id,
        voice_channel: get_user_voice_channel(ctx, guild_id, msg.author.id),
        text_channel: msg.channel_id,
    };

    // Typing indicator while the first track resolves
    let _typing = msg.channel_id.start_typing(&ctx.http);

    match bot.engine.enqueue(&caller, query).await {
        Ok(outcome) => {
            events::send_all(&ctx.http, msg.channel_id, enqueue_messages(query, &outcome)).await;
        }
        Err(e) => {
            warn!("Play request failed in guild {} ({:?}): {}", guild_id, e.kind(), e);
            msg.reply(&ctx.http, embeds::error_message(&e)).await?;
        }
    }

    Ok(())
}

async fn handle_stop(ctx: &Context, msg: &Message, guild_id: GuildId, bot: &Jukebox) -> Result<()> {
    let reply = match bot.engine.stop(guild_id).await {
        StopOutcome::Stopped => "⏹️ Stopped playback and cleared the queue.",
        StopOutcome::NothingToStop => "There is nothing to stop.",
    };
    msg.channel_id.say(&ctx.http, reply).await?;

    Ok(())
}

async fn handle_skip(ctx: &Context, msg: &Message, guild_id: GuildId, bot: &Jukebox) -> Result<()> {
    let reply = match bot.engine.skip(guild_id).await {
        Ok(SkipOutcome::Skipped) => "⏭️ Skipped.".to_string(),
        Err(e) => embeds::error_message(&e),
    };
    msg.channel_id.say(&ctx.http, reply).await?;

    Ok(())
}

async fn handle_queue(ctx: &Context, msg: &Message, guild_id: GuildId, bot: &Jukebox) -> Result<()> {
    let snapshot = bot.engine.queue_snapshot(guild_id);
    let embed = embeds::create_queue_embed(&snapshot, bot.prefix());

    msg.channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await?;

    Ok(())
}

async fn handle_help(ctx: &Context, msg: &Message, bot: &Jukebox) -> Result<()> {
    let embed = embeds::create_help_embed(bot.prefix());

    msg.channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await?;

    Ok(())
}

/// Replies for a successful enqueue.
fn enqueue_messages(query: &str, outcome: &EnqueueOutcome) -> Vec<CreateMessage> {
    match outcome {
        EnqueueOutcome::Queued { position } => {
            vec![CreateMessage::new().content(embeds::queued_message(*position, query))]
        }
        EnqueueOutcome::PlaylistQueued { added, .. } => {
            vec![CreateMessage::new().content(embeds::playlist_message(*added))]
        }
        EnqueueOutcome::Started { added, outcome } => {
            let mut messages = Vec::new();
            if *added > 1 {
                messages.push(CreateMessage::new().content(embeds::playlist_message(*added)));
            }
            messages.extend(events::advance_messages(outcome));
            messages
        }
        // The stop command already replied
        EnqueueOutcome::Cancelled => Vec::new(),
    }
}

/// The voice channel `user_id` is connected to, read from the guild cache.
fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
