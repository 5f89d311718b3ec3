use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::player::{NowPlaying, PlaybackStatus, QueueSnapshot, SkippedTrack},
    error::PlaybackError,
};

/// Color palette shared by every embed
pub mod colors {
    use serenity::all::Colour;

    pub const NOW_PLAYING_GOLD: Colour = Colour::GOLD;
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 Jukebox";
/// Pending entries listed by the queue embed.
const QUEUE_PREVIEW: usize = 10;

pub fn create_now_playing_embed(track: &NowPlaying) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title(truncate(&format!("Now playing: {}", track.title), 256))
        .url(&track.url)
        .description(format!("Requested by <@{}>", track.requester))
        .color(colors::NOW_PLAYING_GOLD)
        .field("Author", track.author.as_deref().unwrap_or("Unknown"), true)
        .field("Duration", duration_label(track.duration), true);

    if let Some(artwork) = &track.artwork {
        embed = embed.thumbnail(artwork);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn create_queue_embed(snapshot: &QueueSnapshot, prefix: &str) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title("📋 Queue")
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now());

    if snapshot.status == PlaybackStatus::Idle && snapshot.pending.is_empty() {
        return embed
            .description(format!("😴 **The queue is empty**\n\nUse `{prefix}play <song>` to add music"))
            .color(colors::NEUTRAL_GRAY);
    }

    let mut embed = embed;
    if let Some(current) = &snapshot.now_playing {
        embed = embed.field("▶️ Playing", now_playing_line(current), false);
    }

    let lines = queue_lines(snapshot);
    if !lines.is_empty() {
        embed = embed.field("Up next", lines.join("\n"), false);
    }

    embed.field(
        "Total",
        format!("{} pending", snapshot.pending.len()),
        false,
    )
}

pub fn create_help_embed(prefix: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Jukebox")
        .color(colors::INFO_BLUE)
        .description("Plays music from searches, links and playlists")
        .field(
            "Commands",
            format!(
                "• `{prefix}play <song or link>` - Plays a song or adds it to the queue\n\
                • `{prefix}skip` - Skips the current song\n\
                • `{prefix}stop` - Stops playback and clears the queue\n\
                • `{prefix}queue` - Shows the queue\n\
                • `{prefix}help` - Shows this message"
            ),
            false,
        )
        .field(
            "Supported sources",
            "• YouTube searches, videos and playlists\n\
            • Spotify tracks, playlists and albums\n\
            • Direct audio URLs",
            false,
        )
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Reply text for a failed command.
pub fn error_message(error: &PlaybackError) -> String {
    match error {
        PlaybackError::NoVoiceChannel => "You need to be in a voice channel to play music!".to_string(),
        PlaybackError::NothingPlaying => "I'm not playing anything right now.".to_string(),
        PlaybackError::QueueFull { limit } => format!("The queue is full ({limit} songs)."),
        PlaybackError::Playlist(_) => {
            "Something went wrong processing the playlist. Check the link and try again.".to_string()
        }
        other => format!("Something went wrong: {other}"),
    }
}

pub fn queued_message(position: usize, query: &str) -> String {
    format!("Added to queue (#{position}): {query}")
}

pub fn playlist_message(added: usize) -> String {
    if added == 1 {
        "Added 1 song from the playlist to the queue.".to_string()
    } else {
        format!("Added {added} songs from the playlist to the queue.")
    }
}

/// One line per entry that had to be skipped, or `None` when nothing was.
pub fn skipped_notice(skipped: &[SkippedTrack]) -> Option<String> {
    if skipped.is_empty() {
        return None;
    }

    let lines: Vec<String> = skipped
        .iter()
        .map(|s| format!("⚠️ Skipped `{}`: {}", s.query, s.error))
        .collect();
    Some(lines.join("\n"))
}

fn now_playing_line(track: &NowPlaying) -> String {
    match &track.author {
        Some(author) => format!("**{}** - {}", track.title, author),
        None => format!("**{}**", track.title),
    }
}

fn queue_lines(snapshot: &QueueSnapshot) -> Vec<String> {
    let mut lines: Vec<String> = snapshot
        .pending
        .iter()
        .take(QUEUE_PREVIEW)
        .enumerate()
        .map(|(i, request)| format!("**{}**. {} (<@{}>)", i + 1, request.query, request.requested_by))
        .collect();

    let hidden = snapshot.pending.len().saturating_sub(QUEUE_PREVIEW);
    if hidden > 0 {
        lines.push(format!("…and {hidden} more"));
    }
    lines
}

fn duration_label(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) => format_duration(duration),
        None => "🔴 Live".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

/// `h:mm:ss` when the duration reaches an hour, `m:ss` otherwise.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::queue::TrackRequest, error::{ResolveError, TrackError}};
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn now_playing() -> NowPlaying {
        NowPlaying {
            title: "One More Time".into(),
            author: Some("Daft Punk".into()),
            duration: Some(Duration::from_secs(320)),
            artwork: None,
            url: "https://www.youtube.com/watch?v=FGBhQbmPwH8".into(),
            requester: UserId::new(42),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1:00:00");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 7 * 60 + 9)), "3:07:09");
        assert_eq!(duration_label(None), "🔴 Live");
    }

    #[test]
    fn test_queue_lines_are_numbered_and_capped() {
        let snapshot = QueueSnapshot {
            status: PlaybackStatus::Playing,
            now_playing: Some(now_playing()),
            pending: (1..=12)
                .map(|i| TrackRequest::new(format!("song {i}"), UserId::new(7)))
                .collect(),
        };
        let lines = queue_lines(&snapshot);

        assert_eq!(lines.len(), QUEUE_PREVIEW + 1);
        assert_eq!(lines[0], "**1**. song 1 (<@7>)");
        assert_eq!(lines[QUEUE_PREVIEW], "…and 2 more");
        assert_eq!(now_playing_line(&now_playing()), "**One More Time** - Daft Punk");
    }

    #[test]
    fn test_skipped_notice() {
        assert_eq!(skipped_notice(&[]), None);

        let skipped = [SkippedTrack {
            query: "zzzz".into(),
            error: TrackError::Resolve(ResolveError::NotFound("zzzz".into())),
        }];
        assert_eq!(
            skipped_notice(&skipped).unwrap(),
            "⚠️ Skipped `zzzz`: no results found for `zzzz`"
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(queued_message(2, "Song B"), "Added to queue (#2): Song B");
        assert_eq!(playlist_message(1), "Added 1 song from the playlist to the queue.");
        assert_eq!(playlist_message(10), "Added 10 songs from the playlist to the queue.");
        assert_eq!(
            error_message(&PlaybackError::NoVoiceChannel),
            "You need to be in a voice channel to play music!"
        );
        assert_eq!(
            error_message(&PlaybackError::QueueFull { limit: 100 }),
            "The queue is full (100 songs)."
        );
    }

    #[test]
    fn test_truncate_long_titles() {
        assert_eq!(truncate("short", 10), "short");
        let long = truncate(&"a".repeat(300), 256);
        assert_eq!(long.chars().count(), 256);
        assert!(long.ends_with('…'));
    }
}
