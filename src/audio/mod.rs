//! # Audio Module
//!
//! Per-guild playback for Jukebox.
//!
//! ## Architecture
//!
//! ### [`player`] - Playback Engine
//! - One session per guild: queue, voice connection, playback status
//! - `advance` state machine driven by enqueues and device events
//! - Skip-on-failure: an entry that cannot be resolved never stalls the guild
//!
//! ### [`queue`] - Guild Queue
//! - Ordered pending requests, 1-based positions
//! - Optional size limit
//!
//! ### [`materializer`] - Source Materializer
//! - Streaming mode hands the source straight to the device
//! - Transcoded mode writes an mp3 artifact with ffmpeg
//! - Reference-counted artifact files, deleted with their last holder
//!
//! ### [`output`] - Output Device
//! - `VoiceConnector` / `OutputConnection` seams the engine plays through
//! - Songbird adapters posting track end/error events back to the session
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! # async fn example(engine: Arc<PlaybackEngine>, caller: CallerContext) -> anyhow::Result<()> {
//! let outcome = engine.enqueue(&caller, "daft punk one more time").await?;
//! println!("{outcome:?}");
//!
//! engine.skip(caller.guild_id).await?;
//! engine.stop(caller.guild_id).await;
//! # Ok(())
//! # }
//! ```

pub mod materializer;
pub mod output;
pub mod player;
pub mod queue;
