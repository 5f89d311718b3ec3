//! Rendering of engine results into Discord replies.

pub mod embeds;
