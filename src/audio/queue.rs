use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::error::PlaybackError;

/// One play request. Immutable once created; a playlist produces one per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRequest {
    pub query: String,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
}

impl TrackRequest {
    pub fn new(query: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            query: query.into(),
            requested_by,
            requested_at: Utc::now(),
        }
    }
}

/// A request as it sits in the queue. The ticket tells apart two identical
/// queries queued one after the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTrack {
    pub ticket: u64,
    pub request: TrackRequest,
}

/// Ordered pending requests for one guild. Holds no audio state: the head is
/// the track about to play and leaves the queue only once the output device
/// has it.
#[derive(Debug)]
pub struct GuildQueue {
    items: VecDeque<QueuedTrack>,
    next_ticket: u64,
    max_size: Option<usize>,
}

impl GuildQueue {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            next_ticket: 0,
            max_size,
        }
    }

    /// Appends a request and returns its 1-based position.
    pub fn enqueue(&mut self, request: TrackRequest) -> Result<usize, PlaybackError> {
        if let Some(limit) = self.max_size {
            if self.items.len() >= limit {
                return Err(PlaybackError::QueueFull { limit });
            }
        }

        info!("➕ Queued: {}", request.query);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.items.push_back(QueuedTrack { ticket, request });

        Ok(self.items.len())
    }

    /// Appends as many requests as fit. Returns the position of the first one
    /// and how many were added.
    pub fn enqueue_many(
        &mut self,
        requests: impl IntoIterator<Item = TrackRequest>,
    ) -> Result<(usize, usize), PlaybackError> {
        let first_position = self.items.len() + 1;
        let mut added = 0;

        for request in requests {
            match self.enqueue(request) {
                Ok(_) => added += 1,
                Err(err) if added == 0 => return Err(err),
                Err(_) => break,
            }
        }

        Ok((first_position, added))
    }

    pub fn peek_head(&self) -> Option<&QueuedTrack> {
        self.items.front()
    }

    pub fn dequeue_head(&mut self) -> Option<QueuedTrack> {
        let head = self.items.pop_front();
        if let Some(head) = &head {
            debug!("➡️ Dequeued: {}", head.request.query);
        }
        head
    }

    /// Dequeues the head only if it is still the given ticket.
    pub fn dequeue_ticket(&mut self, ticket: u64) -> Option<QueuedTrack> {
        match self.items.front() {
            Some(head) if head.ticket == ticket => self.dequeue_head(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            info!("🗑️ Cleared {} queued tracks", self.items.len());
        }
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Requests in play order.
    pub fn pending(&self) -> Vec<TrackRequest> {
        self.items.iter().map(|item| item.request.clone()).collect()
    }
}
