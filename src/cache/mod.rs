//! # Preprocessing Cache
//!
//! Resolves and materializes upcoming queue entries ahead of time so that a
//! queue advance does not wait on the network (or on ffmpeg).
//!
//! Entries are keyed by `(guild, query)`, so the same query in two guilds is
//! produced twice and never shared. A key is produced at most once at a time:
//! an in-flight marker is claimed before any work starts, and the synchronous
//! miss path ([`PreprocessCache::resolve_now`]) waits on that marker instead of
//! duplicating the work.
//!
//! Background jobs share `concurrency` permits across all guilds. A job still
//! waiting for a permit has not started, so the miss path takes it over and
//! produces the entry inline rather than queueing behind other guilds' work.
//!
//! Entries expire `ttl` after they were produced. [`PreprocessCache::sweep`]
//! drops expired entries unless someone still holds them: the engine keeps the
//! `Arc` from [`PreprocessCache::take`] until the device has the payload (and
//! for as long as it plays), so the artifact behind it stays on disk.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_TTL=3600                # seconds an entry stays valid
//! CACHE_SWEEP_INTERVAL=300      # seconds between sweeps
//! RESOLVE_TIMEOUT=60            # bound on resolve + materialize
//! PREPROCESS_CONCURRENCY=3      # background jobs running at once
//! ```

use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::GuildId;
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::materializer::{MaterializedAudio, Materializer, PlaybackMode},
    error::TrackError,
    sources::MetadataResolver,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub guild_id: GuildId,
    pub query: String,
}

impl CacheKey {
    pub fn new(guild_id: GuildId, query: impl Into<String>) -> Self {
        Self {
            guild_id,
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub mode: PlaybackMode,
    pub ttl: Duration,
    pub resolve_timeout: Duration,
    pub concurrency: usize,
}

type InFlight = DashMap<CacheKey, Arc<Claim>>;

/// In-flight marker for one key.
struct Claim {
    done: watch::Receiver<()>,
    /// Holds the producer's guard while its background job waits for a
    /// permit. Whoever takes it out produces the entry.
    queued: Mutex<Option<InFlightGuard>>,
}

impl Claim {
    fn take_queued(&self) -> Option<InFlightGuard> {
        self.queued.lock().take()
    }
}

pub struct PreprocessCache {
    entries: DashMap<CacheKey, Arc<MaterializedAudio>>,
    in_flight: Arc<InFlight>,
    resolver: Arc<dyn MetadataResolver>,
    materializer: Arc<dyn Materializer>,
    settings: CacheSettings,
    permits: Arc<Semaphore>,
}

/// Marks a key as being produced. Dropping it clears the marker and wakes
/// everyone waiting on the key.
struct InFlightGuard {
    key: CacheKey,
    // A queued guard lives inside the map it points at
    in_flight: Weak<InFlight>,
    _done: watch::Sender<()>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.upgrade() {
            in_flight.remove(&self.key);
        }
    }
}

/// Who produces a freshly claimed key.
enum Producer {
    /// The caller, right away.
    Inline,
    /// A background job, once it holds a permit.
    Queued,
}

impl PreprocessCache {
    pub fn new(
        resolver: Arc<dyn MetadataResolver>,
        materializer: Arc<dyn Materializer>,
        settings: CacheSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            entries: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            resolver,
            materializer,
            settings,
            permits,
        }
    }

    pub fn resolve_timeout(&self) -> Duration {
        self.settings.resolve_timeout
    }

    fn fresh(&self, key: &CacheKey) -> Option<Arc<MaterializedAudio>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(self.settings.ttl, Instant::now()) {
            return None;
        }
        Some(Arc::clone(entry.value()))
    }

    /// Claims `key` unless it is cached or already claimed. Returns the new
    /// marker, and the guard itself for an inline claim.
    fn claim(&self, key: &CacheKey, producer: Producer) -> Option<(Arc<Claim>, Option<InFlightGuard>)> {
        if self.fresh(key).is_some() {
            return None;
        }

        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                // A producer may have stored the entry and released its
                // marker between the first check and this one
                if self.fresh(key).is_some() {
                    return None;
                }
                let (done, waiter) = watch::channel(());
                let guard = InFlightGuard {
                    key: key.clone(),
                    in_flight: Arc::downgrade(&self.in_flight),
                    _done: done,
                };
                let (queued, inline) = match producer {
                    Producer::Inline => (None, Some(guard)),
                    Producer::Queued => (Some(guard), None),
                };
                let claim = Arc::new(Claim {
                    done: waiter,
                    queued: Mutex::new(queued),
                });
                slot.insert(Arc::clone(&claim));
                Some((claim, inline))
            }
        }
    }

    /// Produces the key and stores it. The marker is released afterwards,
    /// whatever the result.
    async fn produce_claimed(
        &self,
        key: CacheKey,
        guard: InFlightGuard,
    ) -> Result<Arc<MaterializedAudio>, TrackError> {
        let audio = self.produce(&key.query).await?;
        self.entries.insert(key, Arc::clone(&audio));
        drop(guard);
        Ok(audio)
    }

    /// Starts producing `query` for `guild_id` in the background. Does
    /// nothing when the key is cached or already being produced.
    pub fn kickoff(self: &Arc<Self>, guild_id: GuildId, query: &str) {
        let key = CacheKey::new(guild_id, query);
        let Some((claim, _)) = self.claim(&key, Producer::Queued) else {
            debug!("⏭️ Preprocess skipped, already cached or in flight: {}", query);
            return;
        };

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let permit = Arc::clone(&cache.permits).acquire_owned().await;
            let Some(guard) = claim.take_queued() else {
                debug!("Preprocess of {} was taken over", key.query);
                return;
            };
            let Ok(_permit) = permit else {
                return;
            };

            let guild_id = key.guild_id;
            let query = key.query.clone();
            match cache.produce_claimed(key, guard).await {
                Ok(audio) => info!("📦 Preprocessed: {} (guild {})", audio.track.title, guild_id),
                Err(e) => warn!("⚠️ Preprocessing failed for {}: {}", query, e),
            }
        });
    }

    /// Non-destructive lookup of a fresh entry.
    pub fn take(&self, guild_id: GuildId, query: &str) -> Option<Arc<MaterializedAudio>> {
        let audio = self.fresh(&CacheKey::new(guild_id, query));
        match &audio {
            Some(_) => debug!("🎯 Cache hit: {}", query),
            None if self.is_in_flight(guild_id, query) => debug!("⏳ Cache miss, still preprocessing: {}", query),
            None => debug!("💨 Cache miss: {}", query),
        }
        audio
    }

    /// Returns the entry for the key, producing it now if needed. Joins a
    /// background job already working on the same key instead of starting a
    /// second one. Whatever is produced here is stored like a preprocessed
    /// entry.
    pub async fn resolve_now(
        &self,
        guild_id: GuildId,
        query: &str,
    ) -> Result<Arc<MaterializedAudio>, TrackError> {
        let key = CacheKey::new(guild_id, query);
        let deadline = tokio::time::Instant::now() + self.settings.resolve_timeout;

        loop {
            if let Some(audio) = self.fresh(&key) {
                return Ok(audio);
            }

            if let Some((_, Some(guard))) = self.claim(&key, Producer::Inline) {
                return self.produce_claimed(key, guard).await;
            }

            let claim = self.in_flight.get(&key).map(|entry| Arc::clone(entry.value()));
            let Some(claim) = claim else {
                // Marker released between claim and lookup; look again
                continue;
            };

            if let Some(guard) = claim.take_queued() {
                debug!("⏩ Taking over queued preprocess: {}", query);
                return self.produce_claimed(key, guard).await;
            }

            debug!("⏳ Waiting for in-flight preprocess: {}", query);
            let mut waiter = claim.done.clone();
            drop(claim);
            // Either the entry is there now or the job failed and the key can
            // be claimed on the next pass
            if tokio::time::timeout_at(deadline, waiter.changed()).await.is_err() {
                return Err(TrackError::Timeout(self.settings.resolve_timeout));
            }
        }
    }

    async fn produce(&self, query: &str) -> Result<Arc<MaterializedAudio>, TrackError> {
        let work = async {
            let track = self.resolver.resolve(query).await?;
            let payload = self.materializer.materialize(&track, self.settings.mode).await?;
            Ok::<_, TrackError>(Arc::new(MaterializedAudio::new(track, payload)))
        };

        tokio::time::timeout(self.settings.resolve_timeout, work)
            .await
            .map_err(|_| TrackError::Timeout(self.settings.resolve_timeout))?
    }

    /// Drops expired entries nobody else holds. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        if self.is_empty() {
            return 0;
        }

        let now = Instant::now();
        let ttl = self.settings.ttl;
        let before = self.entries.len();

        self.entries
            .retain(|_, audio| !(audio.is_expired(ttl, now) && Arc::strong_count(audio) == 1));

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            info!("🧹 Cache sweep: evicted {} expired entries, {} left", evicted, self.len());
        }
        evicted
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_in_flight(&self, guild_id: GuildId, query: &str) -> bool {
        self.in_flight.contains_key(&CacheKey::new(guild_id, query))
    }
}
