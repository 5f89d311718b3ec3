//! # Playback Engine
//!
//! One [`GuildSession`] per guild with queued or playing audio. Sessions are
//! created by the first enqueue, join voice lazily and are torn down when the
//! queue drains or on stop.
//!
//! `advance` is the only path that starts audio. Per session it is serialized
//! by an async mutex and is entered either by an enqueue that found the
//! session idle (a kick) or by a device event delivered through the session's
//! event pump. Device events carry the generation of the `play` call that
//! produced them; events from an older generation are ignored.
//!
//! The queue head leaves the queue only after the device accepted its
//! payload, or when it failed to resolve (skip-on-failure).

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        materializer::MaterializedAudio,
        output::{DeviceEvent, DeviceEventSink, OutputConnection, VoiceConnector},
        queue::{GuildQueue, QueuedTrack, TrackRequest},
    },
    cache::PreprocessCache,
    error::{PlaybackError, TrackError},
    sources::{MetadataResolver, ResolvedTrack},
};

const EVENT_CAPACITY: usize = 64;

/// Who asked, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub guild_id: GuildId,
    pub user_id: UserId,
    /// Voice channel the caller is connected to, if any.
    pub voice_channel: Option<ChannelId>,
    pub text_channel: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackStatus::Idle => f.write_str("idle"),
            PlaybackStatus::Playing => f.write_str("playing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
    pub artwork: Option<String>,
    pub url: String,
    pub requester: UserId,
}

impl NowPlaying {
    fn new(track: &ResolvedTrack, requester: UserId) -> Self {
        Self {
            title: track.title.clone(),
            author: track.author.clone(),
            duration: track.duration,
            artwork: track.artwork.clone(),
            url: track.source.url.clone(),
            requester,
        }
    }
}

/// A queue entry dropped because it could not be played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTrack {
    pub query: String,
    pub error: TrackError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Playing {
        now_playing: NowPlaying,
        skipped: Vec<SkippedTrack>,
    },
    /// The queue ran dry and the session was torn down.
    Drained { skipped: Vec<SkippedTrack> },
    /// Stopped before anything reached the device.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    PlaylistQueued { added: usize, first_position: usize },
    /// The session was idle, so the request started playback right away.
    Started { added: usize, outcome: AdvanceOutcome },
    /// A stop reached the session before the request was queued.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingToStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    Skipped,
}

/// An advance driven by the device rather than by a command.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub guild_id: GuildId,
    pub text_channel: ChannelId,
    pub outcome: AdvanceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub status: PlaybackStatus,
    pub now_playing: Option<NowPlaying>,
    pub pending: Vec<TrackRequest>,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Kick,
    Device { generation: u64 },
}

struct SessionState {
    queue: GuildQueue,
    status: PlaybackStatus,
    generation: u64,
    /// Held while playing so the cache cannot evict what the device reads.
    current: Option<Arc<MaterializedAudio>>,
    now_playing: Option<NowPlaying>,
    /// Set once teardown has begun. A closed session accepts nothing.
    closed: bool,
    /// Closed by `stop` rather than by draining the queue.
    stopped: bool,
    left_voice: bool,
}

pub struct GuildSession {
    guild_id: GuildId,
    text_channel: ChannelId,
    connection: OnceCell<Box<dyn OutputConnection>>,
    state: Mutex<SessionState>,
    advance_lock: AsyncMutex<()>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    cancel: CancellationToken,
    /// Fires after the session left the registry.
    released: CancellationToken,
}

impl GuildSession {
    fn start(engine: &Arc<PlaybackEngine>, caller: &CallerContext) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            guild_id: caller.guild_id,
            text_channel: caller.text_channel,
            connection: OnceCell::new(),
            state: Mutex::new(SessionState {
                queue: GuildQueue::new(engine.max_queue_size),
                status: PlaybackStatus::Idle,
                generation: 0,
                current: None,
                now_playing: None,
                closed: false,
                stopped: false,
                left_voice: false,
            }),
            advance_lock: AsyncMutex::new(()),
            events,
            cancel: CancellationToken::new(),
            released: CancellationToken::new(),
        });

        tokio::spawn(event_pump(Arc::downgrade(engine), Arc::clone(&session), rx));
        info!("🆕 Session created for guild {}", caller.guild_id);
        session
    }

    async fn connect(
        &self,
        connector: &dyn VoiceConnector,
        channel_id: ChannelId,
    ) -> Result<(), PlaybackError> {
        self.connection
            .get_or_try_init(|| connector.join(self.guild_id, channel_id))
            .await
            .map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Destroys the voice connection at most once. A join that completes
    /// after teardown ran is destroyed here by the caller that awaited it.
    async fn leave_voice(&self) {
        let Some(connection) = self.connection.get() else {
            return;
        };
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.left_voice, true)
        };
        if first {
            connection.stop_current().await;
            connection.destroy().await;
        }
    }
}

/// Delivers device events to `advance`, one at a time, until the session is
/// cancelled.
async fn event_pump(
    engine: Weak<PlaybackEngine>,
    session: Arc<GuildSession>,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = session.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(engine) = engine.upgrade() else {
            break;
        };

        if let DeviceEvent::Error { details, .. } = &event {
            warn!("💥 Device error in guild {}: {}", session.guild_id, details);
        }

        let trigger = Trigger::Device {
            generation: event.generation(),
        };
        if let Some(outcome) = engine.advance(&session, trigger).await {
            if outcome != AdvanceOutcome::Cancelled {
                // No subscribers is fine
                let _ = engine.events.send(PlayerEvent {
                    guild_id: session.guild_id,
                    text_channel: session.text_channel,
                    outcome,
                });
            }
        }
    }
    debug!("Event pump for guild {} stopped", session.guild_id);
}

pub struct PlaybackEngine {
    sessions: DashMap<GuildId, Arc<GuildSession>>,
    cache: Arc<PreprocessCache>,
    resolver: Arc<dyn MetadataResolver>,
    connector: Arc<dyn VoiceConnector>,
    events: broadcast::Sender<PlayerEvent>,
    max_queue_size: Option<usize>,
}

impl PlaybackEngine {
    pub fn new(
        cache: Arc<PreprocessCache>,
        resolver: Arc<dyn MetadataResolver>,
        connector: Arc<dyn VoiceConnector>,
        max_queue_size: Option<usize>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            sessions: DashMap::new(),
            cache,
            resolver,
            connector,
            events,
            max_queue_size,
        })
    }

    /// Advances driven by device events (the ones no command is waiting on).
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    fn session(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions.get(&guild_id).map(|s| Arc::clone(s.value()))
    }

    /// The live session for the caller's guild, created if needed. A session
    /// that is being torn down is waited out and replaced.
    async fn session_for(self: &Arc<Self>, caller: &CallerContext) -> Arc<GuildSession> {
        loop {
            let session = match self.sessions.entry(caller.guild_id) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let session = GuildSession::start(self, caller);
                    entry.insert(Arc::clone(&session));
                    return session;
                }
            };

            if !session.is_closed() {
                return session;
            }
            session.released.cancelled().await;
        }
    }

    /// Queues `query` (or every entry of the playlist it names) for the
    /// caller's guild, joining the caller's voice channel if needed. Starts
    /// playback when the session was idle.
    pub async fn enqueue(
        self: &Arc<Self>,
        caller: &CallerContext,
        query: &str,
    ) -> Result<EnqueueOutcome, PlaybackError> {
        let channel_id = caller.voice_channel.ok_or(PlaybackError::NoVoiceChannel)?;
        let query = query.trim();

        let is_playlist = self.resolver.is_playlist(query);
        let queries = if is_playlist {
            self.resolver
                .expand_playlist(query)
                .await
                .map_err(PlaybackError::Playlist)?
        } else {
            vec![query.to_string()]
        };

        let (session, first_position, added, start) = loop {
            let session = self.session_for(caller).await;

            if let Err(e) = session.connect(self.connector.as_ref(), channel_id).await {
                warn!("⚠️ Could not join voice in guild {}: {}", caller.guild_id, e);
                let abandon = {
                    let mut state = session.state.lock();
                    let unused = !state.closed
                        && state.queue.is_empty()
                        && state.status == PlaybackStatus::Idle;
                    if unused {
                        state.closed = true;
                    }
                    unused
                };
                if abandon {
                    self.teardown(&session).await;
                }
                return Err(e);
            }

            let appended = {
                let mut state = session.state.lock();
                if state.closed {
                    Err(state.stopped)
                } else {
                    let start = state.queue.is_empty() && state.status == PlaybackStatus::Idle;
                    let requests = queries
                        .iter()
                        .map(|q| TrackRequest::new(q.as_str(), caller.user_id));
                    let (first_position, added) = state.queue.enqueue_many(requests)?;
                    Ok((first_position, added, start))
                }
            };

            match appended {
                Ok((first_position, added, start)) => break (session, first_position, added, start),
                Err(stopped) => {
                    session.released.cancelled().await;
                    session.leave_voice().await;
                    // A stop that landed while joining wins over this request
                    if stopped {
                        info!("⏹️ Dropping play request in guild {}: playback was stopped", caller.guild_id);
                        return Ok(EnqueueOutcome::Cancelled);
                    }
                }
            }
        };

        for query in queries.iter().take(added) {
            self.cache.kickoff(session.guild_id, query);
        }

        if start {
            if let Some(outcome) = self.advance(&session, Trigger::Kick).await {
                return Ok(EnqueueOutcome::Started { added, outcome });
            }
        }

        if is_playlist {
            Ok(EnqueueOutcome::PlaylistQueued {
                added,
                first_position,
            })
        } else {
            Ok(EnqueueOutcome::Queued {
                position: first_position,
            })
        }
    }

    /// Plays the queue head, skipping entries that fail, or tears the session
    /// down when the queue is empty. Returns `None` when there was nothing to
    /// do: already playing, or a stale device event.
    async fn advance(
        self: &Arc<Self>,
        session: &Arc<GuildSession>,
        trigger: Trigger,
    ) -> Option<AdvanceOutcome> {
        let _serial = session.advance_lock.lock().await;

        {
            let mut state = session.state.lock();
            if state.closed {
                return None;
            }
            match trigger {
                Trigger::Kick if state.status == PlaybackStatus::Playing => return None,
                Trigger::Kick => {}
                Trigger::Device { generation } if generation != state.generation => {
                    debug!(
                        "Ignoring stale device event in guild {} (generation {}, current {})",
                        session.guild_id, generation, state.generation
                    );
                    return None;
                }
                Trigger::Device { .. } => {
                    state.status = PlaybackStatus::Idle;
                    state.now_playing = None;
                    if let Some(finished) = state.current.take() {
                        debug!("Finished in guild {}: {}", session.guild_id, finished.track.title);
                    }
                }
            }
        }

        let mut skipped = Vec::new();
        loop {
            let head = {
                let mut state = session.state.lock();
                if state.closed {
                    return Some(AdvanceOutcome::Cancelled);
                }
                let head = state.queue.peek_head().cloned();
                if head.is_none() {
                    state.closed = true;
                }
                head
            };

            let Some(head) = head else {
                self.teardown(session).await;
                return Some(AdvanceOutcome::Drained { skipped });
            };

            let query = head.request.query.as_str();
            let audio = match self.cache.take(session.guild_id, query) {
                Some(audio) => Ok(audio),
                None => tokio::select! {
                    _ = session.cancel.cancelled() => return Some(AdvanceOutcome::Cancelled),
                    result = self.cache.resolve_now(session.guild_id, query) => result,
                },
            };

            let audio = match audio {
                Ok(audio) => audio,
                Err(error) => {
                    skip_head(session, &head, error, &mut skipped);
                    continue;
                }
            };

            // Last point where a stop wins: nothing has reached the device yet
            let sink = {
                let mut state = session.state.lock();
                if state.closed {
                    return Some(AdvanceOutcome::Cancelled);
                }
                state.generation += 1;
                DeviceEventSink::new(session.events.clone(), state.generation)
            };

            let Some(connection) = session.connection.get() else {
                skip_head(session, &head, TrackError::Device("not connected".into()), &mut skipped);
                continue;
            };

            if let Err(e) = connection.play(&audio.payload, sink).await {
                skip_head(session, &head, TrackError::Device(e.to_string()), &mut skipped);
                continue;
            }

            let now_playing = NowPlaying::new(&audio.track, head.request.requested_by);
            let next = {
                let mut state = session.state.lock();
                state.queue.dequeue_ticket(head.ticket);
                state.status = PlaybackStatus::Playing;
                state.current = Some(audio);
                state.now_playing = Some(now_playing.clone());
                state.queue.peek_head().map(|next| next.request.query.clone())
            };

            info!("🎵 Now playing in guild {}: {}", session.guild_id, now_playing.title);

            // Entries older than the cache TTL need producing again
            if let Some(next) = next {
                self.cache.kickoff(session.guild_id, &next);
            }

            return Some(AdvanceOutcome::Playing {
                now_playing,
                skipped,
            });
        }
    }

    /// Clears the queue and leaves voice. Idempotent.
    pub async fn stop(&self, guild_id: GuildId) -> StopOutcome {
        let Some(session) = self.session(guild_id) else {
            return StopOutcome::NothingToStop;
        };

        let first = {
            let mut state = session.state.lock();
            let first = !state.closed;
            state.closed = true;
            state.stopped |= first;
            first
        };
        if !first {
            return StopOutcome::NothingToStop;
        }

        info!("⏹️ Stopping playback in guild {}", guild_id);
        self.teardown(&session).await;
        StopOutcome::Stopped
    }

    /// Stops the current track; the device's idle event moves on to the next
    /// entry.
    pub async fn skip(&self, guild_id: GuildId) -> Result<SkipOutcome, PlaybackError> {
        let session = self.session(guild_id).ok_or(PlaybackError::NothingPlaying)?;
        {
            let state = session.state.lock();
            if state.closed || state.status != PlaybackStatus::Playing {
                return Err(PlaybackError::NothingPlaying);
            }
        }

        let connection = session.connection.get().ok_or(PlaybackError::NothingPlaying)?;
        info!("⏭️ Skipping current track in guild {}", guild_id);
        connection.stop_current().await;
        Ok(SkipOutcome::Skipped)
    }

    /// The bot was removed from voice by someone else.
    pub async fn handle_disconnect(&self, guild_id: GuildId) -> StopOutcome {
        if self.is_active(guild_id) {
            info!("🔌 Disconnected from voice in guild {}", guild_id);
        }
        self.stop(guild_id).await
    }

    pub fn queue_snapshot(&self, guild_id: GuildId) -> QueueSnapshot {
        match self.session(guild_id) {
            Some(session) => {
                let state = session.state.lock();
                QueueSnapshot {
                    status: state.status,
                    now_playing: state.now_playing.clone(),
                    pending: state.queue.pending(),
                }
            }
            None => QueueSnapshot {
                status: PlaybackStatus::Idle,
                now_playing: None,
                pending: Vec::new(),
            },
        }
    }

    /// Must be called with `closed` already set.
    async fn teardown(&self, session: &Arc<GuildSession>) {
        session.cancel.cancel();
        session.leave_voice().await;

        {
            let mut state = session.state.lock();
            state.queue.clear();
            state.status = PlaybackStatus::Idle;
            state.current = None;
            state.now_playing = None;
        }

        self.sessions
            .remove_if(&session.guild_id, |_, live| Arc::ptr_eq(live, session));
        session.released.cancel();
        info!("🔚 Session torn down for guild {}", session.guild_id);
    }
}

fn skip_head(
    session: &GuildSession,
    head: &QueuedTrack,
    error: TrackError,
    skipped: &mut Vec<SkippedTrack>,
) {
    warn!(
        "⏭️ Skipping `{}` in guild {} ({:?}): {}",
        head.request.query,
        session.guild_id,
        error.kind(),
        error
    );
    session.state.lock().queue.dequeue_ticket(head.ticket);
    skipped.push(SkippedTrack {
        query: head.request.query.clone(),
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::materializer::{Materializer, Payload, PlaybackMode},
        cache::CacheSettings,
        error::{ErrorKind, MaterializeError, ResolveError},
        sources::SourceHandle,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };
    use tokio::sync::{Notify, Semaphore};

    fn url_for(query: &str) -> String {
        format!("https://media.example/{}", query.replace(' ', "-"))
    }

    struct FakeResolver {
        calls: Mutex<Vec<String>>,
        gated: HashSet<String>,
        gate: Arc<Semaphore>,
        playlists: HashMap<String, Vec<String>>,
    }

    impl Default for FakeResolver {
        fn default() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                gated: HashSet::new(),
                gate: Arc::new(Semaphore::new(0)),
                playlists: HashMap::new(),
            }
        }
    }

    impl FakeResolver {
        fn gate(mut self, query: &str) -> Self {
            self.gated.insert(query.to_string());
            self
        }

        fn playlist(mut self, url: &str, entries: Vec<String>) -> Self {
            self.playlists.insert(url.to_string(), entries);
            self
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MetadataResolver for FakeResolver {
        async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
            self.calls.lock().push(query.to_string());
            if self.gated.contains(query) {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
            }
            if query.starts_with("missing") {
                return Err(ResolveError::NotFound(query.to_string()));
            }
            Ok(ResolvedTrack::new(SourceHandle::direct(url_for(query)), query).with_author("Artist"))
        }

        async fn expand_playlist(&self, url: &str) -> Result<Vec<String>, ResolveError> {
            self.playlists
                .get(url)
                .cloned()
                .ok_or_else(|| ResolveError::NotFound(url.to_string()))
        }

        fn is_playlist(&self, query: &str) -> bool {
            self.playlists.contains_key(query)
        }
    }

    struct StreamMaterializer;

    #[async_trait]
    impl Materializer for StreamMaterializer {
        async fn materialize(
            &self,
            track: &ResolvedTrack,
            _mode: PlaybackMode,
        ) -> Result<Payload, MaterializeError> {
            Ok(Payload::Stream(track.source.clone()))
        }
    }

    /// Everything the fake voice connection saw.
    #[derive(Default)]
    struct DeviceLog {
        joins: AtomicUsize,
        fail_join: AtomicBool,
        /// Joins wait for `join_gate` while set.
        hold_join: AtomicBool,
        join_gate: Notify,
        played: Mutex<Vec<String>>,
        sinks: Mutex<Vec<DeviceEventSink>>,
        destroyed: AtomicUsize,
    }

    impl DeviceLog {
        fn played(&self) -> Vec<String> {
            self.played.lock().clone()
        }

        fn sink(&self, index: usize) -> DeviceEventSink {
            self.sinks.lock()[index].clone()
        }

        fn last_sink(&self) -> DeviceEventSink {
            self.sinks.lock().last().cloned().unwrap()
        }
    }

    struct FakeConnector {
        log: Arc<DeviceLog>,
    }

    #[async_trait]
    impl VoiceConnector for FakeConnector {
        async fn join(
            &self,
            _guild_id: GuildId,
            _channel_id: ChannelId,
        ) -> Result<Box<dyn OutputConnection>, PlaybackError> {
            self.log.joins.fetch_add(1, Ordering::SeqCst);
            if self.log.hold_join.load(Ordering::SeqCst) {
                self.log.join_gate.notified().await;
            }
            if self.log.fail_join.load(Ordering::SeqCst) {
                return Err(PlaybackError::Connect("missing permissions".into()));
            }
            Ok(Box::new(FakeOutput {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct FakeOutput {
        log: Arc<DeviceLog>,
    }

    #[async_trait]
    impl OutputConnection for FakeOutput {
        async fn play(&self, payload: &Payload, events: DeviceEventSink) -> Result<(), PlaybackError> {
            let url = match payload {
                Payload::Stream(source) => source.url.clone(),
                Payload::File(artifact) => artifact.path().display().to_string(),
            };
            self.log.played.lock().push(url);
            self.log.sinks.lock().push(events);
            Ok(())
        }

        async fn stop_current(&self) {
            let last = self.log.sinks.lock().last().cloned();
            if let Some(sink) = last {
                sink.idle();
            }
        }

        async fn destroy(&self) {
            self.log.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        engine: Arc<PlaybackEngine>,
        cache: Arc<PreprocessCache>,
        resolver: Arc<FakeResolver>,
        log: Arc<DeviceLog>,
    }

    fn harness(resolver: FakeResolver, max_queue_size: Option<usize>) -> Harness {
        let resolver = Arc::new(resolver);
        let log = Arc::new(DeviceLog::default());
        let cache = Arc::new(PreprocessCache::new(
            Arc::clone(&resolver) as Arc<dyn MetadataResolver>,
            Arc::new(StreamMaterializer),
            CacheSettings {
                mode: PlaybackMode::Streaming,
                ttl: Duration::from_secs(3600),
                resolve_timeout: Duration::from_secs(5),
                concurrency: 3,
            },
        ));
        let engine = PlaybackEngine::new(
            Arc::clone(&cache),
            Arc::clone(&resolver) as Arc<dyn MetadataResolver>,
            Arc::new(FakeConnector {
                log: Arc::clone(&log),
            }),
            max_queue_size,
        );
        Harness {
            engine,
            cache,
            resolver,
            log,
        }
    }

    fn caller(guild: u64) -> CallerContext {
        CallerContext {
            guild_id: GuildId::new(guild),
            user_id: UserId::new(7),
            voice_channel: Some(ChannelId::new(100)),
            text_channel: ChannelId::new(200),
        }
    }

    fn pending(engine: &PlaybackEngine, guild: u64) -> Vec<String> {
        engine
            .queue_snapshot(GuildId::new(guild))
            .pending
            .into_iter()
            .map(|request| request.query)
            .collect()
    }

    async fn next_event(events: &mut broadcast::Receiver<PlayerEvent>) -> AdvanceOutcome {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no player event")
            .expect("event channel closed")
            .outcome
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn playing_title(outcome: &AdvanceOutcome) -> &str {
        match outcome {
            AdvanceOutcome::Playing { now_playing, .. } => &now_playing.title,
            other => panic!("expected Playing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_songs_play_in_order_then_session_tears_down() {
        let h = harness(FakeResolver::default().gate("Song A"), None);
        let mut events = h.engine.subscribe();

        let first = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.enqueue(&caller(1), "Song A").await })
        };
        let resolver = Arc::clone(&h.resolver);
        eventually("Song A resolve", || resolver.calls().contains(&"Song A".to_string())).await;

        let second = h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        assert_eq!(second, EnqueueOutcome::Queued { position: 2 });
        // A is still resolving, so it has not left the queue
        assert_eq!(pending(&h.engine, 1), vec!["Song A", "Song B"]);
        assert!(h.log.played().is_empty());

        h.resolver.release();
        let EnqueueOutcome::Started { added, outcome } = first.await.unwrap().unwrap() else {
            panic!("first enqueue should start playback");
        };
        assert_eq!(added, 1);
        assert_eq!(playing_title(&outcome), "Song A");
        assert_eq!(pending(&h.engine, 1), vec!["Song B"]);
        assert_eq!(h.log.played(), vec![url_for("Song A")]);

        h.log.last_sink().idle();
        let outcome = next_event(&mut events).await;
        assert_eq!(playing_title(&outcome), "Song B");
        assert!(pending(&h.engine, 1).is_empty());

        h.log.last_sink().idle();
        assert_eq!(next_event(&mut events).await, AdvanceOutcome::Drained { skipped: vec![] });
        assert!(!h.engine.is_active(GuildId::new(1)));
        assert_eq!(h.log.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(h.log.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_sole_entry_drains_session() {
        let h = harness(FakeResolver::default(), None);

        let outcome = h.engine.enqueue(&caller(1), "missing song").await.unwrap();
        let EnqueueOutcome::Started {
            outcome: AdvanceOutcome::Drained { skipped },
            ..
        } = outcome
        else {
            panic!("expected the session to drain, got {outcome:?}");
        };

        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].query, "missing song");
        assert_eq!(skipped[0].error.kind(), ErrorKind::NotFound);
        assert!(h.log.played().is_empty());
        assert!(!h.engine.is_active(GuildId::new(1)));
        assert_eq!(h.log.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_entry_is_skipped_and_next_plays() {
        let h = harness(FakeResolver::default().gate("Song A"), None);

        let first = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.enqueue(&caller(1), "Song A").await })
        };
        let resolver = Arc::clone(&h.resolver);
        eventually("Song A resolve", || resolver.calls().contains(&"Song A".to_string())).await;
        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "missing track").await.unwrap();
        h.engine.enqueue(&caller(1), "Song C").await.unwrap();
        h.resolver.release();
        first.await.unwrap().unwrap();

        // Second "Song A" comes straight from the cache
        let mut events = h.engine.subscribe();
        h.log.last_sink().idle();
        assert_eq!(playing_title(&next_event(&mut events).await), "Song A");

        h.log.last_sink().idle();
        let AdvanceOutcome::Playing { now_playing, skipped } = next_event(&mut events).await else {
            panic!("expected Song C to play");
        };
        assert_eq!(now_playing.title, "Song C");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].query, "missing track");
        assert_eq!(
            h.log.played(),
            vec![url_for("Song A"), url_for("Song A"), url_for("Song C")]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(FakeResolver::default(), None);
        assert_eq!(h.engine.stop(GuildId::new(1)).await, StopOutcome::NothingToStop);

        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "Song B").await.unwrap();

        assert_eq!(h.engine.stop(GuildId::new(1)).await, StopOutcome::Stopped);
        assert_eq!(h.engine.stop(GuildId::new(1)).await, StopOutcome::NothingToStop);
        assert_eq!(h.log.destroyed.load(Ordering::SeqCst), 1);
        assert!(pending(&h.engine, 1).is_empty());
        assert!(!h.engine.is_active(GuildId::new(1)));
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_advance() {
        let h = harness(FakeResolver::default().gate("Song A"), None);

        let first = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.enqueue(&caller(1), "Song A").await })
        };
        let resolver = Arc::clone(&h.resolver);
        eventually("Song A resolve", || resolver.calls().contains(&"Song A".to_string())).await;

        assert_eq!(h.engine.stop(GuildId::new(1)).await, StopOutcome::Stopped);
        h.resolver.release();

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Started {
                added: 1,
                outcome: AdvanceOutcome::Cancelled
            }
        );
        assert!(h.log.played().is_empty(), "a stale resolve must not start playback");
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_starts_fresh_session() {
        let h = harness(FakeResolver::default(), None);

        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.stop(GuildId::new(1)).await;

        let outcome = h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Started { .. }));
        assert_eq!(h.log.joins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_playlist_enqueues_every_entry_in_order() {
        let url = "https://www.youtube.com/playlist?list=PL10";
        let entries: Vec<String> = (1..=10).map(|i| format!("track {i}")).collect();
        let h = harness(FakeResolver::default().playlist(url, entries.clone()), None);

        let outcome = h.engine.enqueue(&caller(1), url).await.unwrap();
        let EnqueueOutcome::Started { added, outcome } = outcome else {
            panic!("playlist on an idle guild should start playback");
        };
        assert_eq!(added, 10);
        assert_eq!(playing_title(&outcome), "track 1");
        assert_eq!(pending(&h.engine, 1), entries[1..].to_vec());

        let cache = Arc::clone(&h.cache);
        eventually("all entries preprocessed", || cache.len() == 10).await;
        let mut calls = h.resolver.calls();
        calls.sort();
        let mut expected = entries.clone();
        expected.sort();
        assert_eq!(calls, expected, "each entry is resolved exactly once");
    }

    #[tokio::test]
    async fn test_playlist_on_busy_guild_reports_first_position() {
        let url = "https://open.spotify.com/playlist/abc";
        let h = harness(
            FakeResolver::default().playlist(url, vec!["one".into(), "two".into()]),
            None,
        );

        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        let outcome = h.engine.enqueue(&caller(1), url).await.unwrap();

        assert_eq!(
            outcome,
            EnqueueOutcome::PlaylistQueued {
                added: 2,
                first_position: 2
            }
        );
    }

    #[tokio::test]
    async fn test_no_voice_channel_is_rejected() {
        let h = harness(FakeResolver::default(), None);
        let caller = CallerContext {
            voice_channel: None,
            ..caller(1)
        };

        assert_eq!(
            h.engine.enqueue(&caller, "Song A").await,
            Err(PlaybackError::NoVoiceChannel)
        );
        assert_eq!(h.log.joins.load(Ordering::SeqCst), 0);
        assert!(!h.engine.is_active(GuildId::new(1)));
    }

    #[tokio::test]
    async fn test_failed_join_leaves_no_session() {
        let h = harness(FakeResolver::default(), None);
        h.log.fail_join.store(true, Ordering::SeqCst);

        let err = h.engine.enqueue(&caller(1), "Song A").await.unwrap_err();
        assert!(matches!(err, PlaybackError::Connect(_)));
        assert!(!h.engine.is_active(GuildId::new(1)));
    }

    #[tokio::test]
    async fn test_skip_moves_to_next_entry() {
        let h = harness(FakeResolver::default(), None);
        assert_eq!(h.engine.skip(GuildId::new(1)).await, Err(PlaybackError::NothingPlaying));

        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        let mut events = h.engine.subscribe();

        assert_eq!(h.engine.skip(GuildId::new(1)).await, Ok(SkipOutcome::Skipped));
        assert_eq!(playing_title(&next_event(&mut events).await), "Song B");

        // Skipping the last track drains the session
        assert_eq!(h.engine.skip(GuildId::new(1)).await, Ok(SkipOutcome::Skipped));
        assert_eq!(next_event(&mut events).await, AdvanceOutcome::Drained { skipped: vec![] });
        assert_eq!(h.engine.skip(GuildId::new(1)).await, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test]
    async fn test_device_error_advances_like_completion() {
        let h = harness(FakeResolver::default(), None);
        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        let mut events = h.engine.subscribe();

        h.log.last_sink().error("corrupt frame");
        assert_eq!(playing_title(&next_event(&mut events).await), "Song B");
    }

    #[tokio::test]
    async fn test_stale_device_events_are_ignored() {
        let h = harness(FakeResolver::default(), None);
        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        h.engine.enqueue(&caller(1), "Song B").await.unwrap();
        h.engine.enqueue(&caller(1), "Song C").await.unwrap();
        let mut events = h.engine.subscribe();

        let first_sink = h.log.sink(0);
        first_sink.idle();
        assert_eq!(playing_title(&next_event(&mut events).await), "Song B");

        // A duplicate end notification for Song A must not skip Song B
        first_sink.idle();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = h.engine.queue_snapshot(GuildId::new(1));
        assert_eq!(snapshot.status, PlaybackStatus::Playing);
        assert_eq!(snapshot.now_playing.map(|np| np.title), Some("Song B".to_string()));
        assert_eq!(pending(&h.engine, 1), vec!["Song C"]);
        assert_eq!(h.log.played().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_limit_is_enforced() {
        let h = harness(FakeResolver::default(), Some(1));

        h.engine.enqueue(&caller(1), "Song A").await.unwrap();
        assert_eq!(
            h.engine.enqueue(&caller(1), "Song B").await,
            Ok(EnqueueOutcome::Queued { position: 1 })
        );
        assert_eq!(
            h.engine.enqueue(&caller(1), "Song C").await,
            Err(PlaybackError::QueueFull { limit: 1 })
        );
    }

    #[tokio::test]
    async fn test_guilds_are_independent() {
        let h = harness(FakeResolver::default().gate("slow song"), None);

        let slow = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.enqueue(&caller(1), "slow song").await })
        };
        let resolver = Arc::clone(&h.resolver);
        eventually("slow resolve", || resolver.calls().contains(&"slow song".to_string())).await;

        // Guild 2 plays while guild 1 is still waiting on its resolve
        let outcome = h.engine.enqueue(&caller(2), "Song A").await.unwrap();
        assert!(matches!(
            outcome,
            EnqueueOutcome::Started { outcome: AdvanceOutcome::Playing { .. }, .. }
        ));

        h.resolver.release();
        slow.await.unwrap().unwrap();
        assert_eq!(h.log.joins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let h = harness(FakeResolver::default(), None);
        h.engine.enqueue(&caller(1), "Song A").await.unwrap();

        assert_eq!(h.engine.handle_disconnect(GuildId::new(1)).await, StopOutcome::Stopped);
        assert!(!h.engine.is_active(GuildId::new(1)));
        assert_eq!(h.engine.handle_disconnect(GuildId::new(1)).await, StopOutcome::NothingToStop);
    }

    #[tokio::test]
    async fn test_stop_while_joining_voice_wins() {
        let h = harness(FakeResolver::default(), None);
        h.log.hold_join.store(true, Ordering::SeqCst);

        let play = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.enqueue(&caller(1), "Song A").await })
        };
        let log = Arc::clone(&h.log);
        eventually("voice join", || log.joins.load(Ordering::SeqCst) == 1).await;

        assert_eq!(h.engine.stop(GuildId::new(1)).await, StopOutcome::Stopped);
        h.log.join_gate.notify_one();

        assert_eq!(play.await.unwrap().unwrap(), EnqueueOutcome::Cancelled);
        assert!(h.log.played().is_empty());
        assert!(!h.engine.is_active(GuildId::new(1)));
        assert_eq!(h.log.joins.load(Ordering::SeqCst), 1);
        // The connection that finished joining after the stop is left
        assert_eq!(h.log.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_preprocessing_in_one_guild_does_not_stall_another() {
        let h = harness(
            FakeResolver::default().gate("slow 1").gate("slow 2").gate("slow 3").gate("slow 4"),
            None,
        );
        for i in 1..=4 {
            h.cache.kickoff(GuildId::new(1), &format!("slow {i}"));
        }
        let resolver = Arc::clone(&h.resolver);
        eventually("guild 1 to fill the pool", || resolver.calls().len() == 3).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            h.engine.enqueue(&caller(2), "fast song"),
        )
        .await
        .expect("guild 2 waited on guild 1's backlog")
        .unwrap();

        let EnqueueOutcome::Started { outcome, .. } = outcome else {
            panic!("expected playback to start, got {outcome:?}");
        };
        assert_eq!(playing_title(&outcome), "fast song");
        assert_eq!(h.log.played(), vec![url_for("fast song")]);

        for _ in 0..4 {
            h.resolver.release();
        }
    }
}
