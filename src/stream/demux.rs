use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::{ConfigError, InterpreterConfig};
use crate::correlation::CorrelationId;
use crate::error::StreamError;
use crate::observability::usage::log_session_usage;
use crate::tags::marker::TagMarkers;
use crate::tags::{ExtractionTags, TagStateTracker};
use crate::tool_call::PartialToolCall;

use super::event::{AggregatedMessage, CompletedResponse, ContentDelta, StreamEvent};
use super::handler::{PartialEvent, StreamHandler};
use super::session::{SessionCell, StreamSession};

pub const DEFAULT_SHARD_COUNT: usize = 16;
pub const DEFAULT_RETIRED_ID_CAPACITY: usize = 4096;

type Shard = Mutex<FxHashMap<CorrelationId, Arc<SessionCell>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxOptions {
    pub shard_count: usize,
    /// Ids remembered after their terminal outcome; 0 disables the check.
    pub retired_id_capacity: usize,
    /// Sessions idle for longer are expired by [`StreamDemultiplexer::reap_idle_expired`].
    pub idle_timeout: Option<Duration>,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            retired_id_capacity: DEFAULT_RETIRED_ID_CAPACITY,
            idle_timeout: None,
        }
    }
}

/// Counter snapshot returned by [`StreamDemultiplexer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemuxStats {
    pub active: usize,
    pub opened: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Events for retired ids plus tool-call deltas without an index.
    pub dropped_events: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    dropped_events: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded FIFO of ids whose sessions already ended.
#[derive(Debug)]
struct RetiredIds {
    order: VecDeque<CorrelationId>,
    members: FxHashSet<CorrelationId>,
    capacity: usize,
}

impl RetiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: FxHashSet::default(),
            capacity,
        }
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: &CorrelationId) {
        if self.capacity == 0 || !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &CorrelationId) {
        if self.members.remove(id) {
            self.order.retain(|retired| retired != id);
        }
    }
}

/// Awaitable outcome of one registered session.
#[derive(Debug)]
pub struct CompletionHandle {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<CompletedResponse, StreamError>>,
}

impl CompletionHandle {
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the terminal outcome. A session dropped without one (for
    /// example because the demultiplexer itself was dropped) yields
    /// `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns the transport error, `Cancelled` or `TimedOut`.
    pub async fn wait(self) -> Result<CompletedResponse, StreamError> {
        self.receiver.await.unwrap_or(Err(StreamError::Cancelled))
    }

    /// Non-blocking check; `None` while the session is still open.
    pub fn try_result(&mut self) -> Option<Result<CompletedResponse, StreamError>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(StreamError::Cancelled)),
        }
    }
}

/// Routes interleaved events of many correlation ids to per-id sessions and
/// invokes one shared [`StreamHandler`].
///
/// Events of one id must be delivered by one flow at a time, in arrival
/// order. Different ids may be driven concurrently from any number of
/// threads or tasks.
pub struct StreamDemultiplexer<H: StreamHandler + ?Sized> {
    handler: Arc<H>,
    markers: Arc<TagMarkers>,
    shards: Box<[Shard]>,
    retired: Mutex<RetiredIds>,
    idle_timeout: Option<Duration>,
    epoch: Instant,
    counters: Counters,
}

impl<H: StreamHandler + ?Sized> StreamDemultiplexer<H> {
    #[must_use]
    pub fn new(handler: Arc<H>, tags: ExtractionTags) -> Self {
        Self::with_options(handler, tags, DemuxOptions::default())
    }

    #[must_use]
    pub fn with_options(handler: Arc<H>, tags: ExtractionTags, options: DemuxOptions) -> Self {
        let shard_count = options.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            handler,
            markers: Arc::new(TagMarkers::new(tags)),
            shards,
            retired: Mutex::new(RetiredIds::new(options.retired_id_capacity)),
            idle_timeout: options.idle_timeout,
            epoch: Instant::now(),
            counters: Counters::default(),
        }
    }

    /// Build from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Tag`] when the configured tag names are invalid.
    pub fn from_config(handler: Arc<H>, config: &InterpreterConfig) -> Result<Self, ConfigError> {
        let tags = config.tags.extraction_tags()?;
        Ok(Self::with_options(handler, tags, config.sessions.demux_options()))
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    #[must_use]
    pub fn tags(&self) -> &ExtractionTags {
        self.markers.tags()
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    // -- event routing ------------------------------------------------------

    /// Apply one event to the session for `correlation_id`, creating the
    /// session on first sight.
    ///
    /// Events for an id that already reached a terminal outcome are dropped.
    pub fn handle(&self, correlation_id: &CorrelationId, event: StreamEvent) {
        tracing::trace!(correlation_id = %correlation_id, kind = event.kind(), "stream event");
        match event {
            StreamEvent::Content(delta) => {
                if let Some(cell) = self.open_cell(correlation_id) {
                    self.on_content(&cell, &delta);
                }
            }
            StreamEvent::ToolCall(delta) => {
                if let Some(cell) = self.open_cell(correlation_id) {
                    self.on_tool_call(&cell, &delta);
                }
            }
            StreamEvent::Completed(message) => {
                if let Some(cell) = self.close_cell(correlation_id, true) {
                    self.on_completed(&cell, message);
                }
            }
            StreamEvent::Failed(error) => {
                if let Some(cell) = self.close_cell(correlation_id, true) {
                    self.on_failed(correlation_id, &cell, error);
                }
            }
        }
    }

    fn on_content(&self, cell: &SessionCell, delta: &ContentDelta) {
        let mut session = cell.lock();
        if cell.is_closed() {
            return;
        }
        cell.touch(self.now_ms());
        let result = session.classify(&delta.text);
        let partial = PartialEvent {
            correlation_id: session.correlation_id(),
            delta,
            state: result.state,
        };
        if let Some(text) = result.thinking.as_deref() {
            if cell.is_closed() {
                return;
            }
            self.handler.on_partial_thinking(text, &partial);
        }
        if let Some(text) = result.response.as_deref() {
            if cell.is_closed() {
                return;
            }
            self.handler.on_partial_response(text, &partial);
        }
    }

    fn on_tool_call(&self, cell: &SessionCell, delta: &PartialToolCall) {
        let mut session = cell.lock();
        if cell.is_closed() {
            return;
        }
        cell.touch(self.now_ms());
        if !session.merge_tool_call(delta) {
            Counters::bump(&self.counters.dropped_events);
            tracing::debug!(
                correlation_id = %session.correlation_id(),
                "dropping tool-call delta without index"
            );
            return;
        }
        self.handler.on_partial_tool_call(session.correlation_id(), delta);
    }

    fn on_completed(&self, cell: &SessionCell, message: AggregatedMessage) {
        let (response, age) = {
            let mut session = cell.lock();
            // Held-back marker prefixes still reach the partial callbacks.
            let residue = session.flush();
            if !residue.is_empty() {
                let delta = ContentDelta::default();
                let partial = PartialEvent {
                    correlation_id: session.correlation_id(),
                    delta: &delta,
                    state: residue.state,
                };
                if let Some(text) = residue.thinking.as_deref() {
                    self.handler.on_partial_thinking(text, &partial);
                }
                if let Some(text) = residue.response.as_deref() {
                    self.handler.on_partial_response(text, &partial);
                }
            }
            let response = session.finalize(message);
            for call in &response.tool_calls {
                self.handler.on_complete_tool_call(call);
            }
            self.handler.on_complete_response(&response);
            (response, session.age())
        };
        Counters::bump(&self.counters.completed);
        log_session_usage(&response, age);
        cell.resolve(Ok(response));
    }

    fn on_failed(&self, correlation_id: &CorrelationId, cell: &SessionCell, error: StreamError) {
        {
            let _session = cell.lock();
            self.handler.on_error(correlation_id, &error);
        }
        Counters::bump(&self.counters.failed);
        tracing::debug!(
            correlation_id = %correlation_id,
            category = error.category().as_str(),
            "stream session failed: {error}"
        );
        cell.resolve(Err(error));
    }

    // -- session lifecycle --------------------------------------------------

    /// Create the session for `correlation_id` ahead of its first event and
    /// return a handle resolving with its outcome.
    ///
    /// Registering a retired id starts a fresh session for it. Registering an
    /// id that is already active keeps its state and replaces the previous
    /// handle, which then resolves to `Cancelled`.
    pub fn register(&self, correlation_id: CorrelationId) -> CompletionHandle {
        self.register_session(correlation_id, None)
    }

    /// Like [`Self::register`], with tag names overriding the defaults for
    /// this session only. Ignored when the session already exists.
    pub fn register_with_tags(
        &self,
        correlation_id: CorrelationId,
        tags: ExtractionTags,
    ) -> CompletionHandle {
        self.register_session(correlation_id, Some(tags))
    }

    fn register_session(
        &self,
        correlation_id: CorrelationId,
        tags: Option<ExtractionTags>,
    ) -> CompletionHandle {
        let (sender, receiver) = oneshot::channel();
        let cell = {
            let mut shard = self.shard(&correlation_id).lock();
            if let Some(existing) = shard.get(&correlation_id) {
                Arc::clone(existing)
            } else {
                self.retired.lock().remove(&correlation_id);
                let tracker = match tags {
                    Some(tags) => TagStateTracker::new(tags),
                    None => TagStateTracker::with_markers(Arc::clone(&self.markers)),
                };
                let cell = self.new_cell(&correlation_id, tracker);
                shard.insert(correlation_id.clone(), Arc::clone(&cell));
                cell
            }
        };
        cell.attach(sender);
        CompletionHandle {
            correlation_id,
            receiver,
        }
    }

    /// Abandon `correlation_id`. No callback is delivered for it afterwards
    /// and its completion handle resolves to `Cancelled`.
    ///
    /// Returns `false` when no session was active for the id.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let Some(cell) = self.close_cell(correlation_id, false) else {
            return false;
        };
        Counters::bump(&self.counters.cancelled);
        tracing::debug!(correlation_id = %correlation_id, "stream session cancelled");
        cell.resolve(Err(StreamError::Cancelled));
        true
    }

    /// Expire every session without an event for longer than `max_idle`.
    /// Their handles resolve to `TimedOut`; no callback is issued.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let now_ms = self.now_ms();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            shard.lock().retain(|id, cell| {
                if cell.idle_ms(now_ms) > max_idle_ms {
                    expired.push((id.clone(), Arc::clone(cell)));
                    false
                } else {
                    true
                }
            });
        }
        let mut reaped = 0;
        for (id, cell) in expired {
            self.retire(&id);
            if !cell.close() {
                continue;
            }
            cell.resolve(Err(StreamError::TimedOut));
            Counters::bump(&self.counters.timed_out);
            reaped += 1;
        }
        if reaped > 0 {
            tracing::info!(reaped, "expired idle stream sessions");
        }
        reaped
    }

    /// [`Self::reap_idle`] with the configured idle timeout. Does nothing
    /// when the timeout is disabled.
    pub fn reap_idle_expired(&self) -> usize {
        self.idle_timeout.map_or(0, |max_idle| self.reap_idle(max_idle))
    }

    // -- introspection ------------------------------------------------------

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    #[must_use]
    pub fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.shard(correlation_id).lock().contains_key(correlation_id)
    }

    #[must_use]
    pub fn is_retired(&self, correlation_id: &CorrelationId) -> bool {
        self.retired.lock().contains(correlation_id)
    }

    #[must_use]
    pub fn stats(&self) -> DemuxStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DemuxStats {
            active: self.active_sessions(),
            opened: load(&self.counters.opened),
            completed: load(&self.counters.completed),
            failed: load(&self.counters.failed),
            cancelled: load(&self.counters.cancelled),
            timed_out: load(&self.counters.timed_out),
            dropped_events: load(&self.counters.dropped_events),
        }
    }

    // -- internals ----------------------------------------------------------

    fn shard(&self, correlation_id: &CorrelationId) -> &Shard {
        let mut hasher = FxHasher::default();
        correlation_id.as_str().hash(&mut hasher);
        let len = u64::try_from(self.shards.len()).unwrap_or(1);
        let index = usize::try_from(hasher.finish() % len).unwrap_or(0);
        &self.shards[index]
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn new_cell(
        &self,
        correlation_id: &CorrelationId,
        tracker: TagStateTracker,
    ) -> Arc<SessionCell> {
        Counters::bump(&self.counters.opened);
        tracing::debug!(correlation_id = %correlation_id, "stream session opened");
        Arc::new(SessionCell::new(
            StreamSession::new(correlation_id.clone(), tracker),
            self.now_ms(),
        ))
    }

    /// Session for a non-terminal event; `None` when the id is retired.
    fn open_cell(&self, correlation_id: &CorrelationId) -> Option<Arc<SessionCell>> {
        let mut shard = self.shard(correlation_id).lock();
        if let Some(cell) = shard.get(correlation_id) {
            return Some(Arc::clone(cell));
        }
        if self.retired.lock().contains(correlation_id) {
            drop(shard);
            self.drop_late_event(correlation_id);
            return None;
        }
        let tracker = TagStateTracker::with_markers(Arc::clone(&self.markers));
        let cell = self.new_cell(correlation_id, tracker);
        shard.insert(correlation_id.clone(), Arc::clone(&cell));
        Some(cell)
    }

    /// Remove and close the session for a terminal outcome. With
    /// `open_missing`, an id never seen before gets a fresh, empty session so
    /// the handler still hears about its terminal event. Retired ids yield
    /// `None`.
    fn close_cell(
        &self,
        correlation_id: &CorrelationId,
        open_missing: bool,
    ) -> Option<Arc<SessionCell>> {
        let removed = self.shard(correlation_id).lock().remove(correlation_id);
        let cell = match removed {
            Some(cell) => cell,
            None if !open_missing => return None,
            None => {
                if self.retired.lock().contains(correlation_id) {
                    self.drop_late_event(correlation_id);
                    return None;
                }
                let tracker = TagStateTracker::with_markers(Arc::clone(&self.markers));
                self.new_cell(correlation_id, tracker)
            }
        };
        self.retire(correlation_id);
        cell.close().then_some(cell)
    }

    fn retire(&self, correlation_id: &CorrelationId) {
        self.retired.lock().insert(correlation_id);
    }

    fn drop_late_event(&self, correlation_id: &CorrelationId) {
        Counters::bump(&self.counters.dropped_events);
        tracing::debug!(
            correlation_id = %correlation_id,
            "dropping event for retired correlation id"
        );
    }
}

impl<H: StreamHandler + ?Sized + 'static> StreamDemultiplexer<H> {
    /// Periodically expire idle sessions on the current tokio runtime.
    ///
    /// Returns `None` when no idle timeout is configured. The task stops by
    /// itself once the demultiplexer is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let max_idle = self.idle_timeout?;
        let demux: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = demux.upgrade() else {
                    break;
                };
                live.reap_idle(max_idle);
            }
        }))
    }
}
