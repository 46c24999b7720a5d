// =============================================================================
// Stream Subscription Manager - one push connection per (symbol, channel)
// =============================================================================
//
// Per identity the lifecycle is an explicit state machine:
//
//   Unsubscribed → Connecting → Live ⇄ Reconnecting → … → Unsubscribed
//
// Each live identity is driven by exactly one task that owns the connection.
// On disconnect the same task sleeps for the reconnect delay and reopens the
// stream, so there is never a second concurrent connection for an identity.
// A disconnected identity keeps reconnecting for as long as it is
// subscribed. Every timer and connect attempt, the very first one included,
// races the identity's cancellation token, so `unsubscribe` stops pending
// attempts instead of letting them resurrect the connection.
//
// Listeners are kept apart from connections and survive reconnects.
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::market_data::DepthSequencer;
use crate::retry::{retry, RetryPolicy};
use crate::stream::channel::StreamId;
use crate::stream::event::{decode_event, MarketEvent};
use crate::stream::transport::{FrameStream, StreamTransport};

/// Callback invoked for every decoded event of an identity.
pub type Listener = Arc<dyn Fn(&MarketEvent) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Unsubscribed,
    Connecting,
    Live,
    Reconnecting,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StreamCounters {
    frames_received: AtomicU64,
    events_dispatched: AtomicU64,
    malformed_messages: AtomicU64,
    stale_depth_dropped: AtomicU64,
    reconnects: AtomicU64,
    failed_reconnects: AtomicU64,
}

/// Point-in-time counters for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub frames_received: u64,
    pub events_dispatched: u64,
    pub malformed_messages: u64,
    pub stale_depth_dropped: u64,
    pub reconnects: u64,
    /// Reconnect rounds whose retries all failed.
    pub failed_reconnects: u64,
}

impl StreamCounters {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            stale_depth_dropped: self.stale_depth_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            failed_reconnects: self.failed_reconnects.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    transport: Arc<dyn StreamTransport>,
    reconnect_delay: Duration,
    retry: RetryPolicy,
    states: RwLock<HashMap<StreamId, SubscriptionState>>,
    listeners: RwLock<HashMap<StreamId, Vec<(ListenerId, Listener)>>>,
    counters: RwLock<HashMap<StreamId, Arc<StreamCounters>>>,
}

impl Shared {
    fn counters(&self, id: &StreamId) -> Arc<StreamCounters> {
        if let Some(c) = self.counters.read().get(id) {
            return c.clone();
        }
        self.counters.write().entry(id.clone()).or_default().clone()
    }

    fn set_state(&self, id: &StreamId, state: SubscriptionState) {
        self.states.write().insert(id.clone(), state);
    }

    async fn connect(&self, id: &StreamId) -> Result<FrameStream, IngestError> {
        retry(&self.retry, "stream connect", || self.transport.connect(id)).await
    }

    /// Connect with the retry policy, giving up early once `cancel` fires.
    async fn connect_cancellable(
        &self,
        id: &StreamId,
        cancel: &CancellationToken,
    ) -> Option<Result<FrameStream, IngestError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.connect(id) => Some(r),
        }
    }

    fn handle_frame(
        &self,
        id: &StreamId,
        text: &str,
        sequencer: &mut DepthSequencer,
        counters: &StreamCounters,
        cancel: &CancellationToken,
    ) {
        counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let event = match decode_event(id, text) {
            Ok(event) => event,
            Err(e) => {
                counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!(stream = %id, error = %e, "dropping undecodable message");
                return;
            }
        };

        if let MarketEvent::Depth(snapshot) = &event {
            if !sequencer.admit(snapshot) {
                counters.stale_depth_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    stream = %id,
                    last_update_id = snapshot.last_update_id,
                    "discarding stale depth snapshot"
                );
                return;
            }
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(id)
            .map(|v| v.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        if cancel.is_cancelled() {
            return;
        }

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(stream = %id, "listener panicked");
            }
        }
        counters.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

/// Teardown handle of one identity. Present from the first connect attempt
/// on; `task` is filled in once the connection is open.
struct Running {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// SubscriptionManager
// ---------------------------------------------------------------------------

/// Lock order is `running` before `states`.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
    running: Mutex<HashMap<StreamId, Running>>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        reconnect_delay: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                reconnect_delay,
                retry,
                states: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                counters: RwLock::new(HashMap::new()),
            }),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Open the push connection for `id` unless one is already open or
    /// being opened.
    ///
    /// The first connect is retried per the retry policy; running out of
    /// attempts is returned to the caller and leaves `id` Unsubscribed.
    /// An `unsubscribe` issued meanwhile cancels the pending attempts.
    pub async fn subscribe(&self, id: &StreamId) -> Result<(), IngestError> {
        let cancel = {
            let mut running = self.running.lock();
            let mut states = self.shared.states.write();
            match states.get(id) {
                Some(SubscriptionState::Unsubscribed) | None => {
                    states.insert(id.clone(), SubscriptionState::Connecting);
                }
                Some(state) => {
                    debug!(stream = %id, ?state, "already subscribed");
                    return Ok(());
                }
            }
            let cancel = CancellationToken::new();
            let previous = running.insert(
                id.clone(),
                Running {
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            cancel
        };

        let frames = match self.shared.connect_cancellable(id, &cancel).await {
            None => {
                debug!(stream = %id, "subscription torn down during connect");
                return Ok(());
            }
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                let mut running = self.running.lock();
                if !cancel.is_cancelled() {
                    running.remove(id);
                    self.shared.states.write().remove(id);
                }
                error!(stream = %id, error = %e, "subscribe failed");
                return Err(e);
            }
        };

        {
            let mut running = self.running.lock();
            // Our entry is still in place unless unsubscribe took it; a newer
            // entry can only exist after our token was cancelled.
            let entry = match running.get_mut(id) {
                Some(entry) if !cancel.is_cancelled() => entry,
                _ => {
                    debug!(stream = %id, "subscription torn down during connect");
                    return Ok(());
                }
            };
            entry.task = Some(tokio::spawn(run_stream(
                self.shared.clone(),
                id.clone(),
                frames,
                cancel.clone(),
            )));
            self.shared.set_state(id, SubscriptionState::Live);
        }

        info!(stream = %id, "subscription live");
        Ok(())
    }

    /// Register `listener` for `id`. Listeners are called in registration
    /// order and persist across reconnects.
    pub fn add_listener(&self, id: &StreamId, listener: Listener) -> ListenerId {
        let listener_id = ListenerId::new();
        self.shared
            .listeners
            .write()
            .entry(id.clone())
            .or_default()
            .push((listener_id, listener));
        debug!(stream = %id, listener = %listener_id, "listener registered");
        listener_id
    }

    /// Register `listener` and make sure `id` is subscribed.
    pub async fn listen(&self, id: &StreamId, listener: Listener) -> Result<ListenerId, IngestError> {
        let listener_id = self.add_listener(id, listener);
        if let Err(e) = self.subscribe(id).await {
            self.remove_listener(id, listener_id);
            return Err(e);
        }
        Ok(listener_id)
    }

    pub fn remove_listener(&self, id: &StreamId, listener_id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let Some(list) = listeners.get_mut(id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != listener_id);
        let removed = before != list.len();
        if list.is_empty() {
            listeners.remove(id);
        }
        removed
    }

    /// Close the connection for `id`, cancel any pending connect or
    /// reconnect and drop its listeners and stats. Nothing is dispatched for
    /// `id` once this returns.
    pub async fn unsubscribe(&self, id: &StreamId) {
        let running = self.running.lock().remove(id);
        if let Some(running) = running {
            running.cancel.cancel();
            if let Some(task) = running.task {
                if let Err(e) = task.await {
                    warn!(stream = %id, error = %e, "stream task ended abnormally");
                }
            }
        }
        let was = self.shared.states.write().remove(id);
        self.shared.listeners.write().remove(id);
        self.shared.counters.write().remove(id);
        if was.is_some() {
            info!(stream = %id, "unsubscribed");
        }
    }

    /// Tear down every subscription.
    pub async fn shutdown(&self) {
        let mut ids: Vec<StreamId> = self.running.lock().keys().cloned().collect();
        ids.extend(self.shared.states.read().keys().cloned());
        ids.sort_by_key(|id| id.stream_name());
        ids.dedup();

        for id in &ids {
            self.unsubscribe(id).await;
        }
        info!(count = ids.len(), "subscription manager shut down");
    }

    pub fn state(&self, id: &StreamId) -> SubscriptionState {
        self.shared
            .states
            .read()
            .get(id)
            .copied()
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Identities that are connecting, live or reconnecting.
    pub fn active_streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .shared
            .states
            .read()
            .iter()
            .filter(|(_, s)| **s != SubscriptionState::Unsubscribed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by_key(|id| id.stream_name());
        ids
    }

    /// Counters of a subscribed identity; zeroed once it is unsubscribed.
    pub fn stats(&self, id: &StreamId) -> StreamStats {
        self.shared
            .counters
            .read()
            .get(id)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, id: &StreamId) -> usize {
        self.shared.listeners.read().get(id).map_or(0, Vec::len)
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active_streams", &self.active_streams().len())
            .field("reconnect_delay", &self.shared.reconnect_delay)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-identity task
// ---------------------------------------------------------------------------

async fn run_stream(
    shared: Arc<Shared>,
    id: StreamId,
    mut frames: FrameStream,
    cancel: CancellationToken,
) {
    let counters = shared.counters(&id);
    let mut sequencer = DepthSequencer::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                shared.handle_frame(&id, &text, &mut sequencer, &counters, &cancel);
                continue;
            }
            Some(Err(e)) => warn!(stream = %id, error = %e, "stream read error"),
            None => warn!(stream = %id, "stream ended"),
        }

        shared.set_state(&id, SubscriptionState::Reconnecting);
        counters.reconnects.fetch_add(1, Ordering::Relaxed);

        match reopen(&shared, &id, &counters, &cancel).await {
            Some(f) => {
                frames = f;
                shared.set_state(&id, SubscriptionState::Live);
                info!(stream = %id, "reconnected");
            }
            None => break,
        }
    }

    debug!(stream = %id, "stream task cancelled");
}

/// Reopen `id` until it succeeds or `cancel` fires. Each round waits the
/// reconnect delay and then runs a full retry cycle; an exhausted cycle is
/// logged and the next round starts.
async fn reopen(
    shared: &Shared,
    id: &StreamId,
    counters: &StreamCounters,
    cancel: &CancellationToken,
) -> Option<FrameStream> {
    let mut rounds: u64 = 0;
    loop {
        info!(
            stream = %id,
            delay_ms = shared.reconnect_delay.as_millis() as u64,
            rounds,
            "reconnecting"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(shared.reconnect_delay) => {}
        }

        match shared.connect_cancellable(id, cancel).await? {
            Ok(frames) => return Some(frames),
            Err(e) => {
                rounds += 1;
                counters.failed_reconnects.fetch_add(1, Ordering::Relaxed);
                error!(stream = %id, error = %e, rounds, "reconnect attempts exhausted, retrying");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
