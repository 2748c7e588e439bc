//! Per-field debounced autosave.
//!
//! A [`Synchronizer`] coalesces bursts of edits to the same (entity, field)
//! pair into a single [`FieldPersister::persist_field`] call once the pair has
//! been quiet for the configured period. Only the last value of a burst is
//! sent. Pairs never share timers: editing a note's title does not delay the
//! flush of its content, nor the title of another note.
//!
//! An edit carrying the same value as the one already pending still restarts
//! the quiet period.
//!
//! A failed flush is reported once through the error handler and is not
//! retried. The pair's entry is gone by then, so the next edit starts a fresh
//! cycle.
//!
//! At most one persistence call per pair runs at a time. A flush that falls
//! due while the pair's previous value is still being saved waits for that
//! call and then goes out, so the server always ends on the newest value.

use async_trait::async_trait;
use futures_util::future::{join_all, Abortable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::scheduler::{Scheduler, TaskHandle, TokioScheduler};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(5000);

/// Identifier of the record owning the edited fields.
pub trait EntityKey: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static {
    /// Whether the key can name a persisted record. Invalid keys are
    /// rejected by [`Synchronizer::notify_edit`].
    fn is_valid(&self) -> bool;
}

impl EntityKey for i64 {
    fn is_valid(&self) -> bool {
        *self > 0
    }
}

impl EntityKey for u64 {
    fn is_valid(&self) -> bool {
        *self > 0
    }
}

impl EntityKey for String {
    fn is_valid(&self) -> bool {
        !self.trim().is_empty()
    }
}

/// Composite key scoping one debounce timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey<K> {
    pub entity: K,
    pub field: String,
}

impl<K> FieldKey<K> {
    pub fn new(entity: K, field: impl Into<String>) -> Self {
        Self {
            entity,
            field: field.into(),
        }
    }
}

impl<K: fmt::Display> fmt::Display for FieldKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid entity key: {0:?}")]
    InvalidEntityKey(String),
    #[error("field name must not be empty")]
    InvalidFieldName,
    #[error("synchronizer has been shut down")]
    Closed,
}

/// What teardown does with persistence calls that have already started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Let them finish; only flushes still waiting out their quiet period are
    /// cancelled.
    #[default]
    Complete,
    /// Drop them as well, abandoning the request.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
    pub in_flight: InFlightPolicy,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
            in_flight: InFlightPolicy::default(),
        }
    }
}

/// Remote persistence of a single field.
///
/// Calls must be idempotent: the same latest value may be sent twice (for
/// example by [`Synchronizer::flush_all`] racing a timer). Timeouts and
/// retries are the implementation's business.
#[async_trait]
pub trait FieldPersister<K, V>: Send + Sync {
    async fn persist_field(&self, entity: &K, field: &str, value: &V) -> anyhow::Result<()>;
}

/// A flush whose persistence call failed.
#[derive(Debug)]
pub struct FlushFailure<K, V> {
    pub key: FieldKey<K>,
    pub value: V,
    pub error: anyhow::Error,
}

pub type ErrorHandler<K, V> = Arc<dyn Fn(FlushFailure<K, V>) + Send + Sync>;

/// Counts from [`Synchronizer::flush_all`]. Values handed to a save that was
/// already running for the same pair are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub persisted: usize,
    pub failed: usize,
}

struct PendingFlush<V> {
    ticket: u64,
    value: V,
    handle: TaskHandle,
    // Quiet period is over; waiting for the pair's running save to finish.
    ready: bool,
}

struct InFlight {
    ticket: u64,
    handle: TaskHandle,
}

struct State<K, V> {
    pending: HashMap<FieldKey<K>, PendingFlush<V>>,
    in_flight: HashMap<FieldKey<K>, InFlight>,
    next_ticket: u64,
    closed: bool,
}

struct Shared<K, V> {
    state: Mutex<State<K, V>>,
    persister: Arc<dyn FieldPersister<K, V>>,
    on_error: Option<ErrorHandler<K, V>>,
    idle: Notify,
}

impl<K, V> Shared<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, failure: FlushFailure<K, V>) {
        let error = format!("{:#}", failure.error);
        warn!(key = %failure.key, error = %error, "flush failed");
        if let Some(handler) = &self.on_error {
            handler(failure);
        }
    }
}

pub struct SynchronizerBuilder<K, V> {
    persister: Arc<dyn FieldPersister<K, V>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: DebounceConfig,
    on_error: Option<ErrorHandler<K, V>>,
}

impl<K, V> SynchronizerBuilder<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn config(mut self, config: DebounceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn quiet_period(mut self, quiet_period: Duration) -> Self {
        self.config.quiet_period = quiet_period;
        self
    }

    pub fn in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.config.in_flight = policy;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(FlushFailure<K, V>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Without an explicit scheduler this binds to the current tokio
    /// runtime and panics outside of one.
    pub fn build(self) -> Synchronizer<K, V> {
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()) as Arc<dyn Scheduler>,
        };
        Synchronizer {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_ticket: 0,
                    closed: false,
                }),
                persister: self.persister,
                on_error: self.on_error,
                idle: Notify::new(),
            }),
            scheduler,
            config: self.config,
        }
    }
}

/// Debounced field synchronizer, owned by the view or session whose edits it
/// saves. Dropping it cancels every pending flush.
pub struct Synchronizer<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<K, V>>,
    scheduler: Arc<dyn Scheduler>,
    config: DebounceConfig,
}

impl<K, V> Synchronizer<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(persister: Arc<dyn FieldPersister<K, V>>) -> SynchronizerBuilder<K, V> {
        SynchronizerBuilder {
            persister,
            scheduler: None,
            config: DebounceConfig::default(),
            on_error: None,
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Record that `field` of `entity` now holds `value`.
    ///
    /// Cancels the pair's pending flush, if any, and schedules a new one a
    /// full quiet period from now carrying `value`.
    pub fn notify_edit(&self, entity: K, field: &str, value: V) -> Result<(), SyncError> {
        if !entity.is_valid() {
            return Err(SyncError::InvalidEntityKey(entity.to_string()));
        }
        if field.trim().is_empty() {
            return Err(SyncError::InvalidFieldName);
        }

        let key = FieldKey::new(entity, field);
        let mut state = self.shared.lock();
        if state.closed {
            return Err(SyncError::Closed);
        }

        if let Some(previous) = state.pending.remove(&key) {
            previous.handle.cancel();
            debug!(key = %key, "edit coalesced, quiet period restarted");
        } else {
            debug!(key = %key, "edit scheduled");
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        // The state lock is held until the entry is inserted, so the task
        // cannot look for it before it exists.
        let task = Box::pin(fire(Arc::clone(&self.shared), key.clone(), ticket));
        let handle = self.scheduler.schedule(self.config.quiet_period, task);
        state.pending.insert(
            key,
            PendingFlush {
                ticket,
                value,
                handle,
                ready: false,
            },
        );
        Ok(())
    }

    /// Cancel every pending flush of `entity`. In-flight persistence calls
    /// for it are aborted too under [`InFlightPolicy::Abort`].
    ///
    /// Returns the number of pending flushes cancelled.
    pub fn cancel_entity(&self, entity: &K) -> usize {
        let cancelled = self.cancel_where(|key| key.entity == *entity);
        if cancelled > 0 {
            debug!(entity = %entity, cancelled, "pending flushes cancelled");
        }
        cancelled
    }

    /// Cancel every pending flush, e.g. on logout.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.cancel_where(|_| true);
        if cancelled > 0 {
            debug!(cancelled, "all pending flushes cancelled");
        }
        cancelled
    }

    /// Cancel everything and refuse further edits.
    pub fn shutdown(&self) -> usize {
        self.shared.lock().closed = true;
        self.cancel_all()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn cancel_where(&self, matches: impl Fn(&FieldKey<K>) -> bool) -> usize {
        let mut state = self.shared.lock();
        let before = state.pending.len();
        state.pending.retain(|key, entry| {
            if matches(key) {
                entry.handle.cancel();
                false
            } else {
                true
            }
        });
        let cancelled = before - state.pending.len();

        if self.config.in_flight == InFlightPolicy::Abort && !state.in_flight.is_empty() {
            state.in_flight.retain(|key, flight| {
                if matches(key) {
                    flight.handle.cancel();
                    debug!(key = %key, "in-flight flush aborted");
                    false
                } else {
                    true
                }
            });
            if state.in_flight.is_empty() {
                self.shared.idle.notify_waiters();
            }
        }
        cancelled
    }

    /// Persist every pending value now instead of waiting for its timer, and
    /// wait until no save is running.
    ///
    /// A pair whose previous value is still being saved gets its pending value
    /// right after that call, as with a timer. Failures go to the error handler
    /// like any other flush.
    pub async fn flush_all(&self) -> FlushSummary {
        let mut started = Vec::new();
        let mut queued = 0;
        {
            let mut state = self.shared.lock();
            let keys: Vec<FieldKey<K>> = state.pending.keys().cloned().collect();
            for key in keys {
                if state.in_flight.contains_key(&key) {
                    if let Some(entry) = state.pending.get_mut(&key) {
                        entry.handle.cancel();
                        entry.ready = true;
                        queued += 1;
                    }
                    continue;
                }
                let Some(entry) = state.pending.remove(&key) else {
                    continue;
                };
                entry.handle.cancel();
                let (handle, registration) = TaskHandle::pair();
                state.in_flight.insert(
                    key.clone(),
                    InFlight {
                        ticket: entry.ticket,
                        handle,
                    },
                );
                started.push((key, entry.ticket, entry.value, registration));
            }
        }

        if !started.is_empty() || queued > 0 {
            info!(count = started.len() + queued, "flushing pending edits");
        }

        let shared = &*self.shared;
        let results = join_all(started.into_iter().map(|(key, ticket, value, registration)| {
            Abortable::new(persist_chain(shared, key, ticket, value), registration)
        }))
        .await;

        let mut summary = FlushSummary::default();
        // Aborted saves count as neither.
        for done in results.into_iter().flatten() {
            summary.persisted += done.persisted;
            summary.failed += done.failed;
        }

        self.wait_idle().await;
        summary
    }

    /// Resolve once no persistence call is running. Pending flushes still
    /// waiting out their quiet period are not waited for.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.lock().in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn is_pending(&self, entity: &K, field: &str) -> bool {
        self.shared
            .lock()
            .pending
            .contains_key(&FieldKey::new(entity.clone(), field))
    }

    /// Latest value waiting to be flushed for the pair.
    pub fn pending_value(&self, entity: &K, field: &str) -> Option<V> {
        self.shared
            .lock()
            .pending
            .get(&FieldKey::new(entity.clone(), field))
            .map(|entry| entry.value.clone())
    }
}

impl<K, V> Drop for Synchronizer<K, V>
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cancel_where(|_| true);
    }
}

async fn fire<K, V>(shared: Arc<Shared<K, V>>, key: FieldKey<K>, ticket: u64)
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    let value = {
        let mut state = shared.lock();
        let busy = state.in_flight.contains_key(&key);
        // A superseded timer may still be woken; only the current ticket
        // flushes.
        let Some(entry) = state.pending.get_mut(&key) else {
            return;
        };
        if entry.ticket != ticket || entry.ready {
            return;
        }
        if busy {
            entry.ready = true;
            debug!(key = %key, "flush queued behind running save");
            return;
        }
        let Some(entry) = state.pending.remove(&key) else {
            return;
        };
        state.in_flight.insert(
            key.clone(),
            InFlight {
                ticket,
                handle: entry.handle,
            },
        );
        entry.value
    };

    persist_chain(&*shared, key, ticket, value).await;
}

/// Save `value`, then any value for the same pair that fell due meanwhile.
/// The caller has registered `key` as in flight under `ticket`.
async fn persist_chain<K, V>(
    shared: &Shared<K, V>,
    key: FieldKey<K>,
    mut ticket: u64,
    mut value: V,
) -> FlushSummary
where
    K: EntityKey,
    V: Clone + Send + Sync + 'static,
{
    let mut summary = FlushSummary::default();
    loop {
        info!(key = %key, "flushing field");
        let result = shared
            .persister
            .persist_field(&key.entity, &key.field, &value)
            .await;

        let next = {
            let mut state = shared.lock();
            let queued = matches!(state.pending.get(&key), Some(entry) if entry.ready);
            match queued.then(|| state.pending.remove(&key)).flatten() {
                Some(entry) => {
                    if let Some(flight) = state.in_flight.get_mut(&key) {
                        flight.ticket = entry.ticket;
                    }
                    Some((entry.ticket, entry.value))
                }
                None => {
                    if matches!(state.in_flight.get(&key), Some(flight) if flight.ticket == ticket) {
                        state.in_flight.remove(&key);
                    }
                    if state.in_flight.is_empty() {
                        shared.idle.notify_waiters();
                    }
                    None
                }
            }
        };

        match result {
            Ok(()) => {
                summary.persisted += 1;
                debug!(key = %key, "field persisted");
            }
            Err(error) => {
                summary.failed += 1;
                shared.report(FlushFailure {
                    key: key.clone(),
                    value,
                    error,
                });
            }
        }

        match next {
            Some((next_ticket, next_value)) => {
                ticket = next_ticket;
                value = next_value;
            }
            None => return summary,
        }
    }
}
