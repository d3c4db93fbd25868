//! The request cache.
//!
//! [`QueryStore`] keeps the last known good value of every read, keyed by
//! [`QueryKey`]. It tracks staleness and subscribers, evicts unobserved
//! entries after [`QueryConfig::cache_time`], and de-duplicates concurrent
//! fetches of the same key.
//!
//! Every operation locks a single entry and never holds the lock across an
//! await, so each call is atomic on its own. There is no atomicity across
//! entries.
//!
//! A started fetch runs on its own task when a runtime is available. Callers
//! only wait for it, so dropping a caller never strands an entry in
//! [`EntryStatus::Loading`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, EntryState, EntryStatus, ErasedValue, SnapshotHandle};
use crate::config::QueryConfig;
use crate::error::CallError;
use crate::invalidation::{InvalidationScope, invalidation_targets};
use crate::key::QueryKey;
use crate::meta::QueryMeta;

pub(crate) type FetchResult = Result<ErasedValue, CallError>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
pub(crate) type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

/// A change notification emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The data or status of an entry changed.
    Updated(QueryKey),
    /// An entry was marked stale.
    Invalidated(QueryKey),
    /// An unobserved entry was evicted.
    Removed(QueryKey),
    /// The whole store was cleared.
    Cleared,
}

impl CacheEvent {
    /// Returns the key this event is about, or `None` for [`CacheEvent::Cleared`].
    #[must_use]
    pub const fn key(&self) -> Option<&QueryKey> {
        match self {
            Self::Updated(key) | Self::Invalidated(key) | Self::Removed(key) => Some(key),
            Self::Cleared => None,
        }
    }
}

/// How to refetch an entry when it is invalidated while observed.
#[derive(Clone)]
pub(crate) struct Registration {
    pub fetcher: ErasedFetcher,
    pub meta: QueryMeta,
    pub stale_time: Duration,
}

struct InFlight {
    id: u64,
    token: CancellationToken,
    previous: EntryStatus,
    // Set when the entry is invalidated while this fetch runs.
    stale_on_settle: bool,
    future: SharedFetch,
}

struct Slot {
    state: EntryState,
    subscribers: usize,
    registration: Option<Registration>,
    fetch: Option<InFlight>,
    gc_generation: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: EntryState::idle(),
            subscribers: 0,
            registration: None,
            fetch: None,
            gc_generation: 0,
        }
    }

    fn skips_global(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|registration| registration.meta.skips_global_invalidation())
    }
}

struct StoreInner {
    entries: DashMap<QueryKey, Slot>,
    events: broadcast::Sender<CacheEvent>,
    config: QueryConfig,
    next_fetch_id: AtomicU64,
    epoch: AtomicU64,
}

/// Keyed storage of server-fetched data.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct QueryStore {
    inner: Arc<StoreInner>,
}

impl QueryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: QueryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                events,
                config,
                next_fetch_id: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the entry at `key`.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner
            .entries
            .get(key)
            .map(|slot| CacheEntry::from_state(key.clone(), &slot.state, slot.subscribers))
    }

    /// Returns the cached value at `key` if it exists and has type `T`.
    #[must_use]
    pub fn data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        let data = self.inner.entries.get(key)?.state.data.clone()?;
        data.downcast::<T>().ok()
    }

    /// Returns all cached keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<_> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Replaces the value at `key` and notifies subscribers.
    ///
    /// The entry becomes fresh: status success, not stale, updated now.
    pub fn set<T: Send + Sync + 'static>(&self, key: QueryKey, data: T) {
        self.set_erased(key, Arc::new(data));
    }

    /// Same as [`QueryStore::set`] for an already type-erased value.
    pub fn set_erased(&self, key: QueryKey, data: ErasedValue) {
        let unobserved = {
            let mut slot = self.inner.entries.entry(key.clone()).or_insert_with(Slot::new);
            slot.state.update(data);
            slot.subscribers == 0
        };
        trace!(key = %key, "cache entry set");
        self.emit(CacheEvent::Updated(key.clone()));
        if unobserved {
            self.schedule_gc(key);
        }
    }

    /// Marks the entry at `key` stale. Its data is kept and still served.
    ///
    /// A fetch already in flight was sent before this call, so its result is
    /// stored as stale too. Returns `false` if there is no such entry.
    pub fn mark_stale(&self, key: &QueryKey) -> bool {
        let found = self
            .inner
            .entries
            .get_mut(key)
            .map(|mut slot| {
                slot.state.mark_stale();
                if let Some(fetch) = &mut slot.fetch {
                    fetch.stale_on_settle = true;
                }
            })
            .is_some();
        if found {
            self.emit(CacheEvent::Invalidated(key.clone()));
        }
        found
    }

    /// Registers an observer of `key`, creating the entry if needed.
    ///
    /// A pending eviction is cancelled. Returns the new subscriber count.
    pub fn subscribe(&self, key: &QueryKey) -> usize {
        let mut slot = self.inner.entries.entry(key.clone()).or_insert_with(Slot::new);
        slot.subscribers += 1;
        slot.gc_generation += 1;
        trace!(key = %key, subscribers = slot.subscribers, "subscribed");
        slot.subscribers
    }

    /// Removes an observer of `key`.
    ///
    /// When the last observer leaves, eviction is scheduled after
    /// [`QueryConfig::cache_time`]. Returns the remaining subscriber count.
    pub fn unsubscribe(&self, key: &QueryKey) -> usize {
        let Some(remaining) = self.inner.entries.get_mut(key).map(|mut slot| {
            slot.subscribers = slot.subscribers.saturating_sub(1);
            slot.subscribers
        }) else {
            return 0;
        };
        trace!(key = %key, subscribers = remaining, "unsubscribed");
        if remaining == 0 {
            self.schedule_gc(key.clone());
        }
        remaining
    }

    /// Returns `true` if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|slot| slot.fetch.is_some())
    }

    /// Cancels the in-flight fetch for `key`.
    ///
    /// The late result is discarded and every waiter is woken with
    /// [`CallError::Cancelled`]. Returns `false` if nothing was in flight.
    pub fn cancel_fetch(&self, key: &QueryKey) -> bool {
        let Some(fetch) = self.inner.entries.get_mut(key).and_then(|mut slot| {
            let fetch = slot.fetch.take()?;
            if slot.state.status == EntryStatus::Loading {
                slot.state.status = fetch.previous;
            }
            Some(fetch)
        }) else {
            return false;
        };
        fetch.token.cancel();
        debug!(key = %key, "fetch cancelled");
        self.emit(CacheEvent::Updated(key.clone()));
        true
    }

    /// Puts every entry captured in `snapshot` back into its prior state.
    ///
    /// Entries that did not exist before are removed, or reset to idle if
    /// they have gained observers since. Does nothing if the store was
    /// cleared after the capture began.
    pub fn rollback(&self, snapshot: SnapshotHandle) {
        if snapshot.epoch != self.epoch() {
            debug!(keys = snapshot.len(), "store cleared since capture, rollback skipped");
            return;
        }
        for (key, prior) in snapshot.captured {
            match prior {
                Some(state) => {
                    let unobserved = {
                        let mut slot =
                            self.inner.entries.entry(key.clone()).or_insert_with(Slot::new);
                        slot.state = state;
                        slot.subscribers == 0
                    };
                    self.emit(CacheEvent::Updated(key.clone()));
                    if unobserved {
                        self.schedule_gc(key);
                    }
                }
                None => {
                    let removed = self
                        .inner
                        .entries
                        .remove_if(&key, |_, slot| slot.subscribers == 0 && slot.fetch.is_none())
                        .is_some();
                    if removed {
                        self.emit(CacheEvent::Removed(key));
                        continue;
                    }
                    let reset = self.inner.entries.get_mut(&key).map(|mut slot| {
                        let loading = slot.fetch.is_some();
                        slot.state = EntryState::idle();
                        if loading {
                            slot.state.status = EntryStatus::Loading;
                        }
                    });
                    if reset.is_some() {
                        self.emit(CacheEvent::Updated(key));
                    }
                }
            }
        }
    }

    /// Drops all cached data and cancels every in-flight fetch.
    ///
    /// Used on sign-out so no data of the previous session survives. Observed
    /// entries are kept as empty idle entries so their subscriber counts stay
    /// balanced.
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let mut tokens = Vec::new();
        self.inner.entries.retain(|_, slot| {
            if let Some(fetch) = slot.fetch.take() {
                tokens.push(fetch.token);
            }
            if slot.subscribers == 0 {
                return false;
            }
            slot.state = EntryState::idle();
            slot.gc_generation += 1;
            true
        });
        for token in tokens {
            token.cancel();
        }
        debug!("cache cleared");
        self.emit(CacheEvent::Cleared);
    }

    /// Returns a stream of change notifications.
    ///
    /// Notifications missed by a slow consumer are skipped.
    #[must_use]
    pub fn events(&self) -> BoxStream<'static, CacheEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Returns how many times the store was cleared.
    pub(crate) fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Starts an empty capture bound to the current clear count.
    pub(crate) fn snapshot(&self) -> SnapshotHandle {
        SnapshotHandle {
            captured: Vec::new(),
            epoch: self.epoch(),
        }
    }

    /// Returns `true` if the entry holds fresh data for `stale_time`.
    pub(crate) fn is_fresh(&self, key: &QueryKey, stale_time: Duration) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|slot| slot.state.is_fresh(stale_time))
    }

    /// Captures the restorable state of `key`. `None` means absent.
    pub(crate) fn capture(&self, key: &QueryKey) -> Option<EntryState> {
        self.inner.entries.get(key).map(|slot| slot.state.clone())
    }

    pub(crate) fn register(&self, key: &QueryKey, registration: Registration) {
        self.inner
            .entries
            .entry(key.clone())
            .or_insert_with(Slot::new)
            .registration = Some(registration);
    }

    pub(crate) fn registration(&self, key: &QueryKey) -> Option<Registration> {
        self.inner.entries.get(key)?.registration.clone()
    }

    /// Returns the registration of `key` if the entry is currently observed.
    pub(crate) fn observed_registration(&self, key: &QueryKey) -> Option<Registration> {
        self.inner
            .entries
            .get(key)
            .filter(|slot| slot.subscribers > 0)?
            .registration
            .clone()
    }

    /// Marks every entry in `scope` stale and returns their keys.
    pub(crate) fn invalidate(&self, scope: &InvalidationScope) -> Vec<QueryKey> {
        let entries: Vec<(QueryKey, bool)> = self
            .inner
            .entries
            .iter()
            .map(|slot| (slot.key().clone(), slot.skips_global()))
            .collect();
        let mut targets = invalidation_targets(scope, entries.iter().map(|(key, skip)| (key, *skip)));
        targets.retain(|key| self.mark_stale(key));
        targets
    }

    /// Joins the in-flight fetch for `key`, or starts one built by `make`.
    ///
    /// `make` runs while the entry is locked and must not touch the store
    /// before its future is first polled. The started fetch is driven on its
    /// own task and writes its result into the entry when it completes,
    /// unless it was cancelled or superseded in the meantime.
    pub(crate) fn join_or_start<F>(&self, key: &QueryKey, make: F) -> SharedFetch
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let future = {
            let mut slot = self.inner.entries.entry(key.clone()).or_insert_with(Slot::new);
            if let Some(fetch) = &slot.fetch {
                trace!(key = %key, "joining in-flight fetch");
                return fetch.future.clone();
            }

            let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
            let token = CancellationToken::new();
            let cancelled = token.clone();
            let call = make();
            let store = Arc::downgrade(&self.inner);
            let settle_key = key.clone();

            let future = async move {
                let result = tokio::select! {
                    biased;
                    () = cancelled.cancelled() => Err(CallError::Cancelled),
                    result = call => result,
                };
                if let Some(inner) = store.upgrade() {
                    QueryStore { inner }.settle(&settle_key, id, &result);
                }
                result
            }
            .boxed()
            .shared();

            let previous = slot.state.status;
            slot.state.status = EntryStatus::Loading;
            slot.fetch = Some(InFlight {
                id,
                token,
                previous,
                stale_on_settle: false,
                future: future.clone(),
            });
            future
        };
        debug!(key = %key, "fetch started");
        self.emit(CacheEvent::Updated(key.clone()));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future.clone());
            }
            Err(_) => trace!(key = %key, "no runtime, fetch runs while awaited"),
        }
        future
    }

    /// Detaches the in-flight fetch for `key` without cancelling it.
    ///
    /// Its waiters still receive its result, but the entry ignores it. The
    /// next [`join_or_start`](Self::join_or_start) starts a new call. Returns
    /// `false` if nothing was in flight.
    pub(crate) fn supersede_fetch(&self, key: &QueryKey) -> bool {
        let superseded = self.inner.entries.get_mut(key).is_some_and(|mut slot| {
            let Some(fetch) = slot.fetch.take() else {
                return false;
            };
            if slot.state.status == EntryStatus::Loading {
                slot.state.status = fetch.previous;
            }
            true
        });
        if superseded {
            debug!(key = %key, "in-flight fetch superseded");
        }
        superseded
    }

    fn settle(&self, key: &QueryKey, id: u64, result: &FetchResult) {
        let unobserved = {
            let Some(mut slot) = self.inner.entries.get_mut(key) else {
                return;
            };
            let Some(fetch) = slot.fetch.take_if(|fetch| fetch.id == id) else {
                trace!(key = %key, "discarding superseded fetch result");
                return;
            };
            match result {
                Ok(data) => {
                    slot.state.update(data.clone());
                    if fetch.stale_on_settle {
                        slot.state.mark_stale();
                    }
                }
                Err(CallError::Cancelled) => {
                    if slot.state.status == EntryStatus::Loading {
                        slot.state.status = fetch.previous;
                    }
                }
                Err(error) => slot.state.fail(error.clone()),
            }
            slot.subscribers == 0
        };
        trace!(key = %key, ok = result.is_ok(), "fetch settled");
        self.emit(CacheEvent::Updated(key.clone()));
        if unobserved {
            self.schedule_gc(key.clone());
        }
    }

    fn schedule_gc(&self, key: QueryKey) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!(key = %key, "no runtime, eviction not scheduled");
            return;
        };
        let Some(generation) = self.inner.entries.get_mut(&key).map(|mut slot| {
            slot.gc_generation += 1;
            slot.gc_generation
        }) else {
            return;
        };
        let store = Arc::downgrade(&self.inner);
        let delay = self.inner.config.cache_time;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = store.upgrade() {
                QueryStore { inner }.evict(&key, generation);
            }
        });
    }

    fn evict(&self, key: &QueryKey, generation: u64) {
        let removed = self
            .inner
            .entries
            .remove_if(key, |_, slot| {
                slot.subscribers == 0 && slot.fetch.is_none() && slot.gc_generation == generation
            })
            .is_some();
        if removed {
            debug!(key = %key, "evicted unobserved entry");
            self.emit(CacheEvent::Removed(key.clone()));
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new(QueryConfig::default())
    }
}

impl fmt::Debug for QueryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStore")
            .field("entries", &self.inner.entries.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
