//! Cached reads.
//!
//! A [`Query`] describes one read: its key, the call that loads it and its
//! per-call options. [`QueryClient::fetch`](crate::QueryClient::fetch) runs it
//! once. [`QueryClient::watch`](crate::QueryClient::watch) turns it into a
//! [`QueryWatch`] stream that emits the entry's state whenever it changes:
//!
//! 1. The current state is emitted immediately, cached data included.
//! 2. If the data is missing or not fresh, a fetch is started.
//! 3. Every later change of the entry (refetches after invalidation, optimistic
//!    writes, rollbacks) is emitted as it happens.
//!
//! The entry counts the stream as a subscriber until the stream is dropped.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::Stream;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::cache::{CacheEntry, EntryStatus, ErasedValue};
use crate::client::QueryClient;
use crate::error::CallError;
use crate::key::QueryKey;
use crate::meta::QueryMeta;
use crate::mutation::RemoteProcedure;
use crate::store::{CacheEvent, ErasedFetcher, QueryStore, Registration};

type FetchFn<T> = dyn Fn() -> BoxFuture<'static, Result<T, CallError>> + Send + Sync;

/// The state of a watched read.
#[derive(Debug)]
pub enum QueryState<T> {
    /// Nothing was fetched yet.
    Idle,
    /// A fetch is in flight. Data of an earlier fetch is kept.
    Loading {
        /// Data of an earlier fetch, if any.
        previous: Option<Arc<T>>,
    },
    /// The last fetch or write succeeded.
    Success {
        /// The data.
        data: Arc<T>,
        /// Whether the data was invalidated and is being replaced.
        is_stale: bool,
    },
    /// The last fetch failed. Data of an earlier fetch is kept.
    Error {
        /// Why the fetch failed.
        error: CallError,
        /// Data of an earlier fetch, if any.
        previous: Option<Arc<T>>,
    },
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Idle => Self::Idle,
            Self::Loading { previous } => Self::Loading {
                previous: previous.clone(),
            },
            Self::Success { data, is_stale } => Self::Success {
                data: data.clone(),
                is_stale: *is_stale,
            },
            Self::Error { error, previous } => Self::Error {
                error: error.clone(),
                previous: previous.clone(),
            },
        }
    }
}

/// A query result containing the current state.
#[derive(Debug)]
pub struct QueryResult<T> {
    /// The key of the read.
    pub key: QueryKey,
    /// The current state.
    pub state: QueryState<T>,
}

impl<T> Clone for QueryResult<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> QueryResult<T> {
    pub(crate) fn from_entry(key: QueryKey, entry: Option<&CacheEntry>) -> Self {
        let state = match entry {
            None => QueryState::Idle,
            Some(entry) => {
                let data = entry.data::<T>();
                let mismatch = entry.data.is_some() && data.is_none();
                match entry.status {
                    _ if mismatch => QueryState::Error {
                        error: CallError::unexpected(format!("cached value at {key} has a different type")),
                        previous: None,
                    },
                    EntryStatus::Idle => QueryState::Idle,
                    EntryStatus::Loading => QueryState::Loading { previous: data },
                    EntryStatus::Success => match data {
                        Some(data) => QueryState::Success {
                            data,
                            is_stale: entry.is_stale,
                        },
                        None => QueryState::Idle,
                    },
                    EntryStatus::Error => QueryState::Error {
                        error: entry
                            .error
                            .clone()
                            .unwrap_or_else(|| CallError::unexpected("fetch failed")),
                        previous: data,
                    },
                }
            }
        };
        Self { key, state }
    }
}

impl<T> QueryResult<T> {
    /// Returns the best data available: the current value, or the previous
    /// one while loading or after a failure.
    pub fn data(&self) -> Option<&T> {
        match &self.state {
            QueryState::Success { data, .. } => Some(data),
            QueryState::Loading { previous } | QueryState::Error { previous, .. } => {
                previous.as_deref()
            }
            QueryState::Idle => None,
        }
    }

    /// Returns the error if the last fetch failed.
    pub const fn error(&self) -> Option<&CallError> {
        match &self.state {
            QueryState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if the query is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.state, QueryState::Loading { .. })
    }

    /// Returns `true` if the query succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.state, QueryState::Success { .. })
    }

    /// Returns `true` if the query failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.state, QueryState::Error { .. })
    }

    /// Returns `true` if the query data is stale.
    pub const fn is_stale(&self) -> bool {
        matches!(self.state, QueryState::Success { is_stale: true, .. })
    }
}

/// A read: key, loader and options.
pub struct Query<T> {
    key: QueryKey,
    fetcher: Arc<FetchFn<T>>,
    meta: QueryMeta,
    stale_time: Option<Duration>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: self.fetcher.clone(),
            meta: self.meta.clone(),
            stale_time: self.stale_time,
        }
    }
}

impl<T> Query<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a read of `key` loaded by `fetcher`.
    pub fn new<F, Fut>(key: QueryKey, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        Self {
            key,
            fetcher: Arc::new(move || fetcher().boxed()),
            meta: QueryMeta::default(),
            stale_time: None,
        }
    }

    /// Creates a read of `key` that calls `procedure` with `input`.
    pub fn from_procedure<I>(key: QueryKey, procedure: RemoteProcedure<I, T>, input: I) -> Self
    where
        I: Clone + Send + Sync + 'static,
    {
        Self::new(key, move || procedure.call(input.clone()))
    }

    /// Sets the per-call options.
    #[must_use]
    pub fn meta(mut self, meta: QueryMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Overrides the client's stale time for this read.
    #[must_use]
    pub const fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Returns the key.
    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Returns the per-call options.
    #[must_use]
    pub const fn query_meta(&self) -> &QueryMeta {
        &self.meta
    }

    pub(crate) fn resolved_stale_time(&self, default: Duration) -> Duration {
        self.stale_time.unwrap_or(default)
    }

    pub(crate) fn registration(&self, default_stale_time: Duration) -> Registration {
        let fetcher = self.fetcher.clone();
        let erased: ErasedFetcher = Arc::new(move || {
            fetcher()
                .map(|result| result.map(|data| Arc::new(data) as ErasedValue))
                .boxed()
        });
        Registration {
            fetcher: erased,
            meta: self.meta.clone(),
            stale_time: self.resolved_stale_time(default_stale_time),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("meta", &self.meta)
            .field("stale_time", &self.stale_time)
            .finish_non_exhaustive()
    }
}

/// Keeps an entry's subscriber count raised while alive.
struct SubscriptionGuard {
    store: QueryStore,
    key: QueryKey,
}

impl SubscriptionGuard {
    fn new(store: QueryStore, key: QueryKey) -> Self {
        store.subscribe(&key);
        Self { store, key }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.key);
    }
}

/// Internal state of a [`QueryWatch`].
struct WatchState {
    client: QueryClient,
    key: QueryKey,
    events: broadcast::Receiver<CacheEvent>,
    last: Option<Option<CacheEntry>>,
    needs_fetch: bool,
    _guard: SubscriptionGuard,
}

impl WatchState {
    fn changed(&self, current: Option<&CacheEntry>) -> bool {
        match (&self.last, current) {
            (None, _) => true,
            (Some(None), None) => false,
            (Some(Some(last)), Some(current)) => !last.same_view(current),
            (Some(_), _) => true,
        }
    }

    async fn next_relevant_event(&mut self) -> bool {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.key().is_none_or(|key| *key == self.key) {
                        return true;
                    }
                }
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }
}

/// A stream of [`QueryResult`]s for one key.
///
/// Created by [`QueryClient::watch`](crate::QueryClient::watch). Consecutive
/// identical states are emitted once.
pub struct QueryWatch<T> {
    key: QueryKey,
    inner: BoxStream<'static, QueryResult<T>>,
}

impl<T: Send + Sync + 'static> QueryWatch<T> {
    pub(crate) fn new(client: QueryClient, key: QueryKey, needs_fetch: bool) -> Self {
        let store = client.store().clone();
        // Listen before anything can change.
        let events = store.subscribe_events();
        let state = WatchState {
            _guard: SubscriptionGuard::new(store, key.clone()),
            client,
            key: key.clone(),
            events,
            last: None,
            needs_fetch,
        };

        let inner = stream::unfold(state, |mut state| async move {
            if std::mem::take(&mut state.needs_fetch) {
                state.client.spawn_refetch(&state.key);
            }
            loop {
                let current = state.client.store().get(&state.key);
                if state.changed(current.as_ref()) {
                    let result = QueryResult::from_entry(state.key.clone(), current.as_ref());
                    state.last = Some(current);
                    return Some((result, state));
                }
                if !state.next_relevant_event().await {
                    return None;
                }
            }
        })
        .boxed();

        Self { key, inner }
    }
}

impl<T> QueryWatch<T> {
    /// Returns the watched key.
    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl<T> Stream for QueryWatch<T> {
    type Item = QueryResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for QueryWatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryWatch").field("key", &self.key).finish_non_exhaustive()
    }
}
