//! Cache entry types.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::CallError;
use crate::key::QueryKey;

/// A type-erased cached value.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Created but never fetched.
    Idle,
    /// A fetch is in flight. Previous data, if any, is still served.
    Loading,
    /// The last fetch or write succeeded.
    Success,
    /// The last fetch failed. Previous data, if any, is still served.
    Error,
}

/// The restorable part of an entry: everything an optimistic patch can change.
#[derive(Clone)]
pub(crate) struct EntryState {
    pub data: Option<ErasedValue>,
    pub status: EntryStatus,
    pub updated_at: Instant,
    pub is_stale: bool,
    pub error: Option<CallError>,
}

impl EntryState {
    /// Creates an empty entry.
    pub fn idle() -> Self {
        Self {
            data: None,
            status: EntryStatus::Idle,
            updated_at: Instant::now(),
            is_stale: false,
            error: None,
        }
    }

    /// Checks if this entry is fresh for the given stale time.
    pub fn is_fresh(&self, stale_time: Duration) -> bool {
        self.status == EntryStatus::Success
            && !self.is_stale
            && self.data.is_some()
            && self.updated_at.elapsed() <= stale_time
    }

    /// Marks this entry as stale.
    pub const fn mark_stale(&mut self) {
        self.is_stale = true;
    }

    /// Updates the entry with new data, resetting timestamp and staleness.
    pub fn update(&mut self, data: ErasedValue) {
        self.data = Some(data);
        self.status = EntryStatus::Success;
        self.updated_at = Instant::now();
        self.is_stale = false;
        self.error = None;
    }

    /// Records a failed fetch. Data is kept.
    pub fn fail(&mut self, error: CallError) {
        self.status = EntryStatus::Error;
        self.error = Some(error);
    }
}

/// A point-in-time view of a cache entry.
#[derive(Clone)]
pub struct CacheEntry {
    /// The key addressing this entry.
    pub key: QueryKey,
    /// The cached value, if any.
    pub data: Option<ErasedValue>,
    /// Lifecycle status.
    pub status: EntryStatus,
    /// When the data was last written.
    pub last_updated_at: Instant,
    /// Whether the entry was invalidated since the last write.
    pub is_stale: bool,
    /// Error of the last fetch, if it failed.
    pub error: Option<CallError>,
    /// Number of active subscribers.
    pub subscriber_count: usize,
}

impl CacheEntry {
    pub(crate) fn from_state(key: QueryKey, state: &EntryState, subscriber_count: usize) -> Self {
        Self {
            key,
            data: state.data.clone(),
            status: state.status,
            last_updated_at: state.updated_at,
            is_stale: state.is_stale,
            error: state.error.clone(),
            subscriber_count,
        }
    }

    /// Returns the cached value downcast to `T`.
    ///
    /// Returns `None` if there is no value or it has a different type.
    #[must_use]
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }

    /// Compares everything a reader can see, ignoring subscriber bookkeeping.
    pub(crate) fn same_view(&self, other: &Self) -> bool {
        let same_data = match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_data
            && self.status == other.status
            && self.last_updated_at == other.last_updated_at
            && self.is_stale == other.is_stale
            && self.error == other.error
    }
}

impl PartialEq for CacheEntry {
    /// Values are compared by handle, so a restored entry equals the original
    /// one only if it holds the exact same value.
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.subscriber_count == other.subscriber_count
            && self.same_view(other)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("data", &self.data.as_ref().map(Arc::as_ptr))
            .field("status", &self.status)
            .field("last_updated_at", &self.last_updated_at)
            .field("is_stale", &self.is_stale)
            .field("error", &self.error)
            .field("subscriber_count", &self.subscriber_count)
            .finish()
    }
}

/// Everything an optimistic patch touched, captured before the patch applied.
///
/// Restoring it through [`QueryStore::rollback`](crate::QueryStore::rollback)
/// puts every touched entry back into its exact prior state. Dropping it
/// commits the patch.
#[derive(Default)]
pub struct SnapshotHandle {
    pub(crate) captured: Vec<(QueryKey, Option<EntryState>)>,
    /// Clear count of the store when the capture began.
    pub(crate) epoch: u64,
}

impl SnapshotHandle {
    /// Returns the keys captured by this snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.captured.iter().map(|(key, _)| key)
    }

    /// Returns `true` if `key` was captured.
    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.captured.iter().any(|(captured, _)| captured == key)
    }

    /// Returns the number of captured entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.captured.len()
    }

    /// Returns `true` if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }
}

impl fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
