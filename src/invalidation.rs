//! Invalidation policy applied after successful writes.
//!
//! The policy is a pure function of the scope and the entries currently in the
//! store, so it can be tested without a running cache.

use crate::key::QueryKey;

/// Which cached entries a successful write makes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Leave every entry untouched.
    Skip,
    /// Every entry, except those whose read opted out of global invalidation.
    Global,
    /// Entries equal to or prefixed by one of the keys.
    ///
    /// Read-side opt-outs do not apply: an explicit key always wins.
    Keys(Vec<QueryKey>),
}

impl InvalidationScope {
    /// Resolves the `invalidates` field of a mutation's meta.
    ///
    /// Absent means global, an empty list means skip.
    #[must_use]
    pub fn from_invalidates(invalidates: Option<&[QueryKey]>) -> Self {
        match invalidates {
            None => Self::Global,
            Some([]) => Self::Skip,
            Some(keys) => Self::Keys(keys.to_vec()),
        }
    }

    /// Creates a scope targeting a single key and everything below it.
    #[must_use]
    pub fn key(key: QueryKey) -> Self {
        Self::Keys(vec![key])
    }

    /// Returns `true` if an entry at `key` falls into this scope.
    #[must_use]
    pub fn matches(&self, key: &QueryKey, skip_global: bool) -> bool {
        match self {
            Self::Skip => false,
            Self::Global => !skip_global,
            Self::Keys(targets) => targets.iter().any(|target| key.starts_with(target)),
        }
    }

    /// Returns `true` if this scope never matches anything.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        match self {
            Self::Skip => true,
            Self::Keys(targets) => targets.is_empty(),
            Self::Global => false,
        }
    }
}

/// Selects the entries to mark stale.
///
/// `entries` yields each cached key along with its read-side
/// `skip_global_invalidation` flag. The result keeps the input order.
pub fn invalidation_targets<'a>(
    scope: &InvalidationScope,
    entries: impl IntoIterator<Item = (&'a QueryKey, bool)>,
) -> Vec<QueryKey> {
    if scope.is_skip() {
        return Vec::new();
    }
    entries
        .into_iter()
        .filter(|(key, skip_global)| scope.matches(key, *skip_global))
        .map(|(key, _)| key.clone())
        .collect()
}
