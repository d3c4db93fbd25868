//! Writes with optimistic updates.
//!
//! A [`Mutation`] bundles one call of a [`RemoteProcedure`] with an optional
//! optimistic patch. Executing it runs the following steps:
//!
//! 1. The patch writes its guess into the store. Every touched key has its
//!    in-flight read cancelled and its prior state captured first.
//! 2. The procedure is called once. Writes are never retried.
//! 3. On success the capture is dropped, the reconcile hook runs, the
//!    invalidation policy marks related entries stale and observed ones are
//!    refetched.
//! 4. On failure every touched entry is restored exactly and the error is
//!    dispatched with the mutation's meta.
//!
//! If the store is cleared while the call is in flight, neither the rollback
//! nor the reconcile hook writes to it.
//!
//! Overlapping mutations are not serialized. If two patches touch the same
//! key, the last one to write is what subscribers see until the server
//! answers.
//!
//! # Example
//!
//! ```rust,ignore
//! let saved = query_key!["saved-words", "es"];
//! Mutation::new(api.save_word(), word.clone())
//!     .optimistic(move |patch| {
//!         patch.update::<Vec<Word>>(saved, |words| words.push(word));
//!     })
//!     .meta(MutationMeta::new().with_error_message("Could not save word"))
//!     .execute(&client)
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::cache::SnapshotHandle;
use crate::client::QueryClient;
use crate::dispatch::DispatchContext;
use crate::error::CallError;
use crate::invalidation::InvalidationScope;
use crate::key::QueryKey;
use crate::meta::{ErrorDisplay, MutationMeta};
use crate::store::QueryStore;

type CallFn<I, O> = dyn Fn(I) -> BoxFuture<'static, Result<O, CallError>> + Send + Sync;

/// An opaque async server call with a typed input and output.
///
/// The name identifies the procedure in logs and error reports.
pub struct RemoteProcedure<I, O> {
    name: &'static str,
    call: Arc<CallFn<I, O>>,
}

impl<I, O> Clone for RemoteProcedure<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            call: self.call.clone(),
        }
    }
}

impl<I: 'static, O: 'static> RemoteProcedure<I, O> {
    /// Wraps an async function as a procedure.
    pub fn new<F, Fut>(name: &'static str, call: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, CallError>> + Send + 'static,
    {
        Self {
            name,
            call: Arc::new(move |input| call(input).boxed()),
        }
    }

    /// Returns the procedure name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Invokes the procedure.
    pub fn call(&self, input: I) -> BoxFuture<'static, Result<O, CallError>> {
        (self.call)(input)
    }
}

impl<I, O> fmt::Debug for RemoteProcedure<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteProcedure").field(&self.name).finish()
    }
}

/// Write access to the store during an optimistic patch.
///
/// Every key is captured before its first write, so the whole patch can be
/// undone.
pub struct OptimisticPatch<'a> {
    store: &'a QueryStore,
    snapshot: &'a mut SnapshotHandle,
}

impl OptimisticPatch<'_> {
    /// Returns the current value at `key`.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.store.data::<T>(key)
    }

    /// Replaces the value at `key`.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: QueryKey, data: T) {
        self.touch(&key);
        self.store.set(key, data);
    }

    /// Edits a copy of the value at `key` and writes it back.
    ///
    /// Does nothing and returns `false` if there is no value of type `T`.
    pub fn update<T>(&mut self, key: QueryKey, edit: impl FnOnce(&mut T)) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(current) = self.store.data::<T>(&key) else {
            return false;
        };
        self.touch(&key);
        let mut next = T::clone(&current);
        edit(&mut next);
        self.store.set(key, next);
        true
    }

    /// Returns the keys touched so far.
    pub fn touched(&self) -> impl Iterator<Item = &QueryKey> {
        self.snapshot.keys()
    }

    fn touch(&mut self, key: &QueryKey) {
        if self.snapshot.contains(key) {
            return;
        }
        self.store.cancel_fetch(key);
        self.snapshot
            .captured
            .push((key.clone(), self.store.capture(key)));
    }
}

type PatchFn = Box<dyn FnOnce(&mut OptimisticPatch<'_>) + Send>;
type ReconcileFn<O> = Box<dyn FnOnce(&O, &QueryStore) + Send>;

/// A single write.
pub struct Mutation<I, O> {
    procedure: RemoteProcedure<I, O>,
    variables: I,
    optimistic: Option<PatchFn>,
    on_success: Option<ReconcileFn<O>>,
    meta: MutationMeta,
}

impl<I, O> Mutation<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Creates a write of `variables` through `procedure`.
    pub fn new(procedure: RemoteProcedure<I, O>, variables: I) -> Self {
        Self {
            procedure,
            variables,
            optimistic: None,
            on_success: None,
            meta: MutationMeta::default(),
        }
    }

    /// Sets the optimistic patch applied before the call.
    #[must_use]
    pub fn optimistic(mut self, patch: impl FnOnce(&mut OptimisticPatch<'_>) + Send + 'static) -> Self {
        self.optimistic = Some(Box::new(patch));
        self
    }

    /// Sets a hook that reconciles the store with the server's answer.
    ///
    /// Runs after the patch is committed and before invalidation.
    #[must_use]
    pub fn on_success(mut self, reconcile: impl FnOnce(&O, &QueryStore) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(reconcile));
        self
    }

    /// Sets the per-call options.
    #[must_use]
    pub fn meta(mut self, meta: MutationMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Runs the write against `client`.
    ///
    /// # Errors
    ///
    /// Returns the procedure's error after rolling back the optimistic patch
    /// and dispatching the error's side effects.
    pub async fn execute(self, client: &QueryClient) -> Result<O, CallError> {
        let Self {
            procedure,
            variables,
            optimistic,
            on_success,
            meta,
        } = self;
        let name = procedure.name();
        let store = client.store();

        let mut snapshot = store.snapshot();
        if let Some(patch) = optimistic {
            patch(&mut OptimisticPatch {
                store,
                snapshot: &mut snapshot,
            });
            debug!(mutation = name, touched = snapshot.len(), "optimistic patch applied");
        }

        match procedure.call(variables).await {
            Ok(output) => {
                let cleared = snapshot.epoch != store.epoch();
                drop(snapshot);
                if let Some(reconcile) = on_success {
                    if cleared {
                        debug!(mutation = name, "store cleared during the call, reconcile skipped");
                    } else {
                        reconcile(&output, store);
                    }
                }
                let scope = InvalidationScope::from_invalidates(meta.invalidates.as_deref());
                debug!(mutation = name, ?scope, "mutation succeeded");
                let refetches = client.start_invalidation(&scope);
                client.dispatcher().dispatch_success(&meta);
                refetches.await;
                Ok(output)
            }
            Err(error) => {
                let scope = failure_scope(&snapshot, &meta);
                if !snapshot.is_empty() {
                    debug!(mutation = name, restored = snapshot.len(), "rolling back optimistic patch");
                    store.rollback(snapshot);
                }
                client.handle_error(
                    &error,
                    &ErrorDisplay::from(&meta),
                    &DispatchContext::mutation(name, scope),
                );
                Err(error)
            }
        }
    }
}

impl<I, O> fmt::Debug for Mutation<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("procedure", &self.procedure)
            .field("optimistic", &self.optimistic.is_some())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Entries to reload once a paywall raised by a failed write is dismissed.
fn failure_scope(snapshot: &SnapshotHandle, meta: &MutationMeta) -> InvalidationScope {
    let mut keys: Vec<QueryKey> = snapshot.keys().cloned().collect();
    for key in meta.invalidates.iter().flatten() {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    if keys.is_empty() {
        InvalidationScope::Global
    } else {
        InvalidationScope::Keys(keys)
    }
}
