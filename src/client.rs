//! The client that wires the cache, the dispatcher and the retry policy.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use tracing::{debug, trace};

use crate::command::{Action, Command};
use crate::config::ClientConfig;
use crate::dispatch::{DispatchContext, Dispatcher, ErrorReporter, Ui};
use crate::error::CallError;
use crate::invalidation::InvalidationScope;
use crate::key::QueryKey;
use crate::meta::ErrorDisplay;
use crate::mutation::Mutation;
use crate::query::{Query, QueryWatch};
use crate::retry::{RequestKind, RetryPolicy};
use crate::store::{FetchResult, QueryStore, Registration, SharedFetch};

struct ClientInner {
    store: QueryStore,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    config: ClientConfig,
}

/// Entry point for reads and writes.
///
/// Each client owns its own [`QueryStore`]. There is no process-wide
/// instance: construct one per session and drop or [clear](QueryClient::clear)
/// it on sign-out. Cloning is cheap and yields a handle to the same client.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use query_sync::mock::RecordingUi;
/// use query_sync::{ClientConfig, DispatchConfig, QueryClient, QueryConfig};
///
/// let client = QueryClient::builder(Arc::new(RecordingUi::new()))
///     .with_config(ClientConfig {
///         query: QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
///         dispatch: DispatchConfig::native(),
///         ..ClientConfig::default()
///     })
///     .build();
/// assert!(client.store().is_empty());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    ui: Arc<dyn Ui>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    config: ClientConfig,
}

impl QueryClientBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Forwards unexpected failures to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> QueryClient {
        let mut dispatcher = Dispatcher::new(self.ui, self.config.dispatch.clone());
        if let Some(reporter) = self.reporter {
            dispatcher = dispatcher.with_reporter(reporter);
        }
        QueryClient {
            inner: Arc::new(ClientInner {
                store: QueryStore::new(self.config.query.clone()),
                dispatcher,
                retry: RetryPolicy::new(self.config.retry.clone()),
                config: self.config,
            }),
        }
    }
}

impl QueryClient {
    /// Creates a client with default configuration.
    #[must_use]
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self::builder(ui).build()
    }

    /// Starts building a client presenting through `ui`.
    #[must_use]
    pub fn builder(ui: Arc<dyn Ui>) -> QueryClientBuilder {
        QueryClientBuilder {
            ui,
            reporter: None,
            config: ClientConfig::default(),
        }
    }

    /// Returns the cache.
    #[must_use]
    pub fn store(&self) -> &QueryStore {
        &self.inner.store
    }

    /// Returns the side-effect dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the value of `query`, loading it if the cache holds nothing fresh.
    ///
    /// Fresh data never reaches the server. Concurrent fetches of the same key
    /// share one call. Failures are retried per the [`RetryPolicy`] and then
    /// dispatched once, no matter how many callers wait.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt. If the fetch was cancelled by an
    /// optimistic write, the written value is returned instead, or
    /// [`CallError::Cancelled`] if there is none.
    pub async fn fetch<T: Send + Sync + 'static>(&self, query: &Query<T>) -> Result<Arc<T>, CallError> {
        let key = query.key();
        let registration = query.registration(self.inner.config.query.stale_time);
        if self.inner.store.is_fresh(key, registration.stale_time) {
            if let Some(data) = self.inner.store.data::<T>(key) {
                trace!(key = %key, "serving fresh data");
                return Ok(data);
            }
        }
        self.inner.store.register(key, registration.clone());
        let result = self.start_fetch(key, &registration).await;
        self.settle_read(key, result)
    }

    /// Observes `query`.
    ///
    /// The returned stream emits the current state right away, loads the data
    /// if it is not fresh, and then emits every change of the entry.
    pub fn watch<T: Send + Sync + 'static>(&self, query: Query<T>) -> QueryWatch<T> {
        let key = query.key().clone();
        let registration = query.registration(self.inner.config.query.stale_time);
        let needs_fetch = !self.inner.store.is_fresh(&key, registration.stale_time);
        self.inner.store.register(&key, registration);
        QueryWatch::new(self.clone(), key, needs_fetch)
    }

    /// Executes `mutation`. Same as [`Mutation::execute`].
    ///
    /// # Errors
    ///
    /// Returns the procedure's error.
    pub async fn mutate<I, O>(&self, mutation: Mutation<I, O>) -> Result<O, CallError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        mutation.execute(self).await
    }

    /// Marks every entry in `scope` stale and waits until the observed ones
    /// are refetched.
    pub async fn invalidate(&self, scope: &InvalidationScope) {
        self.start_invalidation(scope).await;
    }

    /// Clears the cache. Used on sign-out.
    pub fn clear(&self) {
        self.inner.store.clear();
    }

    /// Ends the session: clears the cache and hands over to the UI.
    pub fn sign_out(&self) {
        debug!("signing out");
        self.clear();
        self.inner.dispatcher.ui().sign_out_and_redirect();
    }

    /// Applies an action emitted by a dispatcher command.
    pub async fn apply(&self, action: Action) {
        match action {
            Action::Invalidate(scope) => self.invalidate(&scope).await,
            Action::SignOut => self.sign_out(),
        }
    }

    /// Marks entries stale now and returns a future that completes when the
    /// observed ones are refetched.
    ///
    /// The refetches run on their own tasks, so dropping the returned future
    /// only stops waiting for them. A read that was already in flight was
    /// sent before the invalidation; it is superseded by a new call.
    pub(crate) fn start_invalidation(&self, scope: &InvalidationScope) -> BoxFuture<'static, ()> {
        let marked = self.inner.store.invalidate(scope);
        if marked.is_empty() {
            return future::ready(()).boxed();
        }
        debug!(count = marked.len(), ?scope, "invalidated entries");
        let refetches: Vec<SharedFetch> = marked
            .iter()
            .filter_map(|key| {
                let registration = self.inner.store.observed_registration(key)?;
                self.inner.store.supersede_fetch(key);
                Some(self.start_fetch(key, &registration))
            })
            .collect();
        future::join_all(refetches).map(|_| ()).boxed()
    }

    /// Fetches `key` in the background using its registered loader.
    pub(crate) fn spawn_refetch(&self, key: &QueryKey) {
        let Some(registration) = self.inner.store.registration(key) else {
            return;
        };
        // The fetch drives itself; joining is enough.
        drop(self.start_fetch(key, &registration));
    }

    /// Joins or starts the fetch of `key`, retried and dispatched.
    pub(crate) fn start_fetch(&self, key: &QueryKey, registration: &Registration) -> SharedFetch {
        let fetcher = registration.fetcher.clone();
        let display = ErrorDisplay::from(&registration.meta);
        let retry = self.inner.retry.clone();
        let client = Arc::downgrade(&self.inner);
        let context = DispatchContext::query(key.clone());

        self.inner.store.join_or_start(key, move || {
            async move {
                let result = retry.run(RequestKind::Read, || fetcher()).await;
                if let Err(error) = &result {
                    if let Some(client) = upgrade(&client) {
                        client.handle_error(error, &display, &context);
                    }
                }
                result
            }
            .boxed()
        })
    }

    /// Classifies and dispatches a failure, running the follow-up command in
    /// the background.
    pub(crate) fn handle_error(
        &self,
        error: &CallError,
        display: &ErrorDisplay,
        context: &DispatchContext,
    ) {
        let command = self.inner.dispatcher.handle(error, display, context);
        self.spawn_command(command);
    }

    fn spawn_command(&self, command: Command) {
        if command.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!("no runtime, command dropped");
            return;
        };
        let client = Arc::downgrade(&self.inner);
        let mut actions = command.into_stream();
        handle.spawn(async move {
            while let Some(action) = actions.next().await {
                let Some(client) = upgrade(&client) else {
                    break;
                };
                trace!(?action, "applying action");
                client.apply(action).await;
            }
        });
    }

    fn settle_read<T: Send + Sync + 'static>(&self, key: &QueryKey, result: FetchResult) -> Result<Arc<T>, CallError> {
        match result {
            Ok(value) => value
                .downcast::<T>()
                .map_err(|_| CallError::unexpected(format!("cached value at {key} has a different type"))),
            Err(CallError::Cancelled) => self.inner.store.data::<T>(key).ok_or(CallError::Cancelled),
            Err(error) => Err(error),
        }
    }
}

fn upgrade(client: &Weak<ClientInner>) -> Option<QueryClient> {
    client.upgrade().map(|inner| QueryClient { inner })
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.inner.store)
            .field("dispatcher", &self.inner.dispatcher)
            .field("retry", &self.inner.retry)
            .finish()
    }
}
