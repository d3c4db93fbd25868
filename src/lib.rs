//! # query-sync - client-side request cache and mutation synchronization
//!
//! query-sync keeps server data on the client. It caches reads, applies
//! optimistic writes before the server confirms them, reconciles or rolls them
//! back, decides which cached data a write makes stale, and turns failures into
//! a fixed set of user-visible side effects.
//!
//! ## Architecture
//!
//! 1. **Store**: [`QueryStore`] keeps one [`CacheEntry`] per [`QueryKey`], with
//!    staleness, subscribers, eviction and fetch de-duplication
//! 2. **Reads**: a [`Query`] is fetched once or watched as a stream
//! 3. **Writes**: a [`Mutation`] patches the store, calls the server, then
//!    commits or rolls back
//! 4. **Invalidation**: an [`InvalidationScope`] picks the entries a write
//!    makes stale
//! 5. **Errors**: [`classify`] maps every [`CallError`] to an
//!    [`ErrorTaxonomy`] member and the [`Dispatcher`] performs its side effect
//! 6. **Retries**: the [`RetryPolicy`] retries transient read failures
//!
//! The [`QueryClient`] wires these together. It is constructed explicitly and
//! owns its store, so sign-out can drop all cached data at once.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use query_sync::mock::{MockRemote, RecordingUi};
//! use query_sync::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), CallError> {
//! let ui = RecordingUi::new();
//! let client = QueryClient::new(Arc::new(ui.clone()));
//!
//! let saved = query_key!["saved-words", "es"];
//! let list = MockRemote::<(), Vec<String>>::ok(vec!["hola".to_owned()]);
//! let save = MockRemote::<String, ()>::ok(());
//!
//! let query = Query::from_procedure(saved.clone(), list.procedure("listSavedWords"), ());
//! client.fetch(&query).await?;
//!
//! Mutation::new(save.procedure("saveWord"), "adiós".to_owned())
//!     .optimistic({
//!         let saved = saved.clone();
//!         move |patch| {
//!             patch.update::<Vec<String>>(saved, |words| words.push("adiós".to_owned()));
//!         }
//!     })
//!     .meta(MutationMeta::new().invalidates([saved.clone()]))
//!     .execute(&client)
//!     .await?;
//!
//! assert_eq!(save.calls(), vec!["adiós".to_owned()]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod meta;
pub mod mock;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod retry;
pub mod store;
pub mod taxonomy;

pub use cache::{CacheEntry, EntryStatus, ErasedValue, SnapshotHandle};
pub use client::{QueryClient, QueryClientBuilder};
pub use command::{Action, Command};
pub use config::{ClientConfig, DispatchConfig, QueryConfig, RetryConfig};
pub use debounce::Debouncer;
pub use dispatch::{
    DispatchContext, Dispatcher, ErrorReport, ErrorReporter, ModalId, Operation, ToastVariant, Ui,
};
pub use error::{CallError, RemoteError, TransportKind};
pub use invalidation::{InvalidationScope, invalidation_targets};
pub use key::{KeyPart, QueryKey};
pub use meta::{ErrorDisplay, MutationMeta, QueryMeta};
pub use mutation::{Mutation, OptimisticPatch, RemoteProcedure};
pub use query::{Query, QueryResult, QueryState, QueryWatch};
pub use retry::{RequestKind, RetryDecision, RetryPolicy};
pub use store::{CacheEvent, QueryStore};
pub use taxonomy::{ErrorTaxonomy, classify, is_expected_failure};
