//! Prelude module for convenient imports.
//!
//! ```
//! use query_sync::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - Reads, writes and invalidation
//! - [`Query`] and [`Mutation`] - Call definitions
//! - [`QueryMeta`] and [`MutationMeta`] - Per-call options
//! - [`RemoteProcedure`] and [`CallError`] - The transport boundary
//! - [`query_key!`](crate::query_key) - Key construction

pub use crate::client::QueryClient;
pub use crate::error::{CallError, RemoteError, TransportKind};
pub use crate::invalidation::InvalidationScope;
pub use crate::key::QueryKey;
pub use crate::meta::{MutationMeta, QueryMeta};
pub use crate::mutation::{Mutation, RemoteProcedure};
pub use crate::query::{Query, QueryResult, QueryState};
pub use crate::query_key;
