use futures::{
    FutureExt, StreamExt,
    stream::{self, BoxStream},
};

use crate::invalidation::InvalidationScope;

/// Follow-up work requested by a side effect.
///
/// Actions are emitted by command streams and applied by the
/// [`QueryClient`](crate::QueryClient) that spawned them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Mark the entries in scope stale and refetch the observed ones.
    ///
    /// Emitted when the paywall modal is dismissed, so that data gated behind
    /// a purchase is loaded again.
    Invalidate(InvalidationScope),

    /// End the session.
    ///
    /// The client clears the store and hands over to
    /// [`Ui::sign_out_and_redirect`](crate::Ui::sign_out_and_redirect).
    SignOut,
}

/// Deferred side effects returned by the [`Dispatcher`](crate::Dispatcher).
///
/// A command is a possibly-empty stream of [`Action`]s. Keeping the dispatcher
/// free of store access makes its decisions observable in tests: collect the
/// stream and compare the actions.
///
/// # Examples
///
/// ```
/// use query_sync::{Action, Command, InvalidationScope};
///
/// let cmd = Command::perform(async {
///     // wait for the user here
///     Some(Action::Invalidate(InvalidationScope::Global))
/// });
/// assert!(!cmd.is_none());
/// assert!(Command::none().is_none());
/// ```
pub struct Command {
    pub(crate) stream: Option<BoxStream<'static, Action>>,
}

impl Command {
    /// Create a command that does nothing.
    #[must_use]
    pub fn none() -> Self {
        Self { stream: None }
    }

    /// Run a future for its side effect and then emit the action it returns, if any.
    pub fn perform(future: impl Future<Output = Option<Action>> + Send + 'static) -> Self {
        Self {
            stream: Some(future.into_stream().filter_map(|a| async move { a }).boxed()),
        }
    }

    /// Create a command that performs a single action immediately.
    #[must_use]
    pub fn effect(action: Action) -> Self {
        Self {
            stream: Some(stream::once(async move { action }).boxed()),
        }
    }

    /// Returns `true` if this command does nothing.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.stream.is_none()
    }

    /// Consumes the command, returning its actions as a stream.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Action> {
        self.stream.unwrap_or_else(|| stream::empty().boxed())
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("empty", &self.stream.is_none())
            .finish()
    }
}
