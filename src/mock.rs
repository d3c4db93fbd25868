//! Test doubles for the outward interfaces.
//!
//! [`RecordingUi`] records every side effect and lets tests dismiss modals,
//! [`MockRemote`] stands in for a remote procedure, and
//! [`RecordingReporter`] captures error reports.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use query_sync::mock::{MockRemote, RecordingUi};
//! use query_sync::{Query, QueryClient, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), query_sync::CallError> {
//! let ui = RecordingUi::new();
//! let client = QueryClient::new(Arc::new(ui.clone()));
//!
//! let remote = MockRemote::<(), u32>::ok(7);
//! let query = Query::from_procedure(query_key!["streak"], remote.procedure("getStreak"), ());
//!
//! assert_eq!(*client.fetch(&query).await?, 7);
//! assert_eq!(remote.call_count(), 1);
//! assert!(ui.toasts().is_empty());
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::dispatch::{ErrorReport, ErrorReporter, ModalId, ToastVariant, Ui};
use crate::error::CallError;
use crate::mutation::RemoteProcedure;

/// A side effect recorded by [`RecordingUi`].
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A toast was shown.
    Toast {
        /// The toast text.
        message: String,
        /// The toast style.
        variant: ToastVariant,
    },
    /// A blocking modal was opened.
    ModalOpened {
        /// Which modal.
        modal: ModalId,
        /// Its payload.
        payload: Option<Value>,
    },
    /// The app navigated.
    Navigated(String),
    /// The session was ended.
    SignedOut,
}

#[derive(Default)]
struct UiState {
    events: Vec<UiEvent>,
    open: Vec<(ModalId, oneshot::Sender<()>)>,
}

/// A [`Ui`] that records side effects instead of presenting them.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingUi {
    state: Arc<Mutex<UiState>>,
}

impl RecordingUi {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded side effect in order.
    #[must_use]
    pub fn events(&self) -> Vec<UiEvent> {
        self.state.lock().events.clone()
    }

    /// Returns all toasts shown.
    #[must_use]
    pub fn toasts(&self) -> Vec<(String, ToastVariant)> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                UiEvent::Toast { message, variant } => Some((message.clone(), *variant)),
                _ => None,
            })
            .collect()
    }

    /// Returns the messages of error toasts.
    #[must_use]
    pub fn error_toasts(&self) -> Vec<String> {
        self.toasts()
            .into_iter()
            .filter(|(_, variant)| *variant == ToastVariant::Error)
            .map(|(message, _)| message)
            .collect()
    }

    /// Returns every modal opened, dismissed or not.
    #[must_use]
    pub fn opened_modals(&self) -> Vec<ModalId> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                UiEvent::ModalOpened { modal, .. } => Some(*modal),
                _ => None,
            })
            .collect()
    }

    /// Returns the modals still open.
    #[must_use]
    pub fn open_modals(&self) -> Vec<ModalId> {
        self.state.lock().open.iter().map(|(modal, _)| *modal).collect()
    }

    /// Dismisses the oldest open `modal`. Returns `false` if none is open.
    pub fn dismiss(&self, modal: ModalId) -> bool {
        let sender = {
            let mut state = self.state.lock();
            let Some(index) = state.open.iter().position(|(open, _)| *open == modal) else {
                return false;
            };
            state.open.remove(index).1
        };
        // The opener may have stopped waiting.
        let _ = sender.send(());
        true
    }

    /// Returns `true` if the session was ended.
    #[must_use]
    pub fn signed_out(&self) -> bool {
        self.state
            .lock()
            .events
            .iter()
            .any(|event| *event == UiEvent::SignedOut)
    }

    /// Forgets recorded events. Open modals stay open.
    pub fn reset(&self) {
        self.state.lock().events.clear();
    }

    fn record(&self, event: UiEvent) {
        self.state.lock().events.push(event);
    }
}

impl Ui for RecordingUi {
    fn show_toast(&self, message: &str, variant: ToastVariant) {
        self.record(UiEvent::Toast {
            message: message.to_owned(),
            variant,
        });
    }

    fn open_blocking_modal(&self, modal: ModalId, payload: Option<Value>) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.events.push(UiEvent::ModalOpened { modal, payload });
            state.open.push((modal, tx));
        }
        async move {
            let _ = rx.await;
        }
        .boxed()
    }

    fn navigate_to(&self, path: &str) {
        self.record(UiEvent::Navigated(path.to_owned()));
    }

    fn sign_out_and_redirect(&self) {
        self.record(UiEvent::SignedOut);
    }
}

/// An [`ErrorReporter`] that keeps every report.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl RecordingReporter {
    /// Creates an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all reports received.
    #[must_use]
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: &ErrorReport) {
        self.reports.lock().push(report.clone());
    }
}

struct RemoteState<I, O> {
    queued: VecDeque<Result<O, CallError>>,
    fallback: Option<Result<O, CallError>>,
    calls: Vec<I>,
}

/// A scripted remote procedure.
///
/// Responses are taken from a queue first, then from a fallback that answers
/// every remaining call. While [held](MockRemote::hold), calls wait before
/// picking their response, so tests can observe in-flight state.
pub struct MockRemote<I, O> {
    state: Arc<Mutex<RemoteState<I, O>>>,
    gate: Arc<watch::Sender<bool>>,
}

impl<I, O> Clone for MockRemote<I, O> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<I, O> MockRemote<I, O>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    /// Creates a remote with no scripted responses.
    ///
    /// Unscripted calls fail with [`CallError::Unexpected`].
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                queued: VecDeque::new(),
                fallback: None,
                calls: Vec::new(),
            })),
            gate: Arc::new(gate),
        }
    }

    /// Creates a remote that always succeeds with `value`.
    #[must_use]
    pub fn ok(value: O) -> Self {
        let remote = Self::new();
        remote.respond(Ok(value));
        remote
    }

    /// Creates a remote that always fails with `error`.
    #[must_use]
    pub fn err(error: impl Into<CallError>) -> Self {
        let remote = Self::new();
        remote.respond(Err(error.into()));
        remote
    }

    /// Sets the response of every call not answered by the queue.
    pub fn respond(&self, response: Result<O, CallError>) {
        self.state.lock().fallback = Some(response);
    }

    /// Queues a response for a single call.
    pub fn push(&self, response: Result<O, CallError>) {
        self.state.lock().queued.push_back(response);
    }

    /// Makes subsequent and in-flight calls wait until [`MockRemote::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Lets waiting calls proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Returns the number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Returns the inputs of all calls made.
    #[must_use]
    pub fn calls(&self) -> Vec<I> {
        self.state.lock().calls.clone()
    }

    /// Invokes the remote. The call is recorded immediately.
    pub fn call(&self, input: I) -> BoxFuture<'static, Result<O, CallError>> {
        self.state.lock().calls.push(input);
        let state = self.state.clone();
        let mut gate = self.gate.subscribe();
        async move {
            gate.wait_for(|open| *open)
                .await
                .map_err(CallError::unexpected)?;
            let mut state = state.lock();
            if let Some(response) = state.queued.pop_front() {
                return response;
            }
            state
                .fallback
                .clone()
                .unwrap_or_else(|| Err(CallError::unexpected("no scripted response")))
        }
        .boxed()
    }

    /// Wraps this remote as a named [`RemoteProcedure`].
    #[must_use]
    pub fn procedure(&self, name: &'static str) -> RemoteProcedure<I, O> {
        let remote = self.clone();
        RemoteProcedure::new(name, move |input| remote.call(input))
    }
}

impl<I, O> Default for MockRemote<I, O>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
