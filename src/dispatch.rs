//! Side effects of failed and successful calls.
//!
//! The [`Dispatcher`] is the one place that turns an [`ErrorTaxonomy`] member
//! into user-visible feedback. What happens for each member is fixed; the
//! call's meta only tunes how generic feedback is presented.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::command::{Action, Command};
use crate::config::DispatchConfig;
use crate::error::CallError;
use crate::invalidation::InvalidationScope;
use crate::key::QueryKey;
use crate::meta::{ErrorDisplay, MutationMeta};
use crate::taxonomy::{ErrorTaxonomy, classify, is_expected_failure};

/// Visual style of a toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToastVariant {
    /// Something failed.
    Error,
    /// Something succeeded.
    Success,
    /// Neutral information.
    Info,
}

/// Blocking modals the dispatcher can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModalId {
    /// Subscription purchase screen.
    Paywall,
    /// Rate-limit notice. Payload: `{"retryAfter": seconds}`.
    TooManyRequests,
    /// Generic error notice. Payload: `{"message": text}`.
    Error,
}

/// The presentation layer, implemented by each client.
pub trait Ui: Send + Sync {
    /// Shows a transient notification.
    fn show_toast(&self, message: &str, variant: ToastVariant);

    /// Opens a blocking modal.
    ///
    /// The returned future resolves when the user dismisses the modal.
    /// Dropping it must not close the modal.
    fn open_blocking_modal(&self, modal: ModalId, payload: Option<Value>) -> BoxFuture<'static, ()>;

    /// Navigates to an in-app path.
    fn navigate_to(&self, path: &str);

    /// Ends the session and returns to the sign-in screen.
    fn sign_out_and_redirect(&self);
}

/// One unexpected failure, as sent to error reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// The failed read or write, e.g. `query ["saved-words","es"]`.
    pub operation: String,
    /// Classification of the failure.
    pub taxonomy: ErrorTaxonomy,
    /// The serialized error.
    pub context: Value,
}

/// Error-reporting transport.
pub trait ErrorReporter: Send + Sync {
    /// Forwards one report. Must not block.
    fn report(&self, report: &ErrorReport);
}

/// The call a failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A read of the given key.
    Query(QueryKey),
    /// A write through the named procedure.
    Mutation(&'static str),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(key) => write!(f, "query {key}"),
            Self::Mutation(name) => write!(f, "mutation {name}"),
        }
    }
}

/// Where a failure came from, and which entries to reload once the paywall
/// is dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// The failed call.
    pub operation: Operation,
    /// Entries gated by the failure.
    pub scope: InvalidationScope,
}

impl DispatchContext {
    /// Context of a failed read: the read's own key is gated.
    #[must_use]
    pub fn query(key: QueryKey) -> Self {
        Self {
            scope: InvalidationScope::Keys(vec![key.clone()]),
            operation: Operation::Query(key),
        }
    }

    /// Context of a failed write.
    #[must_use]
    pub const fn mutation(name: &'static str, scope: InvalidationScope) -> Self {
        Self {
            operation: Operation::Mutation(name),
            scope,
        }
    }
}

/// Turns failures into user-visible side effects.
pub struct Dispatcher {
    ui: Arc<dyn Ui>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    config: DispatchConfig,
    rate_limited_until: Mutex<Option<Instant>>,
}

impl Dispatcher {
    /// Creates a dispatcher presenting through `ui`.
    #[must_use]
    pub fn new(ui: Arc<dyn Ui>, config: DispatchConfig) -> Self {
        Self {
            ui,
            reporter: None,
            config,
            rate_limited_until: Mutex::new(None),
        }
    }

    /// Forwards unexpected failures to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Returns the presentation layer.
    #[must_use]
    pub fn ui(&self) -> &Arc<dyn Ui> {
        &self.ui
    }

    /// Returns the presentation defaults.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Classifies, reports and dispatches a failure.
    ///
    /// Cancellations are internal and produce nothing.
    pub fn handle(
        &self,
        error: &CallError,
        display: &ErrorDisplay,
        context: &DispatchContext,
    ) -> Command {
        if error.is_cancelled() {
            trace!(operation = %context.operation, "ignoring cancelled call");
            return Command::none();
        }
        let taxonomy = classify(error);
        debug!(operation = %context.operation, ?taxonomy, %error, "call failed");
        self.report(taxonomy, error, context);
        self.dispatch(taxonomy, error, display, context)
    }

    /// Performs the side effect of `taxonomy`.
    ///
    /// Immediate effects (toasts, modals) happen before this returns. Follow-up
    /// work, such as reloading after the paywall closes, is returned as a
    /// [`Command`].
    pub fn dispatch(
        &self,
        taxonomy: ErrorTaxonomy,
        error: &CallError,
        display: &ErrorDisplay,
        context: &DispatchContext,
    ) -> Command {
        match taxonomy {
            ErrorTaxonomy::NotFound => Command::none(),
            ErrorTaxonomy::SubscriptionRequired => self.open_paywall(context),
            ErrorTaxonomy::RateLimited => {
                self.open_rate_limit(error);
                Command::none()
            }
            ErrorTaxonomy::InvalidToken => {
                if display.show_error_toast.unwrap_or(true) {
                    self.ui
                        .show_toast(&self.config.session_expired_message, ToastVariant::Error);
                }
                Command::effect(Action::SignOut)
            }
            ErrorTaxonomy::ValidationWithMessage => {
                let message = error
                    .remote()
                    .and_then(|remote| remote.message())
                    .unwrap_or(&self.config.default_error_message);
                self.present(display, message);
                Command::none()
            }
            ErrorTaxonomy::ForbiddenOther
            | ErrorTaxonomy::UnauthorizedOther
            | ErrorTaxonomy::Generic => {
                let message = display
                    .error_message
                    .as_deref()
                    .unwrap_or(&self.config.default_error_message);
                self.present(display, message);
                Command::none()
            }
        }
    }

    /// Sends unexpected failures to error reporting.
    ///
    /// Expected failures, the ones the user can recover from, are skipped.
    pub fn report(&self, taxonomy: ErrorTaxonomy, error: &CallError, context: &DispatchContext) {
        if is_expected_failure(error) {
            return;
        }
        warn!(operation = %context.operation, ?taxonomy, %error, "unexpected failure");
        if let Some(reporter) = &self.reporter {
            reporter.report(&ErrorReport {
                operation: context.operation.to_string(),
                taxonomy,
                context: error.to_context(),
            });
        }
    }

    /// Shows the success toast of a write if its meta asks for one.
    pub fn dispatch_success(&self, meta: &MutationMeta) {
        if meta.show_success_toast != Some(true) {
            return;
        }
        let message = meta
            .success_message
            .as_deref()
            .unwrap_or(&self.config.default_success_message);
        self.ui.show_toast(message, ToastVariant::Success);
    }

    fn present(&self, display: &ErrorDisplay, message: &str) {
        if !display.show_error_toast.unwrap_or(true) {
            return;
        }
        if display
            .show_error_modal
            .unwrap_or(self.config.show_error_modal)
        {
            // Dismissal needs no follow-up.
            drop(
                self.ui
                    .open_blocking_modal(ModalId::Error, Some(json!({ "message": message }))),
            );
        } else {
            self.ui.show_toast(message, ToastVariant::Error);
        }
    }

    fn open_paywall(&self, context: &DispatchContext) -> Command {
        if let Some(path) = &self.config.paywall_path {
            debug!(operation = %context.operation, path = %path, "redirecting to paywall");
            self.ui.navigate_to(path);
            return Command::none();
        }
        let dismissed = self.ui.open_blocking_modal(ModalId::Paywall, None);
        let scope = context.scope.clone();
        Command::perform(async move {
            dismissed.await;
            if scope.is_skip() {
                None
            } else {
                Some(Action::Invalidate(scope))
            }
        })
    }

    fn open_rate_limit(&self, error: &CallError) {
        let retry_after = error
            .remote()
            .and_then(|remote| remote.data.as_ref())
            .and_then(|data| data.get("retryAfter"))
            .and_then(Value::as_u64)
            .map_or(self.config.rate_limit_cooldown, Duration::from_secs);

        {
            let now = Instant::now();
            let mut until = self.rate_limited_until.lock();
            if until.is_some_and(|until| now < until) {
                trace!("rate-limit notice already shown");
                return;
            }
            *until = Some(now + retry_after);
        }

        drop(self.ui.open_blocking_modal(
            ModalId::TooManyRequests,
            Some(json!({ "retryAfter": retry_after.as_secs() })),
        ));
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("reporter", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::error::{RemoteError, TransportKind};
    use crate::meta::QueryMeta;
    use crate::mock::{RecordingReporter, RecordingUi, UiEvent};
    use crate::query_key;
    use crate::taxonomy::{INVALID_TOKEN, SUBSCRIPTION_REQUIRED};

    fn dispatcher(ui: &RecordingUi, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(ui.clone()), config)
    }

    fn query_context() -> DispatchContext {
        DispatchContext::query(query_key!["user-settings"])
    }

    #[test]
    fn test_not_found_is_silent() {
        let ui = RecordingUi::new();
        let cmd = dispatcher(&ui, DispatchConfig::web()).handle(
            &TransportKind::NotFound.into(),
            &ErrorDisplay::default(),
            &query_context(),
        );
        assert!(cmd.is_none());
        assert!(ui.events().is_empty());
    }

    #[test]
    fn test_generic_error_uses_meta_message() {
        let ui = RecordingUi::new();
        let display = ErrorDisplay::from(&QueryMeta::new().with_error_message("Could not load"));
        dispatcher(&ui, DispatchConfig::web()).handle(
            &TransportKind::InternalServerError.into(),
            &display,
            &query_context(),
        );
        assert_eq!(ui.error_toasts(), vec!["Could not load".to_owned()]);
    }

    #[test]
    fn test_validation_message_is_shown_verbatim() {
        let ui = RecordingUi::new();
        let display = ErrorDisplay::from(&QueryMeta::new().with_error_message("ignored"));
        dispatcher(&ui, DispatchConfig::web()).handle(
            &RemoteError::new(TransportKind::Conflict)
                .with_message("Username is taken")
                .into(),
            &display,
            &query_context(),
        );
        assert_eq!(ui.error_toasts(), vec!["Username is taken".to_owned()]);
    }

    #[test]
    fn test_native_defaults_to_modal() {
        let ui = RecordingUi::new();
        dispatcher(&ui, DispatchConfig::native()).handle(
            &TransportKind::InternalServerError.into(),
            &ErrorDisplay::default(),
            &query_context(),
        );
        assert!(ui.error_toasts().is_empty());
        assert_eq!(ui.opened_modals(), vec![ModalId::Error]);

        let ui = RecordingUi::new();
        let display = ErrorDisplay {
            show_error_modal: Some(false),
            ..ErrorDisplay::default()
        };
        dispatcher(&ui, DispatchConfig::native()).handle(
            &TransportKind::InternalServerError.into(),
            &display,
            &query_context(),
        );
        assert_eq!(ui.error_toasts().len(), 1);
    }

    #[test]
    fn test_silent_meta_suppresses_feedback() {
        let ui = RecordingUi::new();
        let display = ErrorDisplay::from(&QueryMeta::new().silent());
        dispatcher(&ui, DispatchConfig::web()).handle(
            &TransportKind::InternalServerError.into(),
            &display,
            &query_context(),
        );
        assert!(ui.events().is_empty());
    }

    #[tokio::test]
    async fn test_paywall_reinvalidates_on_dismiss() {
        let ui = RecordingUi::new();
        let error: CallError = RemoteError::new(TransportKind::Forbidden)
            .with_code(SUBSCRIPTION_REQUIRED)
            .into();
        let cmd = dispatcher(&ui, DispatchConfig::web()).handle(
            &error,
            &ErrorDisplay::from(&QueryMeta::new().silent()),
            &query_context(),
        );
        assert_eq!(ui.opened_modals(), vec![ModalId::Paywall]);
        assert!(ui.toasts().is_empty());

        let mut actions = cmd.into_stream();
        assert!(ui.dismiss(ModalId::Paywall));
        assert_eq!(
            actions.next().await,
            Some(Action::Invalidate(InvalidationScope::Keys(vec![query_key![
                "user-settings"
            ]])))
        );
    }

    #[test]
    fn test_paywall_route_navigates() {
        let ui = RecordingUi::new();
        let error: CallError = RemoteError::new(TransportKind::Forbidden)
            .with_code(SUBSCRIPTION_REQUIRED)
            .into();
        let config = DispatchConfig::native().with_paywall_path("/paywall");
        let cmd = dispatcher(&ui, config).handle(&error, &ErrorDisplay::default(), &query_context());
        assert!(cmd.is_none());
        assert_eq!(ui.events(), vec![UiEvent::Navigated("/paywall".to_owned())]);
    }

    #[tokio::test]
    async fn test_invalid_token_signs_out() {
        let ui = RecordingUi::new();
        let error: CallError = RemoteError::new(TransportKind::Unauthorized)
            .with_code(INVALID_TOKEN)
            .into();
        let config = DispatchConfig::web();
        let cmd = dispatcher(&ui, config.clone()).handle(
            &error,
            &ErrorDisplay::default(),
            &query_context(),
        );
        assert_eq!(ui.error_toasts(), vec![config.session_expired_message]);
        let actions: Vec<_> = cmd.into_stream().collect().await;
        assert_eq!(actions, vec![Action::SignOut]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_modal_is_gated() {
        let ui = RecordingUi::new();
        let dispatcher = dispatcher(&ui, DispatchConfig::web());
        let error: CallError = RemoteError::new(TransportKind::TooManyRequests)
            .with_data(json!({ "retryAfter": 30 }))
            .into();

        dispatcher.handle(&error, &ErrorDisplay::default(), &query_context());
        dispatcher.handle(&error, &ErrorDisplay::default(), &query_context());
        assert_eq!(
            ui.events(),
            vec![UiEvent::ModalOpened {
                modal: ModalId::TooManyRequests,
                payload: Some(json!({ "retryAfter": 30 })),
            }]
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        dispatcher.handle(&error, &ErrorDisplay::default(), &query_context());
        assert_eq!(ui.opened_modals().len(), 2);
    }

    #[test]
    fn test_reports_only_unexpected_failures() {
        let ui = RecordingUi::new();
        let reporter = RecordingReporter::new();
        let dispatcher = dispatcher(&ui, DispatchConfig::web()).with_reporter(Arc::new(reporter.clone()));

        dispatcher.handle(
            &RemoteError::new(TransportKind::BadRequest)
                .with_message("Too short")
                .into(),
            &ErrorDisplay::default(),
            &query_context(),
        );
        dispatcher.handle(&CallError::Cancelled, &ErrorDisplay::default(), &query_context());
        assert!(reporter.reports().is_empty());

        dispatcher.handle(
            &CallError::unexpected("decode failed"),
            &ErrorDisplay::default(),
            &DispatchContext::mutation("saveWord", InvalidationScope::Global),
        );
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].operation, "mutation saveWord");
        assert_eq!(reports[0].taxonomy, ErrorTaxonomy::Generic);
        assert_eq!(
            reports[0].context,
            json!({ "type": "unexpected", "message": "decode failed" })
        );
    }

    #[test]
    fn test_success_toast_is_opt_in() {
        let ui = RecordingUi::new();
        let dispatcher = dispatcher(&ui, DispatchConfig::web());
        dispatcher.dispatch_success(&MutationMeta::new());
        assert!(ui.toasts().is_empty());

        dispatcher.dispatch_success(&MutationMeta::new().with_success_toast(Some("Word saved".to_owned())));
        assert_eq!(
            ui.toasts(),
            vec![("Word saved".to_owned(), ToastVariant::Success)]
        );
    }
}
