//! Per-call configuration.
//!
//! Every field is optional. Call sites only state what they want to change;
//! defaults are resolved in one place by the [`Dispatcher`](crate::Dispatcher)
//! and the invalidation policy.

use crate::key::QueryKey;

/// Options attached to a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Show a toast when the read fails. Defaults to `true`.
    pub show_error_toast: Option<bool>,
    /// Show a blocking modal instead of a toast. Defaults to the client setting.
    pub show_error_modal: Option<bool>,
    /// Message used instead of the default generic error message.
    pub error_message: Option<String>,
    /// Exempt this entry from global invalidation after mutations.
    pub skip_global_invalidation: Option<bool>,
}

impl QueryMeta {
    /// Creates an empty meta record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppresses every visible error feedback for this read.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.show_error_toast = Some(false);
        self.show_error_modal = Some(false);
        self
    }

    /// Uses a blocking modal instead of a toast.
    #[must_use]
    pub const fn with_error_modal(mut self) -> Self {
        self.show_error_modal = Some(true);
        self
    }

    /// Overrides the generic error message.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Exempts the entry from global invalidation.
    #[must_use]
    pub const fn skip_global_invalidation(mut self) -> Self {
        self.skip_global_invalidation = Some(true);
        self
    }

    /// Returns whether the entry is exempt from global invalidation.
    #[must_use]
    pub fn skips_global_invalidation(&self) -> bool {
        self.skip_global_invalidation.unwrap_or(false)
    }
}

/// Options attached to a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationMeta {
    /// Show a toast when the write fails. Defaults to `true`.
    pub show_error_toast: Option<bool>,
    /// Show a blocking modal instead of a toast. Defaults to the client setting.
    pub show_error_modal: Option<bool>,
    /// Message used instead of the default generic error message.
    pub error_message: Option<String>,
    /// Message of the success toast.
    pub success_message: Option<String>,
    /// Show a toast when the write succeeds. Defaults to `false`.
    pub show_success_toast: Option<bool>,
    /// Keys to invalidate after success.
    ///
    /// `None` invalidates globally, an empty list skips invalidation, and a
    /// non-empty list narrows invalidation to matching keys.
    pub invalidates: Option<Vec<QueryKey>>,
}

impl MutationMeta {
    /// Creates an empty meta record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppresses every visible error feedback for this write.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.show_error_toast = Some(false);
        self.show_error_modal = Some(false);
        self
    }

    /// Uses a blocking modal instead of a toast.
    #[must_use]
    pub const fn with_error_modal(mut self) -> Self {
        self.show_error_modal = Some(true);
        self
    }

    /// Overrides the generic error message.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Shows a success toast, optionally with a custom message.
    #[must_use]
    pub fn with_success_toast(mut self, message: Option<String>) -> Self {
        self.show_success_toast = Some(true);
        self.success_message = message;
        self
    }

    /// Narrows invalidation to `keys`. An empty list disables invalidation.
    #[must_use]
    pub fn invalidates(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidates = Some(keys.into_iter().collect());
        self
    }

    /// Disables invalidation after success.
    #[must_use]
    pub fn skip_invalidation(mut self) -> Self {
        self.invalidates = Some(Vec::new());
        self
    }
}

/// The presentation-related subset of a meta record, before defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDisplay {
    /// See [`QueryMeta::show_error_toast`].
    pub show_error_toast: Option<bool>,
    /// See [`QueryMeta::show_error_modal`].
    pub show_error_modal: Option<bool>,
    /// See [`QueryMeta::error_message`].
    pub error_message: Option<String>,
}

impl From<&QueryMeta> for ErrorDisplay {
    fn from(meta: &QueryMeta) -> Self {
        Self {
            show_error_toast: meta.show_error_toast,
            show_error_modal: meta.show_error_modal,
            error_message: meta.error_message.clone(),
        }
    }
}

impl From<&MutationMeta> for ErrorDisplay {
    fn from(meta: &MutationMeta) -> Self {
        Self {
            show_error_toast: meta.show_error_toast,
            show_error_modal: meta.show_error_modal,
            error_message: meta.error_message.clone(),
        }
    }
}
