//! Error classification.
//!
//! [`classify`] is the single place that maps a [`CallError`] to an
//! [`ErrorTaxonomy`] member. It is total: every input, including errors that
//! never reached the server, maps to exactly one member.

use serde::Serialize;

use crate::error::{CallError, TransportKind};

/// Backend code sent with a forbidden response when the feature needs a paid plan.
pub const SUBSCRIPTION_REQUIRED: &str = "subscription-required";

/// Backend code sent with an unauthorized response when the session token is invalid.
pub const INVALID_TOKEN: &str = "invalid-token";

/// Closed classification of error causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorTaxonomy {
    /// The resource does not exist. Silently ignored by default.
    NotFound,
    /// The feature needs a subscription. Opens the paywall.
    SubscriptionRequired,
    /// Forbidden for any other reason.
    ForbiddenOther,
    /// The caller is rate limited.
    RateLimited,
    /// The session token is invalid. Ends the session.
    InvalidToken,
    /// Unauthorized for any other reason.
    UnauthorizedOther,
    /// The backend supplied a human-readable message to show verbatim.
    ValidationWithMessage,
    /// Everything else.
    Generic,
}

impl ErrorTaxonomy {
    /// Returns `true` for members caused by the session or its entitlements.
    #[must_use]
    pub const fn is_auth(self) -> bool {
        matches!(
            self,
            Self::SubscriptionRequired
                | Self::ForbiddenOther
                | Self::InvalidToken
                | Self::UnauthorizedOther
        )
    }
}

/// Classifies a failed call.
///
/// Specific backend codes take precedence over the message check, which in turn
/// takes precedence over the plain forbidden/unauthorized fallbacks.
#[must_use]
pub fn classify(error: &CallError) -> ErrorTaxonomy {
    let Some(remote) = error.remote() else {
        return ErrorTaxonomy::Generic;
    };

    match remote.kind {
        TransportKind::NotFound => ErrorTaxonomy::NotFound,
        TransportKind::TooManyRequests => ErrorTaxonomy::RateLimited,
        TransportKind::Forbidden if remote.has_code(SUBSCRIPTION_REQUIRED) => {
            ErrorTaxonomy::SubscriptionRequired
        }
        TransportKind::Unauthorized if remote.has_code(INVALID_TOKEN) => {
            ErrorTaxonomy::InvalidToken
        }
        _ if remote.message().is_some() => ErrorTaxonomy::ValidationWithMessage,
        TransportKind::Forbidden => ErrorTaxonomy::ForbiddenOther,
        TransportKind::Unauthorized => ErrorTaxonomy::UnauthorizedOther,
        _ => ErrorTaxonomy::Generic,
    }
}

/// Returns `true` if the failure is something the user can recover from, as
/// opposed to a malfunction.
///
/// Expected failures are kept out of error-reporting telemetry.
#[must_use]
pub fn is_expected_failure(error: &CallError) -> bool {
    match error {
        CallError::Cancelled => true,
        CallError::Unexpected { .. } => false,
        CallError::Remote(remote) => {
            remote.kind.is_validation()
                || classify(error) == ErrorTaxonomy::SubscriptionRequired
        }
    }
}
