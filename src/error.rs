//! Errors produced at the transport boundary.
//!
//! Every remote procedure rejects with a [`CallError`]. The remote variant wraps
//! the [`RemoteError`] envelope sent by the backend; the others cover failures
//! that never reached the server or were raised by this layer itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level error kind reported by the backend glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// The request was malformed or failed input validation.
    BadRequest,
    /// No valid session was presented.
    Unauthorized,
    /// The session is valid but not allowed to perform the call.
    Forbidden,
    /// The requested resource does not exist.
    NotFound,
    /// The request conflicts with the current server state.
    Conflict,
    /// A precondition of the call was not met.
    PreconditionFailed,
    /// The request body exceeded the server limit.
    PayloadTooLarge,
    /// The input was well-formed but semantically invalid.
    UnprocessableContent,
    /// The caller exceeded a rate limit.
    TooManyRequests,
    /// The server failed while handling the call.
    InternalServerError,
    /// An upstream dependency of the server failed.
    BadGateway,
    /// The server is temporarily unavailable.
    ServiceUnavailable,
    /// The server or a gateway timed out.
    Timeout,
    /// No response was received at all.
    Network,
}

impl TransportKind {
    /// Returns the kebab-case wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition-failed",
            Self::PayloadTooLarge => "payload-too-large",
            Self::UnprocessableContent => "unprocessable-content",
            Self::TooManyRequests => "too-many-requests",
            Self::InternalServerError => "internal-server-error",
            Self::BadGateway => "bad-gateway",
            Self::ServiceUnavailable => "service-unavailable",
            Self::Timeout => "timeout",
            Self::Network => "network",
        }
    }

    /// Returns `true` for kinds caused by the caller's input rather than by a
    /// malfunction.
    #[must_use]
    pub const fn is_validation(self) -> bool {
        matches!(
            self,
            Self::BadRequest
                | Self::Conflict
                | Self::PreconditionFailed
                | Self::PayloadTooLarge
                | Self::UnprocessableContent
        )
    }

    /// Returns `true` for kinds that may succeed when simply tried again.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::InternalServerError
                | Self::BadGateway
                | Self::ServiceUnavailable
                | Self::Timeout
                | Self::Network
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error envelope a remote procedure rejects with.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {}", .backend_message.as_deref().unwrap_or("no message"))]
pub struct RemoteError {
    /// Transport-level kind.
    pub kind: TransportKind,
    /// Machine-readable code supplied by the backend, e.g. `subscription-required`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_code: Option<String>,
    /// Human-readable message supplied by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_message: Option<String>,
    /// Structured data attached by the backend, e.g. `{"retryAfter": 30}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RemoteError {
    /// Creates an envelope carrying only a transport kind.
    #[must_use]
    pub const fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            backend_code: None,
            backend_message: None,
            data: None,
        }
    }

    /// Sets the backend code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.backend_code = Some(code.into());
        self
    }

    /// Sets the backend message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.backend_message = Some(message.into());
        self
    }

    /// Sets the structured data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns `true` if the backend code equals `code`.
    ///
    /// Comparison ignores ASCII case and treats `_` and `-` as the same
    /// character, so `SUBSCRIPTION_REQUIRED` matches `subscription-required`.
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.backend_code.as_deref().is_some_and(|own| {
            own.len() == code.len()
                && own
                    .bytes()
                    .zip(code.bytes())
                    .all(|(a, b)| normalize(a) == normalize(b))
        })
    }

    /// Returns the backend message if it is present and not blank.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.backend_message
            .as_deref()
            .filter(|message| !message.trim().is_empty())
    }
}

const fn normalize(byte: u8) -> u8 {
    match byte {
        b'_' => b'-',
        other => other.to_ascii_lowercase(),
    }
}

/// Failure of a remote procedure call as seen by the cache layer.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CallError {
    /// The backend rejected the call.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The call was cancelled by the cache layer and its result discarded.
    #[error("request cancelled")]
    Cancelled,

    /// Anything that is not part of the transport contract, such as a decoding
    /// bug in the backend glue.
    #[error("unexpected failure: {message}")]
    Unexpected {
        /// Description of the failure.
        message: String,
    },
}

impl CallError {
    /// Creates an [`CallError::Unexpected`] from anything displayable.
    pub fn unexpected(message: impl fmt::Display) -> Self {
        Self::Unexpected {
            message: message.to_string(),
        }
    }

    /// Returns the remote envelope, if any.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    /// Returns `true` if this is [`CallError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Serializes this error into a JSON value for telemetry.
    #[must_use]
    pub fn to_context(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::String(self.to_string()))
    }
}

impl From<TransportKind> for CallError {
    fn from(kind: TransportKind) -> Self {
        Self::Remote(RemoteError::new(kind))
    }
}
