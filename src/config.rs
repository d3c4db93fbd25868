use std::time::Duration;

/// Configuration for cache freshness and retention.
///
/// This controls how long reads are served from the cache and how long
/// unobserved entries are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// Fresh data is served without calling the server. Stale data is still
    /// shown while a refetch runs.
    pub stale_time: Duration,

    /// How long an entry without subscribers is retained before it is evicted.
    pub cache_time: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),      // immediately stale
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and cache times.
    #[must_use]
    pub const fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
        }
    }
}

/// Configuration for retrying failed reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every further retry.
    pub base_delay: Duration,
    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A configuration that never retries.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }
}

/// Presentation defaults used by the [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Whether errors use a blocking modal instead of a toast unless the call
    /// site says otherwise. Differs between clients.
    pub show_error_modal: bool,
    /// Fallback error message.
    pub default_error_message: String,
    /// Fallback success message.
    pub default_success_message: String,
    /// Message shown when the session token turns out to be invalid.
    pub session_expired_message: String,
    /// Countdown used by the rate-limit modal when the backend sends none.
    pub rate_limit_cooldown: Duration,
    /// Route of a full-screen paywall.
    ///
    /// When set, a subscription-required failure navigates here instead of
    /// opening the paywall modal. A route has no dismissal, so gated entries
    /// are reloaded on their next read.
    pub paywall_path: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::web()
    }
}

impl DispatchConfig {
    /// Defaults for the web client: errors surface as toasts.
    #[must_use]
    pub fn web() -> Self {
        Self {
            show_error_modal: false,
            default_error_message: "Something went wrong. Please try again.".to_owned(),
            default_success_message: "Saved".to_owned(),
            session_expired_message: "Your session has expired. Please sign in again.".to_owned(),
            rate_limit_cooldown: Duration::from_secs(60),
            paywall_path: None,
        }
    }

    /// Routes subscription-required failures to `path`.
    #[must_use]
    pub fn with_paywall_path(mut self, path: impl Into<String>) -> Self {
        self.paywall_path = Some(path.into());
        self
    }

    /// Defaults for the native client: errors surface as blocking modals.
    #[must_use]
    pub fn native() -> Self {
        Self {
            show_error_modal: true,
            ..Self::web()
        }
    }
}

/// Complete configuration of a [`QueryClient`](crate::QueryClient).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Cache freshness and retention.
    pub query: QueryConfig,
    /// Read retries.
    pub retry: RetryConfig,
    /// Error and success presentation.
    pub dispatch: DispatchConfig,
}
