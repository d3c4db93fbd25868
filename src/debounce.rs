//! Debouncing for reads driven by typing, such as availability checks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

/// Runs only the last of a burst of calls.
///
/// Each call to [`Debouncer::run`] waits for the delay. If another call
/// started in the meantime, the earlier one gives up without running its
/// work. Clones share the same burst.
///
/// # Example
///
/// ```rust,ignore
/// let debouncer = Debouncer::new(Duration::from_millis(300));
/// let query = Query::from_procedure(query_key!["username-available", name.clone()], check, name);
/// if let Some(result) = debouncer.run(|| client.fetch(&query)).await {
///     show_availability(result?);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    latest: Arc<AtomicU64>,
}

impl Debouncer {
    /// Creates a debouncer with the given quiet period.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the quiet period.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits for the quiet period, then runs `work` unless a later call
    /// superseded this one.
    ///
    /// Returns `None` if superseded.
    pub async fn run<F, Fut, T>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.latest.load(Ordering::SeqCst) != ticket {
            trace!(ticket, "debounced call superseded");
            return None;
        }
        Some(work().await)
    }

    /// Supersedes every pending call.
    pub fn cancel(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}
