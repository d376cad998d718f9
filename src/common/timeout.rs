//! Bounded waits that report a timeout as a value instead of an error.

use std::future::Future;
use std::time::Duration;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bounded<T> {
    Completed(T),
    TimedOut,
}

impl<T> Bounded<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Convert into an `Option`, discarding the timeout marker.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// Wait for `future` at most `limit`.
pub async fn bounded<F>(limit: Duration, future: F) -> Bounded<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(limit, future).await {
        Ok(value) => Bounded::Completed(value),
        Err(_) => Bounded::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_limit() {
        let result = bounded(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Bounded::Completed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let result = bounded(Duration::from_millis(50), std::future::pending::<()>()).await;
        assert!(result.is_timed_out());
        assert_eq!(result.completed(), None);
    }
}
