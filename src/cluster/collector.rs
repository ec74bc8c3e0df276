//! Quorum-style response collection for cluster-wide exchanges.
//!
//! A [`ResponseCollector`] waits for exactly N asynchronous remote responses.
//! Success deliveries increment a counter; the first error delivery is stored
//! and completes the wait immediately (fail-fast). The waiting side blocks in
//! `wait` until signaled or until its timeout elapses, in which case the
//! timeout error carries the expected and received counts for diagnostics.
//!
//! The wait is built on shared state under a std mutex plus
//! [`tokio::sync::Notify`]; there is no busy spin. A fresh collector is
//! required per outstanding request; collectors are not reused.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug)]
struct CollectorState {
    received: usize,
    first_error: Option<Error>,
    done: bool,
}

/// Collects a fixed number of asynchronous responses, failing fast on the
/// first remote error.
#[derive(Debug)]
pub struct ResponseCollector {
    expected: usize,
    state: Mutex<CollectorState>,
    notify: Notify,
}

impl ResponseCollector {
    /// Create a collector expecting `expected` responses.
    ///
    /// An expectation of zero completes immediately on `wait`.
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            state: Mutex::new(CollectorState {
                received: 0,
                first_error: None,
                done: expected == 0,
            }),
            notify: Notify::new(),
        }
    }

    /// The number of responses this collector expects.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Deliver one successful response.
    ///
    /// Deliveries after completion are ignored (late responses from
    /// timed-out peers are discarded, not errors).
    pub fn complete_one(&self) {
        let mut state = self.state.lock().expect("collector state poisoned");
        if state.done {
            return;
        }
        state.received += 1;
        if state.received >= self.expected {
            state.done = true;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Deliver a remote error, completing the wait immediately.
    ///
    /// Only the first error is kept; later deliveries of any kind are
    /// ignored.
    pub fn fail(&self, error: Error) {
        let mut state = self.state.lock().expect("collector state poisoned");
        if state.done {
            return;
        }
        state.first_error = Some(error);
        state.done = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Current received count (diagnostics only).
    pub fn received(&self) -> usize {
        self.state.lock().expect("collector state poisoned").received
    }

    /// Block until all expected responses arrive, an error is delivered, or
    /// the timeout elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before checking state so a signal between
            // the check and the await is not lost.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().expect("collector state poisoned");
                if state.done {
                    return match state.first_error.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let state = self.state.lock().expect("collector state poisoned");
                return Err(Error::timeout(state.received, self.expected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_at_expected_count() {
        let collector = Arc::new(ResponseCollector::new(3));
        let waiter = {
            let c = Arc::clone(&collector);
            tokio::spawn(async move { c.wait(Duration::from_secs(1)).await })
        };
        collector.complete_one();
        collector.complete_one();
        collector.complete_one();
        waiter.await.unwrap().unwrap();
        assert_eq!(collector.received(), 3);
    }

    #[tokio::test]
    async fn test_zero_expected_completes_immediately() {
        let collector = ResponseCollector::new(0);
        collector.wait(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_fast_on_remote_error() {
        let collector = Arc::new(ResponseCollector::new(5));
        collector.complete_one();
        collector.fail(Error::Send("peer 3 refused".to_string()));

        let err = collector.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("peer 3 refused"));
    }

    #[tokio::test]
    async fn test_timeout_reports_progress() {
        let collector = ResponseCollector::new(4);
        collector.complete_one();
        collector.complete_one();

        let err = collector.wait(Duration::from_millis(20)).await.unwrap_err();
        match err {
            Error::Timeout {
                completed,
                expected,
            } => {
                assert_eq!(completed, 2);
                assert_eq!(expected, 4);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_late_deliveries_ignored() {
        let collector = ResponseCollector::new(1);
        collector.complete_one();
        // Late traffic after completion must not disturb the outcome.
        collector.complete_one();
        collector.fail(Error::Send("late".to_string()));
        collector.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_any_delivery() {
        let collector = Arc::new(ResponseCollector::new(2));
        let waiter = {
            let c = Arc::clone(&collector);
            tokio::spawn(async move { c.wait(Duration::from_secs(1)).await })
        };
        // Give the waiter a chance to park first.
        tokio::time::sleep(Duration::from_millis(5)).await;
        collector.complete_one();
        collector.complete_one();
        waiter.await.unwrap().unwrap();
    }
}
