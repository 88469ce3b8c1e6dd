//! Connection Manager: bounded, fixed-interval connection retries.
//!
//! Every attempt failure is logged and retried. Only exhausting the budget
//! is fatal, reported as [`BusError::Unrecoverable`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{error, info, warn};

use super::{BrokerConnector, BrokerSession, BusError, Result};
use crate::utils::retry::{connection_backoff, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY};

/// Attempt budget for establishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included. Values below 1 count as 1.
    pub max_attempts: u32,
    /// Pause after each failed attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            delay: DEFAULT_CONNECT_DELAY,
        }
    }
}

/// Establishes sessions for one broker address.
///
/// Shared by the producer and every consumer service.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    url: String,
    policy: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            url: url.into(),
            policy,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Open a connection and its channel, retrying per the policy.
    pub async fn establish(&self) -> Result<Arc<dyn BrokerSession>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let counter = AtomicU32::new(0);
        let attempt = &counter;
        let connector = &self.connector;
        let url = self.url.as_str();

        let result = (|| async move {
            let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            info!(attempt = n, max_attempts, url = %url, "Connecting to broker");
            connector.connect(url).await
        })
        .retry(connection_backoff(max_attempts, self.policy.delay))
        .notify(|err: &BusError, delay: Duration| {
            warn!(
                attempt = attempt.load(Ordering::SeqCst),
                max_attempts,
                error = %err,
                delay = ?delay,
                "Broker connection failed, retrying"
            );
        })
        .await;

        match result {
            Ok(session) => {
                info!(
                    attempt = attempt.load(Ordering::SeqCst),
                    url = %self.url,
                    "Connected to broker"
                );
                Ok(session)
            }
            Err(e) => {
                let attempts = attempt.load(Ordering::SeqCst);
                error!(
                    attempts,
                    error = %e,
                    "Could not connect to broker, giving up"
                );
                Err(BusError::Unrecoverable {
                    attempts,
                    last_error: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBroker;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connects_first_try() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        let manager = ConnectionManager::new(connector.clone(), "memory://", fast_policy(10));

        let session = manager.establish().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_nine_failures_then_success() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(9);
        let manager = ConnectionManager::new(connector.clone(), "memory://", fast_policy(10));

        let session = manager.establish().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(connector.attempts(), 10);
    }

    #[tokio::test]
    async fn test_ten_failures_are_unrecoverable() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(10);
        let manager = ConnectionManager::new(connector.clone(), "memory://", fast_policy(10));

        let err = manager.establish().await.err().unwrap();
        assert!(err.is_unrecoverable());
        assert!(matches!(err, BusError::Unrecoverable { attempts: 10, .. }));
        assert_eq!(connector.attempts(), 10);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(5);
        let manager = ConnectionManager::new(connector.clone(), "memory://", fast_policy(0));

        let err = manager.establish().await.err().unwrap();
        assert!(matches!(err, BusError::Unrecoverable { attempts: 1, .. }));
    }
}
