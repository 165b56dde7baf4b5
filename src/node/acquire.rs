//! Connection Acquisition
//!
//! Leases a session from a node's pool, racing each attempt against a
//! timeout and retrying under a bounded policy. Never raises: exhaustion is
//! reported as `Acquired::Unavailable` so callers can degrade.

use std::time::Duration;
use tokio::time::{sleep, timeout};

use super::{NodeBackend, NodeRole, NodeSession};
use crate::error::Error;

/// Longest wait between two attempts, whatever the backoff
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Bounded retry policy for connection acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Total attempts, at least 1
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub interval: Duration,
    /// Multiplier applied to the wait after each failed attempt
    pub backoff: f64,
}

impl RetryPolicy {
    /// Fixed-interval policy
    pub fn fixed(timeout: Duration, max_attempts: u32, interval: Duration) -> Self {
        Self {
            timeout,
            max_attempts,
            interval,
            backoff: 1.0,
        }
    }

    /// Policy with no wait between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(Duration::from_millis(100), max_attempts, Duration::ZERO)
    }

    /// Wait after the given failed attempt (1-based), capped at
    /// `MAX_RETRY_DELAY`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.interval.as_secs_f64() * factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2), 3, Duration::from_millis(200))
    }
}

/// Outcome of an acquisition
pub enum Acquired {
    Connected(Box<dyn NodeSession>),
    Unavailable,
}

impl Acquired {
    pub fn is_connected(&self) -> bool {
        matches!(self, Acquired::Connected(_))
    }

    /// Take the session, if any
    pub fn into_session(self) -> Option<Box<dyn NodeSession>> {
        match self {
            Acquired::Connected(session) => Some(session),
            Acquired::Unavailable => None,
        }
    }
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquired::Connected(_) => f.write_str("Connected"),
            Acquired::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Lease a session from `backend`, retrying under `policy`
pub async fn acquire(role: NodeRole, backend: &dyn NodeBackend, policy: &RetryPolicy) -> Acquired {
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match timeout(policy.timeout, backend.connect()).await {
            Ok(Ok(session)) => {
                if attempt > 1 {
                    tracing::info!("Connected to {} node on attempt {}/{}", role, attempt, attempts);
                }
                return Acquired::Connected(session);
            }
            Ok(Err(e)) => {
                tracing::warn!("Attempt {}/{} to connect to {} node failed: {}", attempt, attempts, role, e);
            }
            Err(_) => {
                tracing::warn!(
                    "Attempt {}/{} to connect to {} node timed out after {:?}",
                    attempt, attempts, role, policy.timeout
                );
            }
        }

        if attempt < attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    tracing::warn!("{}", Error::ConnectionTimeout(role));
    Acquired::Unavailable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory::MemoryNode;
    use std::time::Instant;

    #[test]
    fn test_backoff_delays() {
        let fixed = RetryPolicy::fixed(Duration::from_secs(1), 3, Duration::from_millis(100));
        assert_eq!(fixed.delay_after(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_after(2), Duration::from_millis(100));

        let growing = RetryPolicy {
            backoff: 2.0,
            ..fixed
        };
        assert_eq!(growing.delay_after(1), Duration::from_millis(100));
        assert_eq!(growing.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_huge_backoff_is_capped() {
        let steep = RetryPolicy {
            backoff: 1e300,
            ..RetryPolicy::fixed(Duration::from_secs(1), 5, Duration::from_millis(100))
        };
        assert_eq!(steep.delay_after(1), Duration::from_millis(100));
        assert_eq!(steep.delay_after(3), MAX_RETRY_DELAY);
        assert_eq!(steep.delay_after(u32::MAX), MAX_RETRY_DELAY);

        let unbounded = RetryPolicy {
            backoff: f64::INFINITY,
            ..steep.clone()
        };
        assert_eq!(unbounded.delay_after(2), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_acquire_with_huge_backoff_reports_unavailable() {
        let node = MemoryNode::new(NodeRole::BeforeCutoff);
        node.set_reachable(false);
        let policy = RetryPolicy {
            backoff: 1e300,
            ..RetryPolicy::immediate(4)
        };

        let acquired = acquire(NodeRole::BeforeCutoff, &*node, &policy).await;
        assert!(!acquired.is_connected());
        assert_eq!(node.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_acquire_reachable() {
        let node = MemoryNode::new(NodeRole::Central);
        let acquired = acquire(NodeRole::Central, &*node, &RetryPolicy::immediate(1)).await;
        assert!(acquired.is_connected());
        assert_eq!(node.leased(), 1);
        drop(acquired);
        assert_eq!(node.leased(), 0);
    }

    #[tokio::test]
    async fn test_acquire_exhausts_retries() {
        let node = MemoryNode::new(NodeRole::BeforeCutoff);
        node.set_reachable(false);

        let acquired = acquire(NodeRole::BeforeCutoff, &*node, &RetryPolicy::immediate(3)).await;
        assert!(!acquired.is_connected());
        assert_eq!(node.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_acquire_times_out_hanging_pool() {
        let node = MemoryNode::new(NodeRole::AfterCutoff);
        node.set_hanging(true);

        let policy = RetryPolicy::fixed(Duration::from_millis(20), 2, Duration::from_millis(5));
        let started = Instant::now();
        let acquired = acquire(NodeRole::AfterCutoff, &*node, &policy).await;

        assert!(!acquired.is_connected());
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(node.leased(), 0);
    }

    #[tokio::test]
    async fn test_acquire_recovers_after_transient_failure() {
        let node = MemoryNode::new(NodeRole::Central);
        node.fail_next_connects(2);

        let acquired = acquire(NodeRole::Central, &*node, &RetryPolicy::immediate(3)).await;
        assert!(acquired.is_connected());
        assert_eq!(node.connect_attempts(), 3);
    }
}
