//! Node configuration.

use std::time::Duration;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Retries for loads that find the value unavailable.
    pub retry: RetryPolicy,
    /// How long one load attempt waits for peers to answer.
    pub load_timeout: Duration,
    /// Peer driver settings.
    pub sync: SyncConfig,
    /// Default bound for [`LocalNode::wait_for_sync`](crate::LocalNode::wait_for_sync).
    pub wait_for_sync_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            load_timeout: Duration::from_secs(30),
            sync: SyncConfig::default(),
            wait_for_sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounded retry for unavailable loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt.
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Peer driver configuration.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Bound on a single transport send.
    pub send_timeout: Duration,
    /// Bound on flushing a peer's outbox when it is closed.
    pub flush_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_retry_makes_one_attempt() {
        assert_eq!(RetryPolicy::disabled().attempts(), 1);
        let zero = RetryPolicy {
            max_attempts: 0,
            retry_delay: Duration::from_millis(5),
        };
        assert_eq!(zero.attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
    }
}
