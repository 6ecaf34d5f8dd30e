//! Bounded acquisition of per-step advisory locks.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::plan::StepId;
use crate::store::LedgerStore;
use crate::{Error, Result, TRACING_TARGET_EXECUTOR};

/// How long and how often to retry a contended step lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Total time to wait before failing with [`Error::LockTimeout`].
    pub wait: Duration,
    /// Delay between attempts.
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            retry_interval: Duration::from_millis(250),
        }
    }
}

impl LockPolicy {
    /// Creates a policy with the given bounds.
    pub fn new(wait: Duration, retry_interval: Duration) -> Self {
        Self {
            wait,
            retry_interval,
        }
    }
}

/// Executor settings exposed through configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "executor configurations must be turned into a lock policy"]
pub struct ExecutorConfig {
    /// Maximum seconds to wait for a migration step lock (1-600)
    #[cfg_attr(
        feature = "config",
        arg(long = "lock-wait-secs", env = "PGFORGE_LOCK_WAIT_SECS", default_value = "30")
    )]
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Milliseconds between lock attempts (10-10000)
    #[cfg_attr(
        feature = "config",
        arg(
            long = "lock-retry-interval-ms",
            env = "PGFORGE_LOCK_RETRY_INTERVAL_MS",
            default_value = "250"
        )
    )]
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
}

const MIN_LOCK_WAIT_SECS: u64 = 1;
const MAX_LOCK_WAIT_SECS: u64 = 600;

const MIN_RETRY_INTERVAL_MS: u64 = 10;
const MAX_RETRY_INTERVAL_MS: u64 = 10_000;

const fn default_lock_wait_secs() -> u64 {
    30
}

const fn default_lock_retry_interval_ms() -> u64 {
    250
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lock_wait_secs: default_lock_wait_secs(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

impl ExecutorConfig {
    /// Validates the configured bounds.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_LOCK_WAIT_SECS..=MAX_LOCK_WAIT_SECS).contains(&self.lock_wait_secs) {
            return Err(Error::Config(format!(
                "lock_wait_secs must be between {MIN_LOCK_WAIT_SECS} and {MAX_LOCK_WAIT_SECS}"
            )));
        }

        if !(MIN_RETRY_INTERVAL_MS..=MAX_RETRY_INTERVAL_MS).contains(&self.lock_retry_interval_ms)
        {
            return Err(Error::Config(format!(
                "lock_retry_interval_ms must be between {MIN_RETRY_INTERVAL_MS} and {MAX_RETRY_INTERVAL_MS}"
            )));
        }

        Ok(())
    }

    /// Returns the lock policy described by this configuration.
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::new(
            Duration::from_secs(self.lock_wait_secs),
            Duration::from_millis(self.lock_retry_interval_ms),
        )
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("lock_wait_secs", &self.lock_wait_secs)
            .field("lock_retry_interval_ms", &self.lock_retry_interval_ms)
            .finish()
    }
}

/// Polls the step lock until it is taken or the policy's wait elapses.
pub(crate) async fn acquire_step_lock<C>(conn: &mut C, step: StepId, policy: &LockPolicy) -> Result<()>
where
    C: LedgerStore + Send,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if conn.try_lock_step(step).await? {
            if attempts > 1 {
                tracing::debug!(
                    target: TRACING_TARGET_EXECUTOR,
                    step = %step,
                    attempts,
                    waited = ?start.elapsed(),
                    "Acquired contended step lock"
                );
            }
            return Ok(());
        }

        let waited = start.elapsed();
        if waited >= policy.wait {
            tracing::warn!(
                target: TRACING_TARGET_EXECUTOR,
                step = %step,
                attempts,
                waited = ?waited,
                "Gave up waiting for step lock"
            );
            return Err(Error::LockTimeout { step, waited });
        }

        tokio::time::sleep(policy.retry_interval.min(policy.wait - waited)).await;
    }
}
