use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::store::{StoreError, StoreHandle};
use crate::util::duration_millis;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(50);

/// Backoff for store calls, driven by the error's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// `base * 2^attempt` plus uniform jitter in `[0, max_jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)));
        let jitter_ms = duration_millis(self.max_jitter);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exponential + jitter
    }

    /// Retries `op` while it fails with a transient error. Any other error,
    /// and the last transient one once attempts run out, is returned as is.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = duration_millis(delay),
                        error = %err,
                        "transient store error; retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`RetryPolicy::run`], and also reacts to corruption and timeouts
    /// through the store. A corrupted table is dropped for resync and the
    /// error returned. A timeout drops the table and retries once; a second
    /// timeout resets the whole store directory.
    pub fn run_with_recovery<T, F>(
        &self,
        store: &mut StoreHandle,
        operation: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(&mut StoreHandle) -> Result<T, StoreError>,
    {
        let mut recovered_timeout = false;
        loop {
            match self.run(operation, || op(store)) {
                Ok(value) => return Ok(value),
                Err(StoreError::Corrupted { table, detail }) => {
                    warn!(operation, table = ?table, detail = %detail, "corrupted table; dropping for resync");
                    store.recover_table(table.as_deref())?;
                    return Err(StoreError::Corrupted { table, detail });
                }
                Err(StoreError::Timeout {
                    operation: timed_out,
                    table,
                    elapsed_ms,
                }) => {
                    if recovered_timeout {
                        warn!(operation, "store still timing out; resetting store directory");
                        store.reset_store()?;
                        return Err(StoreError::Timeout {
                            operation: timed_out,
                            table,
                            elapsed_ms,
                        });
                    }
                    warn!(operation, table = ?table, elapsed_ms, "store timeout; recovering table");
                    store.recover_table(table.as_deref())?;
                    recovered_timeout = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::store::{ErrorClass, InProcessProbe, StoreConfig};

    #[test]
    fn delay_grows_exponentially_with_bounded_jitter() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            let delay = policy.delay_for(attempt);
            let floor = DEFAULT_BASE_DELAY * 2_u32.pow(attempt);
            assert!(delay >= floor);
            assert!(delay <= floor + DEFAULT_MAX_JITTER);
        }
    }

    #[test]
    fn transient_failures_then_success_returns_value() {
        let policy = RetryPolicy::immediate(3);
        let calls = Cell::new(0);
        let result = policy.run("upsert", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Transient("commit conflict".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausted_retries_reraise_the_original_error() {
        let policy = RetryPolicy::immediate(3);
        let calls = Cell::new(0);
        let err = policy
            .run("upsert", || -> Result<(), StoreError> {
                calls.set(calls.get() + 1);
                Err(StoreError::Transient(format!("conflict {}", calls.get())))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert!(err.to_string().contains("conflict 3"));
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let policy = RetryPolicy::immediate(3);
        for err in [
            StoreError::Fatal("bad".to_string()),
            StoreError::missing_backing_file("messages", "data.sqlite"),
            StoreError::timeout("open table", Some("messages"), 10),
        ] {
            let calls = Cell::new(0);
            let class = err.class();
            let mut pending = Some(err);
            let result = policy.run("query", || -> Result<(), StoreError> {
                calls.set(calls.get() + 1);
                Err(pending.take().unwrap_or_else(|| StoreError::Fatal("again".to_string())))
            });
            assert_eq!(calls.get(), 1);
            assert_eq!(result.unwrap_err().class(), class);
        }
    }

    #[test]
    fn corruption_drops_the_named_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("store"), dir.path().join("locks"))
            .with_dimensions(4);
        let mut store = StoreHandle::new(config, Box::new(InProcessProbe));
        store.ensure_tables().unwrap();

        let err = RetryPolicy::immediate(3)
            .run_with_recovery(&mut store, "scan", |_| -> Result<(), StoreError> {
                Err(StoreError::missing_backing_file("messages", "data.sqlite"))
            })
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Corrupted(Some("messages".to_string())));
        assert!(store.resync_required());
        assert!(!dir.path().join("store/messages").exists());
        assert!(dir.path().join("store/conversations").exists());
    }

    #[test]
    fn repeated_timeout_escalates_to_store_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("store"), dir.path().join("locks"))
            .with_dimensions(4);
        let mut store = StoreHandle::new(config, Box::new(InProcessProbe));
        store.ensure_tables().unwrap();

        let calls = Cell::new(0);
        let err = RetryPolicy::immediate(3)
            .run_with_recovery(&mut store, "open", |_| -> Result<(), StoreError> {
                calls.set(calls.get() + 1);
                Err(StoreError::timeout("open table", Some("messages"), 10_000))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 2);
        assert_eq!(err.class(), ErrorClass::Timeout(Some("messages".to_string())));
        assert!(!dir.path().join("store/conversations").exists());
        assert!(dir.path().join("store").exists());
    }

    #[test]
    fn timeout_recovered_on_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("store"), dir.path().join("locks"))
            .with_dimensions(4);
        let mut store = StoreHandle::new(config, Box::new(InProcessProbe));

        let calls = Cell::new(0);
        let rows = RetryPolicy::immediate(3)
            .run_with_recovery(&mut store, "count", |store| {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    return Err(StoreError::timeout("open table", Some("messages"), 10_000));
                }
                store.messages()?.count(None)
            })
            .unwrap();
        assert_eq!(rows, 0);
        assert!(store.resync_required());
    }
}
