use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// In-process mutual exclusion per resource key (one key per remote list).
///
/// Each key gets its own lazily created `tokio::sync::Mutex`, which queues
/// waiters in FIFO order. Unrelated keys never contend. Locks are retained for
/// the process lifetime; the key space is the small set of remote endpoints.
///
/// Single-process only. A multi-instance deployment needs a distributed lock
/// (e.g. a database advisory lock); the ownership tables' unique constraints
/// remain the only cross-process net, and they cannot prevent interleaved
/// list rewrites.
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock for one key. Dropping it releases the key, so every exit path
/// (success, `?` early return, timeout, panic unwinding) releases.
pub struct KeyGuard {
    key: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for the current holder of `key` (if any) to release, then take it.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self.lock_for(key);
        let started = Instant::now();
        let guard = lock.lock_owned().await;
        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::debug!(key, waited_ms = waited.as_millis() as u64, "Waited for keyed lock");
        }
        KeyGuard {
            key: key.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Take `key` only if nobody holds it.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let guard = self.lock_for(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    /// Number of distinct keys seen so far.
    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.locks.len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicit release; equivalent to dropping the guard.
    #[cfg(test)]
    pub(crate) fn release(self) {}
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        tracing::trace!(
            key = %self.key(),
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released keyed lock"
        );
    }
}
