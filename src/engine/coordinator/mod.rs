//! Dual-write coordination between the local ownership registry and the
//! Management API.
//!
//! Every mutation follows the same shape: acquire the per-endpoint lock, write
//! the local row, GET the authoritative remote list, modify it, write it back,
//! and only then release the lock. Local rows written ahead of a remote step are
//! registered with a [`Saga`](crate::engine::saga::Saga) so a failing or
//! timed-out remote step deletes them again. Reads never lock; they may see the
//! list before or after a concurrent mutation but never a torn one.

mod accounts;
mod keys;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::OwnershipLimits;
use crate::db::DbPool;
use crate::engine::cache::ProviderCache;
use crate::engine::keyed_mutex::KeyedMutex;
use crate::error::AppError;
use crate::management::ManagementApi;

pub use accounts::AccountListing;
pub use keys::{Contribution, KeyListing};

// ============================================================================
// Shared outcome types
// ============================================================================

/// Result of a successful removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOutcome {
    /// Removed remotely, then locally.
    Removed,
    /// The remote entry was already gone; only the stale local row was deleted.
    OrphanCleaned,
}

/// How a listed remote entry relates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOwnership {
    Yours,
    /// Registered by another user.
    Team,
    /// Present remotely with no local owner (configured by an operator).
    Unassigned,
}

// ============================================================================
// DualWriteCoordinator
// ============================================================================

pub struct DualWriteCoordinator {
    pub(crate) pool: DbPool,
    pub(crate) remote: Arc<dyn ManagementApi>,
    pub(crate) locks: Arc<KeyedMutex>,
    pub(crate) cache: Arc<ProviderCache>,
    limits: OwnershipLimits,
    remote_timeout: Duration,
}

impl DualWriteCoordinator {
    pub fn new(
        pool: DbPool,
        remote: Arc<dyn ManagementApi>,
        cache: Arc<ProviderCache>,
        limits: OwnershipLimits,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            remote,
            locks: Arc::new(KeyedMutex::new()),
            cache,
            limits,
            remote_timeout,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    /// Bound a remote call by the configured deadline. Expiry surfaces as
    /// `Timeout` and takes the same rollback path as an HTTP error.
    pub(crate) async fn remote_call<T, Fut>(&self, what: &str, fut: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    what,
                    timeout_ms = self.remote_timeout.as_millis() as u64,
                    "Management API call timed out"
                );
                Err(AppError::Timeout(format!(
                    "{what} did not complete within {}ms",
                    self.remote_timeout.as_millis()
                )))
            }
        }
    }

    /// Drop cached reads scoped to `endpoint` plus every derived read.
    pub(crate) fn invalidate(&self, endpoint: &str) {
        let dropped = self.cache.invalidate_endpoint(endpoint);
        if dropped > 0 {
            tracing::debug!(endpoint, dropped, "Invalidated cached reads");
        }
    }
}

fn authorize(owner_id: &str, row_owner: &str, is_admin: bool, what: &str) -> Result<(), AppError> {
    if owner_id == row_owner || is_admin {
        Ok(())
    } else {
        Err(AppError::AccessDenied(format!("{what} belongs to another user")))
    }
}
