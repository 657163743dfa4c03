//! Background maintenance loops.
//!
//! Every periodic job follows the same pattern: wait for the next interval,
//! do one unit of work, log the outcome, repeat. The [`ReactiveSubscription`]
//! trait captures that pattern and [`spawn_subscriptions`] runs each
//! implementor in its own task until the shared `CancellationToken` fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::cache::ProviderCache;
use crate::engine::coordinator::DualWriteCoordinator;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ReactiveSubscription: Send + Sync + 'static {
    /// Label used in logs.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Delay before the first tick.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One unit of work. Errors are logged internally; the loop continues regardless.
    async fn tick(&self);
}

// ---------------------------------------------------------------------------
// Concrete subscriptions
// ---------------------------------------------------------------------------

/// Drops expired cache entries that nobody has read since they expired.
pub struct CacheSweepSubscription {
    pub cache: Arc<ProviderCache>,
    pub every: Duration,
}

/// Re-verifies ownership rows against the Management API.
pub struct ReconcileSubscription {
    pub coordinator: Arc<DualWriteCoordinator>,
    pub every: Duration,
}

#[async_trait::async_trait]
impl ReactiveSubscription for CacheSweepSubscription {
    fn name(&self) -> &'static str {
        "cache_sweep"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    fn initial_delay(&self) -> Duration {
        self.every
    }

    async fn tick(&self) {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, remaining = self.cache.len(), "Swept expired cache entries");
        }
    }
}

#[async_trait::async_trait]
impl ReactiveSubscription for ReconcileSubscription {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    // Let startup traffic settle before the first full pass.
    fn initial_delay(&self) -> Duration {
        Duration::from_secs(30).min(self.every)
    }

    async fn tick(&self) {
        if let Err(e) = self.coordinator.reconcile().await {
            tracing::warn!(kind = e.kind(), error = %e, "Reconciliation pass failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run_single(sub: Box<dyn ReactiveSubscription>, shutdown: CancellationToken) {
    let name = sub.name();
    let delay = sub.initial_delay();
    if !delay.is_zero() {
        tracing::debug!(subscription = name, delay_secs = delay.as_secs(), "Delaying initial tick");
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(subscription = name, "Subscription stopped before first tick");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut interval = tokio::time::interval(sub.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => sub.tick().await,
        }
    }
    tracing::info!(subscription = name, "Subscription loop exited");
}

/// Spawn each subscription as an independent task. All of them stop once
/// `shutdown` is cancelled; a tick already in progress finishes first.
pub fn spawn_subscriptions(
    subscriptions: Vec<Box<dyn ReactiveSubscription>>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    subscriptions
        .into_iter()
        .map(|sub| {
            tracing::info!(subscription = sub.name(), every_secs = sub.interval().as_secs(), "Starting subscription");
            tokio::spawn(run_single(sub, shutdown.clone()))
        })
        .collect()
}
