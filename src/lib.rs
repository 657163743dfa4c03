pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod management;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use config::SyncConfig;
use db::DbPool;
use engine::cache::{ProviderCache, TtlCache};
use engine::subscription::{
    spawn_subscriptions, CacheSweepSubscription, ReactiveSubscription, ReconcileSubscription,
};
use engine::{CascadeDeleter, DualWriteCoordinator};
use error::AppError;
use management::{ManagementApi, ManagementClient};

/// Default lifetime of cached derived reads.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Shared state handed to whatever surface (route handlers, jobs) drives the
/// synchronization layer.
pub struct AppState {
    pub config: SyncConfig,
    pub db: DbPool,
    pub cache: Arc<ProviderCache>,
    pub coordinator: Arc<DualWriteCoordinator>,
    pub cascade: CascadeDeleter,
}

impl AppState {
    /// Open the database and wire the coordinator to the HTTP Management API client.
    pub fn from_config(config: SyncConfig) -> Result<Self, AppError> {
        let remote: Arc<dyn ManagementApi> = Arc::new(ManagementClient::new(&config.management)?);
        if remote.ensure_configured().is_err() {
            tracing::warn!("MANAGEMENT_API_KEY is not set; every sync operation will be refused");
        }
        let db = db::init_db(&config.db_path)?;
        Ok(Self::with_remote(config, db, remote))
    }

    /// Wire the layer around an existing pool and remote implementation.
    pub fn with_remote(config: SyncConfig, db: DbPool, remote: Arc<dyn ManagementApi>) -> Self {
        let cache: Arc<ProviderCache> = Arc::new(TtlCache::new(config.cache_capacity, CACHE_TTL));
        let coordinator = Arc::new(DualWriteCoordinator::new(
            db.clone(),
            remote,
            cache.clone(),
            config.limits,
            config.management.timeout,
        ));
        let cascade = CascadeDeleter::new(coordinator.clone());
        Self {
            config,
            db,
            cache,
            coordinator,
            cascade,
        }
    }

    /// Background jobs enabled by the configuration.
    pub fn subscriptions(&self) -> Vec<Box<dyn ReactiveSubscription>> {
        let mut subs: Vec<Box<dyn ReactiveSubscription>> = vec![Box::new(CacheSweepSubscription {
            cache: self.cache.clone(),
            every: self.config.cache_sweep_interval,
        })];
        match self.config.reconcile_interval {
            Some(every) => subs.push(Box::new(ReconcileSubscription {
                coordinator: self.coordinator.clone(),
                every,
            })),
            None => tracing::info!("Periodic reconciliation disabled"),
        }
        subs
    }
}

/// Boot logging, configuration, storage and background jobs, then wait for Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    logging::init();
    tracing::info!("Starting provider-sync v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::from_env()?;
    tracing::info!(
        management_url = %config.management.base_url,
        db_path = %config.db_path.display(),
        "Configuration loaded"
    );

    let state = AppState::from_config(config)?;
    let shutdown = CancellationToken::new();
    let handles = spawn_subscriptions(state.subscriptions(), shutdown.clone());

    shutdown_signal().await;
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Subscription task ended abnormally");
        }
    }

    tracing::info!("provider-sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl-C, shutting down");
        return;
    }
    tracing::info!("Shutdown signal received");
}
