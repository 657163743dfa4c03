//! Periodic re-verification of local ownership rows against remote truth.
//!
//! A write that timed out locally may still have landed remotely, and operators
//! can edit remote lists directly. Each pass takes the same per-endpoint lock
//! as the coordinator, re-reads the rows for that endpoint and deletes the ones
//! with no remote counterpart. Remote entries without an owner are left alone.

use serde::Serialize;

use crate::db::repos::resources::{account_ownership, key_ownership};
use crate::engine::coordinator::DualWriteCoordinator;
use crate::engine::fingerprint::matches;
use crate::error::AppError;
use crate::management::types::{
    FlatClass, ResourceClass, AUTH_FILES_ENDPOINT, COMPATIBILITY_ENDPOINT,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub orphans_removed: usize,
    /// One line per endpoint that could not be verified this pass.
    pub errors: Vec<String>,
}

impl DualWriteCoordinator {
    /// Run one reconciliation pass over every key list and the auth-file list.
    /// A remote failure on one endpoint is recorded and the others still run.
    pub async fn reconcile(&self) -> Result<ReconcileReport, AppError> {
        self.remote.ensure_configured()?;
        let mut report = ReconcileReport::default();

        let endpoints = FlatClass::ALL
            .iter()
            .map(|c| c.endpoint())
            .chain(std::iter::once(COMPATIBILITY_ENDPOINT));
        for endpoint in endpoints {
            if let Err(e) = self.reconcile_keys(endpoint, &mut report).await {
                if !e.is_remote() && !matches!(e, AppError::Validation(_)) {
                    return Err(e);
                }
                tracing::warn!(endpoint, error = %e, "Reconciliation skipped endpoint");
                report.errors.push(format!("{endpoint}: {e}"));
            }
        }

        if let Err(e) = self.reconcile_accounts(&mut report).await {
            if !e.is_remote() && !matches!(e, AppError::Validation(_)) {
                return Err(e);
            }
            tracing::warn!(endpoint = AUTH_FILES_ENDPOINT, error = %e, "Reconciliation skipped endpoint");
            report.errors.push(format!("{AUTH_FILES_ENDPOINT}: {e}"));
        }

        if report.orphans_removed > 0 || !report.errors.is_empty() {
            tracing::info!(
                checked = report.checked,
                orphans_removed = report.orphans_removed,
                errors = report.errors.len(),
                "Reconciliation pass finished"
            );
        } else {
            tracing::debug!(checked = report.checked, "Reconciliation pass found nothing to do");
        }
        Ok(report)
    }

    async fn reconcile_keys(
        &self,
        endpoint: &'static str,
        report: &mut ReconcileReport,
    ) -> Result<(), AppError> {
        let _guard = self.locks.acquire(endpoint).await;

        let mut rows = Vec::new();
        for row in key_ownership::get_all(&self.pool)? {
            match row.resource_class.parse::<ResourceClass>() {
                Ok(class) if class.endpoint() == endpoint => rows.push((row, class)),
                Ok(_) => {}
                Err(e) => {
                    // Unknown classes never match any endpoint; report them once.
                    if endpoint == COMPATIBILITY_ENDPOINT {
                        report.errors.push(format!("{}: {e}", row.display_mask));
                    }
                }
            }
        }
        let Some((_, probe)) = rows.first() else {
            return Ok(());
        };

        // Every class on one endpoint shares the same remote array.
        let list = self
            .remote_call(&format!("GET /{endpoint}"), self.remote.fetch_keys(probe))
            .await?;

        let mut removed = 0;
        for (row, class) in &rows {
            report.checked += 1;
            if list.find_secret(class, |s| matches(s, &row.fingerprint)).is_none() {
                key_ownership::delete_by_fingerprint(&self.pool, &row.fingerprint)?;
                tracing::warn!(
                    owner_id = %row.owner_id,
                    mask = %row.display_mask,
                    class = %class,
                    "Removed ownership row with no remote key"
                );
                removed += 1;
            }
        }
        if removed > 0 {
            report.orphans_removed += removed;
            self.invalidate(endpoint);
        }
        Ok(())
    }

    async fn reconcile_accounts(&self, report: &mut ReconcileReport) -> Result<(), AppError> {
        let _guard = self.locks.acquire(AUTH_FILES_ENDPOINT).await;

        let rows = account_ownership::get_all(&self.pool)?;
        if rows.is_empty() {
            return Ok(());
        }
        let files = self
            .remote_call(
                &format!("GET /{AUTH_FILES_ENDPOINT}"),
                self.remote.fetch_auth_files(),
            )
            .await?;

        let mut removed = 0;
        for row in &rows {
            report.checked += 1;
            if !files.iter().any(|f| f.name == row.account_name) {
                account_ownership::delete_by_id(&self.pool, &row.id)?;
                tracing::warn!(
                    owner_id = %row.owner_id,
                    account_name = %row.account_name,
                    "Removed ownership row with no remote auth file"
                );
                removed += 1;
            }
        }
        if removed > 0 {
            report.orphans_removed += removed;
            self.invalidate(AUTH_FILES_ENDPOINT);
        }
        Ok(())
    }
}
