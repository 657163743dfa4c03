//! Best-effort removal of everything one user owns, across both stores.
//!
//! Every owned resource is removed through the coordinator in its own task, so
//! one failure (or panic) never cancels the others. The report carries per-family
//! counts and one error line per failed resource; only a failure to enumerate
//! the owned sets aborts the cascade.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use crate::db::repos::resources::{account_ownership, key_ownership};
use crate::engine::coordinator::{DualWriteCoordinator, RemoveOutcome};
use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FamilyReport {
    pub removed: usize,
    pub failed_to_remove: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub credentials: FamilyReport,
    pub oauth_accounts: FamilyReport,
    /// Set when the owned sets could not be loaded; nothing was attempted.
    pub fatal_error: Option<String>,
}

impl CascadeReport {
    pub fn total_failed(&self) -> usize {
        self.credentials.failed_to_remove + self.oauth_accounts.failed_to_remove
    }
}

pub struct CascadeDeleter {
    coordinator: Arc<DualWriteCoordinator>,
}

impl CascadeDeleter {
    pub fn new(coordinator: Arc<DualWriteCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Remove every provider key and OAuth account owned by `owner_id`.
    /// Never fails; problems are reported in the returned [`CascadeReport`].
    #[tracing::instrument(skip(self))]
    pub async fn cascade_delete_user_providers(
        &self,
        owner_id: &str,
        is_admin: bool,
    ) -> CascadeReport {
        let pool = self.coordinator.pool();
        let owned = key_ownership::get_by_owner(pool, owner_id)
            .and_then(|keys| Ok((keys, account_ownership::get_by_owner(pool, owner_id)?)));
        let (keys, accounts) = match owned {
            Ok(sets) => sets,
            Err(e) => {
                tracing::error!(owner_id, error = %e, "Cannot enumerate owned providers, cascade aborted");
                return CascadeReport {
                    fatal_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let key_tasks = keys.into_iter().map(|row| {
            let coordinator = self.coordinator.clone();
            let owner = owner_id.to_string();
            let label = format!("{} ({})", row.display_mask, row.resource_class);
            (label, async move {
                coordinator.remove(&owner, &row.fingerprint, is_admin).await
            })
        });
        let account_tasks = accounts.into_iter().map(|row| {
            let coordinator = self.coordinator.clone();
            let owner = owner_id.to_string();
            let label = format!("{} ({})", row.account_name, row.resource_class);
            (label, async move {
                coordinator
                    .remove_account(&owner, &row.account_name, is_admin)
                    .await
            })
        });

        let (credentials, oauth_accounts) =
            tokio::join!(run_family(key_tasks), run_family(account_tasks));

        let report = CascadeReport {
            credentials,
            oauth_accounts,
            fatal_error: None,
        };
        tracing::info!(
            owner_id,
            keys_removed = report.credentials.removed,
            accounts_removed = report.oauth_accounts.removed,
            failed = report.total_failed(),
            "Cascade deletion finished"
        );
        report
    }
}

/// Spawn one task per removal and tally the outcomes.
async fn run_family<I, Fut>(tasks: I) -> FamilyReport
where
    I: IntoIterator<Item = (String, Fut)>,
    Fut: Future<Output = Result<RemoveOutcome, AppError>> + Send + 'static,
{
    let (labels, handles): (Vec<String>, Vec<_>) = tasks
        .into_iter()
        .map(|(label, fut)| (label, tokio::spawn(fut)))
        .unzip();

    let mut report = FamilyReport::default();
    for (label, joined) in labels.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(Ok(outcome)) => {
                if outcome == RemoveOutcome::OrphanCleaned {
                    tracing::debug!(resource = %label, "Cascade cleaned orphan row");
                }
                report.removed += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!(resource = %label, error = %e, "Cascade removal failed");
                report.failed_to_remove += 1;
                report.errors.push(format!("{label}: {e}"));
            }
            Err(join_err) => {
                tracing::error!(resource = %label, error = %join_err, "Cascade removal task died");
                report.failed_to_remove += 1;
                report.errors.push(format!("{label}: unexpected failure: {join_err}"));
            }
        }
    }
    report
}
