use serde::Serialize;

use super::{authorize, DualWriteCoordinator, EntryOwnership, RemoveOutcome};
use crate::db::models::{AccountOwnership, CreateAccountOwnershipInput};
use crate::db::repos::resources::account_ownership;
use crate::engine::saga::Saga;
use crate::error::AppError;
use crate::management::types::{AuthFile, AUTH_FILES_ENDPOINT};
use crate::validation::{require_account_name, require_non_empty};

/// One remote auth file as seen by a particular caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountListing {
    pub position: usize,
    pub label: String,
    pub provider: String,
    pub ownership: EntryOwnership,
    pub owner_id: Option<String>,
    pub account_name: Option<String>,
    pub account_email: Option<String>,
}

fn find_file<'a>(files: &'a [AuthFile], account_name: &str) -> Option<&'a AuthFile> {
    files.iter().find(|f| f.name == account_name)
}

impl DualWriteCoordinator {
    async fn fetch_auth_files(&self) -> Result<Vec<AuthFile>, AppError> {
        self.remote_call(
            &format!("GET /{AUTH_FILES_ENDPOINT}"),
            self.remote.fetch_auth_files(),
        )
        .await
    }

    async fn delete_auth_file(&self, account_name: &str) -> Result<(), AppError> {
        self.remote_call(
            &format!("DELETE /{AUTH_FILES_ENDPOINT}"),
            self.remote.delete_auth_file(account_name),
        )
        .await
    }

    /// Register ownership of an auth file the Management API created during an
    /// OAuth handshake. The file must exist remotely and belong to `provider`.
    #[tracing::instrument(skip(self, email))]
    pub async fn contribute_account(
        &self,
        owner_id: &str,
        account_name: &str,
        provider: &str,
        email: Option<&str>,
    ) -> Result<AccountOwnership, AppError> {
        self.remote.ensure_configured()?;
        require_account_name(account_name)?;
        require_non_empty("provider", provider)?;

        let owned = account_ownership::count_by_owner(&self.pool, owner_id)?;
        if owned >= self.limits.max_accounts_per_owner {
            return Err(AppError::QuotaExceeded {
                limit: self.limits.max_accounts_per_owner,
                what: "OAuth accounts",
            });
        }

        let _guard = self.locks.acquire(AUTH_FILES_ENDPOINT).await;

        let mut row = account_ownership::insert(
            &self.pool,
            CreateAccountOwnershipInput {
                account_name: account_name.to_string(),
                owner_id: owner_id.to_string(),
                resource_class: provider.to_string(),
                account_email: email.map(str::to_string),
            },
        )?;

        let mut saga = Saga::new("contribute_account");
        {
            let pool = self.pool.clone();
            let id = row.id.clone();
            saga.on_rollback("ownership_row", move || {
                account_ownership::delete_by_id(&pool, &id).map(|_| ())
            });
        }

        let files = saga.step("fetch", self.fetch_auth_files()).await?;
        let file = saga
            .step("verify", async {
                match find_file(&files, account_name) {
                    None => Err(AppError::NotFound(format!(
                        "Auth file {account_name} on the Management API"
                    ))),
                    Some(file) if file.provider() != provider => Err(AppError::Validation(format!(
                        "Auth file {account_name} belongs to {}, not {provider}",
                        file.provider()
                    ))),
                    Some(file) => Ok(file),
                }
            })
            .await?;

        if row.account_email.is_none() {
            if let Some(remote_email) = file.email.as_deref().filter(|e| !e.is_empty()) {
                saga.step("email", async {
                    account_ownership::set_email(&self.pool, &row.id, remote_email)
                })
                .await?;
                row.account_email = Some(remote_email.to_string());
            }
        }

        saga.commit();
        self.invalidate(AUTH_FILES_ENDPOINT);
        tracing::info!(owner_id, account_name, provider, "OAuth account registered");
        Ok(row)
    }

    /// Delete the auth file `account_name` remotely, then drop its ownership row.
    #[tracing::instrument(skip(self))]
    pub async fn remove_account(
        &self,
        owner_id: &str,
        account_name: &str,
        is_admin: bool,
    ) -> Result<RemoveOutcome, AppError> {
        self.remote.ensure_configured()?;
        let row = account_ownership::get_by_account_name(&self.pool, account_name)?;
        authorize(owner_id, &row.owner_id, is_admin, "OAuth account")?;

        let _guard = self.locks.acquire(AUTH_FILES_ENDPOINT).await;

        if account_ownership::find_by_id(&self.pool, &row.id)?.is_none() {
            return Err(AppError::NotFound(format!("OAuth account {account_name}")));
        }

        let files = self.fetch_auth_files().await?;
        if find_file(&files, account_name).is_none() {
            account_ownership::delete_by_id(&self.pool, &row.id)?;
            self.invalidate(AUTH_FILES_ENDPOINT);
            tracing::warn!(account_name, "No remote auth file, cleaned orphan row");
            return Ok(RemoveOutcome::OrphanCleaned);
        }

        self.delete_auth_file(account_name).await?;
        account_ownership::delete_by_id(&self.pool, &row.id)?;
        self.invalidate(AUTH_FILES_ENDPOINT);
        tracing::info!(owner_id, account_name, "OAuth account removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Resolve `id_or_name` as a local row id, then as an account name. Admins
    /// may also remove a remote auth file that was never registered locally.
    #[tracing::instrument(skip(self))]
    pub async fn remove_account_by_id_or_name(
        &self,
        owner_id: &str,
        id_or_name: &str,
        is_admin: bool,
    ) -> Result<RemoveOutcome, AppError> {
        self.remote.ensure_configured()?;
        require_non_empty("account", id_or_name)?;

        if let Some(row) = account_ownership::find_by_id(&self.pool, id_or_name)? {
            return self.remove_account(owner_id, &row.account_name, is_admin).await;
        }
        if account_ownership::find_by_account_name(&self.pool, id_or_name)?.is_some() {
            return self.remove_account(owner_id, id_or_name, is_admin).await;
        }
        if !is_admin {
            return Err(AppError::NotFound(format!("OAuth account {id_or_name}")));
        }

        let _guard = self.locks.acquire(AUTH_FILES_ENDPOINT).await;
        let files = self.fetch_auth_files().await?;
        if find_file(&files, id_or_name).is_none() {
            return Err(AppError::NotFound(format!(
                "Auth file {id_or_name} on the Management API"
            )));
        }
        self.delete_auth_file(id_or_name).await?;
        self.invalidate(AUTH_FILES_ENDPOINT);
        tracing::info!(account_name = id_or_name, "Unregistered auth file removed by admin");
        Ok(RemoveOutcome::Removed)
    }

    /// Remote auth files (optionally one provider's) joined against local ownership.
    pub async fn list_accounts(
        &self,
        owner_id: &str,
        provider: Option<&str>,
    ) -> Result<Vec<AccountListing>, AppError> {
        self.remote.ensure_configured()?;
        let files: Vec<AuthFile> = self
            .fetch_auth_files()
            .await?
            .into_iter()
            .filter(|f| provider.map_or(true, |p| f.provider() == p))
            .collect();

        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        let owners = account_ownership::get_by_account_names(&self.pool, &names)?;

        let listing = files
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                let file_provider = file.provider().to_string();
                match owners.get(&file.name) {
                    Some(row) if row.owner_id == owner_id => AccountListing {
                        position: index + 1,
                        label: row
                            .account_email
                            .clone()
                            .or(file.email)
                            .unwrap_or_else(|| file.name.clone()),
                        provider: file_provider,
                        ownership: EntryOwnership::Yours,
                        owner_id: Some(row.owner_id.clone()),
                        account_name: Some(file.name),
                        account_email: row.account_email.clone(),
                    },
                    other => AccountListing {
                        position: index + 1,
                        label: format!("Account {}", index + 1),
                        provider: file_provider,
                        ownership: if other.is_some() {
                            EntryOwnership::Team
                        } else {
                            EntryOwnership::Unassigned
                        },
                        owner_id: None,
                        account_name: None,
                        account_email: None,
                    },
                }
            })
            .collect();
        Ok(listing)
    }
}
