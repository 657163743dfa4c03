//! Management API: the external, authoritative store for provider keys and
//! OAuth auth files. Offers whole-list GET/PUT/DELETE only, with no
//! transactions or concurrency tokens.

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

use async_trait::async_trait;

use crate::error::AppError;
use types::{AuthFile, FlatClass, RemoteKeyList, ResourceClass};

pub use client::ManagementClient;

/// Remote operations the coordinator depends on. `ManagementClient` is the
/// HTTP implementation; tests substitute an in-memory store.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Fails with `Configuration` when the remote cannot be called at all
    /// (e.g. no bearer token). Checked before any local or remote step.
    fn ensure_configured(&self) -> Result<(), AppError> {
        Ok(())
    }

    /// `GET /{endpoint}` for the list holding `class`.
    async fn fetch_keys(&self, class: &ResourceClass) -> Result<RemoteKeyList, AppError>;

    /// `PUT /{endpoint}` with the full replacement list.
    async fn replace_keys(&self, list: &RemoteKeyList) -> Result<(), AppError>;

    /// `DELETE /{endpoint}?api-key=...` for a flat list.
    async fn delete_key(&self, class: FlatClass, secret: &str) -> Result<(), AppError>;

    /// `GET /auth-files`.
    async fn fetch_auth_files(&self) -> Result<Vec<AuthFile>, AppError>;

    /// `DELETE /auth-files?name=...`.
    async fn delete_auth_file(&self, name: &str) -> Result<(), AppError>;
}
