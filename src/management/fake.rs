//! In-memory Management API for tests.
//!
//! Records call counts, injects failures and delays, and flags overlapping
//! write windows. Every GET remembers, per calling task, which version of the
//! endpoint it served. A PUT/DELETE from that task whose endpoint has been
//! written by someone else since its GET means two fetch→mutate→write
//! sequences interleaved. Reads that never write leave nothing behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::Id as TaskId;

use crate::error::AppError;
use crate::management::types::{
    AuthFile, CompatibilityProvider, FlatClass, FlatEntry, KeyedEntry, RemoteKeyList,
    ResourceClass, AUTH_FILES_ENDPOINT,
};
use crate::management::ManagementApi;

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Respond with this non-2xx status.
    Status(u16),
    /// Respond with a body that fails shape validation.
    Malformed,
    /// Never respond within any reasonable deadline.
    Hang,
}

impl Fault {
    async fn raise<T>(self, what: &str) -> Result<T, AppError> {
        match self {
            Fault::Status(status) => Err(AppError::Remote {
                status: Some(status),
                message: format!("{what}: injected failure"),
            }),
            Fault::Malformed => Err(AppError::Validation(format!("{what}: injected bad shape"))),
            Fault::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AppError::Timeout(format!("{what}: hung")))
            }
        }
    }
}

#[derive(Default)]
struct Store {
    flat: HashMap<FlatClass, Vec<FlatEntry>>,
    compatibility: Vec<CompatibilityProvider>,
    auth_files: Vec<AuthFile>,
}

#[derive(Default)]
struct Faults {
    get: Option<Fault>,
    put: Option<Fault>,
    delete_secrets: HashMap<String, Fault>,
    auth_get: Option<Fault>,
    auth_delete: Option<Fault>,
}

/// Write versions per endpoint and the version each task last read.
#[derive(Default)]
struct Windows {
    versions: HashMap<&'static str, u64>,
    reads: HashMap<(&'static str, Option<TaskId>), u64>,
}

#[derive(Default)]
pub struct FakeManagementApi {
    store: Mutex<Store>,
    faults: Mutex<Faults>,
    windows: Mutex<Windows>,
    overlap: AtomicBool,
    latency: Mutex<Duration>,
    configured: AtomicBool,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeManagementApi {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.configured.store(true, Ordering::SeqCst);
        fake
    }

    // --------------------------------------------------------------------
    // Seeding and inspection
    // --------------------------------------------------------------------

    pub fn seed_flat(&self, class: FlatClass, secrets: &[&str]) {
        let entries = secrets
            .iter()
            .map(|s| {
                FlatEntry::Keyed(KeyedEntry {
                    api_key: s.to_string(),
                    extra: Default::default(),
                })
            })
            .collect();
        self.store.lock().unwrap().flat.insert(class, entries);
    }

    pub fn seed_compatibility(&self, name: &str, secrets: &[&str]) {
        let provider: CompatibilityProvider = serde_json::from_value(serde_json::json!({
            "name": name,
            "base-url": format!("https://{name}.example/v1"),
            "api-key-entries": secrets.iter().map(|s| serde_json::json!({ "api-key": s })).collect::<Vec<_>>(),
        }))
        .unwrap();
        self.store.lock().unwrap().compatibility.push(provider);
    }

    pub fn seed_auth_file(&self, name: &str, provider: &str, email: Option<&str>) {
        self.store.lock().unwrap().auth_files.push(AuthFile {
            id: format!("id-{name}"),
            name: name.to_string(),
            provider: Some(provider.to_string()),
            kind: None,
            email: email.map(str::to_string),
        });
    }

    pub fn flat_secrets(&self, class: FlatClass) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .flat
            .get(&class)
            .map(|entries| entries.iter().map(|e| e.secret().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn compatibility_secrets(&self, name: &str) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .compatibility
            .iter()
            .filter(|p| p.name == name)
            .flat_map(|p| p.entries.iter().map(|e| e.api_key.clone()))
            .collect()
    }

    pub fn auth_file_names(&self) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .auth_files
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn remote_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
            + self.puts.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    // --------------------------------------------------------------------
    // Fault injection
    // --------------------------------------------------------------------

    pub fn unconfigure(&self) {
        self.configured.store(false, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn fail_get(&self, fault: Fault) {
        self.faults.lock().unwrap().get = Some(fault);
    }

    pub fn fail_put(&self, fault: Fault) {
        self.faults.lock().unwrap().put = Some(fault);
    }

    pub fn fail_delete_of(&self, secret: &str, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .delete_secrets
            .insert(secret.to_string(), fault);
    }

    pub fn fail_auth_get(&self, fault: Fault) {
        self.faults.lock().unwrap().auth_get = Some(fault);
    }

    pub fn fail_auth_delete(&self, fault: Fault) {
        self.faults.lock().unwrap().auth_delete = Some(fault);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    async fn pause(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn open_window(&self, endpoint: &'static str) {
        let mut windows = self.windows.lock().unwrap();
        let version = windows.versions.get(endpoint).copied().unwrap_or(0);
        windows.reads.insert((endpoint, tokio::task::try_id()), version);
    }

    /// Called once a write has been applied to the store.
    fn close_window(&self, endpoint: &'static str) {
        let mut windows = self.windows.lock().unwrap();
        let current = windows.versions.get(endpoint).copied().unwrap_or(0);
        if let Some(seen) = windows.reads.remove(&(endpoint, tokio::task::try_id())) {
            if seen != current {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }
        windows.versions.insert(endpoint, current + 1);
    }

    /// Forget this task's read without recording a write.
    fn abandon_window(&self, endpoint: &'static str) {
        self.windows
            .lock()
            .unwrap()
            .reads
            .remove(&(endpoint, tokio::task::try_id()));
    }
}

#[async_trait]
impl ManagementApi for FakeManagementApi {
    fn ensure_configured(&self) -> Result<(), AppError> {
        if self.configured.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Configuration("MANAGEMENT_API_KEY is not configured".into()))
        }
    }

    async fn fetch_keys(&self, class: &ResourceClass) -> Result<RemoteKeyList, AppError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.open_window(class.endpoint());
        self.pause().await;

        let fault = self.faults.lock().unwrap().get;
        if let Some(fault) = fault {
            self.abandon_window(class.endpoint());
            return fault.raise("GET").await;
        }

        let store = self.store.lock().unwrap();
        Ok(match class {
            ResourceClass::Flat(flat) => RemoteKeyList::Flat {
                class: *flat,
                entries: store.flat.get(flat).cloned().unwrap_or_default(),
            },
            ResourceClass::Compatibility { .. } => {
                RemoteKeyList::Compatibility(store.compatibility.clone())
            }
        })
    }

    async fn replace_keys(&self, list: &RemoteKeyList) -> Result<(), AppError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let fault = self.faults.lock().unwrap().put;
        if let Some(fault) = fault {
            self.abandon_window(list.endpoint());
            return fault.raise("PUT").await;
        }
        self.close_window(list.endpoint());

        let mut store = self.store.lock().unwrap();
        match list {
            RemoteKeyList::Flat { class, entries } => {
                store.flat.insert(*class, entries.clone());
            }
            RemoteKeyList::Compatibility(providers) => {
                store.compatibility = providers.clone();
            }
        }
        Ok(())
    }

    async fn delete_key(&self, class: FlatClass, secret: &str) -> Result<(), AppError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let fault = self.faults.lock().unwrap().delete_secrets.get(secret).copied();
        if let Some(fault) = fault {
            self.abandon_window(class.endpoint());
            return fault.raise("DELETE").await;
        }
        self.close_window(class.endpoint());

        let mut store = self.store.lock().unwrap();
        if let Some(entries) = store.flat.get_mut(&class) {
            entries.retain(|e| e.secret() != secret);
        }
        Ok(())
    }

    async fn fetch_auth_files(&self) -> Result<Vec<AuthFile>, AppError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.open_window(AUTH_FILES_ENDPOINT);
        self.pause().await;

        let fault = self.faults.lock().unwrap().auth_get;
        if let Some(fault) = fault {
            self.abandon_window(AUTH_FILES_ENDPOINT);
            return fault.raise("GET /auth-files").await;
        }
        Ok(self.store.lock().unwrap().auth_files.clone())
    }

    async fn delete_auth_file(&self, name: &str) -> Result<(), AppError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let fault = self.faults.lock().unwrap().auth_delete;
        if let Some(fault) = fault {
            self.abandon_window(AUTH_FILES_ENDPOINT);
            return fault.raise("DELETE /auth-files").await;
        }
        self.close_window(AUTH_FILES_ENDPOINT);
        self.store
            .lock()
            .unwrap()
            .auth_files
            .retain(|f| f.name != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_overlap_only_on_stale_write() {
        let fake = Arc::new(FakeManagementApi::new());
        let class = ResourceClass::Flat(FlatClass::Claude);

        // A read that never writes leaves nothing open.
        fake.fetch_keys(&class).await.unwrap();
        let list = fake.fetch_keys(&class).await.unwrap();
        fake.replace_keys(&list).await.unwrap();
        assert!(!fake.saw_overlap());

        let stale = fake.fetch_keys(&class).await.unwrap();
        tokio::spawn({
            let fake = fake.clone();
            let class = class.clone();
            async move {
                let fresh = fake.fetch_keys(&class).await.unwrap();
                fake.replace_keys(&fresh).await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(!fake.saw_overlap());

        fake.replace_keys(&stale).await.unwrap();
        assert!(fake.saw_overlap());
    }
}
