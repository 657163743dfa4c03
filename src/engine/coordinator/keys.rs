use serde::Serialize;
use zeroize::Zeroizing;

use super::{authorize, DualWriteCoordinator, EntryOwnership, RemoveOutcome};
use crate::db::models::CreateKeyOwnershipInput;
use crate::db::repos::resources::key_ownership;
use crate::engine::fingerprint::{fingerprint, mask, matches};
use crate::engine::saga::Saga;
use crate::error::AppError;
use crate::logging::short_fp;
use crate::management::types::ResourceClass;
use crate::validation::normalize_secret;

/// A key accepted into both stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub fingerprint: String,
    pub mask: String,
    pub resource_class: String,
    /// The key was already configured remotely without an owner; it was
    /// registered locally without writing the remote list.
    pub claimed_existing: bool,
}

/// One remote key as seen by a particular caller. Only the caller's own
/// entries carry a mask, owner and fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyListing {
    pub position: usize,
    pub label: String,
    pub ownership: EntryOwnership,
    pub owner_id: Option<String>,
    pub fingerprint: Option<String>,
}

impl DualWriteCoordinator {
    /// Register `secret` for `owner_id` and append it to the remote list for `class`.
    #[tracing::instrument(skip(self, class, secret), fields(class = %class))]
    pub async fn contribute(
        &self,
        owner_id: &str,
        class: &ResourceClass,
        secret: &str,
    ) -> Result<Contribution, AppError> {
        self.remote.ensure_configured()?;
        let secret = normalize_secret(secret)?;
        let fp = fingerprint(&secret);
        let display_mask = mask(&secret);

        let owned = key_ownership::count_by_owner(&self.pool, owner_id)?;
        if owned >= self.limits.max_keys_per_owner {
            return Err(AppError::QuotaExceeded {
                limit: self.limits.max_keys_per_owner,
                what: "provider keys",
            });
        }

        let endpoint = class.endpoint();
        // Declared before the saga so a cancelled call compensates while still locked.
        let _guard = self.locks.acquire(endpoint).await;

        key_ownership::insert(
            &self.pool,
            CreateKeyOwnershipInput {
                fingerprint: fp.clone(),
                owner_id: owner_id.to_string(),
                resource_class: class.to_string(),
                display_mask: display_mask.clone(),
            },
        )?;

        let mut saga = Saga::new("contribute_key");
        {
            let pool = self.pool.clone();
            let fp = fp.clone();
            saga.on_rollback("ownership_row", move || {
                key_ownership::delete_by_fingerprint(&pool, &fp).map(|_| ())
            });
        }

        let mut list = saga
            .step(
                "fetch",
                self.remote_call(&format!("GET /{endpoint}"), self.remote.fetch_keys(class)),
            )
            .await?;

        let claimed_existing = list.contains(class, &secret);
        if claimed_existing {
            tracing::info!(fingerprint = short_fp(&fp), "Key already configured remotely, claiming");
        } else {
            saga.step("append", async { list.append(class, &secret) })
                .await?;
            saga.step(
                "write",
                self.remote_call(&format!("PUT /{endpoint}"), self.remote.replace_keys(&list)),
            )
            .await?;
        }

        saga.commit();
        self.invalidate(endpoint);
        tracing::info!(owner_id, fingerprint = short_fp(&fp), "Provider key contributed");

        Ok(Contribution {
            fingerprint: fp,
            mask: display_mask,
            resource_class: class.to_string(),
            claimed_existing,
        })
    }

    /// Remove the key identified by `fp` from the remote list, then drop its row.
    #[tracing::instrument(skip(self, fp), fields(fingerprint = short_fp(fp)))]
    pub async fn remove(
        &self,
        owner_id: &str,
        fp: &str,
        is_admin: bool,
    ) -> Result<RemoveOutcome, AppError> {
        self.remote.ensure_configured()?;
        let row = key_ownership::get_by_fingerprint(&self.pool, fp)?;
        authorize(owner_id, &row.owner_id, is_admin, "API key")?;
        let class: ResourceClass = row.resource_class.parse()?;
        let endpoint = class.endpoint();

        let _guard = self.locks.acquire(endpoint).await;

        // A concurrent removal may have won the lock first.
        if key_ownership::find_by_fingerprint(&self.pool, fp)?.is_none() {
            return Err(AppError::NotFound(format!("API key ownership {fp}")));
        }

        let mut list = self
            .remote_call(&format!("GET /{endpoint}"), self.remote.fetch_keys(&class))
            .await?;

        // The remote stores raw secrets; correlate by recomputing fingerprints.
        let Some(secret) = list
            .find_secret(&class, |candidate| matches(candidate, fp))
            .map(|s| Zeroizing::new(s.to_string()))
        else {
            key_ownership::delete_by_fingerprint(&self.pool, fp)?;
            self.invalidate(endpoint);
            tracing::warn!(mask = %row.display_mask, "No remote entry for key, cleaned orphan row");
            return Ok(RemoveOutcome::OrphanCleaned);
        };

        match &class {
            ResourceClass::Flat(flat) => {
                self.remote_call(
                    &format!("DELETE /{endpoint}"),
                    self.remote.delete_key(*flat, &secret),
                )
                .await?;
            }
            ResourceClass::Compatibility { .. } => {
                list.remove(&class, &secret);
                self.remote_call(&format!("PUT /{endpoint}"), self.remote.replace_keys(&list))
                    .await?;
            }
        }

        key_ownership::delete_by_fingerprint(&self.pool, fp)?;
        self.invalidate(endpoint);
        tracing::info!(owner_id, mask = %row.display_mask, "Provider key removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Remote keys for `class` in remote order, joined against local ownership.
    pub async fn list(
        &self,
        owner_id: &str,
        class: &ResourceClass,
    ) -> Result<Vec<KeyListing>, AppError> {
        self.remote.ensure_configured()?;
        let endpoint = class.endpoint();
        let list = self
            .remote_call(&format!("GET /{endpoint}"), self.remote.fetch_keys(class))
            .await?;

        let secrets = list.secrets(class);
        let fingerprints: Vec<String> = secrets.iter().map(|s| fingerprint(s)).collect();
        let owners = key_ownership::get_by_fingerprints(&self.pool, &fingerprints)?;

        let listing = secrets
            .iter()
            .zip(fingerprints)
            .enumerate()
            .map(|(index, (secret, fp))| match owners.get(&fp) {
                Some(row) if row.owner_id == owner_id => KeyListing {
                    position: index + 1,
                    label: mask(secret),
                    ownership: EntryOwnership::Yours,
                    owner_id: Some(row.owner_id.clone()),
                    fingerprint: Some(fp),
                },
                other => KeyListing {
                    position: index + 1,
                    label: format!("Entry {}", index + 1),
                    ownership: if other.is_some() {
                        EntryOwnership::Team
                    } else {
                        EntryOwnership::Unassigned
                    },
                    owner_id: None,
                    fingerprint: None,
                },
            })
            .collect();
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::super::test_support::*;
    use super::*;
    use crate::management::fake::Fault;
    use crate::management::types::FlatClass;

    fn claude() -> ResourceClass {
        ResourceClass::Flat(FlatClass::Claude)
    }

    fn openrouter() -> ResourceClass {
        ResourceClass::Compatibility {
            provider: "openrouter".into(),
        }
    }

    const SECRET: &str = "sk-ant-api03-test123";

    #[tokio::test]
    async fn test_contribute_writes_both_stores() {
        let (coordinator, fake) = setup();

        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        assert_eq!(c.mask, "sk-ant-a...t123");
        assert_eq!(c.fingerprint, fingerprint(SECRET));
        assert!(!c.claimed_existing);

        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec![SECRET]);
        let row = key_ownership::get_by_fingerprint(coordinator.pool(), &c.fingerprint).unwrap();
        assert_eq!(row.owner_id, "alice");
        assert_eq!(row.resource_class, "claude-api-key");
        assert_eq!(fake.gets.load(Ordering::SeqCst), 1);
        assert_eq!(fake.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_contribute_trims_and_rejects_empty() {
        let (coordinator, fake) = setup();
        let err = coordinator.contribute("alice", &claude(), "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(fake.remote_calls(), 0);

        coordinator.contribute("alice", &claude(), "  sk-padded-secret-1  ").await.unwrap();
        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec!["sk-padded-secret-1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_contributes_once() {
        let (coordinator, fake) = setup();
        fake.set_latency(Duration::from_millis(20));

        let a = tokio::spawn({
            let c = coordinator.clone();
            async move { c.contribute("alice", &claude(), SECRET).await }
        });
        let b = tokio::spawn({
            let c = coordinator.clone();
            async move { c.contribute("bob", &claude(), SECRET).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::AlreadyContributed(_))))
            .count();
        assert_eq!((ok, dup), (1, 1));

        // The loser never reached the remote.
        assert_eq!(fake.gets.load(Ordering::SeqCst), 1);
        assert_eq!(fake.puts.load(Ordering::SeqCst), 1);
        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec![SECRET]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_contributes_lose_nothing() {
        const N: usize = 8;
        let (coordinator, fake) = setup_with(limits(100, 5));
        fake.set_latency(Duration::from_millis(5));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let c = coordinator.clone();
                tokio::spawn(async move {
                    c.contribute(&format!("user-{i}"), &claude(), &format!("sk-distinct-key-{i:03}"))
                        .await
                })
            })
            .collect();
        for handle in futures_util::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(key_ownership::get_all(coordinator.pool()).unwrap().len(), N);
        assert_eq!(fake.flat_secrets(FlatClass::Claude).len(), N);
        assert!(!fake.saw_overlap(), "GET→PUT windows interleaved");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listing_between_contributes_is_not_an_overlap() {
        let (coordinator, fake) = setup_with(limits(100, 5));
        coordinator.list("alice", &claude()).await.unwrap();
        coordinator.contribute("alice", &claude(), "sk-sequential-key-1").await.unwrap();
        assert!(!fake.saw_overlap());

        fake.set_latency(Duration::from_millis(5));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let c = coordinator.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        c.list("alice", &claude()).await.map(|_| ())
                    } else {
                        c.contribute("alice", &claude(), &format!("sk-mixed-key-{i:03}"))
                            .await
                            .map(|_| ())
                    }
                })
            })
            .collect();
        for handle in futures_util::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(fake.flat_secrets(FlatClass::Claude).len(), 4);
        assert!(!fake.saw_overlap(), "GET→PUT windows interleaved");
    }

    #[tokio::test]
    async fn test_list_does_not_wait_for_lock() {
        let (coordinator, fake) = setup();
        fake.seed_flat(FlatClass::Claude, &["sk-operator-key-01"]);

        let _held = coordinator.locks.acquire(claude().endpoint()).await;
        let listing = tokio::time::timeout(Duration::from_millis(100), coordinator.list("alice", &claude()))
            .await
            .expect("list blocked on the endpoint lock")
            .unwrap();
        assert_eq!(listing.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_row() {
        for fault in [Fault::Status(503), Fault::Malformed] {
            let (coordinator, fake) = setup();
            fake.fail_get(fault);

            let err = coordinator.contribute("alice", &claude(), SECRET).await.unwrap_err();
            assert!(matches!(err, AppError::Remote { .. } | AppError::Validation(_)), "{err}");
            assert!(key_ownership::find_by_fingerprint(coordinator.pool(), &fingerprint(SECRET))
                .unwrap()
                .is_none());
            assert_eq!(fake.puts.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_row() {
        let (coordinator, fake) = setup();
        fake.fail_put(Fault::Status(500));

        let err = coordinator.contribute("alice", &claude(), SECRET).await.unwrap_err();
        assert!(matches!(err, AppError::Remote { status: Some(500), .. }));
        assert_eq!(key_ownership::count_by_owner(coordinator.pool(), "alice").unwrap(), 0);
        assert!(fake.flat_secrets(FlatClass::Claude).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_steps_leave_no_row() {
        let (coordinator, fake) = setup();
        fake.fail_get(Fault::Hang);
        let err = coordinator.contribute("alice", &claude(), SECRET).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(key_ownership::count_by_owner(coordinator.pool(), "alice").unwrap(), 0);

        fake.clear_faults();
        fake.fail_put(Fault::Hang);
        let err = coordinator.contribute("alice", &claude(), SECRET).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(key_ownership::count_by_owner(coordinator.pool(), "alice").unwrap(), 0);

        // The lock was released on both failure paths.
        fake.clear_faults();
        coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_contribute_rolls_back() {
        let (coordinator, fake) = setup();
        fake.fail_put(Fault::Hang);

        let task = tokio::spawn({
            let c = coordinator.clone();
            async move { c.contribute("alice", &claude(), SECRET).await }
        });
        while fake.puts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        assert_eq!(key_ownership::count_by_owner(coordinator.pool(), "alice").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_checked_before_remote() {
        let (coordinator, fake) = setup_with(limits(1, 5));
        coordinator.contribute("alice", &claude(), "sk-first-key-0001").await.unwrap();
        let calls = fake.remote_calls();

        let err = coordinator
            .contribute("alice", &claude(), "sk-second-key-002")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { limit: 1, .. }));
        assert_eq!(fake.remote_calls(), calls);
    }

    #[tokio::test]
    async fn test_unconfigured_remote_fails_first() {
        let (coordinator, fake) = setup();
        fake.unconfigure();

        let err = coordinator.contribute("alice", &claude(), SECRET).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
        assert_eq!(fake.remote_calls(), 0);
        assert!(key_ownership::get_all(coordinator.pool()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claims_existing_remote_key_without_write() {
        let (coordinator, fake) = setup();
        fake.seed_flat(FlatClass::Claude, &[SECRET]);

        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        assert!(c.claimed_existing);
        assert_eq!(fake.puts.load(Ordering::SeqCst), 0);
        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec![SECRET]);
    }

    #[tokio::test]
    async fn test_compatibility_contribute_and_remove() {
        let (coordinator, fake) = setup();
        fake.seed_compatibility("openrouter", &["or-operator-key-1"]);
        fake.seed_compatibility("groq", &["gq-operator-key-1"]);

        let c = coordinator.contribute("alice", &openrouter(), "or-alice-key-0001").await.unwrap();
        assert_eq!(
            fake.compatibility_secrets("openrouter"),
            vec!["or-operator-key-1", "or-alice-key-0001"]
        );

        let outcome = coordinator.remove("alice", &c.fingerprint, false).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
        assert_eq!(fake.compatibility_secrets("openrouter"), vec!["or-operator-key-1"]);
        assert_eq!(fake.compatibility_secrets("groq"), vec!["gq-operator-key-1"]);
        assert_eq!(fake.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_compatibility_provider_rolls_back() {
        let (coordinator, fake) = setup();
        let err = coordinator
            .contribute("alice", &openrouter(), "or-alice-key-0001")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(fake.puts.load(Ordering::SeqCst), 0);
        assert!(key_ownership::get_all(coordinator.pool()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_flat_key() {
        let (coordinator, fake) = setup();
        fake.seed_flat(FlatClass::Claude, &["sk-operator-key-01"]);
        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();

        let outcome = coordinator.remove("alice", &c.fingerprint, false).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec!["sk-operator-key-01"]);
        assert_eq!(fake.deletes.load(Ordering::SeqCst), 1);
        assert!(key_ownership::find_by_fingerprint(coordinator.pool(), &c.fingerprint)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_denies_other_owner_without_remote_calls() {
        let (coordinator, fake) = setup();
        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        let calls = fake.remote_calls();

        let err = coordinator.remove("bob", &c.fingerprint, false).await.unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(_)));
        assert_eq!(fake.remote_calls(), calls);

        // Admins may remove anyone's key.
        assert_eq!(
            coordinator.remove("root", &c.fingerprint, true).await.unwrap(),
            RemoveOutcome::Removed
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_fingerprint() {
        let (coordinator, fake) = setup();
        let err = coordinator.remove("alice", "deadbeef", false).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(fake.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_cleans_orphan() {
        let (coordinator, fake) = setup();
        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        // Someone edited the remote list directly.
        fake.seed_flat(FlatClass::Claude, &[]);

        let outcome = coordinator.remove("alice", &c.fingerprint, false).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::OrphanCleaned);
        assert_eq!(fake.deletes.load(Ordering::SeqCst), 0);
        assert!(key_ownership::get_all(coordinator.pool()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_remote_delete_keeps_row() {
        let (coordinator, fake) = setup();
        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        fake.fail_delete_of(SECRET, Fault::Status(502));

        let err = coordinator.remove("alice", &c.fingerprint, false).await.unwrap_err();
        assert!(err.is_remote());
        assert!(key_ownership::find_by_fingerprint(coordinator.pool(), &c.fingerprint)
            .unwrap()
            .is_some());
        assert_eq!(fake.flat_secrets(FlatClass::Claude), vec![SECRET]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_remote_delete_keeps_row() {
        let (coordinator, fake) = setup();
        let c = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        fake.fail_delete_of(SECRET, Fault::Hang);

        let err = coordinator.remove("alice", &c.fingerprint, false).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)), "{err}");
        assert!(key_ownership::find_by_fingerprint(coordinator.pool(), &c.fingerprint)
            .unwrap()
            .is_some());
        assert!(coordinator.locks.try_acquire(claude().endpoint()).is_some());

        fake.clear_faults();
        assert_eq!(
            coordinator.remove("alice", &c.fingerprint, false).await.unwrap(),
            RemoveOutcome::Removed
        );
    }

    #[tokio::test]
    async fn test_list_hides_other_owners() {
        let (coordinator, fake) = setup();
        fake.seed_flat(FlatClass::Claude, &["sk-operator-key-01"]);
        coordinator.contribute("bob", &claude(), "sk-bobs-secret-key-9").await.unwrap();
        let mine = coordinator.contribute("alice", &claude(), SECRET).await.unwrap();

        let listing = coordinator.list("alice", &claude()).await.unwrap();
        assert_eq!(listing.len(), 3);

        assert_eq!(listing[0].label, "Entry 1");
        assert_eq!(listing[0].ownership, EntryOwnership::Unassigned);
        assert_eq!(listing[1].label, "Entry 2");
        assert_eq!(listing[1].ownership, EntryOwnership::Team);
        assert_eq!(listing[1].owner_id, None);
        assert_eq!(listing[1].fingerprint, None);

        assert_eq!(listing[2].label, "sk-ant-a...t123");
        assert_eq!(listing[2].ownership, EntryOwnership::Yours);
        assert_eq!(listing[2].owner_id.as_deref(), Some("alice"));
        assert_eq!(listing[2].fingerprint.as_deref(), Some(mine.fingerprint.as_str()));

        let rendered = serde_json::to_string(&listing).unwrap();
        assert!(!rendered.contains("bob"));
        assert!(!rendered.contains("sk-bobs"));
    }

    #[tokio::test]
    async fn test_contribute_invalidates_cache() {
        let (coordinator, _) = setup();
        coordinator
            .cache()
            .insert("models:catalog".into(), serde_json::json!(["claude"]));

        coordinator.contribute("alice", &claude(), SECRET).await.unwrap();
        assert!(coordinator.cache().get("models:catalog").is_none());
    }
}
