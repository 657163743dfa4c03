use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

const DEFAULT_MANAGEMENT_URL: &str = "http://localhost:8317/v0/management";
const DEFAULT_DB_PATH: &str = "provider-sync.db";

/// Runtime configuration, resolved from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub management: ManagementConfig,
    pub db_path: PathBuf,
    pub limits: OwnershipLimits,
    pub cache_capacity: usize,
    pub cache_sweep_interval: Duration,
    /// `None` disables the periodic reconciliation pass.
    pub reconcile_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ManagementConfig {
    pub base_url: String,
    /// Bearer token. Absence is reported per call, before any request is sent.
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Per-owner quotas enforced by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct OwnershipLimits {
    pub max_keys_per_owner: u32,
    pub max_accounts_per_owner: u32,
}

impl Default for OwnershipLimits {
    fn default() -> Self {
        Self {
            max_keys_per_owner: 10,
            max_accounts_per_owner: 5,
        }
    }
}

impl SyncConfig {
    /// Load `.env` (if present) and read every setting from the environment.
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let base_url = get("MANAGEMENT_API_URL")
            .unwrap_or_else(|| DEFAULT_MANAGEMENT_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let timeout_ms: u64 = parse_or(&get, "MANAGEMENT_API_TIMEOUT_MS", 10_000)?;
        let sweep_secs: u64 = parse_or(&get, "CACHE_SWEEP_INTERVAL_SECS", 60)?;
        let reconcile_secs: u64 = parse_or(&get, "RECONCILE_INTERVAL_SECS", 900)?;

        if timeout_ms == 0 {
            return Err(AppError::Configuration(
                "MANAGEMENT_API_TIMEOUT_MS must be greater than zero".into(),
            ));
        }
        if sweep_secs == 0 {
            return Err(AppError::Configuration(
                "CACHE_SWEEP_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        let defaults = OwnershipLimits::default();
        Ok(Self {
            management: ManagementConfig {
                base_url,
                api_key: get("MANAGEMENT_API_KEY"),
                timeout: Duration::from_millis(timeout_ms),
            },
            db_path: get("PROVIDER_SYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            limits: OwnershipLimits {
                max_keys_per_owner: parse_or(
                    &get,
                    "MAX_PROVIDER_KEYS_PER_USER",
                    defaults.max_keys_per_owner,
                )?,
                max_accounts_per_owner: parse_or(
                    &get,
                    "MAX_OAUTH_ACCOUNTS_PER_USER",
                    defaults.max_accounts_per_owner,
                )?,
            },
            cache_capacity: parse_or(&get, "CACHE_CAPACITY", 1000)?,
            cache_sweep_interval: Duration::from_secs(sweep_secs),
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Configuration(format!("{key} is not a valid number: {raw}"))),
    }
}
