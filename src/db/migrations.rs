use rusqlite::Connection;

use crate::error::AppError;

/// Run the ownership schema migration. Idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Provider key ownership
-- fingerprint is the uniqueness net for concurrent registrations: the same raw
-- key can be owned by at most one user, even across processes.
-- ============================================================================

CREATE TABLE IF NOT EXISTS provider_key_ownership (
    fingerprint     TEXT PRIMARY KEY NOT NULL,
    owner_id        TEXT NOT NULL,
    resource_class  TEXT NOT NULL,
    display_mask    TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pko_owner ON provider_key_ownership(owner_id);
CREATE INDEX IF NOT EXISTS idx_pko_class ON provider_key_ownership(resource_class);

-- ============================================================================
-- OAuth account ownership
-- ============================================================================

CREATE TABLE IF NOT EXISTS oauth_account_ownership (
    id              TEXT PRIMARY KEY,
    account_name    TEXT NOT NULL UNIQUE,
    owner_id        TEXT NOT NULL,
    resource_class  TEXT NOT NULL,
    account_email   TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_oao_owner ON oauth_account_ownership(owner_id);
"#;
