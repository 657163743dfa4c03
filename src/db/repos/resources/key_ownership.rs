use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{CreateKeyOwnershipInput, KeyOwnership};
use crate::db::repos::{is_unique_violation, placeholders};
use crate::db::DbPool;
use crate::error::AppError;

// ============================================================================
// Row Mapper
// ============================================================================

fn row_to_ownership(row: &Row) -> rusqlite::Result<KeyOwnership> {
    Ok(KeyOwnership {
        fingerprint: row.get("fingerprint")?,
        owner_id: row.get("owner_id")?,
        resource_class: row.get("resource_class")?,
        display_mask: row.get("display_mask")?,
        created_at: row.get("created_at")?,
    })
}

// ============================================================================
// Writes
// ============================================================================

/// Insert an ownership row. A second registration of the same fingerprint is
/// rejected by the primary key and surfaces as `AlreadyContributed`.
pub fn insert(pool: &DbPool, input: CreateKeyOwnershipInput) -> Result<KeyOwnership, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let result = conn.execute(
        "INSERT INTO provider_key_ownership
         (fingerprint, owner_id, resource_class, display_mask, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            input.fingerprint,
            input.owner_id,
            input.resource_class,
            input.display_mask,
            now,
        ],
    );

    match result {
        Ok(_) => Ok(KeyOwnership {
            fingerprint: input.fingerprint,
            owner_id: input.owner_id,
            resource_class: input.resource_class,
            display_mask: input.display_mask,
            created_at: now,
        }),
        Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyContributed(format!(
            "API key {} is already registered",
            input.display_mask
        ))),
        Err(e) => Err(AppError::Database(e)),
    }
}

pub fn delete_by_fingerprint(pool: &DbPool, fingerprint: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM provider_key_ownership WHERE fingerprint = ?1",
        params![fingerprint],
    )?;
    Ok(rows > 0)
}

// ============================================================================
// Queries
// ============================================================================

pub fn find_by_fingerprint(
    pool: &DbPool,
    fingerprint: &str,
) -> Result<Option<KeyOwnership>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM provider_key_ownership WHERE fingerprint = ?1",
        params![fingerprint],
        row_to_ownership,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn get_by_fingerprint(pool: &DbPool, fingerprint: &str) -> Result<KeyOwnership, AppError> {
    find_by_fingerprint(pool, fingerprint)?
        .ok_or_else(|| AppError::NotFound(format!("API key ownership {fingerprint}")))
}

pub fn count_by_owner(pool: &DbPool, owner_id: &str) -> Result<u32, AppError> {
    let conn = pool.get()?;
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM provider_key_ownership WHERE owner_id = ?1",
        params![owner_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn get_by_owner(pool: &DbPool, owner_id: &str) -> Result<Vec<KeyOwnership>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM provider_key_ownership WHERE owner_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![owner_id], row_to_ownership)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn get_all(pool: &DbPool) -> Result<Vec<KeyOwnership>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM provider_key_ownership ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], row_to_ownership)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Batch lookup keyed by fingerprint. Unknown fingerprints are simply absent.
pub fn get_by_fingerprints(
    pool: &DbPool,
    fingerprints: &[String],
) -> Result<HashMap<String, KeyOwnership>, AppError> {
    if fingerprints.is_empty() {
        return Ok(HashMap::new());
    }
    let conn = pool.get()?;
    let sql = format!(
        "SELECT * FROM provider_key_ownership WHERE fingerprint IN ({})",
        placeholders(fingerprints.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(fingerprints.iter()), row_to_ownership)?;

    let mut map = HashMap::with_capacity(fingerprints.len());
    for row in rows {
        let row = row?;
        map.insert(row.fingerprint.clone(), row);
    }
    Ok(map)
}
