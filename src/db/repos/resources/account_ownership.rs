use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{AccountOwnership, CreateAccountOwnershipInput};
use crate::db::repos::{is_unique_violation, placeholders};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_account(row: &Row) -> rusqlite::Result<AccountOwnership> {
    Ok(AccountOwnership {
        id: row.get("id")?,
        account_name: row.get("account_name")?,
        owner_id: row.get("owner_id")?,
        resource_class: row.get("resource_class")?,
        account_email: row.get("account_email")?,
        created_at: row.get("created_at")?,
    })
}

/// Register a remote account name. `account_name` is unique; a second
/// registration surfaces as `AlreadyContributed`.
pub fn insert(
    pool: &DbPool,
    input: CreateAccountOwnershipInput,
) -> Result<AccountOwnership, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let result = conn.execute(
        "INSERT INTO oauth_account_ownership
         (id, account_name, owner_id, resource_class, account_email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            input.account_name,
            input.owner_id,
            input.resource_class,
            input.account_email,
            now,
        ],
    );

    match result {
        Ok(_) => Ok(AccountOwnership {
            id,
            account_name: input.account_name,
            owner_id: input.owner_id,
            resource_class: input.resource_class,
            account_email: input.account_email,
            created_at: now,
        }),
        Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyContributed(format!(
            "OAuth account {} is already registered",
            input.account_name
        ))),
        Err(e) => Err(AppError::Database(e)),
    }
}

pub fn delete_by_id(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM oauth_account_ownership WHERE id = ?1",
        params![id],
    )?;
    Ok(rows > 0)
}

pub fn set_email(pool: &DbPool, id: &str, email: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE oauth_account_ownership SET account_email = ?1 WHERE id = ?2",
        params![email, id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("OAuth account ownership {id}")));
    }
    Ok(())
}

pub fn find_by_id(pool: &DbPool, id: &str) -> Result<Option<AccountOwnership>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM oauth_account_ownership WHERE id = ?1",
        params![id],
        row_to_account,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn find_by_account_name(
    pool: &DbPool,
    account_name: &str,
) -> Result<Option<AccountOwnership>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM oauth_account_ownership WHERE account_name = ?1",
        params![account_name],
        row_to_account,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn get_by_account_name(
    pool: &DbPool,
    account_name: &str,
) -> Result<AccountOwnership, AppError> {
    find_by_account_name(pool, account_name)?
        .ok_or_else(|| AppError::NotFound(format!("OAuth account {account_name}")))
}

pub fn count_by_owner(pool: &DbPool, owner_id: &str) -> Result<u32, AppError> {
    let conn = pool.get()?;
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM oauth_account_ownership WHERE owner_id = ?1",
        params![owner_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn get_by_owner(pool: &DbPool, owner_id: &str) -> Result<Vec<AccountOwnership>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM oauth_account_ownership WHERE owner_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![owner_id], row_to_account)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn get_all(pool: &DbPool) -> Result<Vec<AccountOwnership>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM oauth_account_ownership ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], row_to_account)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Batch lookup keyed by account name.
pub fn get_by_account_names(
    pool: &DbPool,
    names: &[String],
) -> Result<HashMap<String, AccountOwnership>, AppError> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }
    let conn = pool.get()?;
    let sql = format!(
        "SELECT * FROM oauth_account_ownership WHERE account_name IN ({})",
        placeholders(names.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(names.iter()), row_to_account)?;

    let mut map = HashMap::with_capacity(names.len());
    for row in rows {
        let row = row?;
        map.insert(row.account_name.clone(), row);
    }
    Ok(map)
}
