use zeroize::Zeroizing;

use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Trim a submitted secret and reject values the Management API cannot store
/// verbatim. The returned buffer is wiped on drop.
pub fn normalize_secret(value: &str) -> Result<Zeroizing<String>, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("API key cannot be empty".into()));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::Validation(
            "API key contains control characters".into(),
        ));
    }
    Ok(Zeroizing::new(trimmed.to_string()))
}

/// Remote account names become query parameters and file names on the remote side.
pub fn require_account_name(value: &str) -> Result<(), AppError> {
    require_non_empty("account name", value)?;
    if value.contains('/') || value.contains('\\') || value.chars().any(char::is_control) {
        return Err(AppError::Validation(format!(
            "account name contains illegal characters: {value}"
        )));
    }
    Ok(())
}
