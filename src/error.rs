use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes cleanly so a route handler can forward structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Quota exceeded: at most {limit} {what} per user")]
    QuotaExceeded { limit: u32, what: &'static str },

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Non-2xx response (`status` set) or a transport failure (`status` unset).
    #[error(
        "Management API error{}: {message}",
        .status.map(|s| format!(" ({s})")).unwrap_or_default()
    )]
    Remote { status: Option<u16>, message: String },

    #[error("Already contributed: {0}")]
    AlreadyContributed(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable discriminant, shared by `Serialize` and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "configuration",
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::AccessDenied(_) => "access_denied",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::Timeout(_) => "timeout",
            AppError::Remote { .. } => "remote",
            AppError::AlreadyContributed(_) => "already_contributed",
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Internal(_) => "internal",
        }
    }

    /// True for failures of the remote leg (transport, status, or timeout).
    pub fn is_remote(&self) -> bool {
        matches!(self, AppError::Remote { .. } | AppError::Timeout(_))
    }
}

/// Serialized as `{ error: "...", kind: "..." }` for handler consumption.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
