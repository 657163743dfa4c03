use serde::{Deserialize, Serialize};

// ============================================================================
// Provider key ownership
// ============================================================================

/// Local record tying a fingerprinted remote API key to the user who contributed it.
/// The raw key is never stored; `fingerprint` is its SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOwnership {
    pub fingerprint: String,
    pub owner_id: String,
    pub resource_class: String,
    pub display_mask: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyOwnershipInput {
    pub fingerprint: String,
    pub owner_id: String,
    pub resource_class: String,
    pub display_mask: String,
}

// ============================================================================
// OAuth account ownership
// ============================================================================

/// Local record tying a remote auth file (named by the Management API after an
/// OAuth handshake) to the user who connected it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOwnership {
    pub id: String,
    pub account_name: String,
    pub owner_id: String,
    /// Provider of the auth file (e.g. `claude`, `codex`, `gemini-cli`).
    pub resource_class: String,
    pub account_email: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountOwnershipInput {
    pub account_name: String,
    pub owner_id: String,
    pub resource_class: String,
    pub account_email: Option<String>,
}
