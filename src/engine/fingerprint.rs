use sha2::{Digest, Sha256};

/// Secrets at or below this many characters are shown unmasked.
const MASK_MIN_LEN: usize = 12;
const MASK_PREFIX: usize = 8;
const MASK_SUFFIX: usize = 4;

/// SHA-256 of the raw secret, hex encoded.
///
/// The Management API only ever sees raw secrets, so correlating a local row with
/// a remote entry means recomputing this digest for every remote candidate.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Display form of a secret: unchanged up to 12 characters, otherwise the first 8
/// and last 4 characters around an ellipsis. Counts characters, not bytes.
pub fn mask(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= MASK_MIN_LEN {
        return secret.to_string();
    }
    let head: String = secret.chars().take(MASK_PREFIX).collect();
    let tail: String = secret.chars().skip(len - MASK_SUFFIX).collect();
    format!("{head}...{tail}")
}

/// Compare a remote candidate against a stored fingerprint.
pub fn matches(secret: &str, expected_fingerprint: &str) -> bool {
    fingerprint(secret) == expected_fingerprint
}
