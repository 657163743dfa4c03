use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

pub const COMPATIBILITY_ENDPOINT: &str = "openai-compatibility";
pub const AUTH_FILES_ENDPOINT: &str = "auth-files";

// ============================================================================
// Resource classes
// ============================================================================

/// Remote lists that hold a flat array of API keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlatClass {
    Gemini,
    Claude,
    Codex,
}

impl FlatClass {
    pub const ALL: [FlatClass; 3] = [FlatClass::Gemini, FlatClass::Claude, FlatClass::Codex];

    pub fn endpoint(self) -> &'static str {
        match self {
            FlatClass::Gemini => "gemini-api-key",
            FlatClass::Claude => "claude-api-key",
            FlatClass::Codex => "codex-api-key",
        }
    }
}

/// What a provider key belongs to. Flat classes map 1:1 to a remote list; every
/// compatibility provider lives inside the single `openai-compatibility` list,
/// so they share its endpoint (and therefore its lock).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Flat(FlatClass),
    Compatibility { provider: String },
}

impl ResourceClass {
    /// Remote list endpoint; also the keyed-lock key and cache scope.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourceClass::Flat(flat) => flat.endpoint(),
            ResourceClass::Compatibility { .. } => COMPATIBILITY_ENDPOINT,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Flat(flat) => f.write_str(flat.endpoint()),
            ResourceClass::Compatibility { provider } => {
                write!(f, "{COMPATIBILITY_ENDPOINT}:{provider}")
            }
        }
    }
}

impl FromStr for ResourceClass {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(flat) = FlatClass::ALL.iter().find(|c| c.endpoint() == s) {
            return Ok(ResourceClass::Flat(*flat));
        }
        match s.split_once(':') {
            Some((COMPATIBILITY_ENDPOINT, provider)) if !provider.trim().is_empty() => {
                Ok(ResourceClass::Compatibility {
                    provider: provider.trim().to_string(),
                })
            }
            _ => Err(AppError::Validation(format!("Unknown resource class: {s}"))),
        }
    }
}

// ============================================================================
// Flat key lists: { "<class>": [ {"api-key": ...} | "raw" ] }
// ============================================================================

/// One entry of a flat key list. Older Management API versions serve bare
/// strings; current ones serve objects. Extra object fields (base URL, proxy,
/// headers) are carried verbatim so a GET→PUT round trip preserves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlatEntry {
    Keyed(KeyedEntry),
    Bare(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedEntry {
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FlatEntry {
    pub fn secret(&self) -> &str {
        match self {
            FlatEntry::Keyed(entry) => &entry.api_key,
            FlatEntry::Bare(secret) => secret,
        }
    }
}

// ============================================================================
// Compatibility providers: { "openai-compatibility": [ {...} ] }
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityProvider {
    pub name: String,
    #[serde(rename = "api-key-entries", default)]
    pub entries: Vec<CompatibilityKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Value>,
    #[serde(rename = "excluded-models", default, skip_serializing_if = "Option::is_none")]
    pub excluded_models: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityKey {
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(rename = "proxy-url", default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// RemoteKeyList
// ============================================================================

/// The authoritative key list for one endpoint, as fetched. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteKeyList {
    Flat {
        class: FlatClass,
        entries: Vec<FlatEntry>,
    },
    Compatibility(Vec<CompatibilityProvider>),
}

impl RemoteKeyList {
    /// Decode a GET response body for `class`, rejecting unrecognized shapes.
    pub fn from_response(class: &ResourceClass, body: Value) -> Result<Self, AppError> {
        let items = take_array(body, class.endpoint())?;
        match class {
            ResourceClass::Flat(flat) => {
                let entries: Vec<FlatEntry> = serde_json::from_value(items).map_err(|e| {
                    AppError::Validation(format!("Malformed {} list: {e}", flat.endpoint()))
                })?;
                Ok(RemoteKeyList::Flat {
                    class: *flat,
                    entries,
                })
            }
            ResourceClass::Compatibility { .. } => {
                let providers: Vec<CompatibilityProvider> = serde_json::from_value(items)
                    .map_err(|e| {
                        AppError::Validation(format!(
                            "Malformed {COMPATIBILITY_ENDPOINT} list: {e}"
                        ))
                    })?;
                Ok(RemoteKeyList::Compatibility(providers))
            }
        }
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            RemoteKeyList::Flat { class, .. } => class.endpoint(),
            RemoteKeyList::Compatibility(_) => COMPATIBILITY_ENDPOINT,
        }
    }

    /// Full replacement array for a PUT (same shape as GET).
    pub fn to_body(&self) -> Result<Value, AppError> {
        let body = match self {
            RemoteKeyList::Flat { entries, .. } => serde_json::to_value(entries)?,
            RemoteKeyList::Compatibility(providers) => serde_json::to_value(providers)?,
        };
        Ok(body)
    }

    /// Raw secrets visible for `class`, in remote order. For a compatibility
    /// class only the named provider's keys are returned.
    pub fn secrets(&self, class: &ResourceClass) -> Vec<&str> {
        match (self, class) {
            (RemoteKeyList::Flat { entries, .. }, ResourceClass::Flat(_)) => {
                entries.iter().map(FlatEntry::secret).collect()
            }
            (RemoteKeyList::Compatibility(providers), ResourceClass::Compatibility { provider }) => {
                providers
                    .iter()
                    .filter(|p| &p.name == provider)
                    .flat_map(|p| p.entries.iter().map(|e| e.api_key.as_str()))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn contains(&self, class: &ResourceClass, secret: &str) -> bool {
        self.secrets(class).iter().any(|s| *s == secret)
    }

    /// First secret for `class` satisfying `predicate`.
    pub fn find_secret<F>(&self, class: &ResourceClass, predicate: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        self.secrets(class).into_iter().find(|s| predicate(s))
    }

    /// Append `secret` for `class`. A compatibility provider must already exist
    /// remotely; keys are never attached to a provider the operator has not configured.
    pub fn append(&mut self, class: &ResourceClass, secret: &str) -> Result<(), AppError> {
        match (self, class) {
            (RemoteKeyList::Flat { entries, .. }, ResourceClass::Flat(_)) => {
                // Keep the list homogeneous with what the server already serves.
                let bare_list =
                    !entries.is_empty() && entries.iter().all(|e| matches!(e, FlatEntry::Bare(_)));
                entries.push(if bare_list {
                    FlatEntry::Bare(secret.to_string())
                } else {
                    FlatEntry::Keyed(KeyedEntry {
                        api_key: secret.to_string(),
                        extra: Map::new(),
                    })
                });
                Ok(())
            }
            (RemoteKeyList::Compatibility(providers), ResourceClass::Compatibility { provider }) => {
                let target = providers
                    .iter_mut()
                    .find(|p| &p.name == provider)
                    .ok_or_else(|| {
                        AppError::Validation(format!(
                            "Compatibility provider {provider} is not configured on the Management API"
                        ))
                    })?;
                target.entries.push(CompatibilityKey {
                    api_key: secret.to_string(),
                    proxy_url: None,
                    extra: Map::new(),
                });
                Ok(())
            }
            (list, class) => Err(AppError::Internal(format!(
                "Resource class {class} does not belong to the {} list",
                list.endpoint()
            ))),
        }
    }

    /// Remove every occurrence of `secret` for `class`. Returns whether anything changed.
    pub fn remove(&mut self, class: &ResourceClass, secret: &str) -> bool {
        match (self, class) {
            (RemoteKeyList::Flat { entries, .. }, ResourceClass::Flat(_)) => {
                let before = entries.len();
                entries.retain(|e| e.secret() != secret);
                entries.len() != before
            }
            (RemoteKeyList::Compatibility(providers), ResourceClass::Compatibility { provider }) => {
                let mut changed = false;
                for p in providers.iter_mut().filter(|p| &p.name == provider) {
                    let before = p.entries.len();
                    p.entries.retain(|e| e.api_key != secret);
                    changed |= p.entries.len() != before;
                }
                changed
            }
            _ => false,
        }
    }
}

// ============================================================================
// Auth files: { "files": [ {id, name, provider|type, email?} ] }
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AuthFile {
    /// Provider of the account; older servers report it as `type`.
    pub fn provider(&self) -> &str {
        self.provider
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or("unknown")
    }
}

pub fn parse_auth_files(body: Value) -> Result<Vec<AuthFile>, AppError> {
    let items = take_array(body, "files")?;
    serde_json::from_value(items)
        .map_err(|e| AppError::Validation(format!("Malformed {AUTH_FILES_ENDPOINT} list: {e}")))
}

/// Pull `key` out of a response object. `null` counts as an empty list; a
/// missing key or any other type is a shape error.
fn take_array(body: Value, key: &str) -> Result<Value, AppError> {
    let Value::Object(mut object) = body else {
        return Err(AppError::Validation(format!(
            "Expected a JSON object containing \"{key}\""
        )));
    };
    match object.remove(key) {
        Some(Value::Null) => Ok(Value::Array(Vec::new())),
        Some(items @ Value::Array(_)) => Ok(items),
        Some(_) => Err(AppError::Validation(format!("\"{key}\" is not an array"))),
        None => Err(AppError::Validation(format!("Response is missing \"{key}\""))),
    }
}
