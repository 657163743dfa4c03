use async_trait::async_trait;
use serde_json::Value;

use crate::config::ManagementConfig;
use crate::error::AppError;
use crate::management::types::{
    parse_auth_files, AuthFile, FlatClass, RemoteKeyList, ResourceClass, AUTH_FILES_ENDPOINT,
};
use crate::management::ManagementApi;

/// Longest response body excerpt carried in a `Remote` error.
const ERROR_BODY_LIMIT: usize = 300;

// ============================================================================
// Helpers
// ============================================================================

/// Map a transport-level failure. Timeouts get their own variant so callers
/// treat them exactly like the coordinator's own deadline.
fn transport_err(what: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("{what}: {e}"))
    } else {
        AppError::Remote {
            status: e.status().map(|s| s.as_u16()),
            message: format!("{what}: {e}"),
        }
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

// ============================================================================
// ManagementClient
// ============================================================================

/// HTTP client for the Management API.
pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ManagementClient {
    /// Build a client. The underlying `reqwest::Client` enforces the configured
    /// timeout as a backstop to the coordinator's per-call deadline.
    pub fn new(config: &ManagementConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    // --------------------------------------------------------------------
    // Private HTTP helpers
    // --------------------------------------------------------------------

    fn api_key(&self) -> Result<&str, AppError> {
        self.api_key.as_deref().ok_or_else(|| {
            AppError::Configuration("MANAGEMENT_API_KEY is not configured".into())
        })
    }

    /// Build an authenticated request to the given endpoint path (query included).
    fn authed(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, AppError> {
        let key = self.api_key()?;
        Ok(self
            .http
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(key))
    }

    /// Send, and turn any non-2xx status into `AppError::Remote`.
    async fn send(
        &self,
        what: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AppError> {
        let resp = req.send().await.map_err(|e| transport_err(what, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(what, status = status.as_u16(), "Management API rejected request");
        Err(AppError::Remote {
            status: Some(status.as_u16()),
            message: format!("{what}: {}", excerpt(&body)),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, AppError> {
        let what = format!("GET /{path}");
        let resp = self
            .send(&what, self.authed(reqwest::Method::GET, path)?)
            .await?;
        resp.json::<Value>()
            .await
            .map_err(|e| AppError::Validation(format!("{what}: response is not JSON: {e}")))
    }
}

#[async_trait]
impl ManagementApi for ManagementClient {
    fn ensure_configured(&self) -> Result<(), AppError> {
        self.api_key().map(|_| ())
    }

    async fn fetch_keys(&self, class: &ResourceClass) -> Result<RemoteKeyList, AppError> {
        let body = self.get_json(class.endpoint()).await?;
        RemoteKeyList::from_response(class, body)
    }

    async fn replace_keys(&self, list: &RemoteKeyList) -> Result<(), AppError> {
        let path = list.endpoint();
        let req = self
            .authed(reqwest::Method::PUT, path)?
            .json(&list.to_body()?);
        self.send(&format!("PUT /{path}"), req).await?;
        Ok(())
    }

    async fn delete_key(&self, class: FlatClass, secret: &str) -> Result<(), AppError> {
        let path = format!("{}?api-key={}", class.endpoint(), urlencoding::encode(secret));
        let req = self.authed(reqwest::Method::DELETE, &path)?;
        // The query carries the raw key; keep it out of the error text.
        self.send(&format!("DELETE /{}", class.endpoint()), req).await?;
        Ok(())
    }

    async fn fetch_auth_files(&self) -> Result<Vec<AuthFile>, AppError> {
        parse_auth_files(self.get_json(AUTH_FILES_ENDPOINT).await?)
    }

    async fn delete_auth_file(&self, name: &str) -> Result<(), AppError> {
        let path = format!("{AUTH_FILES_ENDPOINT}?name={}", urlencoding::encode(name));
        let req = self.authed(reqwest::Method::DELETE, &path)?;
        self.send(&format!("DELETE /{path}"), req).await?;
        Ok(())
    }
}
