use serde::{Deserialize, Serialize};

/// Request body for minting a pre-signed zarr URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRequest {
    /// Absolute path of the resource, relative to this API. Must point below
    /// the zarr endpoint base.
    pub path: String,
    /// Clamped to the configured minimum/maximum.
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_ttl() -> u64 {
    600
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareResponse {
    pub url: String,
    /// URL-safe encoded `{path, exp}` payload.
    pub token: String,
    /// URL-safe base64 HMAC-SHA256 over the token payload.
    pub sig: String,
    /// Unix seconds.
    pub expires_at: u64,
    pub method: String,
}

/// The doc-store record backing a share; deleting it revokes the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Derived from the shared path, so re-sharing replaces the record.
    pub id: String,
    pub token: String,
    pub signature: String,
    pub expires_at: u64,
}
