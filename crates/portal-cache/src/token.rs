use serde::{Deserialize, Serialize};

/// The reversible identity of a materialized zarr view: the URL-safe base64
/// encoding of the JSON payload naming the source path. Decoding a token
/// yields the path the worker is told to open, so the token is an injective
/// function of the (normalized) path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheToken(String);

/// The decoded token payload. Aggregated views join their member paths with
/// `;` and carry the non-default aggregation options, keeping distinct
/// conversions distinct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not URL-safe base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheToken {
    pub fn for_path(path: &str) -> Self {
        Self::encode(&TokenPayload {
            path: path.to_string(),
            opts: None,
        })
    }

    pub fn encode(payload: &TokenPayload) -> Self {
        let bytes = serde_json::to_vec(payload).expect("token payload always serializes");
        CacheToken(base64::encode_config(bytes, base64::URL_SAFE_NO_PAD))
    }

    /// Accepts both padded and unpadded encodings.
    pub fn decode(&self) -> Result<TokenPayload, TokenError> {
        let trimmed = self.0.trim_end_matches('=');
        let bytes = base64::decode_config(trimmed, base64::URL_SAFE_NO_PAD)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn from_string(token: String) -> Self {
        CacheToken(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Member paths of the view, one entry for plain file views.
    pub fn paths(&self) -> Result<Vec<String>, TokenError> {
        Ok(self
            .decode()?
            .path
            .split(';')
            .map(str::to_string)
            .collect())
    }
}

impl std::fmt::Display for CacheToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_is_deterministic_and_reversible() {
        let path = "/arch/cmip6/tas_mon_1850.nc";
        let a = CacheToken::for_path(path);
        let b = CacheToken::for_path(path);
        assert_eq!(a, b);
        assert_eq!(a.decode().unwrap().path, path);
    }

    #[test]
    fn distinct_paths_make_distinct_tokens() {
        let a = CacheToken::for_path("/a.nc");
        let b = CacheToken::for_path("/b.nc");
        assert_ne!(a, b);
    }

    #[test]
    fn padded_tokens_still_decode() {
        let token = CacheToken::for_path("/a.nc");
        let padded = CacheToken::from_string(format!("{}==", token.as_str()));
        // Padding alone must not change the decoded payload.
        assert_eq!(padded.decode().unwrap().path, "/a.nc");
    }

    #[test]
    fn aggregated_tokens_split_member_paths() {
        let token = CacheToken::encode(&TokenPayload {
            path: "/a.nc;/b.nc".to_string(),
            opts: Some(serde_json::json!({"aggregate": "concat"})),
        });
        assert_eq!(token.paths().unwrap(), vec!["/a.nc", "/b.nc"]);
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(CacheToken::from_string("{not-base64}".to_string())
            .decode()
            .is_err());
        let not_json = base64::encode_config(b"plain", base64::URL_SAFE_NO_PAD);
        assert!(CacheToken::from_string(not_json).decode().is_err());
    }
}
