//! Pre-signed share URLs: HMAC-SHA256 over a URL-safe token payload, with a
//! doc-store record required at verification time so shares stay revocable.

use crate::error::ApiError;
use crate::App;
use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use portal_cache::CacheToken;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const MIN_TTL_SECONDS: u64 = 60;

type HmacSha256 = Hmac<Sha256>;

/// The decoded share-token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePayload {
    pub path: String,
    pub exp: u64,
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn encode_share_token(payload: &SharePayload) -> String {
    let bytes = serde_json::to_vec(payload).expect("share payload serializes");
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

pub fn decode_share_token(token: &str) -> Result<SharePayload, ApiError> {
    let trimmed = token.trim_end_matches('=');
    let bytes = base64::decode_config(trimmed, base64::URL_SAFE_NO_PAD)
        .map_err(|_| ApiError::detail(StatusCode::BAD_REQUEST, "Invalid share token payload."))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::detail(StatusCode::BAD_REQUEST, "Invalid share token payload."))
}

/// Sign the token payload bytes.
pub fn sign_token(secret: &str, token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
    mac.update(token.as_bytes());
    base64::encode_config(mac.finalize().into_bytes(), base64::URL_SAFE_NO_PAD)
}

/// Constant-time comparison of the presented signature.
pub fn verify_signature(secret: &str, token: &str, sig: &str) -> Result<(), ApiError> {
    let presented = base64::decode_config(sig.trim_end_matches('='), base64::URL_SAFE_NO_PAD)
        .map_err(|_| {
            ApiError::detail(StatusCode::FORBIDDEN, "Invalid share token signature.")
        })?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
    mac.update(token.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| ApiError::detail(StatusCode::FORBIDDEN, "Invalid share token signature."))
}

/// Extract the source path from a shareable API path: either the embedded
/// zarr token is decoded, or the path is taken verbatim.
pub fn path_from_url(path: &str) -> Result<String, ApiError> {
    let re = regex::Regex::new(r"/(?:zarr|zarr-utils)/([A-Za-z0-9_=-]+)\.zarr")
        .expect("pattern compiles");
    if let Some(captures) = re.captures(path) {
        let token = CacheToken::from_string(captures[1].to_string());
        let payload = token.decode().map_err(|_| {
            ApiError::detail(StatusCode::BAD_REQUEST, "The path does not contain a UUID.")
        })?;
        return Ok(payload.path);
    }
    Ok(path.to_string())
}

/// Only paths below the zarr endpoint base may be pre-signed.
pub fn normalise_path(app: &App, path: &str) -> Result<String, ApiError> {
    let allowed = format!("{}/", app.config.zarr_base());
    if !path.contains(&allowed) || path.contains("..") {
        return Err(ApiError::detail(
            StatusCode::BAD_REQUEST,
            "Only valid Zarr paths can be pre-signed.",
        ));
    }
    Ok(path.to_string())
}

/// Fully verify a presented `(sig, token)` pair: payload shape, signature,
/// expiry, and the doc-store record (the revocation path). Returns the
/// decoded source path.
pub async fn verify_share(app: &App, sig: &str, token: &str) -> Result<String, ApiError> {
    let payload = decode_share_token(token)?;
    verify_signature(&app.config.signing_secret(), token, sig)?;
    if now_unix() >= payload.exp {
        return Err(ApiError::detail(
            StatusCode::FORBIDDEN,
            "Share link has expired.",
        ));
    }
    let id = CacheToken::for_path(&payload.path);
    match app.docstore.get_share(id.as_str()).await? {
        Some(_) => Ok(payload.path),
        None => Err(ApiError::detail(
            StatusCode::FORBIDDEN,
            "Share link has been revoked.",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let payload = SharePayload {
            path: "/arch/tas.nc".to_string(),
            exp: now_unix() + 600,
        };
        let token = encode_share_token(&payload);
        let sig = sign_token("secret", &token);
        assert!(verify_signature("secret", &token, &sig).is_ok());
        assert!(verify_signature("other", &token, &sig).is_err());
        assert!(verify_signature("secret", "tampered", &sig).is_err());

        let decoded = decode_share_token(&token).unwrap();
        assert_eq!(decoded.path, "/arch/tas.nc");
    }

    #[test]
    fn malformed_tokens_are_bad_requests() {
        let err = decode_share_token("{").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn path_extraction_decodes_embedded_tokens() {
        let token = CacheToken::for_path("/arch/tas.nc");
        let url = format!("/api/floe/data-portal/zarr/{token}.zarr");
        assert_eq!(path_from_url(&url).unwrap(), "/arch/tas.nc");
        assert_eq!(path_from_url("/plain/path").unwrap(), "/plain/path");
    }
}
