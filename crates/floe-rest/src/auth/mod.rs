//! Token validation against the OIDC provider: JWKS-backed RS256
//! verification, claim-based gating, and username resolution.

pub mod endpoints;

use crate::error::ApiError;
use axum::http::StatusCode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
const JWKS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The verified payload of a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct OidcClient {
    http: reqwest::Client,
    discovery_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    token_claims: IndexMap<String, Vec<String>>,
    admin_claims: IndexMap<String, Vec<String>>,
    overview: tokio::sync::RwLock<Option<serde_json::Value>>,
}

impl OidcClient {
    pub fn new(
        discovery_url: &str,
        client_id: &str,
        client_secret: Option<String>,
        token_claims: IndexMap<String, Vec<String>>,
        admin_claims: IndexMap<String, Vec<String>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            discovery_url: discovery_url.to_string(),
            client_id: client_id.to_string(),
            client_secret,
            token_claims,
            admin_claims,
            overview: tokio::sync::RwLock::new(None),
        }
    }

    /// The provider's discovery document, fetched once and cached.
    pub async fn discovery(&self) -> Result<serde_json::Value, ApiError> {
        if let Some(cached) = self.overview.read().await.clone() {
            return Ok(cached);
        }
        let overview: serde_json::Value = self
            .http
            .get(&self.discovery_url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|error| {
                tracing::error!(%error, url = %self.discovery_url, "OIDC discovery failed");
                ApiError::detail(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Identity provider unavailable",
                )
            })?
            .json()
            .await
            .map_err(|_| {
                ApiError::detail(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Identity provider returned a malformed discovery document",
                )
            })?;
        *self.overview.write().await = Some(overview.clone());
        Ok(overview)
    }

    pub async fn endpoint(&self, key: &str) -> Result<String, ApiError> {
        let overview = self.discovery().await?;
        overview[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::detail(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("discovery document misses {key}"),
                )
            })
    }

    async fn jwks(&self) -> Result<Vec<serde_json::Value>, ApiError> {
        let jwks_uri = self.endpoint("jwks_uri").await?;
        let body: serde_json::Value = self
            .http
            .get(&jwks_uri)
            .timeout(JWKS_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|error| {
                tracing::error!(%error, jwks_uri, "JWKS fetch failed");
                ApiError::detail(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Identity provider unavailable",
                )
            })?
            .json()
            .await
            .map_err(|_| {
                ApiError::detail(StatusCode::SERVICE_UNAVAILABLE, "malformed JWKS document")
            })?;
        Ok(body["keys"].as_array().cloned().unwrap_or_default())
    }

    /// Verify an RS256 token against the provider's keys and enforce the
    /// configured claim gates.
    pub async fn validate(&self, token: &str) -> Result<TokenPayload, ApiError> {
        let unauthorized = || {
            ApiError::detail(StatusCode::UNAUTHORIZED, "Could not validate credentials")
        };

        let header = jsonwebtoken::decode_header(token).map_err(|_| unauthorized())?;
        let kid = header.kid.ok_or_else(unauthorized)?;

        let keys = self.jwks().await?;
        let jwk = keys
            .iter()
            .find(|key| key["kid"].as_str() == Some(kid.as_str()))
            .ok_or_else(unauthorized)?;
        let (n, e) = match (jwk["n"].as_str(), jwk["e"].as_str()) {
            (Some(n), Some(e)) => (n, e),
            _ => return Err(unauthorized()),
        };
        let decoding_key =
            jsonwebtoken::DecodingKey::from_rsa_components(n, e).map_err(|_| unauthorized())?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_audience(&["account"]);
        let decoded =
            jsonwebtoken::decode::<TokenPayload>(token, &decoding_key, &validation).map_err(
                |error| {
                    tracing::debug!(%error, "token rejected");
                    unauthorized()
                },
            )?;

        if !claims_match(&claims_value(&decoded.claims), &self.token_claims) {
            return Err(unauthorized());
        }
        Ok(decoded.claims)
    }

    /// The username a token acts as: the first populated of the username
    /// claims, the userinfo endpoint, finally `sub`.
    pub async fn username(&self, token: &str, claims: &TokenPayload) -> String {
        for candidate in [&claims.preferred_username, &claims.username, &claims.user_name] {
            if let Some(name) = candidate {
                if !name.is_empty() {
                    return name.clone();
                }
            }
        }
        if let Ok(userinfo_endpoint) = self.endpoint("userinfo_endpoint").await {
            let response = self
                .http
                .get(&userinfo_endpoint)
                .bearer_auth(token)
                .timeout(JWKS_TIMEOUT)
                .send()
                .await;
            if let Ok(Ok(response)) = response.map(|r| r.error_for_status()) {
                if let Ok(userinfo) = response.json::<serde_json::Value>().await {
                    for key in ["preferred_username", "username", "user_name", "uid"] {
                        if let Some(name) = userinfo[key].as_str() {
                            if !name.is_empty() {
                                return name.to_string();
                            }
                        }
                    }
                }
            }
        }
        claims.sub.clone()
    }

    /// An admin is any token whose claims match the admin-claim set.
    pub fn is_admin(&self, claims: &TokenPayload) -> bool {
        if self.admin_claims.is_empty() {
            return false;
        }
        claims_match(&claims_value(claims), &self.admin_claims)
    }
}

fn claims_value(claims: &TokenPayload) -> serde_json::Value {
    serde_json::to_value(claims).expect("claims serialize")
}

/// Walk a dotted claim path into the token, flatten the value to a string,
/// and require a whole-word match for at least one allowed pattern per
/// claim. An empty pattern set disables gating.
fn claims_match(token: &serde_json::Value, required: &IndexMap<String, Vec<String>>) -> bool {
    for (claim, patterns) in required {
        let mut value = token;
        for part in claim.split('.') {
            value = &value[part];
        }
        let rendered = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let matched = patterns.iter().any(|pattern| {
            regex::Regex::new(&format!(r"\b{}\b", regex::escape(pattern)))
                .map(|re| re.is_match(&rendered))
                .unwrap_or(false)
        });
        if !matched {
            return false;
        }
    }
    true
}

/// Extractor for required bearer authentication.
pub struct Auth {
    pub claims: TokenPayload,
    pub token: String,
}

impl Auth {
    pub async fn username(&self, app: &crate::App) -> String {
        app.oidc.username(&self.token, &self.claims).await
    }
}

fn bearer_of(parts: &axum::http::request::Parts) -> Option<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

#[axum::async_trait]
impl axum::extract::FromRequestParts<std::sync::Arc<crate::App>> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &std::sync::Arc<crate::App>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_of(parts).ok_or_else(ApiError::unauthenticated)?;
        let claims = state.oidc.validate(&token).await?;
        Ok(Auth { claims, token })
    }
}

/// Extractor for endpoints that behave differently for anonymous callers.
pub struct MaybeAuth(pub Option<Auth>);

#[axum::async_trait]
impl axum::extract::FromRequestParts<std::sync::Arc<crate::App>> for MaybeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &std::sync::Arc<crate::App>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_of(parts) else {
            return Ok(MaybeAuth(None));
        };
        match state.oidc.validate(&token).await {
            Ok(claims) => Ok(MaybeAuth(Some(Auth { claims, token }))),
            Err(_) => Ok(MaybeAuth(None)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token(value: serde_json::Value) -> serde_json::Value {
        value
    }

    #[test]
    fn empty_claim_set_disables_gating() {
        assert!(claims_match(&token(serde_json::json!({})), &IndexMap::new()));
    }

    #[test]
    fn whole_word_match_on_flattened_claims() {
        let claims = token(serde_json::json!({
            "resource_access": {"account": {"roles": ["user", "uploader"]}}
        }));
        let mut required = IndexMap::new();
        required.insert(
            "resource_access.account.roles".to_string(),
            vec!["uploader".to_string()],
        );
        assert!(claims_match(&claims, &required));

        // `upload` is not a whole-word match of `uploader`.
        required.insert(
            "resource_access.account.roles".to_string(),
            vec!["upload".to_string()],
        );
        assert!(!claims_match(&claims, &required));
    }

    #[test]
    fn missing_claims_never_match() {
        let mut required = IndexMap::new();
        required.insert("groups".to_string(), vec!["staff".to_string()]);
        assert!(!claims_match(&token(serde_json::json!({})), &required));
    }
}
