//! Authentication endpoints: thin proxies onto the OIDC provider plus
//! token introspection helpers.

use crate::auth::{Auth, TokenPayload};
use crate::error::ApiError;
use crate::App;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/auth/v2/login", get(login))
        .route("/auth/v2/callback", get(callback))
        .route("/auth/v2/token", post(token))
        .route("/auth/v2/device", post(device))
        .route("/auth/v2/status", get(token_status))
        .route("/auth/v2/userinfo", get(userinfo))
        .route("/auth/v2/checkuser", get(checkuser))
        .route("/auth/v2/logout", get(logout))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    redirect_uri: String,
}

/// Kick off the authorization-code flow at the provider.
async fn login(
    State(app): State<Arc<App>>,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect, ApiError> {
    let authorize = app.oidc.endpoint("authorization_endpoint").await?;
    let state = uuid::Uuid::new_v4().to_string();
    let url = format!(
        "{authorize}?response_type=code&client_id={}&redirect_uri={}&scope=openid+profile+email&state={state}",
        app.oidc.client_id,
        urlencode(&query.redirect_uri),
    );
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
}

/// Exchange the authorization code; answers with the token set.
async fn callback(
    State(app): State<Arc<App>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Token>, ApiError> {
    let _ = query.state;
    let mut form = vec![
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("code".to_string(), query.code),
    ];
    if let Some(redirect_uri) = query.redirect_uri {
        form.push(("redirect_uri".to_string(), redirect_uri));
    }
    exchange(&app, form).await.map(Json)
}

/// Token model handed back to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "refresh_expires_in")]
    pub refresh_expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default, rename = "refresh-token")]
    refresh_token: Option<String>,
    #[serde(default, rename = "device-code")]
    device_code: Option<String>,
}

/// Create a token set from an auth code, a refresh token, or a device code.
async fn token(
    State(app): State<Arc<App>>,
    Form(form): Form<TokenForm>,
) -> Result<Json<Token>, ApiError> {
    let grant: Vec<(String, String)> = if let Some(code) = form.code {
        let mut grant = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code),
        ];
        if let Some(redirect_uri) = form.redirect_uri {
            grant.push(("redirect_uri".to_string(), redirect_uri));
        }
        if let Some(verifier) = form.code_verifier {
            grant.push(("code_verifier".to_string(), verifier));
        }
        grant
    } else if let Some(refresh_token) = form.refresh_token {
        vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
        ]
    } else if let Some(device_code) = form.device_code {
        vec![
            (
                "grant_type".to_string(),
                "urn:ietf:params:oauth:grant-type:device_code".to_string(),
            ),
            ("device_code".to_string(), device_code),
        ]
    } else {
        return Err(ApiError::detail(
            StatusCode::UNPROCESSABLE_ENTITY,
            "set either code, refresh-token or device-code",
        ));
    };
    exchange(&app, grant).await.map(Json)
}

async fn exchange(app: &App, mut form: Vec<(String, String)>) -> Result<Token, ApiError> {
    let token_endpoint = app.oidc.endpoint("token_endpoint").await?;
    form.push(("client_id".to_string(), app.oidc.client_id.clone()));
    if let Some(secret) = &app.oidc.client_secret {
        form.push(("client_secret".to_string(), secret.clone()));
    }
    let response = reqwest::Client::new()
        .post(&token_endpoint)
        .form(&form)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map_err(|_| {
            ApiError::detail(StatusCode::SERVICE_UNAVAILABLE, "Identity provider unavailable")
        })?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(ApiError::detail(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::UNAUTHORIZED),
            format!("token request failed: {detail}"),
        ));
    }
    response.json().await.map_err(|_| {
        ApiError::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "Identity provider returned a malformed token response",
        )
    })
}

/// Start the device-code flow.
async fn device(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>, ApiError> {
    let endpoint = app.oidc.endpoint("device_authorization_endpoint").await?;
    let mut form = vec![("client_id".to_string(), app.oidc.client_id.clone())];
    if let Some(secret) = &app.oidc.client_secret {
        form.push(("client_secret".to_string(), secret.clone()));
    }
    let body: serde_json::Value = reqwest::Client::new()
        .post(&endpoint)
        .form(&form)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|_| {
            ApiError::detail(StatusCode::SERVICE_UNAVAILABLE, "Identity provider unavailable")
        })?
        .json()
        .await
        .map_err(|_| {
            ApiError::detail(StatusCode::SERVICE_UNAVAILABLE, "malformed device response")
        })?;
    Ok(Json(body))
}

/// Claims summary of the presented token.
async fn token_status(auth: Auth) -> Json<TokenPayload> {
    Json(auth.claims)
}

/// Resolved system-user information for the presented token.
async fn userinfo(
    State(app): State<Arc<App>>,
    auth: Auth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = app.oidc.username(&auth.token, &auth.claims).await;
    let name = auth.claims.extra.get("name").and_then(|v| v.as_str());
    let (first, last) = match name {
        Some(name) => {
            let mut parts = name.split_whitespace();
            let first = parts.next().unwrap_or_default().to_string();
            let last = parts.last().unwrap_or_default().to_string();
            (first, last)
        }
        None => (String::new(), String::new()),
    };
    Ok(Json(serde_json::json!({
        "username": username,
        "email": auth.claims.email,
        "first_name": first,
        "last_name": last,
    })))
}

/// Lightweight probe whether a token passes validation (and the admin gate).
async fn checkuser(
    State(app): State<Arc<App>>,
    auth: Auth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = app.oidc.username(&auth.token, &auth.claims).await;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "username": username,
        "is_admin": app.oidc.is_admin(&auth.claims),
    })))
}

#[derive(Debug, Deserialize)]
struct LogoutQuery {
    #[serde(default)]
    post_logout_redirect_uri: Option<String>,
}

async fn logout(
    State(app): State<Arc<App>>,
    Query(query): Query<LogoutQuery>,
) -> Result<Redirect, ApiError> {
    let end_session = app.oidc.endpoint("end_session_endpoint").await?;
    let url = match query.post_logout_redirect_uri {
        Some(uri) => format!(
            "{end_session}?client_id={}&post_logout_redirect_uri={}",
            app.oidc.client_id,
            urlencode(&uri)
        ),
        None => end_session,
    };
    Ok(Redirect::temporary(&url))
}

/// Proxy of the provider's discovery document.
pub async fn well_known(State(app): State<Arc<App>>) -> Result<Response, ApiError> {
    let overview = app.oidc.discovery().await?;
    Ok(Json(overview).into_response())
}

fn urlencode(value: &str) -> String {
    percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC).to_string()
}
