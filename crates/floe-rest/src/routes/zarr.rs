//! The zarr gateway: turn any dataset URI the search layer can produce into
//! a stable HTTP endpoint serving the zarr v2 directory layout, coordinated
//! with the worker purely through the shared cache.

use crate::auth::Auth;
use crate::error::ApiError;
use crate::share;
use crate::App;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use models::{LoadState, LoadStatus, ShareRecord, ShareRequest, ShareResponse};
use portal_cache::{CacheToken, ChunkMessage, PortalMessage, UriMessage};
use serde::Deserialize;
use std::sync::Arc;

/// How long a request waits for the worker before giving up.
const WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/data-portal/zarr/convert", post(convert))
        .route("/data-portal/zarr/*path", get(get_zarr))
        .route("/data-portal/share-zarr", post(share_zarr))
        .route("/data-portal/share/:sig/*path", get(get_shared))
        .route("/data-portal/zarr-utils/status", get(load_status))
}

/// Split `"<token>.zarr[/<key>]"` into the token and the store key.
fn parse_zarr_path(rest: &str) -> Result<(CacheToken, String), ApiError> {
    let (head, key) = match rest.split_once('/') {
        Some((head, key)) => (head, key.to_string()),
        None => (rest, String::new()),
    };
    let token = head.strip_suffix(".zarr").ok_or_else(|| {
        ApiError::detail(StatusCode::BAD_REQUEST, "expected a <token>.zarr path")
    })?;
    Ok((CacheToken::from_string(token.to_string()), key))
}

fn failed_response(status: &LoadStatus) -> ApiError {
    // Aggregation failures are server-side combine errors; everything else
    // is a file that could not be opened.
    let aggregation = ["Aggregation failed", "Merge failed", "Concat failed", "Cannot infer", "Cannot combine"]
        .iter()
        .any(|needle| status.reason.contains(needle));
    let code = if aggregation {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::NOT_FOUND
    };
    ApiError::detail(
        code,
        format!("Dataset could not be loaded: {}", status.reason),
    )
}

async fn publish_load(app: &App, token: &CacheToken) -> Result<(), ApiError> {
    let payload = token.decode().map_err(|_| {
        ApiError::detail(StatusCode::BAD_REQUEST, "The path does not contain a UUID.")
    })?;
    let cache = app.cache().await?;
    cache
        .publish(&PortalMessage::Uri(UriMessage {
            path: payload.path,
            uuid: token.as_str().to_string(),
            options: payload.opts,
        }))
        .await?;
    Ok(())
}

/// Drive the load state machine from the gateway side: initialize a
/// SUBMITTED placeholder when the entry is missing, republish FAILED jobs,
/// and poll until the worker reaches a terminal state.
async fn await_ready(app: &App, token: &CacheToken) -> Result<LoadStatus, ApiError> {
    let cache = app.cache().await?;
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let mut republished = false;
    let mut seen_in_progress = false;
    let mut last: Option<LoadStatus> = None;

    loop {
        match cache.get_status(token).await? {
            None => {
                let placeholder = LoadStatus::submitted(&format!(
                    "{}/{}.zarr",
                    app.config.zarr_base(),
                    token
                ));
                cache
                    .set_status(token, &placeholder, app.config.cache_exp)
                    .await?;
                publish_load(app, token).await?;
                republished = true;
                last = Some(placeholder);
            }
            Some(status) => {
                match status.status {
                    LoadState::Finished => return Ok(status),
                    LoadState::Failed if !republished => {
                        // Failed jobs retry on access.
                        publish_load(app, token).await?;
                        republished = true;
                    }
                    LoadState::Failed if seen_in_progress => {
                        return Err(failed_response(&status));
                    }
                    LoadState::InProgress => seen_in_progress = true,
                    _ => {}
                }
                last = Some(status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            // A still-failed entry is a load failure, not a timeout.
            if let Some(status) = last {
                if status.status == LoadState::Failed {
                    return Err(failed_response(&status));
                }
            }
            metrics::counter!("floe_zarr_wait_timeouts").increment(1);
            return Err(ApiError::detail(
                StatusCode::SERVICE_UNAVAILABLE,
                "Data loading timed out.",
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn json_response(value: &serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}

/// Serve one key of the materialized store.
async fn serve_key(app: &App, token: &CacheToken, key: &str) -> Result<Response, ApiError> {
    let status = await_ready(app, token).await?;

    if key.is_empty() {
        let mut summary = serde_json::to_value(&status).expect("status serializes");
        if let Some(map) = summary.as_object_mut() {
            map.remove("meta");
            map.remove("json_meta");
        }
        return Ok(json_response(&summary));
    }

    let meta = status
        .json_meta
        .as_ref()
        .or(status.meta.as_ref())
        .ok_or_else(|| failed_response(&status))?;

    // Root and per-variable metadata documents.
    if key == zarr_view::ZMETADATA_KEY {
        return Ok(json_response(meta));
    }
    if key == zarr_view::ZGROUP_JSON
        || key == zarr_view::ZATTRS_JSON
        || key.ends_with(zarr_view::ZGROUP_JSON)
        || key.ends_with(zarr_view::ZATTRS_JSON)
        || key.ends_with(zarr_view::ZARRAY_JSON)
    {
        let value = &meta["metadata"][key];
        if value.is_null() {
            return Err(ApiError::detail(
                StatusCode::BAD_REQUEST,
                format!("unknown store key {key:?}"),
            ));
        }
        return Ok(json_response(value));
    }

    // Everything else addresses chunk bytes: `<variable...>/<chunk_id>`.
    let (variable, chunk_id) = key.rsplit_once('/').ok_or_else(|| {
        ApiError::detail(StatusCode::BAD_REQUEST, format!("unknown store key {key:?}"))
    })?;
    serve_chunk(app, token, &status, meta, variable, chunk_id).await
}

async fn serve_chunk(
    app: &App,
    token: &CacheToken,
    status: &LoadStatus,
    meta: &serde_json::Value,
    variable: &str,
    chunk_id: &str,
) -> Result<Response, ApiError> {
    let bad_request = |detail: String| ApiError::detail(StatusCode::BAD_REQUEST, detail);

    let zarray = &meta["metadata"][format!("{variable}/{}", zarr_view::ZARRAY_JSON)];
    if zarray.is_null() {
        return Err(bad_request(format!("unknown variable {variable:?}")));
    }
    let shape: Vec<usize> = serde_json::from_value(zarray["shape"].clone())
        .map_err(|_| failed_response(status))?;
    let chunks: Vec<usize> = serde_json::from_value(zarray["chunks"].clone())
        .map_err(|_| failed_response(status))?;
    let indices = zarr_view::parse_chunk_id(chunk_id, shape.len())
        .map_err(|e| bad_request(e.to_string()))?;
    let grid = zarr_view::grid_shape(&shape, &chunks);
    for (axis, &index) in indices.iter().enumerate() {
        if index >= *grid.get(axis).unwrap_or(&1) {
            return Err(bad_request(format!("chunk {chunk_id:?} is out of range")));
        }
    }

    let cache = app.cache().await?;
    let chunk_key = portal_cache::chunk_key(token, variable, chunk_id);
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let mut requested = false;
    loop {
        if let Some(bytes) = cache.get_bytes(&chunk_key).await? {
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response());
        }
        if !requested {
            cache
                .publish(&PortalMessage::Chunk(ChunkMessage {
                    uuid: token.as_str().to_string(),
                    chunk: chunk_id.to_string(),
                    variable: variable.to_string(),
                }))
                .await?;
            requested = true;
        }
        if tokio::time::Instant::now() >= deadline {
            metrics::counter!("floe_chunk_wait_timeouts").increment(1);
            return Err(ApiError::detail(
                StatusCode::SERVICE_UNAVAILABLE,
                "Chunk encoding timed out.",
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn get_zarr(
    State(app): State<Arc<App>>,
    Path(rest): Path<String>,
    _auth: Auth,
) -> Result<Response, ApiError> {
    let (token, key) = parse_zarr_path(&rest)?;
    serve_key(&app, &token, &key).await
}

/// Anonymous access through a verified pre-signed URL.
async fn get_shared(
    State(app): State<Arc<App>>,
    Path((sig, rest)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (share_token, key) = parse_zarr_path(&rest)?;
    let path = share::verify_share(&app, &sig, share_token.as_str()).await?;
    let token = CacheToken::for_path(&path);
    serve_key(&app, &token, &key).await
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(path) => vec![path],
            OneOrMany::Many(paths) => paths,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZarrOptions {
    #[serde(default)]
    public: bool,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConvertRequest {
    path: OneOrMany,
    #[serde(default)]
    aggregate: Option<String>,
    #[serde(default)]
    join: Option<String>,
    #[serde(default)]
    compat: Option<String>,
    #[serde(default)]
    data_vars: Option<String>,
    #[serde(default)]
    coords: Option<String>,
    #[serde(default)]
    dim: Option<String>,
    #[serde(default)]
    group_by: Option<String>,
    #[serde(default)]
    zarr_options: Option<ZarrOptions>,
}

impl ConvertRequest {
    fn options(&self) -> Option<serde_json::Value> {
        let mut opts = serde_json::Map::new();
        for (key, value) in [
            ("mode", &self.aggregate),
            ("join", &self.join),
            ("compat", &self.compat),
            ("data_vars", &self.data_vars),
            ("coords", &self.coords),
            ("dim", &self.dim),
            ("group_by", &self.group_by),
        ] {
            if let Some(value) = value {
                opts.insert(key.to_string(), serde_json::Value::from(value.clone()));
            }
        }
        (!opts.is_empty()).then(|| serde_json::Value::Object(opts))
    }
}

/// Materialize zarr views: one per path, or a single aggregated view when
/// several paths are posted.
async fn convert(
    State(app): State<Arc<App>>,
    auth: Auth,
    Json(request): Json<ConvertRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let opts = request.options();
    let paths = request.path.into_vec();
    if paths.is_empty() {
        return Err(ApiError::detail(
            StatusCode::UNPROCESSABLE_ENTITY,
            "path must not be empty",
        ));
    }
    let tokens: Vec<CacheToken> = if paths.len() == 1 && opts.is_none() {
        paths.iter().map(|p| CacheToken::for_path(p)).collect()
    } else {
        vec![CacheToken::encode(&portal_cache::TokenPayload {
            path: paths.join(";"),
            opts,
        })]
    };

    for token in &tokens {
        publish_load(&app, token).await?;
    }

    let zarr_options = request.zarr_options.unwrap_or_default();
    let mut urls = Vec::with_capacity(tokens.len());
    for token in &tokens {
        let url = app.config.zarr_url(token);
        if zarr_options.public {
            let api_path = format!("{}/{}.zarr", app.config.zarr_base(), token);
            let response = mint_share(
                &app,
                &auth,
                &ShareRequest {
                    path: api_path,
                    ttl_seconds: zarr_options.ttl_seconds.unwrap_or(600),
                    method: "GET".to_string(),
                },
            )
            .await?;
            urls.push(response.url);
        } else {
            urls.push(url);
        }
    }
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "urls": urls })),
    ))
}

async fn mint_share(
    app: &App,
    _auth: &Auth,
    request: &ShareRequest,
) -> Result<ShareResponse, ApiError> {
    let path = share::path_from_url(&share::normalise_path(app, &request.path)?)?;
    let max_ttl = app.config.presign_max_ttl;
    let ttl = request.ttl_seconds.clamp(share::MIN_TTL_SECONDS, max_ttl);
    let expires_at = share::now_unix() + ttl;

    let token = share::encode_share_token(&share::SharePayload {
        path: path.clone(),
        exp: expires_at,
    });
    let sig = share::sign_token(&app.config.signing_secret(), &token);

    app.docstore
        .put_share(&ShareRecord {
            id: CacheToken::for_path(&path).as_str().to_string(),
            token: token.clone(),
            signature: sig.clone(),
            expires_at,
        })
        .await?;

    Ok(ShareResponse {
        url: format!(
            "{}{}/data-portal/share/{sig}/{token}.zarr",
            app.config.proxy, app.config.prefix
        ),
        token,
        sig,
        expires_at,
        method: request.method.to_uppercase(),
    })
}

/// Mint a pre-signed URL for a specific zarr path.
async fn share_zarr(
    State(app): State<Arc<App>>,
    auth: Auth,
    Json(request): Json<ShareRequest>,
) -> Result<(StatusCode, Json<ShareResponse>), ApiError> {
    let response = mint_share(&app, &auth, &request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    url: String,
}

/// Report the load status of a zarr URL without driving the state machine.
async fn load_status(
    State(app): State<Arc<App>>,
    Query(query): Query<StatusQuery>,
    _auth: Auth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let re = regex::Regex::new(r"/(?:zarr|zarr-utils)/([A-Za-z0-9_=-]+)\.zarr")
        .expect("pattern compiles");
    let token = re
        .captures(&query.url)
        .map(|captures| CacheToken::from_string(captures[1].to_string()))
        .ok_or_else(|| {
            ApiError::detail(StatusCode::BAD_REQUEST, "The url does not contain a UUID.")
        })?;

    let cache = app.cache().await?;
    let (status, reason) = match cache.get_status(&token).await? {
        Some(status) => (status.status, status.reason),
        None => (LoadState::Unknown, String::new()),
    };
    Ok(Json(serde_json::json!({
        "status": status.code(),
        "reason": reason,
    })))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zarr_paths_split_into_token_and_key() {
        let token = CacheToken::for_path("/arch/tas.nc");
        let (parsed, key) = parse_zarr_path(&format!("{token}.zarr/.zmetadata")).unwrap();
        assert_eq!(parsed, token);
        assert_eq!(key, ".zmetadata");

        let (_, key) = parse_zarr_path(&format!("{token}.zarr/group0/tas/0.0")).unwrap();
        assert_eq!(key, "group0/tas/0.0");

        let (_, key) = parse_zarr_path(&format!("{token}.zarr")).unwrap();
        assert_eq!(key, "");

        assert!(parse_zarr_path("no-suffix/.zmetadata").is_err());
    }

    #[test]
    fn failure_reasons_pick_their_status() {
        let mut status = LoadStatus::submitted("/api/floe/data-portal/zarr/x.zarr");
        status.status = LoadState::Failed;

        status.reason = "could not read /a.nc: no such file".to_string();
        assert_eq!(failed_response(&status).status, StatusCode::NOT_FOUND);

        status.reason = "Aggregation failed for at least one group.: shapes differ".to_string();
        assert_eq!(
            failed_response(&status).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn convert_options_only_carry_set_fields() {
        let request = ConvertRequest {
            path: OneOrMany::Many(vec!["/a.nc".to_string(), "/b.nc".to_string()]),
            aggregate: Some("concat".to_string()),
            join: None,
            compat: None,
            data_vars: None,
            coords: None,
            dim: Some("time".to_string()),
            group_by: None,
            zarr_options: None,
        };
        assert_eq!(
            request.options(),
            Some(serde_json::json!({"mode": "concat", "dim": "time"}))
        );

        let bare = ConvertRequest {
            path: OneOrMany::One("/a.nc".to_string()),
            aggregate: None,
            join: None,
            compat: None,
            data_vars: None,
            coords: None,
            dim: None,
            group_by: None,
            zarr_options: None,
        };
        assert_eq!(bare.options(), None);
    }
}
