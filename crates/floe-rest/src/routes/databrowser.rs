//! The databrowser endpoints: overview, searches, catalogues, zarr loading
//! and user-data ingest.

use crate::auth::{Auth, MaybeAuth};
use crate::error::ApiError;
use crate::routes::{parse_search_params, record_stats, resolve_translator, SearchParams};
use crate::App;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use databrowser::{DataBrowser, PageFields, StacCatalogue};
use indexmap::IndexMap;
use models::{SearchFlavours, Translator, UniqKey};
use portal_cache::CacheToken;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/databrowser/overview", get(overview))
        .route(
            "/databrowser/metadata-search/:flavour/:uniq_key",
            get(metadata_search),
        )
        .route(
            "/databrowser/data-search/:flavour/:uniq_key",
            get(data_search),
        )
        .route(
            "/databrowser/extended-search/:flavour/:uniq_key",
            get(extended_search),
        )
        .route(
            "/databrowser/intake-catalogue/:flavour/:uniq_key",
            get(intake_catalogue),
        )
        .route(
            "/databrowser/stac-catalogue/:flavour/:uniq_key",
            get(stac_catalogue),
        )
        .route("/databrowser/load/:flavour", get(load_data))
        .route(
            "/databrowser/userdata",
            axum::routing::post(post_user_data).delete(delete_user_data),
        )
}

fn parse_uniq_key(raw: &str) -> Result<UniqKey, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::detail(StatusCode::UNPROCESSABLE_ENTITY, "Could not validate input."))
}

async fn build_search(
    app: &App,
    flavour: &str,
    uniq_key: UniqKey,
    params: &SearchParams,
    user: Option<&str>,
) -> Result<DataBrowser, ApiError> {
    let translator = resolve_translator(app, flavour, params.translate, user).await?;
    Ok(DataBrowser::validate_parameters(
        &app.index,
        translator,
        uniq_key,
        params.start,
        params.multi_version,
        &params.query,
    )?)
}

/// All available search flavours and their attributes.
async fn overview(
    State(app): State<Arc<App>>,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Json<SearchFlavours>, ApiError> {
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };

    let mut flavours = Vec::new();
    let mut attributes = IndexMap::new();
    for builtin in models::Flavour::ALL {
        let translator = Translator::builtin(*builtin, true);
        flavours.push(builtin.to_string());
        attributes.insert(builtin.to_string(), translator.overview_attributes());
    }

    let customs = app.docstore.list_flavours(user.as_deref()).await?;
    for flavour in &customs {
        let collides = flavours.contains(&flavour.flavour_name)
            || customs.iter().any(|other| {
                other.flavour_name == flavour.flavour_name && other.owner != flavour.owner
            });
        let listed = flavour.listed_name(collides);
        let translator = Translator::custom(&listed, &flavour.mapping, true);
        flavours.push(listed.clone());
        attributes.insert(listed, translator.overview_attributes());
    }

    Ok(Json(SearchFlavours {
        flavours,
        attributes,
    }))
}

/// Facet counts for a search, without result documents.
async fn metadata_search(
    State(app): State<Arc<App>>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Response, ApiError> {
    let uniq_key = parse_uniq_key(&uniq_key)?;
    let params = parse_search_params(raw.as_deref())?;
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let search = build_search(&app, &flavour, uniq_key, &params, user.as_deref()).await?;

    let (status, result) = search.extended_search(&params.facets, 0).await?;
    record_stats(
        &app,
        &search.translator.flavour,
        uniq_key.as_str(),
        result.total_count,
        status,
        &search.stats_facets(),
    );

    let mut body = serde_json::to_value(&result).expect("search result serializes");
    if let Some(map) = body.as_object_mut() {
        map.remove("search_results");
    }
    Ok((
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        Json(body),
    )
        .into_response())
}

/// Stream one uniq-key value per line.
async fn data_search(
    State(app): State<Arc<App>>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Response, ApiError> {
    let uniq_key = parse_uniq_key(&uniq_key)?;
    let params = parse_search_params(raw.as_deref())?;
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let search = build_search(&app, &flavour, uniq_key, &params, user.as_deref()).await?;

    let (status, total) = search.init_stream().await?;
    record_stats(
        &app,
        &search.translator.flavour,
        uniq_key.as_str(),
        total,
        status,
        &search.stats_facets(),
    );

    let stream = search.stream_response();
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(stream))
        .expect("response builds"))
}

/// Facet counts plus a window of result documents; used by web clients.
async fn extended_search(
    State(app): State<Arc<App>>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Response, ApiError> {
    let uniq_key = parse_uniq_key(&uniq_key)?;
    let mut params = parse_search_params(raw.as_deref())?;
    if params.max_results < 0 {
        params.max_results = 150;
    }
    if params.zarr_stream && auth.is_none() && app.service_enabled("zarr-stream") {
        return Err(ApiError::unauthenticated());
    }
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let search = build_search(&app, &flavour, uniq_key, &params, user.as_deref()).await?;

    let (status, mut result) = search
        .extended_search(&params.facets, params.max_results)
        .await?;
    if params.zarr_stream {
        for doc in &mut result.search_results {
            if let Some(value) = doc.get(uniq_key.as_str()).and_then(|v| v.as_str()) {
                let url = app.config.zarr_url(&CacheToken::for_path(value));
                doc.insert(uniq_key.as_str().to_string(), serde_json::Value::from(url));
            }
            doc.entry("fs_type".to_string())
                .or_insert_with(|| serde_json::Value::from("posix"));
        }
    }
    record_stats(
        &app,
        &search.translator.flavour,
        uniq_key.as_str(),
        result.total_count,
        status,
        &search.stats_facets(),
    );
    Ok((
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        Json(serde_json::to_value(&result).expect("search result serializes")),
    )
        .into_response())
}

/// Stream an intake-esm catalogue of the search results.
async fn intake_catalogue(
    State(app): State<Arc<App>>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Response, ApiError> {
    let uniq_key = parse_uniq_key(&uniq_key)?;
    let params = parse_search_params(raw.as_deref())?;
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let search = build_search(&app, &flavour, uniq_key, &params, user.as_deref()).await?;

    let (status, catalogue) = search.init_intake_catalogue().await?;
    record_stats(
        &app,
        &search.translator.flavour,
        uniq_key.as_str(),
        catalogue.total_count,
        status,
        &search.stats_facets(),
    );
    if catalogue.total_count == 0 {
        return Err(ApiError::detail(StatusCode::NOT_FOUND, "No results found."));
    }
    if params.max_results > 0 && catalogue.total_count > params.max_results as u64 {
        return Err(ApiError::detail(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Result stream too big.",
        ));
    }

    let file_name = format!("IntakeEsmCatalogue_{flavour}_{uniq_key}.json");
    let stream = search.intake_catalogue(catalogue);
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_stream(stream))
        .expect("response builds"))
}

/// Stream a static STAC catalogue as a zip archive.
async fn stac_catalogue(
    State(app): State<Arc<App>>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Response, ApiError> {
    let uniq_key = parse_uniq_key(&uniq_key)?;
    let params = parse_search_params(raw.as_deref())?;
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let search = build_search(&app, &flavour, uniq_key, &params, user.as_deref()).await?;

    let (status, total) = search.init_stream().await?;
    record_stats(
        &app,
        &search.translator.flavour,
        uniq_key.as_str(),
        total,
        status,
        &search.stats_facets(),
    );
    if total == 0 {
        return Err(ApiError::detail(StatusCode::NOT_FOUND, "No results found."));
    }
    if params.max_results > 0 && total > params.max_results as u64 {
        return Err(ApiError::detail(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Result stream too big.",
        ));
    }

    let collection_id = {
        let tag: String = format!("{flavour}-{}", uuid::Uuid::new_v4())
            .chars()
            .take(18)
            .collect();
        format!("Dataset-{tag}")
    };
    let stac = StacCatalogue::new(&collection_id, uniq_key);
    let bytes = stac
        .into_zip(search.stream_documents(PageFields::Catalogue))
        .await?;

    let file_name = format!("stac-catalog-{collection_id}-{uniq_key}.zip");
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from(bytes))
        .expect("response builds"))
}

/// Search for datasets and stream temporary zarr endpoint URLs.
async fn load_data(
    State(app): State<Arc<App>>,
    Path(flavour): Path<String>,
    RawQuery(raw): RawQuery,
    auth: Auth,
) -> Result<Response, ApiError> {
    if !app.service_enabled("zarr-stream") {
        return Err(ApiError::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service not enabled.",
        ));
    }
    let params = parse_search_params(raw.as_deref())?;
    let user = auth.username(&app).await;
    let search = build_search(&app, &flavour, UniqKey::Uri, &params, Some(&user)).await?;

    let (_, total) = search.init_stream().await?;
    let status = if total < 1 {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::CREATED
    };
    record_stats(
        &app,
        &search.translator.flavour,
        UniqKey::Uri.as_str(),
        total,
        status.as_u16(),
        &search.stats_facets(),
    );

    let catalogue = match params.catalogue_type.as_deref() {
        Some("intake") => Some(search.init_intake_catalogue().await?.1),
        _ => None,
    };
    let config = app.config.clone();
    let to_url: Arc<dyn Fn(&str) -> String + Send + Sync> =
        Arc::new(move |path| config.zarr_url(&CacheToken::for_path(path)));
    let stream = search.zarr_response(catalogue, to_url);

    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(stream))
        .expect("response builds"))
}

#[derive(Debug, Deserialize)]
struct AddUserDataRequest {
    user_metadata: Vec<serde_json::Map<String, serde_json::Value>>,
    facets: serde_json::Map<String, serde_json::Value>,
}

/// Index caller-supplied metadata and make it searchable.
async fn post_user_data(
    State(app): State<Arc<App>>,
    auth: Auth,
    Json(request): Json<AddUserDataRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let username = auth.username(&app).await;
    let count = databrowser::ingest_user_metadata(
        &app.index,
        &username,
        &request.user_metadata,
        &request.facets,
    )
    .await?;

    // Mirror to the doc-store with the same stable id.
    for item in &request.user_metadata {
        let mut merged = request.facets.clone();
        for (key, value) in item {
            merged.insert(key.clone(), value.clone());
        }
        merged.insert("user".to_string(), serde_json::Value::from(username.clone()));
        let id = databrowser::userdata_id(&merged);
        if let Err(error) = app
            .docstore
            .upsert_userdata(&id, &username, &serde_json::Value::Object(merged))
            .await
        {
            tracing::warn!(%error, "could not mirror user metadata to the doc-store");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": format!("indexing {count} metadata records")
        })),
    ))
}

/// Delete metadata the caller previously indexed.
async fn delete_user_data(
    State(app): State<Arc<App>>,
    auth: Auth,
    Json(request): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let username = auth.username(&app).await;
    databrowser::delete_user_metadata(&app.index, &username, &request).await?;
    if let Err(error) = app.docstore.delete_userdata(&username, &request).await {
        tracing::warn!(%error, "could not delete mirrored user metadata");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "User data has been deleted successfully from the databrowser."
        })),
    ))
}
