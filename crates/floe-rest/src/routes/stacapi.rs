//! Minimal STAC API: landing page, conformance, collections derived from
//! the `project` facet, items with token pagination, and search.

use crate::error::ApiError;
use crate::routes::parse_search_params;
use crate::App;
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use databrowser::{DataBrowser, PageFields};
use futures::StreamExt;
use models::{Flavour, Translator, UniqKey};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const STAC_VERSION: &str = "1.0.0";
const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/stacapi/", get(landing))
        .route("/stacapi/conformance", get(conformance))
        .route("/stacapi/collections", get(collections))
        .route("/stacapi/collections/:id", get(collection))
        .route("/stacapi/collections/:id/items", get(collection_items))
        .route(
            "/stacapi/collections/:id/items/:item_id",
            get(collection_item),
        )
        .route("/stacapi/search", get(search_get).post(search_post))
}

fn ensure_enabled(app: &App) -> Result<(), ApiError> {
    if !app.service_enabled("stacapi") {
        return Err(ApiError::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service not enabled.",
        ));
    }
    Ok(())
}

fn stac_base(app: &App) -> String {
    format!("{}{}/stacapi", app.config.proxy, app.config.prefix)
}

fn conformance_classes() -> Value {
    json!([
        "https://api.stacspec.org/v1.0.0/core",
        "https://api.stacspec.org/v1.0.0/collections",
        "https://api.stacspec.org/v1.0.0/ogcapi-features",
        "https://api.stacspec.org/v1.0.0/item-search",
    ])
}

async fn landing(State(app): State<Arc<App>>) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let base = stac_base(&app);
    Ok(Json(json!({
        "type": "Catalog",
        "id": "floe-stacapi",
        "stac_version": STAC_VERSION,
        "description": "STAC API view of the floe databrowser catalog.",
        "conformsTo": conformance_classes(),
        "links": [
            {"rel": "self", "href": format!("{base}/"), "type": "application/json"},
            {"rel": "root", "href": format!("{base}/"), "type": "application/json"},
            {"rel": "conformance", "href": format!("{base}/conformance"), "type": "application/json"},
            {"rel": "data", "href": format!("{base}/collections"), "type": "application/json"},
            {"rel": "search", "href": format!("{base}/search"), "type": "application/geo+json"},
        ],
    })))
}

async fn conformance(State(app): State<Arc<App>>) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    Ok(Json(json!({ "conformsTo": conformance_classes() })))
}

fn freva_search(app: &App, query: &[(String, String)]) -> Result<DataBrowser, ApiError> {
    Ok(DataBrowser::validate_parameters(
        &app.index,
        Translator::builtin(Flavour::Freva, true),
        UniqKey::File,
        0,
        false,
        query,
    )?)
}

/// Every distinct `project` value is a collection.
async fn project_values(app: &App) -> Result<Vec<(String, u64)>, ApiError> {
    let search = freva_search(app, &[])?;
    let (_, result) = search.extended_search(&["project".to_string()], 0).await?;
    let mut values = Vec::new();
    if let Some(counts) = result.facets.get("project") {
        for pair in counts.chunks(2) {
            if let [value, count] = pair {
                if let Some(value) = value.as_str() {
                    values.push((value.to_string(), count.as_u64().unwrap_or(0)));
                }
            }
        }
    }
    Ok(values)
}

fn collection_json(app: &App, id: &str, count: u64) -> Value {
    let base = stac_base(app);
    json!({
        "type": "Collection",
        "id": id,
        "stac_version": STAC_VERSION,
        "description": format!("Datasets of project {id} ({count} files)."),
        "license": "proprietary",
        "extent": {
            "spatial": {"bbox": [[-180.0, -90.0, 180.0, 90.0]]},
            "temporal": {"interval": [[Value::Null, Value::Null]]},
        },
        "links": [
            {"rel": "self", "href": format!("{base}/collections/{id}"), "type": "application/json"},
            {"rel": "root", "href": format!("{base}/"), "type": "application/json"},
            {"rel": "items", "href": format!("{base}/collections/{id}/items"), "type": "application/geo+json"},
        ],
    })
}

async fn collections(State(app): State<Arc<App>>) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let values = project_values(&app).await?;
    let collections: Vec<Value> = values
        .iter()
        .map(|(id, count)| collection_json(&app, id, *count))
        .collect();
    let base = stac_base(&app);
    Ok(Json(json!({
        "collections": collections,
        "links": [
            {"rel": "self", "href": format!("{base}/collections"), "type": "application/json"},
            {"rel": "root", "href": format!("{base}/"), "type": "application/json"},
        ],
    })))
}

async fn collection(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let values = project_values(&app).await?;
    let found = values
        .into_iter()
        .find(|(value, _)| *value == id)
        .ok_or_else(|| {
            ApiError::detail(StatusCode::NOT_FOUND, format!("collection {id} not found"))
        })?;
    Ok(Json(collection_json(&app, &found.0, found.1)))
}

fn normalize_item_id(value: &str) -> String {
    let slug: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

fn item_json(app: &App, collection: &str, item_id: &str, doc: &databrowser::Document) -> Value {
    let base = stac_base(app);
    let mut properties = serde_json::Map::new();
    properties.insert("datetime".to_string(), Value::Null);
    for facet in models::facet_hierarchy() {
        if let Some(value) = doc.get(*facet) {
            properties.insert(facet.to_string(), value.clone());
        }
    }
    let href = doc.get("file").cloned().unwrap_or_default();
    json!({
        "type": "Feature",
        "stac_version": STAC_VERSION,
        "id": item_id,
        "geometry": Value::Null,
        "properties": properties,
        "collection": collection,
        "links": [
            {"rel": "self", "href": format!("{base}/collections/{collection}/items/{item_id}")},
            {"rel": "collection", "href": format!("{base}/collections/{collection}")},
            {"rel": "root", "href": format!("{base}/")},
        ],
        "assets": {"data": {"href": href, "roles": ["data"]}},
    })
}

#[derive(Debug, Default, Deserialize)]
struct ItemsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    token: Option<String>,
}

/// Pagination token format: `next|prev:<collection_id>:<item_id>`.
fn parse_token(token: &str, collection: &str) -> Result<(bool, String), ApiError> {
    let parts: Vec<&str> = token.splitn(3, ':').collect();
    let [direction, cid, item_id] = parts.as_slice() else {
        return Err(ApiError::detail(StatusCode::BAD_REQUEST, "malformed token"));
    };
    if *cid != collection || !matches!(*direction, "next" | "prev") {
        return Err(ApiError::detail(StatusCode::BAD_REQUEST, "malformed token"));
    }
    Ok((*direction == "next", item_id.to_string()))
}

async fn collect_items(
    app: &App,
    collection: &str,
    limit: usize,
    token: Option<&str>,
) -> Result<(Vec<Value>, Option<String>), ApiError> {
    let query = vec![("project".to_string(), collection.to_string())];
    let search = freva_search(app, &query)?;

    let after = match token {
        Some(token) => {
            let (forward, item_id) = parse_token(token, collection)?;
            if !forward {
                // Backwards pagination restarts from the beginning up to the
                // marker; acceptable for the minimal API surface.
                None
            } else {
                Some(item_id)
            }
        }
        None => None,
    };

    let mut stream = search.stream_documents(PageFields::Catalogue);
    let mut skipping = after.is_some();
    let mut items = Vec::new();
    let mut next = None;
    while let Some(doc) = stream.next().await {
        let doc = doc?;
        let uniq = doc
            .get("file")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let item_id = normalize_item_id(&uniq);
        if skipping {
            if Some(&item_id) == after.as_ref() {
                skipping = false;
            }
            continue;
        }
        if items.len() >= limit {
            next = Some(format!("next:{collection}:{}", last_id(&items)));
            break;
        }
        items.push(item_json(app, collection, &item_id, &doc));
    }
    Ok((items, next))
}

fn last_id(items: &[Value]) -> String {
    items
        .last()
        .and_then(|item| item["id"].as_str())
        .unwrap_or_default()
        .to_string()
}

async fn collection_items(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let query: ItemsQuery = serde_urlencoded_from(raw.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let (items, next) = collect_items(&app, &id, limit, query.token.as_deref()).await?;

    let base = stac_base(&app);
    let mut links = vec![json!({
        "rel": "self",
        "href": format!("{base}/collections/{id}/items"),
    })];
    if let Some(next) = &next {
        links.push(json!({
            "rel": "next",
            "href": format!("{base}/collections/{id}/items?token={next}"),
        }));
    }
    Ok(Json(json!({
        "type": "FeatureCollection",
        "features": items,
        "links": links,
    })))
}

async fn collection_item(
    State(app): State<Arc<App>>,
    Path((id, item_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let query = vec![("project".to_string(), id.clone())];
    let search = freva_search(&app, &query)?;
    let mut stream = search.stream_documents(PageFields::Catalogue);
    while let Some(doc) = stream.next().await {
        let doc = doc?;
        let uniq = doc
            .get("file")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if normalize_item_id(&uniq) == item_id {
            return Ok(Json(item_json(&app, &id, &item_id, &doc)));
        }
    }
    Err(ApiError::detail(
        StatusCode::NOT_FOUND,
        format!("item {item_id} not found in {id}"),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct SearchBody {
    #[serde(default)]
    collections: Option<Vec<String>>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn run_search(app: &App, body: SearchBody) -> Result<Json<Value>, ApiError> {
    let mut query = Vec::new();
    if let Some(collections) = &body.collections {
        for collection in collections {
            query.push(("project".to_string(), collection.clone()));
        }
    }
    if let Some(bbox) = &body.bbox {
        if bbox.len() == 4 {
            // STAC order is (minLon, minLat, maxLon, maxLat).
            query.push((
                "bbox".to_string(),
                format!("{},{},{},{}", bbox[0], bbox[2], bbox[1], bbox[3]),
            ));
        }
    }
    if let Some(datetime) = &body.datetime {
        let time = datetime.replace('/', " to ");
        query.push(("time".to_string(), time));
    }

    let search = freva_search(app, &query)?;
    let limit = body.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let mut stream = search.stream_documents(PageFields::Catalogue);
    let mut features = Vec::new();
    while let Some(doc) = stream.next().await {
        if features.len() >= limit {
            break;
        }
        let doc = doc?;
        let uniq = doc
            .get("file")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let collection = doc
            .get("project")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        features.push(item_json(app, &collection, &normalize_item_id(&uniq), &doc));
    }
    Ok(Json(json!({
        "type": "FeatureCollection",
        "features": features,
    })))
}

async fn search_get(
    State(app): State<Arc<App>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    let params = parse_search_params(raw.as_deref())?;
    let mut body = SearchBody::default();
    for (key, value) in &params.query {
        match key.as_str() {
            "collections" => {
                body.collections =
                    Some(value.split(',').map(str::to_string).collect::<Vec<_>>())
            }
            "bbox" => {
                body.bbox = Some(
                    value
                        .split(',')
                        .filter_map(|v| v.parse().ok())
                        .collect::<Vec<_>>(),
                )
            }
            "datetime" => body.datetime = Some(value.clone()),
            "limit" => body.limit = value.parse().ok(),
            _ => {}
        }
    }
    run_search(&app, body).await
}

async fn search_post(
    State(app): State<Arc<App>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>, ApiError> {
    ensure_enabled(&app)?;
    run_search(&app, body).await
}

fn serde_urlencoded_from(raw: Option<&str>) -> Result<ItemsQuery, ApiError> {
    let mut query = ItemsQuery::default();
    for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "limit" => query.limit = value.parse().ok(),
            "token" => query.token = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(query)
}
