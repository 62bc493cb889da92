//! Custom flavour CRUD: global flavours are admin-only, personal ones
//! belong to the caller, built-ins are never writable.

use crate::auth::{Auth, MaybeAuth};
use crate::error::ApiError;
use crate::App;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use indexmap::IndexMap;
use models::{CustomFlavour, Flavour, FlavourOwner};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route(
            "/databrowser/flavours",
            get(list_flavours).post(create_flavour),
        )
        .route(
            "/databrowser/flavours/:name",
            axum::routing::put(update_flavour).delete(delete_flavour),
        )
}

fn is_builtin(name: &str) -> bool {
    name.parse::<Flavour>().is_ok()
}

fn validate_mapping(mapping: &IndexMap<String, String>) -> Result<(), ApiError> {
    let canonical: Vec<&str> = models::canonical_facets().iter().map(|(k, _)| *k).collect();
    for key in mapping.keys() {
        if !canonical.contains(&key.as_str()) {
            return Err(ApiError::detail(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("{key:?} is not a canonical facet name"),
            ));
        }
    }
    Ok(())
}

/// Built-ins plus visible custom flavours; collisions between global and
/// personal names are listed as `username:flavour`.
async fn list_flavours(
    State(app): State<Arc<App>>,
    MaybeAuth(auth): MaybeAuth,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = match &auth {
        Some(auth) => Some(auth.username(&app).await),
        None => None,
    };
    let customs = app.docstore.list_flavours(user.as_deref()).await?;

    let mut listed = Vec::new();
    for flavour in Flavour::ALL {
        listed.push(serde_json::json!({
            "flavour_name": flavour.to_string(),
            "owner": "builtin",
            "mapping": models::Translator::builtin(*flavour, true).forward_lookup(),
        }));
    }
    for flavour in &customs {
        let collides = is_builtin(&flavour.flavour_name)
            || customs.iter().any(|other| {
                other.flavour_name == flavour.flavour_name && other.owner != flavour.owner
            });
        listed.push(serde_json::json!({
            "flavour_name": flavour.listed_name(collides),
            "owner": match &flavour.owner {
                FlavourOwner::Global => "global".to_string(),
                FlavourOwner::User(name) => name.clone(),
            },
            "mapping": flavour.mapping,
        }));
    }
    Ok(Json(serde_json::json!({ "flavours": listed })))
}

#[derive(Debug, Deserialize)]
struct FlavourRequest {
    flavour_name: String,
    mapping: IndexMap<String, String>,
    #[serde(default)]
    is_global: bool,
}

async fn owner_for(app: &App, auth: &Auth, is_global: bool) -> Result<FlavourOwner, ApiError> {
    if is_global {
        if !app.oidc.is_admin(&auth.claims) {
            return Err(ApiError::detail(
                StatusCode::FORBIDDEN,
                "creating global flavours needs the admin claim",
            ));
        }
        Ok(FlavourOwner::Global)
    } else {
        Ok(FlavourOwner::User(auth.username(app).await))
    }
}

async fn create_flavour(
    State(app): State<Arc<App>>,
    auth: Auth,
    Json(request): Json<FlavourRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if is_builtin(&request.flavour_name) {
        return Err(ApiError::detail(
            StatusCode::CONFLICT,
            format!("{} is a built-in flavour", request.flavour_name),
        ));
    }
    validate_mapping(&request.mapping)?;
    let owner = owner_for(&app, &auth, request.is_global).await?;
    let flavour = CustomFlavour {
        flavour_name: request.flavour_name.clone(),
        owner,
        mapping: request.mapping,
    };
    let created = app.docstore.put_flavour(&flavour, false).await?;
    if !created {
        return Err(ApiError::detail(
            StatusCode::CONFLICT,
            format!("flavour {} already exists", request.flavour_name),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "created", "flavour_name": request.flavour_name})),
    ))
}

async fn update_flavour(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    auth: Auth,
    Json(request): Json<FlavourRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if is_builtin(&name) {
        return Err(ApiError::detail(
            StatusCode::FORBIDDEN,
            "built-in flavours are immutable",
        ));
    }
    validate_mapping(&request.mapping)?;
    let owner = owner_for(&app, &auth, request.is_global).await?;
    let flavour = CustomFlavour {
        flavour_name: name.clone(),
        owner,
        mapping: request.mapping,
    };
    app.docstore.put_flavour(&flavour, true).await?;
    Ok(Json(serde_json::json!({"status": "updated", "flavour_name": name})))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    is_global: bool,
}

async fn delete_flavour(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
    auth: Auth,
) -> Result<Json<serde_json::Value>, ApiError> {
    if is_builtin(&name) {
        return Err(ApiError::detail(
            StatusCode::FORBIDDEN,
            "built-in flavours are immutable",
        ));
    }
    let owner = owner_for(&app, &auth, query.is_global).await?;
    let deleted = app.docstore.delete_flavour(&name, &owner).await?;
    if !deleted {
        return Err(ApiError::detail(
            StatusCode::NOT_FOUND,
            format!("flavour {name} does not exist"),
        ));
    }
    Ok(Json(serde_json::json!({"status": "deleted", "flavour_name": name})))
}
