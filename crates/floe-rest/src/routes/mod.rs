pub mod databrowser;
pub mod flavours;
pub mod stacapi;
pub mod zarr;

use crate::error::ApiError;
use crate::App;
use axum::http::StatusCode;
use indexmap::IndexMap;
use models::{suggest_flavours, Flavour, FlavourOwner, Translator};

/// Query parameters common to the search endpoints, everything else being
/// facet constraints. Dash and underscore spellings are both accepted.
#[derive(Debug, Default)]
pub struct SearchParams {
    pub start: usize,
    pub multi_version: bool,
    pub translate: bool,
    pub max_results: i64,
    pub catalogue_type: Option<String>,
    pub zarr_stream: bool,
    pub facets: Vec<String>,
    /// Remaining `key=value` pairs, handed to parameter validation.
    pub query: Vec<(String, String)>,
}

pub fn parse_search_params(raw: Option<&str>) -> Result<SearchParams, ApiError> {
    let mut params = SearchParams {
        translate: true,
        max_results: -1,
        ..Default::default()
    };
    let invalid =
        |key: &str| ApiError::detail(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid {key}"));

    for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
        let normalized = key.replace('-', "_").to_lowercase();
        match normalized.as_str() {
            "start" => params.start = value.parse().map_err(|_| invalid("start"))?,
            "multi_version" => {
                params.multi_version = value.parse().map_err(|_| invalid("multi-version"))?
            }
            "translate" => params.translate = value.parse().map_err(|_| invalid("translate"))?,
            "max_results" | "batch_size" => {
                params.max_results = value.parse().map_err(|_| invalid("max-results"))?
            }
            "catalogue_type" => params.catalogue_type = Some(value.to_string()),
            "zarr_stream" => {
                params.zarr_stream = value.parse().map_err(|_| invalid("zarr_stream"))?
            }
            "facets" => params.facets.push(value.to_string()),
            _ => params.query.push((key.to_string(), value.to_string())),
        }
    }
    Ok(params)
}

/// Resolve a flavour name: built-ins first, then the caller's personal
/// flavours, then global ones. Personal wins on ambiguity; a
/// `username:flavour` spelling must name the caller.
pub async fn resolve_translator(
    app: &App,
    flavour: &str,
    translate: bool,
    user: Option<&str>,
) -> Result<Translator, ApiError> {
    if let Ok(builtin) = flavour.parse::<Flavour>() {
        return Ok(Translator::builtin(builtin, translate));
    }

    let (owner_hint, name) = match flavour.split_once(':') {
        Some((owner, name)) => {
            if Some(owner) != user {
                return Err(ApiError::detail(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("flavour {flavour} does not belong to you"),
                ));
            }
            (Some(owner), name)
        }
        None => (None, flavour),
    };

    if let Some(user) = user.or(owner_hint) {
        if let Some(flavour) = app
            .docstore
            .get_flavour(name, &FlavourOwner::User(user.to_string()))
            .await?
        {
            return Ok(Translator::custom(name, &flavour.mapping, translate));
        }
    }
    if owner_hint.is_none() {
        if let Some(flavour) = app.docstore.get_flavour(name, &FlavourOwner::Global).await? {
            return Ok(Translator::custom(name, &flavour.mapping, translate));
        }
    }

    let mut known: Vec<String> = Flavour::ALL.iter().map(|f| f.to_string()).collect();
    if let Ok(customs) = app.docstore.list_flavours(user).await {
        known.extend(customs.into_iter().map(|f| f.flavour_name));
    }
    let suggestions = suggest_flavours(name, known.iter().map(String::as_str));
    Err(ApiError::detail(
        StatusCode::UNPROCESSABLE_ENTITY,
        format!(
            "flavour {flavour:?} is not known; did you mean one of: {}",
            suggestions.join(", ")
        ),
    ))
}

/// Record one query in the statistics collection, off the request path.
pub fn record_stats(
    app: &App,
    flavour: &str,
    uniq_key: &str,
    num_results: u64,
    status: u16,
    facets: &IndexMap<String, Vec<String>>,
) {
    let stat = models::QueryStat::new(num_results, flavour, uniq_key, status, facets);
    let docstore = app.docstore.clone();
    tokio::spawn(async move { docstore.insert_stat(&stat).await });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dash_and_underscore_spellings_parse() {
        let params =
            parse_search_params(Some("start=10&multi-version=true&max-results=5&project=cmip"))
                .unwrap();
        assert_eq!(params.start, 10);
        assert!(params.multi_version);
        assert_eq!(params.max_results, 5);
        assert_eq!(
            params.query,
            vec![("project".to_string(), "cmip".to_string())]
        );
    }

    #[test]
    fn defaults_translate_and_unbounded_results() {
        let params = parse_search_params(None).unwrap();
        assert!(params.translate);
        assert_eq!(params.max_results, -1);
        assert!(!params.zarr_stream);
    }

    #[test]
    fn malformed_control_params_are_422() {
        let err = parse_search_params(Some("start=ten")).unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
