//! Exercises the Solr backend against a stub index server: query assembly,
//! cursor-mark pagination, facet translation and failure mapping.

use axum::extract::RawQuery;
use axum::routing::get;
use axum::{Json, Router};
use databrowser::{DataBrowser, IndexConfig, PageFields, SolrConfig};
use futures::TryStreamExt;
use models::{Flavour, Translator, UniqKey};
use serde_json::json;
use std::sync::{Arc, Mutex};

type SeenQueries = Arc<Mutex<Vec<Vec<(String, String)>>>>;

/// A canned Solr `select` handler: three documents over two cursor pages.
async fn stub_select(seen: SeenQueries, raw: Option<String>) -> Json<serde_json::Value> {
    let params: Vec<(String, String)> = url::form_urlencoded::parse(
        raw.unwrap_or_default().as_bytes(),
    )
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    seen.lock().unwrap().push(params.clone());

    let cursor = params
        .iter()
        .find(|(k, _)| k == "cursorMark")
        .map(|(_, v)| v.as_str());

    let (docs, next) = match cursor {
        Some("*") => (
            json!([
                {"file": "/arch/a.nc", "uri": "slk:///arch/a.nc", "project": "cmip6"},
                {"file": "/arch/b.nc", "uri": "slk:///arch/b.nc", "project": "cmip6"},
            ]),
            "AAA",
        ),
        Some("AAA") => (
            json!([{"file": "/arch/c.nc", "uri": "slk:///arch/c.nc", "project": "cmip6"}]),
            "BBB",
        ),
        Some(_) => (json!([]), "BBB"),
        None => (json!([]), "*"),
    };

    Json(json!({
        "response": {"numFound": 3, "docs": docs},
        "facet_counts": {"facet_fields": {
            "project": ["cmip6", 3],
            "variable": ["tas", 2, "pr", 1],
        }},
        "nextCursorMark": next,
    }))
}

async fn start_stub() -> (SolrConfig, SeenQueries) {
    let seen: SeenQueries = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let router = Router::new().route(
        "/solr/:core/select/",
        get(move |RawQuery(raw): RawQuery| stub_select(handler_seen.clone(), raw)),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (
        SolrConfig {
            host: "127.0.0.1".to_string(),
            port,
            cores: ("files".to_string(), "latest".to_string()),
            fields: databrowser::default_fields(),
        },
        seen,
    )
}

fn search(config: &SolrConfig, query: &[(&str, &str)]) -> DataBrowser {
    let query: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    DataBrowser::validate_parameters(
        &IndexConfig::Solr(config.clone()),
        Translator::builtin(Flavour::Cmip6, true),
        UniqKey::Uri,
        0,
        false,
        &query,
    )
    .unwrap()
}

#[tokio::test]
async fn counts_and_facets_translate_forward() {
    let (config, _seen) = start_stub().await;
    let browser = search(&config, &[("activity_id", "cmip")]);

    let (status, total) = browser.init_stream().await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(total, 3);

    let (_, result) = browser.extended_search(&[], 0).await.unwrap();
    assert_eq!(result.total_count, 3);
    // Canonical index fields come back in the cmip6 vocabulary.
    assert!(result.facets.contains_key("mip_era"));
    assert!(result.facets.contains_key("variable_id"));
    assert_eq!(result.facet_mapping.get("variable").unwrap(), "variable_id");
    assert!(result
        .primary_facets
        .contains(&"activity_id".to_string()));
}

#[tokio::test]
async fn inbound_facets_reach_the_index_in_canonical_form() {
    let (config, seen) = start_stub().await;
    let browser = search(&config, &[("activity_id", "cmip"), ("variable_id", "!tas")]);
    let _ = browser.init_stream().await.unwrap();

    let queries = seen.lock().unwrap();
    let filters: Vec<&String> = queries
        .last()
        .unwrap()
        .iter()
        .filter(|(k, _)| k == "fq")
        .map(|(_, v)| v)
        .collect();
    let joined = filters
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" | ");
    assert!(joined.contains("product:(cmip)"), "{joined}");
    assert!(joined.contains("-variable:(tas)"), "{joined}");
    // Non-user flavours exclude user-ingested documents.
    assert!(joined.contains("-user:*"), "{joined}");
}

#[tokio::test]
async fn pagination_terminates_when_the_cursor_stops_moving() {
    let (config, _seen) = start_stub().await;
    let browser = search(&config, &[]);

    let docs: Vec<_> = browser
        .stream_documents(PageFields::UniqOnly)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(docs.len(), 3);

    let lines: Vec<_> = browser.stream_response().try_collect().await.unwrap();
    let text: String = lines.iter().map(|b| String::from_utf8_lossy(b)).collect();
    assert_eq!(text, "slk:///arch/a.nc\nslk:///arch/b.nc\nslk:///arch/c.nc\n");
}

#[tokio::test]
async fn intake_catalogue_streams_valid_json() {
    let (config, _seen) = start_stub().await;
    let browser = search(&config, &[]);

    let (_, catalogue) = browser.init_intake_catalogue().await.unwrap();
    assert_eq!(catalogue.total_count, 3);

    let bytes: Vec<_> = browser
        .intake_catalogue(catalogue)
        .try_collect()
        .await
        .unwrap();
    let text: String = bytes.iter().map(|b| String::from_utf8_lossy(b)).collect();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["catalog_dict"].as_array().unwrap().len(), 3);
    assert_eq!(parsed["assets"]["column_name"], "uri");
    assert_eq!(
        parsed["aggregation_control"]["variable_column_name"],
        "variable_id"
    );
}

#[tokio::test]
async fn unreachable_index_maps_to_503() {
    // Nothing listens on this port.
    let config = SolrConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        cores: ("files".to_string(), "latest".to_string()),
        fields: databrowser::default_fields(),
    };
    let browser = search(&config, &[]);
    let err = browser.init_stream().await.unwrap_err();
    assert_eq!(err.status(), 503);
}
