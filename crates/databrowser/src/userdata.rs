//! User-data ingest: merge caller metadata into index documents and keep
//! the index and the doc-store in step.

use crate::backend::{IndexConfig, SolrConfig};
use crate::lucene::{escape, join_facet_queries};
use crate::{Document, SearchError};
use models::UNIQ_KEYS;
use sha2::{Digest, Sha256};

/// One metadata item as posted by the client.
pub type UserMetadataItem = Document;

/// The stable document id: a digest over `(file, uri)`, so re-posting the
/// same item upserts instead of duplicating.
pub fn userdata_id(item: &Document) -> String {
    let file = item.get("file").and_then(|v| v.as_str()).unwrap_or("");
    let uri = item.get("uri").and_then(|v| v.as_str()).unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update(b"|");
    hasher.update(uri.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn solr_of(config: &IndexConfig) -> Result<&SolrConfig, SearchError> {
    match config {
        IndexConfig::Solr(cfg) => Ok(cfg),
        _ => Err(SearchError::Upstream(
            "user data ingest requires the Solr backend".to_string(),
        )),
    }
}

async fn solr_update(url: &str, body: serde_json::Value) -> Result<(), SearchError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("reqwest client builds");
    let response = client
        .post(url)
        .query(&[("commit", "true")])
        .json(&body)
        .send()
        .await
        .map_err(|_| SearchError::Upstream("Could not connect to Solr server".to_string()))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        return Err(SearchError::Status(status, detail));
    }
    Ok(())
}

/// Validate items, merge the shared facets, stamp ownership, and upsert.
/// Returns how many documents were indexed.
pub async fn ingest_user_metadata(
    config: &IndexConfig,
    username: &str,
    items: &[UserMetadataItem],
    facets: &serde_json::Map<String, serde_json::Value>,
) -> Result<usize, SearchError> {
    let solr = solr_of(config)?;

    let mut docs = Vec::with_capacity(items.len());
    for item in items {
        if !item.contains_key("file") && !item.contains_key("uri") {
            return Err(SearchError::Validation(
                "user metadata needs a `file` or `uri` key".to_string(),
            ));
        }
        let mut doc = Document::new();
        for (key, value) in facets {
            doc.insert(key.to_lowercase(), value.clone());
        }
        for (key, value) in item {
            doc.insert(key.to_lowercase(), value.clone());
        }
        doc.insert("user".to_string(), serde_json::Value::from(username));
        doc.insert("id".to_string(), serde_json::Value::from(userdata_id(&doc)));
        docs.push(serde_json::Value::Object(doc));
    }

    let count = docs.len();
    let body = serde_json::Value::Array(docs);
    // Both cores carry user documents so every multi-version choice sees them.
    for core in [&solr.cores.0, &solr.cores.1] {
        let url = format!("{}/update", solr.core_url(core));
        solr_update(&url, body.clone()).await?;
    }
    Ok(count)
}

/// Delete the caller's documents matching the search keys from the index.
/// Ownership is enforced by forcing `user=<caller>` into the query.
pub async fn delete_user_metadata(
    config: &IndexConfig,
    username: &str,
    search_keys: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), SearchError> {
    let solr = solr_of(config)?;

    let mut terms = vec![format!("user:({})", escape(username))];
    for (key, value) in search_keys {
        let key = key.to_lowercase();
        if key == "user" {
            continue;
        }
        let values = vec![match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }];
        let (positive, negative) = join_facet_queries(&key, &values, UNIQ_KEYS);
        let field = key.replace("_not_", "");
        if !positive.is_empty() {
            terms.push(format!("{field}:({positive})"));
        }
        if !negative.is_empty() {
            terms.push(format!("-{field}:({negative})"));
        }
    }
    let query = terms.join(" AND ");

    for core in [&solr.cores.0, &solr.cores.1] {
        let url = format!("{}/update", solr.core_url(core));
        solr_update(&url, serde_json::json!({"delete": {"query": query}})).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_is_stable_over_file_and_uri() {
        let mut item = Document::new();
        item.insert("file".to_string(), serde_json::Value::from("/a.nc"));
        item.insert("uri".to_string(), serde_json::Value::from("slk:///a.nc"));
        let first = userdata_id(&item);
        item.insert("variable".to_string(), serde_json::Value::from("tas"));
        // Extra facets do not move the identity.
        assert_eq!(first, userdata_id(&item));

        let mut other = Document::new();
        other.insert("file".to_string(), serde_json::Value::from("/b.nc"));
        assert_ne!(first, userdata_id(&other));
    }
}
