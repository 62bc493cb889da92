//! Search-engine backend (Elasticsearch/OpenSearch): JSON query DSL,
//! terms aggregations and `search_after` pagination.

use crate::backend::{page_field_list, PageFields, RawFacets, SearchEngineConfig, BATCH_SIZE};
use crate::constraints::{SelectMethod, TimeRange};
use crate::{Document, SearchError};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use models::UniqKey;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct SearchEngineBackend {
    client: reqwest::Client,
    url: String,
    index: String,
    lookup: IndexMap<String, String>,
    fields: Vec<String>,
    uniq_key: UniqKey,
    query: Value,
}

fn is_negated(key: &str, value: &str) -> (bool, String) {
    if value.to_lowercase().starts_with("not ") {
        (true, value[4..].to_string())
    } else if value.starts_with('!') || value.starts_with('-') {
        (true, value[1..].to_string())
    } else {
        (key.contains("_not_"), value.to_string())
    }
}

impl SearchEngineBackend {
    pub(crate) fn new(
        config: &SearchEngineConfig,
        uniq_key: UniqKey,
        facets: &IndexMap<String, Vec<String>>,
        time: Option<&TimeRange>,
    ) -> Self {
        let mut must = Vec::new();
        let mut must_not = Vec::new();

        for (key, values) in facets {
            let field = key.to_lowercase().replace("_not_", "");
            let Some(search_field) = config.lookup.get(&field) else {
                continue;
            };
            let mut positive = Vec::new();
            let mut negative = Vec::new();
            for value in values {
                let (negated, value) = is_negated(key, value);
                let value = if field == "file" || field == "uri" {
                    value
                } else {
                    value.to_lowercase()
                };
                if negated {
                    negative.push(value);
                } else {
                    positive.push(value);
                }
            }
            if !positive.is_empty() {
                must.push(json!({"terms": {(search_field.as_str()): positive}}));
            }
            if !negative.is_empty() {
                must_not.push(json!({"terms": {(search_field.as_str()): negative}}));
            }
        }

        if let Some(range) = time {
            let time_min = config
                .lookup
                .get("time_min")
                .cloned()
                .unwrap_or_else(|| "time_min".to_string());
            let time_max = config
                .lookup
                .get("time_max")
                .cloned()
                .unwrap_or_else(|| "time_max".to_string());
            let start = range.start.format("%Y-%m-%dT%H:%M:%S").to_string();
            let end = range.end.format("%Y-%m-%dT%H:%M:%S").to_string();
            let condition = match range.method {
                SelectMethod::Flexible => json!({"bool": {"must": [
                    {"range": {(time_max.as_str()): {"gte": start}}},
                    {"range": {(time_min.as_str()): {"lte": end}}},
                ]}}),
                SelectMethod::Strict => json!({"bool": {"must": [
                    {"range": {(time_min.as_str()): {"lte": start}}},
                    {"range": {(time_max.as_str()): {"gte": end}}},
                ]}}),
                SelectMethod::File => json!({"bool": {"must": [
                    {"range": {(time_min.as_str()): {"gte": start}}},
                    {"range": {(time_max.as_str()): {"lte": end}}},
                ]}}),
            };
            must.push(condition);
        }

        let query = json!({"bool": {"must": must, "must_not": must_not}});

        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            lookup: config.lookup.clone(),
            fields: config.fields.clone(),
            uniq_key,
            query,
        }
    }

    pub(crate) fn fields(&self) -> Vec<String> {
        self.fields.clone()
    }

    async fn search(&self, body: Value) -> Result<(u16, Value), SearchError> {
        let url = format!("{}/{}/_search", self.url, self.index);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                tracing::error!(%error, url, "connection to search engine failed");
                SearchError::Upstream("Could not connect to search engine".to_string())
            })?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let detail = response.text().await.unwrap_or_default();
            return Ok((status, json!({"_error": detail})));
        }
        let body = response
            .json()
            .await
            .map_err(|e| SearchError::Internal(format!("malformed search-engine response: {e}")))?;
        Ok((status, body))
    }

    fn get_nested<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = source;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub(crate) async fn count(&self) -> Result<(u16, u64), SearchError> {
        let (status, body) = self
            .search(json!({"query": self.query, "size": 0, "track_total_hits": true}))
            .await?;
        let total = body["hits"]["total"]["value"].as_u64().unwrap_or(0);
        Ok((status, total))
    }

    pub(crate) async fn raw_facet_search(
        &self,
        fields: &[String],
        max_results: i64,
    ) -> Result<RawFacets, SearchError> {
        let mut aggs = serde_json::Map::new();
        for field in fields {
            if let Some(search_field) = self.lookup.get(field) {
                aggs.insert(
                    field.clone(),
                    json!({"terms": {"field": search_field, "size": 10000}}),
                );
            }
        }
        let body = json!({
            "query": self.query,
            "size": max_results.max(0),
            "track_total_hits": true,
            "aggs": aggs,
            "_source": self.lookup.values().collect::<Vec<_>>(),
        });
        let (status, body) = self.search(body).await?;
        let total = body["hits"]["total"]["value"].as_u64().unwrap_or(0);

        let mut facets = IndexMap::new();
        if let Some(map) = body["aggregations"].as_object() {
            for (field, agg) in map {
                let mut counts = Vec::new();
                for bucket in agg["buckets"].as_array().into_iter().flatten() {
                    if let Some(key) = bucket["key"].as_str() {
                        counts.push(Value::from(key));
                        counts.push(bucket["doc_count"].clone());
                    }
                }
                if !counts.is_empty() {
                    facets.insert(field.clone(), counts);
                }
            }
        }

        let mut docs = Vec::new();
        for hit in body["hits"]["hits"].as_array().into_iter().flatten() {
            let mut doc = Document::new();
            let uniq_field = self
                .lookup
                .get(self.uniq_key.as_str())
                .cloned()
                .unwrap_or_else(|| self.uniq_key.as_str().to_string());
            let uniq = Self::get_nested(&hit["_source"], &uniq_field)
                .cloned()
                .unwrap_or_default();
            doc.insert(self.uniq_key.as_str().to_string(), uniq);
            let fs_type = self
                .lookup
                .get("fs_type")
                .and_then(|f| Self::get_nested(&hit["_source"], f))
                .cloned()
                .unwrap_or_else(|| Value::from("posix"));
            doc.insert("fs_type".to_string(), fs_type);
            docs.push(doc);
        }

        Ok(RawFacets {
            status,
            total,
            facets,
            docs,
        })
    }

    /// `search_after` pagination on the stable `_id` sort.
    pub(crate) fn pages(
        &self,
        fields: PageFields,
    ) -> BoxStream<'static, Result<Document, SearchError>> {
        let this = self.clone();
        let wanted = page_field_list(fields, self.uniq_key);

        futures::stream::try_unfold(
            (None::<Value>, false),
            move |(after, done)| {
                let this = this.clone();
                let wanted = wanted.clone();
                async move {
                    if done {
                        return Ok(None);
                    }
                    let mut body = json!({
                        "query": this.query,
                        "size": BATCH_SIZE,
                        "sort": [{"_id": "asc"}],
                        "_source": this.lookup.values().collect::<Vec<_>>(),
                    });
                    if let Some(after) = &after {
                        body["search_after"] = json!([after]);
                    }
                    let (status, response) = this.search(body).await?;
                    if !(200..300).contains(&status) {
                        return Err(SearchError::Status(
                            status,
                            response["_error"]
                                .as_str()
                                .unwrap_or("search engine error")
                                .to_string(),
                        ));
                    }
                    let hits = response["hits"]["hits"].as_array().cloned().unwrap_or_default();
                    let mut docs = Vec::with_capacity(hits.len());
                    let mut next = after.clone();
                    for hit in &hits {
                        next = hit["sort"].as_array().and_then(|s| s.first().cloned());
                        let mut doc = Document::new();
                        for field in &wanted {
                            if let Some(search_field) = this.lookup.get(field) {
                                if let Some(value) =
                                    Self::get_nested(&hit["_source"], search_field)
                                {
                                    doc.insert(field.clone(), value.clone());
                                }
                            }
                        }
                        docs.push(doc);
                    }
                    let done = hits.len() < BATCH_SIZE || next.is_none();
                    Ok(Some((docs, (next, done))))
                }
            },
        )
        .map_ok(|docs| futures::stream::iter(docs.into_iter().map(Ok::<Document, SearchError>)))
        .try_flatten()
        .boxed()
    }
}
