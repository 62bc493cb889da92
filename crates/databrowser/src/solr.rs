//! Apache Solr backend: native queries, facet counting and cursor-mark
//! pagination.

use crate::backend::{page_field_list, PageFields, RawFacets, SolrConfig, BATCH_SIZE};
use crate::constraints::{BBox, TimeRange};
use crate::lucene::join_facet_queries;
use crate::{Document, SearchError};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use models::{Translator, UniqKey, UNIQ_KEYS};

#[derive(Debug, Clone)]
pub struct SolrBackend {
    client: reqwest::Client,
    url: String,
    /// The assembled `fq` filters: time, bbox, user gate, facet terms.
    filters: Vec<String>,
    fields: Vec<String>,
    uniq_key: UniqKey,
    start: usize,
}

impl SolrBackend {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &SolrConfig,
        translator: &Translator,
        uniq_key: UniqKey,
        facets: &IndexMap<String, Vec<String>>,
        time: Option<&TimeRange>,
        bbox: Option<&BBox>,
        multi_version: bool,
        start: usize,
    ) -> Self {
        let core = if multi_version {
            &config.cores.0
        } else {
            &config.cores.1
        };
        let url = format!("{}/select/", config.core_url(core));

        let mut filters = Vec::new();
        if let Some(time) = time {
            filters.push(time.to_solr());
        }
        if let Some(bbox) = bbox {
            filters.push(bbox.to_solr());
        }
        // User-ingested documents are visible only under the `user` flavour.
        filters.push(if translator.flavour == "user" {
            "user:*".to_string()
        } else {
            "{!ex=userTag}-user:*".to_string()
        });

        let mut terms = Vec::new();
        for (key, values) in facets {
            let (positive, negative) = join_facet_queries(key, values, UNIQ_KEYS);
            let field = key.to_lowercase().replace("_not_", "");
            if !positive.is_empty() {
                terms.push(format!("{field}:({positive})"));
            }
            if !negative.is_empty() {
                terms.push(format!("-{field}:({negative})"));
            }
        }
        filters.push(if terms.is_empty() {
            "*:*".to_string()
        } else {
            terms.join(" AND ")
        });

        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            url,
            filters,
            fields: config.fields.clone(),
            uniq_key,
            start,
        }
    }

    pub(crate) fn fields(&self) -> Vec<String> {
        self.fields.clone()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(url = %self.url))]
    async fn select(
        &self,
        extra: Vec<(String, String)>,
    ) -> Result<(u16, serde_json::Value), SearchError> {
        let mut params: Vec<(String, String)> = vec![
            ("q".to_string(), "*:*".to_string()),
            ("wt".to_string(), "json".to_string()),
        ];
        for filter in &self.filters {
            params.push(("fq".to_string(), filter.clone()));
        }
        params.extend(extra);

        let response = self
            .client
            .get(&self.url)
            .query(&params)
            .send()
            .await
            .map_err(|error| {
                tracing::error!(%error, url = %self.url, "connection to Solr failed");
                SearchError::Upstream("Could not connect to Solr server".to_string())
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let detail = response.text().await.unwrap_or_default();
            // Malformed queries surface the index's own status; the body is
            // kept for the error detail while facets stay empty.
            return Ok((status, serde_json::json!({ "_error": detail })));
        }
        let body = response
            .json()
            .await
            .map_err(|e| SearchError::Internal(format!("malformed Solr response: {e}")))?;
        Ok((status, body))
    }

    pub(crate) async fn count(&self) -> Result<(u16, u64), SearchError> {
        let (status, body) = self
            .select(vec![
                ("rows".to_string(), "0".to_string()),
                ("fl".to_string(), "file,uri".to_string()),
            ])
            .await?;
        let total = body["response"]["numFound"].as_u64().unwrap_or(0);
        Ok((status, total))
    }

    pub(crate) async fn raw_facet_search(
        &self,
        fields: &[String],
        max_results: i64,
    ) -> Result<RawFacets, SearchError> {
        let mut params = vec![
            ("facet".to_string(), "true".to_string()),
            ("rows".to_string(), max_results.max(0).to_string()),
            ("start".to_string(), self.start.to_string()),
            ("facet.sort".to_string(), "index".to_string()),
            ("facet.mincount".to_string(), "1".to_string()),
            ("facet.limit".to_string(), "-1".to_string()),
            (
                "fl".to_string(),
                format!("{},fs_type", self.uniq_key.as_str()),
            ),
        ];
        for field in fields {
            params.push(("facet.field".to_string(), field.clone()));
        }

        let (status, body) = self.select(params).await?;
        let total = body["response"]["numFound"].as_u64().unwrap_or(0);

        let mut facets = IndexMap::new();
        if let Some(map) = body["facet_counts"]["facet_fields"].as_object() {
            for (key, counts) in map {
                facets.insert(key.clone(), counts.as_array().cloned().unwrap_or_default());
            }
        }
        let docs = body["response"]["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .filter_map(|d| d.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();

        Ok(RawFacets {
            status,
            total,
            facets,
            docs,
        })
    }

    /// Deep pagination with the cursor-mark protocol; the sort is stable and
    /// the stream ends when the cursor stops advancing.
    pub(crate) fn pages(
        &self,
        fields: PageFields,
    ) -> BoxStream<'static, Result<Document, SearchError>> {
        let this = self.clone();
        let fl = page_field_list(fields, self.uniq_key).join(",");

        futures::stream::try_unfold(
            ("*".to_string(), false),
            move |(cursor, done)| {
                let this = this.clone();
                let fl = fl.clone();
                async move {
                    if done {
                        return Ok(None);
                    }
                    let params = vec![
                        ("fl".to_string(), fl),
                        ("rows".to_string(), BATCH_SIZE.to_string()),
                        ("cursorMark".to_string(), cursor.clone()),
                        ("sort".to_string(), "file desc".to_string()),
                    ];
                    let (status, body) = this.select(params).await?;
                    if !(200..300).contains(&status) {
                        return Err(SearchError::Status(
                            status,
                            body["_error"].as_str().unwrap_or("Solr error").to_string(),
                        ));
                    }
                    let docs: Vec<Document> = body["response"]["docs"]
                        .as_array()
                        .map(|docs| {
                            docs.iter()
                                .filter_map(|d| d.as_object().cloned())
                                .collect()
                        })
                        .unwrap_or_default();
                    let next = body["nextCursorMark"]
                        .as_str()
                        .unwrap_or(&cursor)
                        .to_string();
                    let done = next == cursor || docs.is_empty();
                    Ok(Some((docs, (next, done))))
                }
            },
        )
        .map_ok(|docs| futures::stream::iter(docs.into_iter().map(Ok::<Document, SearchError>)))
        .try_flatten()
        .boxed()
    }
}
