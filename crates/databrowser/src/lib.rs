mod backend;
mod constraints;
mod intake;
mod lucene;
mod rdbms;
mod search_engine;
mod solr;
mod stac;
mod userdata;

pub use backend::{
    default_fields, Backend, IndexConfig, PageFields, RdbmsConfig, SearchEngineConfig, SolrConfig,
};
pub use constraints::{BBox, SelectMethod, TimeRange};
pub use intake::{intake_header, IntakeCatalogue};
pub use lucene::{escape, join_facet_queries};
pub use rdbms::RdbmsBackend;
pub use search_engine::SearchEngineBackend;
pub use solr::SolrBackend;
pub use stac::StacCatalogue;
pub use userdata::{delete_user_metadata, ingest_user_metadata, userdata_id, UserMetadataItem};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use models::{SearchResult, Translator, UniqKey, UNIQ_KEYS};
use std::sync::Arc;

/// A result document, a loose JSON object in the index's vocabulary.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Search-plane errors carrying the HTTP status they map to at the edge.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Bad facet keys, unknown flavours and the like.
    #[error("{0}")]
    Validation(String),
    /// Malformed time/bbox constraints.
    #[error("{0}")]
    Constraint(String),
    /// The index cannot be reached.
    #[error("{0}")]
    Upstream(String),
    /// The index answered with a non-success status, surfaced as-is.
    #[error("{1}")]
    Status(u16, String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Internal(String),
}

impl SearchError {
    pub fn status(&self) -> u16 {
        match self {
            SearchError::Validation(_) => 422,
            SearchError::Constraint(_) | SearchError::Internal(_) => 500,
            SearchError::Upstream(_) => 503,
            SearchError::Status(code, _) => *code,
            SearchError::NotFound(_) => 404,
            SearchError::PayloadTooLarge(_) => 413,
        }
    }
}

/// The search core: a validated query bound to one index backend.
#[derive(Debug, Clone)]
pub struct DataBrowser {
    pub translator: Translator,
    pub uniq_key: UniqKey,
    /// Canonical-vocabulary constraints; negated keys keep their `_not_`
    /// suffix.
    pub facets: IndexMap<String, Vec<String>>,
    pub time: Option<TimeRange>,
    pub bbox: Option<BBox>,
    pub multi_version: bool,
    pub start: usize,
    backend: Backend,
}

impl DataBrowser {
    /// Validate raw query parameters against the flavour vocabulary and
    /// build the search. Every inbound key, with `_not_` stripped and
    /// lower-cased, must be a known facet or special key.
    pub fn validate_parameters(
        config: &IndexConfig,
        translator: Translator,
        uniq_key: UniqKey,
        start: usize,
        multi_version: bool,
        query: &[(String, String)],
    ) -> Result<Self, SearchError> {
        let valid = translator.valid_facets();

        let mut facets: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut time = String::new();
        let mut time_select = "flexible".to_string();
        let mut bbox = String::new();
        let mut bbox_select = "flexible".to_string();

        for (key, value) in query {
            let lowered = key.to_lowercase();
            match lowered.as_str() {
                "time" => time = value.clone(),
                "time_select" => time_select = value.clone(),
                "bbox" => bbox = value.clone(),
                "bbox_select" => bbox_select = value.clone(),
                "zarr_stream" => {}
                _ => {
                    let stripped = lowered.replace("_not_", "");
                    let known = valid.contains(&stripped)
                        || UNIQ_KEYS.contains(&stripped.as_str())
                        || (multi_version && stripped == "version");
                    if !known {
                        return Err(SearchError::Validation(
                            "Could not validate input.".to_string(),
                        ));
                    }
                    let canonical = translator.backward(&stripped);
                    let facet_key = if lowered.contains("_not_") {
                        format!("{canonical}_not_")
                    } else {
                        canonical
                    };
                    facets.entry(facet_key).or_default().push(value.clone());
                }
            }
        }

        let time = TimeRange::parse(&time, &time_select)?;
        let bbox = BBox::parse(&bbox, &bbox_select)?;

        let backend = Backend::build(
            config,
            &translator,
            uniq_key,
            &facets,
            time.as_ref(),
            bbox.as_ref(),
            multi_version,
            start,
        );

        Ok(Self {
            translator,
            uniq_key,
            facets,
            time,
            bbox,
            multi_version,
            start,
            backend,
        })
    }

    /// Total hit count, for streaming endpoints.
    pub async fn init_stream(&self) -> Result<(u16, u64), SearchError> {
        self.backend.count().await
    }

    /// Facet counts plus a page of projected result documents.
    pub async fn extended_search(
        &self,
        facets: &[String],
        max_results: i64,
    ) -> Result<(u16, SearchResult), SearchError> {
        self.backend
            .facet_search(&self.translator, facets, max_results, self.multi_version)
            .await
    }

    /// The intake catalogue header and total count.
    pub async fn init_intake_catalogue(&self) -> Result<(u16, IntakeCatalogue), SearchError> {
        let (status, total) = self.backend.count().await?;
        let facet_counts = self
            .backend
            .facet_search(&self.translator, &[], 0, false)
            .await?
            .1
            .facets;
        let present: Vec<String> = models::facet_hierarchy()
            .iter()
            .filter(|facet| {
                facet_counts
                    .get(&self.translator.forward(facet))
                    .map(|counts| !counts.is_empty())
                    .unwrap_or(false)
            })
            .map(|facet| self.translator.forward(facet))
            .collect();
        let header = intake::intake_header(&self.translator, self.uniq_key, &present);
        Ok((
            status,
            IntakeCatalogue {
                catalogue: header,
                total_count: total,
            },
        ))
    }

    /// Cursor-paginated result documents.
    pub fn stream_documents(
        &self,
        fields: PageFields,
    ) -> BoxStream<'static, Result<Document, SearchError>> {
        self.backend.pages(fields)
    }

    /// The `data-search` stream: one uniq-key value per line.
    pub fn stream_response(&self) -> BoxStream<'static, Result<Bytes, SearchError>> {
        let uniq_key = self.uniq_key;
        self.stream_documents(PageFields::UniqOnly)
            .map(move |doc| {
                let doc = doc?;
                let value = doc
                    .get(uniq_key.as_str())
                    .map(render_scalar)
                    .unwrap_or_default();
                Ok(Bytes::from(format!("{value}\n")))
            })
            .boxed()
    }

    /// Stream the intake catalogue: the header object, then the
    /// `catalog_dict` array entry by entry.
    pub fn intake_catalogue(
        &self,
        catalogue: IntakeCatalogue,
    ) -> BoxStream<'static, Result<Bytes, SearchError>> {
        intake::stream_catalogue(
            catalogue,
            self.stream_documents(PageFields::Catalogue),
            self.uniq_key,
            None,
        )
    }

    /// Stream zarr endpoint URLs, plain or as an intake catalogue whose
    /// assets point at the zarr endpoints.
    pub fn zarr_response(
        &self,
        catalogue: Option<IntakeCatalogue>,
        to_url: Arc<dyn Fn(&str) -> String + Send + Sync>,
    ) -> BoxStream<'static, Result<Bytes, SearchError>> {
        let uniq_key = self.uniq_key;
        match catalogue {
            Some(catalogue) => intake::stream_catalogue(
                catalogue,
                self.stream_documents(PageFields::Catalogue),
                uniq_key,
                Some(to_url),
            ),
            None => self
                .stream_documents(PageFields::UniqOnly)
                .map(move |doc| {
                    let doc = doc?;
                    let value = doc
                        .get(uniq_key.as_str())
                        .map(render_scalar)
                        .unwrap_or_default();
                    Ok(Bytes::from(format!("{}\n", to_url(&value))))
                })
                .boxed(),
        }
    }

    /// Facet constraints for the statistics record.
    pub fn stats_facets(&self) -> IndexMap<String, Vec<String>> {
        self.facets.clone()
    }
}

/// Render a document field that may be a scalar or a single-element list.
pub(crate) fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) if items.len() == 1 => render_scalar(&items[0]),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Flavour;

    fn config() -> IndexConfig {
        IndexConfig::Solr(SolrConfig {
            host: "localhost".to_string(),
            port: 8983,
            cores: ("files".to_string(), "latest".to_string()),
            fields: default_fields(),
        })
    }

    fn browse(query: &[(&str, &str)]) -> Result<DataBrowser, SearchError> {
        let query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DataBrowser::validate_parameters(
            &config(),
            Translator::builtin(Flavour::Cmip6, true),
            UniqKey::Uri,
            0,
            false,
            &query,
        )
    }

    #[test]
    fn display_keys_translate_backwards() {
        let search = browse(&[("activity_id", "cmip"), ("variable_id", "tas")]).unwrap();
        assert_eq!(search.facets.get("product"), Some(&vec!["cmip".to_string()]));
        assert_eq!(search.facets.get("variable"), Some(&vec!["tas".to_string()]));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = browse(&[("activity_", "cmip")]).unwrap_err();
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn version_needs_multi_version() {
        assert_eq!(browse(&[("version", "v1")]).unwrap_err().status(), 422);
        let query = vec![("version".to_string(), "v1".to_string())];
        let search = DataBrowser::validate_parameters(
            &config(),
            Translator::builtin(Flavour::Cmip6, true),
            UniqKey::File,
            0,
            true,
            &query,
        );
        assert!(search.is_ok());
    }

    #[test]
    fn negated_keys_keep_their_suffix() {
        let search = browse(&[("activity_id_not_", "cmip")]).unwrap();
        assert_eq!(
            search.facets.get("product_not_"),
            Some(&vec!["cmip".to_string()])
        );
    }

    #[test]
    fn special_keys_parse_into_constraints() {
        let search = browse(&[
            ("time", "1990 to 2000"),
            ("time_select", "strict"),
            ("bbox", "0,10,0,10"),
        ])
        .unwrap();
        assert_eq!(search.time.as_ref().unwrap().method, SelectMethod::Strict);
        assert_eq!(search.bbox.as_ref().unwrap().max_lon, 10.0);
    }
}
