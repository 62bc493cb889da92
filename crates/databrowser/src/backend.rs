//! The three index backends behind one dispatch surface.

use crate::constraints::{BBox, TimeRange};
use crate::rdbms::RdbmsBackend;
use crate::search_engine::SearchEngineBackend;
use crate::solr::SolrBackend;
use crate::{Document, SearchError};
use futures::stream::BoxStream;
use indexmap::IndexMap;
use models::{SearchResult, Translator, UniqKey};

pub const BATCH_SIZE: usize = 150;

/// The canonical facet fields an index is expected to serve counts for.
pub fn default_fields() -> Vec<String> {
    models::canonical_facets()
        .iter()
        .map(|(k, _)| k.to_string())
        .filter(|k| k != "time" && k != "bbox")
        .collect()
}

#[derive(Debug, Clone)]
pub struct SolrConfig {
    pub host: String,
    pub port: u16,
    /// `(multi-version core, latest core)`.
    pub cores: (String, String),
    pub fields: Vec<String>,
}

impl SolrConfig {
    pub fn core_url(&self, core: &str) -> String {
        format!("http://{}:{}/solr/{core}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct RdbmsConfig {
    pub pool: sqlx::PgPool,
    pub table: String,
    pub pagination_column: String,
    /// canonical facet → column, plus `file`, `uri`, `time_min`, `time_max`.
    pub lookup: IndexMap<String, String>,
    pub fields: Vec<String>,
}

impl RdbmsConfig {
    pub fn default_lookup() -> IndexMap<String, String> {
        let mut lookup: IndexMap<String, String> = default_fields()
            .into_iter()
            .map(|k| (k.clone(), k))
            .collect();
        for key in ["file", "uri", "time_min", "time_max"] {
            lookup.insert(key.to_string(), key.to_string());
        }
        lookup
    }
}

#[derive(Clone)]
pub struct SearchEngineConfig {
    pub url: String,
    pub index: String,
    /// canonical facet → document field, plus `file`, `uri`, `time_min`,
    /// `time_max`.
    pub lookup: IndexMap<String, String>,
    pub fields: Vec<String>,
}

#[derive(Clone)]
pub enum IndexConfig {
    Solr(SolrConfig),
    Rdbms(RdbmsConfig),
    SearchEngine(SearchEngineConfig),
}

impl IndexConfig {
    pub fn fields(&self) -> &[String] {
        match self {
            IndexConfig::Solr(c) => &c.fields,
            IndexConfig::Rdbms(c) => &c.fields,
            IndexConfig::SearchEngine(c) => &c.fields,
        }
    }
}

/// Which fields a page stream should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFields {
    /// `file` and `uri` only, for line streams.
    UniqOnly,
    /// The uniq key plus the catalogue facet hierarchy.
    Catalogue,
}

/// Raw backend answer of a facet search, in canonical vocabulary.
pub(crate) struct RawFacets {
    pub status: u16,
    pub total: u64,
    pub facets: IndexMap<String, Vec<serde_json::Value>>,
    pub docs: Vec<Document>,
}

#[derive(Debug, Clone)]
pub enum Backend {
    Solr(SolrBackend),
    Rdbms(RdbmsBackend),
    SearchEngine(SearchEngineBackend),
}

impl Backend {
    pub(crate) fn build(
        config: &IndexConfig,
        translator: &Translator,
        uniq_key: UniqKey,
        facets: &IndexMap<String, Vec<String>>,
        time: Option<&TimeRange>,
        bbox: Option<&BBox>,
        multi_version: bool,
        start: usize,
    ) -> Backend {
        match config {
            IndexConfig::Solr(cfg) => Backend::Solr(SolrBackend::new(
                cfg,
                translator,
                uniq_key,
                facets,
                time,
                bbox,
                multi_version,
                start,
            )),
            IndexConfig::Rdbms(cfg) => {
                Backend::Rdbms(RdbmsBackend::new(cfg, uniq_key, facets, time))
            }
            IndexConfig::SearchEngine(cfg) => {
                Backend::SearchEngine(SearchEngineBackend::new(cfg, uniq_key, facets, time))
            }
        }
    }

    fn fields(&self) -> Vec<String> {
        match self {
            Backend::Solr(b) => b.fields(),
            Backend::Rdbms(b) => b.fields(),
            Backend::SearchEngine(b) => b.fields(),
        }
    }

    pub(crate) async fn count(&self) -> Result<(u16, u64), SearchError> {
        match self {
            Backend::Solr(b) => b.count().await,
            Backend::Rdbms(b) => b.count().await,
            Backend::SearchEngine(b) => b.count().await,
        }
    }

    /// Facet counts and a window of projected documents, with flavour
    /// translation applied in both directions.
    pub(crate) async fn facet_search(
        &self,
        translator: &Translator,
        requested: &[String],
        max_results: i64,
        multi_version: bool,
    ) -> Result<(u16, SearchResult), SearchError> {
        // `*` and `all` mean every configured field.
        let wanted: Vec<String> = requested
            .iter()
            .filter(|f| *f != "*" && *f != "all")
            .cloned()
            .collect();
        let mut canonical: Vec<String> = if wanted.is_empty() {
            self.fields()
        } else {
            translator.translate_facets(wanted.iter().map(String::as_str), true)
        };
        if multi_version {
            canonical.push("version".to_string());
        }

        let raw = match self {
            Backend::Solr(b) => b.raw_facet_search(&canonical, max_results).await?,
            Backend::Rdbms(b) => b.raw_facet_search(&canonical, max_results).await?,
            Backend::SearchEngine(b) => b.raw_facet_search(&canonical, max_results).await?,
        };

        let facet_mapping: IndexMap<String, String> = canonical
            .iter()
            .filter(|k| translator.forward_lookup().contains_key(*k))
            .map(|k| (k.clone(), translator.forward(k)))
            .collect();

        Ok((
            raw.status,
            SearchResult {
                total_count: raw.total,
                facets: translator.translate_query(raw.facets, false),
                search_results: raw.docs,
                facet_mapping,
                primary_facets: translator.primary_keys(),
            },
        ))
    }

    pub(crate) fn pages(
        &self,
        fields: PageFields,
    ) -> BoxStream<'static, Result<Document, SearchError>> {
        match self {
            Backend::Solr(b) => b.pages(fields),
            Backend::Rdbms(b) => b.pages(fields),
            Backend::SearchEngine(b) => b.pages(fields),
        }
    }
}

/// The field list a page stream selects.
pub(crate) fn page_field_list(fields: PageFields, uniq_key: UniqKey) -> Vec<String> {
    match fields {
        PageFields::UniqOnly => vec!["file".to_string(), "uri".to_string()],
        PageFields::Catalogue => {
            let mut list = vec![uniq_key.as_str().to_string()];
            list.extend(models::facet_hierarchy().iter().map(|f| f.to_string()));
            list
        }
    }
}
