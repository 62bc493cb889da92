use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One record per executed search, inserted into the doc-store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStat {
    pub metadata: QueryStatMetadata,
    /// Facet constraints with multi-values joined as `v1&v2&…`.
    pub query: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatMetadata {
    pub num_results: u64,
    pub flavour: String,
    pub uniq_key: String,
    pub server_status: u16,
    pub date: chrono::DateTime<chrono::Utc>,
}

impl QueryStat {
    pub fn new(
        num_results: u64,
        flavour: &str,
        uniq_key: &str,
        server_status: u16,
        facets: &IndexMap<String, Vec<String>>,
    ) -> Self {
        Self {
            metadata: QueryStatMetadata {
                num_results,
                flavour: flavour.to_string(),
                uniq_key: uniq_key.to_string(),
                server_status,
                date: chrono::Utc::now(),
            },
            query: facets
                .iter()
                .map(|(k, v)| (k.clone(), v.join("&")))
                .collect(),
        }
    }
}
