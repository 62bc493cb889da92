use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-facet value/count dictionary, flattened as alternating
/// `[v0, c0, v1, c1, …]` entries the way the index reports them.
pub type FacetCounts = IndexMap<String, Vec<Value>>;

/// Result of a metadata or extended search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub total_count: u64,
    pub facets: FacetCounts,
    pub search_results: Vec<serde_json::Map<String, Value>>,
    pub facet_mapping: IndexMap<String, String>,
    pub primary_facets: Vec<String>,
}

/// Answer of the overview endpoint: all flavours and their attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFlavours {
    pub flavours: Vec<String>,
    pub attributes: IndexMap<String, Vec<String>>,
}

/// Header object of an intake-esm catalogue. The `catalog_dict` array is
/// streamed after this header rather than held in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeHeader {
    pub esmcat_version: String,
    pub attributes: Vec<IntakeAttribute>,
    pub assets: IntakeAssets,
    pub id: String,
    pub description: String,
    pub title: String,
    pub last_updated: String,
    pub aggregation_control: AggregationControl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeAttribute {
    pub column_name: String,
    pub vocabulary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeAssets {
    pub column_name: String,
    pub format_column_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationControl {
    pub variable_column_name: String,
    pub groupby_attrs: Vec<String>,
    pub aggregations: Vec<IntakeAggregation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeAggregation {
    #[serde(rename = "type")]
    pub kind: String,
    pub attribute_name: String,
    pub options: serde_json::Map<String, Value>,
}
