mod facets;
mod flavour;
mod load;
mod search;
mod share;
mod stats;
mod translate;

pub use facets::{
    canonical_facets, facet_hierarchy, Relevance, CORDEX_KEYS, SPECIAL_KEYS, UNIQ_KEYS,
};
pub use flavour::{suggest_flavours, CustomFlavour, Flavour, FlavourOwner, ParseFlavourError};
pub use load::{LoadState, LoadStatus};
pub use search::{
    AggregationControl, FacetCounts, IntakeAggregation, IntakeAssets, IntakeAttribute,
    IntakeHeader, SearchFlavours, SearchResult,
};
pub use share::{ShareRecord, ShareRequest, ShareResponse};
pub use stats::{QueryStat, QueryStatMetadata};
pub use translate::Translator;

use serde::{Deserialize, Serialize};

/// The identifier a search streams back per document: the file path or the
/// scheme-qualified URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqKey {
    File,
    Uri,
}

impl UniqKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            UniqKey::File => "file",
            UniqKey::Uri => "uri",
        }
    }
}

impl std::str::FromStr for UniqKey {
    type Err = ParseUniqKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(UniqKey::File),
            "uri" => Ok(UniqKey::Uri),
            other => Err(ParseUniqKeyError(other.to_string())),
        }
    }
}

impl std::fmt::Display for UniqKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("uniq_key must be `file` or `uri`, got {0:?}")]
pub struct ParseUniqKeyError(pub String);
