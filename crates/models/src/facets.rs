/// How prominently a facet is surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Primary,
    Secondary,
}

/// The canonical indexing vocabulary. Every flavour maps these names to its
/// own display names; searches are always assembled in this vocabulary.
pub fn canonical_facets() -> &'static [(&'static str, Relevance)] {
    use Relevance::*;
    &[
        ("project", Primary),
        ("product", Primary),
        ("institute", Primary),
        ("model", Primary),
        ("experiment", Primary),
        ("time_frequency", Primary),
        ("realm", Primary),
        ("variable", Primary),
        ("ensemble", Primary),
        ("time_aggregation", Primary),
        ("fs_type", Secondary),
        ("grid_label", Secondary),
        ("cmor_table", Secondary),
        ("driving_model", Secondary),
        ("format", Secondary),
        ("grid_id", Secondary),
        ("level_type", Secondary),
        ("rcm_name", Secondary),
        ("rcm_version", Secondary),
        ("dataset", Secondary),
        ("time", Secondary),
        ("bbox", Secondary),
        ("user", Secondary),
    ]
}

/// The keys that only make sense for CORDEX datasets. They are hidden from
/// the attribute listing of every other flavour.
pub const CORDEX_KEYS: &[&str] = &["rcm_name", "driving_model", "rcm_version"];

/// Keys accepted in queries beyond the flavour vocabulary.
pub const SPECIAL_KEYS: &[&str] = &["time_select", "bbox_select", "zarr_stream"];

pub const UNIQ_KEYS: &[&str] = &["file", "uri"];

/// The ordered facet hierarchy that defines a dataset, used when projecting
/// result documents into catalogue entries.
pub fn facet_hierarchy() -> &'static [&'static str] {
    &[
        "project",
        "product",
        "institute",
        "model",
        "experiment",
        "time_frequency",
        "realm",
        "variable",
        "ensemble",
        "cmor_table",
        "fs_type",
        "grid_label",
        "grid_id",
        "format",
    ]
}
