use crate::codec::CodecConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ZARR_FORMAT: u8 = 2;
pub const ZARR_CONSOLIDATED_FORMAT: u8 = 1;
pub const ZGROUP_JSON: &str = ".zgroup";
pub const ZATTRS_JSON: &str = ".zattrs";
pub const ZARRAY_JSON: &str = ".zarray";
pub const ZMETADATA_KEY: &str = ".zmetadata";
/// xarray's dimension attribute on every variable's `.zattrs`.
pub const DIMENSION_KEY: &str = "_ARRAY_DIMENSIONS";

/// Per-variable zarr v2 array metadata, the `.zarray` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZArray {
    pub compressor: Option<CodecConfig>,
    pub filters: Option<Vec<CodecConfig>>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    pub fill_value: Value,
    pub order: String,
    pub shape: Vec<u64>,
    pub zarr_format: u8,
}

/// Consolidated metadata: the `.zmetadata` document holding the root
/// `.zgroup`/`.zattrs` and every variable's `.zattrs`/`.zarray`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZMetadata {
    pub zarr_consolidated_format: u8,
    pub metadata: IndexMap<String, Value>,
}

impl ZMetadata {
    pub fn new() -> Self {
        let mut metadata = IndexMap::new();
        metadata.insert(
            ZGROUP_JSON.to_string(),
            serde_json::json!({"zarr_format": ZARR_FORMAT}),
        );
        Self {
            zarr_consolidated_format: ZARR_CONSOLIDATED_FORMAT,
            metadata,
        }
    }

    pub fn set_group_attrs(&mut self, attrs: Value) {
        self.metadata.insert(ZATTRS_JSON.to_string(), attrs);
    }

    pub fn insert_variable(&mut self, name: &str, zattrs: Value, zarray: &ZArray) {
        self.metadata
            .insert(format!("{name}/{ZATTRS_JSON}"), zattrs);
        self.metadata.insert(
            format!("{name}/{ZARRAY_JSON}"),
            serde_json::to_value(zarray).expect("zarray always serializes"),
        );
    }

    /// Mark `group` as a zarr subgroup (aggregated stores).
    pub fn insert_group(&mut self, group: &str) {
        self.metadata.insert(
            format!("{group}/{ZGROUP_JSON}"),
            serde_json::json!({"zarr_format": ZARR_FORMAT}),
        );
    }

    /// Merge `other` under a group prefix, or at the root for `None`.
    pub fn absorb(&mut self, prefix: Option<&str>, other: ZMetadata) {
        for (key, value) in other.metadata {
            let key = match prefix {
                Some(prefix) => format!("{prefix}/{key}"),
                None => key,
            };
            self.metadata.insert(key, value);
        }
        if let Some(prefix) = prefix {
            self.metadata
                .entry(format!("{prefix}/{ZGROUP_JSON}"))
                .or_insert_with(|| serde_json::json!({"zarr_format": ZARR_FORMAT}));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The `.zarray` of one variable, `group/var` keys included.
    pub fn array_meta(&self, variable: &str) -> Option<ZArray> {
        let value = self.metadata.get(&format!("{variable}/{ZARRAY_JSON}"))?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn variables(&self) -> Vec<String> {
        self.metadata
            .keys()
            .filter_map(|k| k.strip_suffix(&format!("/{ZARRAY_JSON}")))
            .map(str::to_string)
            .collect()
    }
}

impl Default for ZMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_array() -> ZArray {
        ZArray {
            compressor: Some(CodecConfig::default_compressor()),
            filters: None,
            chunks: vec![2, 3],
            dtype: "<f4".to_string(),
            fill_value: Value::Null,
            order: "C".to_string(),
            shape: vec![2, 3],
            zarr_format: ZARR_FORMAT,
        }
    }

    #[test]
    fn consolidated_layout() {
        let mut meta = ZMetadata::new();
        meta.set_group_attrs(serde_json::json!({"title": "test"}));
        meta.insert_variable("tas", serde_json::json!({DIMENSION_KEY: ["y", "x"]}), &sample_array());

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["zarr_consolidated_format"], 1);
        assert_eq!(value["metadata"][".zgroup"]["zarr_format"], 2);
        assert!(value["metadata"]["tas/.zarray"].is_object());
        assert_eq!(meta.variables(), vec!["tas"]);
        assert_eq!(meta.array_meta("tas").unwrap(), sample_array());
    }

    #[test]
    fn absorb_prefixes_group_keys() {
        let mut inner = ZMetadata::new();
        inner.insert_variable("tas", serde_json::json!({}), &sample_array());

        let mut outer = ZMetadata::new();
        outer.absorb(Some("group0"), inner);

        assert!(outer.get("group0/tas/.zarray").is_some());
        assert_eq!(
            outer.get("group0/.zgroup"),
            Some(&serde_json::json!({"zarr_format": 2}))
        );
        assert_eq!(outer.array_meta("group0/tas").unwrap(), sample_array());
    }
}
