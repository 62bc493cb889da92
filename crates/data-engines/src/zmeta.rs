//! Consolidated zarr metadata generation for an opened dataset.

use crate::{Dataset, Engine, EngineError};
use zarr_view::{
    encode_fill_value, CodecConfig, ZArray, ZMetadata, DIMENSION_KEY, ZARR_FORMAT,
};

/// Build the `.zmetadata` document for a dataset: the root `.zgroup` and
/// `.zattrs` plus per-variable `.zattrs`/`.zarray` entries.
pub fn create_zmetadata(dataset: &Dataset) -> Result<ZMetadata, EngineError> {
    let mut meta = ZMetadata::new();

    let mut group_attrs = serde_json::Map::new();
    for (key, value) in &dataset.attrs {
        group_attrs.insert(key.clone(), value.to_json());
    }
    meta.set_group_attrs(serde_json::Value::Object(group_attrs));

    for (name, variable) in &dataset.variables {
        // `_FillValue` belongs in `.zarray`, not in the attributes.
        let mut zattrs = serde_json::Map::new();
        for (key, value) in &variable.attrs {
            if key != "_FillValue" {
                zattrs.insert(key.clone(), value.to_json());
            }
        }
        zattrs.insert(
            DIMENSION_KEY.to_string(),
            serde_json::to_value(&variable.dims).expect("dims serialize"),
        );

        let chunks = variable.chunks();
        let zarray = ZArray {
            compressor: Some(CodecConfig::default_compressor()),
            filters: None,
            chunks: chunks.iter().map(|c| *c as u64).collect(),
            dtype: variable.dtype.zarr_str().to_string(),
            fill_value: encode_fill_value(variable.fill_value.as_ref()),
            order: "C".to_string(),
            shape: variable.shape.iter().map(|s| *s as u64).collect(),
            zarr_format: ZARR_FORMAT,
        };
        let inferred: Vec<u64> = variable.shape.iter().map(|s| *s as u64).collect();
        if zarray.chunks != inferred {
            return Err(EngineError::Parse {
                engine: Engine::Netcdf,
                path: dataset.path.clone(),
                reason: format!("encoding chunks do not match inferred chunks for {name}"),
            });
        }
        meta.insert_variable(name, serde_json::Value::Object(zattrs), &zarray);
    }
    Ok(meta)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{AttrValue, Attrs, Variable};
    use indexmap::IndexMap;
    use ndarray::Array;
    use zarr_view::{ArrayBuffer, DType, FillValue};

    fn sample_dataset() -> Dataset {
        let data = ArrayBuffer::F32(
            Array::from_iter((0..6).map(|v| v as f32))
                .into_shape_with_order((2, 3))
                .unwrap()
                .into_dyn(),
        );
        let mut attrs = Attrs::new();
        attrs.insert("units".to_string(), AttrValue::Str("K".to_string()));
        attrs.insert("_FillValue".to_string(), AttrValue::Float(1e20));
        let mut tas = Variable::in_memory("tas", &["lat", "lon"], attrs, data);
        tas.fill_value = Some(FillValue::Float(1e20));

        let mut variables = IndexMap::new();
        variables.insert("tas".to_string(), tas);
        let mut gattrs = Attrs::new();
        gattrs.insert("title".to_string(), AttrValue::Str("demo".to_string()));
        Dataset {
            path: "/demo.nc".to_string(),
            attrs: gattrs,
            dims: [("lat".to_string(), 2), ("lon".to_string(), 3)]
                .into_iter()
                .collect(),
            variables,
        }
    }

    #[test]
    fn metadata_covers_group_and_variables() {
        let meta = create_zmetadata(&sample_dataset()).unwrap();
        assert_eq!(
            meta.get(".zgroup"),
            Some(&serde_json::json!({"zarr_format": 2}))
        );
        assert_eq!(meta.get(".zattrs"), Some(&serde_json::json!({"title": "demo"})));

        let zattrs = meta.get("tas/.zattrs").unwrap();
        assert_eq!(zattrs["units"], "K");
        assert_eq!(zattrs[DIMENSION_KEY], serde_json::json!(["lat", "lon"]));
        assert!(zattrs.get("_FillValue").is_none());

        let zarray = meta.array_meta("tas").unwrap();
        assert_eq!(zarray.dtype, "<f4");
        assert_eq!(zarray.shape, vec![2, 3]);
        // Whole-variable chunking: the first chunk addresses everything.
        assert_eq!(zarray.chunks, zarray.shape);
        assert_eq!(zarray.fill_value, serde_json::json!(1e20));
        assert_eq!(zarray.dtype, DType::F32.zarr_str());
    }
}
