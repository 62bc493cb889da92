//! Reader for on-disk zarr v2 stores: consolidated or per-key JSON metadata
//! plus dot-joined chunk files below each variable directory.

use crate::{AttrValue, Attrs, Dataset, Engine, EngineError, VarSource, Variable};
use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn, Slice};
use std::path::Path;
use zarr_view::{ArrayBuffer, DType, FillValue, ZArray, DIMENSION_KEY, ZARRAY_JSON, ZATTRS_JSON};

fn parse_failure(path: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::Parse {
        engine: Engine::Zarr,
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn dtype_from_str(dtype: &str, dir: &Path) -> Result<DType, EngineError> {
    match dtype {
        "|i1" => Ok(DType::I8),
        "|u1" => Ok(DType::U8),
        "|S1" => Ok(DType::S1),
        "<i2" => Ok(DType::I16),
        "<i4" => Ok(DType::I32),
        "<i8" => Ok(DType::I64),
        "<f4" => Ok(DType::F32),
        "<f8" => Ok(DType::F64),
        other => Err(parse_failure(dir, format!("unsupported dtype {other:?}"))),
    }
}

fn attr_from_json(value: &serde_json::Value) -> AttrValue {
    match value {
        serde_json::Value::String(s) => AttrValue::Str(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() => AttrValue::Int(n.as_i64().unwrap()),
        serde_json::Value::Number(n) => AttrValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::Bool(b) => AttrValue::Int(*b as i64),
        serde_json::Value::Array(items) => {
            if items.iter().all(|v| v.as_i64().is_some()) {
                AttrValue::IntList(items.iter().filter_map(|v| v.as_i64()).collect())
            } else if items.iter().all(|v| v.as_f64().is_some()) {
                AttrValue::FloatList(items.iter().filter_map(|v| v.as_f64()).collect())
            } else {
                AttrValue::Str(value.to_string())
            }
        }
        other => AttrValue::Str(other.to_string()),
    }
}

fn read_json(path: &Path) -> Result<Option<serde_json::Value>, EngineError> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read(path).map_err(|e| EngineError::io(path, e))?;
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| parse_failure(path, e.to_string()))
}

fn attrs_of(value: Option<serde_json::Value>) -> Attrs {
    let mut attrs = IndexMap::new();
    if let Some(serde_json::Value::Object(map)) = value {
        for (key, raw) in map {
            attrs.insert(key, attr_from_json(&raw));
        }
    }
    attrs
}

pub(crate) fn open(dir: &Path) -> Result<Dataset, EngineError> {
    let mut global_attrs = attrs_of(read_json(&dir.join(ZATTRS_JSON))?);
    global_attrs.shift_remove(DIMENSION_KEY);

    let mut variables = IndexMap::new();
    let mut dims: IndexMap<String, usize> = IndexMap::new();

    let entries = std::fs::read_dir(dir).map_err(|e| EngineError::io(dir, e))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(ZARRAY_JSON).is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    for name in names {
        let var_dir = dir.join(&name);
        let zarray: ZArray = read_json(&var_dir.join(ZARRAY_JSON))?
            .ok_or_else(|| parse_failure(&var_dir, "missing .zarray"))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| parse_failure(&var_dir, e.to_string()))
            })?;
        let mut attrs = attrs_of(read_json(&var_dir.join(ZATTRS_JSON))?);

        let dtype = dtype_from_str(&zarray.dtype, &var_dir)?;
        let shape: Vec<usize> = zarray.shape.iter().map(|s| *s as usize).collect();
        let var_dims: Vec<String> = match attrs.shift_remove(DIMENSION_KEY) {
            Some(AttrValue::Str(one)) => vec![one],
            Some(AttrValue::IntList(_)) | Some(AttrValue::Int(_)) | Some(AttrValue::Float(_))
            | Some(AttrValue::FloatList(_)) | None => {
                // Fall back to positional dimension names.
                (0..shape.len()).map(|i| format!("dim_{i}")).collect()
            }
        };
        // _ARRAY_DIMENSIONS arrives as a JSON string list.
        let var_dims = if var_dims.len() == 1 && var_dims[0].starts_with('[') {
            serde_json::from_str::<Vec<String>>(&var_dims[0])
                .unwrap_or_else(|_| (0..shape.len()).map(|i| format!("dim_{i}")).collect())
        } else {
            var_dims
        };

        for (dim, size) in var_dims.iter().zip(&shape) {
            dims.entry(dim.clone()).or_insert(*size);
        }

        let fill_value = match (&dtype, &zarray.fill_value) {
            (_, serde_json::Value::Null) => None,
            (DType::F32 | DType::F64, v) => match v {
                serde_json::Value::String(s) if s == "NaN" => Some(FillValue::Float(f64::NAN)),
                serde_json::Value::String(s) if s == "Infinity" => {
                    Some(FillValue::Float(f64::INFINITY))
                }
                serde_json::Value::String(s) if s == "-Infinity" => {
                    Some(FillValue::Float(f64::NEG_INFINITY))
                }
                v => v.as_f64().map(FillValue::Float),
            },
            (_, v) => v.as_i64().map(FillValue::Int),
        };

        variables.insert(
            name.clone(),
            Variable {
                name,
                dims: var_dims,
                shape,
                dtype,
                attrs,
                fill_value,
                source: VarSource::ZarrStore {
                    dir: var_dir,
                    zarray,
                },
            },
        );
    }

    if variables.is_empty() {
        return Err(parse_failure(dir, "store holds no arrays"));
    }

    Ok(Dataset {
        path: dir.display().to_string(),
        attrs: global_attrs,
        dims,
        variables,
    })
}

pub(crate) fn read_variable(
    dir: &Path,
    name: &str,
    zarray: &ZArray,
) -> Result<ArrayBuffer, EngineError> {
    let shape: Vec<usize> = zarray.shape.iter().map(|s| *s as usize).collect();
    let chunks: Vec<usize> = zarray.chunks.iter().map(|s| *s as usize).collect();
    if shape.len() != chunks.len() {
        return Err(parse_failure(dir, "chunk rank does not match shape"));
    }
    let dtype = dtype_from_str(&zarray.dtype, dir)?;
    let grid = zarr_view::grid_shape(&shape, &chunks);

    let total: usize = grid.iter().product::<usize>().max(1);

    macro_rules! assemble {
        ($t:ty, $from_le:expr, $variant:ident) => {{
            let mut out: ArrayD<$t> = ArrayD::default(IxDyn(&shape));
            for lin in 0..total {
                let mut indices = vec![0usize; grid.len()];
                let mut rem = lin;
                for axis in (0..grid.len()).rev() {
                    indices[axis] = rem % grid[axis];
                    rem /= grid[axis];
                }
                let key = if indices.is_empty() {
                    "0".to_string()
                } else {
                    indices
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(".")
                };
                let chunk_path = dir.join(&key);
                if !chunk_path.is_file() {
                    // Absent chunks stay at the default value.
                    continue;
                }
                let raw = std::fs::read(&chunk_path).map_err(|e| EngineError::io(&chunk_path, e))?;
                let raw = match &zarray.compressor {
                    Some(codec) => codec.decode(&raw)?,
                    None => raw,
                };
                let elem = std::mem::size_of::<$t>();
                let expected: usize = chunks.iter().product::<usize>().max(1);
                if raw.len() < expected * elem {
                    return Err(parse_failure(&chunk_path, "chunk is truncated"));
                }
                let values: Vec<$t> = raw
                    .chunks_exact(elem)
                    .take(expected)
                    .map($from_le)
                    .collect();
                let chunk_arr = ArrayD::from_shape_vec(IxDyn(&chunks), values)
                    .map_err(|e| parse_failure(&chunk_path, e.to_string()))?;

                // Trim the chunk to the in-bounds region and place it.
                let mut dest = out.view_mut();
                let mut src = chunk_arr.view();
                for (axis, (&idx, &clen)) in indices.iter().zip(&chunks).enumerate() {
                    let start = idx * clen;
                    let stop = (start + clen).min(shape[axis]);
                    dest.slice_axis_inplace(
                        ndarray::Axis(axis),
                        Slice::from(start as isize..stop as isize),
                    );
                    src.slice_axis_inplace(
                        ndarray::Axis(axis),
                        Slice::from(0..(stop - start) as isize),
                    );
                }
                dest.assign(&src);
            }
            Ok(ArrayBuffer::$variant(out))
        }};
    }

    let _ = name;
    match dtype {
        DType::I8 => assemble!(i8, |b: &[u8]| b[0] as i8, I8),
        DType::U8 | DType::S1 => assemble!(u8, |b: &[u8]| b[0], U8),
        DType::I16 => assemble!(i16, |b: &[u8]| i16::from_le_bytes([b[0], b[1]]), I16),
        DType::I32 => assemble!(
            i32,
            |b: &[u8]| i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            I32
        ),
        DType::I64 => assemble!(
            i64,
            |b: &[u8]| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            I64
        ),
        DType::F32 => assemble!(
            f32,
            |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            F32
        ),
        DType::F64 => assemble!(
            f64,
            |b: &[u8]| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            F64
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zarr_view::CodecConfig;

    fn write_store(dir: &Path) {
        std::fs::write(dir.join(".zgroup"), r#"{"zarr_format": 2}"#).unwrap();
        std::fs::write(dir.join(".zattrs"), r#"{"title": "store"}"#).unwrap();

        let var_dir = dir.join("tas");
        std::fs::create_dir(&var_dir).unwrap();
        std::fs::write(
            var_dir.join(".zarray"),
            serde_json::json!({
                "compressor": {"id": "zlib", "level": 1},
                "filters": null,
                "chunks": [2, 2],
                "dtype": "<f8",
                "fill_value": "NaN",
                "order": "C",
                "shape": [2, 3],
                "zarr_format": 2,
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            var_dir.join(".zattrs"),
            r#"{"_ARRAY_DIMENSIONS": ["lat", "lon"], "units": "K"}"#,
        )
        .unwrap();

        let codec = CodecConfig::Zlib { level: 1 };
        // Chunk 0.0 covers columns 0..2, chunk 0.1 column 2 padded to 2.
        let chunk_00: Vec<u8> = [1.0f64, 2.0, 4.0, 5.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let chunk_01: Vec<u8> = [3.0f64, 0.0, 6.0, 0.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        std::fs::write(var_dir.join("0.0"), codec.encode(&chunk_00).unwrap()).unwrap();
        std::fs::write(var_dir.join("0.1"), codec.encode(&chunk_01).unwrap()).unwrap();
    }

    #[test]
    fn opens_store_and_reassembles_chunks() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path());

        let dset = open(dir.path()).unwrap();
        assert_eq!(dset.attrs.get("title"), Some(&AttrValue::Str("store".into())));
        assert_eq!(dset.dims.get("lon"), Some(&3));

        let tas = dset.variable("tas").unwrap();
        assert_eq!(tas.dims, vec!["lat", "lon"]);
        assert_eq!(tas.attrs.get("units"), Some(&AttrValue::Str("K".into())));

        let ArrayBuffer::F64(data) = tas.read().unwrap() else {
            panic!("expected f64 data")
        };
        assert_eq!(data[[0, 0]], 1.0);
        assert_eq!(data[[0, 2]], 3.0);
        assert_eq!(data[[1, 1]], 5.0);
        assert_eq!(data[[1, 2]], 6.0);
    }
}
