mod aggregate;
mod netcdf3;
mod zarr_store;
mod zmeta;

pub use aggregate::{aggregate, AggregationError, AggregationMode, AggregationOptions};
pub use netcdf3::VarLayout;
pub use zmeta::create_zmetadata;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zarr_view::{ArrayBuffer, DType, FillValue, ZArray};

/// Attribute values carried by datasets and variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
}

impl AttrValue {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("attribute values always serialize")
    }
}

pub type Attrs = IndexMap<String, AttrValue>;

/// The engine used to open a source file, chosen per file by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// NetCDF classic (CDF-1/CDF-2).
    Netcdf,
    /// HDF5-backed NetCDF-4; detected, not readable without bindings.
    H5netcdf,
    /// An on-disk zarr v2 store.
    Zarr,
    /// GRIB editions; detected, not readable without bindings.
    Rasterio,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to determine the format of {0}")]
    UnknownFormat(String),
    #[error("datasets of format {format:?} cannot be opened by this build")]
    Unsupported { format: Engine },
    #[error("malformed {engine:?} data in {path}: {reason}")]
    Parse {
        engine: Engine,
        path: String,
        reason: String,
    },
    #[error("no variable named {0:?}")]
    UnknownVariable(String),
    #[error("chunk decode failed: {0}")]
    Codec(#[from] zarr_view::CodecError),
}

impl EngineError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Where a variable's bytes come from. Serializable so a whole dataset can
/// be cached as a handle and reopened by key without re-detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarSource {
    Netcdf {
        path: PathBuf,
        layout: netcdf3::VarLayout,
    },
    ZarrStore {
        dir: PathBuf,
        zarray: ZArray,
    },
    /// Virtual concatenation produced by aggregation.
    Concat {
        axis: usize,
        parts: Vec<Variable>,
    },
    InMemory(ArrayBuffer),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub attrs: Attrs,
    pub fill_value: Option<FillValue>,
    pub source: VarSource,
}

impl Variable {
    pub fn in_memory(name: &str, dims: &[&str], attrs: Attrs, data: ArrayBuffer) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape: data.shape().to_vec(),
            dtype: data.dtype(),
            attrs,
            fill_value: None,
            source: VarSource::InMemory(data),
        }
    }

    /// Materialized views use whole-variable chunks, so the inferred chunk
    /// layout is the shape itself.
    pub fn chunks(&self) -> Vec<usize> {
        self.shape.clone()
    }

    /// Read the variable's full data.
    pub fn read(&self) -> Result<ArrayBuffer, EngineError> {
        match &self.source {
            VarSource::Netcdf { path, layout } => netcdf3::read_variable(path, layout),
            VarSource::ZarrStore { dir, zarray } => {
                zarr_store::read_variable(dir, &self.name, zarray)
            }
            VarSource::Concat { axis, parts } => {
                let buffers: Vec<ArrayBuffer> = parts
                    .iter()
                    .map(|p| p.read())
                    .collect::<Result<_, _>>()?;
                ArrayBuffer::concat(*axis, &buffers).map_err(|e| EngineError::Parse {
                    engine: Engine::Netcdf,
                    path: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            VarSource::InMemory(data) => Ok(data.clone()),
        }
    }
}

/// A dataset: attributes, dimensions and variables. Doubles as the cacheable
/// handle the worker stores under `<token>-dset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    pub attrs: Attrs,
    pub dims: IndexMap<String, usize>,
    pub variables: IndexMap<String, Variable>,
}

impl Dataset {
    pub fn variable(&self, name: &str) -> Result<&Variable, EngineError> {
        self.variables
            .get(name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))
    }

    pub fn data_var_names(&self) -> Vec<String> {
        // Data variables are everything that is not a dimension coordinate.
        self.variables
            .keys()
            .filter(|name| !self.dims.contains_key(*name))
            .cloned()
            .collect()
    }
}

/// Detect the engine for a path by content, not extension.
pub fn detect_engine(path: &Path) -> Result<Engine, EngineError> {
    if path.is_dir() {
        for marker in [".zmetadata", ".zgroup", ".zarray"] {
            if path.join(marker).is_file() {
                return Ok(Engine::Zarr);
            }
        }
        return Err(EngineError::UnknownFormat(path.display().to_string()));
    }
    let mut magic = [0u8; 8];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
        let n = file.read(&mut magic).map_err(|e| EngineError::io(path, e))?;
        if n < 4 {
            return Err(EngineError::UnknownFormat(path.display().to_string()));
        }
    }
    match &magic[..4] {
        [b'C', b'D', b'F', 1 | 2 | 5] => Ok(Engine::Netcdf),
        [0x89, b'H', b'D', b'F'] => Ok(Engine::H5netcdf),
        [b'G', b'R', b'I', b'B'] => Ok(Engine::Rasterio),
        _ => Err(EngineError::UnknownFormat(path.display().to_string())),
    }
}

/// Open a dataset with the engine its content calls for.
pub fn open_dataset(path: &str) -> Result<Dataset, EngineError> {
    let path = Path::new(path);
    match detect_engine(path)? {
        Engine::Netcdf => netcdf3::open(path),
        Engine::Zarr => zarr_store::open(path),
        format @ (Engine::H5netcdf | Engine::Rasterio) => {
            Err(EngineError::Unsupported { format })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detection_by_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();

        let nc = dir.path().join("a.nc");
        std::fs::write(&nc, b"CDF\x01\x00\x00\x00\x00").unwrap();
        assert_eq!(detect_engine(&nc).unwrap(), Engine::Netcdf);

        let h5 = dir.path().join("b.nc");
        std::fs::write(&h5, b"\x89HDF\r\n\x1a\n").unwrap();
        assert_eq!(detect_engine(&h5).unwrap(), Engine::H5netcdf);

        let grib = dir.path().join("c.grb");
        std::fs::write(&grib, b"GRIB\x00\x00\x00\x02").unwrap();
        assert_eq!(detect_engine(&grib).unwrap(), Engine::Rasterio);

        let store = dir.path().join("d.zarr");
        std::fs::create_dir(&store).unwrap();
        std::fs::write(store.join(".zgroup"), b"{\"zarr_format\": 2}").unwrap();
        assert_eq!(detect_engine(&store).unwrap(), Engine::Zarr);

        let junk = dir.path().join("e.bin");
        std::fs::write(&junk, b"not a dataset").unwrap();
        assert!(detect_engine(&junk).is_err());
    }

    #[test]
    fn unsupported_formats_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let h5 = dir.path().join("b.nc");
        std::fs::write(&h5, b"\x89HDF\r\n\x1a\n").unwrap();
        match open_dataset(h5.to_str().unwrap()) {
            Err(EngineError::Unsupported { format }) => assert_eq!(format, Engine::H5netcdf),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
