use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A numcodecs-style codec configuration, serialized as its config dict
/// (`{"id": "zlib", "level": 1}`) in `.zarray` and `.zmetadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum CodecConfig {
    Zlib { level: u32 },
}

impl CodecConfig {
    /// The default compressor of materialized views.
    pub fn default_compressor() -> Self {
        CodecConfig::Zlib { level: 1 }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecConfig::Zlib { level } => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(*level),
                );
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecConfig::Zlib { .. } => {
                let mut decoder = flate2::read::ZlibDecoder::new(data);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown codec id {0:?}")]
    Unknown(String),
}

/// Run chunk bytes through the declared filters in order, then the
/// compressor: the zarr v2 chunk pipeline.
pub fn encode_chunk(
    chunk: Vec<u8>,
    filters: &[CodecConfig],
    compressor: Option<&CodecConfig>,
) -> Result<Vec<u8>, CodecError> {
    let mut data = chunk;
    for filter in filters {
        data = filter.encode(&data)?;
    }
    match compressor {
        Some(codec) => codec.encode(&data),
        None => Ok(data),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_dict_round_trips() {
        let codec = CodecConfig::default_compressor();
        let value = serde_json::to_value(&codec).unwrap();
        assert_eq!(value, serde_json::json!({"id": "zlib", "level": 1}));
        assert_eq!(serde_json::from_value::<CodecConfig>(value).unwrap(), codec);
    }

    #[test]
    fn zlib_round_trips_bytes() {
        let codec = CodecConfig::Zlib { level: 6 };
        let data = vec![7u8; 4096];
        let packed = codec.encode(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decode(&packed).unwrap(), data);
    }

    #[test]
    fn no_compressor_passes_through() {
        let data = vec![1u8, 2, 3];
        assert_eq!(encode_chunk(data.clone(), &[], None).unwrap(), data);
    }
}
