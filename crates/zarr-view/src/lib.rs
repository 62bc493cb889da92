mod buffer;
mod chunk;
mod codec;
mod dtype;
mod meta;

pub use buffer::{ArrayBuffer, ConcatError};
pub use chunk::{get_data_chunk, grid_shape, parse_chunk_id, ChunkError};
pub use codec::{encode_chunk, CodecConfig, CodecError};
pub use dtype::{encode_fill_value, DType, FillValue};
pub use meta::{
    ZArray, ZMetadata, DIMENSION_KEY, ZARRAY_JSON, ZARR_CONSOLIDATED_FORMAT, ZARR_FORMAT,
    ZATTRS_JSON, ZGROUP_JSON, ZMETADATA_KEY,
};
