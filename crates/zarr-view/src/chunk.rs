use crate::buffer::ArrayBuffer;

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid chunk id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },
    #[error("chunk {id:?} is out of range for shape {shape:?}")]
    OutOfRange { id: String, shape: Vec<usize> },
}

/// Parse a dot-joined chunk id into per-dimension indices. Scalar arrays
/// address their single chunk as `"0"`.
pub fn parse_chunk_id(id: &str, ndim: usize) -> Result<Vec<usize>, ChunkError> {
    let indices: Vec<usize> = id
        .split('.')
        .map(|part| {
            part.parse().map_err(|_| ChunkError::InvalidId {
                id: id.to_string(),
                reason: format!("{part:?} is not an integer"),
            })
        })
        .collect::<Result<_, _>>()?;
    let expected = ndim.max(1);
    if indices.len() != expected {
        return Err(ChunkError::InvalidId {
            id: id.to_string(),
            reason: format!("expected {expected} indices, got {}", indices.len()),
        });
    }
    Ok(indices)
}

/// Number of chunks per dimension for a given array/chunk shape.
pub fn grid_shape(shape: &[usize], chunks: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .zip(chunks)
        .map(|(s, c)| if *c == 0 { 1 } else { (s + c - 1) / c })
        .collect()
}

/// Extract one chunk of `data`, padded to the full chunk shape when it is an
/// incomplete edge chunk. The contents of the padded region are undefined by
/// zarr v2.
pub fn get_data_chunk(
    data: &ArrayBuffer,
    chunk_id: &str,
    out_shape: &[usize],
) -> Result<ArrayBuffer, ChunkError> {
    let shape = data.shape().to_vec();
    let indices = parse_chunk_id(chunk_id, shape.len())?;

    if shape.is_empty() {
        return Ok(data.clone());
    }

    let mut ranges = Vec::with_capacity(shape.len());
    for ((&idx, &dim), &chunk) in indices.iter().zip(&shape).zip(out_shape) {
        let start = idx * chunk;
        if start >= dim {
            return Err(ChunkError::OutOfRange {
                id: chunk_id.to_string(),
                shape,
            });
        }
        ranges.push(start..(start + chunk).min(dim));
    }
    Ok(data.slice(&ranges).pad_to(out_shape))
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array;

    fn sample() -> ArrayBuffer {
        // 5 x 4, values 0..20
        ArrayBuffer::I32(
            Array::from_iter(0..20)
                .into_shape_with_order((5, 4))
                .unwrap()
                .into_dyn(),
        )
    }

    #[test]
    fn chunk_ids_parse() {
        assert_eq!(parse_chunk_id("0.1.2", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_chunk_id("0", 0).unwrap(), vec![0]);
        assert!(parse_chunk_id("0.x", 2).is_err());
        assert!(parse_chunk_id("0.1", 3).is_err());
    }

    #[test]
    fn grid_shape_rounds_up() {
        assert_eq!(grid_shape(&[5, 4], &[2, 4]), vec![3, 1]);
        assert_eq!(grid_shape(&[5, 4], &[5, 4]), vec![1, 1]);
    }

    #[test]
    fn whole_array_chunk_is_identity() {
        let data = sample();
        let chunk = get_data_chunk(&data, "0.0", &[5, 4]).unwrap();
        assert_eq!(chunk, data);
    }

    #[test]
    fn edge_chunks_are_padded_to_full_shape() {
        let data = sample();
        // Rows 4..5 remain, padded back up to 2 rows.
        let chunk = get_data_chunk(&data, "2.0", &[2, 4]).unwrap();
        assert_eq!(chunk.shape(), &[2, 4]);
        let ArrayBuffer::I32(arr) = &chunk else {
            panic!("dtype preserved")
        };
        assert_eq!(arr[[0, 0]], 16);
        // The padded row's contents are unspecified; only the shape matters.
    }

    #[test]
    fn out_of_range_chunks_are_rejected() {
        let data = sample();
        assert!(get_data_chunk(&data, "3.0", &[2, 4]).is_err());
    }
}
