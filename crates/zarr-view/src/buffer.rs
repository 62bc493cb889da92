use crate::dtype::DType;
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A typed, dynamically-dimensioned array holding one variable's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayBuffer {
    I8(ArrayD<i8>),
    U8(ArrayD<u8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! each_buffer {
    ($buf:expr, $arr:ident => $body:expr) => {
        match $buf {
            ArrayBuffer::I8($arr) => $body,
            ArrayBuffer::U8($arr) => $body,
            ArrayBuffer::I16($arr) => $body,
            ArrayBuffer::I32($arr) => $body,
            ArrayBuffer::I64($arr) => $body,
            ArrayBuffer::F32($arr) => $body,
            ArrayBuffer::F64($arr) => $body,
        }
    };
}

macro_rules! map_buffer {
    ($buf:expr, $arr:ident => $body:expr) => {
        match $buf {
            ArrayBuffer::I8($arr) => ArrayBuffer::I8($body),
            ArrayBuffer::U8($arr) => ArrayBuffer::U8($body),
            ArrayBuffer::I16($arr) => ArrayBuffer::I16($body),
            ArrayBuffer::I32($arr) => ArrayBuffer::I32($body),
            ArrayBuffer::I64($arr) => ArrayBuffer::I64($body),
            ArrayBuffer::F32($arr) => ArrayBuffer::F32($body),
            ArrayBuffer::F64($arr) => ArrayBuffer::F64($body),
        }
    };
}

impl ArrayBuffer {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayBuffer::I8(_) => DType::I8,
            ArrayBuffer::U8(_) => DType::U8,
            ArrayBuffer::I16(_) => DType::I16,
            ArrayBuffer::I32(_) => DType::I32,
            ArrayBuffer::I64(_) => DType::I64,
            ArrayBuffer::F32(_) => DType::F32,
            ArrayBuffer::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_buffer!(self, arr => arr.shape())
    }

    pub fn ndim(&self) -> usize {
        each_buffer!(self, arr => arr.ndim())
    }

    pub fn len(&self) -> usize {
        each_buffer!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract an axis-aligned region.
    pub fn slice(&self, ranges: &[Range<usize>]) -> ArrayBuffer {
        map_buffer!(self, arr => {
            arr.slice_each_axis(|ax| {
                let r = &ranges[ax.axis.index()];
                Slice::from(r.start as isize..r.end as isize)
            })
            .to_owned()
        })
    }

    /// Grow to `out_shape`, placing the data at the origin. Zarr leaves the
    /// contents of the padded region undefined; we zero it.
    pub fn pad_to(&self, out_shape: &[usize]) -> ArrayBuffer {
        if self.shape() == out_shape {
            return self.clone();
        }
        map_buffer!(self, arr => {
            let mut out = ArrayD::default(IxDyn(out_shape));
            out.slice_each_axis_mut(|ax| {
                Slice::from(0..arr.shape()[ax.axis.index()] as isize)
            })
            .assign(arr);
            out
        })
    }

    /// Raw little-endian bytes in C order.
    pub fn to_c_bytes(&self) -> Vec<u8> {
        fn bytes_of<T: Copy, const N: usize>(
            arr: &ArrayD<T>,
            to_le: impl Fn(T) -> [u8; N],
        ) -> Vec<u8> {
            let mut out = Vec::with_capacity(arr.len() * N);
            for v in arr.as_standard_layout().iter() {
                out.extend_from_slice(&to_le(*v));
            }
            out
        }
        match self {
            ArrayBuffer::I8(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::U8(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::I16(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::I32(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::I64(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::F32(arr) => bytes_of(arr, |v| v.to_le_bytes()),
            ArrayBuffer::F64(arr) => bytes_of(arr, |v| v.to_le_bytes()),
        }
    }

    /// Concatenate buffers of the same dtype along `axis`.
    pub fn concat(axis: usize, parts: &[ArrayBuffer]) -> Result<ArrayBuffer, ConcatError> {
        let Some(first) = parts.first() else {
            return Err(ConcatError::Empty);
        };
        if parts.iter().any(|p| p.dtype() != first.dtype()) {
            return Err(ConcatError::MixedDtypes);
        }
        macro_rules! concat_as {
            ($variant:ident) => {{
                let views: Vec<_> = parts
                    .iter()
                    .map(|p| match p {
                        ArrayBuffer::$variant(arr) => arr.view(),
                        _ => unreachable!("dtypes checked above"),
                    })
                    .collect();
                ndarray::concatenate(Axis(axis), &views)
                    .map(ArrayBuffer::$variant)
                    .map_err(|e| ConcatError::Shape(e.to_string()))
            }};
        }
        match first {
            ArrayBuffer::I8(_) => concat_as!(I8),
            ArrayBuffer::U8(_) => concat_as!(U8),
            ArrayBuffer::I16(_) => concat_as!(I16),
            ArrayBuffer::I32(_) => concat_as!(I32),
            ArrayBuffer::I64(_) => concat_as!(I64),
            ArrayBuffer::F32(_) => concat_as!(F32),
            ArrayBuffer::F64(_) => concat_as!(F64),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConcatError {
    #[error("nothing to concatenate")]
    Empty,
    #[error("cannot concatenate mixed dtypes")]
    MixedDtypes,
    #[error("incompatible shapes: {0}")]
    Shape(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn slice_and_pad() {
        let buf = ArrayBuffer::I32(array![[1, 2, 3], [4, 5, 6]].into_dyn());
        let part = buf.slice(&[0..2, 2..3]);
        assert_eq!(part.shape(), &[2, 1]);
        let padded = part.pad_to(&[2, 2]);
        assert_eq!(padded.shape(), &[2, 2]);
        // Origin keeps the data; the padded region is zeroed.
        assert_eq!(
            padded,
            ArrayBuffer::I32(array![[3, 0], [6, 0]].into_dyn())
        );
    }

    #[test]
    fn c_bytes_are_row_major_little_endian() {
        let buf = ArrayBuffer::I16(array![[1, 2], [3, 4]].into_dyn());
        assert_eq!(buf.to_c_bytes(), vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn concat_along_leading_axis() {
        let a = ArrayBuffer::F64(array![[1.0, 2.0]].into_dyn());
        let b = ArrayBuffer::F64(array![[3.0, 4.0]].into_dyn());
        let joined = ArrayBuffer::concat(0, &[a, b]).unwrap();
        assert_eq!(joined.shape(), &[2, 2]);

        let mixed = ArrayBuffer::concat(
            0,
            &[
                ArrayBuffer::I8(array![1i8].into_dyn()),
                ArrayBuffer::I16(array![1i16].into_dyn()),
            ],
        );
        assert!(mixed.is_err());
    }
}
