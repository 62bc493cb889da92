use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The element types a materialized view can serve, with their zarr v2
/// dtype spellings. Multi-byte types are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    I8,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Single characters of NetCDF text variables.
    S1,
}

impl DType {
    pub fn zarr_str(&self) -> &'static str {
        match self {
            DType::I8 => "|i1",
            DType::U8 => "|u1",
            DType::I16 => "<i2",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
            DType::S1 => "|S1",
        }
    }

    pub fn size(&self) -> usize {
        match self {
            DType::I8 | DType::U8 | DType::S1 => 1,
            DType::I16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

/// A variable's fill value, prior to zarr encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FillValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    /// Datetimes, as their integer view.
    Time(i64),
}

/// Encode a fill value the way zarr v2 spells it in `.zarray`:
/// non-finite floats become the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`; bytes become standard-base64 ASCII; complex values a pair
/// of encoded reals; datetimes their `i8` view.
pub fn encode_fill_value(fill: Option<&FillValue>) -> Value {
    let Some(fill) = fill else {
        return Value::Null;
    };
    match fill {
        FillValue::Float(v) => {
            if v.is_nan() {
                Value::from("NaN")
            } else if *v == f64::INFINITY {
                Value::from("Infinity")
            } else if *v == f64::NEG_INFINITY {
                Value::from("-Infinity")
            } else {
                Value::from(*v)
            }
        }
        FillValue::Int(v) => Value::from(*v),
        FillValue::Bool(v) => Value::from(*v),
        FillValue::Complex(re, im) => Value::Array(vec![
            encode_fill_value(Some(&FillValue::Float(*re))),
            encode_fill_value(Some(&FillValue::Float(*im))),
        ]),
        FillValue::Bytes(v) => Value::from(base64::encode_config(v, base64::STANDARD)),
        FillValue::Time(v) => Value::from(*v),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_finite_floats_use_string_spellings() {
        assert_eq!(
            encode_fill_value(Some(&FillValue::Float(f64::NAN))),
            Value::from("NaN")
        );
        assert_eq!(
            encode_fill_value(Some(&FillValue::Float(f64::INFINITY))),
            Value::from("Infinity")
        );
        assert_eq!(
            encode_fill_value(Some(&FillValue::Float(f64::NEG_INFINITY))),
            Value::from("-Infinity")
        );
        assert_eq!(
            encode_fill_value(Some(&FillValue::Float(1.5))),
            Value::from(1.5)
        );
    }

    #[test]
    fn scalar_kinds_encode_natively() {
        assert_eq!(encode_fill_value(Some(&FillValue::Int(-7))), Value::from(-7));
        assert_eq!(
            encode_fill_value(Some(&FillValue::Bool(true))),
            Value::from(true)
        );
        assert_eq!(encode_fill_value(None), Value::Null);
        assert_eq!(
            encode_fill_value(Some(&FillValue::Time(86400))),
            Value::from(86400)
        );
    }

    #[test]
    fn complex_and_bytes_encodings() {
        assert_eq!(
            encode_fill_value(Some(&FillValue::Complex(f64::NAN, 2.0))),
            serde_json::json!(["NaN", 2.0])
        );
        assert_eq!(
            encode_fill_value(Some(&FillValue::Bytes(b"ab".to_vec()))),
            Value::from("YWI=")
        );
    }
}
