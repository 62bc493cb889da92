//! Reader for the NetCDF classic formats (CDF-1 and CDF-2). The header is
//! parsed once into per-variable layouts; data reads seek straight to the
//! recorded offsets. All on-disk values are big-endian.

use crate::{AttrValue, Attrs, Dataset, Engine, EngineError, VarSource, Variable};
use byteorder::{BigEndian, ReadBytesExt};
use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use zarr_view::{ArrayBuffer, DType, FillValue};

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;

const NC_BYTE: u32 = 1;
const NC_CHAR: u32 = 2;
const NC_SHORT: u32 = 3;
const NC_INT: u32 = 4;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

/// Offsets and shape of one variable, resolved against the record count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarLayout {
    pub begin: u64,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub is_record: bool,
    /// Byte stride between records of the record block.
    pub rec_stride: u64,
    pub num_recs: usize,
}

struct Parser<R> {
    reader: R,
    path: String,
    version: u8,
}

impl<R: Read> Parser<R> {
    fn fail<T>(&self, reason: impl Into<String>) -> Result<T, EngineError> {
        Err(EngineError::Parse {
            engine: Engine::Netcdf,
            path: self.path.clone(),
            reason: reason.into(),
        })
    }

    fn io<T>(&self, source: std::io::Error) -> Result<T, EngineError> {
        Err(EngineError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        match self.reader.read_u32::<BigEndian>() {
            Ok(v) => Ok(v),
            Err(e) => self.io(e),
        }
    }

    fn offset(&mut self) -> Result<u64, EngineError> {
        if self.version >= 2 {
            match self.reader.read_u64::<BigEndian>() {
                Ok(v) => Ok(v),
                Err(e) => self.io(e),
            }
        } else {
            Ok(self.u32()? as u64)
        }
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, EngineError> {
        let mut buf = vec![0u8; n];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) => self.io(e),
        }
    }

    fn padding(&mut self, n: usize) -> Result<(), EngineError> {
        let pad = (4 - n % 4) % 4;
        if pad > 0 {
            self.bytes(pad)?;
        }
        Ok(())
    }

    fn name(&mut self) -> Result<String, EngineError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        self.padding(len)?;
        match String::from_utf8(raw) {
            Ok(name) => Ok(name),
            Err(_) => self.fail("name is not UTF-8"),
        }
    }

    /// A `dim_list`, `gatt_list` or `var_list` header: either ABSENT
    /// (two zero words) or the expected tag plus a count.
    fn list_header(&mut self, tag: u32) -> Result<usize, EngineError> {
        let seen = self.u32()?;
        let count = self.u32()? as usize;
        if seen == 0 && count == 0 {
            return Ok(0);
        }
        if seen != tag {
            return self.fail(format!("expected list tag {tag:#x}, found {seen:#x}"));
        }
        Ok(count)
    }

    fn attr_value(&mut self, nc_type: u32, nelems: usize) -> Result<AttrValue, EngineError> {
        let value = match nc_type {
            NC_CHAR => {
                let raw = self.bytes(nelems)?;
                self.padding(nelems)?;
                let text = String::from_utf8_lossy(&raw)
                    .trim_end_matches('\0')
                    .to_string();
                return Ok(AttrValue::Str(text));
            }
            NC_BYTE => {
                let raw = self.bytes(nelems)?;
                self.padding(nelems)?;
                AttrValue::IntList(raw.iter().map(|b| *b as i8 as i64).collect())
            }
            NC_SHORT => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(match self.reader.read_i16::<BigEndian>() {
                        Ok(v) => v as i64,
                        Err(e) => return self.io(e),
                    });
                }
                self.padding(nelems * 2)?;
                AttrValue::IntList(values)
            }
            NC_INT => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(match self.reader.read_i32::<BigEndian>() {
                        Ok(v) => v as i64,
                        Err(e) => return self.io(e),
                    });
                }
                AttrValue::IntList(values)
            }
            NC_FLOAT => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(match self.reader.read_f32::<BigEndian>() {
                        Ok(v) => v as f64,
                        Err(e) => return self.io(e),
                    });
                }
                AttrValue::FloatList(values)
            }
            NC_DOUBLE => {
                let mut values = Vec::with_capacity(nelems);
                for _ in 0..nelems {
                    values.push(match self.reader.read_f64::<BigEndian>() {
                        Ok(v) => v,
                        Err(e) => return self.io(e),
                    });
                }
                AttrValue::FloatList(values)
            }
            other => return self.fail(format!("unknown attribute type {other}")),
        };
        // Single-element numeric attributes collapse to scalars.
        Ok(match value {
            AttrValue::IntList(v) if v.len() == 1 => AttrValue::Int(v[0]),
            AttrValue::FloatList(v) if v.len() == 1 => AttrValue::Float(v[0]),
            other => other,
        })
    }

    fn attr_list(&mut self) -> Result<Attrs, EngineError> {
        let count = self.list_header(NC_ATTRIBUTE)?;
        let mut attrs = IndexMap::new();
        for _ in 0..count {
            let name = self.name()?;
            let nc_type = self.u32()?;
            let nelems = self.u32()? as usize;
            attrs.insert(name, self.attr_value(nc_type, nelems)?);
        }
        Ok(attrs)
    }
}

fn dtype_of(nc_type: u32) -> Option<DType> {
    match nc_type {
        NC_BYTE => Some(DType::I8),
        NC_CHAR => Some(DType::S1),
        NC_SHORT => Some(DType::I16),
        NC_INT => Some(DType::I32),
        NC_FLOAT => Some(DType::F32),
        NC_DOUBLE => Some(DType::F64),
        _ => None,
    }
}

fn fill_value_of(dtype: DType, attr: &AttrValue) -> Option<FillValue> {
    match (dtype, attr) {
        (DType::F32 | DType::F64, AttrValue::Float(v)) => Some(FillValue::Float(*v)),
        (DType::F32 | DType::F64, AttrValue::Int(v)) => Some(FillValue::Float(*v as f64)),
        (_, AttrValue::Int(v)) => Some(FillValue::Int(*v)),
        (_, AttrValue::Str(s)) => s.as_bytes().first().map(|b| FillValue::Int(*b as i64)),
        _ => None,
    }
}

pub(crate) fn open(path: &Path) -> Result<Dataset, EngineError> {
    let file = std::fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut parser = Parser {
        reader: BufReader::new(file),
        path: path.display().to_string(),
        version: 0,
    };

    let magic = parser.bytes(4)?;
    if &magic[..3] != b"CDF" {
        return parser.fail("missing CDF magic");
    }
    parser.version = magic[3];
    if parser.version > 2 {
        return parser.fail(format!(
            "CDF-{} is not a classic-format file",
            parser.version
        ));
    }

    let num_recs = parser.u32()? as usize;

    // Dimensions; a length of zero marks the record dimension.
    let dim_count = parser.list_header(NC_DIMENSION)?;
    let mut dim_names = Vec::with_capacity(dim_count);
    let mut dim_sizes = Vec::with_capacity(dim_count);
    let mut record_dim = None;
    for idx in 0..dim_count {
        let name = parser.name()?;
        let size = parser.u32()? as usize;
        if size == 0 {
            record_dim = Some(idx);
        }
        dim_names.push(name);
        dim_sizes.push(size);
    }

    let global_attrs = parser.attr_list()?;

    let var_count = parser.list_header(NC_VARIABLE)?;
    struct RawVar {
        name: String,
        dims: Vec<usize>,
        attrs: Attrs,
        dtype: DType,
        vsize: u64,
        begin: u64,
    }
    let mut raw_vars = Vec::with_capacity(var_count);
    for _ in 0..var_count {
        let name = parser.name()?;
        let ndims = parser.u32()? as usize;
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(parser.u32()? as usize);
        }
        let attrs = parser.attr_list()?;
        let nc_type = parser.u32()?;
        let vsize = parser.u32()? as u64;
        let begin = parser.offset()?;
        let Some(dtype) = dtype_of(nc_type) else {
            return parser.fail(format!("unknown variable type {nc_type}"));
        };
        raw_vars.push(RawVar {
            name,
            dims,
            attrs,
            dtype,
            vsize,
            begin,
        });
    }

    // The record stride covers one record of every record variable; a single
    // record variable is laid out without inter-record padding.
    let rec_stride: u64 = {
        let record_vars: Vec<&RawVar> = raw_vars
            .iter()
            .filter(|v| record_dim.is_some() && v.dims.first().copied() == record_dim)
            .collect();
        if record_vars.len() == 1 {
            let v = record_vars[0];
            let elems: u64 = v
                .dims
                .iter()
                .skip(1)
                .map(|d| dim_sizes[*d] as u64)
                .product();
            elems * v.dtype.size() as u64
        } else {
            record_vars.iter().map(|v| v.vsize).sum()
        }
    };

    let mut variables = IndexMap::new();
    for var in raw_vars {
        let is_record = record_dim.is_some() && var.dims.first().copied() == record_dim;
        let dims: Vec<String> = var.dims.iter().map(|d| dim_names[*d].clone()).collect();
        let shape: Vec<usize> = var
            .dims
            .iter()
            .map(|d| {
                if Some(*d) == record_dim {
                    num_recs
                } else {
                    dim_sizes[*d]
                }
            })
            .collect();
        let fill_value = var
            .attrs
            .get("_FillValue")
            .and_then(|attr| fill_value_of(var.dtype, attr));
        let layout = VarLayout {
            begin: var.begin,
            dtype: var.dtype,
            shape: shape.clone(),
            is_record,
            rec_stride,
            num_recs,
        };
        variables.insert(
            var.name.clone(),
            Variable {
                name: var.name,
                dims,
                shape,
                dtype: var.dtype,
                attrs: var.attrs,
                fill_value,
                source: VarSource::Netcdf {
                    path: path.to_path_buf(),
                    layout,
                },
            },
        );
    }

    let dims = dim_names
        .into_iter()
        .zip(dim_sizes)
        .map(|(name, size)| (name, if size == 0 { num_recs } else { size }))
        .collect();

    Ok(Dataset {
        path: path.display().to_string(),
        attrs: global_attrs,
        dims,
        variables,
    })
}

pub(crate) fn read_variable(path: &Path, layout: &VarLayout) -> Result<ArrayBuffer, EngineError> {
    let file = std::fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let elems: usize = layout.shape.iter().product::<usize>().max(1);
    let rec_elems: usize = layout.shape.iter().skip(1).product::<usize>().max(1);

    macro_rules! read_as {
        ($t:ty, $rd:expr, $variant:ident) => {{
            let mut values: Vec<$t> = Vec::with_capacity(elems);
            if layout.is_record {
                for rec in 0..layout.num_recs {
                    reader
                        .seek(SeekFrom::Start(layout.begin + rec as u64 * layout.rec_stride))
                        .map_err(|e| EngineError::io(path, e))?;
                    for _ in 0..rec_elems {
                        values.push($rd(&mut reader).map_err(|e| EngineError::io(path, e))?);
                    }
                }
            } else {
                reader
                    .seek(SeekFrom::Start(layout.begin))
                    .map_err(|e| EngineError::io(path, e))?;
                for _ in 0..elems {
                    values.push($rd(&mut reader).map_err(|e| EngineError::io(path, e))?);
                }
            }
            ArrayD::from_shape_vec(IxDyn(&layout.shape), values)
                .map(ArrayBuffer::$variant)
                .map_err(|e| EngineError::Parse {
                    engine: Engine::Netcdf,
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
        }};
    }

    match layout.dtype {
        DType::I8 => read_as!(i8, |r: &mut BufReader<_>| r.read_i8(), I8),
        DType::U8 | DType::S1 => read_as!(u8, |r: &mut BufReader<_>| r.read_u8(), U8),
        DType::I16 => read_as!(i16, |r: &mut BufReader<_>| r.read_i16::<BigEndian>(), I16),
        DType::I32 => read_as!(i32, |r: &mut BufReader<_>| r.read_i32::<BigEndian>(), I32),
        DType::I64 => read_as!(i64, |r: &mut BufReader<_>| r.read_i64::<BigEndian>(), I64),
        DType::F32 => read_as!(f32, |r: &mut BufReader<_>| r.read_f32::<BigEndian>(), F32),
        DType::F64 => read_as!(f64, |r: &mut BufReader<_>| r.read_f64::<BigEndian>(), F64),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Write;

    fn put_name(out: &mut Vec<u8>, name: &str) {
        out.write_u32::<BigEndian>(name.len() as u32).unwrap();
        out.extend_from_slice(name.as_bytes());
        let pad = (4 - name.len() % 4) % 4;
        out.extend(std::iter::repeat(0u8).take(pad));
    }

    /// A CDF-1 fixture: dims time (record), lat=2, lon=3; a global title;
    /// `tas(lat, lon)` float with units and _FillValue; `prc(time, lat, lon)`
    /// float spanning two records.
    fn header(begin_tas: u32, begin_prc: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"CDF\x01");
        out.write_u32::<BigEndian>(2).unwrap(); // numrecs

        // dim_list
        out.write_u32::<BigEndian>(NC_DIMENSION).unwrap();
        out.write_u32::<BigEndian>(3).unwrap();
        put_name(&mut out, "time");
        out.write_u32::<BigEndian>(0).unwrap();
        put_name(&mut out, "lat");
        out.write_u32::<BigEndian>(2).unwrap();
        put_name(&mut out, "lon");
        out.write_u32::<BigEndian>(3).unwrap();

        // gatt_list: title = "demo"
        out.write_u32::<BigEndian>(NC_ATTRIBUTE).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        put_name(&mut out, "title");
        out.write_u32::<BigEndian>(NC_CHAR).unwrap();
        out.write_u32::<BigEndian>(4).unwrap();
        out.extend_from_slice(b"demo");

        // var_list
        out.write_u32::<BigEndian>(NC_VARIABLE).unwrap();
        out.write_u32::<BigEndian>(2).unwrap();

        // tas(lat, lon): units = "K", _FillValue = 1e20f
        put_name(&mut out, "tas");
        out.write_u32::<BigEndian>(2).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        out.write_u32::<BigEndian>(2).unwrap();
        out.write_u32::<BigEndian>(NC_ATTRIBUTE).unwrap();
        out.write_u32::<BigEndian>(2).unwrap();
        put_name(&mut out, "units");
        out.write_u32::<BigEndian>(NC_CHAR).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        out.extend_from_slice(b"K\x00\x00\x00");
        put_name(&mut out, "_FillValue");
        out.write_u32::<BigEndian>(NC_FLOAT).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        out.write_f32::<BigEndian>(1e20).unwrap();
        out.write_u32::<BigEndian>(NC_FLOAT).unwrap();
        out.write_u32::<BigEndian>(24).unwrap(); // vsize
        out.write_u32::<BigEndian>(begin_tas).unwrap();

        // prc(time, lat, lon)
        put_name(&mut out, "prc");
        out.write_u32::<BigEndian>(3).unwrap();
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        out.write_u32::<BigEndian>(2).unwrap();
        out.write_u32::<BigEndian>(0).unwrap(); // ABSENT vatt_list
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(NC_FLOAT).unwrap();
        out.write_u32::<BigEndian>(24).unwrap(); // vsize of one record
        out.write_u32::<BigEndian>(begin_prc).unwrap();

        out
    }

    fn write_fixture(path: &Path) {
        let len = header(0, 0).len() as u32;
        let begin_tas = len;
        let begin_prc = len + 24;
        let mut out = header(begin_tas, begin_prc);
        for v in 0..6 {
            out.write_f32::<BigEndian>(v as f32).unwrap();
        }
        for rec in 0..2 {
            for v in 0..6 {
                out.write_f32::<BigEndian>((100 * rec + v) as f32).unwrap();
            }
        }
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&out).unwrap();
    }

    #[test]
    fn parses_header_and_reads_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.nc");
        write_fixture(&path);

        let dset = open(&path).unwrap();
        assert_eq!(dset.attrs.get("title"), Some(&AttrValue::Str("demo".into())));
        assert_eq!(dset.dims.get("time"), Some(&2));
        assert_eq!(dset.dims.get("lon"), Some(&3));

        let tas = dset.variable("tas").unwrap();
        assert_eq!(tas.dims, vec!["lat", "lon"]);
        assert_eq!(tas.shape, vec![2, 3]);
        assert_eq!(tas.dtype, DType::F32);
        assert_eq!(tas.fill_value, Some(FillValue::Float(1e20f32 as f64)));

        let ArrayBuffer::F32(data) = tas.read().unwrap() else {
            panic!("expected f32 data")
        };
        assert_eq!(data[[0, 0]], 0.0);
        assert_eq!(data[[1, 2]], 5.0);
    }

    #[test]
    fn cdf2_offsets_are_eight_bytes() {
        // A minimal 64-bit-offset file: one dimension, one variable.
        let mut out = Vec::new();
        out.extend_from_slice(b"CDF\x02");
        out.write_u32::<BigEndian>(0).unwrap(); // numrecs
        out.write_u32::<BigEndian>(NC_DIMENSION).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        put_name(&mut out, "lat");
        out.write_u32::<BigEndian>(2).unwrap();
        out.write_u32::<BigEndian>(0).unwrap(); // ABSENT gatt_list
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(NC_VARIABLE).unwrap();
        out.write_u32::<BigEndian>(1).unwrap();
        put_name(&mut out, "x");
        out.write_u32::<BigEndian>(1).unwrap();
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(0).unwrap(); // ABSENT vatt_list
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(NC_INT).unwrap();
        out.write_u32::<BigEndian>(8).unwrap(); // vsize
        let begin = out.len() as u64 + 8;
        out.write_u64::<BigEndian>(begin).unwrap();
        out.write_i32::<BigEndian>(7).unwrap();
        out.write_i32::<BigEndian>(9).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.nc");
        std::fs::write(&path, out).unwrap();

        let dset = open(&path).unwrap();
        let ArrayBuffer::I32(data) = dset.variable("x").unwrap().read().unwrap() else {
            panic!("expected i32 data")
        };
        assert_eq!(data[[0]], 7);
        assert_eq!(data[[1]], 9);
    }

    #[test]
    fn record_variables_span_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.nc");
        write_fixture(&path);

        let dset = open(&path).unwrap();
        let prc = dset.variable("prc").unwrap();
        assert_eq!(prc.shape, vec![2, 2, 3]);

        let ArrayBuffer::F32(data) = prc.read().unwrap() else {
            panic!("expected f32 data")
        };
        assert_eq!(data[[0, 0, 0]], 0.0);
        assert_eq!(data[[1, 0, 0]], 100.0);
        assert_eq!(data[[1, 1, 2]], 105.0);
    }
}
