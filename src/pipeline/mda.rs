//! MDA array files: the recording input and the firings output.
//!
//! Layout: i32 type code, i32 bytes per entry, i32 dim count (negative means
//! the dims that follow are i64), the dims, then little-endian column-major
//! data.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::{Event, Firings, Recording};

#[derive(Debug, thiserror::Error)]
pub enum MdaError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("file ends inside the {0}")]
    Truncated(&'static str),
    #[error("unsupported data type code {0}")]
    UnsupportedType(i32),
    #[error("bad header: {0}")]
    BadHeader(String),
    #[error("unexpected shape {dims:?}: {reason}")]
    Shape { dims: Vec<usize>, reason: String },
}

const MAX_DIMS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    U8,
    F32,
    I16,
    I32,
    U16,
    F64,
    U32,
}

impl DataType {
    fn from_code(code: i32) -> Result<Self, MdaError> {
        Ok(match code {
            -2 => DataType::U8,
            -3 => DataType::F32,
            -4 => DataType::I16,
            -5 => DataType::I32,
            -6 => DataType::U16,
            -7 => DataType::F64,
            -8 => DataType::U32,
            other => return Err(MdaError::UnsupportedType(other)),
        })
    }

    fn code(self) -> i32 {
        match self {
            DataType::U8 => -2,
            DataType::F32 => -3,
            DataType::I16 => -4,
            DataType::I32 => -5,
            DataType::U16 => -6,
            DataType::F64 => -7,
            DataType::U32 => -8,
        }
    }

    fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 => 8,
        }
    }

    fn decode(self, b: &[u8]) -> f64 {
        match self {
            DataType::U8 => b[0] as f64,
            DataType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DataType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            DataType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DataType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            DataType::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            DataType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        }
    }
}

/// A decoded MDA array; values are widened to f64, column-major.
#[derive(Clone, Debug, PartialEq)]
pub struct MdaArray {
    pub dtype: DataType,
    pub dims: Vec<usize>,
    pub values: Vec<f64>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], MdaError> {
        let end = self.pos.checked_add(n).ok_or(MdaError::Truncated(what))?;
        let s = self.buf.get(self.pos..end).ok_or(MdaError::Truncated(what))?;
        self.pos = end;
        Ok(s)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, MdaError> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, MdaError> {
        let b = self.take(8, what)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }
}

pub fn parse_mda(bytes: &[u8]) -> Result<MdaArray, MdaError> {
    let mut cur = Cursor { buf: bytes, pos: 0 };

    let code = cur.i32("header")?;
    if code == -1 {
        return Err(MdaError::UnsupportedType(code));
    }
    let dtype = DataType::from_code(code)?;

    let bpe = cur.i32("header")?;
    if bpe as usize != dtype.size() || bpe <= 0 {
        return Err(MdaError::BadHeader(format!(
            "{bpe} bytes per entry for type code {code}"
        )));
    }

    let raw_ndims = cur.i32("header")?;
    let wide = raw_ndims < 0;
    let ndims = raw_ndims.unsigned_abs() as usize;
    if ndims == 0 || ndims > MAX_DIMS {
        return Err(MdaError::BadHeader(format!("{raw_ndims} dimensions")));
    }

    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        let d = if wide {
            cur.i64("dimensions")?
        } else {
            cur.i32("dimensions")? as i64
        };
        if d < 0 {
            return Err(MdaError::BadHeader(format!("negative dimension {d}")));
        }
        dims.push(d as usize);
    }

    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| MdaError::BadHeader(format!("dimensions {dims:?} overflow")))?;
    let data_len = count
        .checked_mul(dtype.size())
        .ok_or_else(|| MdaError::BadHeader(format!("dimensions {dims:?} overflow")))?;
    let data = cur.take(data_len, "data")?;
    if cur.pos != bytes.len() {
        return Err(MdaError::BadHeader(format!(
            "{} trailing bytes after data",
            bytes.len() - cur.pos
        )));
    }

    let values = data.chunks_exact(dtype.size()).map(|b| dtype.decode(b)).collect();
    Ok(MdaArray { dtype, dims, values })
}

pub fn read_mda(path: &Path) -> Result<MdaArray, MdaError> {
    let bytes = fs::read(path)?;
    parse_mda(&bytes)
}

pub fn write_mda<W: Write>(w: &mut W, dtype: DataType, dims: &[usize], values: &[f64]) -> io::Result<()> {
    let wide = dims.iter().any(|&d| d > i32::MAX as usize);
    w.write_all(&dtype.code().to_le_bytes())?;
    w.write_all(&(dtype.size() as i32).to_le_bytes())?;
    let nd = dims.len() as i32;
    w.write_all(&(if wide { -nd } else { nd }).to_le_bytes())?;
    for &d in dims {
        if wide {
            w.write_all(&(d as i64).to_le_bytes())?;
        } else {
            w.write_all(&(d as i32).to_le_bytes())?;
        }
    }
    for &v in values {
        match dtype {
            DataType::F32 => w.write_all(&(v as f32).to_le_bytes())?,
            DataType::F64 => w.write_all(&v.to_le_bytes())?,
            DataType::I16 => w.write_all(&(v as i16).to_le_bytes())?,
            DataType::I32 => w.write_all(&(v as i32).to_le_bytes())?,
            DataType::U8 => w.write_all(&[v as u8])?,
            DataType::U16 => w.write_all(&(v as u16).to_le_bytes())?,
            DataType::U32 => w.write_all(&(v as u32).to_le_bytes())?,
        }
    }
    Ok(())
}

fn write_file(path: &Path, dtype: DataType, dims: &[usize], values: &[f64]) -> io::Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    write_mda(&mut w, dtype, dims, values)?;
    w.flush()
}

/* =========================
   Timeseries (channels x timepoints)
   ========================= */

pub fn timeseries_from_array(arr: MdaArray, sample_rate: f64) -> Result<Recording, MdaError> {
    let (m, n) = match arr.dims.as_slice() {
        [n] => (1, *n),
        [m, n] => (*m, *n),
        _ => {
            return Err(MdaError::Shape {
                dims: arr.dims,
                reason: "timeseries must be 2-D (channels x timepoints)".into(),
            });
        }
    };
    if m == 0 || n == 0 {
        return Err(MdaError::Shape {
            dims: arr.dims,
            reason: "timeseries is empty".into(),
        });
    }

    let mut channels = vec![Vec::with_capacity(n); m];
    for (i, v) in arr.values.iter().enumerate() {
        channels[i % m].push(*v as f32);
    }
    Ok(Recording::new(sample_rate, channels))
}

pub fn read_timeseries(path: &Path, sample_rate: f64) -> Result<Recording, MdaError> {
    timeseries_from_array(read_mda(path)?, sample_rate)
}

pub fn write_timeseries(path: &Path, rec: &Recording) -> io::Result<()> {
    let m = rec.num_channels();
    let n = rec.num_timepoints();
    let mut values = Vec::with_capacity(m * n);
    for t in 0..n {
        for ch in &rec.channels {
            values.push(ch[t] as f64);
        }
    }
    write_file(path, DataType::F32, &[m, n], &values)
}

/* =========================
   Firings (3 x L: channel, time, label; all 1-based)
   ========================= */

pub fn firings_from_array(arr: MdaArray) -> Result<Firings, MdaError> {
    let (rows, count) = match arr.dims.as_slice() {
        [r, l] => (*r, *l),
        _ => {
            return Err(MdaError::Shape {
                dims: arr.dims,
                reason: "firings must be 2-D".into(),
            });
        }
    };
    if rows < 3 {
        return Err(MdaError::Shape {
            dims: arr.dims,
            reason: "firings need at least 3 rows".into(),
        });
    }

    let mut events = Vec::with_capacity(count);
    for j in 0..count {
        let col = &arr.values[j * rows..j * rows + 3];
        if col.iter().any(|v| !v.is_finite() || *v < 1.0) {
            return Err(MdaError::Shape {
                dims: arr.dims.clone(),
                reason: format!("event {j} has an invalid entry {col:?}"),
            });
        }
        events.push(Event {
            channel: col[0] as usize - 1,
            time: col[1] as usize - 1,
            label: col[2] as u32,
        });
    }
    Ok(Firings { events })
}

pub fn read_firings(path: &Path) -> Result<Firings, MdaError> {
    firings_from_array(read_mda(path)?)
}

pub fn write_firings<W: Write>(w: &mut W, firings: &Firings) -> io::Result<()> {
    let mut values = Vec::with_capacity(firings.events.len() * 3);
    for e in &firings.events {
        values.push((e.channel + 1) as f64);
        values.push((e.time + 1) as f64);
        values.push(e.label as f64);
    }
    write_mda(w, DataType::F64, &[3, firings.events.len()], &values)
}
