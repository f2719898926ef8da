//! Minimal NumPy `.npy` codec for run artifacts.
//!
//! Result buffers, loss curves and snapshot tensors are exchanged with the
//! analysis side as little-endian `f32` arrays in NumPy format version 1.
//! Only that subset is implemented here.

use std::fs;
use std::path::Path;

use ndarray::{Array2, Array3, ArrayD, IxDyn};
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("not a NumPy file: bad magic bytes")]
    BadMagic,

    #[error("unsupported npy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("unsupported dtype {0:?}, expected '<f4'")]
    UnsupportedDtype(String),

    #[error("fortran_order arrays are not supported")]
    FortranOrder,

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("payload holds {actual} values, header shape wants {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("expected a {expected}-d array, file holds {actual}-d")]
    RankMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize `data` (C order) with the given shape to `path`.
pub fn write(path: &Path, shape: &[usize], data: &[f32]) -> Result<(), NpyError> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(NpyError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }

    let shape_repr = match shape.len() {
        1 => format!("({},)", shape[0]),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}",
        shape_repr
    );
    // Pad with spaces so the payload starts on a 64-byte boundary, newline last.
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(pad));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + data.len() * 4);
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path, out)?;
    Ok(())
}

pub fn write_2d(path: &Path, array: &Array2<f32>) -> Result<(), NpyError> {
    let data: Vec<f32> = array.iter().copied().collect();
    write(path, &[array.nrows(), array.ncols()], &data)
}

pub fn write_3d(path: &Path, array: &Array3<f32>) -> Result<(), NpyError> {
    let shape = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    write(path, &shape, &data)
}

/// Deserialize a little-endian `f32` array of any rank.
pub fn read(path: &Path) -> Result<(Vec<usize>, Vec<f32>), NpyError> {
    let raw = fs::read(path)?;
    if raw.len() < 10 || &raw[..6] != MAGIC {
        return Err(NpyError::BadMagic);
    }
    let (major, minor) = (raw[6], raw[7]);
    let (header_len, header_off) = match major {
        1 => (u16::from_le_bytes([raw[8], raw[9]]) as usize, 10),
        2 => {
            if raw.len() < 12 {
                return Err(NpyError::MalformedHeader("truncated v2 length".into()));
            }
            (
                u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize,
                12,
            )
        }
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };
    let body_off = header_off + header_len;
    if raw.len() < body_off {
        return Err(NpyError::MalformedHeader("truncated header".into()));
    }
    let header = std::str::from_utf8(&raw[header_off..body_off])
        .map_err(|_| NpyError::MalformedHeader("header is not utf-8".into()))?;

    let descr = extract_quoted(header, "descr")?;
    if descr != "<f4" {
        return Err(NpyError::UnsupportedDtype(descr));
    }
    if extract_flag(header, "fortran_order")? {
        return Err(NpyError::FortranOrder);
    }
    let shape = extract_shape(header)?;

    let expected: usize = shape.iter().product();
    let body = &raw[body_off..];
    if body.len() < expected * 4 {
        return Err(NpyError::LengthMismatch {
            expected,
            actual: body.len() / 4,
        });
    }
    let data = body[..expected * 4]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((shape, data))
}

pub fn read_2d(path: &Path) -> Result<Array2<f32>, NpyError> {
    let (shape, data) = read(path)?;
    if shape.len() != 2 {
        return Err(NpyError::RankMismatch {
            expected: 2,
            actual: shape.len(),
        });
    }
    Array2::from_shape_vec((shape[0], shape[1]), data)
        .map_err(|e| NpyError::MalformedHeader(e.to_string()))
}

pub fn read_3d(path: &Path) -> Result<Array3<f32>, NpyError> {
    let (shape, data) = read(path)?;
    if shape.len() != 3 {
        return Err(NpyError::RankMismatch {
            expected: 3,
            actual: shape.len(),
        });
    }
    Array3::from_shape_vec((shape[0], shape[1], shape[2]), data)
        .map_err(|e| NpyError::MalformedHeader(e.to_string()))
}

pub fn read_dyn(path: &Path) -> Result<ArrayD<f32>, NpyError> {
    let (shape, data) = read(path)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| NpyError::MalformedHeader(e.to_string()))
}

fn extract_quoted(header: &str, key: &str) -> Result<String, NpyError> {
    let tag = format!("'{}':", key);
    let start = header
        .find(&tag)
        .ok_or_else(|| NpyError::MalformedHeader(format!("missing '{}'", key)))?;
    let rest = &header[start + tag.len()..];
    let open = rest
        .find('\'')
        .ok_or_else(|| NpyError::MalformedHeader(format!("unquoted '{}'", key)))?;
    let rest = &rest[open + 1..];
    let close = rest
        .find('\'')
        .ok_or_else(|| NpyError::MalformedHeader(format!("unterminated '{}'", key)))?;
    Ok(rest[..close].to_string())
}

fn extract_flag(header: &str, key: &str) -> Result<bool, NpyError> {
    let tag = format!("'{}':", key);
    let start = header
        .find(&tag)
        .ok_or_else(|| NpyError::MalformedHeader(format!("missing '{}'", key)))?;
    let rest = header[start + tag.len()..].trim_start();
    if rest.starts_with("True") {
        Ok(true)
    } else if rest.starts_with("False") {
        Ok(false)
    } else {
        Err(NpyError::MalformedHeader(format!("bad flag '{}'", key)))
    }
}

fn extract_shape(header: &str) -> Result<Vec<usize>, NpyError> {
    let start = header
        .find("'shape':")
        .ok_or_else(|| NpyError::MalformedHeader("missing 'shape'".into()))?;
    let rest = &header[start..];
    let open = rest
        .find('(')
        .ok_or_else(|| NpyError::MalformedHeader("shape is not a tuple".into()))?;
    let rest = &rest[open + 1..];
    let close = rest
        .find(')')
        .ok_or_else(|| NpyError::MalformedHeader("unterminated shape".into()))?;
    rest[..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| NpyError::MalformedHeader(format!("bad dimension {:?}", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn round_trips_a_2d_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.npy");
        let grid = array![[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        write_2d(&path, &grid).unwrap();
        let back = read_2d(&path).unwrap();
        assert_eq!(back, grid);
    }

    #[test]
    fn round_trips_a_1d_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("row.npy");
        write(&path, &[4], &[0.5, -1.25, 3.0, 7.5]).unwrap();
        let (shape, data) = read(&path).unwrap();
        assert_eq!(shape, vec![4]);
        assert_eq!(data, vec![0.5, -1.25, 3.0, 7.5]);
    }

    #[test]
    fn payload_starts_on_a_64_byte_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.npy");
        write(&path, &[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let raw = std::fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([raw[8], raw[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(raw[10 + header_len - 1], b'\n');
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.npy");
        std::fs::write(&path, b"not numpy at all").unwrap();
        assert!(matches!(read(&path), Err(NpyError::BadMagic)));
    }

    #[test]
    fn rejects_foreign_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f8.npy");
        let mut header =
            String::from("{'descr': '<f8', 'fortran_order': False, 'shape': (1,), }");
        let pad = (64 - (10 + header.len() + 1) % 64) % 64;
        header.extend(std::iter::repeat(' ').take(pad));
        header.push('\n');
        let mut raw = Vec::new();
        raw.extend_from_slice(MAGIC);
        raw.extend_from_slice(&[1, 0]);
        raw.extend_from_slice(&(header.len() as u16).to_le_bytes());
        raw.extend_from_slice(header.as_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(read(&path), Err(NpyError::UnsupportedDtype(_))));
    }

    #[test]
    fn rank_checked_readers_reject_mismatched_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("row.npy");
        write(&path, &[3], &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            read_2d(&path),
            Err(NpyError::RankMismatch { expected: 2, actual: 1 })
        ));
    }
}
