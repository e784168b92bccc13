//! # The Array File Codec
//!
//! Every on-disk array in this crate (chunk-store accumulators, processed
//! masks, sample traces, final output volumes) uses one container format: a
//! fixed 64-byte header followed by the element data in little-endian order.
//! A fixed-size header keeps the data section 8-byte aligned under mmap and
//! lets a reader validate shape and element type before touching any data.
//!
//! The format is deliberately dumb. Files are sized up front to their full
//! extent and never truncated; partial writes can only leave stale element
//! bytes behind, which the chunk store's processed-mask protocol already
//! treats as "not yet computed".

use memmap2::{MmapMut, MmapOptions};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: [u8; 4] = *b"VXA1";
/// Total header size. Large enough for the magic, the type tags and up to
/// seven u64 dimensions, and a multiple of 8 so the data section stays
/// aligned when the file is memory-mapped.
pub const HEADER_LEN: usize = 64;
const MAX_NDIM: usize = 7;

/// Element type of an array file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F64,
    U8,
}

impl DType {
    fn code(self) -> u8 {
        match self {
            DType::F64 => 1,
            DType::U8 => 2,
        }
    }

    fn from_code(code: u8) -> Option<DType> {
        match code {
            1 => Some(DType::F64),
            2 => Some(DType::U8),
            _ => None,
        }
    }

    pub fn element_size(self) -> usize {
        match self {
            DType::F64 => 8,
            DType::U8 => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum NdioError {
    #[error("I/O error on array file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("'{path}' is not an array file (bad magic)")]
    BadMagic { path: String },
    #[error("array file '{path}' has an unsupported header ({reason})")]
    BadHeader { path: String, reason: String },
    #[error(
        "array file '{path}' holds a {found:?} array of shape {found_shape:?}, expected {expected:?} of shape {expected_shape:?}"
    )]
    Mismatch {
        path: String,
        found: DType,
        found_shape: Vec<usize>,
        expected: DType,
        expected_shape: Vec<usize>,
    },
    #[error("array file '{path}' is shorter than its header declares")]
    Truncated { path: String },
}

fn io_err(path: &Path, source: std::io::Error) -> NdioError {
    NdioError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn encode_header(dtype: DType, shape: &[usize]) -> [u8; HEADER_LEN] {
    debug_assert!(shape.len() <= MAX_NDIM);
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = dtype.code();
    header[5] = shape.len() as u8;
    for (i, &dim) in shape.iter().enumerate() {
        let off = 8 + i * 8;
        header[off..off + 8].copy_from_slice(&(dim as u64).to_le_bytes());
    }
    header
}

fn decode_header(path: &Path, header: &[u8; HEADER_LEN]) -> Result<(DType, Vec<usize>), NdioError> {
    if header[..4] != MAGIC {
        return Err(NdioError::BadMagic {
            path: path.display().to_string(),
        });
    }
    let dtype = DType::from_code(header[4]).ok_or_else(|| NdioError::BadHeader {
        path: path.display().to_string(),
        reason: format!("unknown element type code {}", header[4]),
    })?;
    let ndim = header[5] as usize;
    if ndim > MAX_NDIM {
        return Err(NdioError::BadHeader {
            path: path.display().to_string(),
            reason: format!("{ndim} dimensions exceeds the supported maximum of {MAX_NDIM}"),
        });
    }
    let mut shape = Vec::with_capacity(ndim);
    for i in 0..ndim {
        let off = 8 + i * 8;
        let mut dim = [0u8; 8];
        dim.copy_from_slice(&header[off..off + 8]);
        shape.push(u64::from_le_bytes(dim) as usize);
    }
    Ok((dtype, shape))
}

fn data_len(dtype: DType, shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * dtype.element_size()
}

/// A writable, memory-mapped array file. Element access goes through byte
/// offsets so the on-disk representation is identical on every platform.
#[derive(Debug)]
pub struct ArrayFileMut {
    mmap: MmapMut,
    dtype: DType,
    shape: Vec<usize>,
}

impl ArrayFileMut {
    /// Opens an existing array file for in-place mutation, or creates a
    /// zero-filled one of the requested type and shape. An existing file
    /// must match the requested type and shape exactly; the store never
    /// reinterprets prior state.
    pub fn create_or_open(path: &Path, dtype: DType, shape: &[usize]) -> Result<Self, NdioError> {
        let total_len = HEADER_LEN + data_len(dtype, shape);
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        if exists {
            let (found_dtype, found_shape) = read_header(path, &file)?;
            if found_dtype != dtype || found_shape != shape {
                return Err(NdioError::Mismatch {
                    path: path.display().to_string(),
                    found: found_dtype,
                    found_shape,
                    expected: dtype,
                    expected_shape: shape.to_vec(),
                });
            }
            let actual = file.metadata().map_err(|e| io_err(path, e))?.len();
            if (actual as usize) < total_len {
                return Err(NdioError::Truncated {
                    path: path.display().to_string(),
                });
            }
        } else {
            file.set_len(total_len as u64).map_err(|e| io_err(path, e))?;
            let header = encode_header(dtype, shape);
            let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }
                .map_err(|e| io_err(path, e))?;
            mmap[..HEADER_LEN].copy_from_slice(&header);
            mmap.flush().map_err(|e| io_err(path, e))?;
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| io_err(path, e))?;
        Ok(ArrayFileMut {
            mmap,
            dtype,
            shape: shape.to_vec(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Writes one f64 element at the given flat (row-major) element index.
    pub fn put_f64(&mut self, flat_index: usize, value: f64) {
        debug_assert_eq!(self.dtype, DType::F64);
        let off = HEADER_LEN + flat_index * 8;
        self.mmap[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn get_f64(&self, flat_index: usize) -> f64 {
        debug_assert_eq!(self.dtype, DType::F64);
        let off = HEADER_LEN + flat_index * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[off..off + 8]);
        f64::from_le_bytes(buf)
    }

    /// Writes one u8 element at the given flat element index.
    pub fn put_u8(&mut self, flat_index: usize, value: u8) {
        debug_assert_eq!(self.dtype, DType::U8);
        self.mmap[HEADER_LEN + flat_index] = value;
    }

    pub fn get_u8(&self, flat_index: usize) -> u8 {
        debug_assert_eq!(self.dtype, DType::U8);
        self.mmap[HEADER_LEN + flat_index]
    }

    /// Flushes all dirty pages to disk. The chunk store relies on the
    /// ordering guarantee that a data-file flush completes before the
    /// processed-mask bits for the same voxels are flagged.
    pub fn flush(&self) -> Result<(), NdioError> {
        self.mmap.flush().map_err(|e| NdioError::Io {
            path: "<mmap>".to_string(),
            source: e,
        })
    }
}

fn read_header(path: &Path, file: &File) -> Result<(DType, Vec<usize>), NdioError> {
    let mut header = [0u8; HEADER_LEN];
    let mut handle = file;
    handle
        .read_exact(&mut header)
        .map_err(|e| io_err(path, e))?;
    decode_header(path, &header)
}

/// Reads the (dtype, shape) of an array file without loading its data.
pub fn peek(path: &Path) -> Result<(DType, Vec<usize>), NdioError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    read_header(path, &file)
}

/// Reads a whole f64 array file into memory.
pub fn read_f64(path: &Path) -> Result<ArrayD<f64>, NdioError> {
    let (dtype, shape, data) = read_raw(path)?;
    if dtype != DType::F64 {
        return Err(NdioError::Mismatch {
            path: path.display().to_string(),
            found: dtype,
            found_shape: shape.clone(),
            expected: DType::F64,
            expected_shape: shape,
        });
    }
    let n = shape.iter().product::<usize>();
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let off = i * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[off..off + 8]);
        values.push(f64::from_le_bytes(buf));
    }
    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| NdioError::BadHeader {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Reads a whole u8 array file into memory.
pub fn read_u8(path: &Path) -> Result<ArrayD<u8>, NdioError> {
    let (dtype, shape, data) = read_raw(path)?;
    if dtype != DType::U8 {
        return Err(NdioError::Mismatch {
            path: path.display().to_string(),
            found: dtype,
            found_shape: shape.clone(),
            expected: DType::U8,
            expected_shape: shape,
        });
    }
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| NdioError::BadHeader {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn read_raw(path: &Path) -> Result<(DType, Vec<usize>, Vec<u8>), NdioError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| io_err(path, e))?;
    let (dtype, shape) = decode_header(path, &header)?;
    let expected = data_len(dtype, &shape);
    let mut data = vec![0u8; expected];
    file.read_exact(&mut data).map_err(|_| NdioError::Truncated {
        path: path.display().to_string(),
    })?;
    Ok((dtype, shape, data))
}

/// Writes a whole f64 array to a new (or overwritten) file in one shot.
pub fn write_f64(path: &Path, array: ArrayViewD<'_, f64>) -> Result<(), NdioError> {
    let shape: Vec<usize> = array.shape().to_vec();
    let mut file = File::create(path).map_err(|e| io_err(path, e))?;
    file.write_all(&encode_header(DType::F64, &shape))
        .map_err(|e| io_err(path, e))?;
    // `iter()` walks in row-major logical order regardless of memory layout.
    let mut buf = Vec::with_capacity(array.len() * 8);
    for &v in array.iter() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    file.write_all(&buf).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Writes a whole u8 array to a new (or overwritten) file in one shot.
pub fn write_u8(path: &Path, array: ArrayViewD<'_, u8>) -> Result<(), NdioError> {
    let shape: Vec<usize> = array.shape().to_vec();
    let mut file = File::create(path).map_err(|e| io_err(path, e))?;
    file.write_all(&encode_header(DType::U8, &shape))
        .map_err(|e| io_err(path, e))?;
    let buf: Vec<u8> = array.iter().copied().collect();
    file.write_all(&buf).map_err(|e| io_err(path, e))?;
    Ok(())
}
