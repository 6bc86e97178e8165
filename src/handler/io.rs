//! Binary array format shared by every handler.
//!
//! ```text
//! ┌──────────────┬──────────┬──────────┬──────────┬─────────────────┬──────────────┬─────────┐
//! │ "SIGNDv1\0"  │ u8 dtype │ u8 back. │ u64 rank │ u64 × rank shape│ element data │ u32 CRC │
//! └──────────────┴──────────┴──────────┴──────────┴─────────────────┴──────────────┴─────────┘
//! ```
//!
//! All integers and elements are little-endian. Elements are written in row-major logical
//! order whatever the source strides, so a strided view serialises exactly like its
//! contiguous copy; strides are reconstructed as row-major on load. The trailing CRC32
//! covers every preceding byte of the record.

use std::io::{Read, Write};

use briny::prelude::*;
use crc32fast::Hasher;
use tracing::{debug, instrument};

use super::ComputationHandler;
use crate::backend::Backend;
use crate::dtype::DataType;
use crate::error::{Error, Result};
use crate::ndarray::NDArray;
use crate::shape;

pub(crate) const MAGIC: &[u8; 8] = b"SIGNDv1\0";

/// One decoded array record, not yet placed on a handler.
pub(crate) struct PackedArray {
    pub data_type: DataType,
    pub backend: Backend,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Validate for PackedArray {
    fn validate(&self) -> Result<(), ValidationError> {
        if shape::check_shape(&self.shape).is_err() {
            return Err(ValidationError);
        }
        let expected = shape::product(&self.shape) * self.data_type.size_bytes();
        if self.data.len() != expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Fails with `UnsupportedFormat` unless `array` belongs to `handler`'s family (same backend
/// kind and element type).
pub(crate) fn check_family<H: ComputationHandler + ?Sized>(handler: &H, array: &NDArray) -> Result<()> {
    let backend = array.backend_tag().backend();
    if backend != handler.backend() || array.data_type() != handler.data_type() {
        return Err(Error::UnsupportedFormat(format!(
            "{} {} handler cannot serialise a {backend} {} array",
            handler.backend(),
            handler.data_type(),
            array.data_type()
        )));
    }
    Ok(())
}

#[instrument(level = "debug", skip_all, fields(shape = ?array.shape()))]
pub(crate) fn write_array(array: &NDArray, sink: &mut dyn Write) -> Result<()> {
    let mut record = Vec::with_capacity(26 + 8 * array.rank());
    record.extend_from_slice(MAGIC);
    record.push(array.data_type() as u8);
    record.push(array.backend_tag().backend() as u8);
    record.extend_from_slice(&(array.rank() as u64).to_le_bytes());
    for &dim in array.shape() {
        record.extend_from_slice(&(dim as u64).to_le_bytes());
    }
    record.extend(array.data().gather_le_bytes(&array.logical_offsets())?);

    let mut crc = Hasher::new();
    crc.update(&record);
    record.extend_from_slice(&crc.finalize().to_le_bytes());

    sink.write_all(&record)?;
    Ok(())
}

/// Reads through to `inner` while feeding every byte to a CRC.
struct Checked<'a> {
    inner: &'a mut dyn Read,
    crc: Hasher,
}

impl Checked<'_> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.inner.read_exact(&mut buf)?;
        self.crc.update(&buf);
        Ok(buf)
    }

    fn u64(&mut self) -> Result<u64> {
        self.bytes().map(u64::from_le_bytes)
    }

    fn usize(&mut self) -> Result<usize> {
        usize::try_from(self.u64()?).map_err(|_| Error::CorruptedData("length exceeds address space"))
    }
}

pub(crate) fn read_array(source: &mut dyn Read) -> Result<PackedArray> {
    let mut reader = Checked {
        inner: source,
        crc: Hasher::new(),
    };

    if &reader.bytes::<8>()? != MAGIC {
        return Err(Error::UnsupportedFormat("invalid magic header".into()));
    }
    let [data_type] = reader.bytes()?;
    let data_type = DataType::try_from(data_type)?;
    let [backend] = reader.bytes()?;
    let backend = Backend::try_from(backend)?;

    let rank = reader.usize()?;
    let mut dims = Vec::with_capacity(rank.min(64));
    for _ in 0..rank {
        dims.push(reader.usize()?);
    }
    let len = dims
        .iter()
        .try_fold(data_type.size_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or(Error::CorruptedData("array size overflows"))?;

    let mut data = Vec::new();
    (&mut *reader.inner).take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(Error::CorruptedData("truncated element data"));
    }
    reader.crc.update(&data);

    let expected = reader.crc.finalize();
    let mut stored = [0; 4];
    reader.inner.read_exact(&mut stored)?;
    if u32::from_le_bytes(stored) != expected {
        return Err(Error::CorruptedData("checksum mismatch"));
    }

    let packed = PackedArray {
        data_type,
        backend,
        shape: dims,
        data,
    };
    let trusted = TrustedData::new(packed).map_err(|_| Error::CorruptedData("invalid array record"))?;
    let packed = trusted.into_inner();
    debug!(shape = ?packed.shape, %data_type, %backend, "read array record");
    Ok(packed)
}
