//! Saving and loading collections of arrays.
//!
//! # `.sgm` Format
//!
//! ```text
//! ┌────────────┬────────────┬──────────────┬──────────────┬─────┐
//! │ "SGMA"[4]  │ u64 count  │ array record │ array record │ ... │
//! └────────────┴────────────┴──────────────┴──────────────┴─────┘
//! ```
//!
//! Each array record is the handler serialisation format (see
//! [`ComputationHandler::serialise`]), which carries its own element type, backend family
//! and CRC32 checksum. Files can only be loaded by a handler of the family that wrote them.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::handler::{ComputationHandler, CpuHandler};
//! use sigma_core::modelio::{load_arrays, save_arrays};
//!
//! fn main() -> sigma_core::Result<()> {
//!     let handler = CpuHandler::float64();
//!     let weights = handler.create_from(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
//!
//!     let path = std::env::temp_dir().join("modelio_doc.sgm");
//!     save_arrays(&path, &handler, &[weights])?;
//!     let loaded = load_arrays(&path, &handler)?;
//!     assert_eq!(loaded[0].get_value::<f64>(&[1, 0])?, 3.0);
//!     # std::fs::remove_file(path)?;
//!     Ok(())
//! }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::handler::ComputationHandler;
use crate::ndarray::NDArray;

const SGMA_MAGIC: &[u8; 4] = b"SGMA";

/// Writes `arrays` to `sink`.
pub fn write_arrays(
    handler: &dyn ComputationHandler,
    arrays: &[NDArray],
    sink: &mut dyn Write,
) -> Result<()> {
    sink.write_all(SGMA_MAGIC)?;
    sink.write_all(&(arrays.len() as u64).to_le_bytes())?;
    for array in arrays {
        handler.serialise(array, sink)?;
    }
    Ok(())
}

/// Reads every array from `source`, placing them on `handler`.
///
/// # Errors
///
/// `UnsupportedFormat` when the magic header is wrong or the records belong to another
/// handler family, `CorruptedData` when a record fails its checksum.
pub fn read_arrays(handler: &dyn ComputationHandler, source: &mut dyn Read) -> Result<Vec<NDArray>> {
    let mut magic = [0; 4];
    source.read_exact(&mut magic)?;
    if &magic != SGMA_MAGIC {
        return Err(Error::UnsupportedFormat("invalid magic header".into()));
    }

    let mut count = [0; 8];
    source.read_exact(&mut count)?;
    let count = usize::try_from(u64::from_le_bytes(count))
        .map_err(|_| Error::CorruptedData("array count exceeds address space"))?;

    let mut arrays = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        arrays.push(handler.deserialise(source)?);
    }
    Ok(arrays)
}

/// Saves `arrays` to the file at `path`, replacing it.
#[instrument(skip_all, fields(path = %path.as_ref().display(), count = arrays.len()))]
pub fn save_arrays(
    path: impl AsRef<Path>,
    handler: &dyn ComputationHandler,
    arrays: &[NDArray],
) -> Result<()> {
    let mut file = BufWriter::new(File::create(path.as_ref())?);
    write_arrays(handler, arrays, &mut file)?;
    file.flush()?;
    info!("saved arrays");
    Ok(())
}

/// Loads every array stored in the file at `path`.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_arrays(path: impl AsRef<Path>, handler: &dyn ComputationHandler) -> Result<Vec<NDArray>> {
    let mut file = BufReader::new(File::open(path.as_ref())?);
    let arrays = read_arrays(handler, &mut file)?;
    info!(count = arrays.len(), "loaded arrays");
    Ok(arrays)
}
