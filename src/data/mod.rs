//! Data pipeline: record readers, extractors, datasets and iterators.
//!
//! Raw fixed-layout byte records are read by a [`RecordReader`], turned into named arrays
//! by a [`ByteRecordExtractor`], grouped into numbered blocks by a [`Dataset`], and handed
//! to consumers block by block by a [`DataIterator`].
//!
//! A block is a named mapping of arrays in the batch-time-features layout
//! `[records, 1, features...]`.

use std::collections::BTreeMap;

use crate::ndarray::NDArray;

mod dataset;
mod extractor;
mod iterator;
mod record;

pub use dataset::{Dataset, ExtractedDataset};
pub use extractor::ByteRecordExtractor;
pub use iterator::{Blocks, DataIterator, UndividedIterator};
pub use record::{MemoryRecordReader, RecordReader};

/// Named arrays yielded together.
pub type Block = BTreeMap<String, NDArray>;
