use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::Block;
use super::extractor::ByteRecordExtractor;
use super::record::RecordReader;
use crate::backend::BackendTag;
use crate::error::{Error, Result};
use crate::handler::ComputationHandler;

/// A source of numbered blocks.
///
/// Datasets are shared read-only between iterators; any caching they do is internal.
pub trait Dataset: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Names of the arrays in every block.
    fn section_names(&self) -> Vec<String>;

    /// Block `index` created with `handler`, or `None` past the last block.
    fn fetch_block(&self, index: usize, handler: &dyn ComputationHandler) -> Result<Option<Block>>;

    /// Releases the dataset's copy of block `index` for `handler`.
    ///
    /// Arrays already handed out stay valid.
    fn free_block(&self, index: usize, handler: &dyn ComputationHandler);
}

/// A dataset over in-memory records, extracted block by block on demand.
///
/// Each block holds `records_per_block` consecutive records (the last one possibly fewer).
/// Fetched blocks are cached per handler until freed.
pub struct ExtractedDataset {
    name: String,
    records: Arc<[Vec<u8>]>,
    records_per_block: usize,
    extractor: Arc<ByteRecordExtractor>,
    cache: Mutex<HashMap<(usize, BackendTag), Block>>,
}

impl fmt::Debug for ExtractedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractedDataset")
            .field("name", &self.name)
            .field("records", &self.records.len())
            .field("records_per_block", &self.records_per_block)
            .field("active_blocks", &self.active_blocks())
            .finish()
    }
}

impl ExtractedDataset {
    /// # Errors
    ///
    /// `ArgumentError` when `records_per_block` is zero.
    pub fn new(
        name: impl Into<String>,
        records: Vec<Vec<u8>>,
        records_per_block: usize,
        extractor: ByteRecordExtractor,
    ) -> Result<Self> {
        if records_per_block == 0 {
            return Err(Error::ArgumentError(
                "records per block must be > 0 but was 0".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            records: records.into(),
            records_per_block,
            extractor: Arc::new(extractor),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Reads every record `reader` can provide.
    pub fn from_reader(
        name: impl Into<String>,
        reader: &mut dyn RecordReader,
        records_per_block: usize,
        extractor: ByteRecordExtractor,
    ) -> Result<Self> {
        let mut records = Vec::new();
        while let Some(batch) = reader.read(records_per_block.max(1))? {
            records.extend(batch);
        }
        Self::new(name, records, records_per_block, extractor)
    }

    pub fn block_count(&self) -> usize {
        self.records.len().div_ceil(self.records_per_block)
    }

    /// Number of blocks currently cached.
    pub fn active_blocks(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Dataset for ExtractedDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn section_names(&self) -> Vec<String> {
        self.extractor
            .section_names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn fetch_block(&self, index: usize, handler: &dyn ComputationHandler) -> Result<Option<Block>> {
        let key = (index, handler.backend_tag());
        if let Some(block) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Some(block.clone()));
        }

        let start = index.saturating_mul(self.records_per_block);
        if start >= self.records.len() {
            return Ok(None);
        }
        let end = (start + self.records_per_block).min(self.records.len());
        let block = self.extractor.extract_from(&self.records[start..end], handler)?;
        debug!(dataset = %self.name, index, records = end - start, "fetched block");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, block.clone());
        Ok(Some(block))
    }

    fn free_block(&self, index: usize, handler: &dyn ComputationHandler) {
        let removed = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(index, handler.backend_tag()));
        if let Some(mut block) = removed {
            block.values_mut().for_each(|array| array.release());
            debug!(dataset = %self.name, index, "freed block");
        }
    }
}
