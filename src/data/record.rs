use std::fmt;

use crate::error::Result;

/// Source of raw byte records.
pub trait RecordReader: Send + Sync + fmt::Debug {
    /// Reads up to `count` records.
    ///
    /// Returns `None` once no more records can be read; a final partial batch is returned
    /// as a shorter vector.
    fn read(&mut self, count: usize) -> Result<Option<Vec<Vec<u8>>>>;
}

/// Reads records from memory.
#[derive(Debug, Clone)]
pub struct MemoryRecordReader {
    records: Vec<Vec<u8>>,
    cursor: usize,
}

impl MemoryRecordReader {
    pub fn new(records: Vec<Vec<u8>>) -> Self {
        Self { records, cursor: 0 }
    }
}

impl RecordReader for MemoryRecordReader {
    fn read(&mut self, count: usize) -> Result<Option<Vec<Vec<u8>>>> {
        if self.cursor >= self.records.len() {
            return Ok(None);
        }
        let end = (self.cursor + count).min(self.records.len());
        let batch = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(batch))
    }
}
