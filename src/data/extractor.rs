use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use super::Block;
use super::record::RecordReader;
use crate::error::{Error, Result};
use crate::handler::ComputationHandler;
use crate::shape;

#[derive(Debug, Clone)]
struct Section {
    begins: Vec<Vec<usize>>,
    extents: Vec<Vec<usize>>,
    feature_shape: Vec<usize>,
}

impl Section {
    fn parse(name: &str, ranges: &[Vec<usize>]) -> Result<Self> {
        let invalid = |reason: String| Error::ArgumentError(format!("index mapping {name:?}: {reason}"));
        if ranges.is_empty() || ranges.len() % 2 != 0 {
            return Err(invalid(format!(
                "ranges must come in begin/end pairs, got {} entries",
                ranges.len()
            )));
        }
        let rank = ranges[0].len();
        if rank == 0 || ranges.iter().any(|r| r.len() != rank) {
            return Err(invalid(format!("every index must have the same non-zero rank {rank}")));
        }

        let mut section = Self {
            begins: Vec::new(),
            extents: Vec::new(),
            feature_shape: vec![0; rank],
        };
        for pair in ranges.chunks_exact(2) {
            let (begin, end) = (&pair[0], &pair[1]);
            if begin.iter().zip(end).any(|(b, e)| b >= e) {
                return Err(invalid(format!("empty range [{begin:?}, {end:?})")));
            }
            let extent: Vec<usize> = begin.iter().zip(end).map(|(b, e)| e - b).collect();
            section
                .feature_shape
                .iter_mut()
                .zip(&extent)
                .for_each(|(f, e)| *f += e);
            section.begins.push(begin.clone());
            section.extents.push(extent);
        }
        Ok(section)
    }
}

/// Extracts named byte ranges of fixed-layout records into arrays.
///
/// Each section name maps to a list of `[begin, end)` index pairs. For `n` records a
/// section yields an array of shape `[n, 1, features...]`, where the feature shape is the
/// per-dimension sum of the range extents. Ranges are laid out one after another: range `k`
/// starts at the summed extents of ranges `0..k` in every feature dimension.
///
/// Within a range, byte `y` (in row-major order of the range's extent) is read from record
/// offset `product(begin) + y`.
///
/// # Example
///
/// ```rust
/// use sigma_core::data::ByteRecordExtractor;
/// use sigma_core::handler::CpuHandler;
///
/// let extractor = ByteRecordExtractor::new([("x", vec![vec![0], vec![4]])]).unwrap();
/// let block = extractor.extract_from(&[vec![1, 2, 3, 4, 5]], &CpuHandler::float32()).unwrap();
///
/// let x = &block["x"];
/// assert_eq!(x.shape(), &[1, 1, 4]);
/// assert_eq!(x.get_data_as::<u8>().unwrap(), vec![1, 2, 3, 4]);
/// ```
#[derive(Debug)]
pub struct ByteRecordExtractor {
    sections: BTreeMap<String, Section>,
    reader: Option<Box<dyn RecordReader>>,
}

impl ByteRecordExtractor {
    /// Creates an extractor over named index mappings.
    ///
    /// # Errors
    ///
    /// `ArgumentError` when a mapping has an odd number of entries (ranges come in
    /// begin/end pairs), is empty, mixes ranks, or contains an empty range.
    pub fn new<K, I>(index_mappings: I) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<Vec<usize>>)>,
    {
        let mut sections = BTreeMap::new();
        for (name, ranges) in index_mappings {
            let name = name.into();
            let section = Section::parse(&name, &ranges)?;
            sections.insert(name, section);
        }
        Ok(Self {
            sections,
            reader: None,
        })
    }

    /// Attaches the reader used by [`extract_direct`](Self::extract_direct).
    pub fn with_reader(mut self, reader: impl RecordReader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn attach_reader(&mut self, reader: Box<dyn RecordReader>) {
        self.reader = Some(reader);
    }

    /// Names of the arrays every extracted block contains.
    pub fn section_names(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Reads up to `number_of_records` records from the attached reader and extracts them.
    ///
    /// Returns `None` once the reader is exhausted.
    ///
    /// # Errors
    ///
    /// `ArgumentError` when `number_of_records` is zero or no reader is attached.
    pub fn extract_direct(
        &mut self,
        number_of_records: usize,
        handler: &dyn ComputationHandler,
    ) -> Result<Option<Block>> {
        if number_of_records == 0 {
            return Err(Error::ArgumentError(
                "number of records to read must be > 0 but was 0".into(),
            ));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::ArgumentError("cannot extract before attaching a reader".into()))?;
        match reader.read(number_of_records)? {
            Some(records) if !records.is_empty() => {
                if records.len() < number_of_records {
                    warn!(requested = number_of_records, read = records.len(), "short read");
                }
                self.extract_from(&records, handler).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Extracts every section from `records`.
    ///
    /// # Errors
    ///
    /// `ArgumentError` when `records` is empty, `IndexOutOfRange` when a range reaches past
    /// the end of a record.
    #[instrument(skip_all, fields(records = records.len()))]
    pub fn extract_from(&self, records: &[Vec<u8>], handler: &dyn ComputationHandler) -> Result<Block> {
        if records.is_empty() {
            return Err(Error::ArgumentError("no records to extract".into()));
        }
        info!(
            sections = self.sections.len(),
            "extracting {} records",
            records.len()
        );

        let mut block = Block::new();
        for (name, section) in &self.sections {
            let mut array_shape = vec![records.len(), 1];
            array_shape.extend_from_slice(&section.feature_shape);
            let strides = shape::strides_for(&array_shape);
            let mut values = vec![0.0; shape::product(&array_shape)];

            let mut placement = vec![vec![0; section.feature_shape.len()]];
            for extent in &section.extents {
                let last = &placement[placement.len() - 1];
                let next = last.iter().zip(extent).map(|(p, e)| p + e).collect();
                placement.push(next);
            }

            for (r, record) in records.iter().enumerate() {
                for ((begin, extent), offset) in section.begins.iter().zip(&section.extents).zip(&placement) {
                    let source = shape::product(begin);
                    let local_strides = shape::strides_for(extent);
                    for y in 0..shape::product(extent) {
                        let byte = *record.get(source + y).ok_or_else(|| Error::IndexOutOfRange {
                            index: vec![r, source + y],
                            bounds: vec![records.len(), record.len()],
                        })?;
                        let local = shape::multi_index(y, extent, &local_strides)?;
                        let dest = r * strides[0]
                            + local
                                .iter()
                                .zip(offset)
                                .zip(&strides[2..])
                                .map(|((l, o), s)| (l + o) * s)
                                .sum::<usize>();
                        values[dest] = f64::from(byte);
                    }
                }
            }

            block.insert(name.clone(), handler.create_from(&array_shape, &values)?);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryRecordReader;
    use crate::handler::CpuHandler;
    use assert_matches::assert_matches;

    #[test]
    fn odd_mappings_are_rejected() {
        assert_matches!(
            ByteRecordExtractor::new([("x", vec![vec![0], vec![2], vec![3]])]),
            Err(Error::ArgumentError(_))
        );
        assert_matches!(
            ByteRecordExtractor::new([("x", vec![vec![2], vec![2]])]),
            Err(Error::ArgumentError(_))
        );
    }

    #[test]
    fn ranges_are_laid_out_consecutively() {
        let extractor =
            ByteRecordExtractor::new([("x", vec![vec![0], vec![2], vec![4], vec![6]])]).unwrap();
        let records = vec![vec![10, 11, 12, 13, 14, 15], vec![20, 21, 22, 23, 24, 25]];
        let block = extractor
            .extract_from(&records, &CpuHandler::float64())
            .unwrap();
        let x = &block["x"];
        assert_eq!(x.shape(), &[2, 1, 4]);
        assert_eq!(
            x.get_data_as::<u8>().unwrap(),
            vec![10, 11, 14, 15, 20, 21, 24, 25]
        );
    }

    #[test]
    fn direct_extraction_drains_the_reader() {
        let reader = MemoryRecordReader::new(vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
        let mut extractor = ByteRecordExtractor::new([
            ("inputs", vec![vec![0], vec![1]]),
            ("targets", vec![vec![1], vec![2]]),
        ])
        .unwrap()
        .with_reader(reader);
        let handler = CpuHandler::float32();

        assert_eq!(extractor.section_names(), vec!["inputs", "targets"]);
        assert_matches!(extractor.extract_direct(0, &handler), Err(Error::ArgumentError(_)));

        let first = extractor.extract_direct(2, &handler).unwrap().unwrap();
        assert_eq!(first["targets"].get_data_as::<u8>().unwrap(), vec![2, 4]);
        let second = extractor.extract_direct(2, &handler).unwrap().unwrap();
        assert_eq!(second["inputs"].shape(), &[1, 1, 1]);
        assert!(extractor.extract_direct(2, &handler).unwrap().is_none());
    }

    #[test]
    fn ranges_past_the_record_fail() {
        let extractor = ByteRecordExtractor::new([("x", vec![vec![2], vec![5]])]).unwrap();
        assert_matches!(
            extractor.extract_from(&[vec![0; 4]], &CpuHandler::float32()),
            Err(Error::IndexOutOfRange { .. })
        );
    }
}
