use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::Block;
use super::dataset::Dataset;
use crate::environment::Environment;
use crate::error::Result;
use crate::handler::ComputationHandler;
use crate::registry::Registry;

/// Iterates over the blocks of a dataset.
///
/// Iteration state (cursor, prefetched blocks) belongs to the iterator instance. Shallow
/// copies share the dataset but start from the beginning, so several workers can traverse
/// the same data independently.
pub trait DataIterator: Send + fmt::Debug {
    /// The dataset this iterator traverses.
    fn dataset(&self) -> &Arc<dyn Dataset>;

    /// Parameters of and information about this iterator.
    fn registry(&self) -> &Registry;

    /// The next block, or `None` once the dataset is fully traversed.
    fn next_block(&mut self, handler: &dyn ComputationHandler, env: &Environment) -> Result<Option<Block>>;

    /// A copy sharing the dataset, with its cursor reset.
    fn shallow_copy(&self) -> Box<dyn DataIterator>;

    /// Frees every block this iterator still holds on the dataset.
    ///
    /// The cursor is kept, so iteration may continue afterwards at the cost of refetching.
    fn release(&mut self, handler: &dyn ComputationHandler);

    /// The remaining blocks as a lazy sequence.
    fn yield_blocks<'a>(&'a mut self, handler: &'a dyn ComputationHandler, env: &'a Environment) -> Blocks<'a>
    where
        Self: Sized,
    {
        Blocks::new(self, handler, env)
    }
}

/// Lazy sequence of blocks drawn from a [`DataIterator`].
///
/// Ends after the last block, or after yielding the first error.
pub struct Blocks<'a> {
    iterator: &'a mut dyn DataIterator,
    handler: &'a dyn ComputationHandler,
    env: &'a Environment,
    done: bool,
}

impl<'a> Blocks<'a> {
    pub fn new(
        iterator: &'a mut dyn DataIterator,
        handler: &'a dyn ComputationHandler,
        env: &'a Environment,
    ) -> Self {
        Self {
            iterator,
            handler,
            env,
            done: false,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.iterator.next_block(self.handler, self.env) {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl std::iter::FusedIterator for Blocks<'_> {}

/// Yields the dataset's blocks whole, in order.
///
/// The block after the current one is fetched ahead of time. Once the consumer asks for the
/// next block, the previously yielded one is freed on the dataset.
#[derive(Debug)]
pub struct UndividedIterator {
    dataset: Arc<dyn Dataset>,
    registry: Registry,
    cursor: usize,
    fetched: HashMap<usize, Option<Block>>,
    exhausted: bool,
}

impl UndividedIterator {
    pub fn new(dataset: Arc<dyn Dataset>) -> Self {
        Self {
            dataset,
            registry: Registry::new(),
            cursor: 0,
            fetched: HashMap::new(),
            exhausted: false,
        }
    }

    /// Index of the next block to yield.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn require(&mut self, index: usize, handler: &dyn ComputationHandler) -> Result<()> {
        if !self.fetched.contains_key(&index) {
            let block = self.dataset.fetch_block(index, handler)?;
            self.fetched.insert(index, block);
        }
        Ok(())
    }
}

impl DataIterator for UndividedIterator {
    fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn next_block(&mut self, handler: &dyn ComputationHandler, env: &Environment) -> Result<Option<Block>> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(previous) = self.cursor.checked_sub(1) {
            self.dataset.free_block(previous, handler);
        }

        let index = self.cursor;
        self.require(index, handler)?;
        let Some(block) = self.fetched.remove(&index).flatten() else {
            self.exhausted = true;
            return Ok(None);
        };
        self.require(index + 1, handler)?;
        self.cursor += 1;

        trace!(env = env.name(), dataset = self.dataset.name(), index, "yielding block");
        Ok(Some(block))
    }

    fn shallow_copy(&self) -> Box<dyn DataIterator> {
        Box::new(Self::new(Arc::clone(&self.dataset)))
    }

    fn release(&mut self, handler: &dyn ComputationHandler) {
        if let Some(previous) = self.cursor.checked_sub(1) {
            self.dataset.free_block(previous, handler);
        }
        for (index, _) in self.fetched.drain() {
            self.dataset.free_block(index, handler);
        }
    }
}
