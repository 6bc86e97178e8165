//! Background workers.
//!
//! A [`Worker`] drives one [`WorkUnit`] on a dedicated thread through an explicit state
//! machine:
//!
//! ```text
//! Created --start--> Running --pause--> Paused --resume--> Running
//!    |                  |                  |
//!    +------stop--------+-------stop-------+-----> Stopped
//! ```
//!
//! The unit is only invoked while the worker is `Running`. Pausing waits for the current
//! invocation to complete, so no work is discarded. Stopping lets the unit release its
//! resources on the worker thread before the thread exits.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use sigma_core::data::{ByteRecordExtractor, ExtractedDataset, UndividedIterator};
//! use sigma_core::worker::{BlockConsumer, Worker};
//! use sigma_core::{CpuHandler, Environment};
//!
//! let extractor = ByteRecordExtractor::new([("x", vec![vec![0], vec![1]])]).unwrap();
//! let records = (0..4u8).map(|i| vec![i]).collect();
//! let dataset = Arc::new(ExtractedDataset::new("digits", records, 2, extractor).unwrap());
//!
//! let consumer = BlockConsumer::new(
//!     Box::new(UndividedIterator::new(dataset)),
//!     Arc::new(CpuHandler::float32()),
//!     Arc::new(Environment::new("example")),
//! );
//! let blocks = consumer.blocks();
//!
//! let mut worker = Worker::new("consumer", consumer);
//! worker.start().unwrap();
//! worker.join().unwrap();
//! assert_eq!(blocks.lock().unwrap().len(), 2);
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::data::{Block, DataIterator};
use crate::device::DeviceContext;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::handler::ComputationHandler;

/// Lifecycle state of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl WorkerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a [`WorkUnit`] wants after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Invoke again while running.
    Continue,
    /// Done; the worker stops.
    Finished,
}

/// Per-invocation information handed to a [`WorkUnit`].
#[derive(Debug)]
pub struct WorkContext {
    fresh: bool,
    invocations: u64,
}

impl WorkContext {
    /// Whether this is the first invocation since the worker entered `Running`.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Number of completed invocations before this one.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }
}

/// A unit of work repeatedly invoked by a [`Worker`].
pub trait WorkUnit: Send + 'static {
    /// Performs one step of work.
    ///
    /// An error halts the worker.
    fn do_work(&mut self, context: &mut WorkContext) -> Result<WorkStatus>;

    /// Releases any resources still held. Called exactly once, on the worker thread when the
    /// unit ran.
    fn release(&mut self) {}
}

#[derive(Debug)]
struct Control {
    state: WorkerState,
    parked: bool,
    finished: bool,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Control>) -> MutexGuard<'a, Control> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a [`WorkUnit`] on its own thread.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    unit: Option<Box<dyn WorkUnit>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Worker {
    pub fn new(name: impl Into<String>, unit: impl WorkUnit) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: WorkerState::Created,
                    parked: false,
                    finished: false,
                }),
                signal: Condvar::new(),
            }),
            unit: Some(Box::new(unit)),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    /// Whether the worker thread has exited, either because the unit finished, failed or
    /// the worker was stopped.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    fn transition(&self, control: &mut Control, from: &[WorkerState], to: WorkerState) -> Result<()> {
        if !from.contains(&control.state) {
            return Err(Error::InvalidTransition {
                worker: self.name.clone(),
                from: control.state.as_str(),
                to: to.as_str(),
            });
        }
        debug!(worker = %self.name, from = %control.state, %to, "worker transition");
        control.state = to;
        Ok(())
    }

    /// Spawns the worker thread and enters `Running`.
    ///
    /// If the thread cannot be spawned the worker stays in `Created` and keeps its unit.
    pub fn start(&mut self) -> Result<()> {
        let builder = thread::Builder::new().name(self.name.clone());
        self.start_on(builder)
    }

    fn start_on(&mut self, builder: thread::Builder) -> Result<()> {
        {
            let control = self.shared.lock();
            if self.unit.is_none() || control.state != WorkerState::Created {
                return Err(Error::InvalidTransition {
                    worker: self.name.clone(),
                    from: control.state.as_str(),
                    to: WorkerState::Running.as_str(),
                });
            }
        }

        let (handoff, received) = mpsc::channel::<Box<dyn WorkUnit>>();
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = builder
            .spawn(move || match received.recv() {
                Ok(unit) => run(&name, &shared, unit),
                Err(_) => Ok(()),
            })
            .map_err(|err| {
                error!(worker = %self.name, %err, "failed to spawn worker thread");
                err
            })?;

        if let Some(unit) = self.unit.take() {
            // the spawned thread blocks in `recv` until this arrives
            let _ = handoff.send(unit);
        }
        self.handle = Some(handle);
        {
            let mut control = self.shared.lock();
            self.transition(&mut control, &[WorkerState::Created], WorkerState::Running)?;
        }
        self.shared.signal.notify_all();
        info!(worker = %self.name, "started worker");
        Ok(())
    }

    /// Enters `Paused` and blocks until the unit's current invocation has completed.
    pub fn pause(&self) -> Result<()> {
        let mut control = self.shared.lock();
        self.transition(&mut control, &[WorkerState::Running], WorkerState::Paused)?;
        self.shared.signal.notify_all();
        while !control.parked && !control.finished {
            control = self.shared.wait(control);
        }
        Ok(())
    }

    /// Returns from `Paused` to `Running`.
    pub fn resume(&self) -> Result<()> {
        let mut control = self.shared.lock();
        self.transition(&mut control, &[WorkerState::Paused], WorkerState::Running)?;
        self.shared.signal.notify_all();
        Ok(())
    }

    /// Enters `Stopped`. The thread exits after its current invocation and the unit's
    /// release; use [`join`](Self::join) to wait for both.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut control = self.shared.lock();
            self.transition(
                &mut control,
                &[WorkerState::Created, WorkerState::Running, WorkerState::Paused],
                WorkerState::Stopped,
            )?;
            self.shared.signal.notify_all();
        }
        if let Some(mut unit) = self.unit.take() {
            unit.release();
            self.shared.lock().finished = true;
        }
        Ok(())
    }

    /// Waits for the worker thread to exit and returns the error that halted it, if any.
    ///
    /// A paused worker never exits on its own; stop or resume it first.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.join().unwrap_or_else(|_| {
            Err(Error::ArgumentError(format!("worker {:?} panicked", self.name)))
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.state() != WorkerState::Stopped {
            let _ = self.stop();
        }
        let _ = self.join();
    }
}

fn run(name: &str, shared: &Shared, mut unit: Box<dyn WorkUnit>) -> Result<()> {
    let mut context = WorkContext {
        fresh: true,
        invocations: 0,
    };

    let outcome = 'work: loop {
        {
            let mut control = shared.lock();
            loop {
                match control.state {
                    WorkerState::Running => break,
                    WorkerState::Stopped => break 'work Ok(()),
                    WorkerState::Created | WorkerState::Paused => {
                        if !control.parked {
                            control.parked = true;
                            context.fresh = true;
                            shared.signal.notify_all();
                        }
                        control = shared.wait(control);
                    }
                }
            }
            control.parked = false;
        }

        match unit.do_work(&mut context) {
            Ok(WorkStatus::Continue) => {
                context.fresh = false;
                context.invocations += 1;
            }
            Ok(WorkStatus::Finished) => {
                debug!(worker = name, invocations = context.invocations + 1, "work finished");
                break Ok(());
            }
            Err(err) => {
                error!(worker = name, %err, "worker halted");
                break Err(err);
            }
        }
    };

    unit.release();
    let mut control = shared.lock();
    control.state = WorkerState::Stopped;
    control.finished = true;
    shared.signal.notify_all();
    outcome
}

/// Binds a device context to the worker thread each time the worker enters `Running`,
/// then delegates to the wrapped unit.
pub struct DeviceBoundUnit<U> {
    context: Arc<DeviceContext>,
    inner: U,
}

impl<U: WorkUnit> DeviceBoundUnit<U> {
    pub fn new(context: Arc<DeviceContext>, inner: U) -> Self {
        Self { context, inner }
    }
}

impl<U: WorkUnit> WorkUnit for DeviceBoundUnit<U> {
    fn do_work(&mut self, context: &mut WorkContext) -> Result<WorkStatus> {
        if context.is_fresh() {
            self.context.bind_to_current_thread();
        }
        self.inner.do_work(context)
    }

    fn release(&mut self) {
        self.inner.release();
    }
}

/// Drains a [`DataIterator`], collecting every block into a shared list.
pub struct BlockConsumer {
    iterator: Box<dyn DataIterator>,
    handler: Arc<dyn ComputationHandler>,
    env: Arc<Environment>,
    blocks: Arc<Mutex<Vec<Block>>>,
}

impl BlockConsumer {
    pub fn new(
        iterator: Box<dyn DataIterator>,
        handler: Arc<dyn ComputationHandler>,
        env: Arc<Environment>,
    ) -> Self {
        Self {
            iterator,
            handler,
            env,
            blocks: Arc::default(),
        }
    }

    /// The list consumed blocks are appended to.
    pub fn blocks(&self) -> Arc<Mutex<Vec<Block>>> {
        Arc::clone(&self.blocks)
    }
}

impl WorkUnit for BlockConsumer {
    fn do_work(&mut self, _context: &mut WorkContext) -> Result<WorkStatus> {
        match self.iterator.next_block(self.handler.as_ref(), &self.env)? {
            Some(block) => {
                self.blocks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(block);
                Ok(WorkStatus::Continue)
            }
            None => Ok(WorkStatus::Finished),
        }
    }

    fn release(&mut self) {
        self.iterator.release(self.handler.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Counter {
        limit: u64,
        released: Arc<Mutex<bool>>,
    }

    impl WorkUnit for Counter {
        fn do_work(&mut self, context: &mut WorkContext) -> Result<WorkStatus> {
            if context.invocations() + 1 >= self.limit {
                Ok(WorkStatus::Finished)
            } else {
                Ok(WorkStatus::Continue)
            }
        }

        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let released = Arc::new(Mutex::new(false));
        let mut worker = Worker::new(
            "counter",
            Counter {
                limit: 1,
                released: released.clone(),
            },
        );
        assert_matches!(worker.pause(), Err(Error::InvalidTransition { from: "created", .. }));
        assert_matches!(worker.resume(), Err(Error::InvalidTransition { .. }));

        worker.stop().unwrap();
        assert!(*released.lock().unwrap());
        assert_matches!(worker.start(), Err(Error::InvalidTransition { from: "stopped", .. }));
        assert_matches!(worker.stop(), Err(Error::InvalidTransition { .. }));
    }

    #[test]
    fn finishing_stops_and_releases() {
        let released = Arc::new(Mutex::new(false));
        let mut worker = Worker::new(
            "counter",
            Counter {
                limit: 10,
                released: released.clone(),
            },
        );
        worker.start().unwrap();
        worker.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.is_finished());
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn failed_spawn_keeps_the_unit() {
        let released = Arc::new(Mutex::new(false));
        let mut worker = Worker::new(
            "oversized",
            Counter {
                limit: 3,
                released: released.clone(),
            },
        );
        let oversized = thread::Builder::new().stack_size(usize::MAX / 2);
        assert_matches!(worker.start_on(oversized), Err(Error::Io(_)));
        assert_eq!(worker.state(), WorkerState::Created);
        assert!(!*released.lock().unwrap());

        worker.start().unwrap();
        worker.join().unwrap();
        assert!(*released.lock().unwrap());
    }

    struct Failing;

    impl WorkUnit for Failing {
        fn do_work(&mut self, _context: &mut WorkContext) -> Result<WorkStatus> {
            Err(Error::ArgumentError("nothing to do".into()))
        }
    }

    #[test]
    fn errors_halt_the_worker() {
        let mut worker = Worker::new("failing", Failing);
        worker.start().unwrap();
        assert_matches!(worker.join(), Err(Error::ArgumentError(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
