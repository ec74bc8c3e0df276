//! Fan-out / fan-in execution over all partitions.
//!
//! A cluster-wide operation (key enumeration, size, bulk write, lock sweep)
//! becomes one task per partition. The [`FanOutExecutor`] runs those tasks in
//! one of two modes, fixed at construction from
//! `ClusterConfig::parallel_request_threads`:
//!
//! - **Sequential** (pool size 0): tasks run in partition-index order, each
//!   charged against a single shrinking budget. When the budget runs out
//!   before all tasks finish, the call fails with a timeout carrying how many
//!   tasks completed; the task being awaited at that moment is dropped, so
//!   tasks parking on shared state must release it on drop. A zero budget
//!   disables the deadline entirely.
//! - **Parallel**: a bounded pool of long-lived workers pulls boxed tasks
//!   from a shared queue. Each task carries the full, un-shrinking timeout
//!   and reports into a per-call result channel. The first error
//!   short-circuits collection; in-flight tasks are not cancelled and their
//!   late results go to a dropped channel.
//!
//! Per-call aggregation is selected through the [`Aggregate`] policy trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::constants::FANOUT_TASK_QUEUE_CAPACITY;
use crate::error::{Error, Result};

/// A boxed per-partition task.
pub type FanOutFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Box a future into a [`FanOutFuture`].
pub fn boxed<T, F>(future: F) -> FanOutFuture<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
{
    Box::pin(future)
}

/// Folds per-partition results into one value.
///
/// `absorb` returns `true` to short-circuit: remaining results are discarded
/// and `finish` is called with what has been absorbed so far.
pub trait Aggregate<T>: Send {
    type Output: Send;

    fn absorb(&mut self, item: T) -> bool;

    fn finish(self) -> Self::Output;
}

/// Concatenates per-partition collections (key enumeration).
#[derive(Debug)]
pub struct Union<I> {
    items: Vec<I>,
}

impl<I> Union<I> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }
}

impl<I> Default for Union<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, I> Aggregate<T> for Union<I>
where
    T: IntoIterator<Item = I> + Send,
    I: Send,
{
    type Output = Vec<I>;

    fn absorb(&mut self, item: T) -> bool {
        self.items.extend(item);
        false
    }

    fn finish(self) -> Vec<I> {
        self.items
    }
}

/// Adds per-partition counts (cluster-wide size).
#[derive(Debug, Default)]
pub struct Sum {
    total: usize,
}

impl Sum {
    pub fn new() -> Self {
        Self { total: 0 }
    }
}

impl Aggregate<usize> for Sum {
    type Output = usize;

    fn absorb(&mut self, item: usize) -> bool {
        self.total += item;
        false
    }

    fn finish(self) -> usize {
        self.total
    }
}

/// Logical OR with short-circuit on the first `true` (containment checks).
#[derive(Debug, Default)]
pub struct Any {
    hit: bool,
}

impl Any {
    pub fn new() -> Self {
        Self { hit: false }
    }
}

impl Aggregate<bool> for Any {
    type Output = bool;

    fn absorb(&mut self, item: bool) -> bool {
        self.hit |= item;
        self.hit
    }

    fn finish(self) -> bool {
        self.hit
    }
}

/// Logical AND with short-circuit on the first `false` (all-or-nothing
/// acquisition sweeps).
#[derive(Debug)]
pub struct All {
    ok: bool,
}

impl All {
    pub fn new() -> Self {
        Self { ok: true }
    }
}

impl Default for All {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregate<bool> for All {
    type Output = bool;

    fn absorb(&mut self, item: bool) -> bool {
        self.ok &= item;
        !self.ok
    }

    fn finish(self) -> bool {
        self.ok
    }
}

/// Drops results, keeping only success/failure (bulk writes).
#[derive(Debug, Default)]
pub struct Discard;

impl<T: Send> Aggregate<T> for Discard {
    type Output = ();

    fn absorb(&mut self, _item: T) -> bool {
        false
    }

    fn finish(self) {}
}

/// A task as the worker pool sees it: result delivery is baked in.
type PooledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Mode {
    Sequential,
    Pool {
        queue: mpsc::Sender<PooledTask>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Runs per-partition tasks sequentially or on a bounded worker pool.
pub struct FanOutExecutor {
    mode: Mode,
}

impl FanOutExecutor {
    /// Create an executor. Zero threads selects sequential mode; otherwise a
    /// pool of `threads` long-lived workers is spawned immediately on the
    /// current runtime.
    pub fn new(threads: usize) -> Self {
        if threads == 0 {
            return Self {
                mode: Mode::Sequential,
            };
        }
        Self::with_handle(threads, Handle::current())
    }

    /// Like [`FanOutExecutor::new`], but pool workers spawn on the given
    /// runtime handle (the data plane, in a dual-runtime setup). Does not
    /// need an ambient runtime.
    pub fn with_handle(threads: usize, handle: Handle) -> Self {
        if threads == 0 {
            return Self {
                mode: Mode::Sequential,
            };
        }

        let (queue, receiver) = mpsc::channel::<PooledTask>(FANOUT_TASK_QUEUE_CAPACITY);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..threads)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                handle.spawn(async move {
                    loop {
                        // Hold the receiver lock only for the dequeue, never
                        // across task execution.
                        let task = {
                            let mut receiver = receiver.lock().await;
                            receiver.recv().await
                        };
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                    debug!(worker = index, "fan-out worker stopped");
                })
            })
            .collect();

        Self {
            mode: Mode::Pool { queue, workers },
        }
    }

    /// Number of pool workers (zero in sequential mode).
    pub fn worker_count(&self) -> usize {
        match &self.mode {
            Mode::Sequential => 0,
            Mode::Pool { workers, .. } => workers.len(),
        }
    }

    /// Run all tasks and fold their results through `aggregate`.
    ///
    /// A zero `timeout` disables deadlines in both modes. The first task
    /// error is returned as-is; in parallel mode in-flight tasks keep
    /// running and their late results are discarded.
    pub async fn execute<T, A>(
        &self,
        tasks: Vec<FanOutFuture<T>>,
        timeout: Duration,
        aggregate: A,
    ) -> Result<A::Output>
    where
        T: Send + 'static,
        A: Aggregate<T>,
    {
        match &self.mode {
            Mode::Sequential => Self::execute_sequential(tasks, timeout, aggregate).await,
            Mode::Pool { queue, .. } => {
                Self::execute_pooled(queue, tasks, timeout, aggregate).await
            }
        }
    }

    async fn execute_sequential<T, A>(
        tasks: Vec<FanOutFuture<T>>,
        timeout: Duration,
        mut aggregate: A,
    ) -> Result<A::Output>
    where
        A: Aggregate<T>,
    {
        let total = tasks.len();
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        let mut completed = 0;

        for task in tasks {
            let item = match deadline {
                None => task.await?,
                Some(deadline) => {
                    // The remaining budget shrinks with each task; an
                    // exhausted budget fails before dispatching further.
                    let remaining = deadline
                        .checked_duration_since(tokio::time::Instant::now())
                        .filter(|d| !d.is_zero())
                        .ok_or_else(|| Error::timeout(completed, total))?;
                    match tokio::time::timeout(remaining, task).await {
                        Ok(result) => result?,
                        Err(_) => return Err(Error::timeout(completed, total)),
                    }
                }
            };
            completed += 1;
            if aggregate.absorb(item) {
                break;
            }
        }
        Ok(aggregate.finish())
    }

    async fn execute_pooled<T, A>(
        queue: &mpsc::Sender<PooledTask>,
        tasks: Vec<FanOutFuture<T>>,
        timeout: Duration,
        mut aggregate: A,
    ) -> Result<A::Output>
    where
        T: Send + 'static,
        A: Aggregate<T>,
    {
        let total = tasks.len();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Result<T>>();

        for task in tasks {
            let result_tx = result_tx.clone();
            let wrapped: PooledTask = Box::pin(async move {
                let outcome = if timeout.is_zero() {
                    task.await
                } else {
                    match tokio::time::timeout(timeout, task).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(0, 1)),
                    }
                };
                // The receiver may be gone after a short-circuit; the late
                // result is simply discarded.
                let _ = result_tx.send(outcome);
            });
            queue
                .send(wrapped)
                .await
                .map_err(|_| Error::Send("fan-out worker pool is shut down".to_string()))?;
        }
        drop(result_tx);

        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        let mut completed = 0;

        while completed < total {
            let received = match deadline {
                None => result_rx.recv().await,
                Some(deadline) => tokio::time::timeout_at(deadline, result_rx.recv())
                    .await
                    .map_err(|_| Error::timeout(completed, total))?,
            };
            match received {
                // Every sender dropped without delivering: a worker died
                // mid-task. Surface it instead of hanging.
                None => {
                    return Err(Error::Send(
                        "fan-out task dropped without delivering a result".to_string(),
                    ));
                }
                Some(Ok(item)) => {
                    completed += 1;
                    if aggregate.absorb(item) {
                        break;
                    }
                }
                Some(Err(err)) => return Err(err),
            }
        }
        Ok(aggregate.finish())
    }
}

impl Drop for FanOutExecutor {
    fn drop(&mut self) {
        // Closing the queue lets idle workers observe `recv() == None` and
        // exit; busy workers finish their current task first.
        if let Mode::Pool { workers, .. } = &self.mode {
            debug!(workers = workers.len(), "shutting down fan-out pool");
        }
    }
}
