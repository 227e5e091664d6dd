//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | Executor                | Runs jobs off the posting thread                  | execute           |
// | ThreadPool              | Fixed set of named workers fed by a channel       | new, with_name    |
// | TokioExecutor           | Runs jobs on a tokio runtime's blocking pool      | new, current      |
//--------------------------------------------------------------------------------------------------

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use tracing::{error, info};

use crate::error::{EventBusError, EventBusResult};

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, typically on other threads.
///
/// The bus uses one executor for background deliveries and one for async deliveries.
/// Executors must not run the job inline on the calling thread.
pub trait Executor: Send + Sync {
    /// Accepts `job` for later execution.
    ///
    /// # Returns
    ///
    /// `Err(ExecutorRejected)` if the job was dropped without running.
    fn execute(&self, job: Job) -> EventBusResult<()>;
}

/// Fixed-size pool of named worker threads sharing one unbounded job channel.
///
/// Dropping the pool closes the channel. Workers finish the jobs already queued and then
/// exit; they are not joined.
pub struct ThreadPool {
    sender: Sender<Job>,
    size: usize,
}

impl ThreadPool {
    /// Creates a pool of `size` workers named `eventbus-<n>`.
    ///
    /// A size of 0 means one worker per available CPU, but at least 2.
    pub fn new(size: usize) -> EventBusResult<Self> {
        Self::with_name("eventbus", size)
    }

    /// Creates a pool whose workers are named `<name>-<n>`.
    pub fn with_name(name: &str, size: usize) -> EventBusResult<Self> {
        let size = if size == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        } else {
            size
        };

        let (sender, receiver) = unbounded::<Job>();
        for worker in 0..size {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("{}-{}", name, worker))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Job panicked on {:?}", thread::current().name());
                        }
                    }
                })
                .map_err(|e| {
                    EventBusError::Config(format!("failed to spawn worker {}-{}: {}", name, worker, e))
                })?;
        }

        info!("Started thread pool {} with {} workers", name, size);
        Ok(Self { sender, size })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> EventBusResult<()> {
        self.sender
            .send(job)
            .map_err(|_| EventBusError::ExecutorRejected("thread pool is shut down".to_string()))
    }
}

/// Runs jobs on the blocking pool of a tokio runtime.
///
/// Handlers are synchronous, so they go to `spawn_blocking` rather than the async workers.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on, if any
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> EventBusResult<()> {
        self.handle.spawn_blocking(job);
        Ok(())
    }
}
