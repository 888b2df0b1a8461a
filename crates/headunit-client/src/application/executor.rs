//! Background execution context shared by the session use cases.
//!
//! [`AsyncExecutor`] owns a multi-thread Tokio runtime whose lifetime is the
//! lifetime of the head unit: it is built once at construction and shut down
//! once at destruction.  [`Strand`] is a serialized lane on top of it: jobs
//! posted to one strand run one at a time, in submission order, on whichever
//! worker thread is free.
//!
//! # Why a strand? (for beginners)
//!
//! The session state is touched from three places: the device-watcher thread,
//! the executor's workers (bring-up completions, control-channel receives),
//! and the controlling thread.  Instead of locking around every callback, all
//! of them *post* a closure to the same strand.  The strand runs closures
//! strictly one after another, so two callbacks never observe the session in
//! the middle of each other's update.
//!
//! ```text
//! watcher thread ──post──┐
//! executor task  ──post──┼──> [ job | job | job ] ──> strand task (one at a time)
//! UI thread      ──post──┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Name given to every worker thread of the executor.
pub const WORKER_THREAD_NAME: &str = "headunit-io";

/// Error type for executor construction.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A runtime needs at least one worker thread.
    #[error("worker thread count must be at least 1")]
    NoWorkers,

    /// The Tokio runtime could not be built.
    #[error("failed to build async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

// ── AsyncExecutor ─────────────────────────────────────────────────────────────

/// Owns the background Tokio runtime.
///
/// Dropping the executor shuts the runtime down, waiting at most
/// `shutdown_timeout` for the worker threads to finish.  It must therefore be
/// dropped from a synchronous context, never from inside an async task.
pub struct AsyncExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
    shutdown_timeout: Duration,
}

impl AsyncExecutor {
    /// Builds and starts the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::NoWorkers`] when `worker_threads` is zero and
    /// [`ExecutorError::Runtime`] if the OS refuses to create the threads.
    pub fn new(worker_threads: usize, shutdown_timeout: Duration) -> Result<Self, ExecutorError> {
        if worker_threads == 0 {
            return Err(ExecutorError::NoWorkers);
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        info!(worker_threads, "async executor started");
        Ok(Self {
            runtime: Some(runtime),
            handle,
            shutdown_timeout,
        })
    }

    /// Returns a handle that can spawn tasks onto the runtime from any thread.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Creates a new strand bound to this executor.
    pub fn strand(&self) -> Strand {
        Strand::new(&self.handle)
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) has run.
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Stops the runtime.  Calling this more than once is a no-op.
    ///
    /// Outstanding tasks are cancelled at their next await point; posts to a
    /// strand of this executor are dropped from here on.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.shutdown_timeout);
            info!("async executor stopped");
        }
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Strand ────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A serialized execution lane on the executor.
///
/// Cloning a `Strand` yields another handle to the *same* lane.
#[derive(Clone)]
pub struct Strand {
    tx: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Spawns the strand's drain task on `handle`.
    pub fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                // A panicking job must not take the lane down with it.
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(reason = %panic_message(payload.as_ref()), "strand job panicked");
                }
            }
            debug!("strand closed");
        });

        Self { tx }
    }

    /// Queues `job` to run after every job posted before it.
    ///
    /// Returns `false` (and drops the job) once the executor has shut down.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("post to a stopped executor ignored");
            return false;
        }
        true
    }
}

/// Extracts a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
