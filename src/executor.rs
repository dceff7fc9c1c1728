use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, unbounded};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::errors::{Result, ThothError};
use crate::twopc::ResourceError;

type Task<T> = Box<dyn FnOnce() -> std::result::Result<T, ResourceError> + Send>;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // 0 on every thread that is not an executor worker
    static CURRENT_EXECUTOR: Cell<u64> = const { Cell::new(0) };
}

enum ExecutorCommand {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// One queue drained by one worker thread.
///
/// Calls submitted to the same executor run strictly in submission order,
/// calls on different executors run in parallel. A coordinator keeps one
/// executor per enlisted resource manager.
pub struct SerialExecutor {
    id: u64,
    name: String,
    sender: Sender<ExecutorCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::ResourceFailure` if the thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded::<ExecutorCommand>();
        let worker = thread::Builder::new()
            .name(format!("thoth-{}", name))
            .spawn(move || {
                CURRENT_EXECUTOR.with(|current| current.set(id));
                while let Ok(command) = receiver.recv() {
                    match command {
                        ExecutorCommand::Run(job) => job(),
                        ExecutorCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| ThothError::ResourceFailure {
                message: format!("could not start executor {}: {}", name, e),
                source: None,
            })?;
        debug!("started executor {} ({})", name, id);
        Ok(Self {
            id,
            name,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this executor's worker.
    pub fn is_current(&self) -> bool {
        CURRENT_EXECUTOR.with(|current| current.get()) == self.id
    }

    /// Queues `task` and returns a handle to its result.
    ///
    /// Submitting from the worker thread itself runs the task in place, the
    /// worker would otherwise wait on its own queue.
    pub fn submit<T, F>(&self, task: F) -> PendingResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> std::result::Result<T, ResourceError> + Send + 'static,
    {
        let pending = PendingResult::queued(self.id, Box::new(task));
        if self.is_current() {
            pending.run();
            return pending;
        }
        let job = pending.clone();
        if self
            .sender
            .send(ExecutorCommand::Run(Box::new(move || job.run())))
            .is_err()
        {
            warn!("executor {} is shut down, running task on caller", self.name);
            pending.run();
        }
        pending
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        let _ = self.sender.send(ExecutorCommand::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if !self.is_current() && worker.join().is_err() {
                warn!("executor {} worker panicked", self.name);
            }
        }
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct Slot<T> {
    executor_id: u64,
    task: Mutex<Option<Task<T>>>,
    result: Mutex<Option<std::result::Result<T, ResourceError>>>,
    done: Condvar,
}

/// Handle to the outcome of a task submitted to a [`SerialExecutor`].
///
/// Waiting from the owning executor's worker thread runs the task in place
/// if it has not started yet, so a task may wait on work queued behind it.
pub struct PendingResult<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for PendingResult<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + 'static> PendingResult<T> {
    fn queued(executor_id: u64, task: Task<T>) -> Self {
        Self {
            slot: Arc::new(Slot {
                executor_id,
                task: Mutex::new(Some(task)),
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// An already completed result.
    pub fn ready(value: std::result::Result<T, ResourceError>) -> Self {
        Self {
            slot: Arc::new(Slot {
                executor_id: 0,
                task: Mutex::new(None),
                result: Mutex::new(Some(value)),
                done: Condvar::new(),
            }),
        }
    }

    /// Runs the task unless someone else already took it.
    fn run(&self) {
        let Some(task) = self.slot.task.lock().take() else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(task))
            .unwrap_or_else(|payload| Err(ResourceError::Failed(panic_message(payload))));
        *self.slot.result.lock() = Some(outcome);
        self.slot.done.notify_all();
    }

    fn runs_inline(&self) -> bool {
        self.slot.executor_id != 0
            && CURRENT_EXECUTOR.with(|current| current.get()) == self.slot.executor_id
    }

    pub fn is_done(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Blocks until the task finished and returns its outcome.
    pub fn wait(&self) -> std::result::Result<T, ResourceError> {
        if self.runs_inline() {
            self.run();
        }
        let mut result = self.slot.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            self.slot.done.wait(&mut result);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// # Returns
    ///
    /// `None` if the task did not finish in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<std::result::Result<T, ResourceError>> {
        if self.runs_inline() {
            self.run();
        }
        let deadline = Instant::now() + timeout;
        let mut result = self.slot.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return Some(outcome.clone());
            }
            if self.slot.done.wait_until(&mut result, deadline).timed_out() {
                return result.as_ref().cloned();
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}
