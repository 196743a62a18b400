// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The task execution engine: named, strictly-serial work queues.
//!
//! Each queue owns one dedicated worker thread; queues are created lazily and
//! are independent of each other, so different test frameworks run
//! concurrently while jobs for the same framework run one at a time. Callers
//! submit work from any thread and either block for the result, poll a
//! [`TaskHandle`], or get a completion callback marshalled through the host's
//! [`CallbackDispatcher`].
//!
//! Failures inside a job -- including panics -- are caught on the worker and
//! delivered as [`JobError`] values through the result channel; nothing is
//! ever raised across the thread boundary.

use crate::errors::{JobError, JobTimeout};
use std::{
    collections::HashMap,
    fmt, panic,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Number of short polls a blocking result wait performs before the watchdog
/// fires.
const MAX_TRIES: u32 = 100;

/// Lower bound on the poll interval, so very small timeouts still yield a
/// bounded number of wakeups.
const MIN_POLL: Duration = Duration::from_millis(10);

/// Identifier of a submitted task, unique and monotonically increasing per
/// queue for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marshals completion callbacks onto the host's designated dispatch
/// mechanism (an editor main loop, a UI thread, ...).
///
/// [`TaskEngine::run_async`] never invokes callbacks from a worker thread
/// directly; it hands them to the dispatcher from a supervisor thread.
pub trait CallbackDispatcher: Send + Sync {
    /// Runs `callback` on the host's callback context.
    fn dispatch(&self, callback: Box<dyn FnOnce() + Send>);
}

/// A dispatcher that runs callbacks inline on the supervisor thread.
///
/// This is the default when the host has no main-loop requirement.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl CallbackDispatcher for InlineDispatcher {
    fn dispatch(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}

struct CurrentTask {
    task_id: TaskId,
    label: String,
    started: Instant,
}

struct QueueShared {
    name: String,
    current: Mutex<Option<CurrentTask>>,
}

struct Task {
    id: TaskId,
    label: String,
    work: Box<dyn FnOnce() + Send>,
}

/// One named work queue with its dedicated worker thread.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    sender: mpsc::Sender<Task>,
    worker_thread: thread::ThreadId,
    next_task_id: AtomicU64,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    fn new(name: &str) -> Self {
        let shared = Arc::new(QueueShared {
            name: name.to_owned(),
            current: Mutex::new(None),
        });
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("testscout-worker-{name}"))
            .spawn(move || worker_loop(worker_shared, receiver))
            .expect("failed to spawn queue worker thread");

        Self {
            shared,
            sender,
            worker_thread: worker.thread().id(),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn next_task_id(&self) -> TaskId {
        // fetch_add makes ids unique even under concurrent submission.
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn submit_inner<T, F>(self: &Arc<Self>, label: &str, job: F) -> Result<TaskHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        let task_id = self.next_task_id();
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let work = Box::new(move || {
            let result = panic::catch_unwind(panic::AssertUnwindSafe(job)).unwrap_or_else(
                |payload| {
                    Err(JobError::Panic {
                        message: panic_message(payload),
                    })
                },
            );
            // The receiver may have given up on a timed-out task; that must
            // not wedge the worker.
            let _ = result_tx.send(result);
        });

        debug!(queue = %self.shared.name, task = %task_id, label, "submitting job");
        self.sender
            .send(Task {
                id: task_id,
                label: label.to_owned(),
                work,
            })
            .map_err(|_| JobError::WorkerGone {
                queue: self.shared.name.clone(),
            })?;

        Ok(TaskHandle {
            queue: self.clone(),
            task_id,
            result: result_rx,
        })
    }

    fn run_blocking_inner<T, F>(
        self: &Arc<Self>,
        label: &str,
        job: F,
        timeout: Option<Duration>,
    ) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        if thread::current().id() == self.worker_thread {
            // Re-entrant call from inside our own worker: run in-line instead
            // of enqueueing, which would deadlock against ourselves.
            debug!(queue = %self.shared.name, label, "re-entrant call, executing in-line");
            return job();
        }

        self.submit_inner(label, job)?.wait(timeout)
    }

    /// Logs what the worker is currently doing. Called by the watchdog when a
    /// result wait exhausts its retry budget.
    fn dump_current(&self, waiting_for: TaskId) {
        let current = self.shared.current.lock().expect("current-task lock poisoned");
        match &*current {
            Some(task) => warn!(
                queue = %self.shared.name,
                waiting_for = %waiting_for,
                running = %task.task_id,
                label = %task.label,
                busy_ms = task.started.elapsed().as_millis(),
                "result wait exhausted its retry budget; worker is busy"
            ),
            None => warn!(
                queue = %self.shared.name,
                waiting_for = %waiting_for,
                "result wait exhausted its retry budget; worker is idle"
            ),
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>, receiver: mpsc::Receiver<Task>) {
    debug!(queue = %shared.name, "worker started");
    while let Ok(task) = receiver.recv() {
        debug!(queue = %shared.name, task = %task.id, label = %task.label, "processing job");
        *shared.current.lock().expect("current-task lock poisoned") = Some(CurrentTask {
            task_id: task.id,
            label: task.label,
            started: Instant::now(),
        });
        (task.work)();
        *shared.current.lock().expect("current-task lock poisoned") = None;
        debug!(queue = %shared.name, task = %task.id, "job finished");
    }
    debug!(queue = %shared.name, "worker shutting down");
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "opaque panic payload".to_owned(),
        },
    }
}

/// A submitted task: the correlation id plus the channel its result will
/// arrive on.
pub struct TaskHandle<T> {
    queue: Arc<WorkQueue>,
    task_id: TaskId,
    result: mpsc::Receiver<Result<T, JobError>>,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("queue", &self.queue.name())
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl<T> TaskHandle<T> {
    /// The id assigned to this task by its queue.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Blocks until the worker produces a result, or until `timeout` elapses.
    ///
    /// The wait is a bounded poll-and-retry loop rather than one unbounded
    /// blocking call: when the retry budget runs out, the watchdog logs the
    /// worker's state and a [`JobTimeout`] is returned.
    pub fn wait(self, timeout: Option<Duration>) -> Result<T, JobError> {
        let Some(timeout) = timeout else {
            return self.result.recv().map_err(|_| JobError::WorkerGone {
                queue: self.queue.name().to_owned(),
            })?;
        };

        let poll = (timeout / MAX_TRIES).max(MIN_POLL);
        let start = Instant::now();
        for _ in 0..MAX_TRIES {
            match self.result.recv_timeout(poll) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if start.elapsed() >= timeout {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(JobError::WorkerGone {
                        queue: self.queue.name().to_owned(),
                    });
                }
            }
        }

        self.queue.dump_current(self.task_id);
        Err(JobTimeout {
            queue: self.queue.name().to_owned(),
            task_id: self.task_id,
            elapsed: start.elapsed(),
        }
        .into())
    }
}

/// The engine: a lazily-populated set of named work queues plus the callback
/// dispatcher used by [`run_async`](Self::run_async).
pub struct TaskEngine {
    queues: Mutex<HashMap<String, Arc<WorkQueue>>>,
    dispatcher: Arc<dyn CallbackDispatcher>,
}

impl fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEngine").finish_non_exhaustive()
    }
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEngine {
    /// Creates an engine whose async callbacks run inline on the supervisor
    /// thread.
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(InlineDispatcher))
    }

    /// Creates an engine that marshals async callbacks through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn CallbackDispatcher>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    fn queue(&self, name: &str) -> Arc<WorkQueue> {
        let mut queues = self.queues.lock().expect("queue map lock poisoned");
        queues
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(WorkQueue::new(name)))
            .clone()
    }

    /// Enqueues `job` on the named queue and returns a handle for retrieving
    /// its result later.
    pub fn submit<T, F>(&self, queue: &str, label: &str, job: F) -> Result<TaskHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        self.queue(queue).submit_inner(label, job)
    }

    /// Submits `job` and blocks the calling thread until the worker produces
    /// a result or `timeout` elapses.
    ///
    /// When invoked from inside the worker thread of `queue` itself, the job
    /// runs immediately in-line instead of enqueueing, avoiding
    /// self-deadlock.
    pub fn run_blocking<T, F>(
        &self,
        queue: &str,
        label: &str,
        job: F,
        timeout: Option<Duration>,
    ) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        self.queue(queue).run_blocking_inner(label, job, timeout)
    }

    /// Submits `job` and returns immediately; `on_done` is invoked with the
    /// result through the engine's [`CallbackDispatcher`] once the job
    /// completes.
    ///
    /// A supervisor thread performs the blocking wait so the worker thread
    /// never runs host callbacks itself.
    pub fn run_async<T, F, C>(&self, queue: &str, label: &str, job: F, on_done: C)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
        C: FnOnce(Result<T, JobError>) + Send + 'static,
    {
        let queue = self.queue(queue);
        let dispatcher = self.dispatcher.clone();
        let label = label.to_owned();
        thread::Builder::new()
            .name(format!("testscout-supervisor-{}", queue.name()))
            .spawn(move || {
                let result = queue.run_blocking_inner(&label, job, None);
                dispatcher.dispatch(Box::new(move || on_done(result)));
            })
            .expect("failed to spawn supervisor thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn jobs_run_in_submission_order() {
        let engine = TaskEngine::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                engine
                    .submit("order", &format!("job-{i}"), move || {
                        log.lock().unwrap().push(i);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait(Some(Duration::from_secs(5))).unwrap();
        }

        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn task_ids_are_unique_and_increasing_under_concurrency() {
        let engine = Arc::new(TaskEngine::new());
        let (tx, rx) = channel();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = engine.submit("ids", "noop", || Ok(())).unwrap();
                        tx.send(handle.task_id()).unwrap();
                        handle.wait(Some(Duration::from_secs(5))).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);
        for t in threads {
            t.join().unwrap();
        }

        let mut ids: Vec<TaskId> = rx.iter().collect();
        assert_eq!(ids.len(), 400);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400, "task ids must be unique");
    }

    #[test]
    fn queues_are_independent() {
        let engine = TaskEngine::new();
        let (tx, rx) = channel();

        // A job wedges queue `slow`; queue `fast` must still make progress.
        let blocker = engine
            .submit("slow", "blocker", move || {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        engine
            .submit("fast", "ping", move || {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap()
            .wait(Some(Duration::from_secs(5)))
            .unwrap();

        rx.recv_timeout(Duration::from_millis(100)).unwrap();
        blocker.wait(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn job_errors_are_delivered_as_data() {
        let engine = TaskEngine::new();
        let result: Result<(), _> = engine.run_blocking(
            "errors",
            "fails",
            || {
                Err(JobError::ExitCode {
                    command: "false".to_owned(),
                    code: 1,
                    message: None,
                })
            },
            Some(Duration::from_secs(5)),
        );
        assert!(matches!(result, Err(JobError::ExitCode { code: 1, .. })));
    }

    #[test]
    fn panics_become_job_errors_and_do_not_wedge_the_worker() {
        let engine = TaskEngine::new();
        let result: Result<(), _> = engine.run_blocking(
            "panics",
            "boom",
            || panic!("boom"),
            Some(Duration::from_secs(5)),
        );
        match result {
            Err(JobError::Panic { message }) => assert_eq!(message, "boom"),
            other => panic!("expected panic error, got {other:?}"),
        }

        // The worker survives and keeps processing.
        let value = engine
            .run_blocking("panics", "after", || Ok(7), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn reentrant_run_blocking_executes_inline() {
        let engine = Arc::new(TaskEngine::new());
        let inner_engine = engine.clone();

        let value = engine
            .run_blocking(
                "reentrant",
                "outer",
                move || {
                    // Same queue, from inside its own worker: must not deadlock.
                    inner_engine.run_blocking(
                        "reentrant",
                        "inner",
                        || Ok(42),
                        Some(Duration::from_secs(1)),
                    )
                },
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn wait_times_out_with_job_timeout() {
        let engine = TaskEngine::new();
        let result: Result<(), _> = engine.run_blocking(
            "timeouts",
            "sleeper",
            || {
                thread::sleep(Duration::from_millis(600));
                Ok(())
            },
            Some(Duration::from_millis(50)),
        );
        match result {
            Err(JobError::Timeout(timeout)) => {
                assert_eq!(timeout.queue, "timeouts");
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // A timed-out job does not corrupt the queue; later jobs still run.
        let value = engine
            .run_blocking("timeouts", "after", || Ok(1), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn run_async_marshals_result_through_dispatcher() {
        struct CountingDispatcher(AtomicU64);
        impl CallbackDispatcher for CountingDispatcher {
            fn dispatch(&self, callback: Box<dyn FnOnce() + Send>) {
                self.0.fetch_add(1, Ordering::Relaxed);
                callback();
            }
        }

        let dispatcher = Arc::new(CountingDispatcher(AtomicU64::new(0)));
        let engine = TaskEngine::with_dispatcher(dispatcher.clone());
        let (tx, rx) = channel();

        engine.run_async("async", "job", || Ok(99), move |result| {
            tx.send(result).unwrap();
        });

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap(), 99);
        assert_eq!(dispatcher.0.load(Ordering::Relaxed), 1);
    }
}
