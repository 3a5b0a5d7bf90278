//! # Worker - Closures on Dedicated Threads
//!
//! Every pipeline stage is one closure driven by one named OS thread:
//!
//! ```text
//!   Worker::run        FnOnce() -> R            one shot, R lands in the result queue
//!   Worker::looping    FnMut() -> LoopControl   repeated until Break / interrupt
//!   TaskQueue::spawn   FnMut(A) -> LoopControl  fed from an input BlockingQueue
//! ```
//!
//! The thread loop is always the same: check the interrupt flag, invoke,
//! stop on `Break`, yield, sleep the requested delay. The sleep is a condvar
//! wait so an interrupt cuts a pacing delay short.
//!
//! A [`LiveController`] is the cloneable handle to the running thread. When
//! the last clone goes away the thread is interrupted and joined.

use crate::blocking_queue::BlockingQueue;
use crate::loop_control::LoopControl;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

type Closer = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Worker State (shared with the thread)
// ============================================================================

struct WorkerState {
    interrupted: AtomicBool,
    running: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            running: AtomicBool::new(true),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _guard = self.sleep_lock.lock();
        self.sleep_cond.notify_all();
    }

    /// Sleep for `delay` unless interrupted first
    fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let deadline = Instant::now() + delay;
        let mut guard = self.sleep_lock.lock();
        while !self.is_interrupted() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.sleep_cond.wait_for(&mut guard, remaining);
        }
    }
}

/// Runs on the worker thread when the loop ends, panics included
struct ExitGuard {
    name: String,
    state: Arc<WorkerState>,
    close_queues: Closer,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(worker = %self.name, "Worker panicked");
        }
        self.state.running.store(false, Ordering::Release);
        (self.close_queues)();
        debug!(worker = %self.name, "Worker finished");
    }
}

// ============================================================================
// Worker Thread (owned by the handles)
// ============================================================================

struct WorkerThread<R> {
    name: String,
    state: Arc<WorkerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
    results: Arc<BlockingQueue<R>>,
    close_queues: Closer,
}

impl<R> WorkerThread<R> {
    fn interrupt(&self, wait: bool) {
        self.state.interrupt();
        (self.close_queues)();
        if wait {
            self.join();
        }
    }

    /// Serialized: a second caller blocks until the first join completes
    fn join(&self) {
        let mut handle = self.handle.lock();
        match handle.as_ref() {
            None => return,
            Some(h) if h.thread().id() == thread::current().id() => {
                warn!(worker = %self.name, "Worker asked to join itself, skipping");
                return;
            }
            Some(_) => {}
        }
        if let Some(h) = handle.take() {
            if h.join().is_err() {
                error!(worker = %self.name, "Worker thread terminated by panic");
            }
        }
    }
}

impl<R> Drop for WorkerThread<R> {
    fn drop(&mut self) {
        if self.state.running.load(Ordering::Acquire) {
            warn!(worker = %self.name, "Last handle dropped while running, forcing shutdown");
        }
        self.interrupt(true);
    }
}

// ============================================================================
// Live Controller
// ============================================================================

/// Shared handle to a running worker and its result queue
pub struct LiveController<R = ()> {
    inner: Arc<WorkerThread<R>>,
}

impl<R> Clone for LiveController<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> std::fmt::Debug for LiveController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveController")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<R> LiveController<R> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.running.load(Ordering::Acquire)
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.state.is_interrupted()
    }

    /// Ask the worker to stop; with `wait`, also join it.
    ///
    /// Wakes the worker out of its pacing sleep and out of any blocking wait
    /// on its input or result queue. Safe to call any number of times from
    /// any clone.
    pub fn request_interrupt(&self, wait: bool) {
        self.inner.interrupt(wait);
    }

    /// Join without interrupting
    pub fn wait_for_finished(&self) {
        self.inner.join();
    }

    /// Next result, blocking until one is available.
    ///
    /// `None` once the worker has finished and every result was taken.
    pub fn result(&self) -> Option<R> {
        self.inner.results.dequeue_blocking()
    }

    /// Block for one result, then take everything else already produced
    pub fn results(&self) -> Vec<R> {
        let mut out = Vec::new();
        if let Some(first) = self.result() {
            out.push(first);
            out.extend(self.inner.results.drain());
        }
        out
    }
}

// ============================================================================
// Spawning
// ============================================================================

fn launch<R, F>(
    name: String,
    mut body: F,
    results: Arc<BlockingQueue<R>>,
    close_queues: Closer,
) -> Result<LiveController<R>, WorkerError>
where
    R: Send + 'static,
    F: FnMut() -> LoopControl + Send + 'static,
{
    let state = Arc::new(WorkerState::new());
    let guard = ExitGuard {
        name: name.clone(),
        state: state.clone(),
        close_queues: close_queues.clone(),
    };

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let guard = guard;
        debug!(worker = %guard.name, "Worker started");
        while !guard.state.is_interrupted() {
            let control = body();
            if control.is_break() {
                break;
            }
            thread::yield_now();
            guard.state.pause(control.delay());
        }
    });

    let handle = match spawned {
        Ok(handle) => handle,
        Err(source) => {
            state.running.store(false, Ordering::Release);
            return Err(WorkerError::Spawn { name, source });
        }
    };

    Ok(LiveController {
        inner: Arc::new(WorkerThread {
            name,
            state,
            handle: Mutex::new(Some(handle)),
            results,
            close_queues,
        }),
    })
}

fn result_closer<R: Send + 'static>(results: &Arc<BlockingQueue<R>>) -> Closer {
    let results = results.clone();
    Arc::new(move || results.set_consumer_limit(0))
}

/// Entry points for closures without an input queue
pub struct Worker;

impl Worker {
    /// Invoke `f` once on a new thread; its return value becomes the result
    pub fn run<R, F>(name: impl Into<String>, f: F) -> Result<LiveController<R>, WorkerError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let results = Arc::new(BlockingQueue::new());
        let sink = results.clone();
        let mut f = Some(f);
        let body = move || {
            if let Some(f) = f.take() {
                sink.enqueue(f());
            }
            LoopControl::Break
        };
        let closer = result_closer(&results);
        launch(name.into(), body, results, closer)
    }

    /// Invoke `f` repeatedly until it returns `Break` or the worker is interrupted
    pub fn looping<F>(name: impl Into<String>, f: F) -> Result<LiveController, WorkerError>
    where
        F: FnMut() -> LoopControl + Send + 'static,
    {
        let results = Arc::new(BlockingQueue::new());
        let closer = result_closer(&results);
        launch(name.into(), f, results, closer)
    }
}

// ============================================================================
// Task Queue (queue-fed workers)
// ============================================================================

/// Input queue feeding a worker one argument per iteration.
///
/// Interrupting the worker closes the queue for waiting; a closed queue is
/// not meant to feed a second worker.
pub struct TaskQueue<A> {
    queue: Arc<BlockingQueue<A>>,
}

impl<A> Clone for TaskQueue<A> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<A: Send + 'static> Default for TaskQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Send + 'static> TaskQueue<A> {
    pub fn new() -> Self {
        Self::with_producer_limit(0)
    }

    /// `push` blocks while `limit` arguments are waiting (0 = unlimited)
    pub fn with_producer_limit(limit: usize) -> Self {
        Self {
            queue: Arc::new(BlockingQueue::with_limits(limit, 1)),
        }
    }

    pub fn push(&self, args: A) {
        self.queue.enqueue(args);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue(&self) -> &Arc<BlockingQueue<A>> {
        &self.queue
    }

    /// Feed each queued argument to `f`.
    ///
    /// `Continue` pops the argument, `Retry` leaves it at the head so the
    /// same value is offered again, `Break` stops the worker without popping.
    pub fn spawn<F>(&self, name: impl Into<String>, mut f: F) -> Result<LiveController, WorkerError>
    where
        A: Clone,
        F: FnMut(A) -> LoopControl + Send + 'static,
    {
        let input = self.queue.clone();
        let body = move || match input.head_blocking() {
            None => LoopControl::Break,
            Some(args) => {
                let control = f(args);
                if control.is_continue() {
                    input.pop_front();
                }
                control
            }
        };
        let results = Arc::new(BlockingQueue::new());
        let closer = self.closer(&results);
        launch(name.into(), body, results, closer)
    }

    /// Pop each queued argument, call `f` and keep every return value as a result
    pub fn spawn_collect<R, F>(
        &self,
        name: impl Into<String>,
        mut f: F,
    ) -> Result<LiveController<R>, WorkerError>
    where
        R: Send + 'static,
        F: FnMut(A) -> R + Send + 'static,
    {
        let input = self.queue.clone();
        let results = Arc::new(BlockingQueue::new());
        let sink = results.clone();
        let body = move || match input.dequeue_blocking() {
            None => LoopControl::Break,
            Some(args) => {
                sink.enqueue(f(args));
                LoopControl::continue_now()
            }
        };
        let closer = self.closer(&results);
        launch(name.into(), body, results, closer)
    }

    fn closer<R: Send + 'static>(&self, results: &Arc<BlockingQueue<R>>) -> Closer {
        let input = self.queue.clone();
        let results = results.clone();
        Arc::new(move || {
            // a stopped worker never drains its input, so producers must not wait on it
            input.set_producer_limit(0);
            input.set_consumer_limit(0);
            results.set_consumer_limit(0);
        })
    }
}
