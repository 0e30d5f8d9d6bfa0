//! Frame executor
//!
//! Runs a frame graph either inline on the calling thread or asynchronously:
//! worker-affinity levels are driven on the rayon pool while main-affinity
//! work is parked on a main-thread queue in level order. The completion
//! event is the only blocking suspension point exposed to callers.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::graph::{Affinity, FrameGraph, Work};

/// A waitable one-shot event.
///
/// Cloned handles observe the same signal.
#[derive(Clone, Default)]
pub struct CompletionEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the event signaled and wake all waiters.
    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    /// Block until signaled or the timeout elapses. Returns whether signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            let (guard, result) = cvar.wait_timeout(done, timeout).unwrap();
            done = guard;
            if result.timed_out() {
                return *done;
            }
        }
        true
    }
}

/// FIFO queue of work that must run on the designated main thread.
#[derive(Clone, Default)]
pub struct MainThreadQueue {
    inner: Arc<(Mutex<Vec<Work>>, Condvar)>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, work: Work) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().push(work);
        cvar.notify_all();
    }

    /// Run everything currently queued. Must only be called from the main thread.
    pub fn run_pending(&self) -> usize {
        let pending = {
            let (lock, _) = &*self.inner;
            std::mem::take(&mut *lock.lock().unwrap())
        };
        let count = pending.len();
        for work in pending {
            work();
        }
        count
    }

    fn wait_nonempty(&self, timeout: Duration) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        if guard.is_empty() {
            let _ = cvar.wait_timeout(guard, timeout).unwrap();
        }
    }
}

/// Executes frame graphs.
///
/// One executor is shared by all simulations on a frame; its queue is the
/// designated main-thread lane.
#[derive(Clone, Default)]
pub struct FrameExecutor {
    queue: MainThreadQueue,
}

impl FrameExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_queue(&self) -> &MainThreadQueue {
        &self.queue
    }

    /// Run the whole graph synchronously on the calling thread, in level order.
    ///
    /// The caller is treated as the main thread, so main-affinity tasks run
    /// inline as well.
    pub fn run_inline(&self, graph: FrameGraph) {
        trace!(tasks = graph.task_count(), "running frame graph inline");
        for level in graph.levels {
            for node in level.nodes {
                trace!(task = %node.id, "run");
                (node.work)();
            }
        }
    }

    /// Dispatch the graph asynchronously.
    ///
    /// Worker levels run on the rayon pool; main-affinity tasks are pushed to
    /// the main-thread queue once the worker tasks of all preceding levels
    /// have completed. Returns immediately.
    pub fn dispatch(&self, graph: FrameGraph) {
        let queue = self.queue.clone();
        debug!(tasks = graph.task_count(), "dispatching frame graph");
        rayon::spawn(move || {
            for level in graph.levels {
                let mut main_tasks = Vec::new();
                let mut worker_tasks = Vec::new();
                for node in level.nodes {
                    match node.affinity {
                        Affinity::Main => main_tasks.push(node.work),
                        Affinity::Worker => worker_tasks.push(node.work),
                    }
                }
                rayon::scope(|s| {
                    for work in worker_tasks {
                        s.spawn(move |_| work());
                    }
                });
                for work in main_tasks {
                    queue.push(work);
                }
            }
        });
    }

    /// Block the main thread until `completion` is signaled, draining the
    /// main-thread queue while waiting. The join task that signals the event
    /// is itself main-affinity work, so it runs inside the drain.
    pub fn wait_for(&self, completion: &CompletionEvent) {
        loop {
            self.queue.run_pending();
            if completion.is_signaled() {
                // Drain anything pushed between the last run and the signal.
                self.queue.run_pending();
                return;
            }
            self.queue.wait_nonempty(Duration::from_millis(1));
        }
    }
}
