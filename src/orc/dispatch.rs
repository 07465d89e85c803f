//! Task dispatch for materialization work.
//!
//! The session hands every top-level materialization to a [`TaskDispatcher`].
//! [`ThreadPoolDispatcher`] runs tasks on a fixed set of workers fed by a
//! crossbeam channel; [`InPlaceDispatcher`] runs them on the submitting
//! thread.

use crossbeam::channel::{unbounded, Sender};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Type-erased work item.
type BoxedWork = Box<dyn FnOnce() + Send + 'static>;

/// A named unit of work.
pub struct Task {
    name: String,
    work: BoxedWork,
}

impl Task {
    pub fn new(name: impl Into<String>, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            work: Box::new(work),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(self) {
        log::trace!("running task `{}`", self.name);
        (self.work)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

/// Executor policy for materialization tasks.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, task: Task);

    /// Stop accepting work and wait for queued tasks to finish.
    fn shutdown(&self);

    /// True when called from one of this dispatcher's own threads.
    fn is_worker_thread(&self) -> bool {
        false
    }
}

/// Runs every task immediately on the caller's thread.
#[derive(Debug, Default)]
pub struct InPlaceDispatcher;

impl TaskDispatcher for InPlaceDispatcher {
    fn dispatch(&self, task: Task) {
        task.run();
    }

    fn shutdown(&self) {}
}

/// Fixed-size worker pool.
pub struct ThreadPoolDispatcher {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Arc<RwLock<HashSet<ThreadId>>>,
    completed: Arc<AtomicUsize>,
}

impl ThreadPoolDispatcher {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = unbounded::<Task>();
        let worker_ids = Arc::new(RwLock::new(HashSet::new()));
        let completed = Arc::new(AtomicUsize::new(0));

        let workers = (0..num_threads)
            .filter_map(|idx| {
                let receiver = receiver.clone();
                let worker_ids = worker_ids.clone();
                let completed = completed.clone();
                let spawned = thread::Builder::new()
                    .name(format!("jit-worker-{idx}"))
                    .spawn(move || {
                        worker_ids.write().insert(thread::current().id());
                        while let Ok(task) = receiver.recv() {
                            task.run();
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        log::trace!("worker {} exiting", idx);
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        log::warn!("failed to spawn jit worker {}: {}", idx, e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        log::debug!("started thread pool with {} worker(s)", workers.len());

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_ids,
            completed,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Tasks run to completion so far.
    pub fn completed_tasks(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

impl TaskDispatcher for ThreadPoolDispatcher {
    fn dispatch(&self, task: Task) {
        let sender = self.sender.lock().clone();
        let rejected = match (sender, self.num_workers()) {
            (Some(sender), n) if n > 0 => match sender.send(task) {
                Ok(()) => None,
                Err(err) => Some(err.into_inner()),
            },
            (_, _) => Some(task),
        };

        // Shut down or no workers: run inline so the task is never lost.
        if let Some(task) = rejected {
            log::debug!("running task `{}` inline", task.name());
            task.run();
        }
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_worker_thread() {
            log::warn!("thread pool shut down from a worker thread, not joining");
            return;
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("jit worker panicked");
            }
        }
    }

    fn is_worker_thread(&self) -> bool {
        self.worker_ids.read().contains(&thread::current().id())
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_in_place_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        InPlaceDispatcher.dispatch(Task::new("inc", move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_runs_on_workers() {
        let pool = ThreadPoolDispatcher::new(2);
        assert_eq!(pool.num_workers(), 2);
        assert!(!pool.is_worker_thread());

        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.dispatch(Task::new(format!("task{i}"), move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }));
        }

        let mut seen: Vec<_> = (0..8).map(|_| rx.recv().unwrap()).collect();
        seen.sort_by_key(|(i, _)| *i);
        assert_eq!(seen.len(), 8);
        assert!(seen
            .iter()
            .all(|(_, name)| name.as_deref().unwrap_or("").starts_with("jit-worker-")));

        pool.shutdown();
        assert_eq!(pool.completed_tasks(), 8);
    }

    #[test]
    fn test_dispatch_after_shutdown_runs_inline() {
        let pool = ThreadPoolDispatcher::new(1);
        pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.dispatch(Task::new("late", move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
