//! Worker pools that run fan-out branches and peer-to-peer activator loops.
//!
//! Workflows never reach for a global pool. Pass one in with
//! [`crate::WorkflowBuilder::executor`]; without it each task gets its own
//! thread.

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs off the caller's thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Spawns a fresh OS thread per job.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        thread::spawn(job);
    }
}

/// A fixed set of worker threads pulling jobs from a shared queue.
///
/// Jobs block their worker for as long as the agent call takes. A pool
/// smaller than the number of agents that can be active at once serialises
/// them, and nesting a peer-to-peer workflow inside a pool it also runs on
/// can starve it.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `size` workers (at least one). Fails if a thread cannot be
    /// spawned; workers already started exit once the queue is dropped.
    pub fn new(size: usize) -> io::Result<Arc<Self>> {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("agent-loom-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }))
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => {
                if let Err(err) = tx.send(job) {
                    // Every worker is gone; run inline rather than drop work.
                    (err.into_inner())();
                }
            }
            None => {
                tracing::warn!("worker pool is shut down, running job inline");
                job();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn thread_executor_runs_job() {
        let (tx, rx) = mpsc::channel();
        ThreadExecutor.execute(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn pool_runs_all_jobs() {
        let pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = Arc::clone(&count);
            pool.execute(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn shut_down_pool_runs_inline() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn new_pool_propagates_spawn_result() -> io::Result<()> {
        let pool = WorkerPool::new(0)?;
        assert_eq!(pool.size(), 1);
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(()).unwrap()));
        rx.recv().unwrap();
        Ok(())
    }
}
