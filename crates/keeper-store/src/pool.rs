use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of background threads draining a job queue.
///
/// Submission is a channel send and never waits for a worker. Shutdown
/// stops accepting jobs, lets the workers finish everything already queued,
/// and joins them.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> StoreResult<Self> {
        let name = name.into();
        if size == 0 {
            return Err(StoreError::InvalidInput(format!(
                "worker pool '{name}' needs at least one worker"
            )));
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(rx))?;
            workers.push(handle);
        }
        debug!(pool = %name, size, "worker pool started");

        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Fails with [`StoreError::Closed`] after shutdown.
    pub fn submit<F>(&self, job: F) -> StoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().expect("pool lock poisoned");
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(job)).map_err(|_| StoreError::Closed),
            None => Err(StoreError::Closed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().expect("pool lock poisoned").is_none()
    }

    /// Run all queued jobs to completion and stop the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().expect("pool lock poisoned").take());

        let workers = std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
        if workers.is_empty() {
            return;
        }
        let current = thread::current().id();
        for worker in workers {
            // A job that drops the last reference to its own pool must not
            // join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(pool = %self.name, "worker thread panicked");
            }
        }
        debug!(pool = %self.name, "worker pool drained");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().expect("pool queue poisoned");
            rx.recv()
        };
        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("background job panicked");
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new("empty", 0),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let pool = WorkerPool::new("drain", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                thread::sleep(Duration::from_micros(100));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 50);
        assert!(pool.is_shut_down());
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new("closed", 2).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(StoreError::Closed)));
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panic", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("boom")).unwrap();
        let counter = Arc::clone(&done);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new("twice", 3).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.size(), 3);
    }
}
