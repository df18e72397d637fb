//! Fixed-size worker pool running batch and transfer jobs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Message {
    name: String,
    job: Job,
}

/// Pool of named worker threads fed from one job channel.
///
/// A panicking job is logged and the worker keeps running.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("lfs-worker-{}", i))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Queue a job. Returns `false` (and drops the job) after shutdown.
    pub fn execute<F>(&self, name: &str, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return false;
        }
        let message = Message {
            name: name.to_string(),
            job: Box::new(job),
        };
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers.
    ///
    /// Safe to call from a job: the calling worker is not joined.
    pub fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the channel drains; the last owner may be one of
        // them, so they are not joined here.
        self.close();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Message>>>) {
    loop {
        let message = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        let Message { name, job } = match message {
            Ok(message) => message,
            Err(_) => break,
        };

        debug!("begin: {}", name);
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job panicked: {}", name);
        }
        debug!("end: {}", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_concurrently() {
        let pool = WorkerPool::new(3).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        for i in 0..3 {
            let barrier = barrier.clone();
            assert!(pool.execute(&format!("job {}", i), move || {
                barrier.wait();
            }));
        }
        // Only returns if all three jobs are running at the same time
        barrier.wait();
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_runs_queued_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute("count", move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.is_shutdown());
        assert!(!pool.execute("late", || {}));
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute("boom", || panic!("boom"));

        let (tx, rx) = mpsc::channel();
        pool.execute("after", move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_from_worker() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = pool.clone();
        pool.execute("stop", move || {
            inner.shutdown();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.is_shutdown());
    }
}
