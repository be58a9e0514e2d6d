//! Fetch Worker Pool
//!
//! Fixed set of named worker threads pulling fetch jobs from a crossbeam
//! channel. One job per entry; jobs check their own cancellation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Unit of work executed by a pool thread.
pub type FetchJob = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of fetch worker threads.
pub struct FetchWorkerPool {
    sender: Mutex<Option<Sender<FetchJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    /// Jobs submitted and not yet finished
    in_flight: Arc<AtomicUsize>,
}

impl FetchWorkerPool {
    /// Start `num_workers` threads (at least one).
    pub fn new(num_workers: usize) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = channel::unbounded::<FetchJob>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight = in_flight.clone();
            let handle = thread::Builder::new()
                .name(format!("tileres-fetch-{}", id))
                .spawn(move || {
                    for job in receiver.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!(worker = id, "fetch job panicked");
                        }
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                    debug!(worker = id, "fetch worker exiting");
                })?;
            workers.push(handle);
        }

        let worker_ids = workers.iter().map(|w| w.thread().id()).collect();
        info!(workers = num_workers, "fetch worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_ids,
            in_flight,
        })
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.worker_ids.len()
    }

    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn submit(&self, job: FetchJob) -> Result<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(Error::PoolShutDown)?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send(job).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::PoolShutDown);
        }
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs, let queued jobs finish and join the threads.
    ///
    /// Called from one of the pool's own threads it only closes the queue.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        if self.worker_ids.contains(&thread::current().id()) {
            debug!("fetch pool shut down from a worker thread, not joining");
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("fetch worker thread panicked");
            }
        }
        info!("fetch worker pool stopped");
    }
}

impl Drop for FetchWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
