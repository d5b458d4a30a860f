//! Bounded worker pool for image builds.
//!
//! Jobs travel over a `crossbeam` channel to a fixed set of threads; each
//! submission returns a receiver for its own result.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use testbed_common::error::{Result, TestbedError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of build workers.
#[derive(Debug)]
pub struct BuildExecutor {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl BuildExecutor {
    /// Spawns `workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(workers: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("testbed-build-{i}"))
                .spawn(move || {
                    for job in receiver {
                        job();
                    }
                })
                .map_err(|e| TestbedError::Io {
                    path: "build worker".into(),
                    source: e,
                })?;
            handles.push(handle);
        }
        tracing::debug!(workers = handles.len(), "build executor started");
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Queues `job` and returns the receiver its result will arrive on.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor has been shut down.
    pub fn submit<T, F>(&self, job: F) -> Result<Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or_else(|| TestbedError::Config {
            message: "build executor is shut down".into(),
        })?;
        let (tx, rx) = channel::bounded(1);
        sender
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .map_err(|_| TestbedError::Config {
                message: "build executor is shut down".into(),
            })?;
        Ok(rx)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.sender.is_none()
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("build worker panicked");
            }
        }
        tracing::debug!("build executor stopped");
    }
}

impl Drop for BuildExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
