use std::{future::Future, io, num::NonZeroUsize};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

use crate::config::WorkerConfig;

/// A handle to one of the worker pools. Cheap to clone and safe to move into
/// per-report tasks.
#[derive(Clone)]
pub struct RuntimeHandle(Handle);

impl RuntimeHandle {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0.spawn(future)
    }
}

/// The two fixed-size pools every job is processed on.
///
/// The blocking pool runs operations that may stall on external calls
/// (decryption-key fetch, privacy-budget bridge); the non-blocking pool runs
/// the CPU-bound merge and noise work. The split keeps a slow budget check
/// from holding up histogram updates for reports that are already decrypted.
///
/// Pool sizes come from [`WorkerConfig`], not from the job.
pub struct WorkerPools {
    blocking: Runtime,
    non_blocking: Runtime,
}

impl WorkerPools {
    /// ## Errors
    /// If either tokio runtime cannot be created.
    pub fn new(config: &WorkerConfig) -> io::Result<Self> {
        Ok(Self {
            blocking: build_runtime("agg-blocking", config.blocking_pool_size)?,
            non_blocking: build_runtime("agg-compute", config.non_blocking_pool_size)?,
        })
    }

    #[must_use]
    pub fn blocking(&self) -> RuntimeHandle {
        RuntimeHandle(self.blocking.handle().clone())
    }

    #[must_use]
    pub fn non_blocking(&self) -> RuntimeHandle {
        RuntimeHandle(self.non_blocking.handle().clone())
    }
}

fn build_runtime(name: &str, threads: NonZeroUsize) -> io::Result<Runtime> {
    // Only the time driver is enabled. The pools never do direct socket IO;
    // external calls go through collaborator traits that bring their own IO.
    Builder::new_multi_thread()
        .worker_threads(threads.get())
        .thread_name(name)
        .enable_time()
        .build()
}
