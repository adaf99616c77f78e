//! Background execution context for transaction producers.
//!
//! Producers run on a dedicated rayon pool when one was installed through
//! [`crate::init`], otherwise on rayon's global pool.

use std::sync::OnceLock;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

static WORKER_POOL: OnceLock<rayon::ThreadPool> = OnceLock::new();

/// Build and install the process worker pool.
pub(crate) fn install_pool(config: &SchedulerConfig) -> Result<()> {
    if WORKER_POOL.get().is_some() {
        return Err(Error::WorkerPoolInitialized);
    }

    let pool = build_thread_pool(config)?;
    let threads = pool.current_num_threads();
    WORKER_POOL
        .set(pool)
        .map_err(|_| Error::WorkerPoolInitialized)?;

    log::info!(
        "Worker pool ready: {} threads named {}-N",
        threads,
        config.thread_name
    );
    Ok(())
}

fn build_thread_pool(config: &SchedulerConfig) -> Result<rayon::ThreadPool> {
    if config.worker_threads == Some(0) {
        return Err(Error::InvalidWorkerThreads);
    }

    let name = config.thread_name.clone();
    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(move |i| format!("{name}-{i}"));
    if let Some(n) = config.worker_threads {
        builder = builder.num_threads(n);
    }
    Ok(builder.build()?)
}

/// Run `job` on the installed worker pool, or rayon's global pool.
pub(crate) fn spawn<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    match WORKER_POOL.get() {
        Some(pool) => pool.spawn_fifo(job),
        None => rayon::spawn_fifo(job),
    }
}
