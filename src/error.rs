use thiserror::Error;

/// Errors raised by the scheduling infrastructure.
///
/// The drawing path itself never fails: stale requests, a missing delegate and
/// empty producer results all collapse into "no update". These variants cover
/// the run loop and the worker pool only.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Event loop error: {0}")]
    EventLoop(#[from] calloop::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Worker pool is already initialized")]
    WorkerPoolInitialized,
    #[error("Worker thread count must be at least 1")]
    InvalidWorkerThreads,
    #[error("Run loop is already dispatching on this thread")]
    Reentrant,
}

pub type Result<T> = std::result::Result<T, Error>;
