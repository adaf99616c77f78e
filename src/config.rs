//! Process-wide scheduler configuration.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::run_loop::LoopPhase;

/// Commit phases picked up by main transaction groups created from now on.
static COMMIT_PHASES: AtomicU8 =
    AtomicU8::new(LoopPhase::BEFORE_WAITING.bits() | LoopPhase::EXIT.bits());

pub(crate) fn set_commit_phases(phases: LoopPhase) {
    COMMIT_PHASES.store(phases.bits(), Ordering::Relaxed);
}

pub(crate) fn commit_phases() -> LoopPhase {
    LoopPhase::from_bits_truncate(COMMIT_PHASES.load(Ordering::Relaxed))
}

/// Configuration for the worker pool and the default commit phases.
///
/// Use the builder pattern and pass the result to [`crate::init`] before any
/// drawing happens:
///
/// ```ignore
/// drawlayer::init(
///     SchedulerConfig::new()
///         .worker_threads(4)
///         .thread_name("render-worker")
///         .commit_phases(LoopPhase::BEFORE_WAITING | LoopPhase::EXIT),
/// )?;
/// ```
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Number of background producer threads. None lets rayon decide.
    pub worker_threads: Option<usize>,
    /// Name prefix for worker threads (a `-N` index is appended).
    pub thread_name: String,
    /// Phases on which the main transaction group commits.
    pub commit_phases: LoopPhase,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "drawlayer-worker".to_string(),
            commit_phases: LoopPhase::BEFORE_WAITING | LoopPhase::EXIT,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the run loop phases that trigger a commit of the main group.
    pub fn commit_phases(mut self, phases: LoopPhase) -> Self {
        self.commit_phases = phases;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_commits_before_waiting_and_on_exit() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_threads, None);
        assert!(config.commit_phases.contains(LoopPhase::BEFORE_WAITING));
        assert!(config.commit_phases.contains(LoopPhase::EXIT));
        assert!(!config.commit_phases.contains(LoopPhase::AFTER_WAITING));
    }

    #[test]
    fn test_builder_overrides() {
        let config = SchedulerConfig::new()
            .worker_threads(3)
            .thread_name("painter")
            .commit_phases(LoopPhase::AFTER_WAITING);
        assert_eq!(config.worker_threads, Some(3));
        assert_eq!(config.thread_name, "painter");
        assert_eq!(config.commit_phases, LoopPhase::AFTER_WAITING);
    }
}
