//! Asynchronous units of work with coordinating-thread completions.
//!
//! A [`Transaction`] starts its producer on a worker thread as soon as it is
//! created. The result is parked in a one-slot channel until
//! [`Transaction::commit`] runs the completion on whatever thread commits,
//! which in practice is always the run loop thread driving a
//! [`TransactionGroup`].

mod group;

pub use group::TransactionGroup;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::worker;

const CREATED: u8 = 0;
const PRODUCING: u8 = 1;
const PRODUCED: u8 = 2;
const COMMITTED: u8 = 3;

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Producer scheduled but not yet picked up by a worker
    Created,
    /// Producer running on a worker
    Producing,
    /// Result parked, waiting for commit
    Produced,
    /// Completion invoked (terminal)
    Committed,
}

impl TransactionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CREATED => Self::Created,
            PRODUCING => Self::Producing,
            PRODUCED => Self::Produced,
            _ => Self::Committed,
        }
    }
}

type Completion<T> = Box<dyn FnOnce(Option<T>)>;

/// One background render-and-deliver unit.
pub struct Transaction<T> {
    result: Receiver<Option<T>>,
    completion: Option<Completion<T>>,
    state: Arc<AtomicU8>,
}

impl<T: Send + 'static> Transaction<T> {
    /// Create a transaction and schedule `producer` on the worker pool.
    ///
    /// `completion` receives the producer's result when the transaction is
    /// committed. A `None` result means "leave the presented state alone".
    pub fn new<P, C>(producer: P, completion: C) -> Self
    where
        P: FnOnce() -> Option<T> + Send + 'static,
        C: FnOnce(Option<T>) + 'static,
    {
        Self::start(producer, completion, |job| worker::spawn(job))
    }

    /// Like [`Transaction::new`], but runs the producer on `pool`.
    pub fn spawn_on<P, C>(pool: &rayon::ThreadPool, producer: P, completion: C) -> Self
    where
        P: FnOnce() -> Option<T> + Send + 'static,
        C: FnOnce(Option<T>) + 'static,
    {
        Self::start(producer, completion, |job| pool.spawn_fifo(job))
    }

    fn start<P, C, S>(producer: P, completion: C, spawn: S) -> Self
    where
        P: FnOnce() -> Option<T> + Send + 'static,
        C: FnOnce(Option<T>) + 'static,
        S: FnOnce(Box<dyn FnOnce() + Send>),
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let state = Arc::new(AtomicU8::new(CREATED));

        let job_state = state.clone();
        spawn(Box::new(move || {
            job_state.store(PRODUCING, Ordering::Release);
            let value = match panic::catch_unwind(AssertUnwindSafe(producer)) {
                Ok(value) => value,
                Err(_) => {
                    log::error!("Transaction producer panicked, committing an empty result");
                    None
                }
            };
            job_state.store(PRODUCED, Ordering::Release);
            // The receiver is gone if the transaction was dropped uncommitted
            let _ = tx.send(value);
        }));

        Self {
            result: rx,
            completion: Some(Box::new(completion)),
            state,
        }
    }
}

impl<T> Transaction<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        TransactionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether the producer has finished.
    pub fn is_produced(&self) -> bool {
        matches!(
            self.state(),
            TransactionState::Produced | TransactionState::Committed
        )
    }

    /// Run the completion with the produced value.
    ///
    /// Blocks until the producer finishes if it is still running. Returns
    /// `false` without doing anything if the transaction was already committed.
    pub fn commit(&mut self) -> bool {
        let Some(completion) = self.completion.take() else {
            return false;
        };

        let value = match self.result.recv() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Transaction producer was dropped before running");
                None
            }
        };

        self.state.store(COMMITTED, Ordering::Release);
        completion(value);
        true
    }
}

/// Type-erased commit so a group can hold transactions of any result type.
pub(crate) trait PendingCommit {
    fn commit(&mut self) -> bool;
}

impl<T> PendingCommit for Transaction<T> {
    fn commit(&mut self) -> bool {
        Transaction::commit(self)
    }
}
