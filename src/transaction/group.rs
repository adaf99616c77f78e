use std::cell::{OnceCell, RefCell};
use std::rc::Rc;

use super::{PendingCommit, Transaction};
use crate::config;
use crate::drawing_layer;
use crate::run_loop::{LoopPhase, PhaseObserver, RunLoop};

thread_local! {
    /// Default batching scope of this coordinating thread.
    ///
    /// Created on first access together with its observer on the thread's
    /// run loop, and kept until the thread exits. Layers that find no group
    /// in their ancestry attach this one.
    static MAIN_GROUP: OnceCell<Rc<TransactionGroup>> = const { OnceCell::new() };
}

/// Ordered batch of pending transactions committed together.
///
/// All access happens on the coordinating thread, so the pending list is a
/// plain `RefCell` and the type is `!Send`.
pub struct TransactionGroup {
    pending: RefCell<Vec<Box<dyn PendingCommit>>>,
    observer: RefCell<Option<PhaseObserver>>,
}

impl TransactionGroup {
    /// Create a group that is only committed manually.
    pub fn new() -> Self {
        Self {
            pending: RefCell::new(Vec::new()),
            observer: RefCell::new(None),
        }
    }

    /// Create a group that commits itself whenever `run_loop` reaches one of
    /// `phases`.
    ///
    /// Marked drawing layers are displayed right before each commit.
    pub fn with_observer(run_loop: &RunLoop, phases: LoopPhase) -> Rc<Self> {
        let group = Rc::new(Self::new());
        let weak = Rc::downgrade(&group);
        let observer = PhaseObserver::new(run_loop, phases, move |phase| {
            if let Some(group) = weak.upgrade() {
                let displayed = drawing_layer::display_marked_layers();
                if displayed > 0 {
                    log::trace!("{:?}: displayed {} marked layers", phase, displayed);
                }
                let committed = group.commit_all();
                if committed > 0 {
                    log::debug!("{:?}: committed {} transactions", phase, committed);
                }
            }
        });
        *group.observer.borrow_mut() = Some(observer);
        group
    }

    /// The main group of the current thread.
    ///
    /// It commits on the configured phases of [`RunLoop::current`]
    /// (`BEFORE_WAITING | EXIT` unless changed through [`crate::init`]). If
    /// the run loop cannot be created the group still collects transactions,
    /// but has to be committed by hand.
    pub fn main() -> Rc<Self> {
        MAIN_GROUP.with(|main| {
            main.get_or_init(|| match RunLoop::current() {
                Ok(run_loop) => {
                    let phases = config::commit_phases();
                    log::debug!("Creating main transaction group committing on {:?}", phases);
                    Self::with_observer(&run_loop, phases)
                }
                Err(err) => {
                    log::error!("No run loop for the main transaction group: {}", err);
                    Rc::new(Self::new())
                }
            })
            .clone()
        })
    }

    /// Queue a transaction for the next commit.
    pub fn add<T: 'static>(&self, transaction: Transaction<T>) {
        self.pending.borrow_mut().push(Box::new(transaction));
    }

    /// Commit every transaction queued so far, in insertion order.
    ///
    /// Blocks on each transaction whose producer is still running.
    /// Transactions added by completions during this call are left for the
    /// next commit. Returns how many transactions were committed.
    pub fn commit_all(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        let count = batch.len();
        for mut transaction in batch {
            transaction.commit();
        }
        count
    }

    /// Number of transactions waiting for commit.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// The phases this group commits on, if a run loop observer drives it.
    pub fn commit_phases(&self) -> Option<LoopPhase> {
        self.observer.borrow().as_ref().map(PhaseObserver::phases)
    }

    /// Whether a run loop observer drives this group.
    pub fn is_observed(&self) -> bool {
        self.observer
            .borrow()
            .as_ref()
            .is_some_and(PhaseObserver::is_registered)
    }
}

impl Default for TransactionGroup {
    fn default() -> Self {
        Self::new()
    }
}
