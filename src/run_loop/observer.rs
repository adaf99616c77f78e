use std::rc::Weak;

use super::{LoopPhase, ObserverId, RunLoop, Shared};

/// A phase handler bound to a run loop for as long as this value lives.
///
/// Dropping the observer deregisters the handler. The observer only holds a
/// weak reference to the loop, so it never keeps the loop alive.
pub struct PhaseObserver {
    run_loop: Weak<Shared>,
    id: ObserverId,
    phases: LoopPhase,
}

impl PhaseObserver {
    /// Register `handler` to run on every occurrence of `phases`.
    pub fn new<F>(run_loop: &RunLoop, phases: LoopPhase, handler: F) -> Self
    where
        F: FnMut(LoopPhase) + 'static,
    {
        let id = run_loop.add_observer(phases, handler);
        Self {
            run_loop: run_loop.downgrade(),
            id,
            phases,
        }
    }

    pub fn phases(&self) -> LoopPhase {
        self.phases
    }

    /// Whether the handler is still registered with a live loop.
    pub fn is_registered(&self) -> bool {
        self.run_loop
            .upgrade()
            .is_some_and(|shared| shared.is_registered(self.id))
    }
}

impl Drop for PhaseObserver {
    fn drop(&mut self) {
        if let Some(shared) = self.run_loop.upgrade() {
            shared.remove_observer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_observer_fires_once_per_iteration() {
        let run_loop = RunLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();

        let _observer = PhaseObserver::new(&run_loop, LoopPhase::BEFORE_WAITING, move |_| {
            count_clone.set(count_clone.get() + 1);
        });

        for _ in 0..4 {
            run_loop.run_once(Some(Duration::ZERO)).unwrap();
        }
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_drop_deregisters() {
        let run_loop = RunLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();

        let observer = PhaseObserver::new(&run_loop, LoopPhase::BEFORE_WAITING, move |_| {
            count_clone.set(count_clone.get() + 1);
        });
        assert!(observer.is_registered());
        assert_eq!(run_loop.observer_count(), 1);

        drop(observer);
        run_loop.run_once(Some(Duration::ZERO)).unwrap();

        assert_eq!(run_loop.observer_count(), 0);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_outliving_the_loop_is_harmless() {
        let run_loop = RunLoop::new().unwrap();
        let observer = PhaseObserver::new(&run_loop, LoopPhase::EXIT, |_| {});
        drop(run_loop);
        assert!(!observer.is_registered());
        drop(observer);
    }

    #[test]
    fn test_handler_receives_the_firing_phase() {
        let run_loop = RunLoop::new().unwrap();
        let last = Rc::new(Cell::new(None));
        let last_clone = last.clone();

        let observer = PhaseObserver::new(
            &run_loop,
            LoopPhase::BEFORE_WAITING | LoopPhase::AFTER_WAITING,
            move |phase| last_clone.set(Some(phase)),
        );
        assert_eq!(
            observer.phases(),
            LoopPhase::BEFORE_WAITING | LoopPhase::AFTER_WAITING
        );

        run_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(last.get(), Some(LoopPhase::AFTER_WAITING));
    }
}
