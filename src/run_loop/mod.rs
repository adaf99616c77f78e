//! Host event loop with phase notifications.
//!
//! [`RunLoop`] wraps a calloop event loop and reports where it is in each
//! iteration through [`LoopPhase`] notifications. Observers registered for a
//! phase run synchronously on the loop thread every time that phase is
//! reached, which is what lets transaction groups commit exactly once per
//! iteration, right before the loop goes to sleep.

mod observer;

pub use observer::PhaseObserver;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use calloop::{EventLoop, LoopHandle, LoopSignal};

use crate::error::{Error, Result};

bitflags! {
    /// Points in a run loop iteration that observers can subscribe to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct LoopPhase: u8 {
        /// The loop is starting to run
        const ENTRY          = 0b0001;
        /// The loop is about to wait for events (once per iteration)
        const BEFORE_WAITING = 0b0010;
        /// The loop woke up and dispatched its sources
        const AFTER_WAITING  = 0b0100;
        /// The loop is about to stop running
        const EXIT           = 0b1000;
    }
}

/// Identifier of a registered phase observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type PhaseHandler = Box<dyn FnMut(LoopPhase)>;

struct ObserverEntry {
    id: ObserverId,
    phases: LoopPhase,
    handler: RefCell<PhaseHandler>,
    active: Cell<bool>,
}

pub(crate) struct Shared {
    event_loop: RefCell<EventLoop<'static, ()>>,
    handle: LoopHandle<'static, ()>,
    signal: LoopSignal,
    stop_requested: Arc<AtomicBool>,
    dispatching: Cell<bool>,
    observers: RefCell<Vec<Rc<ObserverEntry>>>,
    next_observer_id: Cell<u64>,
}

impl Shared {
    fn add_observer(&self, phases: LoopPhase, handler: PhaseHandler) -> ObserverId {
        let id = ObserverId(self.next_observer_id.get());
        self.next_observer_id.set(id.0 + 1);

        self.observers.borrow_mut().push(Rc::new(ObserverEntry {
            id,
            phases,
            handler: RefCell::new(handler),
            active: Cell::new(true),
        }));
        log::trace!("Registered observer {:?} for {:?}", id, phases);
        id
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.borrow_mut();
        match observers.iter().position(|entry| entry.id == id) {
            Some(index) => {
                let entry = observers.remove(index);
                entry.active.set(false);
                log::trace!("Removed observer {:?}", id);
                true
            }
            None => false,
        }
    }

    fn is_registered(&self, id: ObserverId) -> bool {
        self.observers.borrow().iter().any(|entry| entry.id == id)
    }

    fn notify(&self, phase: LoopPhase) {
        // Snapshot so handlers can add or remove observers while we iterate
        let entries: Vec<Rc<ObserverEntry>> = self
            .observers
            .borrow()
            .iter()
            .filter(|entry| entry.phases.intersects(phase))
            .cloned()
            .collect();

        for entry in entries {
            if !entry.active.get() {
                continue;
            }
            let Ok(mut handler) = entry.handler.try_borrow_mut() else {
                log::trace!("Observer {:?} is already running, skipping {:?}", entry.id, phase);
                continue;
            };
            let handler = &mut *handler;
            handler(phase);
        }
    }
}

/// A calloop-backed event loop with phase observers.
///
/// Cloning is cheap and yields another handle to the same loop. The loop is
/// bound to the thread that created it; use [`RunLoop::waker`] to poke it
/// from other threads.
#[derive(Clone)]
pub struct RunLoop {
    shared: Rc<Shared>,
}

thread_local! {
    static CURRENT: RefCell<Option<RunLoop>> = const { RefCell::new(None) };
}

impl RunLoop {
    /// Create a standalone run loop.
    pub fn new() -> Result<Self> {
        let event_loop: EventLoop<'static, ()> = EventLoop::try_new()?;
        let handle = event_loop.handle();
        let signal = event_loop.get_signal();

        Ok(Self {
            shared: Rc::new(Shared {
                event_loop: RefCell::new(event_loop),
                handle,
                signal,
                stop_requested: Arc::new(AtomicBool::new(false)),
                dispatching: Cell::new(false),
                observers: RefCell::new(Vec::new()),
                next_observer_id: Cell::new(1),
            }),
        })
    }

    /// The run loop of the current thread, created on first access.
    pub fn current() -> Result<Self> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(run_loop) = current.as_ref() {
                return Ok(run_loop.clone());
            }
            let run_loop = RunLoop::new()?;
            log::debug!("Created run loop for {:?}", std::thread::current().id());
            *current = Some(run_loop.clone());
            Ok(run_loop)
        })
    }

    /// Handle for inserting calloop event sources into this loop.
    pub fn handle(&self) -> LoopHandle<'static, ()> {
        self.shared.handle.clone()
    }

    /// A thread-safe handle that can wake or stop this loop.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            signal: self.shared.signal.clone(),
            stop_requested: self.shared.stop_requested.clone(),
        }
    }

    /// Register `handler` for every phase in `phases`.
    ///
    /// Prefer [`PhaseObserver`], which deregisters itself when dropped.
    pub fn add_observer<F>(&self, phases: LoopPhase, handler: F) -> ObserverId
    where
        F: FnMut(LoopPhase) + 'static,
    {
        self.shared.add_observer(phases, Box::new(handler))
    }

    /// Deregister an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.remove_observer(id)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.borrow().len()
    }

    /// Run a single iteration.
    ///
    /// Fires `BEFORE_WAITING`, dispatches pending sources waiting at most
    /// `timeout` (forever if `None`), then fires `AFTER_WAITING`.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<()> {
        if self.shared.dispatching.get() {
            return Err(Error::Reentrant);
        }

        self.shared.notify(LoopPhase::BEFORE_WAITING);

        self.shared.dispatching.set(true);
        let dispatched = self
            .shared
            .event_loop
            .borrow_mut()
            .dispatch(timeout, &mut ());
        self.shared.dispatching.set(false);
        dispatched?;

        self.shared.notify(LoopPhase::AFTER_WAITING);
        Ok(())
    }

    /// Run iterations until [`RunLoop::stop`] is called.
    ///
    /// `ENTRY` fires before the first iteration and `EXIT` after the last
    /// one, so `EXIT` observers always get a final chance to run.
    pub fn run(&self) -> Result<()> {
        self.shared.notify(LoopPhase::ENTRY);

        let mut result = Ok(());
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            if let Err(err) = self.run_once(None) {
                result = Err(err);
                break;
            }
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        self.shared.notify(LoopPhase::EXIT);
        result
    }

    /// Ask [`RunLoop::run`] to return after the current iteration.
    pub fn stop(&self) {
        self.waker().stop();
    }

    pub(crate) fn downgrade(&self) -> std::rc::Weak<Shared> {
        Rc::downgrade(&self.shared)
    }
}

/// Send-able handle to wake or stop a [`RunLoop`] from any thread.
#[derive(Clone)]
pub struct LoopWaker {
    signal: LoopSignal,
    stop_requested: Arc<AtomicBool>,
}

impl LoopWaker {
    /// Interrupt a blocking wait so the loop runs another iteration.
    pub fn wake(&self) {
        self.signal.wakeup();
    }

    /// Make the loop leave [`RunLoop::run`] after its current iteration.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.signal.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::timer::{TimeoutAction, Timer};

    fn recorder(run_loop: &RunLoop, phases: LoopPhase) -> (ObserverId, Rc<RefCell<Vec<LoopPhase>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let id = run_loop.add_observer(phases, move |phase| seen_clone.borrow_mut().push(phase));
        (id, seen)
    }

    #[test]
    fn test_run_once_fires_before_and_after_waiting() {
        let run_loop = RunLoop::new().unwrap();
        let (_, seen) = recorder(&run_loop, LoopPhase::all());

        run_loop.run_once(Some(Duration::ZERO)).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![LoopPhase::BEFORE_WAITING, LoopPhase::AFTER_WAITING]
        );
    }

    #[test]
    fn test_observer_only_sees_its_phases() {
        let run_loop = RunLoop::new().unwrap();
        let (_, seen) = recorder(&run_loop, LoopPhase::BEFORE_WAITING);

        for _ in 0..3 {
            run_loop.run_once(Some(Duration::ZERO)).unwrap();
        }

        assert_eq!(seen.borrow().len(), 3);
        assert!(seen.borrow().iter().all(|p| *p == LoopPhase::BEFORE_WAITING));
    }

    #[test]
    fn test_removed_observer_stops_firing() {
        let run_loop = RunLoop::new().unwrap();
        let (id, seen) = recorder(&run_loop, LoopPhase::BEFORE_WAITING);

        run_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert!(run_loop.remove_observer(id));
        assert!(!run_loop.remove_observer(id));
        run_loop.run_once(Some(Duration::ZERO)).unwrap();

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(run_loop.observer_count(), 0);
    }

    #[test]
    fn test_run_fires_entry_and_exit() {
        let run_loop = RunLoop::new().unwrap();
        let (_, seen) = recorder(&run_loop, LoopPhase::ENTRY | LoopPhase::EXIT);

        let waker = run_loop.waker();
        run_loop
            .handle()
            .insert_source(Timer::from_duration(Duration::from_millis(5)), move |_, _, _| {
                waker.stop();
                TimeoutAction::Drop
            })
            .unwrap();

        run_loop.run().unwrap();

        assert_eq!(*seen.borrow(), vec![LoopPhase::ENTRY, LoopPhase::EXIT]);
    }

    #[test]
    fn test_stop_from_worker_thread() {
        let run_loop = RunLoop::new().unwrap();
        let (_, seen) = recorder(&run_loop, LoopPhase::EXIT);

        let waker = run_loop.waker();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.stop();
        });

        run_loop.run().unwrap();
        assert_eq!(*seen.borrow(), vec![LoopPhase::EXIT]);
    }

    #[test]
    fn test_reentrant_run_once_is_rejected() {
        let run_loop = RunLoop::new().unwrap();
        let nested = Rc::new(RefCell::new(None));

        let inner_loop = run_loop.clone();
        let nested_clone = nested.clone();
        run_loop
            .handle()
            .insert_source(Timer::immediate(), move |_, _, _| {
                *nested_clone.borrow_mut() = Some(inner_loop.run_once(Some(Duration::ZERO)));
                TimeoutAction::Drop
            })
            .unwrap();

        run_loop.run_once(Some(Duration::from_millis(50))).unwrap();

        assert!(matches!(*nested.borrow(), Some(Err(Error::Reentrant))));
    }

    #[test]
    fn test_observer_added_during_notify_waits_for_next_phase() {
        let run_loop = RunLoop::new().unwrap();
        let late_calls = Rc::new(Cell::new(0));

        let loop_clone = run_loop.clone();
        let late_clone = late_calls.clone();
        let mut added = false;
        run_loop.add_observer(LoopPhase::BEFORE_WAITING, move |_| {
            if !added {
                added = true;
                let late = late_clone.clone();
                loop_clone.add_observer(LoopPhase::BEFORE_WAITING, move |_| {
                    late.set(late.get() + 1);
                });
            }
        });

        run_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(late_calls.get(), 0);
        run_loop.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(late_calls.get(), 1);
    }

    #[test]
    fn test_current_is_per_thread_singleton() {
        let a = RunLoop::current().unwrap();
        let b = RunLoop::current().unwrap();
        assert!(Rc::ptr_eq(&a.shared, &b.shared));

        let other = std::thread::spawn(|| RunLoop::current().map(|_| ()).is_ok())
            .join()
            .unwrap();
        assert!(other);
    }

    #[test]
    fn test_running_handler_is_skipped_by_nested_iteration() {
        std::thread::spawn(|| {
            let run_loop = RunLoop::current().unwrap();
            let outer_calls = Rc::new(Cell::new(0));
            let other_calls = Rc::new(Cell::new(0));

            let outer = outer_calls.clone();
            run_loop.add_observer(LoopPhase::BEFORE_WAITING, move |_| {
                outer.set(outer.get() + 1);
                if outer.get() == 1 {
                    // Fires BEFORE_WAITING again while this handler is running
                    RunLoop::current()
                        .unwrap()
                        .run_once(Some(Duration::ZERO))
                        .unwrap();
                }
            });
            let other = other_calls.clone();
            run_loop.add_observer(LoopPhase::BEFORE_WAITING, move |_| {
                other.set(other.get() + 1);
            });

            run_loop.run_once(Some(Duration::ZERO)).unwrap();

            assert_eq!(outer_calls.get(), 1);
            assert_eq!(other_calls.get(), 2);
        })
        .join()
        .unwrap();
    }
}
