//! Breakpoint trigger and the process-wide diagnostic counter.
//!
//! A trigger first bumps the hit counter, then passes through
//! [`concolic_bridge_halt`], an exported symbol that never gets inlined. A
//! debugger attached to the target arms its breakpoint on that symbol and
//! observes the instrumented thread with a consistent stack. Controllers
//! living inside the process can be attached through [`HaltController`]
//! instead; they run on the same thread, directly after the halt symbol.

use log::debug;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Halt point for external controllers.
///
/// `hit` is the counter value after the increment that led here, so a
/// controller can correlate consecutive halts.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn concolic_bridge_halt(hit: u64) {
    std::hint::black_box(hit);
}

/// An in-process controller notified at every halt.
///
/// `on_halt` runs synchronously on the instrumented thread. Blocking inside
/// it suspends the target until the method returns.
pub trait HaltController: Send + Sync {
    fn on_halt(&self, hit: u64);
}

pub struct Breakpoint {
    hits: AtomicU64,
    controller: RwLock<Option<Arc<dyn HaltController>>>,
}

impl Breakpoint {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            controller: RwLock::new(None),
        }
    }

    /// Counts the hit and reaches the halt point once. Returns the new count.
    pub fn trigger(&self) -> u64 {
        let hit = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("breakpoint hit #{hit}");
        concolic_bridge_halt(hit);

        // Clone out so attach/detach never wait on a suspended thread.
        let controller = self
            .controller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(controller) = controller {
            controller.on_halt(hit);
        }
        hit
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    /// Installs `controller`, returning the previously attached one.
    pub fn attach(&self, controller: Arc<dyn HaltController>) -> Option<Arc<dyn HaltController>> {
        self.controller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(controller)
    }

    pub fn detach(&self) -> Option<Arc<dyn HaltController>> {
        self.controller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Default for Breakpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// A controller that parks each halted thread until it is resumed.
///
/// The controlling side calls [`SuspendController::wait_for_halt`] to learn
/// which hit is parked, inspects whatever shared state it needs, then calls
/// [`SuspendController::resume`]. Several threads may be parked at once; each
/// is identified by its hit number.
#[derive(Default)]
pub struct SuspendController {
    parked: Mutex<BTreeSet<u64>>,
    changed: Condvar,
}

impl SuspendController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until some thread is parked, or `timeout` elapses.
    /// Returns the lowest parked hit number.
    pub fn wait_for_halt(&self, timeout: Duration) -> Option<u64> {
        let guard = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |parked| parked.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        guard.first().copied()
    }

    /// Releases the thread parked at `hit`. Returns false if none was parked there.
    pub fn resume(&self, hit: u64) -> bool {
        let released = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&hit);
        if released {
            self.changed.notify_all();
        }
        released
    }

    /// Releases every parked thread, returning how many were released.
    pub fn resume_all(&self) -> usize {
        let released = {
            let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
            let n = parked.len();
            parked.clear();
            n
        };
        self.changed.notify_all();
        released
    }

    pub fn parked(&self) -> Vec<u64> {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

impl HaltController for SuspendController {
    fn on_halt(&self, hit: u64) {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.insert(hit);
        self.changed.notify_all();
        let _parked = self
            .changed
            .wait_while(parked, |parked| parked.contains(&hit))
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct CountingController {
        halts: Mutex<Vec<u64>>,
    }

    impl HaltController for CountingController {
        fn on_halt(&self, hit: u64) {
            self.halts.lock().unwrap().push(hit);
        }
    }

    #[test]
    fn trigger_without_controller_only_counts() {
        let breakpoint = Breakpoint::new();
        assert_eq!(breakpoint.hits(), 0);
        assert_eq!(breakpoint.trigger(), 1);
        assert_eq!(breakpoint.trigger(), 2);
        assert_eq!(breakpoint.hits(), 2);
    }

    #[test]
    fn controller_sees_each_hit_once() {
        let breakpoint = Breakpoint::new();
        let controller = Arc::new(CountingController::default());
        assert!(breakpoint.attach(controller.clone()).is_none());

        breakpoint.trigger();
        breakpoint.trigger();
        assert_eq!(*controller.halts.lock().unwrap(), vec![1, 2]);

        assert!(breakpoint.detach().is_some());
        breakpoint.trigger();
        assert_eq!(controller.halts.lock().unwrap().len(), 2);
        assert_eq!(breakpoint.hits(), 3);
    }

    #[test]
    fn attach_replaces_previous_controller() {
        let breakpoint = Breakpoint::new();
        let first = Arc::new(CountingController::default());
        let second = Arc::new(CountingController::default());
        breakpoint.attach(first.clone());
        assert!(breakpoint.attach(second.clone()).is_some());

        breakpoint.trigger();
        assert!(first.halts.lock().unwrap().is_empty());
        assert_eq!(*second.halts.lock().unwrap(), vec![1]);
    }

    #[test]
    fn concurrent_triggers_lose_no_updates() {
        let breakpoint = Arc::new(Breakpoint::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let breakpoint = Arc::clone(&breakpoint);
                thread::spawn(move || {
                    for _ in 0..500 {
                        breakpoint.trigger();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(breakpoint.hits(), 2000);
    }

    #[test]
    fn suspend_controller_parks_until_resumed() {
        let breakpoint = Arc::new(Breakpoint::new());
        let controller = Arc::new(SuspendController::new());
        breakpoint.attach(controller.clone());
        let passed = Arc::new(AtomicBool::new(false));

        let target = {
            let breakpoint = Arc::clone(&breakpoint);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                breakpoint.trigger();
                passed.store(true, Ordering::SeqCst);
            })
        };

        let hit = controller
            .wait_for_halt(Duration::from_secs(5))
            .expect("target never halted");
        assert_eq!(hit, 1);
        assert_eq!(controller.parked(), vec![1]);
        assert!(!passed.load(Ordering::SeqCst));

        assert!(controller.resume(hit));
        target.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
        assert!(controller.parked().is_empty());
        assert!(!controller.resume(hit));
    }

    #[test]
    fn wait_for_halt_times_out_when_nothing_is_parked() {
        let controller = SuspendController::new();
        assert_eq!(controller.wait_for_halt(Duration::from_millis(20)), None);
    }
}
