//! Crash propagation inside one cluster
//!
//! Every thread of a cluster runs under a shared [`CrashGuard`]. The first
//! panic is caught and kept, and every barrier registered with the guard is
//! poisoned so that its waiters panic too instead of blocking on arrivals
//! that will never come. The cluster re-raises the kept panic once all of
//! its threads have returned.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BulkGroups, LaneBarrier, Mbarrier};

/// A wait that can be broken from outside
pub trait Breakable: Send + Sync {
    fn poison(&self);
}

impl Breakable for Mbarrier {
    fn poison(&self) {
        Mbarrier::poison(self)
    }
}

impl Breakable for LaneBarrier {
    fn poison(&self) {
        LaneBarrier::poison(self)
    }
}

impl Breakable for BulkGroups {
    fn poison(&self) {
        BulkGroups::poison(self)
    }
}

type Payload = Box<dyn Any + Send + 'static>;

#[derive(Default)]
pub struct CrashGuard {
    tripped: AtomicBool,
    watched: Mutex<Vec<Arc<dyn Breakable>>>,
    payload: Mutex<Option<Payload>>,
}

impl CrashGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn watched(&self) -> MutexGuard<'_, Vec<Arc<dyn Breakable>>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poison `item` when any guarded thread crashes, or now if one already has
    pub fn watch(&self, item: Arc<dyn Breakable>) {
        let mut watched = self.watched();
        if self.tripped.load(Ordering::SeqCst) {
            item.poison();
        }
        watched.push(item);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self) {
        let watched = self.watched();
        self.tripped.store(true, Ordering::SeqCst);
        for item in watched.iter() {
            item.poison();
        }
    }

    /// Run `body`, catching a panic. Returns `None` if it panicked.
    pub fn run<T>(&self, name: &str, body: impl FnOnce() -> T) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => Some(value),
            Err(payload) => {
                let mut kept = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
                if kept.is_none() {
                    log::error!("{} crashed; aborting its cluster", name);
                    *kept = Some(payload);
                } else {
                    log::debug!("{} stopped after an earlier crash", name);
                }
                drop(kept);
                self.trip();
                None
            }
        }
    }

    /// The first panic caught, if any
    pub fn take_payload(&self) -> Option<Payload> {
        self.payload.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test_log::test]
    fn test_crash_breaks_waits_and_keeps_first_payload() {
        let guard = CrashGuard::new();
        let bar = Arc::new(Mbarrier::new(1));
        let sync = Arc::new(LaneBarrier::new(2));
        guard.watch(Arc::clone(&bar) as Arc<dyn Breakable>);
        guard.watch(Arc::clone(&sync) as Arc<dyn Breakable>);

        thread::scope(|s| {
            s.spawn(|| guard.run("waiter", || bar.wait(0)));
            s.spawn(|| guard.run("rendezvous", || sync.wait()));
            s.spawn(|| guard.run("worker", || panic!("bad value")));
        });

        assert!(guard.is_tripped());
        // the waiters only panic once the worker has tripped the guard
        let payload = guard.take_payload().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"bad value"));
        assert!(guard.take_payload().is_none());
    }

    #[test]
    fn test_late_watch_is_poisoned_at_once() {
        let guard = CrashGuard::new();
        assert_eq!(guard.run("ok", || 7), Some(7));
        assert!(guard.run("bad", || panic!("boom")).is_none());

        let bar = Arc::new(Mbarrier::new(1));
        guard.watch(Arc::clone(&bar) as Arc<dyn Breakable>);
        assert!(guard.run("late", || bar.wait(0)).is_none());
        let payload = guard.take_payload().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }
}
