//! Release-once guard for resources shared between threads.
//!
//! A [`Lifecycle`] answers "has this resource been released?" and lets work
//! run only while it has not, holding release off until that work finishes.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct State {
    released: bool,
    /// Guards currently held, per thread.
    holders: HashMap<ThreadId, usize>,
}

/// Tracks whether a resource is released and who is still using it.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: Mutex<State>,
    idle: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Enter a section that must not overlap release.
    ///
    /// Returns `None` once the resource is released. Guards nest, and a
    /// thread holding a guard may release without deadlocking on itself.
    pub fn enter(&self) -> Option<LifecycleGuard<'_>> {
        let mut state = self.lock();
        if state.released {
            return None;
        }
        *state.holders.entry(thread::current().id()).or_insert(0) += 1;
        Some(LifecycleGuard { owner: self })
    }

    /// Mark the resource released, waiting for guards held by other threads.
    ///
    /// Returns `true` for the call that performed the release and `false`
    /// for every later call.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        if state.released {
            return false;
        }
        state.released = true;
        while state.holders.keys().any(|holder| *holder != me) {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        if let Some(count) = state.holders.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.holders.remove(&me);
            }
        }
        if state.released {
            self.idle.notify_all();
        }
    }
}

/// Proof that the resource was live when the guard was taken. Release waits
/// until the guard is dropped.
#[must_use = "release is only held off while the guard is alive"]
#[derive(Debug)]
pub struct LifecycleGuard<'a> {
    owner: &'a Lifecycle,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.owner.exit();
    }
}
