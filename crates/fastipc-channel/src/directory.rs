//! Identity maps of one channel.
//!
//! Locally hosted objects are indexed by object id and by instance address,
//! always updated together, so re-registering an instance yields its existing
//! id. Remote objects are indexed weakly by id so decoding the same reference
//! twice yields one shared identity while any handle to it is alive.
//!
//! Entries taken out of the maps are handed back to the caller and dropped
//! after the lock is released: dropping a handle may re-enter the directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::proxy::ProxyCore;
use crate::registry::Instance;

#[derive(Default)]
struct Maps {
    by_id: HashMap<i32, Arc<ProxyCore>>,
    by_instance: HashMap<usize, i32>,
    remotes: HashMap<i32, Weak<ProxyCore>>,
}

#[derive(Default)]
pub(crate) struct Directory {
    maps: Mutex<Maps>,
}

/// Address identifying an instance for as long as it is registered.
pub(crate) fn instance_key(instance: &Instance) -> usize {
    Arc::as_ptr(instance).cast::<()>() as usize
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `core`, which hosts `instance`, unless the instance already
    /// has an id. Returns the id and whether it was newly allocated.
    pub(crate) fn register(
        &self,
        core: &Arc<ProxyCore>,
        instance: &Instance,
        allocate: impl FnOnce() -> i32,
    ) -> (i32, bool) {
        let key = instance_key(instance);
        let mut maps = self.lock();
        if let Some(id) = maps.by_instance.get(&key) {
            return (*id, false);
        }
        let id = allocate();
        maps.by_id.insert(id, Arc::clone(core));
        maps.by_instance.insert(key, id);
        (id, true)
    }

    pub(crate) fn lookup(&self, object_id: i32) -> Option<Arc<ProxyCore>> {
        self.lock().by_id.get(&object_id).cloned()
    }

    /// Remove a hosted object from both maps.
    pub(crate) fn unregister(&self, object_id: i32) -> Option<Arc<ProxyCore>> {
        let mut maps = self.lock();
        let core = maps.by_id.remove(&object_id)?;
        maps.by_instance.retain(|_, id| *id != object_id);
        Some(core)
    }

    /// The live identity of a peer-hosted object, created on first sight.
    pub(crate) fn remote(
        &self,
        object_id: i32,
        create: impl FnOnce() -> Arc<ProxyCore>,
    ) -> Arc<ProxyCore> {
        let mut maps = self.lock();
        if let Some(core) = maps.remotes.get(&object_id).and_then(Weak::upgrade) {
            return core;
        }
        let core = create();
        maps.remotes.insert(object_id, Arc::downgrade(&core));
        core
    }

    /// Drop the remote index entry for `core`, or a stale one.
    pub(crate) fn forget_remote(&self, object_id: i32, core: &ProxyCore) {
        let mut maps = self.lock();
        if maps.remotes.get(&object_id).is_some_and(|weak| {
            weak.strong_count() == 0 || std::ptr::eq(weak.as_ptr(), core)
        }) {
            maps.remotes.remove(&object_id);
        }
    }

    pub(crate) fn hosted(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Empty every map, returning the hosted objects.
    pub(crate) fn drain(&self) -> Vec<Arc<ProxyCore>> {
        let mut maps = self.lock();
        maps.by_instance.clear();
        maps.remotes.clear();
        maps.by_id.drain().map(|(_, core)| core).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
