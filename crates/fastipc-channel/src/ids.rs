use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

/// Hands out object ids. Every channel uses [`ObjectIdAllocator::global`]
/// unless given its own, so ids are unique within the process.
#[derive(Debug)]
pub struct ObjectIdAllocator {
    next: AtomicI32,
}

impl ObjectIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    /// The process-wide allocator.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ObjectIdAllocator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ObjectIdAllocator::new())))
    }

    pub fn allocate(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Message numbers of one channel.
#[derive(Debug)]
pub(crate) struct MessageNumbers {
    next: AtomicI32,
}

impl MessageNumbers {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub(crate) fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
