use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::registry::Param;
use crate::value::Value;

pub(crate) type Reply = oneshot::Receiver<Result<Value>>;

struct Entry {
    reply: oneshot::Sender<Result<Value>>,
    /// What the caller expects back, used to resolve a returned reference.
    expects: Param,
}

/// Calls waiting for a reply, by message number.
#[derive(Default)]
pub(crate) struct Pending {
    entries: Mutex<HashMap<i32, Entry>>,
}

impl Pending {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, number: i32, expects: Param) -> Reply {
        let (reply, receiver) = oneshot::channel();
        self.lock().insert(number, Entry { reply, expects });
        receiver
    }

    /// Complete call `number` with the result of `resolve`, which runs
    /// outside the lock. Replies nobody waits for are dropped.
    pub(crate) fn complete(
        &self,
        number: i32,
        resolve: impl FnOnce(Param) -> Result<Value>,
    ) -> bool {
        let Some(entry) = self.lock().remove(&number) else {
            debug!(message_number = number, "dropping orphaned reply");
            return false;
        };
        if entry.reply.send(resolve(entry.expects)).is_err() {
            debug!(message_number = number, "caller stopped waiting for reply");
        }
        true
    }

    /// Forget call `number`, e.g. after its deadline passed.
    pub(crate) fn remove(&self, number: i32) -> bool {
        self.lock().remove(&number).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Fail every waiting call with `error()`.
    pub(crate) fn fail_all(&self, error: impl Fn() -> ChannelError) -> usize {
        let failed = std::mem::take(&mut *self.lock());
        let count = failed.len();
        for (_, entry) in failed {
            let _ = entry.reply.send(Err(error()));
        }
        count
    }

    /// Abandon every waiting call; their callers observe a closed channel.
    pub(crate) fn clear(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.lock());
        abandoned.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
