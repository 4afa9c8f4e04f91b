//! Named cross-process wake signal backed by a POSIX named semaphore.

use std::io;
use std::ptr::NonNull;
use std::time::Duration;

use tracing::trace;

use crate::error::{Result, TransportError};
use crate::shm::posix_name;

/// Auto-reset style event shared by name between a writer and a reader.
///
/// `notify` posts the semaphore; `wait` blocks until a post (or timeout) and
/// then drains any surplus posts, so a burst of writes wakes the reader once.
pub(crate) struct WakeSignal {
    name: String,
    sem: NonNull<libc::sem_t>,
    /// The side that created the direction removes the name on drop.
    unlink_on_drop: bool,
}

impl WakeSignal {
    /// Create or open the signal called `name`.
    pub(crate) fn open(name: &str, unlink_on_drop: bool) -> Result<Self> {
        let c_name = posix_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string; mode and initial
        // value are passed as promoted C integers.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(signal_error(name, io::Error::last_os_error()));
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| signal_error(name, io::Error::other("sem_open returned null")))?;
        trace!(signal = %name, "opened wake signal");

        Ok(Self {
            name: name.to_string(),
            sem,
            unlink_on_drop,
        })
    }

    /// Wake a blocked reader.
    pub(crate) fn notify(&self) -> Result<()> {
        // SAFETY: `sem` is a live semaphore handle returned by sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(signal_error(&self.name, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until notified or until `timeout` elapses. Returns whether a
    /// notification was consumed.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<bool> {
        let woke = self.wait_inner(timeout)?;
        if woke {
            self.drain();
        }
        Ok(woke)
    }

    #[cfg(target_os = "linux")]
    fn wait_inner(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            // SAFETY: `sem` is live and `deadline` is a valid timespec.
            let rc = unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(signal_error(&self.name, err)),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_inner(&self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_take() {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn try_take(&self) -> bool {
        // SAFETY: `sem` is a live semaphore handle.
        unsafe { libc::sem_trywait(self.sem.as_ptr()) == 0 }
    }

    fn drain(&self) {
        while self.try_take() {}
    }
}

impl Drop for WakeSignal {
    fn drop(&mut self) {
        // SAFETY: `sem` came from sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if self.unlink_on_drop {
            if let Ok(c_name) = posix_name(&self.name) {
                // SAFETY: valid NUL-terminated name.
                unsafe {
                    libc::sem_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

// SAFETY: POSIX semaphores are designed for concurrent use from any thread.
unsafe impl Send for WakeSignal {}
unsafe impl Sync for WakeSignal {}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(TransportError::Io(io::Error::last_os_error()));
    }
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    })
}

fn signal_error(name: &str, source: io::Error) -> TransportError {
    TransportError::Signal {
        name: name.to_string(),
        source,
    }
}
