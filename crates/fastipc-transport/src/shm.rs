//! POSIX named shared-memory mapping.
//!
//! This is the only place that turns an OS shared-memory object into
//! addressable memory. Everything above it goes through the bounds-checked
//! accessors of [`ShmRegion`].

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU8};

use tracing::{debug, trace};

use crate::error::{Result, TransportError};

/// Longest accepted object name, leaving room for the leading slash.
const MAX_NAME_LEN: usize = 240;

/// A named shared-memory object mapped read-write into this process.
pub(crate) struct ShmRegion {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    /// The creator removes the name when its mapping goes away.
    created: bool,
}

impl ShmRegion {
    /// Create a new object of `len` zeroed bytes.
    ///
    /// A stale object with the same name (left behind by a crashed process)
    /// is removed first.
    pub(crate) fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = posix_name(name)?;
        let flags = libc::O_CREAT | libc::O_EXCL | libc::O_RDWR;
        let create_err = |source| TransportError::Create {
            name: name.to_string(),
            source,
        };

        let file = match shm_open(&c_name, flags) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(segment = %name, "removing stale segment");
                shm_unlink(&c_name);
                shm_open(&c_name, flags).map_err(create_err)?
            }
            Err(err) => return Err(create_err(err)),
        };

        if let Err(err) = file.set_len(len as u64) {
            shm_unlink(&c_name);
            return Err(create_err(err));
        }

        match map(&file, len) {
            Ok(ptr) => {
                trace!(segment = %name, len, "mapped new segment");
                Ok(Self {
                    name: name.to_string(),
                    ptr,
                    len,
                    created: true,
                })
            }
            Err(source) => {
                shm_unlink(&c_name);
                Err(TransportError::Map {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Open and map an existing object.
    ///
    /// An object that exists but has not been sized yet reports
    /// `ErrorKind::WouldBlock` so openers can retry.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let c_name = posix_name(name)?;
        let open_err = |source| TransportError::Open {
            name: name.to_string(),
            source,
        };

        let file = shm_open(&c_name, libc::O_RDWR).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len() as usize;
        if len == 0 {
            return Err(open_err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "segment exists but is not sized yet",
            )));
        }

        let ptr = map(&file, len).map_err(|source| TransportError::Map {
            name: name.to_string(),
            source,
        })?;
        trace!(segment = %name, len, "mapped existing segment");

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            created: false,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Atomic view of an aligned 4-byte header field.
    pub(crate) fn atomic_i32(&self, offset: usize) -> Result<&AtomicI32> {
        if offset % std::mem::align_of::<AtomicI32>() != 0 {
            return Err(self.header_error(offset));
        }
        self.check_header(offset, std::mem::size_of::<AtomicI32>())?;
        // SAFETY: the range is in bounds and aligned (mappings are page
        // aligned), the reference cannot outlive the mapping, and every
        // process touches these bytes only through atomics.
        Ok(unsafe { &*self.ptr.as_ptr().add(offset).cast::<AtomicI32>() })
    }

    /// Atomic view of a 1-byte header field.
    pub(crate) fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        self.check_header(offset, 1)?;
        // SAFETY: as for `atomic_i32`; `AtomicU8` has no alignment requirement.
        Ok(unsafe { &*self.ptr.as_ptr().add(offset).cast::<AtomicU8>() })
    }

    /// Copy `data` into the region at `offset`.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        // SAFETY: the destination range is in bounds and does not overlap
        // `data`. The single writer owns unpublished bytes until it bumps the
        // publish counter.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    pub(crate) fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: the source range is in bounds and was published by the
        // writer before the counter value the caller observed.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn check_header(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(self.header_error(offset)),
        }
    }

    fn header_error(&self, offset: usize) -> TransportError {
        TransportError::HeaderOutOfBounds {
            offset,
            capacity: self.len,
        }
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TransportError::CorruptFrame {
                offset,
                length: len as i64,
                capacity: self.len,
            }),
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created by `map` that is
        // unmapped exactly once, here.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
        }
        if self.created {
            if let Ok(c_name) = posix_name(&self.name) {
                shm_unlink(&c_name);
            }
        }
        trace!(segment = %self.name, created = self.created, "unmapped segment");
    }
}

// SAFETY: the region is plain shared memory; all concurrent access goes
// through atomics or through byte ranges handed off by the publish counter.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

/// Validate a segment name and turn it into a POSIX object name.
pub(crate) fn posix_name(name: &str) -> Result<CString> {
    let invalid = |reason| TransportError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.contains('/') {
        return Err(invalid("name must not contain '/'"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    CString::new(format!("/{name}")).map_err(|_| invalid("name must not contain NUL"))
}

fn shm_open(name: &CString, flags: libc::c_int) -> io::Result<File> {
    // SAFETY: `name` is a valid NUL-terminated string.
    #[cfg(target_os = "macos")]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::c_uint) };
    // SAFETY: `name` is a valid NUL-terminated string.
    #[cfg(not(target_os = "macos"))]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by shm_open and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn shm_unlink(name: &CString) {
    // SAFETY: `name` is a valid NUL-terminated string.
    unsafe {
        libc::shm_unlink(name.as_ptr());
    }
}

fn map(file: &File, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: requests a fresh shared mapping backed by `file`; no existing
    // Rust memory is aliased.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}
