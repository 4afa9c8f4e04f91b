//! One shared-memory segment of a transport direction.

use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::shm::ShmRegion;

/// Smallest segment allocated by default (64 KiB).
pub const DEFAULT_MIN_SEGMENT_SIZE: usize = 0x10000;

/// Frames start after the counter, the reclaim flag and padding.
pub const FRAME_AREA_OFFSET: usize = 8;

/// Length prefix in front of every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Space that must stay free after a frame: its own header plus the
/// zero-length sentinel that may follow it.
pub const HANDOFF_HEADROOM: usize = 2 * FRAME_HEADER_SIZE;

/// Smallest usable segment: the header plus room for a hand-off sentinel.
pub const MIN_SEGMENT_CAPACITY: usize = FRAME_AREA_OFFSET + HANDOFF_HEADROOM;

const COUNTER_OFFSET: usize = 0;
const RECLAIM_OFFSET: usize = 4;

/// Name of segment `index` of the direction called `base`.
pub fn segment_name(base: &str, index: u32) -> String {
    format!("{base}.{index}")
}

/// Name of the wake signal of the direction called `base`.
pub fn signal_name(base: &str) -> String {
    format!("{base}.signal")
}

/// A mapped segment with bounds-checked frame access.
pub struct Segment {
    region: ShmRegion,
}

impl Segment {
    /// Create a zeroed segment of `capacity` bytes.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        check_capacity(name, capacity)?;
        let region = ShmRegion::create(name, capacity)?;
        debug!(segment = %name, capacity, "created segment");
        Ok(Self { region })
    }

    /// Open a segment created by the peer.
    pub fn open(name: &str) -> Result<Self> {
        let region = ShmRegion::open(name)?;
        check_capacity(name, region.len())?;
        debug!(segment = %name, capacity = region.len(), "opened segment");
        Ok(Self { region })
    }

    /// Open a segment, retrying while the creator has not produced it yet.
    pub fn open_with_retry(name: &str, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::open(name) {
                Err(TransportError::Open { ref source, .. })
                    if is_not_ready(source) && Instant::now() < deadline =>
                {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Current publish counter (acquire).
    pub fn publish_counter(&self) -> Result<i32> {
        Ok(self
            .region
            .atomic_i32(COUNTER_OFFSET)?
            .load(Ordering::Acquire))
    }

    /// Publish `counter`. Every frame byte written before this call becomes
    /// visible to a reader that observes the new value.
    pub fn publish(&self, counter: i32) -> Result<()> {
        self.region
            .atomic_i32(COUNTER_OFFSET)?
            .store(counter, Ordering::Release);
        Ok(())
    }

    pub fn is_reclaimed(&self) -> Result<bool> {
        Ok(self.region.atomic_u8(RECLAIM_OFFSET)?.load(Ordering::Acquire) != 0)
    }

    /// Tell the writer this segment will never be read again.
    pub fn mark_reclaimed(&self) -> Result<()> {
        self.region
            .atomic_u8(RECLAIM_OFFSET)?
            .store(1, Ordering::Release);
        trace!(segment = %self.name(), "marked segment reclaimed");
        Ok(())
    }

    /// Whether a payload of `payload_len` bytes fits at `offset` while still
    /// leaving room for a hand-off sentinel.
    pub fn fits(&self, payload_len: usize, offset: usize) -> bool {
        offset
            .checked_add(payload_len)
            .and_then(|end| end.checked_add(HANDOFF_HEADROOM))
            .is_some_and(|end| end <= self.capacity())
    }

    /// Write one frame at `offset` and return the offset after it. The frame
    /// is not visible to the reader until the counter is published.
    pub fn write_frame(&self, offset: usize, payload: &[u8]) -> Result<usize> {
        let len = u32::try_from(payload.len()).map_err(|_| TransportError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        self.region.write_at(offset, &len.to_le_bytes())?;
        self.region.write_at(offset + FRAME_HEADER_SIZE, payload)?;
        Ok(offset + FRAME_HEADER_SIZE + payload.len())
    }

    /// Write the zero-length continuation sentinel at `offset`.
    pub fn write_sentinel(&self, offset: usize) -> Result<()> {
        self.region.write_at(offset, &0u32.to_le_bytes())
    }

    /// Read the frame at `offset`. Returns the payload and the offset of the
    /// next frame; an empty payload is the continuation sentinel.
    pub fn read_frame(&self, offset: usize) -> Result<(Bytes, usize)> {
        let header = self.region.read_at(offset, FRAME_HEADER_SIZE)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let body_offset = offset + FRAME_HEADER_SIZE;
        let payload = self
            .region
            .read_at(body_offset, len)
            .map_err(|_| TransportError::CorruptFrame {
                offset,
                length: len as i64,
                capacity: self.capacity(),
            })?;
        Ok((Bytes::from(payload), body_offset + len))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn check_capacity(name: &str, capacity: usize) -> Result<()> {
    if capacity < MIN_SEGMENT_CAPACITY {
        return Err(TransportError::SegmentTooSmall {
            name: name.to_string(),
            size: capacity,
            min: MIN_SEGMENT_CAPACITY,
        });
    }
    Ok(())
}

fn is_not_ready(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::WouldBlock
    )
}
