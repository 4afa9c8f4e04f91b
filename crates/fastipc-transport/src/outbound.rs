use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::lifecycle::Lifecycle;
use crate::segment::{
    segment_name, signal_name, Segment, FRAME_AREA_OFFSET, HANDOFF_HEADROOM,
};
use crate::signal::WakeSignal;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = i32::MAX as usize;

struct WriterState {
    current: Segment,
    offset: usize,
    counter: i32,
    next_index: u32,
    /// Segments handed off but not yet released by the reader, oldest first.
    superseded: Vec<Segment>,
}

/// The writing half of one transport direction.
///
/// Writes from any number of threads are serialized so the reader only ever
/// sees whole frames.
pub struct OutboundTransport {
    name: String,
    config: TransportConfig,
    signal: WakeSignal,
    lifecycle: Lifecycle,
    state: Mutex<WriterState>,
}

impl OutboundTransport {
    /// Create the direction: segment `.0` and the wake signal.
    pub fn create(name: &str, config: TransportConfig) -> Result<Self> {
        let segment = Segment::create(&segment_name(name, 0), config.min_segment_size)?;
        let signal = WakeSignal::open(&signal_name(name), true)?;
        Self::with_segment(name, config, segment, signal)
    }

    /// Attach to a direction whose segment `.0` the reader created.
    pub fn open(name: &str, config: TransportConfig) -> Result<Self> {
        let segment = Segment::open_with_retry(&segment_name(name, 0), config.open_timeout)?;
        let signal = WakeSignal::open(&signal_name(name), false)?;
        Self::with_segment(name, config, segment, signal)
    }

    fn with_segment(
        name: &str,
        config: TransportConfig,
        segment: Segment,
        signal: WakeSignal,
    ) -> Result<Self> {
        let counter = segment.publish_counter()?;
        debug!(transport = %name, "outbound transport ready");
        Ok(Self {
            name: name.to_string(),
            config,
            signal,
            lifecycle: Lifecycle::new(),
            state: Mutex::new(WriterState {
                current: segment,
                offset: FRAME_AREA_OFFSET,
                counter,
                next_index: 1,
                superseded: Vec::new(),
            }),
        })
    }

    /// Base name of this direction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one frame and wake the reader.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(TransportError::EmptyFrame);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let _guard = self.lifecycle.enter().ok_or(TransportError::Disposed)?;
        let mut state = self.lock_state();

        if !state.current.fits(payload.len(), state.offset) {
            self.hand_off(&mut state, payload.len())?;
        }

        let offset = state.offset;
        state.offset = state.current.write_frame(offset, payload)?;
        state.counter = state.counter.wrapping_add(1);
        state.current.publish(state.counter)?;
        trace!(transport = %self.name, size = payload.len(), counter = state.counter, "frame published");
        drop(state);

        self.signal.notify()
    }

    /// Superseded segments the reader has not released yet.
    pub fn pending_segments(&self) -> usize {
        self.lock_state().superseded.len()
    }

    /// Number of segments this direction has used so far.
    pub fn segment_count(&self) -> u32 {
        self.lock_state().next_index
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_released()
    }

    /// Stop accepting writes and destroy every superseded segment.
    pub fn dispose(&self) {
        if !self.lifecycle.release() {
            return;
        }
        let pending = std::mem::take(&mut self.lock_state().superseded);
        debug!(transport = %self.name, pending = pending.len(), "outbound transport disposed");
        drop(pending);
    }

    fn hand_off(&self, state: &mut WriterState, payload_len: usize) -> Result<()> {
        let needed = FRAME_AREA_OFFSET + payload_len + HANDOFF_HEADROOM;
        let size = payload_len
            .saturating_mul(self.config.growth_factor)
            .max(self.config.min_segment_size)
            .max(needed);
        let next_name = segment_name(&self.name, state.next_index);
        let next = Segment::create(&next_name, size)?;

        // The successor starts at the counter value the sentinel publishes, so
        // a reader that switches over never sees it as ahead.
        let handoff_counter = state.counter.wrapping_add(1);
        next.publish(handoff_counter)?;
        state.current.write_sentinel(state.offset)?;
        state.counter = handoff_counter;
        state.current.publish(handoff_counter)?;

        let previous = std::mem::replace(&mut state.current, next);
        debug!(
            transport = %self.name,
            from = %previous.name(),
            to = %next_name,
            size,
            "handed off to successor segment"
        );
        state.superseded.push(previous);
        state.offset = FRAME_AREA_OFFSET;
        state.next_index += 1;

        reclaim(&mut state.superseded);
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OutboundTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for OutboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundTransport")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Destroy superseded segments the reader has released. The newest one is
/// skipped: the reader may not have reached its sentinel yet.
fn reclaim(superseded: &mut Vec<Segment>) {
    let Some(newest) = superseded.pop() else {
        return;
    };
    superseded.retain(|segment| {
        if matches!(segment.is_reclaimed(), Ok(true)) {
            debug!(segment = %segment.name(), "reclaimed superseded segment");
            false
        } else {
            true
        }
    });
    superseded.push(newest);
}
