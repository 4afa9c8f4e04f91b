//! Lock-free shared-memory transport for IPC.
//!
//! Each direction of a channel is a chain of named shared-memory segments
//! written by exactly one [`OutboundTransport`] and drained by exactly one
//! [`InboundTransport`]:
//!
//! ```text
//! ┌─────────────┬──────────┬─────┬──────────────────────────────────────┐
//! │ Counter (4B)│ Reclaim  │ pad │ Frames: [len (4B LE)][payload] ...   │
//! │ publish seq │ flag (1B)│     │ len == 0 → continue in <base>.<n+1>  │
//! └─────────────┴──────────┴─────┴──────────────────────────────────────┘
//! ```
//!
//! The publish counter is the only synchronization between writer and
//! reader besides the named wake signal. When a segment fills up the writer
//! allocates a larger successor and leaves a zero-length sentinel behind; the
//! superseded segment is destroyed only after the reader sets its reclaim
//! flag.

#[cfg(not(unix))]
compile_error!("fastipc-transport requires POSIX shared memory and named semaphores");

pub mod config;
pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod outbound;
pub mod segment;

#[cfg(unix)]
mod shm;
#[cfg(unix)]
mod signal;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use inbound::{InboundTransport, SegmentReader};
pub use lifecycle::{Lifecycle, LifecycleGuard};
pub use outbound::{OutboundTransport, MAX_PAYLOAD_SIZE};
pub use segment::{
    segment_name, signal_name, Segment, DEFAULT_MIN_SEGMENT_SIZE, FRAME_AREA_OFFSET,
    FRAME_HEADER_SIZE, HANDOFF_HEADROOM, MIN_SEGMENT_CAPACITY,
};
