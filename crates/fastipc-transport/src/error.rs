/// Errors that can occur in shared-memory transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The base name cannot be used as a POSIX shared-memory name.
    #[error("invalid transport name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Failed to create a named shared-memory segment.
    #[error("failed to create segment {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    /// Failed to open an existing named shared-memory segment.
    #[error("failed to open segment {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    /// Failed to map a segment into this address space.
    #[error("failed to map segment {name}: {source}")]
    Map {
        name: String,
        source: std::io::Error,
    },

    /// Failed to create, open or use the named wake signal.
    #[error("wake signal {name} failed: {source}")]
    Signal {
        name: String,
        source: std::io::Error,
    },

    /// A segment cannot hold its header and a hand-off sentinel.
    #[error("segment {name} is {size} bytes, below the minimum of {min}")]
    SegmentTooSmall { name: String, size: usize, min: usize },

    /// A header field lies outside the mapped region.
    #[error("header field at offset {offset} outside segment of {capacity} bytes")]
    HeaderOutOfBounds { offset: usize, capacity: usize },

    /// Zero-length payloads are reserved for the continuation sentinel.
    #[error("empty payloads cannot be written (zero length marks a segment hand-off)")]
    EmptyFrame,

    /// The payload cannot be described by the 4-byte frame header.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame header points outside the segment.
    #[error("corrupt frame at offset {offset} (length {length}, segment capacity {capacity})")]
    CorruptFrame {
        offset: usize,
        length: i64,
        capacity: usize,
    },

    /// A frame was requested before the writer published one.
    #[error("no published frame to read")]
    NoPendingFrame,

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been disposed.
    #[error("transport disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
