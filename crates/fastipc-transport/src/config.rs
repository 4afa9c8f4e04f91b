use std::time::Duration;

use crate::segment::DEFAULT_MIN_SEGMENT_SIZE;

/// Configuration shared by the outbound and inbound halves of a transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Smallest segment ever allocated, including the initial `.0` segment.
    pub min_segment_size: usize,
    /// A successor segment is sized to `payload * growth_factor` when that
    /// exceeds `min_segment_size`.
    pub growth_factor: usize,
    /// Idle iterations the reader keeps spinning after a message before it
    /// blocks on the wake signal.
    pub spin_iterations: u32,
    /// Upper bound for a single block on the wake signal. The reader re-checks
    /// the publish counter after every wake or timeout.
    pub idle_wait: Duration,
    /// How long an opener retries a segment the peer has not created yet.
    pub open_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            growth_factor: 10,
            spin_iterations: 1000,
            idle_wait: Duration::from_millis(100),
            open_timeout: Duration::from_secs(5),
        }
    }
}
