//! Object RPC between two processes over shared memory.
//!
//! fastipc connects exactly two processes, an owner and a guest, through a
//! pair of one-directional shared-memory transports, and layers a remote
//! object protocol on top: activate objects in the peer, call their methods,
//! and pass references to objects in either process.
//!
//! # Crate Structure
//!
//! - [`transport`]: Growable segment chains with a named wake signal
//! - [`frame`]: Protocol messages and their binary encoding
//! - [`channel`]: The RPC channel, registry and remote handles (behind the
//!   `channel` feature)

/// Re-export transport types.
pub mod transport {
    pub use fastipc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fastipc_frame::*;
}

/// Re-export channel types (requires `channel` feature).
#[cfg(feature = "channel")]
pub mod channel {
    pub use fastipc_channel::*;
}
