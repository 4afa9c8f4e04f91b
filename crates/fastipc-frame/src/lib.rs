//! Binary protocol spoken between the two domains of a fastipc channel.
//!
//! Every transport frame carries exactly one [`Message`]:
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────────────────────────┐
//! │ Kind (1B)│ Number (4B LE)│ Kind-specific body                   │
//! │ 0..=4    │ absent for    │ type ref / object id / method ref +  │
//! │          │ Deactivation  │ arguments / value / fault            │
//! └──────────┴───────────────┴──────────────────────────────────────┘
//! ```
//!
//! Values use a one-byte tag with a fixed or length-prefixed payload, so the
//! common primitives travel without any generic envelope.

pub mod codec;
pub mod domain;
pub mod error;
pub mod message;
pub mod reference;
pub mod value;

pub use codec::{decode_message, encode_message, WireReader};
pub use domain::Domain;
pub use error::{FrameError, Result};
pub use message::{Message, MessageKind, MAX_ARGUMENTS};
pub use reference::{MethodRef, TypeRef};
pub use value::{ProxyRef, ValueTag, WireValue};
