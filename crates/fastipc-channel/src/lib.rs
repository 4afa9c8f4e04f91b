//! Object RPC between two processes over shared-memory transports.
//!
//! A [`Channel`] pairs an outbound and an inbound transport. Either side can
//! activate objects on the other, call their methods and properties through
//! [`RemoteHandle`]s, and pass references to its own objects as arguments or
//! results. Types and methods are described once per process in a
//! [`Registry`].

pub mod channel;
pub mod config;
mod directory;
pub mod error;
pub mod ids;
mod pending;
pub mod proxy;
pub mod registry;
pub mod serializer;
pub mod value;

pub use channel::{Channel, ChannelBuilder};
pub use config::ChannelConfig;
pub use error::{ChannelError, Fault, FaultKind, Result};
pub use fastipc_frame::Domain;
pub use ids::ObjectIdAllocator;
pub use proxy::{CallSpec, RemoteHandle};
pub use registry::{
    Instance, MethodInfo, MethodKey, MethodKind, Outcome, Param, Registry, RegistryBuilder,
    TypeKey,
};
pub use serializer::{JsonSerializer, ValueSerializer};
pub use value::{Args, Value};
