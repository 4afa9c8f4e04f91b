use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur in channel and handle operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] fastipc_transport::TransportError),

    /// Message encoding or decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] fastipc_frame::FrameError),

    /// JSON conversion of a generic value failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The object id is not registered, or its instance was released.
    #[error("object disposed: {0}")]
    DisposedObject(String),

    /// A value or call could not be put on the wire.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The actual type of a handle is not assignable to the requested type.
    #[error("cannot cast {from} to {to}")]
    Cast { from: String, to: String },

    /// The peer could not instantiate the requested type.
    #[error("activation failed: {0}")]
    Activation(String),

    /// The channel was disposed.
    #[error("channel closed")]
    ChannelClosed,

    /// The inbound transport stopped on an error; the channel closed itself.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The handle was disconnected.
    #[error("handle disconnected")]
    Disconnected,

    /// The peer failed while serving the call.
    #[error("remote fault: {0}")]
    Remote(Fault),

    /// No reply arrived within the deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure raised by a method implementation.
    #[error("{0}")]
    Application(String),

    /// No tokio runtime was available to dispatch incoming calls.
    #[error("no tokio runtime available for call dispatch")]
    NoRuntime,
}

impl ChannelError {
    /// Failure raised by user code inside a method.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// Kind of fault this error is reported as, locally or by the peer.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Remote(fault) => fault.kind,
            other => Fault::from(other).kind,
        }
    }
}

/// Classification of a fault carried by an exception reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    DisposedObject,
    Serialization,
    Cast,
    Activation,
    UnknownType,
    UnknownMethod,
    InvalidArgument,
    Application,
}

/// Wire form of a failure, re-raised at the caller as
/// [`ChannelError::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ChannelError> for Fault {
    fn from(err: &ChannelError) -> Self {
        let kind = match err {
            ChannelError::Remote(fault) => return fault.clone(),
            ChannelError::DisposedObject(_)
            | ChannelError::Disconnected
            | ChannelError::ChannelClosed
            | ChannelError::TransportFailed(_) => FaultKind::DisposedObject,
            ChannelError::Serialization(_)
            | ChannelError::Json(_)
            | ChannelError::Frame(_) => FaultKind::Serialization,
            ChannelError::Cast { .. } => FaultKind::Cast,
            ChannelError::Activation(_) => FaultKind::Activation,
            ChannelError::UnknownType(_) => FaultKind::UnknownType,
            ChannelError::UnknownMethod(_) => FaultKind::UnknownMethod,
            ChannelError::InvalidArgument(_) => FaultKind::InvalidArgument,
            ChannelError::Transport(_)
            | ChannelError::Timeout(_)
            | ChannelError::Application(_)
            | ChannelError::NoRuntime => FaultKind::Application,
        };
        Fault::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_fault_keeps_original_kind() {
        let fault = Fault::new(FaultKind::Cast, "cannot cast a to b");
        let err = ChannelError::Remote(fault.clone());
        assert_eq!(Fault::from(&err), fault);
        assert_eq!(err.fault_kind(), FaultKind::Cast);
    }

    #[test]
    fn local_errors_map_to_fault_kinds() {
        assert_eq!(
            ChannelError::DisposedObject("7".into()).fault_kind(),
            FaultKind::DisposedObject
        );
        assert_eq!(
            ChannelError::application("boom").fault_kind(),
            FaultKind::Application
        );
        let fault = Fault::from(&ChannelError::application("boom"));
        assert_eq!(fault.message, "boom");
    }

    #[test]
    fn fault_serializes_with_snake_case_kind() {
        let fault = Fault::new(FaultKind::DisposedObject, "object 3");
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["kind"], "disposed_object");
        assert_eq!(serde_json::from_value::<Fault>(json).unwrap(), fault);
    }
}
