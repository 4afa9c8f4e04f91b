use std::fmt;
use std::io;

use fastipc_channel::ChannelError;
use fastipc_transport::TransportError;

// Process exit codes.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Create { source, .. }
        | TransportError::Open { source, .. }
        | TransportError::Map { source, .. }
        | TransportError::Signal { source, .. }
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidName { .. } | TransportError::SegmentTooSmall { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        TransportError::PayloadTooLarge { .. } | TransportError::CorruptFrame { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ChannelError::TransportFailed(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        ChannelError::Frame(_) | ChannelError::Json(_) | ChannelError::Serialization(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ChannelError::ChannelClosed | ChannelError::Disconnected | ChannelError::Remote(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn permission_denied_maps_to_its_own_code() {
        let err = transport_error(
            "create",
            TransportError::Create {
                name: "x.0".to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert!(err.message.starts_with("create: "));
    }

    #[test]
    fn channel_timeout_maps_to_timeout() {
        let err = channel_error("call", ChannelError::Timeout(Duration::from_millis(5)));
        assert_eq!(err.code, TIMEOUT);
        let err = channel_error("call", ChannelError::Transport(TransportError::EmptyFrame));
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn undersized_segment_is_a_usage_error() {
        let err = channel_error(
            "open owner",
            ChannelError::Transport(TransportError::SegmentTooSmall {
                name: "x.A.0".to_string(),
                size: 2,
                min: 16,
            }),
        );
        assert_eq!(err.code, USAGE);
    }
}
