/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The buffer ended in the middle of a field.
    #[error("truncated message (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),

    #[error("unknown type or method reference tag {0}")]
    UnknownReferenceTag(u8),

    #[error("unknown owning domain {0}")]
    UnknownDomain(u8),

    /// A length prefix does not fit in 32 bits.
    #[error("malformed length prefix")]
    MalformedLength,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0:#x} is not a unicode scalar value")]
    InvalidChar(u32),

    /// A call carries more arguments than the one-byte count can describe.
    #[error("too many arguments ({0}, max 255)")]
    TooManyArguments(usize),

    /// The frame holds more bytes than its message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, FrameError>;
