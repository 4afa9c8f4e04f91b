use crate::error::{FrameError, Result};

/// One of the two processes on either end of a channel.
///
/// The owner creates the shared-memory names; the guest attaches to them.
/// The owner writes direction `.A` and reads `.B`, the guest the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    Owner = 1,
    Guest = 2,
}

impl Domain {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Owner),
            2 => Ok(Self::Guest),
            other => Err(FrameError::UnknownDomain(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The domain on the other end.
    pub fn peer(self) -> Self {
        match self {
            Self::Owner => Self::Guest,
            Self::Guest => Self::Owner,
        }
    }

    /// Suffix of the direction this domain writes.
    pub fn outbound_suffix(self) -> &'static str {
        match self {
            Self::Owner => ".A",
            Self::Guest => ".B",
        }
    }

    /// Suffix of the direction this domain reads.
    pub fn inbound_suffix(self) -> &'static str {
        self.peer().outbound_suffix()
    }

    /// Whether this domain creates the shared-memory names.
    pub fn is_owner(self) -> bool {
        self == Self::Owner
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => f.write_str("owner"),
            Self::Guest => f.write_str("guest"),
        }
    }
}
