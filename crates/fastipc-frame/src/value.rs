use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{put_block, WireReader};
use crate::domain::Domain;
use crate::error::{FrameError, Result};
use crate::reference::TypeRef;

/// One-byte tag in front of every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    False = 1,
    True = 2,
    Byte = 3,
    Char = 4,
    String = 5,
    Int32 = 6,
    Proxy = 7,
    Other = 8,
}

impl ValueTag {
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Null,
            1 => Self::False,
            2 => Self::True,
            3 => Self::Byte,
            4 => Self::Char,
            5 => Self::String,
            6 => Self::Int32,
            7 => Self::Proxy,
            8 => Self::Other,
            other => return Err(FrameError::UnknownValueTag(other)),
        })
    }
}

/// Reference to an object hosted by one of the two domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRef {
    /// Static type the sender holds the reference as.
    pub declared: TypeRef,
    /// Runtime type of the real instance.
    pub actual: TypeRef,
    pub object_id: i32,
    /// Domain holding the real instance.
    pub domain: Domain,
}

/// A value as it travels in call arguments and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Byte(u8),
    Char(char),
    String(String),
    Int32(i32),
    Proxy(ProxyRef),
    /// Opaque output of the generic serializer.
    Other(Bytes),
}

impl WireValue {
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::Null => ValueTag::Null,
            Self::Bool(false) => ValueTag::False,
            Self::Bool(true) => ValueTag::True,
            Self::Byte(_) => ValueTag::Byte,
            Self::Char(_) => ValueTag::Char,
            Self::String(_) => ValueTag::String,
            Self::Int32(_) => ValueTag::Int32,
            Self::Proxy(_) => ValueTag::Proxy,
            Self::Other(_) => ValueTag::Other,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag() as u8);
        match self {
            Self::Null | Self::Bool(_) => {}
            Self::Byte(b) => dst.put_u8(*b),
            Self::Char(c) => dst.put_u32_le(u32::from(*c)),
            Self::String(s) => put_block(dst, s.as_bytes()),
            Self::Int32(i) => dst.put_i32_le(*i),
            Self::Proxy(proxy) => {
                proxy.declared.encode(dst);
                proxy.actual.encode(dst);
                dst.put_i32_le(proxy.object_id);
                dst.put_u8(proxy.domain.as_u8());
            }
            Self::Other(raw) => put_block(dst, raw),
        }
    }

    pub fn decode(src: &mut WireReader<'_>) -> Result<Self> {
        Ok(match ValueTag::from_u8(src.get_u8()?)? {
            ValueTag::Null => Self::Null,
            ValueTag::False => Self::Bool(false),
            ValueTag::True => Self::Bool(true),
            ValueTag::Byte => Self::Byte(src.get_u8()?),
            ValueTag::Char => {
                let scalar = src.get_u32()?;
                Self::Char(char::from_u32(scalar).ok_or(FrameError::InvalidChar(scalar))?)
            }
            ValueTag::String => Self::String(src.get_string()?),
            ValueTag::Int32 => Self::Int32(src.get_i32()?),
            ValueTag::Proxy => {
                let declared = TypeRef::decode(src)?;
                let actual = TypeRef::decode(src)?;
                let object_id = src.get_i32()?;
                let domain = Domain::from_u8(src.get_u8()?)?;
                Self::Proxy(ProxyRef {
                    declared,
                    actual,
                    object_id,
                    domain,
                })
            }
            ValueTag::Other => Self::Other(src.get_bytes()?),
        })
    }
}
