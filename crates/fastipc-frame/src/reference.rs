//! Type and method references.
//!
//! Types and methods of the module a channel is specialized for travel as a
//! bare registry token. Anything else carries the type's qualified name so
//! the peer can resolve it through its own registry.

use bytes::{BufMut, BytesMut};

use crate::codec::{put_block, WireReader};
use crate::error::{FrameError, Result};

const TAG_TOKEN: u8 = 1;
const TAG_NAMED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Token of a type in the channel's own module.
    Token(u32),
    /// Qualified name of a type from another module.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodRef {
    /// Token of a method declared in the channel's own module.
    Token(u32),
    /// Method token scoped by the qualified name of its declaring type.
    Named { type_name: String, token: u32 },
}

impl TypeRef {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Token(token) => {
                dst.put_u8(TAG_TOKEN);
                dst.put_u32_le(*token);
            }
            Self::Named(name) => {
                dst.put_u8(TAG_NAMED);
                put_block(dst, name.as_bytes());
            }
        }
    }

    pub fn decode(src: &mut WireReader<'_>) -> Result<Self> {
        match src.get_u8()? {
            TAG_TOKEN => Ok(Self::Token(src.get_u32()?)),
            TAG_NAMED => Ok(Self::Named(src.get_string()?)),
            other => Err(FrameError::UnknownReferenceTag(other)),
        }
    }
}

impl MethodRef {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Token(token) => {
                dst.put_u8(TAG_TOKEN);
                dst.put_u32_le(*token);
            }
            Self::Named { type_name, token } => {
                dst.put_u8(TAG_NAMED);
                put_block(dst, type_name.as_bytes());
                dst.put_u32_le(*token);
            }
        }
    }

    pub fn decode(src: &mut WireReader<'_>) -> Result<Self> {
        match src.get_u8()? {
            TAG_TOKEN => Ok(Self::Token(src.get_u32()?)),
            TAG_NAMED => {
                let type_name = src.get_string()?;
                let token = src.get_u32()?;
                Ok(Self::Named { type_name, token })
            }
            other => Err(FrameError::UnknownReferenceTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_form_is_five_bytes() {
        let mut buf = BytesMut::new();
        TypeRef::Token(0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[..], [1, 4, 3, 2, 1]);
    }

    #[test]
    fn named_method_reads_back() {
        let method = MethodRef::Named {
            type_name: "geometry::Shape".to_string(),
            token: 7,
        };
        let mut buf = BytesMut::new();
        method.encode(&mut buf);

        let mut reader = WireReader::new(&buf);
        assert_eq!(MethodRef::decode(&mut reader).unwrap(), method);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut reader = WireReader::new(&[9, 0, 0, 0, 0]);
        assert_eq!(
            TypeRef::decode(&mut reader),
            Err(FrameError::UnknownReferenceTag(9))
        );
    }
}
