use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{put_block, WireReader};
use crate::error::{FrameError, Result};
use crate::reference::{MethodRef, TypeRef};
use crate::value::WireValue;

/// Arguments per call are counted in one byte.
pub const MAX_ARGUMENTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Activation = 0,
    Deactivation = 1,
    MethodCall = 2,
    ReturnValue = 3,
    ReturnException = 4,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Result<Self> {
        Ok(match kind {
            0 => Self::Activation,
            1 => Self::Deactivation,
            2 => Self::MethodCall,
            3 => Self::ReturnValue,
            4 => Self::ReturnException,
            other => return Err(FrameError::UnknownMessageKind(other)),
        })
    }
}

/// One protocol unit; exactly one per transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the peer to instantiate and register a type.
    Activation { number: i32, type_ref: TypeRef },
    /// The sender dropped its last reference to a peer-hosted object.
    /// Fire-and-forget: carries no message number.
    Deactivation { object_id: i32 },
    MethodCall {
        number: i32,
        object_id: i32,
        /// Defer the reply until an asynchronous result settles.
        await_result: bool,
        method: MethodRef,
        args: Vec<WireValue>,
    },
    ReturnValue { number: i32, value: WireValue },
    /// Serialized fault raised while serving call `number`.
    ReturnException { number: i32, fault: Bytes },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Activation { .. } => MessageKind::Activation,
            Self::Deactivation { .. } => MessageKind::Deactivation,
            Self::MethodCall { .. } => MessageKind::MethodCall,
            Self::ReturnValue { .. } => MessageKind::ReturnValue,
            Self::ReturnException { .. } => MessageKind::ReturnException,
        }
    }

    /// Correlation number; `None` for a deactivation.
    pub fn number(&self) -> Option<i32> {
        match self {
            Self::Deactivation { .. } => None,
            Self::Activation { number, .. }
            | Self::MethodCall { number, .. }
            | Self::ReturnValue { number, .. }
            | Self::ReturnException { number, .. } => Some(*number),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        crate::codec::encode_message(self, &mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Self::MethodCall { args, .. } if args.len() > MAX_ARGUMENTS => {
                Err(FrameError::TooManyArguments(args.len()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind() as u8);
        if let Some(number) = self.number() {
            dst.put_i32_le(number);
        }
        match self {
            Self::Activation { type_ref, .. } => type_ref.encode(dst),
            Self::Deactivation { object_id } => dst.put_i32_le(*object_id),
            Self::MethodCall {
                object_id,
                await_result,
                method,
                args,
                ..
            } => {
                dst.put_i32_le(*object_id);
                dst.put_u8(u8::from(*await_result));
                method.encode(dst);
                dst.put_u8(args.len() as u8);
                for arg in args {
                    arg.encode(dst);
                }
            }
            Self::ReturnValue { value, .. } => value.encode(dst),
            Self::ReturnException { fault, .. } => put_block(dst, fault),
        }
    }

    pub(crate) fn decode(src: &mut WireReader<'_>) -> Result<Self> {
        Ok(match MessageKind::from_u8(src.get_u8()?)? {
            MessageKind::Deactivation => Self::Deactivation {
                object_id: src.get_i32()?,
            },
            MessageKind::Activation => Self::Activation {
                number: src.get_i32()?,
                type_ref: TypeRef::decode(src)?,
            },
            MessageKind::MethodCall => {
                let number = src.get_i32()?;
                let object_id = src.get_i32()?;
                let await_result = src.get_u8()? != 0;
                let method = MethodRef::decode(src)?;
                let count = usize::from(src.get_u8()?);
                let args = (0..count)
                    .map(|_| WireValue::decode(src))
                    .collect::<Result<Vec<_>>>()?;
                Self::MethodCall {
                    number,
                    object_id,
                    await_result,
                    method,
                    args,
                }
            }
            MessageKind::ReturnValue => Self::ReturnValue {
                number: src.get_i32()?,
                value: WireValue::decode(src)?,
            },
            MessageKind::ReturnException => Self::ReturnException {
                number: src.get_i32()?,
                fault: src.get_bytes()?,
            },
        })
    }
}
