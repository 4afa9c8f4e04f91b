use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::Message;

/// Encode `message` into `dst`.
///
/// Fails only when a call carries more than [`crate::MAX_ARGUMENTS`]
/// arguments; nothing is written in that case.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    message.validate()?;
    message.encode(dst);
    Ok(())
}

/// Decode one complete message. The whole buffer must be consumed.
pub fn decode_message(src: &[u8]) -> Result<Message> {
    let mut reader = WireReader::new(src);
    let message = Message::decode(&mut reader)?;
    match reader.remaining() {
        0 => Ok(message),
        n => Err(FrameError::TrailingBytes(n)),
    }
}

/// Bounds-checked cursor over an encoded message.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// 7-bit variable-length unsigned integer, low groups first.
    pub fn get_varint(&mut self) -> Result<u32> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.get_u8()?;
            let bits = u32::from(byte & 0x7f);
            if shift == 28 && bits > 0x0f {
                return Err(FrameError::MalformedLength);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FrameError::MalformedLength)
    }

    /// Varint length followed by that many bytes.
    pub fn get_block(&mut self) -> Result<&'a [u8]> {
        let len = self.get_varint()? as usize;
        self.take(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let raw = self.get_block()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameError::InvalidUtf8)
    }

    pub fn get_bytes(&mut self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.get_block()?))
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        if self.buf.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }
}

pub(crate) fn put_varint(dst: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Length-prefixed byte block. Blocks longer than `u32::MAX` cannot occur:
/// a whole frame is bounded by the transport's maximum payload.
pub(crate) fn put_block(dst: &mut BytesMut, data: &[u8]) {
    put_varint(dst, data.len() as u32);
    dst.put_slice(data);
}
