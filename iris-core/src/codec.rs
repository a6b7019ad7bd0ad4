use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Types that can be decoded from an MQTT wire buffer.
pub trait Decoder {
    fn decode<T>(buffer: &mut T) -> crate::Result<Self>
    where
        Self: Sized,
        T: Buf;
}

/// Types that can be encoded into an MQTT wire buffer.
pub trait Encoder {
    fn encode(&self, buffer: &mut BytesMut);
    fn encoded_size(&self) -> usize {
        mem::size_of_val(self)
    }
}

/// The MQTT variable byte integer used for the remaining-length field.
///
/// Values up to 268 435 455 are encoded in one to four bytes, seven bits per
/// byte with the high bit as continuation marker.
#[derive(PartialEq, Eq, Debug, Default)]
pub struct VariableByteInteger(pub u32);

impl Encoder for VariableByteInteger {
    fn encode(&self, buffer: &mut BytesMut) {
        let mut x = self.0;

        loop {
            let mut encoded_byte = (x % 128) as u8;
            x /= 128;

            if x > 0 {
                encoded_byte |= 0b1000_0000;
            }

            buffer.put_u8(encoded_byte);

            if x == 0 {
                break;
            }
        }
    }

    fn encoded_size(&self) -> usize {
        match self.0 {
            0..=127 => 1,
            128..=16383 => 2,
            16384..=2097151 => 3,
            2097152..=268435455 => 4,
            _ => unreachable!(),
        }
    }
}

impl Decoder for VariableByteInteger {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        let mut multiplier: u32 = 1;
        let mut value: u32 = 0;

        loop {
            if !buffer.has_remaining() {
                return Err(Error::Incomplete);
            }

            let encoded_byte = buffer.get_u8();
            value += (encoded_byte & 0b0111_1111) as u32 * multiplier;

            if multiplier > 128 * 128 * 128 {
                return Err(Error::Malformed("remaining length exceeds four bytes"));
            }

            multiplier *= 128;

            if (encoded_byte & 0b1000_0000) == 0 {
                break;
            }
        }

        Ok(VariableByteInteger(value))
    }
}

impl Encoder for u8 {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(*self);
    }
}

impl Decoder for u8 {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        if !buffer.has_remaining() {
            return Err(Error::Incomplete);
        }

        Ok(buffer.get_u8())
    }
}

impl Encoder for u16 {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u16(*self);
    }
}

impl Decoder for u16 {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        if buffer.remaining() < 2 {
            return Err(Error::Incomplete);
        }

        Ok(buffer.get_u16())
    }
}

impl Encoder for String {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u16(self.len() as u16);
        buffer.put(self.as_bytes());
    }

    fn encoded_size(&self) -> usize {
        self.len() + mem::size_of::<u16>()
    }
}

impl Decoder for String {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        if buffer.remaining() < 2 {
            return Err(Error::Incomplete);
        }

        let length = buffer.get_u16();
        if buffer.remaining() < length as usize {
            return Err(Error::Malformed("string length exceeds packet"));
        }

        let bytes = buffer.copy_to_bytes(length.into());

        match String::from_utf8(bytes.to_vec()) {
            Err(_) => Err(Error::Malformed("string is not well-formed UTF-8")),
            Ok(s) => Ok(s),
        }
    }
}

impl Encoder for Bytes {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u16(self.len() as u16);
        buffer.extend(self);
    }

    fn encoded_size(&self) -> usize {
        mem::size_of::<u16>() + self.len()
    }
}

impl Decoder for Bytes {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        if buffer.remaining() < 2 {
            return Err(Error::Incomplete);
        }

        let length = buffer.get_u16();
        if buffer.remaining() < length as usize {
            return Err(Error::Malformed("binary field length exceeds packet"));
        }

        Ok(buffer.copy_to_bytes(length.into()))
    }
}

impl<T> Encoder for Option<T>
where
    T: Encoder,
{
    fn encode(&self, buffer: &mut BytesMut) {
        if let Some(v) = self {
            v.encode(buffer);
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            Some(v) => v.encoded_size(),
            None => 0,
        }
    }
}

impl<T> Encoder for Vec<T>
where
    T: Encoder,
{
    fn encode(&self, buffer: &mut BytesMut) {
        for e in self {
            e.encode(buffer);
        }
    }

    fn encoded_size(&self) -> usize {
        self.iter().map(Encoder::encoded_size).sum()
    }
}
