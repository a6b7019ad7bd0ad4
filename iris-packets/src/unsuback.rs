use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
};

/// Acknowledges an UNSUBSCRIBE.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
}

const PACKET_TYPE: u8 = 0x0b;

impl Encoder for UnsubAckPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4);
        VariableByteInteger(2).encode(buffer);
        self.packet_id.encode(buffer);
    }
}

impl Decoder for UnsubAckPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1);
        let remaining_len = VariableByteInteger::decode(buffer)?;
        if remaining_len.0 != 2 {
            return Err(Error::Malformed("UNSUBACK remaining length must be 2"));
        }

        Ok(UnsubAckPacket {
            packet_id: u16::decode(buffer)?,
        })
    }
}
