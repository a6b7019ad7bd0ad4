use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
};

/// Acknowledges a QoS 1 PUBLISH.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct PubAckPacket {
    pub packet_id: u16,
}

const PACKET_TYPE: u8 = 0x04;

impl Encoder for PubAckPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4);
        VariableByteInteger(2).encode(buffer);
        self.packet_id.encode(buffer);
    }
}

impl Decoder for PubAckPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1);
        let remaining_len = VariableByteInteger::decode(buffer)?;
        if remaining_len.0 != 2 {
            return Err(Error::Malformed("PUBACK remaining length must be 2"));
        }

        Ok(PubAckPacket {
            packet_id: u16::decode(buffer)?,
        })
    }
}
