use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
};

/// Clean shutdown notice from the client; discards any pending will.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct DisconnectPacket {}

const PACKET_TYPE: u8 = 0x0e;

impl Encoder for DisconnectPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4);
        buffer.put_u8(0);
    }
}

impl Decoder for DisconnectPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1);
        let remaining_len = VariableByteInteger::decode(buffer)?;
        if remaining_len.0 != 0 {
            return Err(Error::Malformed("DISCONNECT must have no payload"));
        }

        Ok(DisconnectPacket {})
    }
}
