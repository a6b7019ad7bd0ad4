use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
};

/// Second publisher packet in the QoS 2 flow.
///
/// The fixed-header flags are required to be `0010` (MQTT-3.6.1-1).
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct PubRelPacket {
    pub packet_id: u16,
}

const PACKET_TYPE: u8 = 0x06;

impl Encoder for PubRelPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4 | 0b0000_0010);
        VariableByteInteger(2).encode(buffer);
        self.packet_id.encode(buffer);
    }
}

impl Decoder for PubRelPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        let fixed_header = buffer.get_u8();
        if fixed_header & 0b0000_1111 != 0b0000_0010 {
            return Err(Error::Malformed("PUBREL flags must be 0010"));
        }

        let remaining_len = VariableByteInteger::decode(buffer)?;
        if remaining_len.0 != 2 {
            return Err(Error::Malformed("PUBREL remaining length must be 2"));
        }

        Ok(PubRelPacket {
            packet_id: u16::decode(buffer)?,
        })
    }
}
