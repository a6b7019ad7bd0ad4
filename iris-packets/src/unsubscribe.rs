use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
};

/// Client request to drop one or more topic filters.
///
/// The fixed-header flags are required to be `0010` (MQTT-3.10.1-1) and the
/// payload must carry at least one filter (MQTT-3.10.3-2).
#[derive(Default, Debug, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

const PACKET_TYPE: u8 = 0x0a;

impl Encoder for UnsubscribePacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4 | 0b0000_0010);

        let remaining_len = 2 + self.filters.encoded_size();
        VariableByteInteger(remaining_len as u32).encode(buffer);

        self.packet_id.encode(buffer);
        self.filters.encode(buffer);
    }
}

impl Decoder for UnsubscribePacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        let fixed_header = buffer.get_u8();
        if fixed_header & 0b0000_1111 != 0b0000_0010 {
            return Err(Error::Malformed("UNSUBSCRIBE flags must be 0010"));
        }

        let remaining_len = VariableByteInteger::decode(buffer)?.0 as usize;
        let payload_len = remaining_len
            .checked_sub(2)
            .ok_or(Error::Malformed("UNSUBSCRIBE too short for a packet id"))?;

        let packet_id = u16::decode(buffer)?;

        if buffer.remaining() < payload_len {
            return Err(Error::Incomplete);
        }

        let mut payload = buffer.take(payload_len);
        let mut filters = Vec::new();

        while payload.has_remaining() {
            filters.push(String::decode(&mut payload)?);
        }

        if filters.is_empty() {
            return Err(Error::ProtocolViolation(
                "UNSUBSCRIBE must carry at least one topic filter",
            ));
        }

        Ok(UnsubscribePacket { packet_id, filters })
    }
}
