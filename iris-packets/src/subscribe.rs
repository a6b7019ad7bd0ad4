use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
    qos::QoS,
};

/// One `(topic filter, requested QoS)` tuple of a SUBSCRIBE payload.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
}

/// Client request to receive messages matching one or more topic filters.
///
/// The fixed-header flags are required to be `0010` (MQTT-3.8.1-1) and the
/// payload must carry at least one filter (MQTT-3.8.3-3).
#[derive(Default, Debug, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<SubscriptionRequest>,
}

const PACKET_TYPE: u8 = 0x08;

impl Encoder for SubscribePacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4 | 0b0000_0010);

        let mut remaining_len = 2;
        for sub in &self.filters {
            remaining_len += sub.filter.encoded_size() + 1;
        }
        VariableByteInteger(remaining_len as u32).encode(buffer);

        self.packet_id.encode(buffer);
        for sub in &self.filters {
            sub.filter.encode(buffer);
            buffer.put_u8(sub.qos as u8);
        }
    }
}

impl Decoder for SubscribePacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        let fixed_header = buffer.get_u8();
        if fixed_header & 0b0000_1111 != 0b0000_0010 {
            return Err(Error::Malformed("SUBSCRIBE flags must be 0010"));
        }

        let remaining_len = VariableByteInteger::decode(buffer)?.0 as usize;
        let payload_len = remaining_len
            .checked_sub(2)
            .ok_or(Error::Malformed("SUBSCRIBE too short for a packet id"))?;

        let packet_id = u16::decode(buffer)?;
        if packet_id == 0 {
            return Err(Error::Malformed("packet id must be non-zero"));
        }

        if buffer.remaining() < payload_len {
            return Err(Error::Incomplete);
        }

        let mut payload = buffer.take(payload_len);
        let mut filters = Vec::new();

        while payload.has_remaining() {
            let filter = String::decode(&mut payload)?;
            let qos_byte = u8::decode(&mut payload)?;
            if qos_byte & 0b1111_1100 != 0 {
                return Err(Error::Malformed("reserved subscription option bits set"));
            }

            filters.push(SubscriptionRequest {
                filter,
                qos: QoS::try_from(qos_byte)?,
            });
        }

        if filters.is_empty() {
            return Err(Error::ProtocolViolation(
                "SUBSCRIBE must carry at least one topic filter",
            ));
        }

        Ok(SubscribePacket { packet_id, filters })
    }
}
