use bytes::{Buf, Bytes, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
    qos::QoS,
};

/// Application message, client to broker or broker to client.
///
/// `packet_id` is present on the wire iff the QoS level is 1 or 2.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

const PACKET_TYPE: u8 = 0x03;

impl PublishPacket {
    fn remaining_len(&self) -> usize {
        let mut len = self.topic.encoded_size();
        if self.qos > QoS::AtMostOnce {
            len += 2;
        }
        len + self.payload.len()
    }

    /// Total wire size of the packet, fixed header included.
    pub fn encoded_len(&self) -> usize {
        let remaining = self.remaining_len();
        1 + VariableByteInteger(remaining as u32).encoded_size() + remaining
    }
}

impl Encoder for PublishPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        let mut fixed_header = PACKET_TYPE << 4;
        fixed_header |= (self.dup as u8) << 3;
        fixed_header |= (self.qos as u8) << 1;
        fixed_header |= self.retain as u8;
        fixed_header.encode(buffer);

        VariableByteInteger(self.remaining_len() as u32).encode(buffer);

        self.topic.encode(buffer);
        if self.qos > QoS::AtMostOnce {
            self.packet_id.encode(buffer);
        }

        // Payload goes raw, without a length prefix.
        buffer.extend(&self.payload);
    }
}

impl Decoder for PublishPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        let fixed_header = buffer.get_u8();
        let dup = (fixed_header & 0b0000_1000) != 0;
        let qos = QoS::try_from((fixed_header & 0b0000_0110) >> 1)?;
        let retain = (fixed_header & 0b0000_0001) != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(Error::Malformed("DUP must be zero for QoS 0"));
        }

        let remaining_len = VariableByteInteger::decode(buffer)?.0 as usize;

        let topic = String::decode(buffer)?;
        let mut consumed = topic.encoded_size();

        let packet_id = if qos > QoS::AtMostOnce {
            let id = u16::decode(buffer)?;
            if id == 0 {
                return Err(Error::Malformed("packet id must be non-zero"));
            }
            consumed += 2;
            Some(id)
        } else {
            None
        };

        let payload_len = remaining_len
            .checked_sub(consumed)
            .ok_or(Error::Malformed("remaining length shorter than header"))?;

        if buffer.remaining() < payload_len {
            return Err(Error::Malformed("payload shorter than remaining length"));
        }

        let payload = buffer.copy_to_bytes(payload_len);

        Ok(PublishPacket {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}
