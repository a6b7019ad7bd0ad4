use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
    qos::QoS,
};

/// Per-filter result carried in a SUBACK payload, in request order.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubAckReturnCode {
    GrantedQoS0 = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    Failure = 0x80,
}

impl From<QoS> for SubAckReturnCode {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => SubAckReturnCode::GrantedQoS0,
            QoS::AtLeastOnce => SubAckReturnCode::GrantedQoS1,
            QoS::ExactlyOnce => SubAckReturnCode::GrantedQoS2,
        }
    }
}

impl Decoder for SubAckReturnCode {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        match u8::decode(buffer)? {
            0x00 => Ok(SubAckReturnCode::GrantedQoS0),
            0x01 => Ok(SubAckReturnCode::GrantedQoS1),
            0x02 => Ok(SubAckReturnCode::GrantedQoS2),
            0x80 => Ok(SubAckReturnCode::Failure),
            _ => Err(Error::Malformed("unknown SUBACK return code")),
        }
    }
}

/// Acknowledges a SUBSCRIBE with one return code per requested filter.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode>,
}

const PACKET_TYPE: u8 = 0x09;

impl Encoder for SubAckPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4);
        VariableByteInteger((2 + self.return_codes.len()) as u32).encode(buffer);
        self.packet_id.encode(buffer);
        for code in &self.return_codes {
            buffer.put_u8(*code as u8);
        }
    }
}

impl Decoder for SubAckPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1);
        let remaining_len = VariableByteInteger::decode(buffer)?.0 as usize;
        let codes_len = remaining_len
            .checked_sub(2)
            .ok_or(Error::Malformed("SUBACK too short for a packet id"))?;

        let packet_id = u16::decode(buffer)?;

        let mut return_codes = Vec::with_capacity(codes_len);
        for _ in 0..codes_len {
            return_codes.push(SubAckReturnCode::decode(buffer)?);
        }

        Ok(SubAckPacket {
            packet_id,
            return_codes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suback_packet_encode_decode() {
        let expected = vec![0x90, 0x04, 0x00, 0x01, 0x00, 0x02];

        let packet = SubAckPacket {
            packet_id: 1,
            return_codes: vec![SubAckReturnCode::GrantedQoS0, SubAckReturnCode::GrantedQoS2],
        };

        let mut encoded = BytesMut::new();
        packet.encode(&mut encoded);
        assert_eq!(encoded.to_vec(), expected);

        let decoded = SubAckPacket::decode(&mut encoded).expect("decode failed");
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_suback_return_code_from_qos() {
        assert_eq!(
            SubAckReturnCode::from(QoS::AtLeastOnce),
            SubAckReturnCode::GrantedQoS1
        );
    }
}
