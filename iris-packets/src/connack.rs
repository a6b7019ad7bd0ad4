use bytes::{Buf, BufMut, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
    return_code::ConnectReturnCode,
};

/// Acknowledgement of a CONNECT.
///
/// `session_present` reports whether the broker resumed stored session state;
/// the current engine always sets it to 0.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

const PACKET_TYPE: u8 = 0x02;

impl Encoder for ConnAckPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(PACKET_TYPE << 4);
        VariableByteInteger(2).encode(buffer);
        buffer.put_u8(self.session_present as u8);
        self.return_code.encode(buffer);
    }
}

impl Decoder for ConnAckPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1); // Packet type
        let remaining_len = VariableByteInteger::decode(buffer)?;
        if remaining_len.0 != 2 {
            return Err(Error::Malformed("CONNACK remaining length must be 2"));
        }

        let flags = u8::decode(buffer)?;
        if flags & 0b1111_1110 != 0 {
            return Err(Error::Malformed("CONNACK reserved flags must be zero"));
        }

        Ok(ConnAckPacket {
            session_present: flags & 0b0000_0001 != 0,
            return_code: ConnectReturnCode::decode(buffer)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_packet_encode_decode() {
        let expected = vec![0x20, 0x02, 0x00, 0x00];

        let packet = ConnAckPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        };

        let mut encoded = BytesMut::new();
        packet.encode(&mut encoded);
        assert_eq!(encoded.to_vec(), expected);

        let decoded = ConnAckPacket::decode(&mut encoded).expect("decode failed");
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_connack_rejected_encode() {
        let packet = ConnAckPacket {
            session_present: false,
            return_code: ConnectReturnCode::BadUserNameOrPassword,
        };

        let mut encoded = BytesMut::new();
        packet.encode(&mut encoded);
        assert_eq!(encoded.to_vec(), vec![0x20, 0x02, 0x00, 0x04]);
    }
}
