use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use iris_core::{
    codec::{Decoder, Encoder, VariableByteInteger},
    error::Error,
    qos::QoS,
};

/// MQTT v3.1.1 protocol name and level, fixed for every CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

#[derive(Default, Debug, PartialEq, Eq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl Encoder for ConnectFlags {
    fn encode(&self, buffer: &mut BytesMut) {
        let mut flags: u8 = 0;

        if self.username {
            flags |= 0b1000_0000;
        }

        if self.password {
            flags |= 0b0100_0000;
        }

        if self.will {
            flags |= 0b0000_0100;
            flags |= (self.will_qos as u8) << 3;

            if self.will_retain {
                flags |= 0b0010_0000;
            }
        }

        if self.clean_session {
            flags |= 0b0000_0010;
        }

        buffer.put_u8(flags);
    }

    fn encoded_size(&self) -> usize {
        mem::size_of::<u8>()
    }
}

impl Decoder for ConnectFlags {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        if !buffer.has_remaining() {
            return Err(Error::Incomplete);
        }

        let byte = buffer.get_u8();

        // The reserved bit must be zero.
        if (byte & 0b0000_0001) != 0 {
            return Err(Error::Malformed("CONNECT reserved flag must be zero"));
        }

        let will = (byte & 0b0000_0100) != 0;
        let will_qos = QoS::try_from((byte >> 3) & 0b0000_0011)?;
        let will_retain = (byte & 0b0010_0000) != 0;

        // Will QoS and retain carry no meaning without the will flag.
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::Malformed("will flags set without will flag"));
        }

        let username = (byte & 0b1000_0000) != 0;
        let password = (byte & 0b0100_0000) != 0;

        if password && !username {
            return Err(Error::Malformed("password flag set without user name flag"));
        }

        Ok(ConnectFlags {
            username,
            password,
            will_retain,
            will_qos,
            will,
            clean_session: (byte & 0b0000_0010) != 0,
        })
    }
}

/// The first packet a client sends on a new network connection.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Protocol level byte as received; anything but 4 is rejected by the
    /// CONNECT handler with return code 1.
    pub protocol_level: u8,
    pub flags: ConnectFlags,
    pub keepalive: u16,
    pub client_id: String,
    pub will_topic: Option<String>,
    pub will_payload: Option<Bytes>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

const PACKET_TYPE: u8 = 0x01;

impl Encoder for ConnectPacket {
    fn encode(&self, buffer: &mut BytesMut) {
        let mut remaining_len = 0;

        buffer.put_u8(PACKET_TYPE << 4);

        remaining_len += PROTOCOL_NAME.len() + mem::size_of::<u16>();
        remaining_len += mem::size_of::<u8>(); // Protocol level
        remaining_len += self.flags.encoded_size();
        remaining_len += mem::size_of::<u16>(); // Keepalive
        remaining_len += self.client_id.encoded_size();

        if self.flags.will {
            remaining_len += self.will_topic.encoded_size();
            remaining_len += self.will_payload.encoded_size();
        }
        if self.flags.username {
            remaining_len += self.username.encoded_size();
        }
        if self.flags.password {
            remaining_len += self.password.encoded_size();
        }

        VariableByteInteger(remaining_len as u32).encode(buffer);

        buffer.put_u16(PROTOCOL_NAME.len() as u16);
        buffer.put(PROTOCOL_NAME.as_bytes());
        buffer.put_u8(self.protocol_level);
        self.flags.encode(buffer);
        buffer.put_u16(self.keepalive);

        self.client_id.encode(buffer);
        if self.flags.will {
            self.will_topic.encode(buffer);
            self.will_payload.encode(buffer);
        }
        if self.flags.username {
            self.username.encode(buffer);
        }
        if self.flags.password {
            self.password.encode(buffer);
        }
    }
}

impl Decoder for ConnectPacket {
    fn decode<T: Buf>(buffer: &mut T) -> iris_core::Result<Self> {
        buffer.advance(1); // Packet type
        let _ = VariableByteInteger::decode(buffer)?; // Remaining length

        let protocol_name = String::decode(buffer)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(Error::Malformed("unknown protocol name"));
        }

        let protocol_level = u8::decode(buffer)?;
        let flags = ConnectFlags::decode(buffer)?;
        let keepalive = u16::decode(buffer)?;

        let client_id = String::decode(buffer)?;

        let (will_topic, will_payload) = if flags.will {
            (Some(String::decode(buffer)?), Some(Bytes::decode(buffer)?))
        } else {
            (None, None)
        };

        let username = if flags.username {
            Some(String::decode(buffer)?)
        } else {
            None
        };

        let password = if flags.password {
            Some(Bytes::decode(buffer)?)
        } else {
            None
        };

        Ok(ConnectPacket {
            protocol_level,
            flags,
            keepalive,
            client_id,
            will_topic,
            will_payload,
            username,
            password,
        })
    }
}
