//! MQTT v3.1.1 CONNACK return codes.

use bytes::{Buf, BufMut};
use core::fmt;

use crate::codec::{Decoder, Encoder};
use crate::error::Error;

/// Return code carried in the second byte of a CONNACK variable header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0x00,
    /// The server does not support the requested protocol level.
    UnacceptableProtocolVersion = 0x01,
    /// The client identifier is not allowed by the server.
    IdentifierRejected = 0x02,
    /// The MQTT service is unavailable.
    ServerUnavailable = 0x03,
    /// The data in the user name or password is malformed or wrong.
    BadUserNameOrPassword = 0x04,
    /// The client is not authorized to connect.
    NotAuthorized = 0x05,
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        write!(f, "{}", msg)
    }
}

impl Encoder for ConnectReturnCode {
    fn encode(&self, buffer: &mut bytes::BytesMut) {
        buffer.put_u8(*self as u8);
    }

    fn encoded_size(&self) -> usize {
        1
    }
}

impl Decoder for ConnectReturnCode {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        if !buffer.has_remaining() {
            return Err(Error::Incomplete);
        }

        match buffer.get_u8() {
            0x00 => Ok(ConnectReturnCode::Accepted),
            0x01 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            0x02 => Ok(ConnectReturnCode::IdentifierRejected),
            0x03 => Ok(ConnectReturnCode::ServerUnavailable),
            0x04 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            0x05 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(Error::Malformed("unknown CONNACK return code")),
        }
    }
}
