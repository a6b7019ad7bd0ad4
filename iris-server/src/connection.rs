use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    net::TcpStream,
};

use iris_core::error::Error;
use iris_packets::ControlPacket;

/// Default capacity for the read buffer (8KB)
const READ_BUFFER_CAPACITY: usize = 8192;

/// Framed MQTT transport over a byte stream.
///
/// The read side accumulates bytes until a whole control packet is buffered;
/// the write side takes pre-encoded bytes straight off the session's
/// outbound queue.
pub(crate) struct Connection<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream: BufWriter<S>,
    read_buffer: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(socket: S) -> Connection<S> {
        Connection {
            stream: BufWriter::new(socket),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Read one control packet, or `None` on a clean end of stream.
    pub(crate) async fn read_packet(&mut self) -> iris_core::Result<Option<ControlPacket>> {
        loop {
            if let Some(packet) = self.parse_packet()? {
                return Ok(Some(packet));
            }

            if 0 == self.stream.read_buf(&mut self.read_buffer).await? {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(Error::ProtocolViolation("connection reset mid-packet"));
                }
            }
        }
    }

    /// Write pre-encoded packet bytes and flush them to the peer.
    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) -> iris_core::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;

        Ok(())
    }

    fn parse_packet(&mut self) -> iris_core::Result<Option<ControlPacket>> {
        match ControlPacket::check(&self.read_buffer) {
            Ok(_) => {
                let packet = ControlPacket::parse(&mut self.read_buffer)?;
                Ok(Some(packet))
            }
            // Not enough bytes in the buffer to parse a packet
            Err(Error::Incomplete) => Ok(None),
            // An actual error
            Err(e) => Err(e),
        }
    }
}
