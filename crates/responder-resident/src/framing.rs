//! Async packet framing.

use crate::errors::{WireError, WireResult};
use crate::protocol::{Header, Packet, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads whole packets from an [`AsyncRead`].
pub struct PacketReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next packet. `Ok(None)` means the peer closed the stream on a
    /// packet boundary; a close in the middle of a packet is an error.
    ///
    /// Not cancellation safe: run it in a dedicated task rather than in a
    /// `select!` branch.
    pub async fn next(&mut self) -> WireResult<Option<Packet>> {
        let mut header = [0u8; HEADER_LEN];
        let mut off = 0;
        while off < HEADER_LEN {
            let n = self.reader.read(&mut header[off..]).await?;
            if n == 0 {
                if off == 0 {
                    return Ok(None);
                }
                return Err(WireError::Closed);
            }
            off += n;
        }

        let header = Header::parse(&header)?;
        let mut body = vec![0u8; header.body_len];
        match self.reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
            Err(e) => return Err(e.into()),
        }
        Packet::decode(header.packet_type, &body).map(Some)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes whole packets to an [`AsyncWrite`].
pub struct PacketWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, packet: &Packet) -> WireResult<()> {
        let bytes = packet.encode()?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
