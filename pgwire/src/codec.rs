//! Framed channel for one client socket. The stream switches to TLS in
//! place when an SSLRequest is accepted.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsAcceptor, TlsStream};

use common::err::server_error::ServerError;
use common::err::SResult;

/// Frames larger than this are a protocol violation, not a real message.
const MAX_MESSAGE_SIZE: usize = 512 * 1024 * 1024;

pub enum ChannelStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while an SSLRequest upgrade is in flight.
    Upgrading,
}

pub struct PgChannel {
    stream: ChannelStream,
}

impl PgChannel {
    pub fn new(stream: TcpStream) -> Self {
        PgChannel {
            stream: ChannelStream::Plain(stream),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ChannelStream::Tls(_))
    }

    fn upgrading_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "tls upgrade in flight")
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match &mut self.stream {
            ChannelStream::Plain(s) => s.read_exact(buf).await.map(|_| ()),
            ChannelStream::Tls(s) => s.read_exact(buf).await.map(|_| ()),
            ChannelStream::Upgrading => Err(Self::upgrading_error()),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> SResult<()> {
        match &mut self.stream {
            ChannelStream::Plain(s) => s.write_all(buf).await?,
            ChannelStream::Tls(s) => s.write_all(buf).await?,
            ChannelStream::Upgrading => return Err(Self::upgrading_error().into()),
        }
        Ok(())
    }

    pub async fn flush_out(&mut self, out: &mut BytesMut) -> SResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let data = out.split();
        self.write_all(&data).await?;
        match &mut self.stream {
            ChannelStream::Plain(s) => s.flush().await?,
            ChannelStream::Tls(s) => s.flush().await?,
            ChannelStream::Upgrading => return Err(Self::upgrading_error().into()),
        }
        Ok(())
    }

    /// Startup-phase frame: length-prefixed, no tag byte.
    pub async fn read_startup_frame(&mut self) -> SResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(ServerError::Protocol(format!(
                "bad startup frame length {}",
                len
            )));
        }
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Regular frame: tag byte plus length-prefixed payload.
    pub async fn read_frame(&mut self) -> SResult<(u8, Vec<u8>)> {
        let mut header = [0u8; 5];
        self.read_exact(&mut header).await?;
        let tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(ServerError::Protocol(format!(
                "bad frame length {} for tag '{}'",
                len, tag as char
            )));
        }
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload).await?;
        Ok((tag, payload))
    }

    /// Single-byte SSLRequest / GSSEncRequest answer.
    pub async fn write_byte(&mut self, byte: u8) -> SResult<()> {
        self.write_all(&[byte]).await
    }

    /// Accept-side TLS upgrade after replying 'S' to SSLRequest.
    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> SResult<()> {
        match std::mem::replace(&mut self.stream, ChannelStream::Upgrading) {
            ChannelStream::Plain(stream) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| ServerError::Protocol(format!("tls accept: {}", err)))?;
                self.stream = ChannelStream::Tls(Box::new(tls));
                Ok(())
            }
            other => {
                self.stream = other;
                Ok(())
            }
        }
    }
}
