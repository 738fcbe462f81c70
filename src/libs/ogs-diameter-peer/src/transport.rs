//! Diameter transport layer
//!
//! Framing for Diameter over any byte stream (TCP, TLS, in-memory) per
//! RFC 6733 Section 2.1. The first header byte is the version and the next
//! 3 bytes are the message length, which delimits each frame.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DiameterError, DiameterResult, PeerError, PeerResult};
use crate::message::{DiameterMessage, DIAMETER_HEADER_SIZE};

/// Maximum Diameter message size (default 64KB, RFC allows up to 16MB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// A byte stream a Diameter connection can run over
pub trait DiameterStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DiameterStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedReader = MessageReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type BoxedWriter = MessageWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// One frame read off the stream
#[derive(Debug)]
pub enum Frame {
    Message(DiameterMessage),
    /// A complete frame whose content did not decode; the stream stays in sync
    Malformed(DiameterError),
}

/// Reading half: turns a byte stream into frames
pub struct MessageReader<R> {
    inner: R,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Receive the next frame.
    ///
    /// An error means the stream can no longer be framed (I/O failure,
    /// EOF, or a length field outside the accepted range).
    pub async fn recv(&mut self) -> DiameterResult<Frame> {
        loop {
            if let Some(frame) = self.try_parse_frame()? {
                return Ok(frame);
            }

            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(DiameterError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    fn try_parse_frame(&mut self) -> DiameterResult<Option<Frame>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        // Message length from header bytes 1-3 (3-byte big-endian)
        let msg_len = ((self.read_buf[1] as usize) << 16)
            | ((self.read_buf[2] as usize) << 8)
            | self.read_buf[3] as usize;

        if msg_len < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} is less than header size"
            )));
        }

        if msg_len > MAX_MESSAGE_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }

        if self.read_buf.len() < msg_len {
            return Ok(None);
        }

        let mut bytes = self.read_buf.split_to(msg_len).freeze();
        Ok(Some(match DiameterMessage::decode(&mut bytes) {
            Ok(msg) => Frame::Message(msg),
            Err(e) => Frame::Malformed(e),
        }))
    }
}

/// Writing half: one encoded message per call
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &DiameterMessage) -> DiameterResult<()> {
        self.send_frame(&msg.encode()).await
    }

    /// Write one already encoded message.
    ///
    /// Not cancel safe: dropping the future mid-write leaves a partial frame
    /// on the stream. Connections run it on their dedicated writer task.
    pub async fn send_frame(&mut self, frame: &[u8]) -> DiameterResult<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> DiameterResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a stream into boxed framing halves
pub fn split<S: DiameterStream>(stream: S) -> (BoxedReader, BoxedWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        MessageReader::new(Box::new(read_half)),
        MessageWriter::new(Box::new(write_half)),
    )
}

/// Open a TCP connection to `address` (`host:port`).
///
/// Returns the stream and the resolved remote address.
pub async fn dial_tcp(address: &str, timeout: Duration) -> PeerResult<(TcpStream, String)> {
    let dial_error = |source: std::io::Error| PeerError::Dial {
        address: address.to_string(),
        source,
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            dial_error(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection within {timeout:?}"),
            ))
        })?
        .map_err(dial_error)?;

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY towards {address}: {e}");
    }
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| address.to_string());

    log::debug!("TCP connected to {peer_addr}");
    Ok((stream, peer_addr))
}
