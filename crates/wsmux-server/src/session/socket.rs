//! Socket wrapper: framed reads and serialized, deadline-bounded writes over
//! one duplex stream.
//!
//! A [`Socket`] owns the read half outright (exactly one task reads a socket)
//! and shares the write half behind a mutex, because several tasks write to
//! the same socket: the demux task, RPC dispatch tasks, and upstream reader
//! tasks all write to the client socket. A frame is written header-to-last-
//! byte under a single guard, so frames never interleave on the wire.

use crate::config::GatewayConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use wsmux_core::frame::{self, Frame, FrameHeader, OpCode};
use wsmux_core::{cipher, BufferPool, MuxError, MuxResult, PooledBuf, INDEX_PREFIX_LEN};

/// An upgraded duplex byte stream (plain TCP or TLS).
pub trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Scratch buffer size: header + index + small payloads are assembled here
/// and written with one syscall. Also the copy-chunk size for large bodies.
const SCRATCH_SIZE: usize = 32 * 1024;

/// One WebSocket endpoint.
pub struct Socket {
    pub reader: FrameReader,
    pub writer: Arc<Mutex<FrameWriter>>,
}

impl Socket {
    pub fn new(stream: BoxStream, write_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                stream: BufReader::new(read_half),
                remaining: 0,
            },
            writer: Arc::new(Mutex::new(FrameWriter {
                stream: write_half,
                scratch: Vec::with_capacity(SCRATCH_SIZE),
                copy_buf: vec![0u8; SCRATCH_SIZE],
                write_timeout,
            })),
        }
    }

    /// Read the next data or close frame header. Any unread body of the
    /// previous frame is discarded first. Pings are answered with an empty
    /// pong, pongs are swallowed.
    pub async fn read_next_frame(&mut self) -> MuxResult<FrameHeader> {
        loop {
            self.reader.discard_rest().await?;
            let header = self.reader.read_header().await?;
            match header.opcode {
                OpCode::Ping => {
                    self.reader.discard_rest().await?;
                    let mut writer = self.writer.lock().await;
                    writer.write_frame(&Frame::pong()).await?;
                }
                OpCode::Pong => {
                    // payload discarded at the top of the loop
                }
                _ => return Ok(header),
            }
        }
    }

    /// Read the next frame together with a body reader for its full logical
    /// payload, joining continuation fragments up to `limit` bytes.
    ///
    /// Unfragmented frames stream straight through, header untouched. For a
    /// fragmented message, non-final fragments are unmasked into a pooled
    /// buffer and the returned header is the first fragment's with `fin` set,
    /// the summed length, and no mask; the final fragment streams behind the
    /// buffer. A close frame arriving mid-message is surfaced as-is.
    pub async fn read_next_with_body(
        &mut self,
        pool: &BufferPool,
        limit: u64,
    ) -> MuxResult<(FrameHeader, FrameBody<'_>)> {
        let header = self.read_next_frame().await?;
        self.body_for(header, pool, limit).await
    }

    /// Body reader for a frame whose header was already read with
    /// [`Socket::read_next_frame`]. Split out so callers can race the header
    /// read against a cancellation signal without a body borrow in flight.
    pub async fn body_for(
        &mut self,
        header: FrameHeader,
        pool: &BufferPool,
        limit: u64,
    ) -> MuxResult<(FrameHeader, FrameBody<'_>)> {
        if header.opcode == OpCode::Close {
            let mask = header.mask.map(MaskState::new);
            return Ok((header, FrameBody::direct(&mut self.reader, mask)));
        }
        if header.fin {
            return Ok((header, FrameBody::direct(&mut self.reader, None)));
        }
        super::fragment::collect(self, header, pool, limit).await
    }
}

/// The read half of a socket, tracking how much of the current frame's body
/// is still unread so stale bytes can be discarded before the next header.
pub struct FrameReader {
    stream: BufReader<ReadHalf<BoxStream>>,
    remaining: u64,
}

impl FrameReader {
    /// Read and parse the next frame header. The previous frame's body must
    /// have been fully consumed or discarded.
    pub async fn read_header(&mut self) -> MuxResult<FrameHeader> {
        debug_assert_eq!(self.remaining, 0, "unread body bytes before header");
        let header = frame::read_header(&mut self.stream).await?;
        self.remaining = header.length;
        Ok(header)
    }

    /// Read up to `buf.len()` body bytes of the current frame. Returns 0 at
    /// the end of the frame body.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> MuxResult<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(MuxError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Read exactly `buf.len()` body bytes of the current frame.
    pub async fn read_body_exact(&mut self, buf: &mut [u8]) -> MuxResult<()> {
        if (buf.len() as u64) > self.remaining {
            return Err(MuxError::Protocol("frame body shorter than expected".into()));
        }
        self.stream.read_exact(buf).await?;
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    /// Unread body bytes of the current frame.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read and drop the rest of the current frame's body.
    pub async fn discard_rest(&mut self) -> MuxResult<()> {
        let mut sink = [0u8; 4096];
        while self.remaining > 0 {
            let want = (sink.len() as u64).min(self.remaining) as usize;
            let n = self.stream.read(&mut sink[..want]).await?;
            if n == 0 {
                return Err(MuxError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            self.remaining -= n as u64;
        }
        Ok(())
    }
}

/// Rolling decipher state for a streamed, masked body.
#[derive(Debug, Clone, Copy)]
pub struct MaskState {
    pub key: [u8; 4],
    pub offset: usize,
}

impl MaskState {
    pub fn new(key: [u8; 4]) -> Self {
        Self { key, offset: 0 }
    }
}

/// A readable view over one logical frame body: an optional buffered head
/// (joined fragments) followed by the final fragment streamed off the socket,
/// optionally deciphered on the way through.
///
/// Dropping the body returns the pooled head buffer to its pool.
pub struct FrameBody<'a> {
    head: Option<PooledBuf>,
    head_pos: usize,
    reader: &'a mut FrameReader,
    tail_mask: Option<MaskState>,
}

impl<'a> FrameBody<'a> {
    /// A body streamed directly off the socket.
    pub fn direct(reader: &'a mut FrameReader, tail_mask: Option<MaskState>) -> Self {
        Self {
            head: None,
            head_pos: 0,
            reader,
            tail_mask,
        }
    }

    /// A body whose first bytes were buffered during fragment collection.
    pub fn buffered(
        head: PooledBuf,
        reader: &'a mut FrameReader,
        tail_mask: Option<MaskState>,
    ) -> Self {
        Self {
            head: Some(head),
            head_pos: 0,
            reader,
            tail_mask,
        }
    }

    /// Bytes left in this body.
    pub fn len(&self) -> u64 {
        let head_left = self
            .head
            .as_ref()
            .map(|h| h.len() - self.head_pos)
            .unwrap_or(0) as u64;
        head_left + self.reader.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes. Returns 0 at the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> MuxResult<usize> {
        if let Some(head) = &self.head {
            if self.head_pos < head.len() {
                let n = buf.len().min(head.len() - self.head_pos);
                buf[..n].copy_from_slice(&head[self.head_pos..self.head_pos + n]);
                self.head_pos += n;
                return Ok(n);
            }
        }
        let n = self.reader.read_body(buf).await?;
        if let Some(mask) = &mut self.tail_mask {
            cipher::apply(&mut buf[..n], mask.key, mask.offset);
            mask.offset += n;
        }
        Ok(n)
    }

    /// Read the whole body into a vector, capped at `max` bytes; anything
    /// past the cap is dropped. Used for close payloads.
    pub async fn read_to_vec(&mut self, max: usize) -> MuxResult<Vec<u8>> {
        let mut out = vec![0u8; (self.len() as usize).min(max)];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }
}

/// A write error, classified by which side failed: reading the body source
/// or writing the destination socket. The session routes the two cases
/// differently.
#[derive(Debug)]
pub enum CopyError {
    Read(MuxError),
    Write(MuxError),
}

impl CopyError {
    pub fn into_inner(self) -> MuxError {
        match self {
            CopyError::Read(e) | CopyError::Write(e) => e,
        }
    }
}

/// The write half of a socket. All writes go through the owning mutex; each
/// one is bounded by the configured write timeout.
pub struct FrameWriter {
    stream: WriteHalf<BoxStream>,
    scratch: Vec<u8>,
    copy_buf: Vec<u8>,
    write_timeout: Duration,
}

impl FrameWriter {
    /// Write a fully-assembled frame (header + payload, one syscall).
    pub async fn write_frame(&mut self, frame: &Frame) -> MuxResult<()> {
        self.scratch.clear();
        frame::encode_header(&frame.header, &mut self.scratch);
        self.scratch.extend_from_slice(&frame.payload);
        write_deadline(&mut self.stream, self.write_timeout, &self.scratch).await?;
        flush_deadline(&mut self.stream, self.write_timeout).await
    }

    /// Write a frame whose payload is `index` (when given) followed by
    /// `body`. The header length is adjusted to cover the prefix. Small
    /// frames are assembled in the scratch buffer and written at once.
    pub async fn write_indexed_data(
        &mut self,
        index: Option<u16>,
        mut header: FrameHeader,
        body: &[u8],
    ) -> MuxResult<()> {
        header.length = body.len() as u64;
        if index.is_some() {
            header.length += INDEX_PREFIX_LEN;
        }

        self.scratch.clear();
        frame::encode_header(&header, &mut self.scratch);
        if let Some(index) = index {
            self.scratch.extend_from_slice(&index.to_be_bytes());
        }

        if self.scratch.len() + body.len() <= SCRATCH_SIZE {
            self.scratch.extend_from_slice(body);
            write_deadline(&mut self.stream, self.write_timeout, &self.scratch).await?;
        } else {
            write_deadline(&mut self.stream, self.write_timeout, &self.scratch).await?;
            write_deadline(&mut self.stream, self.write_timeout, body).await?;
        }
        flush_deadline(&mut self.stream, self.write_timeout).await
    }

    /// Streaming variant of [`FrameWriter::write_indexed_data`]: the body is
    /// copied from `body` through the reusable copy buffer. `header.length`
    /// must already equal the body length.
    pub async fn copy_indexed_data(
        &mut self,
        index: Option<u16>,
        mut header: FrameHeader,
        body: &mut FrameBody<'_>,
    ) -> Result<(), CopyError> {
        if index.is_some() {
            header.length += INDEX_PREFIX_LEN;
        }

        let Self {
            stream,
            scratch,
            copy_buf,
            write_timeout,
        } = self;

        scratch.clear();
        frame::encode_header(&header, scratch);
        if let Some(index) = index {
            scratch.extend_from_slice(&index.to_be_bytes());
        }

        if header.length as usize <= SCRATCH_SIZE.saturating_sub(scratch.len()) {
            // Small frame: assemble header + prefix + body, one syscall.
            loop {
                let n = body.read(copy_buf).await.map_err(CopyError::Read)?;
                if n == 0 {
                    break;
                }
                scratch.extend_from_slice(&copy_buf[..n]);
            }
            write_deadline(stream, *write_timeout, scratch)
                .await
                .map_err(CopyError::Write)?;
        } else {
            write_deadline(stream, *write_timeout, scratch)
                .await
                .map_err(CopyError::Write)?;
            loop {
                let n = body.read(copy_buf).await.map_err(CopyError::Read)?;
                if n == 0 {
                    break;
                }
                write_deadline(stream, *write_timeout, &copy_buf[..n])
                    .await
                    .map_err(CopyError::Write)?;
            }
        }
        flush_deadline(stream, *write_timeout)
            .await
            .map_err(CopyError::Write)
    }

    /// Shut down the write side of the socket.
    pub async fn shutdown(&mut self) -> MuxResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl Socket {
    pub fn from_config(stream: BoxStream, config: &GatewayConfig) -> Self {
        Self::new(stream, config.write_timeout)
    }
}

async fn write_deadline(
    stream: &mut WriteHalf<BoxStream>,
    deadline: Duration,
    bytes: &[u8],
) -> MuxResult<()> {
    if deadline.is_zero() {
        stream.write_all(bytes).await?;
        return Ok(());
    }
    match tokio::time::timeout(deadline, stream.write_all(bytes)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(MuxError::Timeout),
    }
}

async fn flush_deadline(stream: &mut WriteHalf<BoxStream>, deadline: Duration) -> MuxResult<()> {
    if deadline.is_zero() {
        stream.flush().await?;
        return Ok(());
    }
    match tokio::time::timeout(deadline, stream.flush()).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(MuxError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsmux_core::frame::encode_header;

    fn boxed(stream: tokio::io::DuplexStream) -> BoxStream {
        Box::new(stream)
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (peer, ours) = tokio::io::duplex(4096);
        let mut socket = Socket::new(boxed(ours), Duration::from_secs(1));

        let (mut peer_read, mut peer_write) = tokio::io::split(peer);
        // ping with a payload, then a data frame
        let mut bytes = Vec::new();
        encode_header(&FrameHeader::data(OpCode::Ping, 2), &mut bytes);
        bytes.extend_from_slice(b"hi");
        encode_header(&FrameHeader::data(OpCode::Binary, 3), &mut bytes);
        bytes.extend_from_slice(b"abc");
        peer_write.write_all(&bytes).await.unwrap();

        let header = socket.read_next_frame().await.unwrap();
        assert_eq!(header.opcode, OpCode::Binary);
        assert_eq!(header.length, 3);

        // The peer should have received an empty pong.
        let mut pong = [0u8; 2];
        peer_read.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8a, 0x00]);
    }

    #[tokio::test]
    async fn write_indexed_data_prefixes_the_index() {
        let (peer, ours) = tokio::io::duplex(4096);
        let socket = Socket::new(boxed(ours), Duration::from_secs(1));

        {
            let mut writer = socket.writer.lock().await;
            writer
                .write_indexed_data(Some(3), FrameHeader::data(OpCode::Binary, 0), b"payload")
                .await
                .unwrap();
        }

        let (mut peer_read, _peer_write) = tokio::io::split(peer);
        let mut bytes = [0u8; 11];
        peer_read.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 9); // 2-byte index + 7-byte payload
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 3);
        assert_eq!(&bytes[4..], b"payload");
    }

    #[tokio::test]
    async fn copy_streams_large_bodies() {
        let (peer, ours) = tokio::io::duplex(256 * 1024);
        let mut source = Socket::new(boxed(ours), Duration::from_secs(1));

        let payload = vec![0x5au8; 100_000];
        let (_peer_read, mut peer_write) = tokio::io::split(peer);
        let mut bytes = Vec::new();
        encode_header(
            &FrameHeader::data(OpCode::Binary, payload.len() as u64),
            &mut bytes,
        );
        bytes.extend_from_slice(&payload);
        let writer = tokio::spawn(async move {
            peer_write.write_all(&bytes).await.unwrap();
        });

        let (sink_peer, sink_ours) = tokio::io::duplex(256 * 1024);
        let sink = Socket::new(boxed(sink_ours), Duration::from_secs(1));

        let header = source.read_next_frame().await.unwrap();
        let mut body = FrameBody::direct(&mut source.reader, None);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            let (mut sink_read, _w) = tokio::io::split(sink_peer);
            let mut chunk = [0u8; 4096];
            loop {
                let n = sink_read.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&chunk[..n]);
            }
            out
        });

        {
            let mut w = sink.writer.lock().await;
            w.copy_indexed_data(Some(0), header, &mut body).await.unwrap();
            w.shutdown().await.unwrap();
        }
        drop(sink);

        writer.await.unwrap();
        let forwarded = reader.await.unwrap();
        // 100002 bytes does not fit a 16-bit length, so the header uses the
        // 64-bit encoding: 2 fixed bytes + 8 length bytes.
        assert_eq!(forwarded[0], 0x82);
        assert_eq!(forwarded[1], 127);
        let length = u64::from_be_bytes(forwarded[2..10].try_into().unwrap());
        assert_eq!(length, payload.len() as u64 + 2);
        assert_eq!(u16::from_be_bytes([forwarded[10], forwarded[11]]), 0);
        assert_eq!(&forwarded[12..], &payload[..]);
    }
}
