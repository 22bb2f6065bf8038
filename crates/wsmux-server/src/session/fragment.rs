//! Fragment collection: joining a sequence of continuation frames into one
//! logical body without holding the final fragment in memory.
//!
//! The collector buffers every non-final fragment (deciphered) into a pooled
//! buffer, then hands back an effective header — first fragment's opcode,
//! `fin` set, summed length, no mask — together with a body that drains the
//! buffer and streams the final fragment straight off the socket. The pooled
//! buffer goes back to its pool when the body is dropped.

use super::socket::{FrameBody, MaskState, Socket};
use wsmux_core::frame::{Frame, FrameHeader, OpCode};
use wsmux_core::{cipher, BufferPool, MuxError, MuxResult};

/// Join continuation frames following `first` (already consumed, `fin` false).
///
/// At each header, if the buffered bytes plus the incoming fragment would
/// exceed `limit`, a 1009 close frame is written to the source socket, the
/// socket is shut down, and the collection fails. A close frame arriving
/// mid-message is surfaced to the caller in place of the joined body.
pub async fn collect<'a>(
    socket: &'a mut Socket,
    first: FrameHeader,
    pool: &BufferPool,
    limit: u64,
) -> MuxResult<(FrameHeader, FrameBody<'a>)> {
    let mut buf = pool.acquire();
    let mut header = first;

    loop {
        if buf.len() as u64 + header.length > limit {
            let mut writer = socket.writer.lock().await;
            let _ = writer.write_frame(&Frame::close(1009, "")).await;
            let _ = writer.shutdown().await;
            return Err(MuxError::Protocol(
                "fragmented message exceeds frame size limit".into(),
            ));
        }

        if header.opcode == OpCode::Close {
            let mask = header.mask.map(MaskState::new);
            return Ok((header, FrameBody::direct(&mut socket.reader, mask)));
        }

        if header.fin {
            let mut effective = first;
            effective.fin = true;
            effective.length = buf.len() as u64 + header.length;
            effective.mask = None;
            let tail_mask = header.mask.map(MaskState::new);
            return Ok((
                effective,
                FrameBody::buffered(buf, &mut socket.reader, tail_mask),
            ));
        }

        // Buffer this fragment, deciphered.
        let start = buf.len();
        buf.resize(start + header.length as usize, 0);
        socket.reader.read_body_exact(&mut buf[start..]).await?;
        if let Some(key) = header.mask {
            cipher::apply(&mut buf[start..], key, 0);
        }

        header = socket.read_next_frame().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::super::socket::BoxStream;
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wsmux_core::frame::{self, encode_header};

    fn boxed(stream: tokio::io::DuplexStream) -> BoxStream {
        Box::new(stream)
    }

    /// Encode a masked client frame the way a browser would.
    fn client_frame(fin: bool, opcode: OpCode, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            fin,
            rsv: 0,
            opcode,
            mask: Some(mask),
            length: payload.len() as u64,
        };
        let mut bytes = Vec::new();
        encode_header(&header, &mut bytes);
        let start = bytes.len();
        bytes.extend_from_slice(payload);
        cipher::apply(&mut bytes[start..], mask, 0);
        bytes
    }

    #[tokio::test]
    async fn joins_fragments_and_streams_tail() {
        let (peer, ours) = tokio::io::duplex(64 * 1024);
        let mut socket = Socket::new(boxed(ours), Duration::from_secs(1));
        let pool = BufferPool::new();

        let (_peer_read, mut peer_write) = tokio::io::split(peer);
        let mask = [7, 7, 7, 7];
        let mut bytes = client_frame(false, OpCode::Binary, mask, b"hello ");
        bytes.extend(client_frame(false, OpCode::Continuation, mask, b"fragmented "));
        bytes.extend(client_frame(true, OpCode::Continuation, mask, b"world"));
        peer_write.write_all(&bytes).await.unwrap();

        let (header, mut body) = socket
            .read_next_with_body(&pool, 1024 * 1024)
            .await
            .unwrap();
        assert!(header.fin);
        assert_eq!(header.opcode, OpCode::Binary);
        assert_eq!(header.length, 22);
        assert!(header.mask.is_none());

        let data = body.read_to_vec(1024).await.unwrap();
        assert_eq!(&data, b"hello fragmented world");
    }

    #[tokio::test]
    async fn pings_between_fragments_are_handled() {
        let (peer, ours) = tokio::io::duplex(64 * 1024);
        let mut socket = Socket::new(boxed(ours), Duration::from_secs(1));
        let pool = BufferPool::new();

        let (mut peer_read, mut peer_write) = tokio::io::split(peer);
        let mask = [1, 0, 1, 0];
        let mut bytes = client_frame(false, OpCode::Text, mask, b"ab");
        encode_header(&FrameHeader::data(OpCode::Ping, 0), &mut bytes);
        bytes.extend(client_frame(true, OpCode::Continuation, mask, b"cd"));
        peer_write.write_all(&bytes).await.unwrap();

        let (header, mut body) = socket
            .read_next_with_body(&pool, 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(header.length, 4);
        assert_eq!(body.read_to_vec(16).await.unwrap(), b"abcd");

        let mut pong = [0u8; 2];
        peer_read.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8a, 0x00]);
    }

    #[tokio::test]
    async fn oversized_fragments_close_the_socket() {
        let (peer, ours) = tokio::io::duplex(64 * 1024);
        let mut socket = Socket::new(boxed(ours), Duration::from_secs(1));
        let pool = BufferPool::new();

        let (mut peer_read, mut peer_write) = tokio::io::split(peer);
        let mut bytes = client_frame(false, OpCode::Binary, [1, 2, 3, 4], &[0u8; 60]);
        bytes.extend(client_frame(true, OpCode::Continuation, [1, 2, 3, 4], &[0u8; 60]));
        peer_write.write_all(&bytes).await.unwrap();

        let result = socket.read_next_with_body(&pool, 100).await;
        assert!(result.is_err());

        // 1009 close frame on the wire: header + 2-byte code.
        let mut close = [0u8; 4];
        peer_read.read_exact(&mut close).await.unwrap();
        assert_eq!(close[0], 0x88);
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1009);
    }

    #[tokio::test]
    async fn close_mid_fragment_is_surfaced() {
        let (peer, ours) = tokio::io::duplex(64 * 1024);
        let mut socket = Socket::new(boxed(ours), Duration::from_secs(1));
        let pool = BufferPool::new();

        let (_peer_read, mut peer_write) = tokio::io::split(peer);
        let mut bytes = client_frame(false, OpCode::Binary, [5, 6, 7, 8], b"partial");
        encode_header(&FrameHeader::data(OpCode::Close, 2), &mut bytes);
        bytes.extend_from_slice(&1001u16.to_be_bytes());
        peer_write.write_all(&bytes).await.unwrap();

        let (header, mut body) = socket
            .read_next_with_body(&pool, 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(header.opcode, OpCode::Close);
        let payload = body.read_to_vec(128).await.unwrap();
        assert_eq!(frame::parse_close_payload(&payload).0, 1001);
    }
}
