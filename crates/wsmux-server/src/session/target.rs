//! Per-message routing state.
//!
//! The routing decision made on the first frame of a message must survive
//! its continuation frames, which carry neither opcode nor index prefix. The
//! session keeps the active [`Target`] from the first header until FIN.

use super::socket::{CopyError, FrameBody, FrameReader, FrameWriter, MaskState};
use super::{SessionError, SessionShared};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use wsmux_core::cipher;
use wsmux_core::frame::FrameHeader;

/// In-memory pipe capacity between the demux task and an RPC decode task.
const RPC_PIPE_CAPACITY: usize = 64 * 1024;

/// Where the frames of the current client message are routed.
pub(crate) enum Target {
    Rpc(RpcTarget),
    Connection(ConnectionTarget),
}

/// Routes control-channel payload into a pipe consumed by a concurrently
/// spawned decode-and-dispatch task.
pub(crate) struct RpcTarget {
    total_read: u64,
    pipe: Option<DuplexStream>,
}

impl RpcTarget {
    /// Create the pipe and start the decode task for one logical message.
    pub(crate) fn new(session: Arc<SessionShared>) -> Self {
        let (pipe, decode_end) = tokio::io::duplex(RPC_PIPE_CAPACITY);
        tokio::spawn(super::rpc::decode_and_dispatch(session, decode_end));
        Self {
            total_read: 0,
            pipe: Some(pipe),
        }
    }

    /// Stream one frame's payload into the pipe, deciphering inline. The
    /// cumulative message size is enforced against the frame size limit; on
    /// excess the session is torn down with a 1009 close. On FIN the pipe is
    /// closed so the decode task sees end-of-message.
    pub(crate) async fn pull(
        &mut self,
        reader: &mut FrameReader,
        header: &FrameHeader,
        session: &SessionShared,
        scratch: &mut [u8],
    ) -> Result<(), SessionError> {
        if self.total_read + header.length > session.config.frame_size_limit {
            return Err(SessionError::Fatal {
                code: 1009,
                reason: "",
            });
        }

        let mut mask = header.mask.map(MaskState::new);
        loop {
            let n = reader.read_body(scratch).await.map_err(SessionError::Io)?;
            if n == 0 {
                break;
            }
            if let Some(state) = &mut mask {
                cipher::apply(&mut scratch[..n], state.key, state.offset);
                state.offset += n;
            }
            self.total_read += n as u64;

            let Some(pipe) = self.pipe.as_mut() else {
                // Decode task is gone; keep draining the frame.
                continue;
            };
            if pipe.write_all(&scratch[..n]).await.is_err() {
                self.pipe = None;
            }
        }

        if header.fin {
            if let Some(mut pipe) = self.pipe.take() {
                let _ = pipe.shutdown().await;
            }
        }
        Ok(())
    }
}

/// Forwards frames byte-for-byte to one upstream socket. The header carries
/// the (shifted) mask; the payload is spliced through still enciphered.
pub(crate) struct ConnectionTarget {
    pub(crate) index: u16,
    writer: Arc<Mutex<FrameWriter>>,
}

impl ConnectionTarget {
    pub(crate) fn new(index: u16, writer: Arc<Mutex<FrameWriter>>) -> Self {
        Self { index, writer }
    }

    /// Copy one frame to the upstream. A failure reading the client is a
    /// session-level transport error; a failure writing the upstream only
    /// takes that connection down.
    pub(crate) async fn pull(
        &mut self,
        reader: &mut FrameReader,
        header: &FrameHeader,
    ) -> Result<(), SessionError> {
        let mut body = FrameBody::direct(reader, None);
        let mut writer = self.writer.lock().await;
        match writer.copy_indexed_data(None, *header, &mut body).await {
            Ok(()) => Ok(()),
            Err(CopyError::Read(e)) => Err(SessionError::Io(e)),
            Err(CopyError::Write(_)) => Err(SessionError::ConnectionGone(self.index)),
        }
    }
}
