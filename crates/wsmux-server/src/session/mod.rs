//! One client session: the frame demultiplexer and everything it drives.
//!
//! A session owns the client socket and a sparse table of upstream
//! connections. Every data frame from the client starts with a 2-byte
//! big-endian channel index: `0xffff` routes to the control channel (JSON
//! RPC), anything else forwards the rest of the frame to the upstream in
//! that slot. Frames from upstreams travel back with the same prefix so the
//! client can tell the channels apart.
//!
//! The index sits inside the masked region of client frames. Only those two
//! bytes are deciphered; the mask key is then rotated by two positions so
//! the remainder of the payload can be spliced through without touching it.

mod connection;
mod dial;
mod fragment;
mod rpc;
mod socket;
mod target;

pub use socket::{BoxStream, Socket};

use crate::config::GatewayConfig;
use connection::Connection;
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use socket::{CopyError, FrameBody, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use target::{ConnectionTarget, RpcTarget, Target};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wsmux_core::frame::{Frame, FrameHeader, OpCode};
use wsmux_core::protocol::SocketClosedParams;
use wsmux_core::{
    cipher, BufferPool, ErrorCode, MethodCall, MuxError, ResponseError, CONTROL_INDEX,
    INDEX_PREFIX_LEN,
};

/// Concurrent upstream writers during a broadcast close. Fixed, not
/// configurable.
const BROADCAST_PARALLELISM: usize = 16;

/// How long teardown waits for upstream reader tasks before aborting them.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Size of the demux task's body copy buffer.
const READ_COPY_BUFFER_SIZE: usize = 32 * 1024;

/// How the demux loop should proceed after an error.
#[derive(Debug)]
pub(crate) enum SessionError {
    /// Tear the session down with this close status.
    Fatal { code: u16, reason: &'static str },
    /// Per-frame protocol error; report it on the control channel and move on.
    Warn(ErrorCode),
    /// An upstream write failed; drop that connection, keep the session.
    ConnectionGone(u16),
    /// Client transport error; the socket is beyond use.
    Io(MuxError),
}

/// A live upstream slot: the shared write half, the reader task's
/// cancellation signal, and its join handle. Whoever takes the slot out of
/// the table owns shutting the connection down and notifying the client.
pub(crate) struct Slot {
    pub(crate) writer: Arc<Mutex<FrameWriter>>,
    pub(crate) cancel: Arc<Notify>,
    pub(crate) task: JoinHandle<()>,
}

/// State shared between the demux task, upstream reader tasks, and RPC
/// dispatch tasks. The session outlives its connections: teardown closes
/// every upstream and joins the reader tasks before returning.
pub(crate) struct SessionShared {
    pub(crate) id: String,
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) pool: BufferPool,
    client_writer: Arc<Mutex<FrameWriter>>,
    connections: Mutex<Vec<Option<Slot>>>,
}

/// One client session. Constructed around an already-upgraded stream;
/// [`Session::run`] is the demux loop and returns when the session ends.
pub struct Session {
    socket: Socket,
    shared: Arc<SessionShared>,
    read_copy_buffer: Vec<u8>,
}

impl Session {
    pub fn new(stream: BoxStream, config: Arc<GatewayConfig>, pool: BufferPool) -> Self {
        let socket = Socket::from_config(stream, &config);
        let shared = Arc::new(SessionShared {
            id: generate_session_id(),
            config,
            pool,
            client_writer: socket.writer.clone(),
            connections: Mutex::new(Vec::new()),
        });
        Self {
            socket,
            shared,
            read_copy_buffer: vec![0u8; READ_COPY_BUFFER_SIZE],
        }
    }

    pub async fn run(mut self) {
        info!(id = %self.shared.id, "created new session");
        self.demux_loop().await;
        info!(id = %self.shared.id, "client session ended");
    }

    async fn demux_loop(&mut self) {
        let mut target: Option<Target> = None;

        loop {
            let mut header = match self.socket.read_next_frame().await {
                Ok(header) => header,
                Err(_) => {
                    // Peer closures and transport errors land here; they are
                    // not worth logging.
                    self.shared.close_all(1002, "Invalid socket header").await;
                    return;
                }
            };

            if header.opcode == OpCode::Close {
                self.dispatch_close(&header).await;
                return;
            }

            if header.opcode != OpCode::Continuation {
                // New message: strip the index prefix and pick the target.
                match self.create_target(&mut header).await {
                    Ok(next) => target = Some(next),
                    Err(error) => {
                        target = None;
                        if let Flow::End = self.handle_error(error).await {
                            return;
                        }
                        continue;
                    }
                }
            }

            let Some(active) = target.as_mut() else {
                // A continuation with no routing decision pending behaves
                // like an unknown connection: warn, discard the body.
                self.shared
                    .issue_warning(ErrorCode::UnknownConnection)
                    .await;
                continue;
            };

            let result = match active {
                Target::Rpc(rpc) => {
                    rpc.pull(
                        &mut self.socket.reader,
                        &header,
                        &self.shared,
                        &mut self.read_copy_buffer,
                    )
                    .await
                }
                Target::Connection(conn) => conn.pull(&mut self.socket.reader, &header).await,
            };

            if header.fin {
                target = None;
            }
            if let Err(error) = result {
                if let Flow::End = self.handle_error(error).await {
                    return;
                }
            }
        }
    }

    /// Read the 2-byte index off the new message and decide where it routes.
    /// The mask key is rotated past the stripped prefix so the body can be
    /// forwarded without deciphering it.
    async fn create_target(&mut self, header: &mut FrameHeader) -> Result<Target, SessionError> {
        if header.length < INDEX_PREFIX_LEN {
            return Err(SessionError::Warn(ErrorCode::FrameTooShort));
        }

        let mut prefix = [0u8; INDEX_PREFIX_LEN as usize];
        self.socket
            .reader
            .read_body_exact(&mut prefix)
            .await
            .map_err(SessionError::Io)?;

        if let Some(key) = header.mask {
            prefix[0] ^= key[0];
            prefix[1] ^= key[1];
            header.mask = Some(cipher::shift(key, INDEX_PREFIX_LEN as usize));
        }
        header.length -= INDEX_PREFIX_LEN;

        let index = u16::from_be_bytes(prefix);
        if index == CONTROL_INDEX {
            return Ok(Target::Rpc(RpcTarget::new(Arc::clone(&self.shared))));
        }

        match self.shared.connection_writer(index).await {
            Some(writer) => Ok(Target::Connection(ConnectionTarget::new(index, writer))),
            None => Err(SessionError::Warn(ErrorCode::UnknownConnection)),
        }
    }

    /// A close frame from the client: decode the payload and broadcast it to
    /// every live upstream, then echo it back and end the session.
    async fn dispatch_close(&mut self, header: &FrameHeader) {
        if header.length > self.shared.config.frame_size_limit {
            self.shared.close_all(1009, "").await;
            return;
        }

        let mut payload = vec![0u8; header.length as usize];
        if self
            .socket
            .reader
            .read_body_exact(&mut payload)
            .await
            .is_err()
        {
            self.shared.close_all(1000, "").await;
            return;
        }
        if let Some(key) = header.mask {
            cipher::apply(&mut payload, key, 0);
        }

        self.shared.close_all_with(Frame::close_raw(payload)).await;
    }

    async fn handle_error(&mut self, error: SessionError) -> Flow {
        match error {
            SessionError::Warn(code) => {
                self.shared.issue_warning(code).await;
                Flow::Continue
            }
            SessionError::ConnectionGone(index) => {
                warn!(id = %self.shared.id, index, "upstream write failed, dropping connection");
                self.shared.close_and_notify(index, 1001, "").await;
                Flow::Continue
            }
            SessionError::Fatal { code, reason } => {
                self.shared.close_all(code, reason).await;
                Flow::End
            }
            SessionError::Io(_) => {
                self.shared.close_all(1001, "").await;
                Flow::End
            }
        }
    }
}

enum Flow {
    Continue,
    End,
}

impl SessionShared {
    /// The write half of the slot at `index`, if live.
    async fn connection_writer(&self, index: u16) -> Option<Arc<Mutex<FrameWriter>>> {
        let connections = self.connections.lock().await;
        connections
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| Arc::clone(&slot.writer))
    }

    /// Insert a dialed upstream into the lowest empty slot (appending when
    /// none is free) and start its reader task.
    pub(crate) async fn insert_connection(
        self: &Arc<Self>,
        stream: BoxStream,
    ) -> Result<u16, ResponseError> {
        let mut connections = self.connections.lock().await;
        let index = match connections.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                if connections.len() >= CONTROL_INDEX as usize {
                    return Err(ResponseError::dial_error("no free connection slots"));
                }
                connections.push(None);
                connections.len() - 1
            }
        };

        let slot = Connection::spawn(index as u16, stream, Arc::clone(self));
        connections[index] = Some(slot);
        Ok(index as u16)
    }

    pub(crate) async fn take_connection(&self, index: u16) -> Option<Slot> {
        let mut connections = self.connections.lock().await;
        connections.get_mut(index as usize).and_then(Option::take)
    }

    /// Close the upstream at `index` from outside its reader task and tell
    /// the client. Idempotent: the first caller to empty the slot sends the
    /// one `onSocketClosed` notification; later callers are no-ops.
    ///
    /// The reader task is cancelled and joined *before* the notification
    /// goes out, so no frame for this channel can trail it — mandatory once
    /// the freed index is handed to the next `connect`.
    pub(crate) async fn close_and_notify(&self, index: u16, code: u16, reason: &str) {
        let Some(mut slot) = self.take_connection(index).await else {
            return;
        };
        slot.cancel.notify_one();
        {
            let mut writer = slot.writer.lock().await;
            let _ = writer.write_frame(&Frame::close(code, reason)).await;
            let _ = writer.shutdown().await;
        }
        if tokio::time::timeout(TEARDOWN_GRACE, &mut slot.task)
            .await
            .is_err()
        {
            // Stuck mid-frame on a stalled upstream; the client frame it was
            // forwarding is already beyond saving.
            slot.task.abort();
        }
        self.notify_socket_closed(index, code, reason).await;
    }

    /// Send the `onSocketClosed` notification for a channel.
    pub(crate) async fn notify_socket_closed(&self, index: u16, code: u16, reason: &str) {
        let params = SocketClosedParams {
            index,
            code,
            reason: reason.to_string(),
        };
        self.send_method(
            "onSocketClosed",
            serde_json::to_value(params).unwrap_or_default(),
        )
        .await;
    }

    /// Forward one upstream frame to the client, prefixed with its index.
    /// Held under the client write mutex for the whole frame.
    pub(crate) async fn copy_indexed_data(
        &self,
        index: u16,
        header: FrameHeader,
        body: &mut FrameBody<'_>,
    ) -> Result<(), CopyError> {
        let mut writer = self.client_writer.lock().await;
        writer.copy_indexed_data(Some(index), header, body).await
    }

    /// Report a non-fatal protocol error to the client.
    pub(crate) async fn issue_warning(&self, code: ErrorCode) {
        self.send_method(
            "warn",
            serde_json::to_value(code.response_error()).unwrap_or_default(),
        )
        .await;
    }

    /// Send a method call to the client without awaiting a reply.
    pub(crate) async fn send_method(&self, method: &str, params: serde_json::Value) {
        self.send_control(&MethodCall::notification(method, params))
            .await;
    }

    /// Serialize a value and push it to the client on the control channel.
    pub(crate) async fn send_control<T: Serialize>(&self, value: &T) {
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(error) => {
                warn!(id = %self.id, error = %error, "error marshalling control packet");
                return;
            }
        };

        let mut writer = self.client_writer.lock().await;
        if let Err(error) = writer
            .write_indexed_data(
                Some(CONTROL_INDEX),
                FrameHeader::data(OpCode::Text, 0),
                &data,
            )
            .await
        {
            debug!(id = %self.id, error = %error, "control write failed");
        }
    }

    pub(crate) async fn close_all(&self, code: u16, reason: &str) {
        self.close_all_with(Frame::close(code, reason)).await;
    }

    /// Send `frame` (a close frame) to the client and every live upstream,
    /// close all of them, and join the reader tasks. Upstream writes run
    /// 16 at a time.
    pub(crate) async fn close_all_with(&self, frame: Frame) {
        {
            let mut writer = self.client_writer.lock().await;
            let _ = writer.write_frame(&frame).await;
            let _ = writer.shutdown().await;
        }

        let mut slots: Vec<Slot> = {
            let mut connections = self.connections.lock().await;
            connections.iter_mut().filter_map(Option::take).collect()
        };

        futures_util::stream::iter(slots.iter())
            .for_each_concurrent(BROADCAST_PARALLELISM, |slot| {
                let frame = frame.clone();
                async move {
                    slot.cancel.notify_one();
                    let mut writer = slot.writer.lock().await;
                    let _ = writer.write_frame(&frame).await;
                    let _ = writer.shutdown().await;
                }
            })
            .await;

        // Reader tasks finish on their own once their sockets are shut down;
        // abort any that outlive the grace period.
        let join_all = futures_util::future::join_all(slots.iter_mut().map(|slot| &mut slot.task));
        if tokio::time::timeout(TEARDOWN_GRACE, join_all).await.is_err() {
            for slot in &slots {
                slot.task.abort();
            }
        }
    }
}

/// Random session id for log correlation (8 bytes, hex-encoded).
fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
