//! One upstream connection: a reader task that forwards every frame to the
//! client with the channel index prefixed, and reports closure back to the
//! session exactly once.
//!
//! The reader honors a cancellation signal between frames. When the session
//! side tears the connection down (`terminate`, a failed forward, broadcast
//! close), it fires the signal and joins this task before telling the client
//! the channel is gone, so no frame for the old channel can trail the
//! `onSocketClosed` notification or leak into a reused slot.

use super::socket::{BoxStream, Socket};
use super::{SessionShared, Slot};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use wsmux_core::frame::{self, Frame, OpCode};

pub(crate) struct Connection {
    index: u16,
    socket: Socket,
    session: Arc<SessionShared>,
}

impl Connection {
    /// Wrap an upgraded upstream stream and start its reader task. The
    /// returned slot carries the shared write half, the cancellation signal,
    /// and the task handle the session joins at teardown.
    pub(crate) fn spawn(index: u16, stream: BoxStream, session: Arc<SessionShared>) -> Slot {
        let socket = Socket::from_config(stream, &session.config);
        let writer = socket.writer.clone();
        let cancel = Arc::new(Notify::new());
        let connection = Connection {
            index,
            socket,
            session,
        };
        let task = tokio::spawn(connection.run(Arc::clone(&cancel)));
        Slot {
            writer,
            cancel,
            task,
        }
    }

    async fn run(mut self, cancel: Arc<Notify>) {
        debug!(id = %self.session.id, index = self.index, "upstream reader started");
        loop {
            let limit = self.session.config.frame_size_limit;

            // Cancellation is only honored between frames: an in-flight
            // forward finishes under the client write mutex, keeping client
            // frames whole.
            let header = tokio::select! {
                biased;
                _ = cancel.notified() => {
                    // The session side is tearing this connection down and
                    // sends the closure notification once we are gone.
                    return;
                }
                header = self.socket.read_next_frame() => header,
            };

            let next = match header {
                Ok(header) => self.socket.body_for(header, &self.session.pool, limit).await,
                Err(error) => Err(error),
            };
            let (header, mut body) = match next {
                Ok(next) => next,
                Err(_) => {
                    // Upstream gone (EOF, transport error, oversized reply).
                    self.signal_closed(1001, "").await;
                    return;
                }
            };

            if header.opcode == OpCode::Close {
                let payload = body.read_to_vec(4096).await.unwrap_or_default();
                let (code, reason) = frame::parse_close_payload(&payload);
                self.signal_closed(code, &reason).await;
                return;
            }

            if let Err(error) = self
                .session
                .copy_indexed_data(self.index, header, &mut body)
                .await
            {
                // A failing client socket ends the session through the demux
                // loop; nothing useful to do from here.
                debug!(
                    id = %self.session.id,
                    index = self.index,
                    error = %error.into_inner(),
                    "client write failed"
                );
            }
        }
    }

    /// Reader-side closure: whoever empties the slot owns the one
    /// `onSocketClosed` notification. A no-op when the session side got
    /// there first.
    async fn signal_closed(&self, code: u16, reason: &str) {
        let Some(slot) = self.session.take_connection(self.index).await else {
            return;
        };
        {
            let mut writer = slot.writer.lock().await;
            let _ = writer.write_frame(&Frame::close(code, reason)).await;
            let _ = writer.shutdown().await;
        }
        self.session
            .notify_socket_closed(self.index, code, reason)
            .await;
    }
}
