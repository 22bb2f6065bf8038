//! Control-channel RPC: decode one method call per logical message and
//! dispatch it.
//!
//! Each RPC message gets its own decode task, fed through an in-memory pipe
//! by [`super::target::RpcTarget`] as fragments arrive. Handler errors carry
//! protocol error codes and become reply errors; a payload that is not a
//! JSON-RPC envelope at all produces a `warn` notification instead, since
//! there is no id to reply to.

use super::{dial, SessionShared};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, DuplexStream};
use tracing::{debug, info};
use wsmux_core::protocol::{ConnectCommand, ConnectResponse, TerminateCommand};
use wsmux_core::{ErrorCode, MethodCall, Reply, ResponseError};

/// Read one JSON value off the pipe, dispatch it, and send the reply.
pub(crate) async fn decode_and_dispatch(session: Arc<SessionShared>, mut pipe: DuplexStream) {
    // The demux side enforces the frame size limit before bytes enter the
    // pipe, so this buffer is bounded.
    let mut payload = Vec::new();
    if pipe.read_to_end(&mut payload).await.is_err() {
        return;
    }

    let call: MethodCall = match serde_json::from_slice(&payload) {
        Ok(call) => call,
        Err(_) => {
            session.issue_warning(ErrorCode::BadJson).await;
            return;
        }
    };

    // Replies from the client are discarded; the gateway never issues
    // requests that await one.
    if call.kind == "reply" {
        return;
    }

    let reply = dispatch(&session, call).await;
    session.send_control(&reply).await;
}

async fn dispatch(session: &Arc<SessionShared>, call: MethodCall) -> Reply {
    debug!(id = %session.id, method = %call.method, "rpc dispatch");
    let id = call.id;
    let outcome = match call.method.as_str() {
        "connect" => connect(session, call.params).await,
        "terminate" => terminate(session, call.params).await,
        _ => Err(ErrorCode::UnknownMethod.response_error()),
    };
    match outcome {
        Ok(result) => Reply::result(id, result),
        Err(error) => Reply::error(id, error),
    }
}

/// `connect{url, headers, subprotocols, timeout}` → `{index}`.
async fn connect(
    session: &Arc<SessionShared>,
    params: serde_json::Value,
) -> Result<serde_json::Value, ResponseError> {
    let cmd: ConnectCommand =
        serde_json::from_value(params).map_err(|_| ErrorCode::BadJson.response_error())?;

    let stream = dial::dial(&cmd, &session.config).await?;
    let index = session.insert_connection(stream).await?;
    info!(id = %session.id, index, url = %cmd.url, "upstream connected");
    Ok(serde_json::to_value(ConnectResponse { index }).unwrap_or_default())
}

/// `terminate{index, code, reason}` → `{}`. A no-op when the slot is empty.
async fn terminate(
    session: &Arc<SessionShared>,
    params: serde_json::Value,
) -> Result<serde_json::Value, ResponseError> {
    let cmd: TerminateCommand =
        serde_json::from_value(params).map_err(|_| ErrorCode::BadJson.response_error())?;

    session
        .close_and_notify(cmd.index, cmd.code, &cmd.reason)
        .await;
    Ok(json!({}))
}
