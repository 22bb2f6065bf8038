//! wsmux-core: shared wire-level library for the wsmux gateway.
//!
//! Provides the WebSocket frame codec, the rolling XOR mask cipher, the
//! control-channel JSON-RPC envelope, and the fragment buffer pool.

pub mod buffer_pool;
pub mod cipher;
pub mod error;
pub mod frame;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use buffer_pool::{BufferPool, PooledBuf};
pub use error::{MuxError, MuxResult};
pub use frame::{Frame, FrameHeader, OpCode};
pub use protocol::{ErrorCode, MethodCall, Reply, ResponseError, CONTROL_INDEX, INDEX_PREFIX_LEN};
