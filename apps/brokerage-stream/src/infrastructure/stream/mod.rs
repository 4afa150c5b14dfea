//! Streaming wire protocol: binary frame codec, control messages, connect
//! URLs and the reconnect backoff.

pub mod backoff;
pub mod codec;
pub mod control;
pub mod endpoint;

pub use backoff::{Backoff, BackoffConfig};
pub use codec::{CodecError, FrameCodec, StreamMessage};
pub use control::{ControlMessage, Heartbeat, HeartbeatReason};
pub use endpoint::{ConnectUrlError, connect_url};
