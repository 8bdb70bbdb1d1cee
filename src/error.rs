//! Error taxonomy for the command channel.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the codec, client and server.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Peer closed the stream before a complete frame arrived.
    ///
    /// This is the normal end-of-stream signal, not a failure.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The cipher rejected the frame. The buffer has been discarded.
    #[error("frame failed authentication")]
    AuthenticationFailed,

    /// Plaintext was authentic but did not hold a well-formed message.
    #[error("malformed frame: {0}")]
    FrameMalformed(String),

    #[error("frame of {len} bytes exceeds max size of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to seal frame")]
    SealFailed,

    #[error("timed out connecting to {addr} after {elapsed:?}")]
    ConnectTimeout { addr: SocketAddr, elapsed: Duration },

    /// Socket creation, bind, listen or accept failed.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub const fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
