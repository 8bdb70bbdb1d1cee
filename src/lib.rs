//! sockpuppet library
//!
//! Point-to-point encrypted command channel over TCP:
//! - Length-prefixed AES-GCM framing of protobuf messages
//! - Client connector with bounded connect retry
//! - Single-task connection multiplexer and request dispatcher
//! - Server lifecycle control (attached/detached start, stop, wait)

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod transport;

pub use client::{Client, ClientOptions};
pub use dispatch::{CommandHandler, Dispatcher, HandlerOutput};
pub use error::ChannelError;
pub use lifecycle::{Phase, Server, ServerState};
pub use transport::{CommandKind, FrameCodec, Request, Response, SharedKey};
