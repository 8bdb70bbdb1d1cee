//! Command channel message types.
//!
//! Messages are protobuf-encoded and travel inside an encrypted frame:
//! [4-byte BE length][AEAD(varint body length ++ protobuf body)]

use std::collections::HashMap;
use std::fmt;

/// Command carried by a [`Request`].
///
/// `Unspecified` is the protobuf default and is treated as a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandKind {
    Unspecified = 0,
    /// Terminate the server loop.
    Exit = 1,
    Info = 2,
    Download = 3,
    RunCommand = 4,
    Collect = 5,
    Monitor = 6,
}

impl CommandKind {
    /// Stable lowercase name used in logs and on the CLI.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Exit => "exit",
            Self::Info => "info",
            Self::Download => "download",
            Self::RunCommand => "run_command",
            Self::Collect => "collect",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request sent from client to server.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Request {
    #[prost(enumeration = "CommandKind", tag = "1")]
    pub kind: i32,
    /// Caller-chosen correlation id, echoed in [`Response::request_id`].
    #[prost(string, tag = "2")]
    pub id: String,
    /// Free-form identifier of the sender.
    #[prost(string, tag = "3")]
    pub origin: String,
}

impl Request {
    pub fn new(kind: CommandKind, id: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind: kind as i32,
            id: id.into(),
            origin: origin.into(),
        }
    }

    /// Decoded command kind, or `None` for values this build does not know.
    pub fn command(&self) -> Option<CommandKind> {
        CommandKind::try_from(self.kind).ok()
    }
}

/// Response built by the dispatcher for every handled request.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Response {
    #[prost(string, tag = "1")]
    pub origin: String,
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(map = "string, string", tag = "3")]
    pub attributes: HashMap<String, String>,
}

impl Response {
    /// Empty response correlated with `request`.
    pub fn for_request(origin: impl Into<String>, request: &Request) -> Self {
        Self {
            origin: origin.into(),
            request_id: request.id.clone(),
            attributes: HashMap::new(),
        }
    }
}
