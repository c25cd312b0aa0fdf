//! Socket wire vocabulary.
//!
//! Every frame, in both directions, is one JSON text message of the shape
//! `{"name": <event>, "params": <value>}`. Client frames are validated field
//! by field so a malformed request earns a protocol error naming the
//! offending field instead of an opaque serde rejection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw frame envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl Frame {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Store-change notification, the `update` frame payload.
///
/// Field names are part of the wire contract: `k` is the store key, `d` the
/// structural patch, `h` the hash of the value the patch applies to. A
/// receiver holding a different hash has missed an update and must re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub k: String,
    pub d: Value,
    pub h: String,
}

/// Server-to-client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum ServerFrame {
    #[serde(rename = "handshake-ack")]
    HandshakeAck { pid: String, recovered: bool },
    #[serde(rename = "unhandshake-ack")]
    UnhandshakeAck {},
    #[serde(rename = "update")]
    Update(DiffRecord),
    #[serde(rename = "event")]
    Event {
        #[serde(rename = "eventName")]
        event_name: String,
        params: Value,
    },
    #[serde(rename = "err")]
    Err { err: String },
    #[serde(rename = "debug")]
    Debug(Value),
    #[serde(rename = "log")]
    Log(Value),
    #[serde(rename = "warn")]
    Warn(Value),
}

impl ServerFrame {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::HandshakeAck { .. } => "handshake-ack",
            ServerFrame::UnhandshakeAck {} => "unhandshake-ack",
            ServerFrame::Update(_) => "update",
            ServerFrame::Event { .. } => "event",
            ServerFrame::Err { .. } => "err",
            ServerFrame::Debug(_) => "debug",
            ServerFrame::Log(_) => "log",
            ServerFrame::Warn(_) => "warn",
        }
    }
}

/// Client-to-server requests, after field validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Handshake { guid: String },
    Unhandshake,
    SubscribeTo { key: String },
    UnsubscribeFrom { key: String },
    ListenTo { event_name: String },
    UnlistenFrom { event_name: String },
}

impl ClientCommand {
    /// Validate a raw frame into a command.
    ///
    /// The error strings are part of the protocol; they go back to the
    /// client verbatim in an `err` frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, String> {
        match frame.name.as_str() {
            "handshake" => Ok(Self::Handshake {
                guid: require_string(frame, "guid")?,
            }),
            "unhandshake" => Ok(Self::Unhandshake),
            "subscribeTo" => Ok(Self::SubscribeTo {
                key: require_string(frame, "key")?,
            }),
            "unsubscribeFrom" => Ok(Self::UnsubscribeFrom {
                key: require_string(frame, "key")?,
            }),
            "listenTo" => Ok(Self::ListenTo {
                event_name: require_string(frame, "eventName")?,
            }),
            "unlistenFrom" => Ok(Self::UnlistenFrom {
                event_name: require_string(frame, "eventName")?,
            }),
            other => Err(format!("unknown frame: {other}")),
        }
    }
}

fn require_string(frame: &Frame, field: &str) -> Result<String, String> {
    frame
        .params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("{}.params.{}: expected String.", frame.name, field))
}
