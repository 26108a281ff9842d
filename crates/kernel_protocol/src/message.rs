use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

/// Version of the messaging protocol stamped into every outgoing header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The three logical sockets a kernel talks on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SocketChannel {
    /// Request/reply channel.
    Shell,
    /// Input channel, used to ask the frontend for a line of text.
    Stdin,
    /// Broadcast channel seen by every observer of the session.
    #[serde(rename = "iopub")]
    #[strum(serialize = "iopub")]
    IoPub,
}

/// Message kinds the kernel accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, AsRefStr,
    EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IncomingType {
    ExecuteRequest,
    KernelInfoRequest,
    CompleteRequest,
    InputReply,
    CommOpen,
    CommMsg,
    CommClose,
}

/// Message kinds the kernel emits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, AsRefStr,
    EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutgoingType {
    KernelInfoReply,
    ExecuteReply,
    CompleteReply,
    InputRequest,
    ExecuteResult,
    Stream,
    ExecuteInput,
    Status,
    Error,
    CommOpen,
    CommMsg,
    CommClose,
}

impl IncomingType {
    /// The socket frontends send this kind on.
    pub const fn socket(self) -> SocketChannel {
        match self {
            IncomingType::InputReply => SocketChannel::Stdin,
            _ => SocketChannel::Shell,
        }
    }
}

impl OutgoingType {
    /// The socket every message of this kind is written to.
    pub const fn socket(self) -> SocketChannel {
        match self {
            OutgoingType::KernelInfoReply
            | OutgoingType::ExecuteReply
            | OutgoingType::CompleteReply => SocketChannel::Shell,
            OutgoingType::InputRequest => SocketChannel::Stdin,
            OutgoingType::ExecuteResult
            | OutgoingType::Stream
            | OutgoingType::ExecuteInput
            | OutgoingType::Status
            | OutgoingType::Error
            | OutgoingType::CommOpen
            | OutgoingType::CommMsg
            | OutgoingType::CommClose => SocketChannel::IoPub,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: DateTime<Utc>,
    pub msg_type: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: username.to_string(),
            date: Utc::now(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded protocol message. Byte-level framing and signing live in the
/// transport, not here.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KernelMessage {
    pub header: Header,
    /// Frontends send `{}` for "no parent"; that decodes to `None`.
    #[serde(default, deserialize_with = "empty_object_as_none")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(header: Header, parent: Option<&KernelMessage>, content: Value) -> Self {
        Self {
            header,
            parent_header: parent.map(|p| p.header.clone()),
            metadata: Map::new(),
            content,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Classify this message as one the kernel accepts.
    pub fn incoming_type(&self) -> Result<IncomingType, ProtocolError> {
        self.msg_type()
            .parse::<IncomingType>()
            .map_err(|_| ProtocolError::UnknownMessageType(self.msg_type().to_string()))
    }

    /// Decode `content` into one of the typed structs in [`crate::content`].
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone()).map_err(|err| ProtocolError::MalformedContent {
            msg_type: self.msg_type().to_string(),
            reason: err.to_string(),
        })
    }
}

/// What a socket sink receives: the target socket plus the untouched message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    pub socket: SocketChannel,
    pub message: KernelMessage,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    #[error("malformed `{msg_type}` content: {reason}")]
    MalformedContent { msg_type: String, reason: String },
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display,
    EnumString,
)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

fn empty_object_as_none<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
