pub mod content;
pub mod message;

pub use message::{
    Envelope, Header, IncomingType, KernelMessage, LogLevel, OutgoingType,
    ProtocolError, SocketChannel, PROTOCOL_VERSION,
};
