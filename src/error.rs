use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed wire data: {0}")]
    Format(String),
    #[error("conversation or port mismatch")]
    ProtocolMismatch,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("keepalive timed out")]
    KeepaliveTimeout,
    #[error("peer unreachable")]
    Unreachable,
    #[error("reliable transport failed")]
    TransportFailure,
    #[error("no such port: {0}")]
    NoSuchPort(i32),
    #[error("port {0} is not established")]
    NotEstablished(i32),
    #[error("invalid channel: {0}")]
    InvalidChannel(u16),
    #[error("invalid endpoint descriptor: {0:?}")]
    InvalidDescriptor(String),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<punchlink_core::Error> for Error {
    fn from(value: punchlink_core::Error) -> Self {
        match value {
            punchlink_core::Error::Io(e) => Error::Io(e),
            e => Error::Format(e.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
