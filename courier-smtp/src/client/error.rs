use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that is not an SMTP reply.
    #[error("Malformed SMTP reply: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed by remote server")]
    ConnectionClosed,

    #[error("Reply was not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether the failure happened at the transport level (socket or TLS),
    /// as opposed to the server speaking something we could not understand.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed | Self::Tls(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
