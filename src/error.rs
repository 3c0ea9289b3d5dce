// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite;

/// Represent the types of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error. The peer violated the protocol and the
    /// connection is closed.
    DecodeError,

    /// Send packet error.
    SendError,

    /// Socket stream error.
    SocketError,

    /// Cert files error.
    CertError,

    /// mpsc/oneshot channel error.
    ChannelError,

    /// Invalid config file.
    ConfigError,

    LoggerError,

    /// Command line parameter error.
    ParameterError,

    /// Password file format error.
    FormatError,

    /// Peer sent a packet that is not legal in the current state.
    ProtocolError,

    /// Connection refused by the broker.
    ConnectionRefused,

    /// All 65535 packet ids are in flight. Retry later.
    PacketIdExhausted,

    /// The pending operation was cancelled because the handler stopped.
    Cancelled,

    /// Operation requested on a stopped handler.
    HandlerStopped,

    /// Timed out waiting for the peer.
    Timeout,
}

/// Represent a common error object.
#[derive(Debug, Clone)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::from_string(ErrorKind::SocketError, format!("Websocket error: {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("Encode error: {err}"))
    }
}

impl From<codec::TopicError> for Error {
    fn from(err: codec::TopicError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("Invalid topic: {err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("Decode error: {err}"))
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(err: mpsc::error::SendError<T>) -> Self {
        Self::from_string(ErrorKind::ChannelError, format!("Channel error: {err}"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_err: oneshot::error::RecvError) -> Self {
        Self::new(ErrorKind::Cancelled, "Pending operation cancelled")
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::from_string(ErrorKind::ConfigError, format!("Invalid config: {err}"))
    }
}
