use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::message::MessageKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds the message size limit")]
    FrameTooLarge(usize),

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("frame tagged {tagged:?} carries a {actual:?} body")]
    KindMismatch {
        tagged: MessageKind,
        actual: MessageKind,
    },

    #[error("key not found")]
    NotFound,

    #[error("peer {addr} unreachable: {source}")]
    UnreachablePeer {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unexpected reply from {addr}")]
    UnexpectedReply { addr: SocketAddr },

    #[error("value of {0} bytes exceeds the record size limit")]
    ValueTooLarge(usize),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::UnreachablePeer { .. })
    }

    /// Errors a connection handler recovers from by dropping the connection.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Decode(_)
                | Error::FrameTooLarge(_)
                | Error::UnknownMessageKind(_)
                | Error::KindMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
