use thiserror::Error;

use crate::bencode::BencodeError;
use crate::config::ERROR_PROTOCOL_PREFIX;

/// Failure of an outgoing request, or of decoding an incoming envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("refusing to send a request to our own address")]
    SelfNode,

    #[error("timeout")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("all transaction ids are in flight")]
    TransactionsExhausted,

    #[error("received unknown message type")]
    UnknownMessageType,

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("method {0} registered twice")]
    DuplicateMethod(String),
}

impl RpcError {
    /// True when the peer answered with a protocol-error envelope.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, RpcError::Remote(msg) if msg.starts_with(ERROR_PROTOCOL_PREFIX))
    }
}

/// Fault raised by a local handler while serving an inbound query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Drop the query without answering.
    #[error("fail silently")]
    FailSilently,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),

    /// Unexpected failure; reported to the peer as a bare server error.
    #[error("internal error: {0}")]
    Internal(String),
}
