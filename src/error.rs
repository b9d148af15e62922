//! Error taxonomy, one `thiserror` enum per layer, matching the shape
//! `haysel::ipc::IPCConnectionErr` uses: a small enum per failure domain
//! with `#[from]` conversions so `?` composes across layers without manual
//! wrapping at every call site.

use thiserror::Error;

use crate::codec::CodecError;

/// Failures from a single physical connection's I/O task. These never kill
/// the session by themselves — the engine reacts by running cleanup for
/// that one connection and, if configured, opening a replacement.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("no frame arrived within the reading timeout")]
    ReadTimeout,
    #[error("a frame could not be written within the writing timeout")]
    WriteTimeout,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Violations of the protocol's state machine on a single connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed handshake frame: {0}")]
    BadHandshake(#[source] CodecError),
    #[error("received a RetransmissionFinish for a packet id already finished on this connection")]
    AlreadyReceivedFinish,
    #[error("received Acknowledge with no corresponding unconfirmed packet")]
    UnexpectedAcknowledge,
}

/// Session-wide failures severe enough to escalate to `internalInterrupt`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection id {0} regressed behind the last known connection id {1}")]
    ConnectionIdRegression(u32, u32),
    #[error("MaxConnectionsPerSession ({0}) exceeded")]
    TooManyConnections(u32),
    #[error("MaxOfflinePack ({0}) exceeded while no connection was available to send on")]
    OfflineQueueOverflow(usize),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures scoped to rejecting one incoming stream, without touching the
/// rest of the session — as opposed to `SessionError`, which always
/// escalates to `internalInterrupt`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("MaxConnectionsPerSession ({0}) exceeded")]
    TooManyConnections(u32),
    #[error("MaxActiveConnectionsPerSession ({0}) exceeded")]
    TooManyActiveConnections(u32),
    #[error("connection id {0} already has a live stream")]
    DuplicateConnection(u32),
    #[error(transparent)]
    Session(#[from] SessionError),
}
