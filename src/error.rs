//! Error types for portrpc.

use thiserror::Error;

/// Main error type for all portrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on a byte-stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Protocol violation (malformed frame, oversized frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The message identifier carries a kind this side cannot handle.
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// The transport closed before the operation completed.
    #[error("RPC transport closed")]
    ConnectionClosed,

    /// The transport closed while a stream chunk was waiting for its ack.
    #[error("Transport closed while waiting ack")]
    AckInterrupted,

    /// The peer answered with a `RemoteErrorResponse`.
    #[error("RemoteError: {message}")]
    Remote {
        /// Host-defined classification, 0 when unused.
        code: u32,
        /// Message produced by the failing procedure.
        message: String,
    },

    /// A listener is already registered for this message number.
    #[error("There is already a listener for message number {0}")]
    DuplicateListener(u32),

    /// No listener is registered for this message number.
    #[error("No listener registered for message number {0}")]
    MissingListener(u32),

    /// A module with this name was already registered on the port.
    #[error("module {0} is already registered for this port")]
    DuplicateModule(String),

    /// The module cannot be served by (or was refused by) the port.
    #[error("Module {module} not available for port {port}: {reason}")]
    ModuleNotAvailable {
        /// Requested module name.
        module: String,
        /// Port name.
        port: String,
        /// Underlying reason.
        reason: String,
    },

    /// The procedure table has no entry for this id.
    #[error("procedureId missing: {0}")]
    ProcedureMissing(u32),

    /// The loaded module has no procedure with this name.
    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    /// The port was already destroyed.
    #[error("Port {0} is closed")]
    PortClosed(u32),

    /// A unary procedure produced no value.
    #[error("Empty or null responses are not allowed")]
    EmptyResponse,

    /// Error raised by a user procedure.
    #[error("{0}")]
    Procedure(String),
}

impl RpcError {
    /// Convenience constructor for procedure implementations.
    pub fn procedure(message: impl Into<String>) -> Self {
        RpcError::Procedure(message.into())
    }

    /// Whether this error means the transport is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed | RpcError::AckInterrupted)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
