use std::fmt;

use dltview_types::StreamId;
use dltview_wire::WireError;

/// Failure of one text request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The engine answered with something other than `ok`.
    Rejected {
        command: &'static str,
        detail: String,
    },
    /// The request could not be handed to the transport.
    SendFailed { command: &'static str },
    /// The connection went away before the reply arrived.
    TransportClosed { command: &'static str },
}

impl RpcError {
    pub fn is_no_active_stream(&self) -> bool {
        matches!(self, Self::Rejected { detail, .. } if detail.contains("no active stream"))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { command, detail } => write!(f, "'{command}' rejected: {detail}"),
            Self::SendFailed { command } => write!(f, "failed to send '{command}'"),
            Self::TransportClosed { command } => {
                write!(f, "connection closed while '{command}' was pending")
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Rpc(RpcError),
    Wire(WireError),
    /// A newer transition superseded the operation while its reply was in flight.
    Superseded { operation: &'static str },
    NoActiveStream,
    StreamAborted { stream_id: StreamId, reason: String },
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(err) => write!(f, "{err}"),
            Self::Wire(err) => write!(f, "{err}"),
            Self::Superseded { operation } => {
                write!(f, "'{operation}' was superseded by a newer request")
            }
            Self::NoActiveStream => f.write_str("no active stream"),
            Self::StreamAborted { stream_id, reason } => {
                write!(f, "stream {stream_id} aborted: {reason}")
            }
            Self::Closed => f.write_str("session is closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RpcError> for SessionError {
    fn from(value: RpcError) -> Self {
        Self::Rpc(value)
    }
}

impl From<WireError> for SessionError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}
