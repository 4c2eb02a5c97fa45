use std::fmt;

use dltview_types::{StreamId, Window};
use dltview_wire::{EngineVersion, StreamInfo, VersionRange};

/// State of the connection to the engine, as seen by a status observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected {
        engine_version: Option<EngineVersion>,
    },
    /// The engine is reachable but outside the supported version range.
    /// Requests still go through; a frontend should refuse to proceed.
    VersionMismatch {
        actual: EngineVersion,
        required: VersionRange,
    },
    Failed(String),
    Closed,
}

impl ConnectionStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::VersionMismatch { .. })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Connected {
                engine_version: Some(version),
            } => write!(f, "connected to engine {version}"),
            Self::Connected {
                engine_version: None,
            } => f.write_str("connected"),
            Self::VersionMismatch { actual, required } => {
                write!(f, "engine {actual} is not supported (need {required})")
            }
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Notifications published by a session while frames are processed.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// New records landed in the visible page of the primary stream.
    RecordsAdded {
        stream_id: StreamId,
        added: usize,
        visible: usize,
    },
    /// The engine finished delivering a stream.
    StreamDone { stream_id: StreamId },
    /// The primary stream now covers `window` under a fresh id; the visible
    /// page was cleared.
    WindowChanged { stream_id: StreamId, window: Window },
    /// No record arrived shortly after the stream started.
    EmptyResult { stream_id: StreamId },
    Progress(StreamInfo),
    LifecyclesUpdated { total: usize, added: usize },
    FileInfo { nr_msgs: u32 },
    EacInfo { ecus: usize },
    PluginState { name: String },
    StreamAborted { stream_id: StreamId, reason: String },
    /// A recoverable problem, already logged.
    Warning(String),
}
