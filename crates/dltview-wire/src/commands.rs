use dltview_types::{EngineFilter, SearchReply, StreamId, StreamReply, Window};
use facet::Facet;

use crate::WireError;

/// Prefix every successful reply starts with.
pub const OK_PREFIX: &str = "ok";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsCommand {
    Stat,
    ReadDirectory,
}

impl FsCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::ReadDirectory => "readDirectory",
        }
    }
}

/// A text request to the engine. Exactly one reply follows each command.
#[derive(Clone, Debug)]
pub enum Command {
    Open {
        sort_by_time: bool,
        files: Vec<String>,
        plugins: Vec<facet_value::Value>,
    },
    Close,
    Stream {
        window: Window,
        filters: Vec<EngineFilter>,
    },
    ChangeWindow {
        id: StreamId,
        window: Window,
    },
    Stop {
        id: StreamId,
    },
    Query {
        window: Window,
        filters: Vec<EngineFilter>,
    },
    BinarySearch {
        id: StreamId,
        time_ms: u64,
    },
    Fs {
        cmd: FsCommand,
        path: String,
    },
}

#[derive(Facet)]
struct OpenParams {
    sort: bool,
    files: Vec<String>,
    plugins: Vec<facet_value::Value>,
}

#[derive(Facet)]
struct StreamParams {
    window: Vec<u32>,
    binary: bool,
    filters: Vec<EngineFilter>,
}

#[derive(Facet)]
struct QueryParams {
    window: Vec<u32>,
    filters: Vec<EngineFilter>,
}

#[derive(Facet)]
struct FsParams {
    cmd: String,
    path: String,
}

fn to_json<'a, T: Facet<'a>>(value: &'a T) -> Result<String, WireError> {
    facet_json::to_string(value).map_err(|e| WireError::Json(e.to_string()))
}

impl Command {
    /// Verb the command starts with, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close => "close",
            Self::Stream { .. } => "stream",
            Self::ChangeWindow { .. } => "stream_change_window",
            Self::Stop { .. } => "stop",
            Self::Query { .. } => "query",
            Self::BinarySearch { .. } => "stream_binary_search",
            Self::Fs { .. } => "fs",
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(match self {
            Self::Open {
                sort_by_time,
                files,
                plugins,
            } => format!(
                "open {}",
                to_json(&OpenParams {
                    sort: *sort_by_time,
                    files: files.clone(),
                    plugins: plugins.clone(),
                })?
            ),
            Self::Close => "close".to_string(),
            Self::Stream { window, filters } => format!(
                "stream {}",
                to_json(&StreamParams {
                    window: window.as_array().to_vec(),
                    binary: true,
                    filters: filters.clone(),
                })?
            ),
            Self::ChangeWindow { id, window } => format!("stream_change_window {id} {window}"),
            Self::Stop { id } => format!("stop {id}"),
            Self::Query { window, filters } => format!(
                "query {}",
                to_json(&QueryParams {
                    window: window.as_array().to_vec(),
                    filters: filters.clone(),
                })?
            ),
            Self::BinarySearch { id, time_ms } => {
                format!("stream_binary_search {id} time_ms={time_ms}")
            }
            Self::Fs { cmd, path } => format!(
                "fs {}",
                to_json(&FsParams {
                    cmd: cmd.as_str().to_string(),
                    path: path.clone(),
                })?
            ),
        })
    }
}

pub fn is_ok_reply(reply: &str) -> bool {
    reply.starts_with(OK_PREFIX)
}

/// JSON text after the first `=` of an `ok` reply.
fn json_body<'r>(command: &'static str, reply: &'r str) -> Result<&'r str, WireError> {
    reply
        .split_once('=')
        .map(|(_, body)| body)
        .filter(|body| !body.is_empty())
        .ok_or_else(|| WireError::UnexpectedReply {
            command,
            reply: reply.to_string(),
        })
}

/// Stream id carried by a `stream`, `query` or `stream_change_window` reply.
pub fn parse_stream_reply(command: &'static str, reply: &str) -> Result<StreamId, WireError> {
    let body = json_body(command, reply)?;
    let parsed: StreamReply =
        facet_json::from_str(body).map_err(|e| WireError::Json(format!("{command} reply: {e}")))?;
    if parsed.id == 0 {
        return Err(WireError::UnexpectedReply {
            command,
            reply: reply.to_string(),
        });
    }
    Ok(StreamId::new(parsed.id))
}

pub fn parse_search_reply(reply: &str) -> Result<Option<u32>, WireError> {
    let body = json_body("stream_binary_search", reply)?;
    let parsed: SearchReply = facet_json::from_str(body)
        .map_err(|e| WireError::Json(format!("stream_binary_search reply: {e}")))?;
    Ok(parsed.filtered_msg_index)
}

pub fn parse_fs_reply(reply: &str) -> Result<facet_value::Value, WireError> {
    let body = reply
        .split_once("fs:")
        .map(|(_, body)| body.trim())
        .ok_or_else(|| WireError::UnexpectedReply {
            command: "fs",
            reply: reply.to_string(),
        })?;
    facet_json::from_str(body).map_err(|e| WireError::Json(format!("fs reply: {e}")))
}
