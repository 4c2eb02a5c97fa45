use dltview_types::{Lifecycle, LifecycleId, MessageClass, Record};
use facet::Facet;

use crate::WireError;

/// Binary frame sent by the engine, tagged by kind.
#[derive(Facet, Clone, Debug)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum BinFrame {
    /// Records for one stream. An empty batch ends the stream.
    DltMsgs(MsgBatch),
    Lifecycles(Vec<WireLifecycle>),
    FileInfo(FileInfo),
    EacInfo(Vec<EcuInfo>),
    /// One JSON object per plugin, each carrying at least a `name`.
    PluginState(Vec<String>),
    StreamInfo(StreamInfo),
}

#[derive(Facet, Clone, Debug)]
pub struct MsgBatch {
    pub stream_id: u32,
    pub msgs: Vec<WireMsg>,
}

impl MsgBatch {
    pub fn is_end_of_stream(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Approximate in-memory size, used to cap buffering.
    pub fn approx_bytes(&self) -> usize {
        self.msgs
            .iter()
            .map(|m| 48 + m.payload.len() + m.ecu.len() + m.apid.len() + m.ctid.len())
            .sum()
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct WireMsg {
    pub index: u32,
    pub reception_time_us: u64,
    pub timestamp_dms: u32,
    /// Zero when the record belongs to no lifecycle.
    pub lifecycle: u32,
    pub ecu: String,
    pub apid: String,
    pub ctid: String,
    pub mstp: u8,
    pub mtin: u8,
    pub verbose: bool,
    pub payload: String,
}

impl From<WireMsg> for Record {
    fn from(msg: WireMsg) -> Self {
        Record {
            index: msg.index,
            reception_time_us: msg.reception_time_us,
            timestamp_dms: msg.timestamp_dms,
            lifecycle: LifecycleId::from_wire(msg.lifecycle),
            ecu: msg.ecu,
            apid: msg.apid,
            ctid: msg.ctid,
            class: MessageClass::from_wire(msg.mstp, msg.mtin),
            verbose: msg.verbose,
            payload: msg.payload,
        }
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct WireLifecycle {
    pub id: u32,
    pub ecu: String,
    pub nr_msgs: u32,
    pub start_time_us: u64,
    #[facet(default)]
    pub resume_time_us: Option<u64>,
    pub end_time_us: u64,
    #[facet(default)]
    pub sw_version: Option<String>,
}

impl WireLifecycle {
    /// Converts to the model type; `None` for the reserved id zero.
    pub fn into_lifecycle(self) -> Option<Lifecycle> {
        let id = LifecycleId::from_wire(self.id)?;
        Some(Lifecycle {
            id,
            ecu: self.ecu,
            start_time_us: self.start_time_us,
            resume_time_us: self.resume_time_us,
            end_time_us: self.end_time_us,
            msg_count: self.nr_msgs,
            sw_version: self.sw_version,
            ordinal: 0,
        })
    }
}

#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub nr_msgs: u32,
}

#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct EcuInfo {
    pub ecu: String,
    #[facet(default)]
    pub name: Option<String>,
    #[facet(default)]
    pub apids: Vec<ApidInfo>,
}

#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct ApidInfo {
    pub apid: String,
    #[facet(default)]
    pub desc: Option<String>,
    #[facet(default)]
    pub ctids: Vec<CtidInfo>,
}

#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct CtidInfo {
    pub ctid: String,
    #[facet(default)]
    pub desc: Option<String>,
}

/// Progress counters for one stream.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: u32,
    pub nr_stream_msgs: u32,
    pub nr_file_msgs_processed: u32,
    pub nr_file_msgs_total: u32,
}

#[derive(Facet)]
struct PluginStateHeader {
    name: String,
}

/// Latest state reported by one engine plugin; the JSON is kept as sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginState {
    pub name: String,
    pub json: String,
}

pub fn parse_plugin_state(raw: &str) -> Result<PluginState, WireError> {
    let header: PluginStateHeader =
        facet_json::from_str(raw).map_err(|e| WireError::Json(format!("plugin state: {e}")))?;
    Ok(PluginState {
        name: header.name,
        json: raw.to_string(),
    })
}
