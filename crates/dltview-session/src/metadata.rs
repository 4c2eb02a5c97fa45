use std::collections::{BTreeMap, HashMap};

use dltview_wire::{EcuInfo, PluginState, StreamInfo, WireError, parse_plugin_state};

/// Everything the engine reported about the open recording, apart from
/// lifecycles and records.
#[derive(Clone, Debug, Default)]
pub struct SessionMetadata {
    /// Total records in the recording, once the engine announced it.
    pub file_msgs: Option<u32>,
    pub ecus: Vec<EcuInfo>,
    /// Latest state per plugin name.
    pub plugin_states: BTreeMap<String, PluginState>,
    pub stream_infos: HashMap<u32, StreamInfo>,
}

impl SessionMetadata {
    pub fn apply_file_info(&mut self, nr_msgs: u32) {
        self.file_msgs = Some(nr_msgs);
    }

    pub fn apply_eac(&mut self, ecus: Vec<EcuInfo>) {
        self.ecus = ecus;
    }

    /// Stores every parsable plugin state and returns the names that
    /// changed. Malformed entries are returned as errors and skipped.
    pub fn apply_plugin_states(&mut self, raw: Vec<String>) -> (Vec<String>, Vec<WireError>) {
        let mut changed = Vec::new();
        let mut errors = Vec::new();
        for entry in raw {
            match parse_plugin_state(&entry) {
                Ok(state) => {
                    let unchanged = self
                        .plugin_states
                        .get(&state.name)
                        .is_some_and(|prev| prev.json == state.json);
                    if !unchanged {
                        changed.push(state.name.clone());
                        self.plugin_states.insert(state.name.clone(), state);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        (changed, errors)
    }

    pub fn apply_stream_info(&mut self, info: StreamInfo) {
        self.stream_infos.insert(info.stream_id, info);
    }

    /// Share of the recording the engine has scanned for `stream_id`, if known.
    pub fn progress(&self, stream_id: u32) -> Option<f64> {
        let info = self.stream_infos.get(&stream_id)?;
        if info.nr_file_msgs_total == 0 {
            return Some(1.0);
        }
        Some(f64::from(info.nr_file_msgs_processed) / f64::from(info.nr_file_msgs_total))
    }

    pub fn forget_stream(&mut self, stream_id: u32) {
        self.stream_infos.remove(&stream_id);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
