use crate::{LifecycleId, Record};

/// A contiguous operating session of one device within the recording.
///
/// Times are microseconds since the unix epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct Lifecycle {
    pub id: LifecycleId,
    pub ecu: String,
    pub start_time_us: u64,
    /// Set when the lifecycle was resumed (device timestamps restart at resume).
    pub resume_time_us: Option<u64>,
    pub end_time_us: u64,
    pub msg_count: u32,
    pub sw_version: Option<String>,
    /// 1-based position among the lifecycles of the same ECU, by start time.
    pub ordinal: u32,
}

impl Lifecycle {
    /// Folds a newer engine update into this lifecycle.
    ///
    /// Message count and end time only move forward.
    pub fn merge_update(&mut self, update: &Lifecycle) {
        debug_assert_eq!(self.id, update.id);
        self.start_time_us = update.start_time_us;
        self.resume_time_us = update.resume_time_us;
        self.end_time_us = self.end_time_us.max(update.end_time_us);
        self.msg_count = self.msg_count.max(update.msg_count);
        if update.sw_version.is_some() {
            self.sw_version = update.sw_version.clone();
        }
    }

    pub fn base_time_ms(&self) -> i64 {
        (self.resume_time_us.unwrap_or(self.start_time_us) / 1000) as i64
    }

    pub fn end_time_ms(&self) -> i64 {
        (self.end_time_us / 1000) as i64
    }

    /// Wall-clock time of a record within this lifecycle, in ms.
    pub fn record_time_ms(&self, record: &Record) -> i64 {
        self.base_time_ms() + (record.timestamp_dms / 10) as i64
    }
}
