use std::collections::{BTreeSet, HashMap};

use dltview_types::{Record, StreamId};
use dltview_wire::{MsgBatch, StreamInfo};
use tracing::{debug, warn};

use crate::LifecycleTable;

/// What a sink can see while being fed.
pub struct SinkContext<'a> {
    pub stream_id: StreamId,
    pub lifecycles: &'a LifecycleTable,
}

/// Receives incremental results of one stream.
pub trait StreamSink: Send {
    /// `records` is the stream's buffer; its last `added` entries are new.
    ///
    /// A sink may truncate the buffer once it no longer needs older records.
    fn on_new_records(&mut self, ctx: &SinkContext<'_>, records: &mut Vec<Record>, added: usize);

    /// The engine signalled end-of-stream. The entry is removed afterwards
    /// unless [`StreamSink::retain_after_done`] asks to keep its records.
    fn on_done(&mut self, _ctx: &SinkContext<'_>, _records: &mut Vec<Record>) {}

    /// Keep the record buffer readable (and the stream re-windowable) after
    /// end-of-stream. Later frames for the id are still dropped.
    fn retain_after_done(&self) -> bool {
        false
    }

    fn on_stream_info(&mut self, _info: &StreamInfo) {}
}

/// How many retired ids are remembered; older ones are forgotten first.
pub const RETIRED_IDS_CAP: usize = 1024;

/// Caps on frames buffered for a stream id nobody registered yet.
#[derive(Clone, Copy, Debug)]
pub struct EarlyDataLimits {
    pub warn_batches: usize,
    pub max_batches: usize,
    pub max_bytes: usize,
}

struct StreamState {
    records: Vec<Record>,
    sink: Box<dyn StreamSink>,
}

impl StreamState {
    /// Decodes and appends one batch. Returns `true` once the stream ended.
    fn deliver(&mut self, ctx: &SinkContext<'_>, batch: MsgBatch) -> bool {
        if batch.is_end_of_stream() {
            self.sink.on_done(ctx, &mut self.records);
            return true;
        }
        let added = batch.msgs.len();
        self.records.reserve(added);
        for msg in batch.msgs {
            self.records.push(Record::from(msg));
        }
        self.sink.on_new_records(ctx, &mut self.records, added);
        false
    }
}

enum StreamSlot {
    Buffering { batches: Vec<MsgBatch>, bytes: usize },
    Registered(StreamState),
    /// Ended, records kept for reading and re-windowing.
    Completed(StreamState),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { added: usize },
    Completed,
    Buffered { batches: usize },
    /// Frames for an id that was retired by a re-window or stop.
    Dropped,
    Aborted { reason: String },
}

/// Routes record batches to the sink registered for their stream id.
pub struct StreamRegistry {
    slots: HashMap<StreamId, StreamSlot>,
    retired: BTreeSet<StreamId>,
    limits: EarlyDataLimits,
}

impl StreamRegistry {
    pub fn new(limits: EarlyDataLimits) -> Self {
        Self {
            slots: HashMap::new(),
            retired: BTreeSet::new(),
            limits,
        }
    }

    pub fn dispatch(&mut self, batch: MsgBatch, lifecycles: &LifecycleTable) -> DispatchOutcome {
        let id = StreamId::new(batch.stream_id);
        if self.retired.contains(&id) {
            debug!(stream_id = %id, msgs = batch.msgs.len(), "dropping frames for retired stream");
            return DispatchOutcome::Dropped;
        }
        let ctx = SinkContext {
            stream_id: id,
            lifecycles,
        };
        match self.slots.get_mut(&id) {
            Some(StreamSlot::Registered(state)) => {
                let added = batch.msgs.len();
                if !state.deliver(&ctx, batch) {
                    return DispatchOutcome::Delivered { added };
                }
                self.complete(id);
                DispatchOutcome::Completed
            }
            Some(StreamSlot::Completed(_)) => {
                debug!(stream_id = %id, msgs = batch.msgs.len(), "dropping frames for completed stream");
                DispatchOutcome::Dropped
            }
            Some(StreamSlot::Buffering { batches, bytes }) => {
                *bytes += batch.approx_bytes();
                batches.push(batch);
                let (count, total_bytes) = (batches.len(), *bytes);
                self.check_early_data(id, count, total_bytes)
            }
            None => {
                let bytes = batch.approx_bytes();
                self.slots.insert(
                    id,
                    StreamSlot::Buffering {
                        batches: vec![batch],
                        bytes,
                    },
                );
                self.check_early_data(id, 1, bytes)
            }
        }
    }

    /// Retires an ended stream, keeping its state if the sink asks for it.
    fn complete(&mut self, id: StreamId) {
        if let Some(StreamSlot::Registered(state)) = self.slots.remove(&id)
            && state.sink.retain_after_done()
        {
            self.slots.insert(id, StreamSlot::Completed(state));
        }
        self.retire(id);
    }

    fn retire(&mut self, id: StreamId) {
        self.retired.insert(id);
        while self.retired.len() > RETIRED_IDS_CAP {
            self.retired.pop_first();
        }
    }

    fn check_early_data(&mut self, id: StreamId, batches: usize, bytes: usize) -> DispatchOutcome {
        if batches > self.limits.max_batches || bytes > self.limits.max_bytes {
            let reason = format!(
                "{batches} batches ({bytes} bytes) arrived before the stream was registered"
            );
            warn!(stream_id = %id, batches, bytes, "aborting unregistered stream");
            self.slots.remove(&id);
            self.retire(id);
            return DispatchOutcome::Aborted { reason };
        }
        if batches > self.limits.warn_batches {
            warn!(stream_id = %id, batches, bytes, "frames keep arriving for unregistered stream");
        }
        DispatchOutcome::Buffered { batches }
    }

    /// Attaches a sink to `id` and replays anything buffered for it.
    ///
    /// Returns `false` if `id` is already registered or retired; the sink is
    /// dropped in that case.
    pub fn register(
        &mut self,
        id: StreamId,
        sink: Box<dyn StreamSink>,
        lifecycles: &LifecycleTable,
    ) -> bool {
        if self.retired.contains(&id) {
            warn!(stream_id = %id, "refusing to register a retired stream id");
            return false;
        }
        let buffered = match self.slots.remove(&id) {
            Some(slot @ (StreamSlot::Registered(_) | StreamSlot::Completed(_))) => {
                warn!(stream_id = %id, "stream id registered twice, keeping the first sink");
                self.slots.insert(id, slot);
                return false;
            }
            Some(StreamSlot::Buffering { batches, .. }) => batches,
            None => Vec::new(),
        };
        let state = StreamState {
            records: Vec::new(),
            sink,
        };
        self.install(id, state, buffered, lifecycles);
        true
    }

    /// Moves the stream state of `old` to `new` after a re-window.
    ///
    /// The record buffer is cleared since indices shift with the window;
    /// frames that already arrived for `new` are replayed in arrival order.
    /// `old` is retired. A completed `old` is re-windowed like a live one.
    pub fn rekey(&mut self, old: StreamId, new: StreamId, lifecycles: &LifecycleTable) -> bool {
        let mut state = match self.slots.remove(&old) {
            Some(StreamSlot::Registered(state) | StreamSlot::Completed(state)) => state,
            _ => {
                warn!(old = %old, new = %new, "re-window for a stream that is not registered");
                self.retire(old);
                return false;
            }
        };
        self.retire(old);
        if self.retired.contains(&new) {
            warn!(old = %old, new = %new, "re-window target was already retired");
            return false;
        }
        let buffered = match self.slots.remove(&new) {
            Some(StreamSlot::Buffering { batches, .. }) => batches,
            Some(StreamSlot::Registered(other) | StreamSlot::Completed(other)) => {
                warn!(stream_id = %new, "re-window target already registered, replacing");
                drop(other);
                Vec::new()
            }
            None => Vec::new(),
        };
        state.records.clear();
        self.install(new, state, buffered, lifecycles);
        true
    }

    fn install(
        &mut self,
        id: StreamId,
        mut state: StreamState,
        buffered: Vec<MsgBatch>,
        lifecycles: &LifecycleTable,
    ) {
        let ctx = SinkContext {
            stream_id: id,
            lifecycles,
        };
        if !buffered.is_empty() {
            debug!(stream_id = %id, batches = buffered.len(), "replaying early frames");
        }
        for batch in buffered {
            if state.deliver(&ctx, batch) {
                if state.sink.retain_after_done() {
                    self.slots.insert(id, StreamSlot::Completed(state));
                }
                self.retire(id);
                return;
            }
        }
        self.slots.insert(id, StreamSlot::Registered(state));
    }

    /// Removes `id` (registered or buffering) and retires it.
    pub fn unregister(&mut self, id: StreamId) -> bool {
        self.retire(id);
        self.slots.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: StreamId) -> bool {
        matches!(self.slots.get(&id), Some(StreamSlot::Registered(_)))
    }

    pub fn is_completed(&self, id: StreamId) -> bool {
        matches!(self.slots.get(&id), Some(StreamSlot::Completed(_)))
    }

    pub fn is_retired(&self, id: StreamId) -> bool {
        self.retired.contains(&id)
    }

    pub fn buffered_batches(&self, id: StreamId) -> usize {
        match self.slots.get(&id) {
            Some(StreamSlot::Buffering { batches, .. }) => batches.len(),
            _ => 0,
        }
    }

    pub fn record_count(&self, id: StreamId) -> Option<usize> {
        match self.slots.get(&id) {
            Some(StreamSlot::Registered(state) | StreamSlot::Completed(state)) => {
                Some(state.records.len())
            }
            _ => None,
        }
    }

    pub fn with_records<R>(&self, id: StreamId, f: impl FnOnce(&[Record]) -> R) -> Option<R> {
        match self.slots.get(&id) {
            Some(StreamSlot::Registered(state) | StreamSlot::Completed(state)) => {
                Some(f(&state.records))
            }
            _ => None,
        }
    }

    pub fn stream_info(&mut self, info: &StreamInfo) {
        if info.stream_id == 0 {
            return;
        }
        if let Some(StreamSlot::Registered(state)) = self.slots.get_mut(&StreamId::new(info.stream_id))
        {
            state.sink.on_stream_info(info);
        }
    }

    /// Drops every stream. Used when the session is closed or reopened.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dltview_wire::WireMsg;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        indices: Vec<u32>,
        notifications: Vec<usize>,
        done: bool,
        infos: usize,
        retain: bool,
    }

    struct RecordingSink(Arc<Mutex<Seen>>);

    impl StreamSink for RecordingSink {
        fn on_new_records(&mut self, _: &SinkContext<'_>, records: &mut Vec<Record>, added: usize) {
            let mut seen = self.0.lock().unwrap();
            seen.indices = records.iter().map(|r| r.index).collect();
            seen.notifications.push(added);
        }

        fn on_done(&mut self, _: &SinkContext<'_>, _: &mut Vec<Record>) {
            self.0.lock().unwrap().done = true;
        }

        fn on_stream_info(&mut self, _: &StreamInfo) {
            self.0.lock().unwrap().infos += 1;
        }

        fn retain_after_done(&self) -> bool {
            self.0.lock().unwrap().retain
        }
    }

    fn limits() -> EarlyDataLimits {
        EarlyDataLimits {
            warn_batches: 2,
            max_batches: 4,
            max_bytes: 1024 * 1024,
        }
    }

    fn msg(index: u32) -> WireMsg {
        WireMsg {
            index,
            reception_time_us: 0,
            timestamp_dms: 0,
            lifecycle: 1,
            ecu: "ECU1".into(),
            apid: "APP".into(),
            ctid: "CTX".into(),
            mstp: 0,
            mtin: 4,
            verbose: true,
            payload: format!("msg {index}"),
        }
    }

    fn batch(stream_id: u32, indices: &[u32]) -> MsgBatch {
        MsgBatch {
            stream_id,
            msgs: indices.iter().copied().map(msg).collect(),
        }
    }

    fn sink() -> (Box<dyn StreamSink>, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        (Box::new(RecordingSink(seen.clone())), seen)
    }

    #[test]
    fn live_frames_reach_the_sink() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        assert!(registry.register(StreamId::new(1), sink, &lifecycles));

        assert_eq!(
            registry.dispatch(batch(1, &[10, 11]), &lifecycles),
            DispatchOutcome::Delivered { added: 2 }
        );
        registry.dispatch(batch(1, &[12]), &lifecycles);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.indices, vec![10, 11, 12]);
        assert_eq!(seen.notifications, vec![2, 1]);
    }

    #[test]
    fn early_frames_replay_in_arrival_order() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        registry.dispatch(batch(5, &[1, 2]), &lifecycles);
        registry.dispatch(batch(5, &[3]), &lifecycles);
        assert_eq!(registry.buffered_batches(StreamId::new(5)), 2);

        let (sink, seen) = sink();
        registry.register(StreamId::new(5), sink, &lifecycles);
        registry.dispatch(batch(5, &[4]), &lifecycles);
        assert_eq!(seen.lock().unwrap().indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn buffered_end_of_stream_completes_on_register() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        registry.dispatch(batch(9, &[1]), &lifecycles);
        registry.dispatch(batch(9, &[]), &lifecycles);

        let (sink, seen) = sink();
        registry.register(StreamId::new(9), sink, &lifecycles);
        assert!(seen.lock().unwrap().done);
        assert!(!registry.is_registered(StreamId::new(9)));
        assert_eq!(
            registry.dispatch(batch(9, &[2]), &lifecycles),
            DispatchOutcome::Dropped
        );
    }

    #[test]
    fn empty_batch_completes_and_removes() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        registry.register(StreamId::new(2), sink, &lifecycles);
        assert_eq!(
            registry.dispatch(batch(2, &[]), &lifecycles),
            DispatchOutcome::Completed
        );
        assert!(seen.lock().unwrap().done);
        assert_eq!(registry.record_count(StreamId::new(2)), None);
    }

    #[test]
    fn completed_stream_keeps_records_when_asked() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        seen.lock().unwrap().retain = true;
        registry.register(StreamId::new(1), sink, &lifecycles);
        registry.dispatch(batch(1, &[0, 1, 2]), &lifecycles);
        assert_eq!(
            registry.dispatch(batch(1, &[]), &lifecycles),
            DispatchOutcome::Completed
        );
        assert!(seen.lock().unwrap().done);
        assert!(registry.is_completed(StreamId::new(1)));
        assert_eq!(registry.record_count(StreamId::new(1)), Some(3));
        assert_eq!(
            registry.dispatch(batch(1, &[3]), &lifecycles),
            DispatchOutcome::Dropped
        );
        assert_eq!(
            registry.with_records(StreamId::new(1), |r| r.len()),
            Some(3)
        );

        registry.dispatch(batch(2, &[10]), &lifecycles);
        assert!(registry.rekey(StreamId::new(1), StreamId::new(2), &lifecycles));
        assert!(registry.is_registered(StreamId::new(2)));
        assert_eq!(registry.record_count(StreamId::new(1)), None);
        assert_eq!(seen.lock().unwrap().indices, vec![10]);
    }

    #[test]
    fn retired_ids_are_bounded() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let total = RETIRED_IDS_CAP as u32 + 10;
        for id in 1..=total {
            registry.unregister(StreamId::new(id));
        }
        assert_eq!(registry.retired.len(), RETIRED_IDS_CAP);
        assert!(registry.is_retired(StreamId::new(total)));
        assert!(!registry.is_retired(StreamId::new(1)));
        assert_eq!(
            registry.dispatch(batch(total, &[1]), &lifecycles),
            DispatchOutcome::Dropped
        );
    }

    #[test]
    fn rekey_keeps_sink_and_replays_new_id_once() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        registry.register(StreamId::new(1), sink, &lifecycles);
        registry.dispatch(batch(1, &[0, 1, 2]), &lifecycles);

        // frames for the replacement id race ahead of the reply
        registry.dispatch(batch(2, &[100, 101]), &lifecycles);
        registry.dispatch(batch(2, &[102]), &lifecycles);
        assert!(registry.rekey(StreamId::new(1), StreamId::new(2), &lifecycles));

        registry.dispatch(batch(2, &[103]), &lifecycles);
        registry.dispatch(batch(1, &[3]), &lifecycles);
        assert_eq!(seen.lock().unwrap().indices, vec![100, 101, 102, 103]);
        assert_eq!(registry.record_count(StreamId::new(2)), Some(4));
        assert!(registry.is_retired(StreamId::new(1)));
    }

    #[test]
    fn repeated_rekeys_never_lose_or_duplicate() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        registry.register(StreamId::new(1), sink, &lifecycles);
        for next in 2..6u32 {
            let base = next * 100;
            registry.dispatch(batch(next, &[base, base + 1]), &lifecycles);
            registry.rekey(StreamId::new(next - 1), StreamId::new(next), &lifecycles);
            registry.dispatch(batch(next, &[base + 2]), &lifecycles);
            let expected = vec![base, base + 1, base + 2];
            assert_eq!(seen.lock().unwrap().indices, expected);
        }
    }

    #[test]
    fn unregistered_stream_is_aborted_past_the_cap() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        for n in 0..4 {
            assert_eq!(
                registry.dispatch(batch(7, &[n]), &lifecycles),
                DispatchOutcome::Buffered {
                    batches: n as usize + 1
                }
            );
        }
        assert!(matches!(
            registry.dispatch(batch(7, &[4]), &lifecycles),
            DispatchOutcome::Aborted { .. }
        ));
        let (sink, _) = sink();
        assert!(!registry.register(StreamId::new(7), sink, &lifecycles));
    }

    #[test]
    fn stream_info_reaches_registered_sink() {
        let lifecycles = LifecycleTable::new();
        let mut registry = StreamRegistry::new(limits());
        let (sink, seen) = sink();
        registry.register(StreamId::new(3), sink, &lifecycles);
        registry.stream_info(&StreamInfo {
            stream_id: 3,
            nr_stream_msgs: 1,
            nr_file_msgs_processed: 1,
            nr_file_msgs_total: 2,
        });
        assert_eq!(seen.lock().unwrap().infos, 1);
    }
}
