use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dltview_session::{LifecycleTable, Session, SessionError, SinkContext, StreamSink};
use dltview_types::{
    CompiledFilter, EngineFilter, Filter, FilterKind, Lifecycle, Record, StreamId, Window,
};
use parking_lot::Mutex;
use regex::Captures;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    ConversionRegistry, DataSet, LateValue, PointRef, PointValue, ReportValue, SeriesKind,
    is_integer_series, resolve_series_config, series_kind,
};

/// Window of a report stream: everything the engine has.
pub const REPORT_WINDOW: Window = Window {
    start: 0,
    end: 1_000_000,
};

struct TrackedSet {
    key: Vec<Filter>,
    filters: Vec<CompiledFilter>,
}

struct PendingLate {
    set: usize,
    series: String,
    at: PointRef,
    value: Arc<dyn LateValue>,
}

#[derive(Default)]
struct Warnings {
    list: Vec<String>,
    seen: HashSet<String>,
}

impl Warnings {
    fn push(&mut self, message: String) {
        if self.seen.insert(message.clone()) {
            warn!(%message, "report warning");
            self.list.push(message);
        }
    }
}

#[derive(Default)]
struct ReportData {
    sets: Vec<TrackedSet>,
    datasets: BTreeMap<String, DataSet>,
    late: Vec<PendingLate>,
    warnings: Warnings,
    records_processed: usize,
    finished_streams: usize,
}

impl ReportData {
    fn process_record(
        &mut self,
        set: usize,
        record: &Record,
        lifecycles: &LifecycleTable,
        conversions: &ConversionRegistry,
    ) {
        let Some(lifecycle) = lifecycles.of_record(record) else {
            return;
        };
        let time_ms = lifecycle.record_time_ms(record);
        let Self {
            sets,
            datasets,
            late,
            warnings,
            ..
        } = self;
        let filters = &sets[set].filters;
        for (filter_idx, filter) in filters.iter().enumerate() {
            if !filter.matches(record) {
                continue;
            }
            let Some(caps) = filter.captures(&record.payload) else {
                continue;
            };
            let anonymous = || format!("values_{}_{}", set + 1, filter_idx + 1);
            let conversion = filter
                .filter()
                .report
                .as_ref()
                .and_then(|r| r.conversion.as_deref());
            let values = match conversion {
                Some(name) => match conversions.get(name) {
                    Some(convert) => match convert(&caps) {
                        Ok(values) => values,
                        Err(e) => {
                            warnings.push(format!("conversion '{name}' failed: {e}"));
                            continue;
                        }
                    },
                    None => {
                        warnings.push(format!("unknown conversion '{name}'"));
                        raw_values(filter, &caps, anonymous)
                    }
                },
                None => raw_values(filter, &caps, anonymous),
            };
            for (name, value) in values {
                let dataset = match datasets.entry(name.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let config =
                            resolve_series_config(&name, filters, &mut |w| warnings.push(w));
                        let mut dataset = DataSet::new(name.clone(), series_kind(&name));
                        dataset.value_map = config.value_map;
                        dataset.axis = config.axis;
                        dataset.group = config.group;
                        entry.insert(dataset)
                    }
                };
                if let Some((at, value)) = insert(dataset, value, lifecycle, time_ms) {
                    late.push(PendingLate {
                        set,
                        series: name,
                        at,
                        value,
                    });
                }
            }
        }
    }

    /// Re-evaluates late values once per update.
    fn resolve_late(&mut self) {
        let Self { datasets, late, .. } = self;
        late.retain(|pending| {
            let Some(dataset) = datasets.get_mut(&pending.series) else {
                return false;
            };
            dataset.set_value(pending.at, pending.value.value());
            !pending.value.is_settled()
        });
    }

    /// Stops re-evaluating the late values of a filter set whose stream
    /// ended; they keep their last value.
    fn settle_late(&mut self, set: usize) {
        self.resolve_late();
        self.late.retain(|pending| pending.set != set);
    }

    fn refresh_tails(&mut self, lifecycles: &LifecycleTable) {
        for dataset in self.datasets.values_mut() {
            dataset.refresh_tails(|id| lifecycles.get(id).map(Lifecycle::end_time_ms));
        }
    }
}

/// Named captures of `filter`, or its last unnamed capture if the regex
/// has no named groups.
fn raw_values(
    filter: &CompiledFilter,
    caps: &Captures<'_>,
    anonymous: impl FnOnce() -> String,
) -> Vec<(String, ReportValue)> {
    let Some(regex) = filter.regex() else {
        return Vec::new();
    };
    let named: Vec<&str> = regex.capture_names().flatten().collect();
    if named.is_empty() {
        if caps.len() < 2 {
            return Vec::new();
        }
        return caps
            .get(caps.len() - 1)
            .map(|m| vec![(anonymous(), ReportValue::Text(m.as_str().to_string()))])
            .unwrap_or_default();
    }
    named
        .into_iter()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), ReportValue::Text(m.as_str().to_string())))
        })
        .collect()
}

fn parse_number(series: &str, raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if is_integer_series(series) {
        raw.parse::<i64>().ok().map(|n| n as f64)
    } else {
        raw.parse::<f64>().ok()
    }
}

/// Adds one value to `dataset`. Returns the point and late value if the
/// point has to be re-evaluated later.
fn insert(
    dataset: &mut DataSet,
    value: ReportValue,
    lifecycle: &Lifecycle,
    time_ms: i64,
) -> Option<(PointRef, Arc<dyn LateValue>)> {
    let end_ms = lifecycle.end_time_ms();
    let text = |value: &ReportValue| match value {
        ReportValue::Number(n) => n.to_string(),
        ReportValue::Text(t) => t.clone(),
        ReportValue::Late(late) => late.value().to_string(),
    };

    match dataset.kind {
        SeriesKind::State => {
            let label = dataset.label_for(&text(&value));
            dataset.push_state(time_ms, label, lifecycle.id, end_ms);
            None
        }
        SeriesKind::Timeline => {
            let label = dataset.label_for(&text(&value));
            dataset.push_sample(time_ms, PointValue::Text(label), lifecycle.id, end_ms);
            None
        }
        SeriesKind::Numeric => {
            let (point, late) = match value {
                ReportValue::Number(n) => (PointValue::Number(n), None),
                ReportValue::Text(raw) => match parse_number(&dataset.name, &raw) {
                    Some(n) => (PointValue::Number(n), None),
                    None => {
                        debug!(series = %dataset.name, %raw, "skipping non-numeric value");
                        return None;
                    }
                },
                ReportValue::Late(late) => (late.value(), Some(late)),
            };
            let at = dataset.push_sample(time_ms, point, lifecycle.id, end_ms);
            late.map(|late| (at, late))
        }
    }
}

/// Builds time series from regex captures of report streams.
///
/// Cheap to clone; clones share the same datasets.
#[derive(Clone)]
pub struct ReportAggregator {
    data: Arc<Mutex<ReportData>>,
    conversions: Arc<ConversionRegistry>,
    revision: Arc<watch::Sender<u64>>,
}

impl ReportAggregator {
    pub fn new(conversions: ConversionRegistry) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            data: Arc::new(Mutex::new(ReportData::default())),
            conversions: Arc::new(conversions),
            revision: Arc::new(revision),
        }
    }

    /// Tracks a filter set and returns the sink feeding it, or `None` if an
    /// identical set is already tracked.
    ///
    /// Filters whose regex does not compile are reported as warnings and
    /// left out.
    pub fn add_series(&self, filters: Vec<Filter>) -> Option<ReportSink> {
        let mut data = self.data.lock();
        if data.sets.iter().any(|set| set.key == filters) {
            debug!(filters = filters.len(), "filter set already tracked");
            return None;
        }
        let mut compiled = Vec::with_capacity(filters.len());
        for filter in filters.iter().filter(|f| f.enabled) {
            match CompiledFilter::new(filter.clone()) {
                Ok(filter) => compiled.push(filter),
                Err(e) => data.warnings.push(e.to_string()),
            }
        }
        let set = data.sets.len();
        data.sets.push(TrackedSet {
            key: filters,
            filters: compiled,
        });
        Some(ReportSink {
            set,
            data: self.data.clone(),
            conversions: self.conversions.clone(),
            revision: self.revision.clone(),
            processed: 0,
            pruned: 0,
        })
    }

    /// Tracks `filters` and starts a report stream for them on `session`.
    pub async fn attach(
        &self,
        session: &Session,
        filters: Vec<Filter>,
    ) -> Result<Option<StreamId>, SessionError> {
        let engine = report_engine_filters(&filters);
        let Some(sink) = self.add_series(filters) else {
            return Ok(None);
        };
        session
            .attach_stream(REPORT_WINDOW, engine, Box::new(sink))
            .await
            .map(Some)
    }

    pub fn tracked_sets(&self) -> usize {
        self.data.lock().sets.len()
    }

    pub fn dataset_count(&self) -> usize {
        self.data.lock().datasets.len()
    }

    pub fn dataset(&self, name: &str) -> Option<DataSet> {
        self.data.lock().datasets.get(name).cloned()
    }

    pub fn datasets(&self) -> Vec<DataSet> {
        self.data.lock().datasets.values().cloned().collect()
    }

    /// De-duplicated problems met so far, in the order they first occurred.
    pub fn warnings(&self) -> Vec<String> {
        self.data.lock().warnings.list.clone()
    }

    pub fn records_processed(&self) -> usize {
        self.data.lock().records_processed
    }

    pub fn finished_streams(&self) -> usize {
        self.data.lock().finished_streams
    }

    /// Changes after every processed update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Report filters as sent to the engine: every enabled one selects records.
pub fn report_engine_filters(filters: &[Filter]) -> Vec<EngineFilter> {
    filters
        .iter()
        .filter(|f| f.enabled)
        .map(|f| EngineFilter {
            kind: FilterKind::Positive.engine_code(),
            ..f.to_engine()
        })
        .collect()
}

/// Feeds one tracked filter set from a stream.
///
/// The record buffer is emptied after every update; `processed - pruned`
/// is the buffer index of the next record not yet looked at.
pub struct ReportSink {
    set: usize,
    data: Arc<Mutex<ReportData>>,
    conversions: Arc<ConversionRegistry>,
    revision: Arc<watch::Sender<u64>>,
    processed: usize,
    pruned: usize,
}

impl ReportSink {
    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn pruned(&self) -> usize {
        self.pruned
    }
}

impl StreamSink for ReportSink {
    fn on_new_records(&mut self, ctx: &SinkContext<'_>, records: &mut Vec<Record>, _added: usize) {
        let next = self.processed - self.pruned;
        assert!(
            next <= records.len(),
            "invariant violated: next unprocessed record {next} beyond buffer of {}",
            records.len()
        );
        let fresh = records.len() - next;
        {
            let mut data = self.data.lock();
            for record in &records[next..] {
                data.process_record(self.set, record, ctx.lifecycles, &self.conversions);
            }
            data.records_processed += fresh;
            data.resolve_late();
            data.refresh_tails(ctx.lifecycles);
        }
        self.processed += fresh;
        self.pruned += records.len();
        records.clear();
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn on_done(&mut self, ctx: &SinkContext<'_>, _records: &mut Vec<Record>) {
        debug!(stream_id = %ctx.stream_id, processed = self.processed, "report stream done");
        {
            let mut data = self.data.lock();
            data.settle_late(self.set);
            data.finished_streams += 1;
        }
        self.revision.send_modify(|rev| *rev += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{PointKind, PointValue};
    use dltview_types::{LifecycleId, LogLevel, MessageClass};

    fn table() -> LifecycleTable {
        let mut table = LifecycleTable::new();
        table.apply([Lifecycle {
            id: LifecycleId::new(1),
            ecu: "ECU1".into(),
            start_time_us: 1_000_000,
            resume_time_us: None,
            end_time_us: 9_000_000,
            msg_count: 100,
            sw_version: None,
            ordinal: 0,
        }]);
        table
    }

    fn record(index: u32, timestamp_dms: u32, lifecycle: Option<u32>, payload: &str) -> Record {
        Record {
            index,
            reception_time_us: 0,
            timestamp_dms,
            lifecycle: lifecycle.map(LifecycleId::new),
            ecu: "ECU1".into(),
            apid: "APP".into(),
            ctid: "CTX".into(),
            class: MessageClass::Log(LogLevel::Info),
            verbose: true,
            payload: payload.into(),
        }
    }

    fn feed(sink: &mut ReportSink, table: &LifecycleTable, mut records: Vec<Record>) {
        let ctx = SinkContext {
            stream_id: StreamId::new(1),
            lifecycles: table,
        };
        let added = records.len();
        sink.on_new_records(&ctx, &mut records, added);
        assert!(records.is_empty());
    }

    #[test]
    fn identical_filter_set_is_tracked_once() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let filters = vec![Filter::report(r"temp=(?<temp>[\d.]+)")];
        assert!(aggregator.add_series(filters.clone()).is_some());
        let before = aggregator.dataset_count();
        assert!(aggregator.add_series(filters).is_none());
        assert_eq!(aggregator.dataset_count(), before);
        assert_eq!(aggregator.tracked_sets(), 1);
    }

    #[test]
    fn record_without_lifecycle_is_skipped() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"temp=(?<temp>[\d.]+)")])
            .unwrap();
        feed(&mut sink, &table(), vec![record(0, 0, None, "temp=20")]);
        assert_eq!(aggregator.dataset_count(), 0);
        assert_eq!(aggregator.records_processed(), 1);
    }

    #[test]
    fn numeric_series_uses_lifecycle_time_base() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"temp=(?<temp>[\d.]+)")])
            .unwrap();
        let table = table();
        feed(
            &mut sink,
            &table,
            vec![
                record(0, 5_000, Some(1), "temp=20.5"),
                record(1, 6_000, Some(1), "pressure=3"),
            ],
        );
        feed(&mut sink, &table, vec![record(2, 7_000, Some(1), "temp=22")]);
        assert_eq!((sink.processed(), sink.pruned()), (3, 3));

        let temp = aggregator.dataset("temp").unwrap();
        let times: Vec<(i64, PointKind)> =
            temp.points().iter().map(|p| (p.time_ms, p.kind)).collect();
        assert_eq!(
            times,
            vec![
                (1_500, PointKind::Normal),
                (1_700, PointKind::Normal),
                (9_000, PointKind::LifecycleEnd)
            ]
        );
        assert_eq!((temp.min, temp.max), (Some(20.5), Some(22.0)));
    }

    #[test]
    fn repeated_state_keeps_one_lifecycle_end() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"mode=(?<STATE_mode>\w+)")])
            .unwrap();
        let table = table();
        feed(&mut sink, &table, vec![record(0, 100, Some(1), "mode=on")]);
        let before = aggregator.dataset("STATE_mode").unwrap();
        feed(&mut sink, &table, vec![record(1, 200, Some(1), "mode=on")]);
        let after = aggregator.dataset("STATE_mode").unwrap();
        assert_eq!(after.point_count(), before.point_count() + 1);
        assert_eq!(
            after.lifecycle_end_count(LifecycleId::new(1)),
            before.lifecycle_end_count(LifecycleId::new(1))
        );
    }

    #[test]
    fn unnamed_capture_becomes_anonymous_series() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"(rpm|speed) (\d+)")])
            .unwrap();
        feed(&mut sink, &table(), vec![record(0, 0, Some(1), "speed 80")]);
        let set = aggregator.dataset("values_1_1").unwrap();
        assert_eq!(set.points()[0].value, PointValue::Number(80.0));
    }

    #[test]
    fn integer_series_rejects_fractions() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"count=(?<INT_count>[\d.]+)")])
            .unwrap();
        feed(
            &mut sink,
            &table(),
            vec![
                record(0, 0, Some(1), "count=3"),
                record(1, 10, Some(1), "count=3.5"),
            ],
        );
        let set = aggregator.dataset("INT_count").unwrap();
        assert_eq!(set.point_count(), 2);
    }

    #[test]
    fn value_map_labels_states() {
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let filter = Filter {
            report: Some(dltview_types::ReportOptions {
                value_maps: vec![(
                    "STATE_.*".into(),
                    vec![("0".into(), "off".into()), ("1".into(), "on".into())],
                )],
                ..Default::default()
            }),
            ..Filter::report(r"power=(?<STATE_power>\d)")
        };
        let mut sink = aggregator.add_series(vec![filter]).unwrap();
        feed(&mut sink, &table(), vec![record(0, 0, Some(1), "power=1")]);
        let set = aggregator.dataset("STATE_power").unwrap();
        assert_eq!(set.points()[0].value, PointValue::Text("on".into()));
        assert_eq!(set.value_labels, vec!["on".to_string()]);
    }

    #[test]
    fn conversion_failures_are_collected_once() {
        let mut conversions = ConversionRegistry::new();
        conversions.register("strict", |_| Err("unsupported payload".to_string()));
        let aggregator = ReportAggregator::new(conversions);
        let filter = Filter {
            report: Some(dltview_types::ReportOptions {
                conversion: Some("strict".into()),
                ..Default::default()
            }),
            ..Filter::report(r"v=(?<v>\d+)")
        };
        let mut sink = aggregator
            .add_series(vec![filter, Filter::report("(")])
            .unwrap();
        feed(
            &mut sink,
            &table(),
            vec![record(0, 0, Some(1), "v=1"), record(1, 0, Some(1), "v=2")],
        );
        let warnings = aggregator.warnings();
        assert_eq!(warnings.len(), 2, "{warnings:?}");
        assert_eq!(aggregator.dataset_count(), 0);
    }

    struct Counter(Arc<AtomicU64>);

    impl LateValue for Counter {
        fn value(&self) -> PointValue {
            PointValue::Number(self.0.load(Ordering::SeqCst) as f64)
        }
    }

    #[test]
    fn late_values_are_revisited_after_each_update() {
        let cell = Arc::new(AtomicU64::new(1));
        let shared = cell.clone();
        let mut conversions = ConversionRegistry::new();
        conversions.register("lazy", move |_| {
            Ok(vec![(
                "total".to_string(),
                ReportValue::Late(Arc::new(Counter(shared.clone()))),
            )])
        });
        let aggregator = ReportAggregator::new(conversions);
        let filter = Filter {
            report: Some(dltview_types::ReportOptions {
                conversion: Some("lazy".into()),
                ..Default::default()
            }),
            ..Filter::report(r"tick")
        };
        let mut sink = aggregator.add_series(vec![filter]).unwrap();
        let table = table();
        feed(&mut sink, &table, vec![record(0, 0, Some(1), "tick")]);
        assert_eq!(
            aggregator.dataset("total").unwrap().points()[0].value,
            PointValue::Number(1.0)
        );

        cell.store(5, Ordering::SeqCst);
        feed(&mut sink, &table, vec![record(1, 10, Some(1), "other")]);
        let total = aggregator.dataset("total").unwrap();
        assert_eq!(total.points()[0].value, PointValue::Number(5.0));
        assert_eq!(total.max, Some(5.0));
    }

    #[test]
    fn late_values_stop_when_the_stream_ends() {
        let cell = Arc::new(AtomicU64::new(1));
        let shared = cell.clone();
        let mut conversions = ConversionRegistry::new();
        conversions.register("lazy", move |_| {
            Ok(vec![(
                "total".to_string(),
                ReportValue::Late(Arc::new(Counter(shared.clone()))),
            )])
        });
        let aggregator = ReportAggregator::new(conversions);
        let filter = Filter {
            report: Some(dltview_types::ReportOptions {
                conversion: Some("lazy".into()),
                ..Default::default()
            }),
            ..Filter::report(r"tick")
        };
        let mut sink = aggregator.add_series(vec![filter]).unwrap();
        let table = table();
        feed(&mut sink, &table, vec![record(0, 0, Some(1), "tick")]);
        assert_eq!(aggregator.data.lock().late.len(), 1);

        cell.store(7, Ordering::SeqCst);
        let ctx = SinkContext {
            stream_id: StreamId::new(1),
            lifecycles: &table,
        };
        sink.on_done(&ctx, &mut Vec::new());
        assert!(aggregator.data.lock().late.is_empty());
        assert_eq!(aggregator.finished_streams(), 1);
        assert_eq!(
            aggregator.dataset("total").unwrap().points()[0].value,
            PointValue::Number(7.0)
        );
    }

    #[test]
    fn overlapping_lifecycles_each_close_once() {
        let mut table = table();
        table.apply([Lifecycle {
            id: LifecycleId::new(2),
            ecu: "ECU2".into(),
            start_time_us: 1_200_000,
            resume_time_us: None,
            end_time_us: 12_000_000,
            msg_count: 50,
            sw_version: None,
            ordinal: 0,
        }]);
        let aggregator = ReportAggregator::new(ConversionRegistry::new());
        let mut sink = aggregator
            .add_series(vec![Filter::report(r"temp=(?<temp>[\d.]+)")])
            .unwrap();
        feed(
            &mut sink,
            &table,
            vec![
                record(0, 1_000, Some(1), "temp=1"),
                record(1, 1_000, Some(2), "temp=2"),
                record(2, 5_000, Some(1), "temp=3"),
            ],
        );

        let temp = aggregator.dataset("temp").unwrap();
        assert_eq!(temp.lifecycle_end_count(LifecycleId::new(1)), 1);
        assert_eq!(temp.lifecycle_end_count(LifecycleId::new(2)), 1);
        let times: Vec<(i64, PointKind)> =
            temp.points().iter().map(|p| (p.time_ms, p.kind)).collect();
        assert_eq!(
            times,
            vec![
                (1_100, PointKind::Normal),
                (1_300, PointKind::Normal),
                (1_500, PointKind::Normal),
                (9_000, PointKind::LifecycleEnd),
                (12_000, PointKind::LifecycleEnd)
            ]
        );
    }

    #[test]
    fn report_filters_select_records_on_the_engine() {
        let engine = report_engine_filters(&[Filter::report("x")]);
        assert_eq!(engine[0].kind, FilterKind::Positive.engine_code());
        assert_eq!(engine[0].payload_regex.as_deref(), Some("x"));
    }
}
