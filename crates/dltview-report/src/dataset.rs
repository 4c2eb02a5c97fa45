use std::fmt;

use dltview_types::{AxisDescriptor, LifecycleId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointKind {
    Normal,
    /// Last instant of the previous state, placed right before a change.
    PrevStateEnd,
    /// Closes a lifecycle's contribution so renderers do not bridge the gap.
    LifecycleEnd,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PointValue {
    Number(f64),
    Text(String),
    Null,
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(t) => f.write_str(t),
            Self::Null => f.write_str("null"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    pub time_ms: i64,
    pub value: PointValue,
    pub lifecycle: LifecycleId,
    pub kind: PointKind,
}

/// How values of a series are plotted, derived from its name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeriesKind {
    Numeric,
    /// Categorical value that holds until it changes or the lifecycle ends.
    State,
    /// Point events on a timeline.
    Timeline,
}

/// Where a `Normal` point lives, stable while its run grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointRef {
    pub lifecycle: LifecycleId,
    pub index: usize,
}

/// The points one lifecycle contributed, closed by its tail.
#[derive(Clone, Debug)]
struct Run {
    lifecycle: LifecycleId,
    points: Vec<DataPoint>,
    /// The tail must not end before this time.
    min_end_ms: i64,
}

impl Run {
    fn tail_len(kind: SeriesKind) -> usize {
        match kind {
            SeriesKind::State => 2,
            SeriesKind::Numeric | SeriesKind::Timeline => 1,
        }
    }

    fn refresh_tail(&mut self, kind: SeriesKind, lifecycle_end_ms: i64) {
        let end = lifecycle_end_ms.max(self.min_end_ms);
        let len = self.points.len();
        match kind {
            SeriesKind::State => {
                self.points[len - 2].time_ms = end - 1;
                self.points[len - 1].time_ms = end;
            }
            SeriesKind::Numeric | SeriesKind::Timeline => self.points[len - 1].time_ms = end,
        }
    }
}

/// One named time series.
///
/// Every lifecycle contributes a run of points closed by exactly one
/// `LifecycleEnd` point. The closing points of a run form its tail; their
/// times follow the lifecycle end as that grows. Runs of lifecycles that
/// overlap in time are kept apart and only merged when points are read.
#[derive(Clone, Debug)]
pub struct DataSet {
    pub name: String,
    pub kind: SeriesKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Distinct labels of categorical values, in first-seen order.
    pub value_labels: Vec<String>,
    pub value_map: Vec<(String, String)>,
    pub axis: Option<AxisDescriptor>,
    pub group: Option<String>,
    runs: Vec<Run>,
}

impl DataSet {
    pub fn new(name: impl Into<String>, kind: SeriesKind) -> Self {
        Self {
            name: name.into(),
            kind,
            min: None,
            max: None,
            value_labels: Vec::new(),
            value_map: Vec::new(),
            axis: None,
            group: None,
            runs: Vec::new(),
        }
    }

    /// All points ordered by time. Points at the same time keep the order
    /// of their run.
    pub fn points(&self) -> Vec<DataPoint> {
        let mut points: Vec<DataPoint> = self
            .runs
            .iter()
            .flat_map(|run| run.points.iter().cloned())
            .collect();
        points.sort_by_key(|p| p.time_ms);
        points
    }

    pub fn point_count(&self) -> usize {
        self.runs.iter().map(|run| run.points.len()).sum()
    }

    pub fn point(&self, at: PointRef) -> Option<&DataPoint> {
        self.runs
            .iter()
            .find(|run| run.lifecycle == at.lifecycle)
            .and_then(|run| run.points.get(at.index))
    }

    /// Lifecycles with a run in this series, in first-seen order.
    pub fn lifecycles(&self) -> impl Iterator<Item = LifecycleId> + '_ {
        self.runs.iter().map(|run| run.lifecycle)
    }

    pub fn lifecycle_end_count(&self, lifecycle: LifecycleId) -> usize {
        self.runs
            .iter()
            .flat_map(|run| &run.points)
            .filter(|p| p.lifecycle == lifecycle && p.kind == PointKind::LifecycleEnd)
            .count()
    }

    /// Maps a raw categorical value through the value map.
    pub fn label_for(&self, raw: &str) -> String {
        self.value_map
            .iter()
            .find(|(value, _)| value == raw)
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| raw.to_string())
    }

    fn note_value(&mut self, value: &PointValue) {
        match value {
            PointValue::Number(n) if n.is_finite() => {
                self.min = Some(self.min.map_or(*n, |m| m.min(*n)));
                self.max = Some(self.max.map_or(*n, |m| m.max(*n)));
            }
            PointValue::Text(label) if !self.value_labels.contains(label) => {
                self.value_labels.push(label.clone());
            }
            _ => {}
        }
    }

    /// Moves every tail to the end of its lifecycle, or later if points
    /// require it. Lifecycles `end_of` does not know keep their tail.
    pub fn refresh_tails(&mut self, mut end_of: impl FnMut(LifecycleId) -> Option<i64>) {
        let kind = self.kind;
        for run in &mut self.runs {
            if let Some(end) = end_of(run.lifecycle) {
                run.refresh_tail(kind, end);
            }
        }
    }

    fn run_mut(&mut self, lifecycle: LifecycleId) -> Option<&mut Run> {
        self.runs.iter_mut().find(|run| run.lifecycle == lifecycle)
    }

    /// Adds a numeric or timeline sample.
    pub fn push_sample(
        &mut self,
        time_ms: i64,
        value: PointValue,
        lifecycle: LifecycleId,
        lifecycle_end_ms: i64,
    ) -> PointRef {
        self.note_value(&value);
        let kind = self.kind;
        let normal = DataPoint {
            time_ms,
            value: value.clone(),
            lifecycle,
            kind: PointKind::Normal,
        };
        let mut fresh = vec![normal];
        if kind == SeriesKind::Timeline {
            fresh.push(DataPoint {
                time_ms,
                value,
                lifecycle,
                kind: PointKind::PrevStateEnd,
            });
        }

        let index = match self.run_mut(lifecycle) {
            Some(run) => {
                let at = run.points.len() - Run::tail_len(kind);
                run.points.splice(at..at, fresh);
                run.min_end_ms = run.min_end_ms.max(time_ms);
                run.refresh_tail(kind, lifecycle_end_ms);
                at
            }
            None => {
                let end_value = match kind {
                    SeriesKind::Numeric => PointValue::Number(f64::NAN),
                    _ => PointValue::Null,
                };
                fresh.push(DataPoint {
                    time_ms,
                    value: end_value,
                    lifecycle,
                    kind: PointKind::LifecycleEnd,
                });
                let mut run = Run {
                    lifecycle,
                    points: fresh,
                    min_end_ms: time_ms,
                };
                run.refresh_tail(kind, lifecycle_end_ms);
                self.runs.push(run);
                0
            }
        };
        PointRef { lifecycle, index }
    }

    /// Adds a state sample, stitching it into the run of the lifecycle.
    ///
    /// A state holds until the next change or the lifecycle end. A change
    /// replaces the tail by the previous value's end, the new value and a
    /// fresh tail; repeating the current value only adds a sample.
    pub fn push_state(
        &mut self,
        time_ms: i64,
        label: String,
        lifecycle: LifecycleId,
        lifecycle_end_ms: i64,
    ) -> PointRef {
        let value = PointValue::Text(label);
        self.note_value(&value);
        let kind = self.kind;
        let point = |time_ms: i64, value: PointValue, kind: PointKind| DataPoint {
            time_ms,
            value,
            lifecycle,
            kind,
        };

        let Some(run) = self.run_mut(lifecycle) else {
            let mut run = Run {
                lifecycle,
                points: vec![
                    point(time_ms, value.clone(), PointKind::Normal),
                    point(time_ms, value, PointKind::PrevStateEnd),
                    point(time_ms + 1, PointValue::Null, PointKind::LifecycleEnd),
                ],
                min_end_ms: time_ms + 1,
            };
            run.refresh_tail(kind, lifecycle_end_ms);
            self.runs.push(run);
            return PointRef {
                lifecycle,
                index: 0,
            };
        };

        let len = run.points.len();
        let previous = run.points[len - 2].value.clone();
        let index = if previous == value {
            run.points
                .insert(len - 2, point(time_ms, value, PointKind::Normal));
            len - 2
        } else {
            run.points.truncate(len - 2);
            run.points
                .push(point(time_ms, previous, PointKind::PrevStateEnd));
            let index = run.points.len();
            run.points
                .push(point(time_ms, value.clone(), PointKind::Normal));
            run.points
                .push(point(time_ms, value, PointKind::PrevStateEnd));
            run.points
                .push(point(time_ms + 1, PointValue::Null, PointKind::LifecycleEnd));
            index
        };
        run.min_end_ms = run.min_end_ms.max(time_ms + 1);
        run.refresh_tail(kind, lifecycle_end_ms);
        PointRef { lifecycle, index }
    }

    /// Replaces the value of a `Normal` point after late resolution.
    pub fn set_value(&mut self, at: PointRef, value: PointValue) {
        self.note_value(&value);
        if let Some(point) = self
            .run_mut(at.lifecycle)
            .and_then(|run| run.points.get_mut(at.index))
        {
            point.value = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lc(id: u32) -> LifecycleId {
        LifecycleId::new(id)
    }

    fn assert_time_ordered(set: &DataSet) {
        let times: Vec<i64> = set.points().iter().map(|p| p.time_ms).collect();
        assert!(times.is_sorted(), "{times:?}");
    }

    fn kinds(set: &DataSet) -> Vec<(i64, PointKind)> {
        set.points().iter().map(|p| (p.time_ms, p.kind)).collect()
    }

    #[test]
    fn numeric_series_ends_each_lifecycle_with_nan() {
        let mut set = DataSet::new("speed", SeriesKind::Numeric);
        set.push_sample(10, PointValue::Number(3.0), lc(1), 100);
        set.push_sample(20, PointValue::Number(5.0), lc(1), 120);
        assert_eq!(
            kinds(&set),
            vec![
                (10, PointKind::Normal),
                (20, PointKind::Normal),
                (120, PointKind::LifecycleEnd)
            ]
        );
        assert!(matches!(set.points()[2].value, PointValue::Number(n) if n.is_nan()));
        assert_eq!((set.min, set.max), (Some(3.0), Some(5.0)));

        set.push_sample(500, PointValue::Number(1.0), lc(2), 600);
        set.refresh_tails(|id| Some(if id == lc(1) { 130 } else { 600 }));
        let points = set.points();
        assert_eq!(points[2].time_ms, 130);
        assert_eq!(set.lifecycle_end_count(lc(1)), 1);
        assert_eq!(set.lifecycle_end_count(lc(2)), 1);
        assert_eq!(points.last().unwrap().time_ms, 600);
    }

    #[test]
    fn state_change_stitches_previous_value() {
        let mut set = DataSet::new("STATE_mode", SeriesKind::State);
        set.push_state(10, "idle".into(), lc(1), 100);
        set.push_state(40, "run".into(), lc(1), 100);
        let got: Vec<(i64, PointValue, PointKind)> = set
            .points()
            .into_iter()
            .map(|p| (p.time_ms, p.value, p.kind))
            .collect();
        assert_eq!(
            got,
            vec![
                (10, PointValue::Text("idle".into()), PointKind::Normal),
                (40, PointValue::Text("idle".into()), PointKind::PrevStateEnd),
                (40, PointValue::Text("run".into()), PointKind::Normal),
                (99, PointValue::Text("run".into()), PointKind::PrevStateEnd),
                (100, PointValue::Null, PointKind::LifecycleEnd),
            ]
        );
        assert_eq!(set.value_labels, vec!["idle".to_string(), "run".to_string()]);
    }

    #[test]
    fn repeated_state_adds_one_sample_and_keeps_tail() {
        let mut set = DataSet::new("STATE_mode", SeriesKind::State);
        set.push_state(10, "on".into(), lc(1), 100);
        let before = set.point_count();
        let ends = set.lifecycle_end_count(lc(1));
        let at = set.push_state(20, "on".into(), lc(1), 100);
        assert_eq!(set.point_count(), before + 1);
        assert_eq!(set.lifecycle_end_count(lc(1)), ends);
        assert_eq!(at.index, 1);
        assert_eq!(set.points()[1].time_ms, 20);
        assert_eq!(set.points()[1].kind, PointKind::Normal);
    }

    #[test]
    fn state_tail_outlives_samples_past_lifecycle_end() {
        let mut set = DataSet::new("STATE_mode", SeriesKind::State);
        set.push_state(150, "late".into(), lc(1), 100);
        assert_eq!(
            kinds(&set),
            vec![
                (150, PointKind::Normal),
                (150, PointKind::PrevStateEnd),
                (151, PointKind::LifecycleEnd)
            ]
        );
        set.refresh_tails(|_| Some(400));
        let points = set.points();
        assert_eq!(points[2].time_ms, 400);
        assert_eq!(points[1].time_ms, 399);
    }

    #[test]
    fn new_lifecycle_opens_new_state_run() {
        let mut set = DataSet::new("STATE_mode", SeriesKind::State);
        set.push_state(10, "a".into(), lc(1), 50);
        set.push_state(200, "a".into(), lc(2), 300);
        set.refresh_tails(|id| Some(if id == lc(1) { 60 } else { 300 }));
        assert_eq!(set.lifecycle_end_count(lc(1)), 1);
        assert_eq!(set.lifecycle_end_count(lc(2)), 1);
        assert_eq!(set.points()[2].time_ms, 60);
        assert_eq!(set.lifecycles().collect::<Vec<_>>(), vec![lc(1), lc(2)]);
        assert_time_ordered(&set);
    }

    #[test]
    fn timeline_sample_is_a_pair() {
        let mut set = DataSet::new("TL_boot", SeriesKind::Timeline);
        set.push_sample(10, PointValue::Text("kernel".into()), lc(1), 100);
        assert_eq!(
            kinds(&set),
            vec![
                (10, PointKind::Normal),
                (10, PointKind::PrevStateEnd),
                (100, PointKind::LifecycleEnd)
            ]
        );
    }

    #[test]
    fn interleaved_lifecycles_keep_one_end_each() {
        let mut set = DataSet::new("speed", SeriesKind::Numeric);
        set.push_sample(100, PointValue::Number(1.0), lc(1), 500);
        set.push_sample(150, PointValue::Number(2.0), lc(2), 600);
        let at = set.push_sample(200, PointValue::Number(3.0), lc(1), 500);
        set.refresh_tails(|id| Some(if id == lc(1) { 500 } else { 600 }));

        assert_eq!(set.lifecycle_end_count(lc(1)), 1);
        assert_eq!(set.lifecycle_end_count(lc(2)), 1);
        assert_time_ordered(&set);
        assert_eq!(
            kinds(&set),
            vec![
                (100, PointKind::Normal),
                (150, PointKind::Normal),
                (200, PointKind::Normal),
                (500, PointKind::LifecycleEnd),
                (600, PointKind::LifecycleEnd)
            ]
        );
        assert_eq!(set.point(at).map(|p| p.time_ms), Some(200));
    }

    #[test]
    fn interleaved_state_runs_stitch_within_their_lifecycle() {
        let mut set = DataSet::new("STATE_mode", SeriesKind::State);
        set.push_state(100, "a".into(), lc(1), 500);
        set.push_state(150, "b".into(), lc(2), 600);
        set.push_state(200, "c".into(), lc(1), 500);

        assert_eq!(set.lifecycle_end_count(lc(1)), 1);
        assert_eq!(set.lifecycle_end_count(lc(2)), 1);
        assert_time_ordered(&set);
        let lc1: Vec<(i64, PointValue)> = set
            .points()
            .into_iter()
            .filter(|p| p.lifecycle == lc(1))
            .map(|p| (p.time_ms, p.value))
            .collect();
        assert_eq!(
            lc1,
            vec![
                (100, PointValue::Text("a".into())),
                (200, PointValue::Text("a".into())),
                (200, PointValue::Text("c".into())),
                (499, PointValue::Text("c".into())),
                (500, PointValue::Null),
            ]
        );
    }

    #[test]
    fn late_value_lands_on_its_point_after_other_runs_grow() {
        let mut set = DataSet::new("total", SeriesKind::Numeric);
        let at = set.push_sample(10, PointValue::Number(0.0), lc(1), 100);
        set.push_sample(5, PointValue::Number(9.0), lc(2), 50);
        set.push_sample(20, PointValue::Number(1.0), lc(1), 100);
        set.set_value(at, PointValue::Number(4.0));
        assert_eq!(set.point(at).map(|p| p.value.clone()), Some(PointValue::Number(4.0)));
        assert_eq!(set.max, Some(9.0));
    }
}
