use crate::{LifecycleId, LogLevel, Record};
use facet::Facet;
use regex::{Captures, Regex, RegexBuilder};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterKind {
    #[default]
    Positive,
    Negative,
    Marker,
    Event,
}

impl FilterKind {
    /// Numeric filter type understood by the engine.
    pub fn engine_code(self) -> u8 {
        match self {
            Self::Positive => 0,
            Self::Negative => 1,
            Self::Marker => 2,
            Self::Event => 3,
        }
    }

    /// Whether the engine applies this kind when selecting stream records.
    pub fn selects_records(self) -> bool {
        matches!(self, Self::Positive | Self::Negative)
    }
}

/// Filter criteria over a record. Unset criteria match anything.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub kind: FilterKind,
    pub enabled: bool,
    /// Inverts the outcome of all other criteria.
    pub not: bool,
    pub ecu: Option<String>,
    pub apid: Option<String>,
    pub ctid: Option<String>,
    pub log_level_min: Option<LogLevel>,
    pub log_level_max: Option<LogLevel>,
    pub mstp: Option<u8>,
    pub verbose: Option<bool>,
    pub payload: Option<String>,
    pub payload_regex: Option<String>,
    pub ignore_case_payload: bool,
    pub lifecycles: Option<Vec<LifecycleId>>,
    pub report: Option<ReportOptions>,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            kind: FilterKind::Positive,
            enabled: true,
            not: false,
            ecu: None,
            apid: None,
            ctid: None,
            log_level_min: None,
            log_level_max: None,
            mstp: None,
            verbose: None,
            payload: None,
            payload_regex: None,
            ignore_case_payload: false,
            lifecycles: None,
            report: None,
        }
    }
}

impl Filter {
    pub fn new(kind: FilterKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Event filter extracting report values with `pattern`.
    pub fn report(pattern: impl Into<String>) -> Self {
        Self {
            kind: FilterKind::Event,
            payload_regex: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn to_engine(&self) -> EngineFilter {
        EngineFilter {
            kind: self.kind.engine_code(),
            not: self.not.then_some(true),
            ecu: self.ecu.clone(),
            apid: self.apid.clone(),
            ctid: self.ctid.clone(),
            log_level_min: self.log_level_min.map(LogLevel::as_u8),
            log_level_max: self.log_level_max.map(LogLevel::as_u8),
            mstp: self.mstp,
            verbose: self.verbose,
            payload: self.payload.clone(),
            payload_regex: self.payload_regex.clone(),
            ignore_case_payload: self.ignore_case_payload.then_some(true),
            lifecycles: self
                .lifecycles
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.get()).collect()),
        }
    }
}

/// Filter shape sent to the engine inside `stream`/`query` commands.
#[derive(Facet, Clone, Debug, PartialEq)]
#[facet(rename_all = "camelCase")]
pub struct EngineFilter {
    #[facet(rename = "type")]
    pub kind: u8,
    #[facet(skip_unless_truthy)]
    pub not: Option<bool>,
    #[facet(skip_unless_truthy)]
    pub ecu: Option<String>,
    #[facet(skip_unless_truthy)]
    pub apid: Option<String>,
    #[facet(skip_unless_truthy)]
    pub ctid: Option<String>,
    #[facet(skip_unless_truthy)]
    pub log_level_min: Option<u8>,
    #[facet(skip_unless_truthy)]
    pub log_level_max: Option<u8>,
    #[facet(skip_unless_truthy)]
    pub mstp: Option<u8>,
    #[facet(skip_unless_truthy)]
    pub verbose: Option<bool>,
    #[facet(skip_unless_truthy)]
    pub payload: Option<String>,
    #[facet(skip_unless_truthy)]
    pub payload_regex: Option<String>,
    #[facet(skip_unless_truthy)]
    pub ignore_case_payload: Option<bool>,
    #[facet(skip_unless_truthy)]
    pub lifecycles: Option<Vec<u32>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisKind {
    Linear,
    Logarithmic,
    Category,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AxisDescriptor {
    pub id: String,
    pub kind: AxisKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub label: Option<String>,
}

/// Per-filter report configuration.
///
/// Each list pairs a series name (exact, or a regular expression) with the
/// setting to apply; list order is significant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportOptions {
    /// Name of a conversion function in the aggregator's registry.
    pub conversion: Option<String>,
    pub value_maps: Vec<(String, Vec<(String, String)>)>,
    pub y_axes: Vec<(String, AxisDescriptor)>,
    pub groups: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    InvalidRegex { pattern: String, detail: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegex { pattern, detail } => {
                write!(f, "invalid payload regex '{pattern}': {detail}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// A filter with its payload criteria prepared for repeated evaluation.
#[derive(Clone, Debug)]
pub struct CompiledFilter {
    filter: Filter,
    payload_regex: Option<Regex>,
    payload_folded: Option<String>,
}

impl CompiledFilter {
    pub fn new(filter: Filter) -> Result<Self, FilterError> {
        let payload_regex = match &filter.payload_regex {
            Some(pattern) => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(filter.ignore_case_payload)
                    .build()
                    .map_err(|e| FilterError::InvalidRegex {
                        pattern: pattern.clone(),
                        detail: e.to_string(),
                    })?,
            ),
            None => None,
        };
        let payload_folded = filter
            .payload
            .as_ref()
            .filter(|_| filter.ignore_case_payload)
            .map(|p| p.to_lowercase());
        Ok(Self {
            filter,
            payload_regex,
            payload_folded,
        })
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.payload_regex.as_ref()
    }

    pub fn captures<'p>(&self, payload: &'p str) -> Option<Captures<'p>> {
        self.payload_regex.as_ref()?.captures(payload)
    }

    /// Evaluates the filter criteria against `record`, ignoring `enabled`.
    pub fn matches(&self, record: &Record) -> bool {
        self.criteria_match(record) != self.filter.not
    }

    fn criteria_match(&self, record: &Record) -> bool {
        let f = &self.filter;
        if f.ecu.as_deref().is_some_and(|ecu| ecu != record.ecu) {
            return false;
        }
        if f.apid.as_deref().is_some_and(|apid| apid != record.apid) {
            return false;
        }
        if f.ctid.as_deref().is_some_and(|ctid| ctid != record.ctid) {
            return false;
        }
        if f.mstp.is_some_and(|mstp| mstp != record.class.mstp()) {
            return false;
        }
        if f.log_level_min.is_some() || f.log_level_max.is_some() {
            let Some(level) = record.log_level() else {
                return false;
            };
            if f.log_level_min.is_some_and(|min| level < min)
                || f.log_level_max.is_some_and(|max| level > max)
            {
                return false;
            }
        }
        if f.verbose.is_some_and(|verbose| verbose != record.verbose) {
            return false;
        }
        if let Some(lifecycles) = &f.lifecycles {
            match record.lifecycle {
                Some(id) if lifecycles.contains(&id) => {}
                _ => return false,
            }
        }
        if let Some(payload) = &f.payload {
            let found = match &self.payload_folded {
                Some(folded) => record.payload.to_lowercase().contains(folded.as_str()),
                None => record.payload.contains(payload.as_str()),
            };
            if !found {
                return false;
            }
        }
        if let Some(regex) = &self.payload_regex
            && !regex.is_match(&record.payload)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageClass;

    fn record(ecu: &str, level: LogLevel, payload: &str) -> Record {
        Record {
            index: 0,
            reception_time_us: 0,
            timestamp_dms: 0,
            lifecycle: Some(LifecycleId::new(3)),
            ecu: ecu.into(),
            apid: "APP".into(),
            ctid: "CTX".into(),
            class: MessageClass::Log(level),
            verbose: true,
            payload: payload.into(),
        }
    }

    #[test]
    fn unset_criteria_match_everything() {
        let filter = CompiledFilter::new(Filter::default()).unwrap();
        assert!(filter.matches(&record("ECU1", LogLevel::Info, "hello")));
    }

    #[test]
    fn level_range_is_inclusive() {
        let filter = CompiledFilter::new(Filter {
            log_level_min: Some(LogLevel::Error),
            log_level_max: Some(LogLevel::Warn),
            ..Filter::default()
        })
        .unwrap();
        assert!(filter.matches(&record("E", LogLevel::Warn, "")));
        assert!(filter.matches(&record("E", LogLevel::Error, "")));
        assert!(!filter.matches(&record("E", LogLevel::Info, "")));
        assert!(!filter.matches(&record("E", LogLevel::Fatal, "")));
    }

    #[test]
    fn not_inverts_the_outcome() {
        let filter = CompiledFilter::new(Filter {
            ecu: Some("ECU1".into()),
            not: true,
            ..Filter::default()
        })
        .unwrap();
        assert!(!filter.matches(&record("ECU1", LogLevel::Info, "")));
        assert!(filter.matches(&record("ECU2", LogLevel::Info, "")));
    }

    #[test]
    fn payload_ignore_case() {
        let filter = CompiledFilter::new(Filter {
            payload: Some("Speed".into()),
            ignore_case_payload: true,
            ..Filter::default()
        })
        .unwrap();
        assert!(filter.matches(&record("E", LogLevel::Info, "vehicle SPEED=12")));
    }

    #[test]
    fn lifecycle_criteria_reject_records_without_lifecycle() {
        let filter = CompiledFilter::new(Filter {
            lifecycles: Some(vec![LifecycleId::new(3)]),
            ..Filter::default()
        })
        .unwrap();
        let mut rec = record("E", LogLevel::Info, "");
        assert!(filter.matches(&rec));
        rec.lifecycle = None;
        assert!(!filter.matches(&rec));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = CompiledFilter::new(Filter::report("speed=(\\d+")).unwrap_err();
        assert!(matches!(err, FilterError::InvalidRegex { .. }));
    }

    #[test]
    fn engine_shape_is_camel_case_and_sparse() {
        let filter = Filter {
            apid: Some("APP".into()),
            log_level_max: Some(LogLevel::Info),
            ..Filter::new(FilterKind::Negative)
        };
        let json = facet_json::to_string(&filter.to_engine()).unwrap();
        assert_eq!(json, r#"{"type":1,"apid":"APP","logLevelMax":4}"#);
    }
}
