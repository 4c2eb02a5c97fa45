use dltview_types::{AxisDescriptor, CompiledFilter, ReportOptions};
use regex::Regex;

use crate::SeriesKind;

pub const TIMELINE_PREFIX: &str = "TL_";
pub const STATE_PREFIX: &str = "STATE_";
pub const INTEGER_PREFIX: &str = "INT_";

/// How a capture named `name` is plotted.
pub fn series_kind(name: &str) -> SeriesKind {
    if name.starts_with(TIMELINE_PREFIX) {
        SeriesKind::Timeline
    } else if name.starts_with(STATE_PREFIX) {
        SeriesKind::State
    } else {
        SeriesKind::Numeric
    }
}

pub fn is_integer_series(name: &str) -> bool {
    name.starts_with(INTEGER_PREFIX)
}

/// Presentation settings of one series.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeriesConfig {
    pub value_map: Vec<(String, String)>,
    pub axis: Option<AxisDescriptor>,
    pub group: Option<String>,
}

/// Resolves the settings for series `name` from the report options of
/// `filters`.
///
/// Each setting is looked up on its own: an exact key match in any filter
/// first, then keys used as regular expressions. The first filter in list
/// order wins. Invalid expressions are reported through `warn` and skipped.
pub fn resolve_series_config(
    name: &str,
    filters: &[CompiledFilter],
    warn: &mut dyn FnMut(String),
) -> SeriesConfig {
    let options: Vec<&ReportOptions> = filters
        .iter()
        .filter_map(|f| f.filter().report.as_ref())
        .collect();
    SeriesConfig {
        value_map: lookup(name, &options, |o| &o.value_maps, warn).unwrap_or_default(),
        axis: lookup(name, &options, |o| &o.y_axes, warn),
        group: lookup(name, &options, |o| &o.groups, warn),
    }
}

fn lookup<T: Clone>(
    name: &str,
    options: &[&ReportOptions],
    entries: impl Fn(&ReportOptions) -> &Vec<(String, T)>,
    warn: &mut dyn FnMut(String),
) -> Option<T> {
    for opts in options {
        if let Some((_, value)) = entries(opts).iter().find(|(key, _)| key == name) {
            return Some(value.clone());
        }
    }
    for opts in options {
        for (key, value) in entries(opts) {
            match Regex::new(key) {
                Ok(re) if re.is_match(name) => return Some(value.clone()),
                Ok(_) => {}
                Err(e) => warn(format!("invalid series pattern '{key}': {e}")),
            }
        }
    }
    None
}
