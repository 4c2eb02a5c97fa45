use std::str::FromStr;
use std::time::Duration;

use dltview_wire::{EngineVersion, VersionRange};
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.2;
pub const DEFAULT_UNLOAD_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SHIFT_FRACTION: f64 = 0.5;
pub const DEFAULT_MIN_VIEWPORT_SPAN: u32 = 10;
pub const DEFAULT_FILTER_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_EMPTY_RESULT_MS: u64 = 1000;
pub const DEFAULT_METADATA_FALLBACK_MS: u64 = 5000;
pub const DEFAULT_EARLY_DATA_WARN_BATCHES: usize = 2;
pub const DEFAULT_EARLY_DATA_MAX_BATCHES: usize = 64;
pub const DEFAULT_EARLY_DATA_MAX_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_ENGINE_VERSIONS: VersionRange =
    VersionRange::new(EngineVersion::new(0, 61, 0), EngineVersion::new(1, 0, 0));

/// Tunables of a session. `Default` holds the built-in values,
/// [`SessionConfig::from_env`] layers `DLTVIEW_*` variables on top.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub page_size: u32,
    pub load_threshold: f64,
    pub unload_threshold: f64,
    pub shift_fraction: f64,
    /// Visible ranges spanning at most this many records are ignored.
    pub min_viewport_span: u32,
    pub filter_debounce: Duration,
    pub empty_result_after: Duration,
    pub metadata_fallback: Duration,
    pub early_data_warn_batches: usize,
    pub early_data_max_batches: usize,
    pub early_data_max_bytes: usize,
    pub engine_versions: VersionRange,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            load_threshold: DEFAULT_LOAD_THRESHOLD,
            unload_threshold: DEFAULT_UNLOAD_THRESHOLD,
            shift_fraction: DEFAULT_SHIFT_FRACTION,
            min_viewport_span: DEFAULT_MIN_VIEWPORT_SPAN,
            filter_debounce: Duration::from_millis(DEFAULT_FILTER_DEBOUNCE_MS),
            empty_result_after: Duration::from_millis(DEFAULT_EMPTY_RESULT_MS),
            metadata_fallback: Duration::from_millis(DEFAULT_METADATA_FALLBACK_MS),
            early_data_warn_batches: DEFAULT_EARLY_DATA_WARN_BATCHES,
            early_data_max_batches: DEFAULT_EARLY_DATA_MAX_BATCHES,
            early_data_max_bytes: DEFAULT_EARLY_DATA_MAX_BYTES,
            engine_versions: DEFAULT_ENGINE_VERSIONS,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for missing
    /// or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let ms = |key: &str, default: Duration| {
            parse_var(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let engine_versions = match (
            lookup("DLTVIEW_ENGINE_MIN_VERSION").and_then(|v| v.parse().ok()),
            lookup("DLTVIEW_ENGINE_MAX_VERSION").and_then(|v| v.parse().ok()),
        ) {
            (None, None) => defaults.engine_versions,
            (min, max) => VersionRange::new(
                min.unwrap_or(defaults.engine_versions.min),
                max.unwrap_or(defaults.engine_versions.max),
            ),
        };
        let config = Self {
            page_size: parse_var(&lookup, "DLTVIEW_PAGE_SIZE").unwrap_or(defaults.page_size),
            load_threshold: parse_var(&lookup, "DLTVIEW_LOAD_THRESHOLD")
                .unwrap_or(defaults.load_threshold),
            unload_threshold: parse_var(&lookup, "DLTVIEW_UNLOAD_THRESHOLD")
                .unwrap_or(defaults.unload_threshold),
            shift_fraction: parse_var(&lookup, "DLTVIEW_SHIFT_FRACTION")
                .unwrap_or(defaults.shift_fraction),
            min_viewport_span: parse_var(&lookup, "DLTVIEW_MIN_VIEWPORT_SPAN")
                .unwrap_or(defaults.min_viewport_span),
            filter_debounce: ms("DLTVIEW_FILTER_DEBOUNCE_MS", defaults.filter_debounce),
            empty_result_after: ms("DLTVIEW_EMPTY_RESULT_MS", defaults.empty_result_after),
            metadata_fallback: ms("DLTVIEW_METADATA_FALLBACK_MS", defaults.metadata_fallback),
            early_data_warn_batches: defaults.early_data_warn_batches,
            early_data_max_batches: parse_var(&lookup, "DLTVIEW_EARLY_DATA_MAX_BATCHES")
                .unwrap_or(defaults.early_data_max_batches),
            early_data_max_bytes: parse_var(&lookup, "DLTVIEW_EARLY_DATA_MAX_BYTES")
                .unwrap_or(defaults.early_data_max_bytes),
            engine_versions,
        };
        config.validated()
    }

    /// Clamps fractions into a usable range and keeps a non-empty page.
    pub fn validated(mut self) -> Self {
        if self.page_size == 0 {
            warn!("page size 0 is not usable, falling back to {DEFAULT_PAGE_SIZE}");
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        self.load_threshold = self.load_threshold.clamp(0.0, 1.0);
        self.unload_threshold = self.unload_threshold.clamp(self.load_threshold, 1.0);
        self.shift_fraction = self.shift_fraction.clamp(0.0, 1.0);
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}
