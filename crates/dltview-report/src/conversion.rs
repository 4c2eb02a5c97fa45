use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Captures;

use crate::PointValue;

/// A value whose final form is only known after more records were seen.
///
/// Its point is plotted with the provisional value and re-evaluated after
/// every update until it reports being settled or its stream ends.
pub trait LateValue: Send + Sync {
    fn value(&self) -> PointValue;

    fn is_settled(&self) -> bool {
        false
    }
}

/// A named value produced from one match.
#[derive(Clone)]
pub enum ReportValue {
    Number(f64),
    Text(String),
    Late(Arc<dyn LateValue>),
}

impl fmt::Debug for ReportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Self::Late(late) => f.debug_tuple("Late").field(&late.value()).finish(),
        }
    }
}

pub type ConversionFn =
    dyn Fn(&Captures<'_>) -> Result<Vec<(String, ReportValue)>, String> + Send + Sync;

/// Named functions turning regex captures into derived named values.
///
/// Filters refer to a conversion by name in their report options.
#[derive(Clone, Default)]
pub struct ConversionRegistry {
    functions: HashMap<String, Arc<ConversionFn>>,
}

impl ConversionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Captures<'_>) -> Result<Vec<(String, ReportValue)>, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&ConversionFn> {
        self.functions.get(name).map(|f| f.as_ref())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for ConversionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ConversionRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn registered_conversion_derives_values() {
        let mut registry = ConversionRegistry::new();
        registry.register("kmh", |caps| {
            let ms: f64 = caps
                .name("speed")
                .ok_or("no speed")?
                .as_str()
                .parse()
                .map_err(|e| format!("speed: {e}"))?;
            Ok(vec![("speed_kmh".into(), ReportValue::Number(ms * 3.6))])
        });
        let regex = Regex::new(r"speed=(?<speed>\d+)").unwrap();
        let caps = regex.captures("speed=10").unwrap();
        let values = registry.get("kmh").unwrap()(&caps).unwrap();
        assert!(matches!(values[0].1, ReportValue::Number(n) if (n - 36.0).abs() < 1e-9));
        assert!(registry.get("mph").is_none());
        assert_eq!(registry.len(), 1);
    }
}
