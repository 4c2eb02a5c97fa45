//! Time series extracted from log payloads by report filters.
//!
//! Each capture of a report filter's regex becomes a named series; name
//! prefixes pick how values are plotted (`TL_` timeline events, `STATE_`
//! categorical states, `INT_` integers, anything else floats).

mod aggregator;
mod conversion;
mod dataset;
mod series;

pub use aggregator::*;
pub use conversion::*;
pub use dataset::*;
pub use series::*;
