//! Shared data model for dltview: ids, windows, records, lifecycles and filters.

mod api;
mod filter;
mod lifecycle;
mod primitives;
mod record;

pub use api::*;
pub use filter::*;
pub use lifecycle::*;
pub use primitives::*;
pub use record::*;
