//! Client side of a log engine session: one duplex connection carrying text
//! requests, their replies and binary record frames, multiplexed onto
//! windowed streams.

mod address;
mod config;
mod connection;
mod correlator;
mod error;
mod events;
mod lifecycle;
mod metadata;
mod registry;
mod session;
mod transport;
mod window;

pub use address::*;
pub use config::*;
pub use connection::*;
pub use correlator::*;
pub use error::*;
pub use events::*;
pub use lifecycle::*;
pub use metadata::*;
pub use registry::*;
pub use session::*;
pub use transport::*;
pub use window::*;
