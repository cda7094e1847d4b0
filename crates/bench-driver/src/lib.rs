//! Transport and driver abstractions for instrument I/O.
//!
//! Nothing here knows what a "session" or a "sequence" is — that
//! orchestration lives in `bench-server`. This crate only serializes bytes
//! over a link and turns them into typed device operations.

pub mod catalog;
pub mod driver;
pub mod error;
pub mod scpi;
pub mod transport;

pub use catalog::CatalogEntry;
pub use driver::{Driver, ScopeDriver, StatusFields};
pub use error::{DriverError, TransportError};
pub use scpi::{parse_idn_reply, ScpiDialect, ScpiDriver};
pub use transport::{LineLink, SharedTransport, Transport};
