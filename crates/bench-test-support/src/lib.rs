//! Shared test doubles and fixtures for the instrument control workspace.
//!
//! `bench-core`'s own tests stay pure and need nothing from here; this crate
//! exists for `bench-server`'s session/manager/engine tests, which need a
//! `Driver`/`ScopeDriver` double that can be scripted and inspected without
//! spinning up a real transport.

pub mod fixtures;
pub mod mock_driver;

pub use mock_driver::{MockDriver, MockScopeDriver, RecordedCall, SharedMockDriver, SharedMockScopeDriver};
