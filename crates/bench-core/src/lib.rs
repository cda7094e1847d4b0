//! Pure domain types and algorithms for the instrument control server.
//!
//! Nothing in this crate touches a socket, a serial port, a clock, or a
//! filesystem. Session and engine runtimes in `bench-server` wrap these
//! types with IO and scheduling; the value of keeping them apart is that
//! the waveform math, the history ring and the trigger-condition evaluator
//! can be exercised with plain `#[test]`s and `proptest`.

pub mod device;
pub mod history;
pub mod id;
pub mod scope;
pub mod sequence;
pub mod state;
pub mod trigger;
pub mod waveform;

pub use device::{DeviceCapabilities, DeviceClass, DeviceInfo, DeviceType, ValueDescriptor};
pub use history::HistoryData;
pub use id::DeviceId;
pub use state::{ConnectionStatus, DeviceSessionState};
