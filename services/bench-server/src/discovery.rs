//! Port-opening abstraction for discovery (spec.md §4.5 `syncDevices`).
//!
//! `SessionManager::sync_devices` needs to turn a candidate port path into a
//! byte stream before it can probe `*IDN?`. Production opens a real serial
//! port through `tokio-serial`; tests substitute an in-memory duplex pipe so
//! the reconcile algorithm can be exercised without hardware.

use async_trait::async_trait;

use bench_driver::{LineLink, TransportError};
use tokio_serial::SerialPortBuilderExt;

/// Baud rate used when opening a candidate serial port during discovery.
/// SCPI bench instruments overwhelmingly default to 9600 8N1.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, port: &str) -> Result<Box<dyn LineLink>, TransportError>;
}

/// Opens a real serial device at `port` via `tokio-serial`.
pub struct SerialPortOpener {
    baud_rate: u32,
}

impl SerialPortOpener {
    pub fn new(baud_rate: u32) -> Self {
        SerialPortOpener { baud_rate }
    }
}

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, port: &str) -> Result<Box<dyn LineLink>, TransportError> {
        let stream = tokio_serial::new(port, self.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::duplex;
    use tokio::sync::Mutex;

    /// Hands out one scripted duplex pipe per port path, with the other end
    /// held open so a test can act as the simulated instrument.
    #[derive(Default)]
    pub struct StubPortOpener {
        links: Mutex<HashMap<String, tokio::io::DuplexStream>>,
    }

    impl StubPortOpener {
        pub fn new() -> Self {
            StubPortOpener::default()
        }

        /// Registers `port` so the next `open()` call on it returns a fresh
        /// duplex client end, with `server` as the end the test drives.
        pub async fn wire(&self, port: &str) -> tokio::io::DuplexStream {
            let (client, server) = duplex(1024);
            self.links.lock().await.insert(port.to_owned(), client);
            server
        }
    }

    #[async_trait]
    impl PortOpener for StubPortOpener {
        async fn open(&self, port: &str) -> Result<Box<dyn LineLink>, TransportError> {
            match self.links.lock().await.remove(port) {
                Some(link) => Ok(Box::new(link)),
                None => Err(TransportError::Io(format!("no stub wired for {port}"))),
            }
        }
    }
}
