//! Stable device identity derived from IDN fields.
//!
//! Grounded on the corpus's habit of building canonical composite keys from
//! free-text identity fields (`ports.rs::stream_key`, `cache.rs::StreamKey`):
//! here the key must survive a reconnect, so it is a hash of the identity
//! triple rather than a literal join of the strings (manufacturers and
//! models can contain the separator character; a hash sidesteps that).

use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity for a device, derived from `manufacturer,model[,serial]`.
///
/// Two `identify()` calls that return the same manufacturer/model/serial
/// always derive the same `DeviceId`, even across a full disconnect and
/// reconnect on a different serial port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Derive a device id from the IDN triple. `serial` is optional; a
    /// missing serial still produces a stable (if less unique) id.
    pub fn derive(manufacturer: &str, model: &str, serial: Option<&str>) -> Self {
        let idn = idn_key(manufacturer, model, serial);
        let mut hasher = Sha256::new();
        hasher.update(idn.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        DeviceId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build the canonical `manufacturer,model,serial` IDN string used both as
/// the device-id hash input and as the alias-store key (spec.md §6:
/// `aliases/{idn}`).
pub fn idn_key(manufacturer: &str, model: &str, serial: Option<&str>) -> String {
    format!("{manufacturer},{model},{}", serial.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_idn_derives_same_id() {
        let a = DeviceId::derive("Keysight", "E36313A", Some("MY12345"));
        let b = DeviceId::derive("Keysight", "E36313A", Some("MY12345"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_serial_derives_different_id() {
        let a = DeviceId::derive("Keysight", "E36313A", Some("MY12345"));
        let b = DeviceId::derive("Keysight", "E36313A", Some("MY99999"));
        assert_ne!(a, b);
    }

    #[test]
    fn missing_serial_is_stable() {
        let a = DeviceId::derive("Rigol", "DP832", None);
        let b = DeviceId::derive("Rigol", "DP832", None);
        assert_eq!(a, b);
    }

    #[test]
    fn idn_key_format() {
        assert_eq!(idn_key("Keysight", "E36313A", Some("MY1")), "Keysight,E36313A,MY1");
        assert_eq!(idn_key("Keysight", "E36313A", None), "Keysight,E36313A,");
    }
}
