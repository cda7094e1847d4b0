//! Per-device session state (spec.md §3 `DeviceSessionState`).

use serde::{Deserialize, Serialize};

use crate::device::{DeviceCapabilities, DeviceInfo};
use crate::history::HistoryData;

/// Lifecycle of the transport underneath a device session.
///
/// `Error` is distinct from `Disconnected`: it marks a session that is still
/// being retried (consecutive I/O failures below the configured threshold),
/// while `Disconnected` is terminal until a caller explicitly reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connected,
    Error,
    Disconnected,
}

/// The full in-memory state a `DeviceSession` owns and a `ClientHub` reads
/// from when answering `getDevices` or building a `measurement` message.
#[derive(Debug, Clone)]
pub struct DeviceSessionState {
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
    pub status: ConnectionStatus,
    pub mode: Option<String>,
    pub output_enabled: bool,
    pub setpoints: std::collections::BTreeMap<String, f64>,
    pub measurements: std::collections::BTreeMap<String, f64>,
    pub consecutive_errors: u32,
    pub history: HistoryData,
}

impl DeviceSessionState {
    pub fn new(info: DeviceInfo, capabilities: DeviceCapabilities, history_capacity: usize) -> Self {
        let mode = capabilities.modes.first().cloned();
        DeviceSessionState {
            info,
            capabilities,
            status: ConnectionStatus::Connected,
            mode,
            output_enabled: false,
            setpoints: std::collections::BTreeMap::new(),
            measurements: std::collections::BTreeMap::new(),
            consecutive_errors: 0,
            history: HistoryData::new(history_capacity),
        }
    }

    /// Record a successful poll: resets the error streak and marks the
    /// session connected again if it had been in `Error`/`Disconnected`.
    /// Returns `true` once, on the poll that clears a prior non-connected
    /// status, so the caller can emit a single recovery notification
    /// instead of one every tick (spec.md §8, property 9).
    pub fn record_poll_success(&mut self, timestamp_ms: i64, measurements: std::collections::BTreeMap<String, f64>) -> bool {
        self.consecutive_errors = 0;
        let recovered = self.status != ConnectionStatus::Connected;
        self.status = ConnectionStatus::Connected;
        self.history.push(timestamp_ms, measurements.clone());
        self.measurements = measurements;
        recovered
    }

    /// Record a failed poll. Returns `true` once `error_threshold`
    /// consecutive failures have been observed and the session has just
    /// latched into `Disconnected` (spec.md §4.1/§4.3: the caller uses this
    /// edge to emit a single disconnect notification instead of one per
    /// tick).
    pub fn record_poll_failure(&mut self, error_threshold: u32) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= error_threshold {
            let just_latched = self.status != ConnectionStatus::Disconnected;
            self.status = ConnectionStatus::Disconnected;
            just_latched
        } else {
            self.status = ConnectionStatus::Error;
            false
        }
    }

    pub fn set_mode(&mut self, mode: impl Into<String>) {
        self.mode = Some(mode.into());
    }

    pub fn set_output_enabled(&mut self, enabled: bool) {
        self.output_enabled = enabled;
    }

    pub fn set_setpoint(&mut self, name: impl Into<String>, value: f64) {
        self.setpoints.insert(name.into(), value);
    }
}
