//! Driver interface (spec.md §4.2), grounded on the corpus's `ScpiEndpoint`
//! trait shape: a small set of typed async operations over a transport,
//! with concrete instrument dialects implementing them rather than callers
//! formatting command strings themselves.

use async_trait::async_trait;
use std::collections::BTreeMap;

use bench_core::device::{DeviceCapabilities, DeviceInfo};
use bench_core::scope::{ChannelConfig, OscilloscopeStatus, WaveformData};

use crate::error::DriverError;

/// Status fields a session refreshes at lower cadence than measurements
/// (spec.md §4.3 "status change propagation").
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFields {
    pub mode: String,
    pub output_enabled: bool,
    pub setpoints: BTreeMap<String, f64>,
}

/// A PSU or electronic-load driver. Constructed once per session from a
/// transport; stateless beyond that handle — the session owns the derived
/// state cache (spec.md §4.2).
#[async_trait]
pub trait Driver: Send + Sync {
    async fn identify(&self) -> Result<DeviceInfo, DriverError>;
    async fn get_capabilities(&self) -> Result<DeviceCapabilities, DriverError>;
    async fn read_measurements(&self) -> Result<BTreeMap<String, f64>, DriverError>;
    async fn read_status_fields(&self) -> Result<StatusFields, DriverError>;
    async fn set_mode(&self, mode: &str) -> Result<(), DriverError>;
    async fn set_output(&self, enabled: bool) -> Result<(), DriverError>;
    async fn set_value(&self, name: &str, value: f64) -> Result<(), DriverError>;
}

/// An oscilloscope driver (spec.md §4.2, §4.4).
#[async_trait]
pub trait ScopeDriver: Send + Sync {
    async fn identify(&self) -> Result<DeviceInfo, DriverError>;
    async fn get_capabilities(&self) -> Result<DeviceCapabilities, DriverError>;
    async fn read_status(&self) -> Result<OscilloscopeStatus, DriverError>;

    async fn run(&self) -> Result<(), DriverError>;
    async fn stop(&self) -> Result<(), DriverError>;
    async fn single(&self) -> Result<(), DriverError>;
    async fn auto_setup(&self) -> Result<(), DriverError>;

    async fn get_waveform(&self, channel: &str) -> Result<WaveformData, DriverError>;
    async fn get_measurement(&self, channel: &str, measurement_type: &str) -> Result<f64, DriverError>;
    async fn get_screenshot(&self) -> Result<Vec<u8>, DriverError>;

    async fn set_channel(&self, channel: &str, config: ChannelConfig) -> Result<(), DriverError>;
    async fn set_timebase(&self, seconds_per_div: f64) -> Result<(), DriverError>;
    async fn set_trigger(&self, spec: serde_json::Value) -> Result<(), DriverError>;
}
