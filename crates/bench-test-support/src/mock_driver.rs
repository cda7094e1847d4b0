//! In-memory `Driver`/`ScopeDriver` doubles for session and engine tests.
//!
//! Grounded on the corpus's habit of recording observed operations on a
//! shared, lock-protected log (`cache.rs`'s unit tests inspect `EventBus`
//! state directly rather than mocking a network socket) — here every call is
//! pushed onto a `Vec` behind a `tokio::sync::Mutex` so a test can assert
//! exact call order without racing the session's own task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use bench_core::device::{DeviceCapabilities, DeviceInfo};
use bench_core::scope::{ChannelConfig, OscilloscopeStatus, WaveformData};
use bench_driver::{Driver, DriverError, ScopeDriver, StatusFields};

/// One recorded driver call, in the order it was observed.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    SetMode(String),
    SetOutput(bool),
    SetValue(String, f64),
}

/// A scriptable `Driver` double: fixed identity/capabilities, a queue of
/// measurement snapshots to return on successive `read_measurements` calls,
/// a failure switch, and a call log.
pub struct MockDriver {
    info: DeviceInfo,
    capabilities: DeviceCapabilities,
    measurements: Mutex<BTreeMap<String, f64>>,
    status: Mutex<StatusFields>,
    fail_reads: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockDriver {
    pub fn new(info: DeviceInfo, capabilities: DeviceCapabilities) -> Self {
        MockDriver {
            info,
            capabilities,
            measurements: Mutex::new(BTreeMap::new()),
            status: Mutex::new(StatusFields {
                mode: String::new(),
                output_enabled: false,
                setpoints: BTreeMap::new(),
            }),
            fail_reads: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_measurements(&self, values: BTreeMap<String, f64>) {
        *self.measurements.lock().await = values;
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn identify(&self) -> Result<DeviceInfo, DriverError> {
        Ok(self.info.clone())
    }

    async fn get_capabilities(&self) -> Result<DeviceCapabilities, DriverError> {
        Ok(self.capabilities.clone())
    }

    async fn read_measurements(&self) -> Result<BTreeMap<String, f64>, DriverError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::InvalidReply("simulated failure".to_owned()));
        }
        Ok(self.measurements.lock().await.clone())
    }

    async fn read_status_fields(&self) -> Result<StatusFields, DriverError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::InvalidReply("simulated failure".to_owned()));
        }
        Ok(self.status.lock().await.clone())
    }

    async fn set_mode(&self, mode: &str) -> Result<(), DriverError> {
        self.status.lock().await.mode = mode.to_owned();
        self.calls.lock().await.push(RecordedCall::SetMode(mode.to_owned()));
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> Result<(), DriverError> {
        self.status.lock().await.output_enabled = enabled;
        self.calls.lock().await.push(RecordedCall::SetOutput(enabled));
        Ok(())
    }

    async fn set_value(&self, name: &str, value: f64) -> Result<(), DriverError> {
        self.status.lock().await.setpoints.insert(name.to_owned(), value);
        self.calls.lock().await.push(RecordedCall::SetValue(name.to_owned(), value));
        Ok(())
    }
}

/// A scriptable `ScopeDriver` double, same recording strategy as `MockDriver`.
pub struct MockScopeDriver {
    info: DeviceInfo,
    capabilities: DeviceCapabilities,
    status: Mutex<OscilloscopeStatus>,
    waveform: Mutex<Option<WaveformData>>,
    calls: Mutex<Vec<String>>,
}

impl MockScopeDriver {
    pub fn new(info: DeviceInfo, capabilities: DeviceCapabilities, status: OscilloscopeStatus) -> Self {
        MockScopeDriver {
            info,
            capabilities,
            status: Mutex::new(status),
            waveform: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_waveform(&self, data: WaveformData) {
        *self.waveform.lock().await = Some(data);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ScopeDriver for MockScopeDriver {
    async fn identify(&self) -> Result<DeviceInfo, DriverError> {
        Ok(self.info.clone())
    }

    async fn get_capabilities(&self) -> Result<DeviceCapabilities, DriverError> {
        Ok(self.capabilities.clone())
    }

    async fn read_status(&self) -> Result<OscilloscopeStatus, DriverError> {
        Ok(self.status.lock().await.clone())
    }

    async fn run(&self) -> Result<(), DriverError> {
        self.calls.lock().await.push("run".to_owned());
        self.status.lock().await.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.calls.lock().await.push("stop".to_owned());
        self.status.lock().await.running = false;
        Ok(())
    }

    async fn single(&self) -> Result<(), DriverError> {
        self.calls.lock().await.push("single".to_owned());
        Ok(())
    }

    async fn auto_setup(&self) -> Result<(), DriverError> {
        self.calls.lock().await.push("auto_setup".to_owned());
        Ok(())
    }

    async fn get_waveform(&self, channel: &str) -> Result<WaveformData, DriverError> {
        self.calls.lock().await.push(format!("get_waveform({channel})"));
        self.waveform
            .lock()
            .await
            .clone()
            .ok_or_else(|| DriverError::InvalidReply("no waveform configured".to_owned()))
    }

    async fn get_measurement(&self, channel: &str, measurement_type: &str) -> Result<f64, DriverError> {
        self.calls.lock().await.push(format!("get_measurement({channel},{measurement_type})"));
        self.status
            .lock()
            .await
            .measurements
            .get(measurement_type)
            .copied()
            .ok_or_else(|| DriverError::InvalidReply("measurement not configured".to_owned()))
    }

    async fn get_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.calls.lock().await.push("get_screenshot".to_owned());
        Ok(vec![0xFF, 0xD8, 0xFF])
    }

    async fn set_channel(&self, channel: &str, config: ChannelConfig) -> Result<(), DriverError> {
        self.calls.lock().await.push(format!("set_channel({channel})"));
        self.status.lock().await.channels.insert(channel.to_owned(), config);
        Ok(())
    }

    async fn set_timebase(&self, seconds_per_div: f64) -> Result<(), DriverError> {
        self.calls.lock().await.push(format!("set_timebase({seconds_per_div})"));
        self.status.lock().await.timebase = seconds_per_div;
        Ok(())
    }

    async fn set_trigger(&self, spec: serde_json::Value) -> Result<(), DriverError> {
        self.calls.lock().await.push(format!("set_trigger({spec})"));
        Ok(())
    }
}

pub type SharedMockDriver = Arc<MockDriver>;
pub type SharedMockScopeDriver = Arc<MockScopeDriver>;
