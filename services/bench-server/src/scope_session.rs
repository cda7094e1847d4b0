//! OscilloscopeSession (spec.md §4.4): same actor shape as `DeviceSession`,
//! but the baseline poll reads condensed `OscilloscopeStatus` instead of
//! measurement samples, and waveform/measurement/screenshot acquisitions
//! are on-demand calls plus an optional cancelable streaming timer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use bench_core::device::{DeviceCapabilities, DeviceInfo};
use bench_core::scope::ChannelConfig;
use bench_driver::{DriverError, ScopeDriver};
use bench_protocol::ServerMessage;

use crate::config::PollConfig;
use crate::fanout::Subscriber;

type ClientId = u64;
type Reply<T> = oneshot::Sender<Result<T, DriverError>>;

enum Command {
    Subscribe {
        client_id: ClientId,
        sink: Subscriber,
        respond: oneshot::Sender<bench_core::scope::OscilloscopeStatus>,
    },
    Unsubscribe {
        client_id: ClientId,
    },
    Run(Reply<()>),
    Stop(Reply<()>),
    Single(Reply<()>),
    AutoSetup(Reply<()>),
    GetWaveform {
        channel: String,
        respond: Reply<bench_core::scope::WaveformData>,
    },
    GetMeasurement {
        channel: String,
        measurement_type: String,
        respond: Reply<f64>,
    },
    GetScreenshot(Reply<Vec<u8>>),
    SetChannel {
        channel: String,
        config: ChannelConfig,
        respond: Reply<()>,
    },
    SetTimebase {
        seconds_per_div: f64,
        respond: Reply<()>,
    },
    SetTrigger {
        spec: serde_json::Value,
        respond: Reply<()>,
    },
    StartStreaming {
        channels: Vec<String>,
        interval_ms: u64,
        measurements: Option<Vec<String>>,
    },
    StopStreaming,
    Shutdown,
}

#[derive(Clone)]
pub struct ScopeSessionHandle {
    tx: mpsc::Sender<Command>,
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
}

impl ScopeSessionHandle {
    pub async fn subscribe(&self, client_id: ClientId, sink: Subscriber) -> bench_core::scope::OscilloscopeStatus {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Subscribe { client_id, sink, respond }).await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn unsubscribe(&self, client_id: ClientId) {
        let _ = self.tx.send(Command::Unsubscribe { client_id }).await;
    }

    pub async fn run(&self) -> Result<(), DriverError> {
        self.call(Command::Run).await
    }

    pub async fn stop(&self) -> Result<(), DriverError> {
        self.call(Command::Stop).await
    }

    pub async fn single(&self) -> Result<(), DriverError> {
        self.call(Command::Single).await
    }

    pub async fn auto_setup(&self) -> Result<(), DriverError> {
        self.call(Command::AutoSetup).await
    }

    pub async fn get_waveform(&self, channel: impl Into<String>) -> Result<bench_core::scope::WaveformData, DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::GetWaveform { channel: channel.into(), respond })
            .await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn get_measurement(&self, channel: impl Into<String>, measurement_type: impl Into<String>) -> Result<f64, DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::GetMeasurement {
                channel: channel.into(),
                measurement_type: measurement_type.into(),
                respond,
            })
            .await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn get_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.call(Command::GetScreenshot).await
    }

    pub async fn set_channel(&self, channel: impl Into<String>, config: ChannelConfig) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetChannel { channel: channel.into(), config, respond })
            .await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn set_timebase(&self, seconds_per_div: f64) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetTimebase { seconds_per_div, respond }).await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn set_trigger(&self, spec: serde_json::Value) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetTrigger { spec, respond }).await;
        rx.await.expect("scope session actor dropped")
    }

    pub async fn start_streaming(&self, channels: Vec<String>, interval_ms: u64, measurements: Option<Vec<String>>) {
        let _ = self
            .tx
            .send(Command::StartStreaming { channels, interval_ms, measurements })
            .await;
    }

    pub async fn stop_streaming(&self) {
        let _ = self.tx.send(Command::StopStreaming).await;
    }

    pub async fn stop_session(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(make(respond)).await;
        rx.await.expect("scope session actor dropped")
    }
}

struct StreamState {
    channels: Vec<String>,
    measurements: Option<Vec<String>>,
    interval: tokio::time::Interval,
}

struct Actor {
    driver: Arc<dyn ScopeDriver>,
    device_id: String,
    subscribers: HashMap<ClientId, Subscriber>,
    poll: PollConfig,
    stream: Option<StreamState>,
}

pub fn spawn(driver: Arc<dyn ScopeDriver>, info: DeviceInfo, capabilities: DeviceCapabilities, poll: PollConfig) -> ScopeSessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let actor = Actor {
        driver,
        device_id: info.id.clone(),
        subscribers: HashMap::new(),
        poll,
        stream: None,
    };
    tokio::spawn(actor.run(rx));
    ScopeSessionHandle { tx, info, capabilities }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut poll_timer = tokio::time::interval(self.poll.interval());
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    self.poll_tick().await;
                }
                _ = await_stream_tick(&mut self.stream) => {
                    self.stream_tick().await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
            }
        }
        for sink in self.subscribers.values() {
            sink.close();
        }
    }

    async fn poll_tick(&mut self) {
        match self.driver.read_status().await {
            Ok(status) => {
                self.broadcast(ServerMessage::ScopeStatusUpdate {
                    device_id: self.device_id.clone(),
                    status,
                })
                .await;
            }
            Err(err) => warn!(device_id = %self.device_id, error = %err, "scope status poll failed"),
        }
    }

    async fn stream_tick(&mut self) {
        let Some(stream) = self.stream.as_ref() else { return };
        let channels = stream.channels.clone();
        let measurements = stream.measurements.clone();
        for channel in &channels {
            if let Ok(waveform) = self.driver.get_waveform(channel).await {
                self.broadcast(ServerMessage::ScopeWaveform {
                    device_id: self.device_id.clone(),
                    waveform,
                })
                .await;
            }
        }
        if let Some(types) = measurements {
            for channel in &channels {
                for measurement_type in &types {
                    if let Ok(value) = self.driver.get_measurement(channel, measurement_type).await {
                        self.broadcast(ServerMessage::ScopeMeasurement {
                            device_id: self.device_id.clone(),
                            channel: channel.clone(),
                            measurement_type: measurement_type.clone(),
                            value,
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { client_id, sink, respond } => {
                let status = self.driver.read_status().await.unwrap_or_else(|_| default_status());
                self.subscribers.insert(client_id, sink);
                let _ = respond.send(status);
            }
            Command::Unsubscribe { client_id } => {
                if let Some(sink) = self.subscribers.remove(&client_id) {
                    sink.close();
                }
                self.stream = None;
            }
            Command::Run(respond) => {
                let _ = respond.send(self.driver.run().await);
            }
            Command::Stop(respond) => {
                let _ = respond.send(self.driver.stop().await);
            }
            Command::Single(respond) => {
                let _ = respond.send(self.driver.single().await);
            }
            Command::AutoSetup(respond) => {
                let _ = respond.send(self.driver.auto_setup().await);
            }
            Command::GetWaveform { channel, respond } => {
                let _ = respond.send(self.driver.get_waveform(&channel).await);
            }
            Command::GetMeasurement { channel, measurement_type, respond } => {
                let _ = respond.send(self.driver.get_measurement(&channel, &measurement_type).await);
            }
            Command::GetScreenshot(respond) => {
                let _ = respond.send(self.driver.get_screenshot().await);
            }
            Command::SetChannel { channel, config, respond } => {
                let _ = respond.send(self.driver.set_channel(&channel, config).await);
            }
            Command::SetTimebase { seconds_per_div, respond } => {
                let _ = respond.send(self.driver.set_timebase(seconds_per_div).await);
            }
            Command::SetTrigger { spec, respond } => {
                let _ = respond.send(self.driver.set_trigger(spec).await);
            }
            Command::StartStreaming { channels, interval_ms, measurements } => {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                self.stream = Some(StreamState { channels, measurements, interval });
            }
            Command::StopStreaming => {
                self.stream = None;
            }
            Command::Shutdown => {}
        }
    }

    async fn broadcast(&self, msg: ServerMessage) {
        for sink in self.subscribers.values() {
            sink.send(msg.clone()).await;
        }
    }
}

fn default_status() -> bench_core::scope::OscilloscopeStatus {
    bench_core::scope::OscilloscopeStatus {
        running: false,
        trigger_status: "unknown".into(),
        sample_rate: 0.0,
        memory_depth: 0,
        channels: std::collections::BTreeMap::new(),
        timebase: 0.0,
        trigger: String::new(),
        measurements: std::collections::BTreeMap::new(),
    }
}

/// Awaits the next streaming tick, or pends forever when no stream is active
/// (the `select!` branch is then simply never ready).
async fn await_stream_tick(stream: &mut Option<StreamState>) {
    match stream {
        Some(s) => {
            s.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_test_support::fixtures::{scope_capabilities, scope_info, scope_status};
    use bench_test_support::mock_driver::MockScopeDriver;
    use std::time::Duration;
    use tokio::time::advance;

    fn poll_cfg() -> PollConfig {
        PollConfig {
            interval_ms: 10,
            debounce_ms: 20,
            error_threshold: 3,
            history_retention_ticks: 64,
            status_refresh_ticks: 1000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_then_poll_emits_status_updates() {
        let driver = Arc::new(MockScopeDriver::new(scope_info(), scope_capabilities(), scope_status()));
        let handle = spawn(driver, scope_info(), scope_capabilities(), poll_cfg());
        let sink = Subscriber::new();
        handle.subscribe(1, sink.clone()).await;

        advance(Duration::from_millis(15)).await;
        let msg = sink.recv().await.expect("status update expected");
        assert!(matches!(msg, ServerMessage::ScopeStatusUpdate { .. }));
    }

    #[tokio::test]
    async fn on_demand_waveform_acquisition_round_trips() {
        let driver = Arc::new(MockScopeDriver::new(scope_info(), scope_capabilities(), scope_status()));
        driver
            .set_waveform(bench_core::scope::WaveformData {
                channel: "CHAN1".into(),
                points: vec![0.0, 1.0, 0.0],
                x_increment: 1e-6,
                x_origin: 0.0,
                y_increment: 0.01,
                y_origin: 0.0,
                y_reference: 0.0,
            })
            .await;
        let handle = spawn(driver, scope_info(), scope_capabilities(), poll_cfg());
        let waveform = handle.get_waveform("CHAN1").await.unwrap();
        assert_eq!(waveform.points.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_a_new_stream_replaces_the_previous_one() {
        let driver = Arc::new(MockScopeDriver::new(scope_info(), scope_capabilities(), scope_status()));
        driver
            .set_waveform(bench_core::scope::WaveformData {
                channel: "CHAN1".into(),
                points: vec![1.0],
                x_increment: 1.0,
                x_origin: 0.0,
                y_increment: 1.0,
                y_origin: 0.0,
                y_reference: 0.0,
            })
            .await;
        let handle = spawn(driver, scope_info(), scope_capabilities(), poll_cfg());
        handle.start_streaming(vec!["CHAN1".into()], 5, None).await;
        handle.start_streaming(vec!["CHAN1".into()], 5, None).await;
        advance(Duration::from_millis(20)).await;
        // No panic / deadlock means the first stream's timer was dropped cleanly.
    }

    #[tokio::test]
    async fn unsubscribe_stops_active_stream() {
        let driver = Arc::new(MockScopeDriver::new(scope_info(), scope_capabilities(), scope_status()));
        let handle = spawn(driver, scope_info(), scope_capabilities(), poll_cfg());
        let sink = Subscriber::new();
        handle.subscribe(1, sink.clone()).await;
        handle.start_streaming(vec!["CHAN1".into()], 5, None).await;
        handle.unsubscribe(1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sink.recv().await, None);
    }
}
