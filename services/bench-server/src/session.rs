//! DeviceSession (spec.md §4.3): owns one PSU/load driver, polls it at a
//! fixed cadence, debounces setpoint writes and fans out state deltas.
//!
//! Grounded on the corpus's actor-ish ownership rule ("session state is
//! mutated only from the session's own scheduling context... external
//! callers enqueue work"): a dedicated `tokio::task` owns all mutable
//! state and is reached only through a `mpsc` command channel, the same
//! shape as `ForwarderCommand`/`ForwarderCommandSenders` in
//! `services/server/src/state.rs`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::warn;

use bench_core::device::{DeviceCapabilities, DeviceClass, DeviceInfo};
use bench_core::state::{ConnectionStatus, DeviceSessionState};
use bench_driver::{Driver, DriverError};
use bench_protocol::{DeviceStateSnapshot, MeasurementUpdate, ServerMessage};

use crate::config::PollConfig;
use crate::fanout::Subscriber;

type ClientId = u64;

enum Command {
    Subscribe {
        client_id: ClientId,
        sink: Subscriber,
        respond: oneshot::Sender<DeviceStateSnapshot>,
    },
    Unsubscribe {
        client_id: ClientId,
    },
    SetMode {
        mode: String,
        respond: oneshot::Sender<Result<(), DriverError>>,
    },
    SetOutput {
        enabled: bool,
        respond: oneshot::Sender<Result<(), DriverError>>,
    },
    SetValue {
        name: String,
        value: f64,
        immediate: bool,
        respond: oneshot::Sender<Result<(), DriverError>>,
    },
    Reconnect {
        respond: oneshot::Sender<()>,
    },
    GetState {
        respond: oneshot::Sender<DeviceSessionState>,
    },
    Stop,
}

/// A cheap, cloneable reference to a running `DeviceSession`. Routing
/// metadata (`info`/`capabilities`) is immutable after session creation
/// (spec.md §4.2) so it is cached here rather than round-tripped through
/// the actor for every lookup.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
}

impl SessionHandle {
    pub async fn subscribe(&self, client_id: ClientId, sink: Subscriber) -> DeviceStateSnapshot {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Subscribe { client_id, sink, respond })
            .await;
        rx.await.expect("session actor dropped before responding")
    }

    pub async fn unsubscribe(&self, client_id: ClientId) {
        let _ = self.tx.send(Command::Unsubscribe { client_id }).await;
    }

    pub async fn set_mode(&self, mode: impl Into<String>) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetMode { mode: mode.into(), respond })
            .await;
        rx.await.expect("session actor dropped before responding")
    }

    pub async fn set_output(&self, enabled: bool) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetOutput { enabled, respond }).await;
        rx.await.expect("session actor dropped before responding")
    }

    pub async fn set_value(&self, name: impl Into<String>, value: f64, immediate: bool) -> Result<(), DriverError> {
        let (respond, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetValue {
                name: name.into(),
                value,
                immediate,
                respond,
            })
            .await;
        rx.await.expect("session actor dropped before responding")
    }

    pub async fn reconnect(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Reconnect { respond }).await;
        let _ = rx.await;
    }

    pub async fn get_state(&self) -> DeviceSessionState {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::GetState { respond }).await;
        rx.await.expect("session actor dropped before responding")
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

struct PendingWrite {
    value: f64,
    deadline: Instant,
}

struct Actor {
    driver: Arc<dyn Driver>,
    state: DeviceSessionState,
    subscribers: std::collections::HashMap<ClientId, Subscriber>,
    pending: BTreeMap<String, PendingWrite>,
    poll: PollConfig,
    tick: u32,
}

/// Spawn a `DeviceSession` actor task and return a handle to it.
pub fn spawn(driver: Arc<dyn Driver>, info: DeviceInfo, capabilities: DeviceCapabilities, poll: PollConfig) -> SessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let history_capacity = poll.history_retention_ticks;
    let state = DeviceSessionState::new(info.clone(), capabilities.clone(), history_capacity);
    let actor = Actor {
        driver,
        state,
        subscribers: std::collections::HashMap::new(),
        pending: BTreeMap::new(),
        poll,
        tick: 0,
    };
    tokio::spawn(actor.run(rx));
    SessionHandle { tx, info, capabilities }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut poll_timer = tokio::time::interval(self.poll.interval());
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let debounce_sleep = self.next_debounce_sleep();
            tokio::select! {
                _ = poll_timer.tick() => {
                    self.poll_tick().await;
                }
                () = debounce_sleep => {
                    self.flush_due_setpoints().await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
            }
        }
        for sink in self.subscribers.values() {
            sink.close();
        }
    }

    fn next_debounce_sleep(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        match self.pending.values().map(|p| p.deadline).min() {
            Some(deadline) => Box::pin(tokio::time::sleep_until(deadline)),
            None => Box::pin(std::future::pending()),
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { client_id, sink, respond } => {
                let snapshot = snapshot_of(&self.state);
                self.subscribers.insert(client_id, sink);
                let _ = respond.send(snapshot);
            }
            Command::Unsubscribe { client_id } => {
                if let Some(sink) = self.subscribers.remove(&client_id) {
                    sink.close();
                }
            }
            Command::SetMode { mode, respond } => {
                // Changing an electronic load's mode while its output is live
                // can drive an uncontrolled transient (spec.md §8, S2), so
                // the output is dropped first and the client sees that as its
                // own field update before the mode change lands.
                if self.state.capabilities.device_class == DeviceClass::Load && self.state.output_enabled {
                    if let Err(err) = self.driver.set_output(false).await {
                        let _ = respond.send(Err(err));
                        return;
                    }
                    self.state.set_output_enabled(false);
                    self.broadcast_field("outputEnabled", serde_json::json!(false)).await;
                }

                let result = self.driver.set_mode(&mode).await;
                if result.is_ok() {
                    self.state.set_mode(mode.clone());
                    self.broadcast_field("mode", serde_json::json!(mode)).await;
                }
                let _ = respond.send(result);
            }
            Command::SetOutput { enabled, respond } => {
                let result = self.driver.set_output(enabled).await;
                if result.is_ok() {
                    self.state.set_output_enabled(enabled);
                    self.broadcast_field("outputEnabled", serde_json::json!(enabled)).await;
                }
                let _ = respond.send(result);
            }
            Command::SetValue { name, value, immediate, respond } => {
                if immediate {
                    let result = self.driver.set_value(&name, value).await;
                    if result.is_ok() {
                        self.state.set_setpoint(name.clone(), value);
                        self.pending.remove(&name);
                        self.broadcast_setpoints().await;
                    }
                    let _ = respond.send(result);
                } else {
                    let deadline = Instant::now() + self.poll.debounce();
                    self.pending.insert(name, PendingWrite { value, deadline });
                    let _ = respond.send(Ok(()));
                }
            }
            Command::Reconnect { respond } => {
                self.poll_tick().await;
                let _ = respond.send(());
            }
            Command::GetState { respond } => {
                let _ = respond.send(self.state.clone());
            }
            Command::Stop => {}
        }
    }

    async fn poll_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        match self.driver.read_measurements().await {
            Ok(measurements) => {
                let now = crate::persistence::now_ms();
                let recovered = self.state.record_poll_success(now, measurements.clone());
                if recovered {
                    self.broadcast_field("connectionStatus", serde_json::json!("connected")).await;
                }
                self.broadcast(ServerMessage::Measurement {
                    device_id: self.state.info.id.clone(),
                    update: MeasurementUpdate { timestamp: now, measurements },
                })
                .await;
            }
            Err(err) => {
                warn!(device_id = %self.state.info.id, error = %err, "poll failed");
                if self.state.record_poll_failure(self.poll.error_threshold) {
                    self.broadcast_field("connectionStatus", serde_json::json!("disconnected")).await;
                }
                return;
            }
        }

        if self.tick % self.poll.status_refresh_ticks.max(1) == 0 {
            self.refresh_status_fields().await;
        }
    }

    async fn refresh_status_fields(&mut self) {
        let Ok(fields) = self.driver.read_status_fields().await else {
            return;
        };
        if self.state.mode.as_deref() != Some(fields.mode.as_str()) {
            self.state.set_mode(fields.mode.clone());
            self.broadcast_field("mode", serde_json::json!(fields.mode)).await;
        }
        if self.state.output_enabled != fields.output_enabled {
            self.state.set_output_enabled(fields.output_enabled);
            self.broadcast_field("outputEnabled", serde_json::json!(fields.output_enabled))
                .await;
        }
        if self.state.setpoints != fields.setpoints {
            self.state.setpoints = fields.setpoints;
            self.broadcast_setpoints().await;
        }
    }

    async fn flush_due_setpoints(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            let Some(pending) = self.pending.remove(&name) else { continue };
            match self.driver.set_value(&name, pending.value).await {
                Ok(()) => {
                    self.state.set_setpoint(name, pending.value);
                    self.broadcast_setpoints().await;
                }
                Err(err) => {
                    warn!(device_id = %self.state.info.id, %name, error = %err, "debounced setpoint write failed");
                }
            }
        }
    }

    async fn broadcast_field(&self, field: &str, value: serde_json::Value) {
        self.broadcast(ServerMessage::Field {
            device_id: self.state.info.id.clone(),
            field: field.to_owned(),
            value,
        })
        .await;
    }

    async fn broadcast_setpoints(&self) {
        self.broadcast_field("setpoints", serde_json::to_value(&self.state.setpoints).unwrap())
            .await;
    }

    async fn broadcast(&self, msg: ServerMessage) {
        for sink in self.subscribers.values() {
            sink.send(msg.clone()).await;
        }
    }
}

pub fn snapshot_of(state: &DeviceSessionState) -> DeviceStateSnapshot {
    DeviceStateSnapshot {
        connection_status: connection_status_str(state.status).to_owned(),
        mode: state.mode.clone(),
        output_enabled: state.output_enabled,
        setpoints: state.setpoints.clone(),
        measurements: state.measurements.clone(),
    }
}

fn connection_status_str(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Error => "error",
        ConnectionStatus::Disconnected => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_test_support::fixtures::{load_capabilities, load_info, psu_capabilities, psu_info};
    use bench_test_support::mock_driver::MockDriver;
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
    async fn subscribe_receives_initial_snapshot_then_measurement_updates() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        driver.set_measurements(BTreeMap::from([("voltage".into(), 12.0)])).await;
        let handle = spawn(driver, psu_info(), psu_capabilities(), poll_cfg());

        let sink = Subscriber::new();
        let snapshot = handle.subscribe(1, sink.clone()).await;
        assert_eq!(snapshot.connection_status, "connected");

        advance(Duration::from_millis(15)).await;
        let msg = sink.recv().await.expect("measurement expected");
        match msg {
            ServerMessage::Measurement { update, .. } => assert_eq!(update.measurements["voltage"], 12.0),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_setvalue_coalesces_to_last_value() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        let handle = spawn(driver.clone(), psu_info(), psu_capabilities(), poll_cfg());

        for v in [12.00, 12.01, 12.02, 12.03, 12.04] {
            handle.set_value("voltage", v, false).await.unwrap();
            advance(Duration::from_millis(2)).await;
        }
        advance(Duration::from_millis(30)).await;

        let calls = driver.calls().await;
        let writes: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                bench_test_support::mock_driver::RecordedCall::SetValue(name, value) if name == "voltage" => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![12.04]);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_setvalue_bypasses_debounce() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        let handle = spawn(driver.clone(), psu_info(), psu_capabilities(), poll_cfg());

        handle.set_value("voltage", 5.0, true).await.unwrap();
        handle.set_value("voltage", 6.0, true).await.unwrap();

        let calls = driver.calls().await;
        let writes: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                bench_test_support::mock_driver::RecordedCall::SetValue(name, value) if name == "voltage" => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![5.0, 6.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_latch_disconnected_once() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        driver.set_failing(true);
        let handle = spawn(driver, psu_info(), psu_capabilities(), poll_cfg());

        let sink = Subscriber::new();
        handle.subscribe(1, sink.clone()).await;
        advance(Duration::from_millis(35)).await;

        let msg = sink.recv().await.expect("disconnect field expected");
        match msg {
            ServerMessage::Field { field, value, .. } => {
                assert_eq!(field, "connectionStatus");
                assert_eq!(value, serde_json::json!("disconnected"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_success_after_latched_disconnect_emits_one_connected_edge() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        driver.set_failing(true);
        let handle = spawn(driver.clone(), psu_info(), psu_capabilities(), poll_cfg());

        let sink = Subscriber::new();
        handle.subscribe(1, sink.clone()).await;
        advance(Duration::from_millis(35)).await;
        let msg = sink.recv().await.expect("disconnect field expected");
        assert!(matches!(msg, ServerMessage::Field { ref field, ref value, .. } if field == "connectionStatus" && *value == serde_json::json!("disconnected")));

        driver.set_failing(false);
        advance(Duration::from_millis(15)).await;
        let msg = sink.recv().await.expect("recovery field expected");
        match msg {
            ServerMessage::Field { field, value, .. } => {
                assert_eq!(field, "connectionStatus");
                assert_eq!(value, serde_json::json!("connected"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The latch only fires once: a further successful poll must not
        // repeat the recovery field.
        advance(Duration::from_millis(15)).await;
        let next = tokio::time::timeout(Duration::from_millis(5), sink.recv()).await;
        if let Ok(Some(ServerMessage::Field { field, .. })) = next {
            assert_ne!(field, "connectionStatus", "recovery edge must not repeat");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn changing_a_loads_mode_with_output_enabled_drops_output_first() {
        let driver = Arc::new(MockDriver::new(load_info(), load_capabilities()));
        let handle = spawn(driver.clone(), load_info(), load_capabilities(), poll_cfg());

        handle.set_output(true).await.unwrap();
        let sink = Subscriber::new();
        handle.subscribe(1, sink.clone()).await;

        handle.set_mode("CV").await.unwrap();

        let first = sink.recv().await.expect("outputEnabled field expected");
        assert!(matches!(first, ServerMessage::Field { ref field, ref value, .. } if field == "outputEnabled" && *value == serde_json::json!(false)));
        let second = sink.recv().await.expect("mode field expected");
        assert!(matches!(second, ServerMessage::Field { ref field, ref value, .. } if field == "mode" && *value == serde_json::json!("CV")));

        let calls = driver.calls().await;
        let relevant: Vec<_> = calls
            .into_iter()
            .filter(|c| matches!(c, bench_test_support::mock_driver::RecordedCall::SetOutput(_) | bench_test_support::mock_driver::RecordedCall::SetMode(_)))
            .collect();
        assert_eq!(
            relevant,
            vec![
                bench_test_support::mock_driver::RecordedCall::SetOutput(false),
                bench_test_support::mock_driver::RecordedCall::SetMode("CV".into()),
            ]
        );
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_sink() {
        let driver = Arc::new(MockDriver::new(psu_info(), psu_capabilities()));
        let handle = spawn(driver, psu_info(), psu_capabilities(), poll_cfg());
        let sink = Subscriber::new();
        handle.subscribe(7, sink.clone()).await;
        handle.unsubscribe(7).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sink.recv().await, None);
    }
}
