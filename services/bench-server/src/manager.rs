//! SessionManager (spec.md §4.5): reconciles discovered devices against a
//! live session registry, routes client verbs to the right session, and
//! tracks per-device subscriber sets.
//!
//! Grounded on `state.rs`'s `BroadcastRegistry`/`ForwarderCommandSenders`
//! pattern: a lock protects only the registry map itself, and the session
//! references it hands out carry their own internal synchronization
//! (spec.md §5: "session references obtained through it are immutable
//! pointers with their own internal synchronization").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use bench_core::device::{DeviceInfo, DeviceType};
use bench_core::scope::ChannelConfig;
use bench_core::state::{ConnectionStatus, DeviceSessionState};
use bench_driver::{catalog, parse_idn_reply, Driver, DriverError, ScopeDriver, ScpiDriver, Transport};
use bench_protocol::{DeviceListEntry, DeviceStateSnapshot};

use crate::config::PollConfig;
use crate::discovery::PortOpener;
use crate::fanout::Subscriber;
use crate::scope_session::{self, ScopeSessionHandle};
use crate::session::{self, SessionHandle};

type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    DeviceNotFound,
    WrongDeviceType,
}

/// What a freshly identified device needs in order to be registered: a
/// driver plus the device type so the manager knows which registry it
/// belongs in.
pub enum NewDevice {
    Instrument {
        driver: Arc<dyn Driver>,
        device_type: DeviceType,
    },
    Oscilloscope {
        driver: Arc<dyn ScopeDriver>,
    },
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    scope_sessions: RwLock<HashMap<String, ScopeSessionHandle>>,
    subscribed_clients: RwLock<HashMap<String, HashSet<ClientId>>>,
    poll: PollConfig,
}

impl SessionManager {
    pub fn new(poll: PollConfig) -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            scope_sessions: RwLock::new(HashMap::new()),
            subscribed_clients: RwLock::new(HashMap::new()),
            poll,
        }
    }

    /// Register a newly identified device and start its session. Devices
    /// already known by this id are left untouched — call `reconnect`
    /// instead (spec.md §4.5: "physical reappearance reopens the
    /// transport without renaming the deviceId").
    pub async fn register(&self, device_id: &str, info: bench_core::device::DeviceInfo, capabilities: bench_core::device::DeviceCapabilities, device: NewDevice) {
        match device {
            NewDevice::Instrument { driver, .. } => {
                if self.sessions.read().await.contains_key(device_id) {
                    return;
                }
                let handle = session::spawn(driver, info, capabilities, self.poll);
                self.sessions.write().await.insert(device_id.to_owned(), handle);
            }
            NewDevice::Oscilloscope { driver } => {
                if self.scope_sessions.read().await.contains_key(device_id) {
                    return;
                }
                let handle = scope_session::spawn(driver, info, capabilities, self.poll);
                self.scope_sessions.write().await.insert(device_id.to_owned(), handle);
            }
        }
    }

    /// Devices no longer seen in a discovery scan are left registered —
    /// their sessions keep polling, and the existing consecutive-failure
    /// latch in `session::Actor::poll_tick` is what actually surfaces the
    /// disconnected status (spec.md §4.5/§9: "never destroy entries on
    /// missing-from-scan, only toggle a status flag").
    pub async fn known_device_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.sessions.read().await.keys().cloned().collect();
        ids.extend(self.scope_sessions.read().await.keys().cloned());
        ids
    }

    pub async fn reconnect(&self, device_id: &str) -> Result<(), RoutingError> {
        if let Some(handle) = self.sessions.read().await.get(device_id) {
            handle.reconnect().await;
            return Ok(());
        }
        Err(RoutingError::DeviceNotFound)
    }

    /// Discovery reconciliation (spec.md §4.5 `syncDevices`): probe every
    /// candidate port, register newly identified instruments, and nudge
    /// already-known ones with `reconnect`. A port that fails to open,
    /// fails to answer `*IDN?`, or identifies as something outside
    /// `bench_driver::catalog` is skipped with a warning — skipped, not
    /// destroyed, matching spec.md §9's "never destroy entries on
    /// missing-from-scan" rule for the rest of the registry too.
    pub async fn sync_devices(&self, candidate_ports: &[String], opener: &dyn PortOpener) {
        let known = self.known_device_ids().await;
        for port in candidate_ports {
            let link = match opener.open(port).await {
                Ok(link) => link,
                Err(err) => {
                    warn!(port = %port, error = %err, "discovery: failed to open candidate port");
                    continue;
                }
            };
            let transport = Arc::new(Transport::new(link));
            let reply = match transport.query("*IDN?").await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(port = %port, error = %err, "discovery: *IDN? probe failed");
                    continue;
                }
            };
            let (manufacturer, model, serial) = parse_idn_reply(&reply);
            let Some(entry) = catalog::lookup(&manufacturer, &model) else {
                warn!(port = %port, %manufacturer, %model, "discovery: unrecognized instrument");
                continue;
            };
            let info = DeviceInfo::new(entry.device_type, manufacturer, model, serial);

            if known.contains(&info.id) {
                let _ = self.reconnect(&info.id).await;
                continue;
            }

            let driver: Arc<dyn Driver> = Arc::new(ScpiDriver::new(transport, entry.dialect, entry.device_type, entry.capabilities.clone()));
            self.register(
                &info.id.clone(),
                info,
                entry.capabilities,
                NewDevice::Instrument { driver, device_type: entry.device_type },
            )
            .await;
        }
    }

    pub async fn device_list(&self) -> Vec<DeviceListEntry> {
        let mut entries = Vec::new();
        for handle in self.sessions.read().await.values() {
            entries.push(DeviceListEntry {
                info: handle.info.clone(),
                capabilities: handle.capabilities.clone(),
                alias: None,
            });
        }
        for handle in self.scope_sessions.read().await.values() {
            entries.push(DeviceListEntry {
                info: handle.info.clone(),
                capabilities: handle.capabilities.clone(),
                alias: None,
            });
        }
        entries.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        entries
    }

    pub async fn device_type_of(&self, device_id: &str) -> Option<DeviceType> {
        if let Some(handle) = self.sessions.read().await.get(device_id) {
            return Some(handle.info.device_type);
        }
        if let Some(handle) = self.scope_sessions.read().await.get(device_id) {
            return Some(handle.info.device_type);
        }
        None
    }

    pub async fn subscribe(&self, device_id: &str, client_id: ClientId, sink: Subscriber) -> Result<DeviceStateSnapshot, RoutingError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or(RoutingError::DeviceNotFound)?;
        let snapshot = handle.subscribe(client_id, sink).await;
        self.subscribed_clients
            .write()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .insert(client_id);
        Ok(snapshot)
    }

    pub async fn scope_subscribe(&self, device_id: &str, client_id: ClientId, sink: Subscriber) -> Result<bench_core::scope::OscilloscopeStatus, RoutingError> {
        let handle = self
            .scope_sessions
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or(RoutingError::DeviceNotFound)?;
        let status = handle.subscribe(client_id, sink).await;
        self.subscribed_clients
            .write()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .insert(client_id);
        Ok(status)
    }

    pub async fn unsubscribe(&self, device_id: &str, client_id: ClientId) {
        if let Some(handle) = self.sessions.read().await.get(device_id) {
            handle.unsubscribe(client_id).await;
        }
        if let Some(handle) = self.scope_sessions.read().await.get(device_id) {
            handle.unsubscribe(client_id).await;
        }
        if let Some(set) = self.subscribed_clients.write().await.get_mut(device_id) {
            set.remove(&client_id);
        }
    }

    /// Called on client disconnect (spec.md §4.5, S6): removes the client
    /// from every device it was subscribed to.
    pub async fn unsubscribe_all(&self, client_id: ClientId) {
        let device_ids: Vec<String> = self.subscribed_clients.read().await.keys().cloned().collect();
        for device_id in device_ids {
            self.unsubscribe(&device_id, client_id).await;
        }
    }

    pub async fn set_mode(&self, device_id: &str, mode: &str) -> Result<(), RoutingOrDriverError> {
        let handle = self.instrument(device_id).await?;
        handle.set_mode(mode).await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn set_output(&self, device_id: &str, enabled: bool) -> Result<(), RoutingOrDriverError> {
        let handle = self.instrument(device_id).await?;
        handle.set_output(enabled).await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn set_value(&self, device_id: &str, name: &str, value: f64, immediate: bool) -> Result<(), RoutingOrDriverError> {
        let handle = self.instrument(device_id).await?;
        handle.set_value(name, value, immediate).await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_run(&self, device_id: &str) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id).await?.run().await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_stop(&self, device_id: &str) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id).await?.stop().await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_single(&self, device_id: &str) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id).await?.single().await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_auto_setup(&self, device_id: &str) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id).await?.auto_setup().await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_get_waveform(&self, device_id: &str, channel: &str) -> Result<bench_core::scope::WaveformData, RoutingOrDriverError> {
        self.scope(device_id)
            .await?
            .get_waveform(channel)
            .await
            .map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_get_measurement(&self, device_id: &str, channel: &str, measurement_type: &str) -> Result<f64, RoutingOrDriverError> {
        self.scope(device_id)
            .await?
            .get_measurement(channel, measurement_type)
            .await
            .map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_get_screenshot(&self, device_id: &str) -> Result<Vec<u8>, RoutingOrDriverError> {
        self.scope(device_id).await?.get_screenshot().await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_set_channel(&self, device_id: &str, channel: &str, config: ChannelConfig) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id)
            .await?
            .set_channel(channel, config)
            .await
            .map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_set_timebase(&self, device_id: &str, seconds_per_div: f64) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id)
            .await?
            .set_timebase(seconds_per_div)
            .await
            .map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_set_trigger(&self, device_id: &str, spec: serde_json::Value) -> Result<(), RoutingOrDriverError> {
        self.scope(device_id).await?.set_trigger(spec).await.map_err(RoutingOrDriverError::Driver)
    }

    pub async fn scope_start_streaming(&self, device_id: &str, channels: Vec<String>, interval_ms: u64, measurements: Option<Vec<String>>) -> Result<(), RoutingError> {
        self.scope(device_id).await?.start_streaming(channels, interval_ms, measurements).await;
        Ok(())
    }

    pub async fn scope_stop_streaming(&self, device_id: &str) -> Result<(), RoutingError> {
        self.scope(device_id).await?.stop_streaming().await;
        Ok(())
    }

    pub async fn session_state(&self, device_id: &str) -> Option<DeviceSessionState> {
        let handle = self.sessions.read().await.get(device_id).cloned()?;
        Some(handle.get_state().await)
    }

    pub async fn connection_status(&self, device_id: &str) -> Option<ConnectionStatus> {
        Some(self.session_state(device_id).await?.status)
    }

    async fn instrument(&self, device_id: &str) -> Result<SessionHandle, RoutingOrDriverError> {
        self.sessions
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or(RoutingOrDriverError::Routing(RoutingError::DeviceNotFound))
    }

    async fn scope(&self, device_id: &str) -> Result<ScopeSessionHandle, RoutingError> {
        self.scope_sessions
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or(RoutingError::DeviceNotFound)
    }

    /// Aborts every session's background tasks and closes out its
    /// subscribers (spec.md §4.5: "aborts polling timers... clears
    /// subscribers").
    pub async fn stop(&self) {
        for handle in self.sessions.write().await.drain().map(|(_, h)| h).collect::<Vec<_>>() {
            handle.stop().await;
        }
        for handle in self.scope_sessions.write().await.drain().map(|(_, h)| h).collect::<Vec<_>>() {
            handle.stop_session().await;
        }
        self.subscribed_clients.write().await.clear();
    }
}

impl From<RoutingError> for RoutingOrDriverError {
    fn from(e: RoutingError) -> Self {
        RoutingOrDriverError::Routing(e)
    }
}

#[derive(Debug, Error)]
pub enum RoutingOrDriverError {
    #[error("device not found")]
    Routing(RoutingError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::device::DeviceType;
    use bench_test_support::fixtures::{psu_capabilities, psu_info};
    use bench_test_support::mock_driver::MockDriver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::discovery::test_support::StubPortOpener;

    fn poll_cfg() -> PollConfig {
        PollConfig {
            interval_ms: 1000,
            debounce_ms: 20,
            error_threshold: 3,
            history_retention_ticks: 64,
            status_refresh_ticks: 1000,
        }
    }

    #[tokio::test]
    async fn routing_to_unknown_device_fails_with_device_not_found() {
        let manager = SessionManager::new(poll_cfg());
        let err = manager.set_mode("missing", "CV").await.unwrap_err();
        assert!(matches!(err, RoutingOrDriverError::Routing(RoutingError::DeviceNotFound)));
    }

    #[tokio::test]
    async fn registered_device_appears_in_device_list_and_accepts_routed_calls() {
        let manager = SessionManager::new(poll_cfg());
        let info = psu_info();
        let driver = Arc::new(MockDriver::new(info.clone(), psu_capabilities()));
        manager
            .register(
                &info.id,
                info.clone(),
                psu_capabilities(),
                NewDevice::Instrument { driver, device_type: DeviceType::PowerSupply },
            )
            .await;

        let list = manager.device_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].info.id, info.id);

        manager.set_output(&info.id, true).await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_all_detaches_client_from_every_device() {
        let manager = SessionManager::new(poll_cfg());
        let info = psu_info();
        let driver = Arc::new(MockDriver::new(info.clone(), psu_capabilities()));
        manager
            .register(
                &info.id,
                info.clone(),
                psu_capabilities(),
                NewDevice::Instrument { driver, device_type: DeviceType::PowerSupply },
            )
            .await;

        let sink = Subscriber::new();
        manager.subscribe(&info.id, 1, sink.clone()).await.unwrap();
        manager.unsubscribe_all(1).await;

        // A second subscribe under a fresh sink must still work — the
        // session itself was never torn down, only the one client's link.
        let other_sink = Subscriber::new();
        manager.subscribe(&info.id, 2, other_sink).await.unwrap();
        drop(sink);
    }

    #[tokio::test]
    async fn sync_devices_registers_a_newly_identified_instrument() {
        let manager = SessionManager::new(poll_cfg());
        let opener = StubPortOpener::new();
        let mut server = opener.wire("/dev/ttyUSB0").await;

        let probe = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            server.write_all(b"Keysight,E36313A,MY1\n").await.unwrap();
        });

        manager.sync_devices(&["/dev/ttyUSB0".to_owned()], &opener).await;
        probe.await.unwrap();

        let list = manager.device_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].info.manufacturer, "Keysight");
        assert_eq!(list[0].info.model, "E36313A");
    }

    #[tokio::test]
    async fn sync_devices_skips_an_unrecognized_instrument() {
        let manager = SessionManager::new(poll_cfg());
        let opener = StubPortOpener::new();
        let mut server = opener.wire("/dev/ttyUSB0").await;

        let probe = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            server.write_all(b"Acme,Mystery-1,SN1\n").await.unwrap();
        });

        manager.sync_devices(&["/dev/ttyUSB0".to_owned()], &opener).await;
        probe.await.unwrap();

        assert!(manager.device_list().await.is_empty());
    }

    #[tokio::test]
    async fn sync_devices_reconnects_rather_than_duplicates_a_known_device() {
        let manager = SessionManager::new(poll_cfg());
        let info = psu_info();
        let driver = Arc::new(MockDriver::new(info.clone(), psu_capabilities()));
        manager
            .register(
                &info.id,
                info.clone(),
                psu_capabilities(),
                NewDevice::Instrument { driver, device_type: DeviceType::PowerSupply },
            )
            .await;

        let opener = StubPortOpener::new();
        let mut server = opener.wire("/dev/ttyUSB0").await;
        let probe = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            server.write_all(b"Keysight,E36313A,MY1\n").await.unwrap();
        });

        manager.sync_devices(&["/dev/ttyUSB0".to_owned()], &opener).await;
        probe.await.unwrap();

        assert_eq!(manager.device_list().await.len(), 1, "a reappearing device must not duplicate its session");
    }
}
