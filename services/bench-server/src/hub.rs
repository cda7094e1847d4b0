//! ClientHub (spec.md §4.8): dispatch table from `ClientMessage` to
//! `SessionManager`/`SequenceEngine`/`TriggerScriptEngine`/persistence, plus
//! the broadcast registry used to fan `deviceList`/engine-event frames out
//! to every connected client.
//!
//! Grounded on the corpus's one-struct-per-request-kind dispatcher
//! (`services/receiver/src/session.rs`'s message loop): `dispatch` takes one
//! `ClientMessage` and returns the frames destined for *that* caller. A
//! successful verb that changes visible device state (`setMode`,
//! `setOutput`, `setValue`, the scope setters) emits nothing here — the
//! change already reaches every subscriber through the session's own
//! broadcast, so echoing it back here would double-deliver it to the
//! caller if they're also subscribed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use bench_core::device::DeviceType;
use bench_protocol::{error_codes, ClientMessage, DeviceListEntry, ServerMessage, SettingsDocument};

use crate::discovery::PortOpener;
use crate::fanout::Subscriber;
use crate::manager::{RoutingOrDriverError, SessionManager};
use crate::persistence::{AliasStore, Db, PersistenceError};
use crate::sequence_engine::{EngineError as SequenceEngineError, SequenceEngineHandle};
use crate::trigger_engine::{EngineError as TriggerEngineError, TriggerScriptEngineHandle};

pub type ClientId = u64;

pub struct ClientHub {
    manager: Arc<SessionManager>,
    sequence_engine: SequenceEngineHandle,
    trigger_engine: TriggerScriptEngineHandle,
    db: Arc<Db>,
    clients: RwLock<HashMap<ClientId, Subscriber>>,
    candidate_ports: Vec<String>,
    opener: Arc<dyn PortOpener>,
}

impl ClientHub {
    pub fn new(
        manager: Arc<SessionManager>,
        sequence_engine: SequenceEngineHandle,
        trigger_engine: TriggerScriptEngineHandle,
        db: Arc<Db>,
        candidate_ports: Vec<String>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        ClientHub {
            manager,
            sequence_engine,
            trigger_engine,
            db,
            clients: RwLock::new(HashMap::new()),
            candidate_ports,
            opener,
        }
    }

    /// Registers a newly connected client's sink so it receives
    /// `broadcast_all` frames (device list changes, engine events).
    pub async fn register_client(&self, client_id: ClientId, sink: Subscriber) {
        self.clients.write().await.insert(client_id, sink);
    }

    /// Called on socket close (spec.md §4.8, S6): drops the client's
    /// broadcast registration and detaches it from every device it
    /// subscribed to.
    pub async fn unregister_client(&self, client_id: ClientId) {
        self.clients.write().await.remove(&client_id);
        self.manager.unsubscribe_all(client_id).await;
    }

    pub async fn broadcast_all(&self, msg: ServerMessage) {
        for sink in self.clients.read().await.values() {
            sink.send(msg.clone()).await;
        }
    }

    pub async fn broadcast_device_list(&self) {
        let devices = self.enriched_device_list().await;
        self.broadcast_all(ServerMessage::DeviceList { devices }).await;
    }

    async fn enriched_device_list(&self) -> Vec<DeviceListEntry> {
        let mut devices = self.manager.device_list().await;
        if let Ok(aliases) = AliasStore::new(&self.db).list() {
            for device in &mut devices {
                let idn = bench_core::id::idn_key(&device.info.manufacturer, &device.info.model, device.info.serial.as_deref());
                device.alias = aliases.get(&idn).cloned();
            }
        }
        devices
    }

    /// Dispatch one client frame, returning the frames to send back to the
    /// caller alone (empty when the verb's effect is already covered by a
    /// subscription broadcast or an engine event).
    pub async fn dispatch(&self, client_id: ClientId, sink: &Subscriber, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::GetDevices => vec![ServerMessage::DeviceList { devices: self.enriched_device_list().await }],
            ClientMessage::Scan => {
                self.manager.sync_devices(&self.candidate_ports, self.opener.as_ref()).await;
                vec![ServerMessage::DeviceList { devices: self.enriched_device_list().await }]
            }

            ClientMessage::Subscribe { device_id } => self.handle_subscribe(client_id, sink, device_id).await,
            ClientMessage::Unsubscribe { device_id } => {
                self.manager.unsubscribe(&device_id, client_id).await;
                vec![ServerMessage::Unsubscribed { device_id }]
            }

            ClientMessage::SetMode { device_id, mode } => self.instrument_verb(&device_id, error_codes::SET_MODE_FAILED, self.manager.set_mode(&device_id, &mode)).await,
            ClientMessage::SetOutput { device_id, enabled } => {
                self.instrument_verb(&device_id, error_codes::SET_OUTPUT_FAILED, self.manager.set_output(&device_id, enabled)).await
            }
            ClientMessage::SetValue(req) => {
                self.instrument_verb(&req.device_id, error_codes::SET_VALUE_FAILED, self.manager.set_value(&req.device_id, &req.name, req.value, req.immediate))
                    .await
            }
            // Reserved by the protocol; not driven by any real driver yet
            // (spec.md §9).
            ClientMessage::StartList { device_id } => vec![ServerMessage::error(Some(device_id), error_codes::NOT_IMPLEMENTED, "list mode is not implemented")],
            ClientMessage::StopList { device_id } => vec![ServerMessage::error(Some(device_id), error_codes::NOT_IMPLEMENTED, "list mode is not implemented")],

            ClientMessage::ScopeRun { device_id } => self.scope_verb(&device_id, error_codes::SCOPE_RUN_FAILED, self.manager.scope_run(&device_id)).await,
            ClientMessage::ScopeStop { device_id } => self.scope_verb(&device_id, error_codes::SCOPE_STOP_FAILED, self.manager.scope_stop(&device_id)).await,
            ClientMessage::ScopeSingle { device_id } => self.scope_verb(&device_id, error_codes::SCOPE_RUN_FAILED, self.manager.scope_single(&device_id)).await,
            ClientMessage::ScopeAutoSetup { device_id } => {
                self.scope_verb(&device_id, error_codes::SCOPE_CONFIGURE_FAILED, self.manager.scope_auto_setup(&device_id)).await
            }
            ClientMessage::ScopeGetWaveform { device_id, channel } => match self.manager.scope_get_waveform(&device_id, &channel).await {
                Ok(waveform) => vec![ServerMessage::ScopeWaveform { device_id, waveform }],
                Err(err) => vec![self.routing_error(&device_id, err, error_codes::SCOPE_ACQUIRE_FAILED)],
            },
            ClientMessage::ScopeGetMeasurement { device_id, channel, measurement_type } => {
                match self.manager.scope_get_measurement(&device_id, &channel, &measurement_type).await {
                    Ok(value) => vec![ServerMessage::ScopeMeasurement { device_id, channel, measurement_type, value }],
                    Err(err) => vec![self.routing_error(&device_id, err, error_codes::SCOPE_ACQUIRE_FAILED)],
                }
            }
            ClientMessage::ScopeGetScreenshot { device_id } => match self.manager.scope_get_screenshot(&device_id).await {
                Ok(bytes) => vec![ServerMessage::ScopeScreenshot {
                    device_id,
                    image_base64: base64_encode(&bytes),
                }],
                Err(err) => vec![self.routing_error(&device_id, err, error_codes::SCOPE_ACQUIRE_FAILED)],
            },
            ClientMessage::ScopeSetChannel { device_id, channel, config } => {
                self.scope_verb(&device_id, error_codes::SCOPE_CONFIGURE_FAILED, self.manager.scope_set_channel(&device_id, &channel, config))
                    .await
            }
            ClientMessage::ScopeSetTimebase { device_id, timebase } => {
                self.scope_verb(&device_id, error_codes::SCOPE_CONFIGURE_FAILED, self.manager.scope_set_timebase(&device_id, timebase)).await
            }
            ClientMessage::ScopeSetTrigger { device_id, trigger } => {
                self.scope_verb(&device_id, error_codes::SCOPE_CONFIGURE_FAILED, self.manager.scope_set_trigger(&device_id, trigger)).await
            }
            ClientMessage::ScopeStartStreaming { device_id, channels, interval_ms, measurements } => {
                if let Err(err) = self.manager.scope_start_streaming(&device_id, channels, interval_ms, measurements).await {
                    vec![self.device_not_found_or(&device_id, err, error_codes::SCOPE_STREAM_FAILED)]
                } else {
                    vec![]
                }
            }
            ClientMessage::ScopeStopStreaming { device_id } => {
                if let Err(err) = self.manager.scope_stop_streaming(&device_id).await {
                    vec![self.device_not_found_or(&device_id, err, error_codes::SCOPE_STREAM_FAILED)]
                } else {
                    vec![]
                }
            }

            ClientMessage::SequenceLibraryList => match self.sequence_engine.list_library() {
                Ok(sequences) => vec![ServerMessage::SequenceLibrary { sequences }],
                Err(err) => vec![persistence_error(None, err, error_codes::SEQUENCE_NOT_AVAILABLE)],
            },
            ClientMessage::SequenceLibrarySave { definition } => match self.sequence_engine.save_to_library(definition) {
                Ok(id) => vec![ServerMessage::SequenceLibrary {
                    sequences: self.sequence_engine.get_from_library(&id).ok().flatten().into_iter().collect(),
                }],
                Err(err) => vec![persistence_error(None, err, error_codes::SEQUENCE_SAVE_FAILED)],
            },
            ClientMessage::SequenceLibraryUpdate { definition } => match self.sequence_engine.update_in_library(definition) {
                Ok(()) => vec![],
                Err(err) => vec![persistence_error(None, err, error_codes::SEQUENCE_UPDATE_FAILED)],
            },
            ClientMessage::SequenceLibraryDelete { id } => match self.sequence_engine.delete_from_library(&id) {
                Ok(()) => vec![],
                Err(err) => vec![persistence_error(None, err, error_codes::SEQUENCE_DELETE_FAILED)],
            },
            ClientMessage::SequenceRun { config } => match self.sequence_engine.run(config).await {
                Ok(()) => vec![],
                Err(err) => vec![sequence_engine_error(err)],
            },
            ClientMessage::SequenceAbort => {
                self.sequence_engine.abort().await;
                vec![]
            }

            ClientMessage::TriggerScriptLibraryList => match self.trigger_engine.list_library() {
                Ok(scripts) => vec![ServerMessage::TriggerScriptLibrary { scripts }],
                Err(err) => vec![persistence_error(None, err, error_codes::TRIGGER_SCRIPT_NOT_AVAILABLE)],
            },
            ClientMessage::TriggerScriptLibrarySave { script } => match self.trigger_engine.save_to_library(script) {
                Ok(id) => vec![ServerMessage::TriggerScriptLibrary {
                    scripts: self.trigger_engine.get_from_library(&id).ok().flatten().into_iter().collect(),
                }],
                Err(err) => vec![persistence_error(None, err, error_codes::TRIGGER_SCRIPT_SAVE_FAILED)],
            },
            ClientMessage::TriggerScriptLibraryUpdate { script } => match self.trigger_engine.update_in_library(script) {
                Ok(()) => vec![],
                Err(err) => vec![persistence_error(None, err, error_codes::TRIGGER_SCRIPT_UPDATE_FAILED)],
            },
            ClientMessage::TriggerScriptLibraryDelete { id } => match self.trigger_engine.delete_from_library(&id) {
                Ok(()) => vec![],
                Err(err) => vec![persistence_error(None, err, error_codes::TRIGGER_SCRIPT_DELETE_FAILED)],
            },
            ClientMessage::TriggerScriptRun { script_id } => match self.trigger_engine.run(script_id).await {
                Ok(()) => vec![],
                Err(err) => vec![trigger_engine_error(err)],
            },
            ClientMessage::TriggerScriptStop => {
                self.trigger_engine.stop().await;
                vec![]
            }
            // Reachable only here, not via a sequence-specific client
            // message: `bench_protocol::ClientMessage` has no
            // `sequencePause`/`sequenceResume` variant, so pausing a run is
            // exposed exclusively as a trigger action
            // (`Action::PauseSequence`) or through this script-wide pause.
            ClientMessage::TriggerScriptPause => {
                self.trigger_engine.pause().await;
                vec![]
            }
            ClientMessage::TriggerScriptResume => {
                self.trigger_engine.resume().await;
                vec![]
            }

            ClientMessage::DeviceAliasList => match AliasStore::new(&self.db).list() {
                Ok(aliases) => vec![ServerMessage::DeviceAliases { aliases }],
                Err(err) => vec![persistence_error(None, err, error_codes::DEVICE_ALIAS_SET_FAILED)],
            },
            ClientMessage::DeviceAliasSet { idn, alias } => match AliasStore::new(&self.db).set(&idn, &alias) {
                Ok(()) => {
                    self.broadcast_device_list().await;
                    vec![ServerMessage::DeviceAliasChanged { idn, alias: Some(alias) }]
                }
                Err(err) => vec![persistence_error(None, err, error_codes::DEVICE_ALIAS_SET_FAILED)],
            },
            ClientMessage::DeviceAliasClear { idn } => match AliasStore::new(&self.db).clear(&idn) {
                Ok(()) => {
                    self.broadcast_device_list().await;
                    vec![ServerMessage::DeviceAliasChanged { idn, alias: None }]
                }
                Err(err) => vec![persistence_error(None, err, error_codes::DEVICE_ALIAS_CLEAR_FAILED)],
            },

            ClientMessage::SettingsExport => self.handle_settings_export(),
            ClientMessage::SettingsImport { document } => self.handle_settings_import(document),
        }
    }

    async fn handle_subscribe(&self, client_id: ClientId, sink: &Subscriber, device_id: String) -> Vec<ServerMessage> {
        match self.manager.device_type_of(&device_id).await {
            None => vec![ServerMessage::error(Some(device_id), error_codes::DEVICE_NOT_FOUND, "device not found")],
            Some(DeviceType::Oscilloscope) => match self.manager.scope_subscribe(&device_id, client_id, sink.clone()).await {
                Ok(status) => vec![ServerMessage::Subscribed {
                    device_id: device_id.clone(),
                    state: scope_status_snapshot(status),
                }],
                Err(_) => vec![ServerMessage::error(Some(device_id), error_codes::SUBSCRIBE_FAILED, "subscribe failed")],
            },
            Some(_) => match self.manager.subscribe(&device_id, client_id, sink.clone()).await {
                Ok(state) => vec![ServerMessage::Subscribed { device_id, state }],
                Err(_) => vec![ServerMessage::error(Some(device_id), error_codes::SUBSCRIBE_FAILED, "subscribe failed")],
            },
        }
    }

    async fn instrument_verb(&self, device_id: &str, fail_code: &str, fut: impl std::future::Future<Output = Result<(), RoutingOrDriverError>>) -> Vec<ServerMessage> {
        match fut.await {
            Ok(()) => vec![],
            Err(err) => vec![self.routing_error(device_id, err, fail_code)],
        }
    }

    async fn scope_verb(&self, device_id: &str, fail_code: &str, fut: impl std::future::Future<Output = Result<(), RoutingOrDriverError>>) -> Vec<ServerMessage> {
        self.instrument_verb(device_id, fail_code, fut).await
    }

    fn routing_error(&self, device_id: &str, err: RoutingOrDriverError, fail_code: &str) -> ServerMessage {
        match err {
            RoutingOrDriverError::Routing(_) => ServerMessage::error(Some(device_id.to_owned()), error_codes::DEVICE_NOT_FOUND, "device not found"),
            RoutingOrDriverError::Driver(e) => ServerMessage::error(Some(device_id.to_owned()), fail_code, e.to_string()),
        }
    }

    fn device_not_found_or(&self, device_id: &str, err: crate::manager::RoutingError, fail_code: &str) -> ServerMessage {
        let _ = fail_code;
        match err {
            crate::manager::RoutingError::DeviceNotFound => ServerMessage::error(Some(device_id.to_owned()), error_codes::DEVICE_NOT_FOUND, "device not found"),
            crate::manager::RoutingError::WrongDeviceType => ServerMessage::error(Some(device_id.to_owned()), error_codes::WRONG_DEVICE_TYPE, "wrong device type"),
        }
    }

    fn handle_settings_export(&self) -> Vec<ServerMessage> {
        let sequences = match self.sequence_engine.list_library() {
            Ok(s) => s,
            Err(err) => return vec![persistence_error(None, err, error_codes::SETTINGS_EXPORT_FAILED)],
        };
        let trigger_scripts = match self.trigger_engine.list_library() {
            Ok(s) => s,
            Err(err) => return vec![persistence_error(None, err, error_codes::SETTINGS_EXPORT_FAILED)],
        };
        let aliases = match AliasStore::new(&self.db).list() {
            Ok(a) => a,
            Err(err) => return vec![persistence_error(None, err, error_codes::SETTINGS_EXPORT_FAILED)],
        };
        vec![ServerMessage::SettingsExported {
            document: SettingsDocument { sequences, trigger_scripts, aliases },
        }]
    }

    fn handle_settings_import(&self, document: SettingsDocument) -> Vec<ServerMessage> {
        for sequence in document.sequences {
            if let Err(err) = self.sequence_engine.save_to_library(sequence) {
                return vec![persistence_error(None, err, error_codes::SETTINGS_IMPORT_FAILED)];
            }
        }
        for script in document.trigger_scripts {
            if let Err(err) = self.trigger_engine.save_to_library(script) {
                return vec![persistence_error(None, err, error_codes::SETTINGS_IMPORT_FAILED)];
            }
        }
        let store = AliasStore::new(&self.db);
        for (idn, alias) in document.aliases {
            if let Err(err) = store.set(&idn, &alias) {
                return vec![persistence_error(None, err, error_codes::SETTINGS_IMPORT_FAILED)];
            }
        }
        vec![ServerMessage::SettingsImported]
    }
}

fn scope_status_snapshot(status: bench_core::scope::OscilloscopeStatus) -> bench_protocol::DeviceStateSnapshot {
    bench_protocol::DeviceStateSnapshot {
        connection_status: "connected".to_owned(),
        mode: None,
        output_enabled: status.running,
        setpoints: Default::default(),
        measurements: status.measurements,
    }
}

fn persistence_error(device_id: Option<String>, err: PersistenceError, fail_code: &str) -> ServerMessage {
    ServerMessage::error(device_id, fail_code, err.to_string())
}

fn sequence_engine_error(err: SequenceEngineError) -> ServerMessage {
    let code = match err {
        SequenceEngineError::AlreadyRunning => error_codes::SEQUENCE_ALREADY_RUNNING,
        SequenceEngineError::NotFound(_) => error_codes::SEQUENCE_NOT_AVAILABLE,
        SequenceEngineError::Driver(_) | SequenceEngineError::Persistence(_) => error_codes::SEQUENCE_RUN_FAILED,
    };
    ServerMessage::error(None, code, err.to_string())
}

fn trigger_engine_error(err: TriggerEngineError) -> ServerMessage {
    let code = match err {
        TriggerEngineError::AlreadyRunning => error_codes::TRIGGER_SCRIPT_ALREADY_RUNNING,
        TriggerEngineError::NotFound(_) => error_codes::TRIGGER_SCRIPT_NOT_AVAILABLE,
        TriggerEngineError::DeviceNotFound(_) | TriggerEngineError::Persistence(_) => error_codes::TRIGGER_SCRIPT_RUN_FAILED,
    };
    ServerMessage::error(None, code, err.to_string())
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
