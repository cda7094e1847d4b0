//! TriggerScriptEngine (spec.md §4.7): a second process-wide singleton
//! evaluating edge/debounce/repeat conditions against live measurements and
//! a coarse time ticker, dispatching into `SessionManager`/`SequenceEngine`
//! when a trigger fires.
//!
//! Subscribes to each referenced device session under one synthetic client
//! id shared across the whole script, the same `subscribe(clientId, sink)`
//! entry point a real websocket client uses — the engine is just another
//! subscriber from the session's point of view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use bench_core::sequence::RunConfig;
use bench_core::trigger::{evaluate_edge, Action, Condition, TriggerScript, TriggerState};
use bench_protocol::ServerMessage;

use crate::fanout::Subscriber;
use crate::manager::SessionManager;
use crate::persistence::{now_ms, Db, Library, PersistenceError, TriggerScriptLibrary};
use crate::sequence_engine::SequenceEngineHandle;

/// Reserved client id used for every TriggerScriptEngine subscription. No
/// real websocket connection is assigned ids in this range.
const TRIGGER_ENGINE_CLIENT_ID: u64 = u64::MAX;

const TICKER_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a trigger script is already running")]
    AlreadyRunning,
    #[error("trigger script not found: {0}")]
    NotFound(String),
    #[error("referenced device not found: {0}")]
    DeviceNotFound(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

enum Command {
    Run {
        script_id: String,
        respond: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop(oneshot::Sender<()>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct TriggerScriptEngineHandle {
    tx: mpsc::Sender<Command>,
    db: Arc<Db>,
}

impl TriggerScriptEngineHandle {
    pub fn list_library(&self) -> Result<Vec<TriggerScript>, PersistenceError> {
        TriggerScriptLibrary::new(&self.db).list()
    }

    pub fn get_from_library(&self, id: &str) -> Result<Option<TriggerScript>, PersistenceError> {
        TriggerScriptLibrary::new(&self.db).get(id)
    }

    pub fn save_to_library(&self, script: TriggerScript) -> Result<String, PersistenceError> {
        TriggerScriptLibrary::new(&self.db).save(script)
    }

    pub fn update_in_library(&self, script: TriggerScript) -> Result<(), PersistenceError> {
        TriggerScriptLibrary::new(&self.db).update(script)
    }

    pub fn delete_from_library(&self, id: &str) -> Result<(), PersistenceError> {
        TriggerScriptLibrary::new(&self.db).delete(id)
    }

    pub async fn run(&self, script_id: impl Into<String>) -> Result<(), EngineError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Run { script_id: script_id.into(), respond }).await;
        rx.await.expect("trigger engine actor dropped")
    }

    pub async fn stop(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Stop(respond)).await;
        let _ = rx.await;
    }

    pub async fn pause(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Pause(respond)).await;
        let _ = rx.await;
    }

    pub async fn resume(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Resume(respond)).await;
        let _ = rx.await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

struct ActiveScript {
    script: TriggerScript,
    trigger_states: HashMap<String, TriggerState>,
    started_at: i64,
    subscribed_devices: Vec<String>,
    paused: bool,
}

struct Actor {
    db: Arc<Db>,
    manager: Arc<SessionManager>,
    sequence_engine: SequenceEngineHandle,
    events: mpsc::UnboundedSender<ServerMessage>,
    sink: Subscriber,
    active: Option<ActiveScript>,
}

pub fn spawn(
    db: Arc<Db>,
    manager: Arc<SessionManager>,
    sequence_engine: SequenceEngineHandle,
    events: mpsc::UnboundedSender<ServerMessage>,
) -> TriggerScriptEngineHandle {
    let (tx, rx) = mpsc::channel(32);
    let actor = Actor {
        db: db.clone(),
        manager,
        sequence_engine,
        events,
        sink: Subscriber::new(),
        active: None,
    };
    tokio::spawn(actor.run(rx));
    TriggerScriptEngineHandle { tx, db }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(TICKER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
                msg = self.sink.recv() => {
                    match msg {
                        Some(ServerMessage::Measurement { device_id, update }) => {
                            self.handle_measurement(device_id, update.measurements).await;
                        }
                        Some(_) => {}
                        None => {}
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
            }
        }
        self.unsubscribe_all().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Run { script_id, respond } => {
                let result = self.start_run(script_id).await;
                let _ = respond.send(result);
            }
            Command::Stop(respond) => {
                self.stop_active().await;
                let _ = respond.send(());
            }
            Command::Pause(respond) => {
                if let Some(active) = self.active.as_mut() {
                    active.paused = true;
                }
                let _ = respond.send(());
            }
            Command::Resume(respond) => {
                if let Some(active) = self.active.as_mut() {
                    active.paused = false;
                }
                let _ = respond.send(());
            }
            Command::Shutdown => {}
        }
    }

    async fn start_run(&mut self, script_id: String) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let script = TriggerScriptLibrary::new(&self.db)
            .get(&script_id)?
            .ok_or_else(|| EngineError::NotFound(script_id.clone()))?;

        let trigger_states = script
            .triggers
            .iter()
            .map(|t| (t.id.clone(), TriggerState::new(t.id.clone())))
            .collect();

        let mut subscribed_devices = Vec::new();
        for trigger in &script.triggers {
            if let Condition::Value { device_id, .. } = &trigger.condition {
                if !subscribed_devices.contains(device_id) {
                    subscribed_devices.push(device_id.clone());
                }
            }
        }

        for device_id in &subscribed_devices {
            self.manager
                .subscribe(device_id, TRIGGER_ENGINE_CLIENT_ID, self.sink.clone())
                .await
                .map_err(|_| EngineError::DeviceNotFound(device_id.clone()))?;
        }

        self.active = Some(ActiveScript {
            script,
            trigger_states,
            started_at: now_ms(),
            subscribed_devices,
            paused: false,
        });
        Ok(())
    }

    async fn stop_active(&mut self) {
        self.unsubscribe_all().await;
        if let Some(active) = self.active.take() {
            self.events.send(ServerMessage::TriggerScriptStopped { script_id: active.script.id }).ok();
        }
    }

    async fn unsubscribe_all(&mut self) {
        if let Some(active) = self.active.as_ref() {
            for device_id in &active.subscribed_devices {
                self.manager.unsubscribe(device_id, TRIGGER_ENGINE_CLIENT_ID).await;
            }
        }
    }

    async fn handle_measurement(&mut self, device_id: String, measurements: BTreeMap<String, f64>) {
        let script_id;
        let mut to_fire = Vec::new();
        {
            let Some(active) = self.active.as_mut() else { return };
            if active.paused {
                return;
            }
            script_id = active.script.id.clone();
            let now = now_ms();
            for trigger in &active.script.triggers {
                let Condition::Value { device_id: d, parameter, operator, value } = &trigger.condition else {
                    continue;
                };
                if *d != device_id {
                    continue;
                }
                let Some(&measured) = measurements.get(parameter) else { continue };
                let met = operator.evaluate(measured, *value);
                let state = active
                    .trigger_states
                    .get_mut(&trigger.id)
                    .expect("trigger state initialized at run");
                let outcome = evaluate_edge(state, trigger.repeat_mode, met, now, trigger.debounce_ms);
                if outcome.should_fire {
                    to_fire.push((trigger.id.clone(), trigger.action.clone(), state.clone()));
                }
            }
        }
        for (trigger_id, action, state) in to_fire {
            self.fire(&script_id, &trigger_id, &action, state).await;
        }
    }

    async fn handle_tick(&mut self) {
        let script_id;
        let mut to_fire = Vec::new();
        {
            let Some(active) = self.active.as_mut() else { return };
            if active.paused {
                return;
            }
            script_id = active.script.id.clone();
            let now = now_ms();
            let elapsed_ms = now - active.started_at;
            for trigger in &active.script.triggers {
                let Condition::Time { seconds } = &trigger.condition else { continue };
                let met = (elapsed_ms as f64 / 1000.0) >= *seconds;
                let state = active
                    .trigger_states
                    .get_mut(&trigger.id)
                    .expect("trigger state initialized at run");
                let outcome = evaluate_edge(state, trigger.repeat_mode, met, now, trigger.debounce_ms);
                if outcome.should_fire {
                    to_fire.push((trigger.id.clone(), trigger.action.clone(), state.clone()));
                }
            }
        }
        for (trigger_id, action, state) in to_fire {
            self.fire(&script_id, &trigger_id, &action, state).await;
        }
    }

    async fn fire(&mut self, script_id: &str, trigger_id: &str, action: &Action, state: TriggerState) {
        match self.invoke_action(action).await {
            Ok(()) => {
                self.events
                    .send(ServerMessage::TriggerFired {
                        script_id: script_id.to_owned(),
                        trigger_id: trigger_id.to_owned(),
                        state,
                    })
                    .ok();
            }
            Err(error) => {
                self.events
                    .send(ServerMessage::TriggerActionFailed {
                        script_id: script_id.to_owned(),
                        trigger_id: trigger_id.to_owned(),
                        error,
                    })
                    .ok();
            }
        }
    }

    async fn invoke_action(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::SetValue { device_id, parameter, value } => self
                .manager
                .set_value(device_id, parameter, *value, true)
                .await
                .map_err(|e| e.to_string()),
            Action::SetOutput { device_id, enabled } => {
                self.manager.set_output(device_id, *enabled).await.map_err(|e| e.to_string())
            }
            Action::StartSequence { sequence_id, device_id, parameter, repeat_mode, repeat_count } => self
                .sequence_engine
                .run(RunConfig {
                    sequence_id: sequence_id.clone(),
                    device_id: device_id.clone(),
                    parameter: parameter.clone(),
                    repeat_mode: *repeat_mode,
                    repeat_count: *repeat_count,
                })
                .await
                .map_err(|e| e.to_string()),
            Action::StopSequence => {
                self.sequence_engine.abort().await;
                Ok(())
            }
            Action::PauseSequence => {
                self.sequence_engine.pause().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::device::DeviceType;
    use bench_core::sequence::RepeatMode;
    use bench_core::trigger::{Operator, Trigger, TriggerRepeatMode};
    use bench_test_support::fixtures::{psu_capabilities, psu_info};
    use bench_test_support::mock_driver::MockDriver;
    use crate::config::PollConfig;
    use crate::manager::NewDevice;

    fn poll_cfg() -> PollConfig {
        PollConfig {
            interval_ms: 10,
            debounce_ms: 20,
            error_threshold: 3,
            history_retention_ticks: 64,
            status_refresh_ticks: 1000,
        }
    }

    fn one_shot_script(device_id: &str) -> TriggerScript {
        TriggerScript {
            id: String::new(),
            name: "over-volt".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Value {
                    device_id: device_id.to_owned(),
                    parameter: "voltage".into(),
                    operator: Operator::Gt,
                    value: 5.0,
                },
                action: Action::SetOutput { device_id: device_id.to_owned(), enabled: false },
                repeat_mode: TriggerRepeatMode::Once,
                debounce_ms: 100,
            }],
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn registered_manager() -> (Arc<SessionManager>, Arc<MockDriver>, String) {
        let manager = Arc::new(SessionManager::new(poll_cfg()));
        let info = psu_info();
        let driver = Arc::new(MockDriver::new(info.clone(), psu_capabilities()));
        manager
            .register(&info.id, info.clone(), psu_capabilities(), NewDevice::Instrument { driver: driver.clone(), device_type: DeviceType::PowerSupply })
            .await;
        (manager, driver, info.id)
    }

    fn spawn_engine(manager: Arc<SessionManager>, db: Arc<Db>) -> (TriggerScriptEngineHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let seq_db = db.clone();
        let (seq_events_tx, _seq_events_rx) = mpsc::unbounded_channel();
        let sequence_engine = crate::sequence_engine::spawn(seq_db, manager.clone(), seq_events_tx);
        let handle = spawn(db, manager, sequence_engine, events_tx);
        (handle, events_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn rising_edge_above_threshold_fires_and_sets_output_false() {
        let (manager, driver, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let script_id = TriggerScriptLibrary::new(&db).save(one_shot_script(&device_id)).unwrap();
        let (engine, mut events) = spawn_engine(manager.clone(), db);

        engine.run(script_id).await.unwrap();

        for voltage in [3.0, 4.0, 6.0, 4.0, 7.0] {
            driver.set_measurements(BTreeMap::from([("voltage".to_owned(), voltage)])).await;
            tokio::time::advance(std::time::Duration::from_millis(15)).await;
        }

        let mut fired = 0;
        while let Ok(msg) = events.try_recv() {
            if matches!(msg, ServerMessage::TriggerFired { .. }) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1, "once-mode trigger should fire exactly once across the whole sample run");
    }

    #[tokio::test(start_paused = true)]
    async fn running_the_same_script_twice_is_rejected() {
        let (manager, _driver, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let script_id = TriggerScriptLibrary::new(&db).save(one_shot_script(&device_id)).unwrap();
        let (engine, _events) = spawn_engine(manager, db);

        engine.run(script_id.clone()).await.unwrap();
        let err = engine.run(script_id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
    }
}
