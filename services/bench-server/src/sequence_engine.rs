//! SequenceEngine (spec.md §4.6): process-wide singleton that walks a
//! materialized waveform across wall-clock-anchored ticks, writing each
//! commanded value through the `SessionManager`.
//!
//! Library operations are plain delegation to `persistence::SequenceLibrary`
//! (spec.md: "Persistence is delegated to C9") and bypass the actor
//! entirely; only `run`/`abort`/`pause`/`resume` touch the single shared
//! `active` run and are routed through the command channel, the same
//! actor-ownership shape as `session::Actor`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::warn;

use bench_core::sequence::{ExecutionState, RunConfig, SequenceDefinition, SequenceState};
use bench_core::waveform::{self, PostProcessConfig, Step, Waveform};
use bench_driver::DriverError;
use bench_protocol::ServerMessage;

use crate::manager::{RoutingOrDriverError, SessionManager};
use crate::persistence::{Db, Library, PersistenceError, SequenceLibrary};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a sequence is already running")]
    AlreadyRunning,
    #[error("sequence not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<RoutingOrDriverError> for EngineError {
    fn from(err: RoutingOrDriverError) -> Self {
        match err {
            RoutingOrDriverError::Routing(_) => EngineError::NotFound("device not found".into()),
            RoutingOrDriverError::Driver(e) => EngineError::Driver(e),
        }
    }
}

enum Command {
    Run {
        config: RunConfig,
        respond: oneshot::Sender<Result<(), EngineError>>,
    },
    Abort {
        respond: oneshot::Sender<()>,
    },
    Pause {
        respond: oneshot::Sender<()>,
    },
    Resume {
        respond: oneshot::Sender<()>,
    },
    Stop,
}

#[derive(Clone)]
pub struct SequenceEngineHandle {
    tx: mpsc::Sender<Command>,
    db: Arc<Db>,
}

impl SequenceEngineHandle {
    pub fn list_library(&self) -> Result<Vec<SequenceDefinition>, PersistenceError> {
        SequenceLibrary::new(&self.db).list()
    }

    pub fn get_from_library(&self, id: &str) -> Result<Option<SequenceDefinition>, PersistenceError> {
        SequenceLibrary::new(&self.db).get(id)
    }

    /// `def ∖ {id,createdAt,updatedAt}`: the caller-supplied id and
    /// timestamps are ignored, a fresh id and insertion stamps are assigned.
    pub fn save_to_library(&self, definition: SequenceDefinition) -> Result<String, PersistenceError> {
        SequenceLibrary::new(&self.db).save(definition)
    }

    pub fn update_in_library(&self, definition: SequenceDefinition) -> Result<(), PersistenceError> {
        SequenceLibrary::new(&self.db).update(definition)
    }

    pub fn delete_from_library(&self, id: &str) -> Result<(), PersistenceError> {
        SequenceLibrary::new(&self.db).delete(id)
    }

    pub async fn run(&self, config: RunConfig) -> Result<(), EngineError> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Run { config, respond }).await;
        rx.await.expect("sequence engine actor dropped")
    }

    pub async fn abort(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Abort { respond }).await;
        let _ = rx.await;
    }

    pub async fn pause(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Pause { respond }).await;
        let _ = rx.await;
    }

    pub async fn resume(&self) {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Resume { respond }).await;
        let _ = rx.await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

/// One materialized cycle: postprocessing is applied lazily, one step at a
/// time, because the slew-rate limiter needs the previously *commanded*
/// (post-processed) value, not the raw waveform sample.
struct CycleSteps {
    raw: Vec<Step>,
    cumulative_ms: Vec<u64>,
    cycle_start: Instant,
}

fn materialize(waveform: &Waveform, prev_raw: Option<f64>, cycle_start: Instant) -> CycleSteps {
    let raw = waveform::materialize_cycle(waveform, prev_raw, || rand::random::<f64>() * 2.0 - 1.0);
    let mut cumulative = Vec::with_capacity(raw.len());
    let mut acc = 0u64;
    for step in &raw {
        cumulative.push(acc);
        acc += step.dwell_ms;
    }
    CycleSteps { raw, cumulative_ms: cumulative, cycle_start }
}

struct ActiveRun {
    definition: SequenceDefinition,
    state: SequenceState,
    cycle: CycleSteps,
    step_index: usize,
    previous_command: Option<f64>,
    previous_raw: Option<f64>,
    paused_remaining: Option<std::time::Duration>,
    /// Set once the last step of the final cycle has been written; the run
    /// still has one tick left to wait out that step's own dwell before
    /// `sequenceCompleted` fires (spec.md §8, S3: completion lands at the
    /// last step's deadline plus its dwell, not the moment the value lands).
    awaiting_completion: bool,
}

impl ActiveRun {
    fn next_deadline(&self) -> Option<Instant> {
        if self.paused_remaining.is_some() {
            return None;
        }
        if self.awaiting_completion {
            let total_ms = self.cycle.cumulative_ms.last().copied().unwrap_or(0) + self.cycle.raw.last().map(|s| s.dwell_ms).unwrap_or(0);
            return Some(self.cycle.cycle_start + std::time::Duration::from_millis(total_ms));
        }
        self.cycle
            .cumulative_ms
            .get(self.step_index)
            .map(|ms| self.cycle.cycle_start + std::time::Duration::from_millis(*ms))
    }

    fn postprocess_cfg(&self) -> PostProcessConfig {
        self.definition.post_process_config()
    }
}

struct Actor {
    db: Arc<Db>,
    manager: Arc<SessionManager>,
    events: mpsc::UnboundedSender<ServerMessage>,
    active: Option<ActiveRun>,
}

pub fn spawn(db: Arc<Db>, manager: Arc<SessionManager>, events: mpsc::UnboundedSender<ServerMessage>) -> SequenceEngineHandle {
    let (tx, rx) = mpsc::channel(32);
    let actor = Actor { db: db.clone(), manager, events, active: None };
    tokio::spawn(actor.run(rx));
    SequenceEngineHandle { tx, db }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let sleep = self.next_tick_sleep();
            tokio::select! {
                () = sleep => {
                    self.tick().await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
            }
        }
    }

    fn next_tick_sleep(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        match self.active.as_ref().and_then(ActiveRun::next_deadline) {
            Some(deadline) => Box::pin(tokio::time::sleep_until(deadline)),
            None => Box::pin(std::future::pending()),
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Run { config, respond } => {
                let result = self.start_run(config).await;
                let _ = respond.send(result);
            }
            Command::Abort { respond } => {
                self.abort().await;
                let _ = respond.send(());
            }
            Command::Pause { respond } => {
                if let Some(active) = self.active.as_mut() {
                    if active.state.execution_state == ExecutionState::Running {
                        if let Some(deadline) = active.next_deadline() {
                            active.paused_remaining = Some(deadline.saturating_duration_since(Instant::now()));
                        }
                        active.state.execution_state = ExecutionState::Paused;
                    }
                }
                let _ = respond.send(());
            }
            Command::Resume { respond } => {
                if let Some(active) = self.active.as_mut() {
                    if let Some(remaining) = active.paused_remaining.take() {
                        active.cycle.cycle_start = Instant::now() + remaining
                            - std::time::Duration::from_millis(active.cycle.cumulative_ms[active.step_index]);
                        active.state.execution_state = ExecutionState::Running;
                    }
                }
                let _ = respond.send(());
            }
            Command::Stop => {}
        }
    }

    async fn start_run(&mut self, config: RunConfig) -> Result<(), EngineError> {
        if self.active.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let definition = SequenceLibrary::new(&self.db)
            .get(&config.sequence_id)?
            .ok_or_else(|| EngineError::NotFound(config.sequence_id.clone()))?;

        if let Some(pre_value) = definition.pre_value {
            self.manager
                .set_value(&config.device_id, &config.parameter, pre_value, true)
                .await?;
        }

        let started_at = crate::persistence::now_ms();
        let cycle = materialize(&definition.waveform, None, Instant::now());
        let state = SequenceState::new(config.clone(), cycle.raw.len() as u32, started_at);

        self.events.send(ServerMessage::SequenceStarted { state: state.clone() }).ok();

        self.active = Some(ActiveRun {
            definition,
            state,
            cycle,
            step_index: 0,
            previous_command: None,
            previous_raw: None,
            paused_remaining: None,
            awaiting_completion: false,
        });
        Ok(())
    }

    async fn tick(&mut self) {
        let Some(active) = self.active.as_ref() else { return };
        if active.awaiting_completion {
            self.complete_run().await;
            return;
        }
        let active = self.active.as_mut().expect("checked above");
        let sequence_id = active.state.sequence_id.clone();
        let device_id = active.state.run_config.device_id.clone();
        let parameter = active.state.run_config.parameter.clone();
        let raw_step = active.cycle.raw[active.step_index];
        let value = waveform::postprocess(raw_step.value, raw_step.dwell_ms, active.previous_command, &active.postprocess_cfg());

        match self.manager.set_value(&device_id, &parameter, value, true).await {
            Ok(()) => {
                let active = self.active.as_mut().expect("active checked above");
                active.previous_command = Some(value);
                active.state.commanded_value = Some(value);
                active.state.current_step_index += 1;
                active.state.elapsed_ms = crate::persistence::now_ms() - active.state.started_at.unwrap_or(0);
                self.advance_step().await;
                if let Some(active) = self.active.as_ref() {
                    self.events.send(ServerMessage::SequenceProgress { state: active.state.clone() }).ok();
                }
            }
            Err(err) => {
                warn!(%sequence_id, error = %err, "sequence tick failed, halting");
                let active = self.active.as_mut().expect("active checked above");
                active.state.execution_state = ExecutionState::Error;
                active.state.error = Some(err.to_string());
                self.events
                    .send(ServerMessage::SequenceError { sequence_id, error: err.to_string() })
                    .ok();
                self.active = None;
            }
        }
    }

    async fn advance_step(&mut self) {
        let Some(active) = self.active.as_mut() else { return };
        active.step_index += 1;
        if active.step_index < active.cycle.raw.len() {
            return;
        }

        active.previous_raw = active.cycle.raw.last().map(|s| s.value);
        active.state.current_cycle += 1;

        if active.state.cycle_limit_reached() {
            active.awaiting_completion = true;
            return;
        }

        let next_start = active.cycle.cycle_start + std::time::Duration::from_millis(active.cycle.cumulative_ms.last().copied().unwrap_or(0) + active.cycle.raw.last().map(|s| s.dwell_ms).unwrap_or(0));
        active.cycle = materialize(&active.definition.waveform, active.previous_raw, next_start);
        active.step_index = 0;
    }

    /// Fires once the final step's own dwell has elapsed (spec.md §8, S3).
    async fn complete_run(&mut self) {
        let Some(mut active) = self.active.take() else { return };
        let sequence_id = active.state.sequence_id.clone();
        if let Some(post_value) = active.definition.post_value {
            let device_id = active.state.run_config.device_id.clone();
            let parameter = active.state.run_config.parameter.clone();
            if let Err(err) = self.manager.set_value(&device_id, &parameter, post_value, true).await {
                warn!(%sequence_id, error = %err, "post-value write failed on completion");
            }
        }
        active.state.execution_state = ExecutionState::Completed;
        self.events.send(ServerMessage::SequenceCompleted { sequence_id }).ok();
    }

    async fn abort(&mut self) {
        let Some(active) = self.active.take() else { return };
        let sequence_id = active.state.sequence_id.clone();
        if let Some(post_value) = active.definition.post_value {
            let device_id = active.state.run_config.device_id.clone();
            let parameter = active.state.run_config.parameter.clone();
            if let Err(err) = self.manager.set_value(&device_id, &parameter, post_value, true).await {
                warn!(%sequence_id, error = %err, "post-value write failed on abort");
            }
        }
        self.events.send(ServerMessage::SequenceAborted { sequence_id }).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::device::DeviceType;
    use bench_core::sequence::RepeatMode;
    use bench_core::waveform::{StandardShape, WaveformParams};
    use bench_test_support::fixtures::{psu_capabilities, psu_info};
    use bench_test_support::mock_driver::MockDriver;
    use crate::config::PollConfig;
    use crate::manager::NewDevice;

    fn poll_cfg() -> PollConfig {
        PollConfig {
            interval_ms: 1000,
            debounce_ms: 20,
            error_threshold: 3,
            history_retention_ticks: 64,
            status_refresh_ticks: 1000,
        }
    }

    fn ramp_def() -> SequenceDefinition {
        SequenceDefinition {
            id: String::new(),
            name: "ramp".into(),
            unit: "V".into(),
            waveform: Waveform::Standard(WaveformParams {
                shape: StandardShape::Ramp,
                min: 0.0,
                max: 10.0,
                points_per_cycle: 4,
                interval_ms: 5,
            }),
            pre_value: None,
            post_value: None,
            scale: 1.0,
            offset: 0.0,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn registered_manager() -> (Arc<SessionManager>, String) {
        let manager = Arc::new(SessionManager::new(poll_cfg()));
        let info = psu_info();
        let driver = Arc::new(MockDriver::new(info.clone(), psu_capabilities()));
        manager
            .register(&info.id, info.clone(), psu_capabilities(), NewDevice::Instrument { driver, device_type: DeviceType::PowerSupply })
            .await;
        (manager, info.id)
    }

    #[tokio::test(start_paused = true)]
    async fn running_an_unknown_sequence_id_fails_not_found() {
        let (manager, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let engine = spawn(db, manager, events_tx);

        let config = RunConfig {
            sequence_id: "missing".into(),
            device_id,
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        };
        let err = engine.run(config).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn running_a_sequence_twice_rejects_with_already_running() {
        let (manager, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let id = SequenceLibrary::new(&db).save(ramp_def()).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let engine = spawn(db, manager, events_tx);

        let config = RunConfig {
            sequence_id: id,
            device_id,
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        };
        engine.run(config.clone()).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(ServerMessage::SequenceStarted { .. })));

        let err = engine.run(config).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn once_mode_ramp_completes_after_its_points() {
        let (manager, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let id = SequenceLibrary::new(&db).save(ramp_def()).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let engine = spawn(db, manager, events_tx);

        let config = RunConfig {
            sequence_id: id,
            device_id,
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        };
        engine.run(config).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(ServerMessage::SequenceStarted { .. })));

        tokio::time::advance(std::time::Duration::from_millis(30)).await;

        let mut saw_completed = false;
        while let Ok(msg) = events_rx.try_recv() {
            if matches!(msg, ServerMessage::SequenceCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed, "ramp should complete within its four 5ms steps");
    }

    fn hundred_step_ramp_def() -> SequenceDefinition {
        SequenceDefinition {
            waveform: Waveform::Standard(WaveformParams {
                shape: StandardShape::Ramp,
                min: 0.0,
                max: 10.0,
                points_per_cycle: 100,
                interval_ms: 100,
            }),
            ..ramp_def()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn once_mode_completion_waits_out_the_final_steps_own_dwell() {
        let (manager, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let id = SequenceLibrary::new(&db).save(hundred_step_ramp_def()).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let engine = spawn(db, manager.clone(), events_tx);

        let config = RunConfig {
            sequence_id: id,
            device_id: device_id.clone(),
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        };
        engine.run(config).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(ServerMessage::SequenceStarted { .. })));

        // 100 steps of 100ms dwell: the 100th write lands at t=9900ms, but
        // completion shouldn't fire until that last step's own dwell has
        // also elapsed, at t=10000ms.
        tokio::time::advance(std::time::Duration::from_millis(9950)).await;
        while let Ok(msg) = events_rx.try_recv() {
            assert!(!matches!(msg, ServerMessage::SequenceCompleted { .. }), "completion must not fire before the final step's dwell elapses");
        }

        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        let mut saw_completed = false;
        while let Ok(msg) = events_rx.try_recv() {
            if matches!(msg, ServerMessage::SequenceCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed, "completion should have fired by t=10000ms");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_halts_a_running_sequence() {
        let (manager, device_id) = registered_manager().await;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let id = SequenceLibrary::new(&db).save(ramp_def()).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let engine = spawn(db, manager, events_tx);

        let config = RunConfig {
            sequence_id: id,
            device_id,
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Continuous,
            repeat_count: None,
        };
        engine.run(config).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(ServerMessage::SequenceStarted { .. })));

        engine.abort().await;
        assert!(matches!(events_rx.recv().await, Some(ServerMessage::SequenceAborted { .. })));

        // abort() is idempotent: a second call with nothing active is a no-op.
        engine.abort().await;
        assert!(events_rx.try_recv().is_err());
    }
}
