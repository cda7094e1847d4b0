//! Composition root, grounded on `services/server/src/state.rs`'s
//! `AppState`: one `Clone`-able struct holding every shared registry the
//! route handlers need, built once in `main` and threaded through axum's
//! `with_state`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use bench_protocol::ServerMessage;

use crate::config::ServerConfig;
use crate::discovery::{PortOpener, SerialPortOpener, DEFAULT_BAUD_RATE};
use crate::hub::{ClientHub, ClientId};
use crate::manager::SessionManager;
use crate::persistence::Db;
use crate::sequence_engine::{self, SequenceEngineHandle};
use crate::trigger_engine::{self, TriggerScriptEngineHandle};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub sequence_engine: SequenceEngineHandle,
    pub trigger_engine: TriggerScriptEngineHandle,
    pub hub: Arc<ClientHub>,
    pub db: Arc<Db>,
    next_client_id: Arc<AtomicU64>,
}

impl AppState {
    /// Wires the manager and both engines together and spawns the task
    /// that relays their lifecycle events (`SequenceStarted`,
    /// `TriggerFired`, ...) out to every connected client, mirroring the
    /// corpus's `dashboard_tx` broadcast relay in `state.rs`.
    pub fn new(config: &ServerConfig, db: Arc<Db>) -> Self {
        let manager = Arc::new(SessionManager::new(config.poll));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let sequence_engine = sequence_engine::spawn(db.clone(), manager.clone(), events_tx.clone());
        let trigger_engine = trigger_engine::spawn(db.clone(), manager.clone(), sequence_engine.clone(), events_tx);

        let opener: Arc<dyn PortOpener> = Arc::new(SerialPortOpener::new(DEFAULT_BAUD_RATE));
        let candidate_ports = config.discovery.candidate_ports.clone();

        let hub = Arc::new(ClientHub::new(
            manager.clone(),
            sequence_engine.clone(),
            trigger_engine.clone(),
            db.clone(),
            candidate_ports.clone(),
            opener.clone(),
        ));

        let relay_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(msg) = events_rx.recv().await {
                relay_hub.broadcast_all(msg).await;
            }
        });

        // Reconcile against whatever's already attached before the first
        // request lands, mirroring the startup probe in spec.md §4.5.
        let startup_manager = manager.clone();
        tokio::spawn(async move {
            startup_manager.sync_devices(&candidate_ports, opener.as_ref()).await;
        });

        Self {
            manager,
            sequence_engine,
            trigger_engine,
            hub,
            db,
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}
