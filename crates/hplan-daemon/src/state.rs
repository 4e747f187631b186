//! Shared runtime state for hplan-daemon.
//!
//! Grounded on the corpus's `mqk-daemon::state` module: a cloneable
//! (`Arc`-backed) `AppState` handed to every Axum handler, a
//! `broadcast::Sender<BusMsg>` event bus also used for SSE, and a
//! periodically-refreshed status snapshot.

use std::sync::Arc;
use std::time::Duration;

use hplan_broker::PaperBroker;
use hplan_db::guardian::GuardianState;
use hplan_dispatcher::Dispatcher;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    LogLine { level: String, msg: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot of daemon state, returned by `GET /v1/status` and
/// carried inside SSE `status` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    /// Sticky: once the C10 guardian trips, this stays true until an
    /// operator clears it out-of-band (no auto-recovery, §4.10).
    pub guardian_halted: bool,
    pub notes: Option<String>,
}

fn epoch_millis_clock() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub guardian: Arc<GuardianState>,
    pub pool: PgPool,
    pub broker: Arc<PaperBroker>,
    pub dispatcher: Arc<Dispatcher<fn() -> i64>>,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status = StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            guardian_halted: false,
            notes: Some("cycle trigger not yet wired to a repository-backed context builder; dispatch and integrity endpoints are live".to_string()),
        };

        Self {
            bus,
            build: BuildInfo {
                service: "hplan-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            status: Arc::new(RwLock::new(initial_status)),
            guardian: Arc::new(GuardianState::new()),
            pool,
            broker: Arc::new(PaperBroker::new()),
            dispatcher: Arc::new(Dispatcher::new(15, 3, epoch_millis_clock as fn() -> i64)),
        }
    }
}

pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
