//! Axum router and HTTP handlers for hplan-daemon.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after this call so scenario tests can compose the bare router directly
//! (mirrors the corpus's `mqk-daemon::routes` shape).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use hplan_db::guardian::{
    run_integrity_check, run_wal_checkpoint_check, CheckpointProbe, GuardianSettings,
    IntegrityProbe, PgStoreProbe, StoreKind,
};

use crate::{
    api_types::{
        DispatchResponse, GuardianStoreResult, HealthResponse, IntegrityStatusResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/dispatch/run", post(dispatch_run))
        .route("/v1/integrity/status", get(integrity_status))
        .with_state(state)
}

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();
    snap.guardian_halted = st.guardian.is_halted();

    let _ = st.bus.send(BusMsg::Status(snap.clone()));
    (StatusCode::OK, Json(snap))
}

/// Only the price cache is a Postgres table this daemon owns; universe,
/// config, ledger, portfolio, history, and client-data live in repositories
/// owned elsewhere (see `hplan-context`'s repository traits), so they are
/// nil here and the guardian correctly reports them as skipped (§4.10).
fn cache_only_integrity_stores(
    pool: &sqlx::PgPool,
) -> BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>> {
    let mut stores: BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>> = BTreeMap::new();
    for kind in StoreKind::CORE {
        stores.insert(kind, None);
    }
    let _ = pool;
    stores
}

fn cache_only_checkpoint_stores(
    pool: &sqlx::PgPool,
) -> BTreeMap<StoreKind, Option<Box<dyn CheckpointProbe>>> {
    let mut stores: BTreeMap<StoreKind, Option<Box<dyn CheckpointProbe>>> = BTreeMap::new();
    for kind in StoreKind::ALL {
        stores.insert(kind, None);
    }
    stores.insert(
        StoreKind::Cache,
        Some(Box::new(PgStoreProbe::new(pool.clone(), "price_cache"))),
    );
    stores
}

async fn integrity_status(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let integrity_stores = cache_only_integrity_stores(&st.pool);
    let checkpoint_stores = cache_only_checkpoint_stores(&st.pool);

    let integrity = run_integrity_check(&st.guardian, &integrity_stores).await;
    let wal_checkpoint =
        run_wal_checkpoint_check(&GuardianSettings::default(), &checkpoint_stores).await;

    let to_wire = |d: Vec<hplan_db::guardian::GuardianDecision>| -> Vec<GuardianStoreResult> {
        d.into_iter()
            .map(|d| GuardianStoreResult {
                store: d.store.name(),
                action: d.action.as_str(),
                detail: d.detail,
            })
            .collect()
    };

    let halted = st.guardian.is_halted();
    if halted {
        let _ = st.bus.send(BusMsg::LogLine {
            level: "ERROR".to_string(),
            msg: "guardian halted: core store integrity failure".to_string(),
        });
    }

    (
        StatusCode::OK,
        Json(IntegrityStatusResponse {
            halted,
            integrity: to_wire(integrity),
            wal_checkpoint: to_wire(wal_checkpoint),
        }),
    )
}

async fn dispatch_run(State(st): State<Arc<AppState>>) -> Response {
    let outcome = match st.dispatcher.dispatch_once(&st.pool, st.broker.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(DispatchResponse {
                    outcome: "error",
                    uuid: None,
                    order_id: None,
                    reason: Some(e.to_string()),
                }),
            )
                .into_response();
        }
    };

    info!(?outcome, "dispatch/run");

    let wire = match outcome {
        hplan_dispatcher::DispatchOutcome::Throttled => DispatchResponse {
            outcome: "throttled",
            uuid: None,
            order_id: None,
            reason: None,
        },
        hplan_dispatcher::DispatchOutcome::NothingPending => DispatchResponse {
            outcome: "nothing_pending",
            uuid: None,
            order_id: None,
            reason: None,
        },
        hplan_dispatcher::DispatchOutcome::MaxRetriesExceeded { uuid } => DispatchResponse {
            outcome: "max_retries_exceeded",
            uuid: Some(uuid.to_string()),
            order_id: None,
            reason: None,
        },
        hplan_dispatcher::DispatchOutcome::Executed { uuid, order_id } => DispatchResponse {
            outcome: "executed",
            uuid: Some(uuid.to_string()),
            order_id,
            reason: None,
        },
        hplan_dispatcher::DispatchOutcome::Failed { uuid, reason } => DispatchResponse {
            outcome: "failed",
            uuid: Some(uuid.to_string()),
            order_id: None,
            reason: Some(reason),
        },
    };

    let _ = st.bus.send(BusMsg::LogLine {
        level: "INFO".to_string(),
        msg: format!("dispatch outcome: {}", wire.outcome),
    });

    (StatusCode::OK, Json(wire)).into_response()
}

async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None,
        }
    })
}
