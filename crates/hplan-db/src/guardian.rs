//! C10 — database integrity guardian.
//!
//! Two periodic checks over the system's stores (§4.10): an integrity probe
//! over the core stores (fatal on anything but "ok", sticky once tripped —
//! mirrors the halted/disarmed precedence in the corpus's bar-integrity
//! engine) and a WAL checkpoint probe over all stores (warning only). Nil
//! stores are skipped, not failed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hplan_config::GuardianSettings;
use sqlx::PgPool;
use tracing::{error, warn};

/// The stores the guardian watches. The core four gate arming of a new
/// planning cycle; history/cache/client-data are checkpoint-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreKind {
    Universe,
    Config,
    Ledger,
    Portfolio,
    History,
    Cache,
    ClientData,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Universe => "universe",
            StoreKind::Config => "config",
            StoreKind::Ledger => "ledger",
            StoreKind::Portfolio => "portfolio",
            StoreKind::History => "history",
            StoreKind::Cache => "cache",
            StoreKind::ClientData => "client-data",
        }
    }

    pub fn is_core(&self) -> bool {
        matches!(
            self,
            StoreKind::Universe | StoreKind::Config | StoreKind::Ledger | StoreKind::Portfolio
        )
    }

    pub const CORE: [StoreKind; 4] = [
        StoreKind::Universe,
        StoreKind::Config,
        StoreKind::Ledger,
        StoreKind::Portfolio,
    ];

    pub const ALL: [StoreKind; 7] = [
        StoreKind::Universe,
        StoreKind::Config,
        StoreKind::Ledger,
        StoreKind::Portfolio,
        StoreKind::History,
        StoreKind::Cache,
        StoreKind::ClientData,
    ];
}

/// An integrity probe for one store. Returns `Ok("ok")` when healthy; any
/// other status string (or an `Err`) is treated as a failed probe.
#[async_trait]
pub trait IntegrityProbe: Send + Sync {
    async fn check(&self) -> Result<String, String>;
}

/// A passive WAL checkpoint probe. Returns the number of checkpointable
/// frames observed.
#[async_trait]
pub trait CheckpointProbe: Send + Sync {
    async fn checkpoint(&self) -> Result<i64, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianAction {
    Ok,
    Warn,
    Halt,
    AlreadyHalted,
    Skipped,
}

impl GuardianAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardianAction::Ok => "ok",
            GuardianAction::Warn => "warn",
            GuardianAction::Halt => "halt",
            GuardianAction::AlreadyHalted => "already_halted",
            GuardianAction::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianDecision {
    pub store: StoreKind,
    pub action: GuardianAction,
    pub detail: String,
}

/// Sticky guardian state: once an integrity probe fails, the guardian stays
/// halted until an operator clears it out-of-band (no auto-recovery, §4.10).
#[derive(Debug, Default)]
pub struct GuardianState {
    inner: Mutex<bool>,
}

impl GuardianState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.inner.lock().expect("guardian state mutex poisoned")
    }

    fn halt(&self) {
        *self.inner.lock().expect("guardian state mutex poisoned") = true;
    }
}

/// Run the integrity check across the core stores. A nil entry in `stores`
/// is skipped. The first non-"ok" probe halts the guardian (sticky) and
/// short-circuits the remaining core stores as `AlreadyHalted`.
pub async fn run_integrity_check(
    state: &GuardianState,
    stores: &BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>>,
) -> Vec<GuardianDecision> {
    let mut decisions = Vec::with_capacity(StoreKind::CORE.len());

    for kind in StoreKind::CORE {
        if state.is_halted() {
            decisions.push(GuardianDecision {
                store: kind,
                action: GuardianAction::AlreadyHalted,
                detail: "guardian already halted by a prior integrity failure".to_string(),
            });
            continue;
        }

        let Some(Some(probe)) = stores.get(&kind) else {
            decisions.push(GuardianDecision {
                store: kind,
                action: GuardianAction::Skipped,
                detail: "store not configured".to_string(),
            });
            continue;
        };

        match probe.check().await {
            Ok(status) if status == "ok" => {
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Ok,
                    detail: status,
                });
            }
            Ok(status) => {
                error!(store = kind.name(), status = %status, "core store integrity probe failed");
                state.halt();
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Halt,
                    detail: status,
                });
            }
            Err(e) => {
                error!(store = kind.name(), error = %e, "core store integrity probe errored");
                state.halt();
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Halt,
                    detail: e,
                });
            }
        }
    }

    decisions
}

/// Run the WAL checkpoint check across all stores. Non-fatal: a frame count
/// above `settings.wal_checkpoint_warn_frames` is logged as a warning, never
/// halts the guardian.
pub async fn run_wal_checkpoint_check(
    settings: &GuardianSettings,
    stores: &BTreeMap<StoreKind, Option<Box<dyn CheckpointProbe>>>,
) -> Vec<GuardianDecision> {
    let mut decisions = Vec::with_capacity(StoreKind::ALL.len());

    for kind in StoreKind::ALL {
        let Some(Some(probe)) = stores.get(&kind) else {
            decisions.push(GuardianDecision {
                store: kind,
                action: GuardianAction::Skipped,
                detail: "store not configured".to_string(),
            });
            continue;
        };

        match probe.checkpoint().await {
            Ok(frames) if frames > settings.wal_checkpoint_warn_frames => {
                warn!(store = kind.name(), frames, "WAL checkpoint frame count above threshold");
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Warn,
                    detail: format!("{frames} checkpointable frames"),
                });
            }
            Ok(frames) => {
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Ok,
                    detail: format!("{frames} checkpointable frames"),
                });
            }
            Err(e) => {
                warn!(store = kind.name(), error = %e, "WAL checkpoint probe errored");
                decisions.push(GuardianDecision {
                    store: kind,
                    action: GuardianAction::Warn,
                    detail: e,
                });
            }
        }
    }

    decisions
}

/// Postgres-backed probe shared by every store kind known to this daemon's
/// single database: integrity is "can we read the table this store maps
/// to", checkpoint frames are read from `pg_stat_bgwriter` (a single
/// cluster-wide counter, used here as a stand-in for a per-store WAL
/// checkpoint metric since every store shares one Postgres instance).
pub struct PgStoreProbe {
    pool: PgPool,
    table: &'static str,
}

impl PgStoreProbe {
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl IntegrityProbe for PgStoreProbe {
    async fn check(&self) -> Result<String, String> {
        let row: (bool,) = sqlx::query_as(
            r#"
            select exists (
                select 1 from information_schema.tables
                where table_schema = 'public' and table_name = $1
            )
            "#,
        )
        .bind(self.table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if !row.0 {
            return Ok(format!("missing table {}", self.table));
        }

        sqlx::query(&format!("select 1 from {} limit 1", self.table))
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok("ok".to_string())
    }
}

#[async_trait]
impl CheckpointProbe for PgStoreProbe {
    async fn checkpoint(&self) -> Result<i64, String> {
        let row: (i64,) =
            sqlx::query_as("select coalesce(buffers_checkpoint, 0) from pg_stat_bgwriter")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Result<String, String>);
    #[async_trait]
    impl IntegrityProbe for FixedProbe {
        async fn check(&self) -> Result<String, String> {
            self.0.clone()
        }
    }

    struct FixedCheckpoint(Result<i64, String>);
    #[async_trait]
    impl CheckpointProbe for FixedCheckpoint {
        async fn checkpoint(&self) -> Result<i64, String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn nil_stores_are_skipped_not_failed() {
        let state = GuardianState::new();
        let stores: BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>> = BTreeMap::new();
        let decisions = run_integrity_check(&state, &stores).await;
        assert_eq!(decisions.len(), 4);
        assert!(decisions.iter().all(|d| d.action == GuardianAction::Skipped));
        assert!(!state.is_halted());
    }

    #[tokio::test]
    async fn non_ok_status_halts_and_short_circuits_remaining_stores() {
        let state = GuardianState::new();
        let mut stores: BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>> = BTreeMap::new();
        stores.insert(
            StoreKind::Universe,
            Some(Box::new(FixedProbe(Ok("corrupt".to_string())))),
        );
        stores.insert(
            StoreKind::Config,
            Some(Box::new(FixedProbe(Ok("ok".to_string())))),
        );

        let decisions = run_integrity_check(&state, &stores).await;
        assert_eq!(decisions[0].action, GuardianAction::Halt);
        assert!(state.is_halted());
        // Config was listed after Universe in CORE order, so by the time it
        // ran the guardian was already halted.
        assert_eq!(decisions[1].action, GuardianAction::AlreadyHalted);
    }

    #[tokio::test]
    async fn checkpoint_check_warns_above_threshold_without_halting() {
        let settings = GuardianSettings {
            wal_checkpoint_warn_frames: 10,
        };
        let mut stores: BTreeMap<StoreKind, Option<Box<dyn CheckpointProbe>>> = BTreeMap::new();
        stores.insert(StoreKind::Cache, Some(Box::new(FixedCheckpoint(Ok(50)))));
        stores.insert(StoreKind::History, Some(Box::new(FixedCheckpoint(Ok(1)))));

        let decisions = run_wal_checkpoint_check(&settings, &stores).await;
        let cache = decisions.iter().find(|d| d.store == StoreKind::Cache).unwrap();
        let history = decisions.iter().find(|d| d.store == StoreKind::History).unwrap();
        assert_eq!(cache.action, GuardianAction::Warn);
        assert_eq!(history.action, GuardianAction::Ok);
    }

    #[tokio::test]
    async fn probe_error_is_treated_as_integrity_failure() {
        let state = GuardianState::new();
        let mut stores: BTreeMap<StoreKind, Option<Box<dyn IntegrityProbe>>> = BTreeMap::new();
        stores.insert(
            StoreKind::Ledger,
            Some(Box::new(FixedProbe(Err("connection reset".to_string())))),
        );

        let decisions = run_integrity_check(&state, &stores).await;
        let ledger = decisions.iter().find(|d| d.store == StoreKind::Ledger).unwrap();
        assert_eq!(ledger.action, GuardianAction::Halt);
        assert!(state.is_halted());
    }
}
