//! Wire-level response shapes for hplan-daemon's HTTP API.
//!
//! Kept separate from the internal domain types the same way the corpus's
//! `mqk-daemon::api_types` separates `TradingAccountResponse` etc. from
//! `mqk_schemas::BrokerAccount` — callers of the HTTP API should not need to
//! track internal enum renames.

use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct DispatchResponse {
    pub outcome: &'static str,
    pub uuid: Option<String>,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct GuardianStoreResult {
    pub store: &'static str,
    pub action: &'static str,
    pub detail: String,
}

#[derive(Serialize)]
pub struct IntegrityStatusResponse {
    pub halted: bool,
    pub integrity: Vec<GuardianStoreResult>,
    pub wal_checkpoint: Vec<GuardianStoreResult>,
}
