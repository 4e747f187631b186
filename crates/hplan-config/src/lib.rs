//! Layered TOML configuration for the planning core.
//!
//! Mirrors the corpus's `load_layered_yaml` / `deep_merge` / `canonicalize_json`
//! architecture, but parses TOML (§9 Design Notes: "Configuration as TOML with
//! nested tables") into a single strongly typed [`PlannerConfig`] rather than a
//! loose JSON bag. Unknown keys are accepted and ignored (§6); missing keys
//! fall back to `Default::default()`.

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `evaluation_mode` (§4.5): selects C6 scoring semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    SingleObjective,
    MultiObjective,
    Stochastic,
    MonteCarlo,
}

impl Default for EvaluationMode {
    fn default() -> Self {
        EvaluationMode::SingleObjective
    }
}

/// Global planner knobs recognized per §4.5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub max_plan_depth: u32,
    pub max_opportunities_per_category: u32,
    pub priority_threshold: f64,
    pub transaction_cost_fixed_eur: f64,
    pub transaction_cost_percent: f64,
    pub evaluation_mode: EvaluationMode,
    pub beam_width: u32,
    pub cost_penalty_factor: f64,
    /// Number of price-shift scenarios averaged in `stochastic` mode.
    pub stochastic_scenarios: u32,
    /// Number of simulated price paths averaged in `monte_carlo` mode.
    pub monte_carlo_paths: u32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_plan_depth: 5,
            max_opportunities_per_category: 20,
            priority_threshold: 0.0,
            transaction_cost_fixed_eur: 0.0,
            transaction_cost_percent: 0.0,
            evaluation_mode: EvaluationMode::SingleObjective,
            beam_width: 0,
            cost_penalty_factor: 1.0,
            stochastic_scenarios: 5,
            monte_carlo_paths: 50,
        }
    }
}

/// §4.4 optimizer Settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Linear blend between return-seeking (1.0) and stability (0.0) objectives.
    pub blend: f64,
    pub target_return: f64,
    pub min_cash_reserve_pct: f64,
    pub transaction_cost_percent: f64,
    pub max_concentration: f64,
    pub return_threshold_pct: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            blend: 0.5,
            target_return: 0.08,
            min_cash_reserve_pct: 0.02,
            transaction_cost_percent: 0.001,
            max_concentration: 0.15,
            return_threshold_pct: 0.0,
        }
    }
}

/// C6 evaluator worker-pool / cache knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub worker_count: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self { worker_count: 10 }
    }
}

/// Research-mode virtual cash injection (§4.3 step 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchSettings {
    pub enabled: bool,
    pub virtual_cash_eur: f64,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            virtual_cash_eur: 0.0,
        }
    }
}

/// C9 dispatcher throttle/retry knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub throttle_window_minutes: i64,
    pub max_retries: i32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            throttle_window_minutes: 15,
            max_retries: 3,
        }
    }
}

/// C2 price cache TTL knobs (§4.2 step 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    pub fresh_ttl_minutes_market_open: i64,
    pub fresh_ttl_minutes_market_closed: i64,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            fresh_ttl_minutes_market_open: 30,
            fresh_ttl_minutes_market_closed: 24 * 60,
        }
    }
}

/// C10 guardian thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianSettings {
    pub wal_checkpoint_warn_frames: i64,
}

impl Default for GuardianSettings {
    fn default() -> Self {
        Self {
            wal_checkpoint_warn_frames: 1000,
        }
    }
}

/// The single strongly typed configuration value consumed by C8 and C5.
///
/// Unknown TOML keys anywhere in the document are ignored (not an error);
/// missing keys fall back to the field's `Default`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub planner: PlannerSettings,
    pub optimizer: OptimizerSettings,
    pub evaluator: EvaluatorSettings,
    pub research: ResearchSettings,
    pub dispatcher: DispatcherSettings,
    pub market_data: MarketDataSettings,
    pub guardian: GuardianSettings,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PlannerConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load + merge TOML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge. Missing files are
/// skipped (layered overlays are optional by design).
pub fn load_layered_toml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = match fs::read_to_string(p) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("read config: {p}")),
        };
        let toml_val: toml::Value =
            toml::from_str(&s).with_context(|| format!("parse toml: {p}"))?;
        let json_val =
            serde_json::to_value(toml_val).context("toml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    finish_load(merged)
}

/// Load a single TOML source string directly (used by tests and the CLI's
/// `--config` flag when a literal document, not a path list, is supplied).
pub fn load_toml_str(s: &str) -> Result<LoadedConfig> {
    let toml_val: toml::Value = toml::from_str(s).context("parse toml")?;
    let json_val = serde_json::to_value(toml_val).context("toml->json conversion failed")?;
    finish_load(json_val)
}

fn finish_load(merged: Value) -> Result<LoadedConfig> {
    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    // Unknown keys are accepted and ignored: `serde(default)` on every field,
    // and we deliberately do not use `deny_unknown_fields` anywhere in
    // `PlannerConfig`, satisfying §6's "unknown keys are ignored" contract.
    let config: PlannerConfig =
        serde_json::from_str(&canonical).context("typed config parse failed")?;

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so the content hash is stable regardless of source key order.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = PlannerConfig::default();
        assert_eq!(cfg.planner.max_plan_depth, 5);
        assert_eq!(cfg.evaluator.worker_count, 10);
        assert_eq!(cfg.dispatcher.throttle_window_minutes, 15);
        assert_eq!(cfg.dispatcher.max_retries, 3);
    }

    #[test]
    fn unknown_keys_are_ignored_not_fatal() {
        let doc = r#"
            [planner]
            max_plan_depth = 7
            totally_unknown_knob = "whatever"

            [some_future_table]
            also_unknown = true
        "#;
        let loaded = load_toml_str(doc).expect("unknown keys must not be fatal");
        assert_eq!(loaded.config.planner.max_plan_depth, 7);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let doc = r#"
            [planner]
            beam_width = 3
        "#;
        let loaded = load_toml_str(doc).unwrap();
        assert_eq!(loaded.config.planner.beam_width, 3);
        assert_eq!(
            loaded.config.planner.max_plan_depth,
            PlannerSettings::default().max_plan_depth
        );
        assert_eq!(loaded.config.optimizer, OptimizerSettings::default());
    }

    #[test]
    fn config_hash_is_stable_across_key_order() {
        let a = r#"
            [planner]
            max_plan_depth = 4
            beam_width = 2
        "#;
        let b = r#"
            [planner]
            beam_width = 2
            max_plan_depth = 4
        "#;
        let loaded_a = load_toml_str(a).unwrap();
        let loaded_b = load_toml_str(b).unwrap();
        assert_eq!(loaded_a.config_hash, loaded_b.config_hash);
    }

    #[test]
    fn layered_override_later_file_wins() {
        let dir = std::env::temp_dir().join(format!(
            "hplan-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("base.toml");
        let overlay = dir.join("overlay.toml");
        std::fs::write(&base, "[planner]\nmax_plan_depth = 3\n").unwrap();
        std::fs::write(&overlay, "[planner]\nmax_plan_depth = 9\n").unwrap();

        let base_str = base.to_str().unwrap();
        let overlay_str = overlay.to_str().unwrap();
        let loaded = load_layered_toml(&[base_str, overlay_str]).unwrap();
        assert_eq!(loaded.config.planner.max_plan_depth, 9);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_layer_file_is_skipped_not_fatal() {
        let loaded = load_layered_toml(&["/nonexistent/path/does-not-exist.toml"]).unwrap();
        assert_eq!(loaded.config, PlannerConfig::default());
    }
}
