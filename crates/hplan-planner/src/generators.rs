//! Advanced sequence generators (§4.5 step 4): enrich the sequence space
//! produced by the pattern generators with combinatorial expansion,
//! partial-execution variants, and constraint-relaxation variants, each
//! bounded by configurable caps.

use hplan_schemas::ActionSequence;

#[derive(Debug, Clone, Copy)]
pub struct GeneratorParams {
    /// Upper bound on actions per sequence considered at each depth sweep
    /// (`max_plan_depth`, 1-10 per configuration).
    pub max_plan_depth: usize,
    /// Hard cap on how many sequences a single expansion may emit, so a
    /// combinatorial blowup never reaches the evaluator unbounded.
    pub max_combinatorial_sequences: usize,
    /// Minimum candidate priority considered by combinatorial expansion.
    pub priority_threshold: f64,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            max_plan_depth: 5,
            max_combinatorial_sequences: 200,
            priority_threshold: 0.0,
        }
    }
}

/// Combinatorial expansion: every prefix of every base sequence (up to
/// `max_plan_depth`), plus whole-sequence combinations with every other
/// base sequence when within depth, bounded by `max_combinatorial_sequences`.
pub fn expand_combinatorial(base: &[ActionSequence], params: &GeneratorParams) -> Vec<ActionSequence> {
    let mut out = Vec::new();

    for seq in base {
        let filtered: Vec<_> = seq
            .actions
            .iter()
            .filter(|a| a.priority >= params.priority_threshold)
            .cloned()
            .collect();
        if filtered.is_empty() {
            continue;
        }
        let depth = filtered.len().min(params.max_plan_depth);
        out.push(ActionSequence::new(filtered[..depth].to_vec()));
        if out.len() >= params.max_combinatorial_sequences {
            return out;
        }
    }

    for i in 0..base.len() {
        for j in (i + 1)..base.len() {
            let mut combined = base[i].actions.clone();
            combined.extend(base[j].actions.clone());
            if combined.len() > params.max_plan_depth {
                combined.truncate(params.max_plan_depth);
            }
            if combined.is_empty() {
                continue;
            }
            out.push(ActionSequence::new(combined));
            if out.len() >= params.max_combinatorial_sequences {
                return out;
            }
        }
    }

    out
}

/// Partial-execution variants: for each base sequence with more than one
/// action, also propose every non-empty proper prefix — modeling "execute
/// only the first N legs this cycle".
pub fn expand_partial_execution(base: &[ActionSequence], params: &GeneratorParams) -> Vec<ActionSequence> {
    let mut out = Vec::new();
    for seq in base {
        if seq.actions.len() < 2 {
            continue;
        }
        for prefix_len in 1..seq.actions.len() {
            out.push(ActionSequence::new(seq.actions[..prefix_len].to_vec()));
            if out.len() >= params.max_combinatorial_sequences {
                return out;
            }
        }
    }
    out
}

/// Constraint-relaxation variants: drop the single lowest-priority leg
/// from each base sequence, modeling "this would fit if we relaxed one
/// constraint" without the evaluator needing to know which constraint.
pub fn expand_constraint_relaxation(base: &[ActionSequence]) -> Vec<ActionSequence> {
    let mut out = Vec::new();
    for seq in base {
        if seq.actions.len() < 2 {
            continue;
        }
        let min_idx = seq
            .actions
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.priority.partial_cmp(&b.1.priority).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i);
        if let Some(min_idx) = min_idx {
            let relaxed: Vec<_> = seq
                .actions
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != min_idx)
                .map(|(_, a)| a.clone())
                .collect();
            out.push(ActionSequence::new(relaxed));
        }
    }
    out
}

/// Run all three advanced expansions over the pattern-generator output and
/// append the original base sequences, capped overall.
pub fn generate_advanced_sequences(
    base: Vec<ActionSequence>,
    params: &GeneratorParams,
) -> Vec<ActionSequence> {
    let mut all = base.clone();
    all.extend(expand_combinatorial(&base, params));
    all.extend(expand_partial_execution(&base, params));
    all.extend(expand_constraint_relaxation(&base));
    all.truncate(params.max_combinatorial_sequences.max(base.len()));
    all
}
