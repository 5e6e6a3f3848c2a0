//! Stage transitions over YAML-declared profiles. Rule precedence is
//! JUMP > DECAY > GROWTH > STAY, and profiles are evaluated in the order
//! the file declares them, so threshold collisions resolve deterministically.
//! A JUMP additionally requires the detection stage judgement to name the
//! same target; rule evidence alone never teleports the relationship.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::state::{
    RelationshipStage, StageTransition, StageTransitionKind, TurnState, STAGE_ORDER,
};

const DEFAULT_PROFILES_YAML: &str = include_str!("../../config/stages.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    #[serde(default = "default_jump_threshold")]
    pub jump_delta_threshold: f64,
    #[serde(default = "default_power_threshold")]
    pub power_balance_threshold: f64,
}

fn default_jump_threshold() -> f64 {
    0.25
}

fn default_power_threshold() -> f64 {
    0.3
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrowthRule {
    /// Every listed dimension must be at least this high.
    #[serde(default)]
    pub min_scores: HashMap<String, f64>,
    /// Every listed dimension must be at most this low (erosion-driven
    /// growth on the coming-apart side).
    #[serde(default)]
    pub max_scores: HashMap<String, f64>,
    /// Floors that veto the move even when the entry criteria pass.
    #[serde(default)]
    pub veto_min_scores: HashMap<String, f64>,
    #[serde(default)]
    pub check_power_balance: bool,
    #[serde(default)]
    pub min_user_turns: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecayRule {
    /// Any dimension at or below its limit triggers the fallback.
    #[serde(default)]
    pub max_scores: HashMap<String, f64>,
    /// Any dimension at or above its limit triggers recovery (backward on
    /// the coming-apart side).
    #[serde(default)]
    pub min_scores: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageProfile {
    pub id: String,
    #[serde(default)]
    pub growth: GrowthRule,
    #[serde(default)]
    pub decay: DecayRule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageProfileSet {
    pub settings: StageSettings,
    pub stages: Vec<StageProfile>,
}

impl StageProfileSet {
    pub fn builtin() -> Self {
        serde_yaml::from_str(DEFAULT_PROFILES_YAML).expect("built-in stage profiles parse")
    }

    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(Path::new(path))
                    .with_context(|| format!("Failed to read stage profiles {}", path))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("Failed to parse stage profiles {}", path))
            }
            None => Ok(Self::builtin()),
        }
    }

    fn profile_for(&self, stage: RelationshipStage) -> Option<&StageProfile> {
        self.stages.iter().find(|p| p.id == stage.as_str())
    }

    /// Decide this turn's transition and apply it to the state.
    pub fn evaluate(&self, state: &mut TurnState) -> StageTransition {
        let current = state.current_stage;
        let transition = self.decide(state, current);
        state.current_stage = transition.to;
        state.stage_transition = Some(transition.clone());
        if transition.kind != StageTransitionKind::Stay {
            tracing::info!(
                "stage {} -> {} ({:?}): {}",
                transition.from.as_str(),
                transition.to.as_str(),
                transition.kind,
                transition.reason
            );
        }
        transition
    }

    fn decide(&self, state: &TurnState, current: RelationshipStage) -> StageTransition {
        if let Some(jump) = self.check_jump(state, current) {
            return jump;
        }
        if let Some(decay) = self.check_decay(state, current) {
            return decay;
        }
        if let Some(growth) = self.check_growth(state, current) {
            return growth;
        }
        StageTransition {
            from: current,
            to: current,
            kind: StageTransitionKind::Stay,
            reason: "stable".to_string(),
        }
    }

    fn check_jump(&self, state: &TurnState, current: RelationshipStage) -> Option<StageTransition> {
        let threshold = self.settings.jump_delta_threshold;
        let deltas = &state.relationship_deltas_applied;
        let delta = |dim: &str| deltas.get(dim).copied().unwrap_or(0.0);

        let mut candidates: Vec<(RelationshipStage, String)> = Vec::new();
        if delta("trust") <= -threshold {
            candidates.push((
                RelationshipStage::Terminating,
                format!("catastrophic trust failure (delta {:.2})", delta("trust")),
            ));
        }
        if delta("respect") <= -threshold {
            candidates.push((
                RelationshipStage::Differentiating,
                format!("sudden loss of respect (delta {:.2})", delta("respect")),
            ));
        }
        let best_positive = ["closeness", "trust", "liking"]
            .iter()
            .map(|d| delta(d))
            .fold(0.0f64, f64::max);
        if best_positive >= threshold {
            if let Some(implied) = state.detection.implied_stage {
                candidates.push((
                    implied,
                    format!("rapid acceleration (delta {:.2})", best_positive),
                ));
            }
        }

        for (target, reason) in candidates {
            // Forward by more than one step, and detection must agree.
            if target.ordinal() <= current.ordinal() + 1 {
                continue;
            }
            if state.detection.implied_stage != Some(target) {
                tracing::debug!(
                    "jump to {} blocked: detection implies {:?}",
                    target.as_str(),
                    state.detection.implied_stage.map(|s| s.as_str())
                );
                continue;
            }
            return Some(StageTransition {
                from: current,
                to: target,
                kind: StageTransitionKind::Jump,
                reason,
            });
        }
        None
    }

    fn check_decay(&self, state: &TurnState, current: RelationshipStage) -> Option<StageTransition> {
        let target = current.prev()?;
        let profile = self.profile_for(current)?;
        let scores = &state.relationship_state;

        for (dim, limit) in &profile.decay.max_scores {
            if scores.get(dim) <= *limit {
                return Some(StageTransition {
                    from: current,
                    to: target,
                    kind: StageTransitionKind::Decay,
                    reason: format!("{} dropped to {:.2} (<= {:.2})", dim, scores.get(dim), limit),
                });
            }
        }
        for (dim, limit) in &profile.decay.min_scores {
            if scores.get(dim) >= *limit {
                return Some(StageTransition {
                    from: current,
                    to: target,
                    kind: StageTransitionKind::Decay,
                    reason: format!(
                        "{} recovered to {:.2} (>= {:.2})",
                        dim,
                        scores.get(dim),
                        limit
                    ),
                });
            }
        }
        None
    }

    fn check_growth(&self, state: &TurnState, current: RelationshipStage) -> Option<StageTransition> {
        let target = current.next()?;
        let profile = self.profile_for(current)?;
        let rule = &profile.growth;
        if rule.min_scores.is_empty() && rule.max_scores.is_empty() {
            return None;
        }
        let scores = &state.relationship_state;

        if state.count_user_turns() < rule.min_user_turns as usize {
            return None;
        }
        for (dim, min) in &rule.min_scores {
            if scores.get(dim) < *min {
                return None;
            }
        }
        for (dim, max) in &rule.max_scores {
            if scores.get(dim) > *max {
                return None;
            }
        }
        for (dim, min) in &rule.veto_min_scores {
            if scores.get(dim) < *min {
                tracing::debug!("growth vetoed: {} below floor {:.2}", dim, min);
                return None;
            }
        }
        if rule.check_power_balance {
            let imbalance = (scores.power - 0.5).abs() * 2.0;
            if imbalance > self.settings.power_balance_threshold {
                tracing::debug!("growth vetoed: power imbalance {:.2}", imbalance);
                return None;
            }
        }

        Some(StageTransition {
            from: current,
            to: target,
            kind: StageTransitionKind::Growth,
            reason: "entry criteria met".to_string(),
        })
    }
}

/// Sanity check used by the executor's invariant gate.
pub fn is_known_stage(stage: RelationshipStage) -> bool {
    STAGE_ORDER.contains(&stage)
}
