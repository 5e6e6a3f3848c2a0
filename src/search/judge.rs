//! Judge-role calls: the batch boolean gate and the structured soft scorer.
//!
//! Two rules are enforced in code rather than trusted to the model: a
//! candidate with any gate boolean false (or missing) is dropped, and a soft
//! score with assistantiness > 0.5 or immersion_break > 0.2 has its overall
//! clamped below 0.3 before it can influence the tree.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::llm_json::{field_bool, field_f64};
use crate::state::{ReplyPlan, TurnState};

pub const ASSISTANTINESS_CLAMP: f64 = 0.5;
pub const IMMERSION_CLAMP: f64 = 0.2;
pub const CLAMPED_OVERALL: f64 = 0.29;

#[derive(Debug, Clone, Copy, Default)]
pub struct GateVerdict {
    pub assistantiness_ok: bool,
    pub identity_ok: bool,
    pub immersion_ok: bool,
}

impl GateVerdict {
    pub fn passes(&self) -> bool {
        self.assistantiness_ok && self.identity_ok && self.immersion_ok
    }
}

/// Structured soft-score breakdown. `complete` records whether the model
/// actually produced every field; the early-exit gate treats a partial
/// breakdown as a failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftScore {
    pub assistantiness: f64,
    pub immersion_break: f64,
    pub persona_consistency: f64,
    pub relationship_fit: f64,
    pub mode_behavior_fit: f64,
    pub plan_alignment: f64,
    pub overall_score: f64,
    pub complete: bool,
}

impl SoftScore {
    /// Hard rule on top of whatever the judge said.
    pub fn apply_clamp(mut self) -> Self {
        if self.assistantiness > ASSISTANTINESS_CLAMP || self.immersion_break > IMMERSION_CLAMP {
            self.overall_score = self.overall_score.min(CLAMPED_OVERALL);
        }
        self
    }
}

pub fn parse_soft_score(value: &Value) -> SoftScore {
    let assistantiness = field_f64(value, "assistantiness");
    let immersion_break = field_f64(value, "immersion_break");
    let persona_consistency = field_f64(value, "persona_consistency");
    let relationship_fit = field_f64(value, "relationship_fit");
    let mode_behavior_fit = field_f64(value, "mode_behavior_fit");
    let plan_alignment = field_f64(value, "plan_alignment");
    let overall_score = field_f64(value, "overall_score");

    let complete = assistantiness.is_some()
        && immersion_break.is_some()
        && persona_consistency.is_some()
        && relationship_fit.is_some()
        && mode_behavior_fit.is_some()
        && plan_alignment.is_some()
        && overall_score.is_some();

    SoftScore {
        assistantiness: assistantiness.unwrap_or(1.0).clamp(0.0, 1.0),
        immersion_break: immersion_break.unwrap_or(1.0).clamp(0.0, 1.0),
        persona_consistency: persona_consistency.unwrap_or(0.0).clamp(0.0, 1.0),
        relationship_fit: relationship_fit.unwrap_or(0.0).clamp(0.0, 1.0),
        mode_behavior_fit: mode_behavior_fit.unwrap_or(0.0).clamp(0.0, 1.0),
        plan_alignment: plan_alignment.unwrap_or(0.0).clamp(0.0, 1.0),
        overall_score: overall_score.unwrap_or(0.0).clamp(0.0, 1.0),
        complete,
    }
    .apply_clamp()
}

fn persona_context(state: &TurnState) -> String {
    let mut ctx = String::new();
    ctx.push_str(&format!(
        "Bot: {} ({}, {}). Speaking style: {}\n",
        state.bot_basic_info.name,
        state.bot_basic_info.age,
        state.bot_basic_info.occupation,
        state.bot_basic_info.speaking_style,
    ));
    ctx.push_str(&format!(
        "Relationship stage: {}. closeness={:.2} trust={:.2} liking={:.2} respect={:.2} warmth={:.2} power={:.2}\n",
        state.current_stage.as_str(),
        state.relationship_state.closeness,
        state.relationship_state.trust,
        state.relationship_state.liking,
        state.relationship_state.respect,
        state.relationship_state.warmth,
        state.relationship_state.power,
    ));
    ctx.push_str(&format!(
        "Mood: pleasure={:.2} arousal={:.2} dominance={:.2} busyness={:.2}\n",
        state.mood_state.pleasure,
        state.mood_state.arousal,
        state.mood_state.dominance,
        state.mood_state.busyness,
    ));
    ctx.push_str(&format!("User said: {}\n", state.user_input.trim()));
    ctx
}

fn render_candidate(plan: &ReplyPlan) -> String {
    plan.messages
        .iter()
        .map(|m| m.content.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" / ")
}

/// One judge call covering the whole batch: three booleans per candidate.
/// A judge failure drops every candidate of this rollout (the error policy
/// discards the rollout, not the turn).
pub async fn batch_gate(
    invoker: &dyn Invoker,
    state: &TurnState,
    candidates: &[&ReplyPlan],
    cancel: &CancellationToken,
) -> Result<Vec<GateVerdict>, InvokerError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut user = persona_context(state);
    user.push_str("\nCandidate replies:\n");
    for (i, plan) in candidates.iter().enumerate() {
        user.push_str(&format!("{}: {}\n", i, render_candidate(plan)));
    }
    user.push_str(
        "\nFor each candidate judge three booleans:\n\
         - assistantiness_ok: reads like a friend chatting, not a helpful assistant\n\
         - identity_ok: never calls itself an AI/system/model, never claims to be someone else\n\
         - immersion_ok: stays inside the conversation, no meta talk about settings or scripts\n",
    );

    let prompt = ChatPrompt::new(
        "You are a strict reviewer of roleplay chat replies. Answer only in JSON.",
        user,
    );
    let schema = json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "index": {"type": "integer"},
                "assistantiness_ok": {"type": "boolean"},
                "identity_ok": {"type": "boolean"},
                "immersion_ok": {"type": "boolean"}
            },
            "required": ["index", "assistantiness_ok", "identity_ok", "immersion_ok"]
        }
    });

    let value = invoke_with_retry(invoker, Role::Judge, &prompt, Some(&schema), cancel).await?;

    // Missing verdicts stay false: an unjudged candidate never passes.
    let mut verdicts = vec![GateVerdict::default(); candidates.len()];
    if let Some(items) = value.as_array() {
        for item in items {
            let Some(idx) = item.get("index").and_then(|v| v.as_u64()) else {
                continue;
            };
            let idx = idx as usize;
            if idx >= verdicts.len() {
                continue;
            }
            verdicts[idx] = GateVerdict {
                assistantiness_ok: field_bool(item, "assistantiness_ok").unwrap_or(false),
                identity_ok: field_bool(item, "identity_ok").unwrap_or(false),
                immersion_ok: field_bool(item, "immersion_ok").unwrap_or(false),
            };
        }
    }
    Ok(verdicts)
}

/// Score one candidate with the structured breakdown.
pub async fn soft_score(
    invoker: &dyn Invoker,
    state: &TurnState,
    plan: &ReplyPlan,
    cancel: &CancellationToken,
) -> Result<SoftScore, InvokerError> {
    let mut user = persona_context(state);
    if !state.inner_monologue.trim().is_empty() {
        user.push_str(&format!("Inner monologue: {}\n", state.inner_monologue.trim()));
    }
    if !state.tasks_for_search.is_empty() {
        user.push_str("Planned conversational tasks:\n");
        for task in &state.tasks_for_search {
            user.push_str(&format!("- [{}] {}\n", task.id, task.description));
        }
    }
    user.push_str(&format!("\nCandidate reply: {}\n", render_candidate(plan)));
    user.push_str(
        "\nScore the candidate, all fields in [0,1]:\n\
         assistantiness (higher = more assistant-flavored), immersion_break,\n\
         persona_consistency, relationship_fit, mode_behavior_fit,\n\
         plan_alignment (covers the planned tasks it attempted), overall_score.\n",
    );

    let prompt = ChatPrompt::new(
        "You are a strict reviewer of roleplay chat replies. Answer only in JSON.",
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "assistantiness": {"type": "number"},
            "immersion_break": {"type": "number"},
            "persona_consistency": {"type": "number"},
            "relationship_fit": {"type": "number"},
            "mode_behavior_fit": {"type": "number"},
            "plan_alignment": {"type": "number"},
            "overall_score": {"type": "number"}
        },
        "required": [
            "assistantiness", "immersion_break", "persona_consistency",
            "relationship_fit", "mode_behavior_fit", "plan_alignment", "overall_score"
        ]
    });

    let value = invoke_with_retry(invoker, Role::Judge, &prompt, Some(&schema), cancel).await?;
    Ok(parse_soft_score(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_kicks_in_on_assistantiness() {
        let score = parse_soft_score(&json!({
            "assistantiness": 0.7,
            "immersion_break": 0.0,
            "persona_consistency": 0.9,
            "relationship_fit": 0.9,
            "mode_behavior_fit": 0.9,
            "plan_alignment": 0.9,
            "overall_score": 0.9
        }));
        assert!(score.overall_score < 0.3);
        assert!(score.complete);
    }

    #[test]
    fn clamp_kicks_in_on_immersion_break() {
        let score = parse_soft_score(&json!({
            "assistantiness": 0.1,
            "immersion_break": 0.4,
            "persona_consistency": 0.9,
            "relationship_fit": 0.9,
            "mode_behavior_fit": 0.9,
            "plan_alignment": 0.9,
            "overall_score": 0.95
        }));
        assert!(score.overall_score < 0.3);
    }

    #[test]
    fn good_scores_pass_through_unclamped() {
        let score = parse_soft_score(&json!({
            "assistantiness": 0.1,
            "immersion_break": 0.05,
            "persona_consistency": 0.8,
            "relationship_fit": 0.85,
            "mode_behavior_fit": 0.8,
            "plan_alignment": 0.7,
            "overall_score": 0.85
        }));
        assert!((score.overall_score - 0.85).abs() < 1e-9);
        assert!(score.complete);
    }

    #[test]
    fn missing_fields_mark_breakdown_incomplete() {
        let score = parse_soft_score(&json!({"overall_score": 0.9}));
        assert!(!score.complete);
        // Defaults are pessimistic, so the clamp fires too.
        assert!(score.overall_score < 0.3);
    }
}
