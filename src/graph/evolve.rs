//! Relationship evolution. The fast role proposes archetype deltas in
//! -3..+3; code owns the arithmetic: normalization, the damping curve
//! (diminishing returns when already high, betrayal penalty on the way
//! down), the per-turn cap, and the [0,1] clamp. The model never writes a
//! number into the state directly.

use serde_json::json;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::config::SearchConfig;
use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::state::{clamp_signed, TurnState, RELATIONSHIP_DIMS};

const GREETING_PREFIXES: [&str; 11] = [
    "hi", "hello", "hey", "你好", "您好", "嗨", "哈喽", "早上好", "中午好", "晚上好", "晚安",
];

/// Map a raw model delta onto the 0-1 scale. The prompt asks for -3..+3
/// archetypes (0 none, ±1 slight, ±2 moderate, ±3 strong) which land on
/// ±0.3 steps; other magnitudes are tolerated and normalized.
fn normalize_delta(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    if v.abs() <= 3.0 {
        return v / 10.0;
    }
    if v.abs() <= 100.0 {
        return v / 100.0;
    }
    v.clamp(-1.0, 1.0)
}

/// Diminishing returns going up, betrayal penalty coming down.
fn damped_delta(current: f64, raw: f64) -> f64 {
    if raw > 0.0 {
        if current >= 0.9 {
            return raw * 0.1;
        }
        if current >= 0.6 {
            return raw * 0.5;
        }
        return raw;
    }
    if raw < 0.0 {
        if current >= 0.8 {
            return raw * 1.5;
        }
        return raw;
    }
    0.0
}

fn is_low_info_greeting(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() || t.chars().count() > 12 {
        return false;
    }
    let lowered = t.to_lowercase();
    GREETING_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

pub async fn run(
    invoker: &dyn Invoker,
    state: &mut TurnState,
    search_config: &SearchConfig,
    cancel: &CancellationToken,
) -> Result<(), InvokerError> {
    let analysis = match analyze(invoker, state, cancel).await {
        Ok(value) => Some(value),
        Err(e) if e.is_canceled() => return Err(e),
        Err(e) => {
            state.record_error("evolve", e);
            None
        }
    };

    if let Some(value) = analysis {
        apply_analysis(state, &value);
    }

    mark_task_outcomes(state, search_config);
    Ok(())
}

async fn analyze(
    invoker: &dyn Invoker,
    state: &TurnState,
    cancel: &CancellationToken,
) -> Result<serde_json::Value, InvokerError> {
    let mut user = String::new();
    user.push_str(&format!(
        "Current relationship: closeness={:.2} trust={:.2} liking={:.2} respect={:.2} warmth={:.2} power={:.2}\n",
        state.relationship_state.closeness,
        state.relationship_state.trust,
        state.relationship_state.liking,
        state.relationship_state.respect,
        state.relationship_state.warmth,
        state.relationship_state.power,
    ));
    if !state.detection.brief.is_empty() {
        user.push_str(&format!("This turn: {}\n", state.detection.brief));
    }
    user.push_str(&format!("User said: {}\n", state.user_input.trim()));
    user.push_str(&format!("Bot replied: {}\n", state.final_response.trim()));
    user.push_str(
        "\nOutput:\n\
         - deltas: integer -3..3 per dimension (closeness, trust, liking, respect, warmth, power); 0 means unchanged\n\
         - mood_deltas: small floats -0.3..0.3 for pleasure, arousal, dominance, busyness\n\
         - user_facts: any newly declared facts {name, nickname, gender, age_group, location, occupation}\n\
         - inferred_traits: {trait_name: short value} newly inferred about the user\n",
    );

    let prompt = ChatPrompt::new(
        "You measure how one chat exchange moved a relationship. Conservative: most turns are 0s. JSON only.",
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "deltas": {"type": "object", "additionalProperties": {"type": "number"}},
            "mood_deltas": {"type": "object", "additionalProperties": {"type": "number"}},
            "user_facts": {"type": "object", "additionalProperties": {"type": "string"}},
            "inferred_traits": {"type": "object", "additionalProperties": {"type": "string"}}
        },
        "required": ["deltas"]
    });

    invoke_with_retry(invoker, Role::Fast, &prompt, Some(&schema), cancel).await
}

fn apply_analysis(state: &mut TurnState, value: &serde_json::Value) {
    let suppress = is_low_info_greeting(&state.user_input);

    let mut deltas: HashMap<String, f64> = HashMap::new();
    if let Some(raw) = value.get("deltas").and_then(|v| v.as_object()) {
        for dim in RELATIONSHIP_DIMS {
            let Some(v) = raw.get(dim).and_then(|v| v.as_f64()) else {
                continue;
            };
            let normalized = normalize_delta(v);
            if suppress && normalized > 0.0 {
                // Pure greetings don't deepen anything.
                continue;
            }
            let damped = damped_delta(state.relationship_state.get(dim), normalized);
            if damped != 0.0 {
                deltas.insert(dim.to_string(), damped);
            }
        }
    }
    state.relationship_deltas_applied = state.relationship_state.apply_deltas(&deltas);

    if let Some(mood) = value.get("mood_deltas").and_then(|v| v.as_object()) {
        let delta = |key: &str| {
            mood.get(key)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .clamp(-0.3, 0.3)
        };
        state.mood_state.pleasure = clamp_signed(state.mood_state.pleasure + delta("pleasure"));
        state.mood_state.arousal = clamp_signed(state.mood_state.arousal + delta("arousal"));
        state.mood_state.dominance = clamp_signed(state.mood_state.dominance + delta("dominance"));
        state.mood_state.busyness =
            (state.mood_state.busyness + delta("busyness")).clamp(0.0, 1.0);
    }

    if let Some(facts) = value.get("user_facts").and_then(|v| v.as_object()) {
        let mut incoming = crate::state::UserBasicInfo::default();
        let get = |key: &str| {
            facts
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        incoming.name = get("name");
        incoming.nickname = get("nickname");
        incoming.gender = get("gender");
        incoming.age_group = get("age_group");
        incoming.location = get("location");
        incoming.occupation = get("occupation");
        state.user_basic_info.fill_missing_from(&incoming);
    }

    if let Some(traits) = value.get("inferred_traits").and_then(|v| v.as_object()) {
        for (key, raw) in traits {
            let Some(trait_value) = raw.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            // Append-only: existing inferences stand.
            state
                .user_inferred_profile
                .entry(key.clone())
                .or_insert_with(|| trait_value.to_string());
        }
    }
}

/// Resolve which search tasks were attempted/completed. Structured plans
/// report their own ids; the config bit widens "attempted" to everything
/// handed to the search.
fn mark_task_outcomes(state: &mut TurnState, search_config: &SearchConfig) {
    let Some(plan) = state.reply_plan.clone() else {
        return;
    };
    let known: Vec<String> = state.tasks_for_search.iter().map(|t| t.id.clone()).collect();

    let mut attempted: Vec<String> = plan
        .attempted_task_ids
        .iter()
        .filter(|id| known.contains(id))
        .cloned()
        .collect();
    if search_config.mark_unplanned_tasks_attempted {
        for id in &known {
            if !attempted.contains(id) {
                attempted.push(id.clone());
            }
        }
    }
    let completed: Vec<String> = plan
        .completed_task_ids
        .iter()
        .filter(|id| known.contains(id))
        .cloned()
        .collect();

    if let Some(plan) = state.reply_plan.as_mut() {
        plan.attempted_task_ids = attempted;
        plan.completed_task_ids = completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ReplyPlan, SegmentDraft, TurnTask, RELATIONSHIP_DELTA_CAP};
    use crate::test_support::{sample_turn_state, ScriptedInvoker};

    #[test]
    fn normalization_maps_archetypes_to_tenths() {
        assert!((normalize_delta(3.0) - 0.3).abs() < 1e-9);
        assert!((normalize_delta(-2.0) + 0.2).abs() < 1e-9);
        assert!((normalize_delta(25.0) - 0.25).abs() < 1e-9);
        assert_eq!(normalize_delta(f64::NAN), 0.0);
    }

    #[test]
    fn damping_shrinks_gains_and_amplifies_betrayal() {
        assert!((damped_delta(0.95, 0.3) - 0.03).abs() < 1e-9);
        assert!((damped_delta(0.7, 0.3) - 0.15).abs() < 1e-9);
        assert!((damped_delta(0.3, 0.3) - 0.3).abs() < 1e-9);
        assert!((damped_delta(0.85, -0.2) + 0.3).abs() < 1e-9);
        assert!((damped_delta(0.3, -0.2) + 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn per_turn_movement_never_exceeds_the_cap() {
        let invoker = ScriptedInvoker::new();
        invoker.push(
            Role::Fast,
            json!({"deltas": {"closeness": 3, "trust": -3, "liking": 3, "respect": 3, "warmth": 3, "power": 0}}),
        );
        let mut state = sample_turn_state("我真的特别特别感谢你今天陪我聊这些");
        state.final_response = "我一直都在呀".to_string();
        let before = state.relationship_state;

        run(&invoker, &mut state, &SearchConfig::default(), &CancellationToken::new())
            .await
            .expect("evolve");

        for dim in RELATIONSHIP_DIMS {
            let moved = (state.relationship_state.get(dim) - before.get(dim)).abs();
            assert!(
                moved <= RELATIONSHIP_DELTA_CAP + 1e-9,
                "{} moved {} > cap",
                dim,
                moved
            );
            assert!(state.relationship_state.get(dim) >= 0.0);
            assert!(state.relationship_state.get(dim) <= 1.0);
        }
    }

    #[tokio::test]
    async fn greetings_do_not_deepen_the_relationship() {
        let invoker = ScriptedInvoker::new();
        invoker.push(Role::Fast, json!({"deltas": {"closeness": 2, "trust": 1}}));
        let mut state = sample_turn_state("你好");
        state.final_response = "你好呀～".to_string();
        let before = state.relationship_state;

        run(&invoker, &mut state, &SearchConfig::default(), &CancellationToken::new())
            .await
            .expect("evolve");

        assert_eq!(state.relationship_state, before);
    }

    #[tokio::test]
    async fn inferred_profile_is_append_only_and_facts_fill_missing() {
        let invoker = ScriptedInvoker::new();
        invoker.push(
            Role::Fast,
            json!({
                "deltas": {},
                "user_facts": {"name": "小李", "location": "杭州"},
                "inferred_traits": {"communication_style": "short, playful"}
            }),
        );
        let mut state = sample_turn_state("我是小李，刚搬来杭州");
        state.user_basic_info.name = Some("老李".to_string());
        state
            .user_inferred_profile
            .insert("communication_style".to_string(), "verbose".to_string());

        run(&invoker, &mut state, &SearchConfig::default(), &CancellationToken::new())
            .await
            .expect("evolve");

        // Declared name stands; missing location fills in.
        assert_eq!(state.user_basic_info.name.as_deref(), Some("老李"));
        assert_eq!(state.user_basic_info.location.as_deref(), Some("杭州"));
        // Existing inference is not overwritten.
        assert_eq!(state.user_inferred_profile["communication_style"], "verbose");
    }

    #[tokio::test]
    async fn task_bookkeeping_respects_the_config_bit() {
        let tasks = vec![
            TurnTask {
                id: "t1".to_string(),
                description: "a".to_string(),
                task_type: "daily".to_string(),
            },
            TurnTask {
                id: "t2".to_string(),
                description: "b".to_string(),
                task_type: "daily".to_string(),
            },
        ];
        let plan = ReplyPlan {
            messages: vec![SegmentDraft::plain("嗯嗯")],
            attempted_task_ids: vec!["t1".to_string(), "ghost".to_string()],
            completed_task_ids: vec!["t1".to_string()],
        };

        // Default: trust the structured plan, unknown ids filtered out.
        let invoker = ScriptedInvoker::new();
        invoker.push(Role::Fast, json!({"deltas": {}}));
        let mut state = sample_turn_state("嗯");
        state.tasks_for_search = tasks.clone();
        state.reply_plan = Some(plan.clone());
        run(&invoker, &mut state, &SearchConfig::default(), &CancellationToken::new())
            .await
            .expect("evolve");
        let got = state.reply_plan.as_ref().unwrap();
        assert_eq!(got.attempted_task_ids, vec!["t1"]);
        assert_eq!(got.completed_task_ids, vec!["t1"]);

        // Flipped bit: everything handed over counts as attempted.
        let invoker = ScriptedInvoker::new();
        invoker.push(Role::Fast, json!({"deltas": {}}));
        let mut state = sample_turn_state("嗯");
        state.tasks_for_search = tasks;
        state.reply_plan = Some(plan);
        let config = SearchConfig {
            mark_unplanned_tasks_attempted: true,
            ..Default::default()
        };
        run(&invoker, &mut state, &config, &CancellationToken::new())
            .await
            .expect("evolve");
        let got = state.reply_plan.as_ref().unwrap();
        assert_eq!(got.attempted_task_ids, vec!["t1", "t2"]);
    }
}
