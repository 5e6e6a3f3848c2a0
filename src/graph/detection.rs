//! Detection reads the new message against the relationship context and
//! produces the turn's analysis artifacts: signal scores, a one-line brief,
//! a stage judgement, and any tasks the message itself demands.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::llm_json::field_str;
use crate::state::{
    DetectionOutcome, RelationshipStage, StageDirection, TurnState, TurnTask,
};

pub async fn run(
    invoker: &dyn Invoker,
    state: &mut TurnState,
    cancel: &CancellationToken,
) -> Result<(), InvokerError> {
    let mut user = String::new();
    user.push_str(&format!(
        "Current stage: {}. closeness={:.2} trust={:.2} liking={:.2} respect={:.2} warmth={:.2} power={:.2}\n",
        state.current_stage.as_str(),
        state.relationship_state.closeness,
        state.relationship_state.trust,
        state.relationship_state.liking,
        state.relationship_state.respect,
        state.relationship_state.warmth,
        state.relationship_state.power,
    ));
    let tail = state.buffer_tail_window();
    let recent = &tail[tail.len().saturating_sub(10)..];
    if !recent.is_empty() {
        user.push_str("Recent messages:\n");
        for msg in recent {
            user.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content));
        }
    }
    user.push_str(&format!("\nNew user message: {}\n", state.user_input.trim()));
    user.push_str(
        "\nAnalyze the new message:\n\
         - scores in [0,1]: conflict, pressure, sarcasm, expressiveness, self_disclosure\n\
         - brief: one sentence on what the user is doing\n\
         - implied_stage: the relationship stage this message behaves like, and direction (up/down/none)\n\
         - immediate_tasks: things THIS reply must address (answer a question, react to news)\n\
         - urgent_tasks: things to bring up soon but not necessarily now\n",
    );

    let prompt = ChatPrompt::new(
        "You analyze one turn of an ongoing private chat. Be terse and concrete. JSON only.",
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "scores": {"type": "object", "additionalProperties": {"type": "number"}},
            "brief": {"type": "string"},
            "implied_stage": {"type": "string"},
            "direction": {"type": "string", "enum": ["up", "down", "none"]},
            "immediate_tasks": {"type": "array", "items": {
                "type": "object",
                "properties": {"id": {"type": "string"}, "description": {"type": "string"}},
                "required": ["id", "description"]
            }},
            "urgent_tasks": {"type": "array", "items": {
                "type": "object",
                "properties": {"id": {"type": "string"}, "description": {"type": "string"}},
                "required": ["id", "description"]
            }}
        },
        "required": ["scores", "brief"]
    });

    let value = invoke_with_retry(invoker, Role::Main, &prompt, Some(&schema), cancel).await?;

    let mut outcome = DetectionOutcome::default();
    if let Some(scores) = value.get("scores").and_then(|v| v.as_object()) {
        for (key, raw) in scores {
            if let Some(n) = raw.as_f64() {
                outcome.scores.insert(key.clone(), n);
            }
        }
    }
    outcome.brief = field_str(&value, "brief").unwrap_or_default();
    outcome.implied_stage = field_str(&value, "implied_stage")
        .as_deref()
        .and_then(RelationshipStage::parse);
    outcome.direction = match field_str(&value, "direction").as_deref() {
        Some("up") => StageDirection::Up,
        Some("down") => StageDirection::Down,
        _ => StageDirection::None,
    };
    outcome.immediate_tasks = parse_tasks(&value, "immediate_tasks", "immediate");
    outcome.urgent_tasks = parse_tasks(&value, "urgent_tasks", "urgent");

    state.detection = outcome.clamped();
    Ok(())
}

fn parse_tasks(value: &serde_json::Value, key: &str, task_type: &str) -> Vec<TurnTask> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let description = field_str(item, "description")?;
                    Some(TurnTask {
                        id: field_str(item, "id")
                            .unwrap_or_else(|| format!("{}_{}", task_type, description.len())),
                        description,
                        task_type: task_type.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Documented fallback: zero scores, empty brief, no stage judgement.
pub fn fallback(state: &mut TurnState) {
    state.detection = DetectionOutcome::default();
}
