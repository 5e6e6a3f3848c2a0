//! Inner monologue: a private first-person beat the planner and judges read
//! but the user never sees, plus the persona keys worth surfacing this turn.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::llm_json::field_str;
use crate::state::TurnState;

pub async fn run(
    invoker: &dyn Invoker,
    state: &mut TurnState,
    cancel: &CancellationToken,
) -> Result<(), InvokerError> {
    let mut user = String::new();
    user.push_str(&format!(
        "Stage: {}. Mood: pleasure={:.2} arousal={:.2} busyness={:.2}\n",
        state.current_stage.as_str(),
        state.mood_state.pleasure,
        state.mood_state.arousal,
        state.mood_state.busyness,
    ));
    if !state.detection.brief.is_empty() {
        user.push_str(&format!("Analysis: {}\n", state.detection.brief));
    }
    if !state.bot_persona.attributes.is_empty() {
        user.push_str("Persona attributes on file: ");
        let keys: Vec<&str> = state.bot_persona.attributes.keys().map(|k| k.as_str()).collect();
        user.push_str(&keys.join(", "));
        user.push('\n');
    }
    user.push_str(&format!("\nUser said: {}\n", state.user_input.trim()));
    user.push_str(
        "\nWrite 1-3 sentences of inner monologue, first person, how this lands on you right now. \
         Then pick up to 3 persona attribute keys relevant to replying (empty list is fine).",
    );

    let prompt = ChatPrompt::new(
        format!(
            "You are the private thoughts of {} ({}). Honest, informal, never addressed to the user.",
            state.bot_basic_info.name, state.bot_basic_info.speaking_style,
        ),
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "inner_monologue": {"type": "string"},
            "selected_profile_keys": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["inner_monologue"]
    });

    let value = invoke_with_retry(invoker, Role::Main, &prompt, Some(&schema), cancel).await?;

    state.inner_monologue = field_str(&value, "inner_monologue").unwrap_or_default();
    state.selected_profile_keys = value
        .get("selected_profile_keys")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .take(3)
                .collect()
        })
        .unwrap_or_default();
    Ok(())
}

/// Documented fallback: empty monologue, no selected keys.
pub fn fallback(state: &mut TurnState) {
    state.inner_monologue.clear();
    state.selected_profile_keys.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_turn_state, ScriptedInvoker};

    #[tokio::test]
    async fn monologue_and_keys_are_captured() {
        let invoker = ScriptedInvoker::new();
        invoker.push(
            Role::Main,
            json!({
                "inner_monologue": "他今天好像心情不错，我也跟着轻松一点。",
                "selected_profile_keys": ["catchphrase", "fav_food", "hometown", "extra"]
            }),
        );
        let mut state = sample_turn_state("今天超顺利！");
        run(&invoker, &mut state, &CancellationToken::new())
            .await
            .expect("monologue");
        assert!(!state.inner_monologue.is_empty());
        assert_eq!(state.selected_profile_keys.len(), 3, "capped at three keys");
    }
}
