//! Budget planning and task selection ahead of the search. One fast-role
//! call sets the word budget, the task budget, and picks which candidate
//! tasks ride along; urgent tasks bypass the LLM entirely.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::state::{TurnState, TurnTask};

const MAX_SELECTED: usize = 3;

/// Conversational nudges used when nothing else is on the docket.
fn daily_pool() -> Vec<TurnTask> {
    vec![
        TurnTask {
            id: "daily_echo".to_string(),
            description: "对对方刚说的点做一点共鸣或接话".to_string(),
            task_type: "daily".to_string(),
        },
        TurnTask {
            id: "daily_hook".to_string(),
            description: "留一个小钩子让话题能继续".to_string(),
            task_type: "daily".to_string(),
        },
    ]
}

/// Tasks phrased like assistant chores poison the planner; drop them before
/// they reach the candidate list.
fn is_systemic_task(description: &str) -> bool {
    ["帮助用户", "解答", "提供信息", "服务", "协助"]
        .iter()
        .any(|marker| description.contains(marker))
}

pub async fn run(
    invoker: &dyn Invoker,
    state: &mut TurnState,
    cancel: &CancellationToken,
) -> Result<(), InvokerError> {
    let mut candidates: Vec<TurnTask> = Vec::new();
    candidates.extend(state.detection.immediate_tasks.iter().cloned());
    candidates.extend(daily_pool());
    candidates.retain(|t| !is_systemic_task(&t.description));

    let urgent: Vec<TurnTask> = state.pending_urgent_tasks.clone();

    if candidates.is_empty() && urgent.is_empty() {
        state.set_word_budget(40);
        state.set_task_budget_max(1);
        state.tasks_for_search = Vec::new();
        return Ok(());
    }

    let mut user = String::new();
    user.push_str(&format!(
        "Stage: {}. Mood busyness: {:.2}. Closeness: {:.2}\n",
        state.current_stage.as_str(),
        state.mood_state.busyness,
        state.relationship_state.closeness,
    ));
    user.push_str(&format!("User said: {}\n", state.user_input.trim()));
    if !state.detection.brief.is_empty() {
        user.push_str(&format!("Analysis: {}\n", state.detection.brief));
    }
    user.push_str("\nCandidate tasks:\n");
    for (i, task) in candidates.iter().enumerate() {
        user.push_str(&format!("  {}: {}\n", i, task.description));
    }
    user.push_str(
        "\nDecide:\n\
         - word_budget (0-60): how long the reply should be; busy or distant means shorter\n\
         - task_budget_max (0-2): how many tasks the reply may actually work in\n\
         - selected: indices of the most relevant tasks, at most 3\n",
    );

    let prompt = ChatPrompt::new(
        "You plan the shape of one chat reply. Small budgets read more human. JSON only.",
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "word_budget": {"type": "integer"},
            "task_budget_max": {"type": "integer"},
            "selected": {"type": "array", "items": {"type": "integer"}}
        },
        "required": ["word_budget", "task_budget_max", "selected"]
    });

    match invoke_with_retry(invoker, Role::Fast, &prompt, Some(&schema), cancel).await {
        Ok(value) => {
            let word_budget = value
                .get("word_budget")
                .and_then(|v| v.as_i64())
                .unwrap_or(40)
                .clamp(0, 60) as u32;
            let task_budget = value
                .get("task_budget_max")
                .and_then(|v| v.as_i64())
                .unwrap_or(1)
                .clamp(0, 2) as u32;
            let mut selected: Vec<TurnTask> = value
                .get("selected")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_u64())
                        .filter_map(|i| candidates.get(i as usize).cloned())
                        .take(MAX_SELECTED)
                        .collect()
                })
                .unwrap_or_default();

            // Urgent tasks ride along regardless of what the planner picked.
            for task in urgent {
                if !selected.iter().any(|t| t.id == task.id) {
                    selected.insert(0, task);
                }
            }

            state.set_word_budget(word_budget);
            state.set_task_budget_max(task_budget);
            state.tasks_for_search = selected;
            Ok(())
        }
        Err(e) if e.is_canceled() => Err(e),
        Err(e) => {
            fallback(state, candidates, urgent);
            state.record_error("task_plan", e);
            Ok(())
        }
    }
}

fn fallback(state: &mut TurnState, candidates: Vec<TurnTask>, urgent: Vec<TurnTask>) {
    state.set_word_budget(40);
    state.set_task_budget_max(2);
    let mut selected: Vec<TurnTask> = urgent;
    selected.extend(candidates.into_iter().take(2));
    selected.truncate(MAX_SELECTED);
    state.tasks_for_search = selected;
}
