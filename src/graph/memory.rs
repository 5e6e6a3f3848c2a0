//! Memory, both directions: keyword retrieval at the head of the turn and
//! the summary/transcript refresh right before persistence.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::database::{ChatStore, DerivedNoteDraft, TranscriptDraft};
use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::llm_json::{field_f64, field_str};
use crate::state::TurnState;

const RETRIEVE_LIMIT: usize = 8;

/// Store-backed retrieval; no LLM. Keywords come from the message itself
/// plus the detection brief.
pub fn retrieve(store: &ChatStore, state: &mut TurnState) {
    let mut keywords = extract_keywords(&state.user_input);
    keywords.extend(extract_keywords(&state.detection.brief));
    keywords.dedup();

    match store.search_memories(state.user_id, &keywords, RETRIEVE_LIMIT) {
        Ok(memories) => state.retrieved_memories = memories,
        Err(e) => state.record_error("memory_retrieve", e),
    }
}

fn extract_keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation()) {
        let t = token.trim();
        if t.chars().count() >= 2 && !out.iter().any(|k| k == t) {
            out.push(t.to_string());
        }
        if out.len() >= 5 {
            break;
        }
    }
    out
}

/// Output of the memory-manage call, consumed by Persist.
#[derive(Debug, Clone)]
pub struct MemoryDrafts {
    pub conversation_summary: String,
    pub transcript: TranscriptDraft,
    pub derived_notes: Vec<DerivedNoteDraft>,
}

/// Refresh the running summary and draft the archival rows for this turn.
pub async fn manage(
    invoker: &dyn Invoker,
    state: &TurnState,
    cancel: &CancellationToken,
) -> Result<MemoryDrafts, InvokerError> {
    let mut user = String::new();
    if !state.conversation_summary.trim().is_empty() {
        user.push_str(&format!("Summary so far: {}\n", state.conversation_summary.trim()));
    }
    user.push_str(&format!("User: {}\n", state.user_input.trim()));
    user.push_str(&format!("Bot: {}\n", state.final_response.trim()));
    user.push_str(
        "\nProduce:\n\
         - summary: the running summary updated with this exchange, under 150 words\n\
         - topic: a 1-3 word topic label\n\
         - importance in [0,1]: how much this exchange matters later\n\
         - short_context: one sentence a future turn could be reminded with\n\
         - entities: {name: note} for any people/places/things mentioned\n\
         - notes: durable facts worth keeping, each {note_type: fact|preference|event, content, importance}\n",
    );

    let prompt = ChatPrompt::new(
        "You maintain long-term memory for a chat companion. Compact, factual, JSON only.",
        user,
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "topic": {"type": "string"},
            "importance": {"type": "number"},
            "short_context": {"type": "string"},
            "entities": {"type": "object", "additionalProperties": {"type": "string"}},
            "notes": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "note_type": {"type": "string"},
                    "content": {"type": "string"},
                    "importance": {"type": "number"}
                },
                "required": ["note_type", "content"]
            }}
        },
        "required": ["summary", "topic", "importance", "short_context"]
    });

    let value = invoke_with_retry(invoker, Role::Fast, &prompt, Some(&schema), cancel).await?;

    let notes = value
        .get("notes")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let content = field_str(item, "content")?;
                    Some(DerivedNoteDraft {
                        note_type: field_str(item, "note_type")
                            .unwrap_or_else(|| "fact".to_string()),
                        content,
                        importance: field_f64(item, "importance").unwrap_or(0.3).clamp(0.0, 1.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(MemoryDrafts {
        conversation_summary: field_str(&value, "summary")
            .unwrap_or_else(|| state.conversation_summary.clone()),
        transcript: TranscriptDraft {
            user_text: state.user_input.clone(),
            bot_text: state.final_response.clone(),
            entities: value.get("entities").cloned().unwrap_or_else(|| json!({})),
            topic: field_str(&value, "topic").unwrap_or_default(),
            importance: field_f64(&value, "importance").unwrap_or(0.3).clamp(0.0, 1.0),
            short_context: field_str(&value, "short_context").unwrap_or_default(),
        },
        derived_notes: notes,
    })
}

/// Fallback drafts when the memory call fails: summary untouched, a bare
/// transcript row, no notes.
pub fn fallback_drafts(state: &TurnState) -> MemoryDrafts {
    MemoryDrafts {
        conversation_summary: state.conversation_summary.clone(),
        transcript: TranscriptDraft {
            user_text: state.user_input.clone(),
            bot_text: state.final_response.clone(),
            entities: json!({}),
            topic: String::new(),
            importance: 0.3,
            short_context: String::new(),
        },
        derived_notes: Vec::new(),
    }
}
