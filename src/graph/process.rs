//! Reply shaping: turn the chosen plan into timed chat bubbles. Structured
//! multi-segment plans pass through; single long replies get split either by
//! the processor role or by rules keyed off personality and mood. Distant or
//! swamped bots may instead defer the whole reply for hours (macro delay).
//!
//! Split thresholds work on UTF-8 byte length, so CJK text fragments sooner
//! than ASCII at the same character count; delays use character counts.

use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessConfig;
use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::state::{
    clamp01, BotBigFive, MoodState, RelationshipStage, RelationshipState, SegmentAction,
    SegmentDraft, TurnState,
};

pub const APOLOGY_FALLBACK: &str = "抱歉，我刚才走神了。";

const MACRO_DELAY_MIN_SECS: f64 = 1800.0;
const MACRO_DELAY_MAX_SECS: f64 = 7200.0;
const MACRO_BUSYNESS_FLOOR: f64 = 0.85;

/// Probability that this stage defers the reply by hours.
fn macro_delay_probability(stage: RelationshipStage) -> f64 {
    match stage {
        RelationshipStage::Avoiding | RelationshipStage::Terminating => 0.8,
        RelationshipStage::Stagnating => 0.5,
        _ => 0.0,
    }
}

/// Decide whether to macro-delay; returns the deferral seconds if so.
pub fn macro_delay_decision(
    stage: RelationshipStage,
    busyness: f64,
    rng: &mut impl Rng,
) -> Option<f64> {
    let p = macro_delay_probability(stage);
    let triggered = busyness > MACRO_BUSYNESS_FLOOR || (p > 0.0 && rng.gen::<f64>() < p);
    if !triggered {
        return None;
    }
    Some(rng.gen_range(MACRO_DELAY_MIN_SECS..=MACRO_DELAY_MAX_SECS))
}

pub fn fragmentation_tendency(big_five: &BotBigFive, rel: &RelationshipState, mood: &MoodState) -> f64 {
    clamp01(0.4 * big_five.extraversion + 0.4 * rel.closeness + 0.2 * mood.arousal)
}

pub fn split_threshold_bytes(tendency: f64) -> usize {
    ((45.0 - 40.0 * tendency).round() as i64).clamp(5, 60) as usize
}

fn is_sentence_end(ch: char) -> bool {
    matches!(ch, '。' | '!' | '！' | '?' | '？')
}

/// Rule split: break on every newline, and on sentence enders once the
/// running buffer has reached the threshold.
pub fn rule_split(text: &str, threshold_bytes: usize, min_bubble_length: usize) -> Vec<String> {
    let mut raw: Vec<String> = Vec::new();
    let mut buf = String::new();
    for ch in text.chars() {
        if ch == '\n' {
            if !buf.trim().is_empty() {
                raw.push(buf.trim().to_string());
            }
            buf.clear();
            continue;
        }
        buf.push(ch);
        if is_sentence_end(ch) && buf.len() >= threshold_bytes {
            raw.push(buf.trim().to_string());
            buf.clear();
        }
    }
    if !buf.trim().is_empty() {
        raw.push(buf.trim().to_string());
    }

    // Short fragments merge forward instead of vanishing; if everything is
    // short the lone remainder survives.
    let mut merged: Vec<String> = Vec::new();
    let mut carry = String::new();
    for seg in raw {
        let combined = if carry.is_empty() {
            seg
        } else {
            format!("{}{}", carry, seg)
        };
        if combined.chars().count() < min_bubble_length {
            carry = combined;
        } else {
            merged.push(combined);
            carry.clear();
        }
    }
    if !carry.is_empty() {
        match merged.last_mut() {
            Some(last) => last.push_str(&carry),
            None => merged.push(carry),
        }
    }
    merged
}

/// Delays: first bubble lands immediately, later ones simulate typing at
/// `typing_rate` s/char, sped up by busyness.
pub fn assign_delays(
    segments: Vec<String>,
    typing_rate: f64,
    busyness: f64,
) -> Vec<SegmentDraft> {
    segments
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let delay = if i == 0 {
                0.0
            } else {
                (content.chars().count() as f64 * typing_rate).max(1.0) * (1.0 - clamp01(busyness))
            };
            SegmentDraft {
                action: if delay > 0.0 {
                    SegmentAction::Typing
                } else {
                    SegmentAction::Idle
                },
                content,
                delay_seconds: (delay * 100.0).round() / 100.0,
            }
        })
        .collect()
}

/// The Process stage proper. The macro-delay roll happens up front in a
/// scope of its own; thread-local RNGs must not live across an await.
pub async fn run(
    invoker: &dyn Invoker,
    state: &mut TurnState,
    config: &ProcessConfig,
    cancel: &CancellationToken,
) -> Result<(), InvokerError> {
    let macro_delay = {
        let mut rng = rand::thread_rng();
        macro_delay_decision(state.current_stage, state.mood_state.busyness, &mut rng)
    };
    if let Some(secs) = macro_delay {
        state.is_macro_delay = true;
        state.macro_delay_seconds = Some(secs);
        state.final_segments = Vec::new();
        state.final_response = String::new();
        tracing::info!(
            "macro delay: stage {} defers reply by {:.0}s",
            state.current_stage.as_str(),
            secs
        );
        return Ok(());
    }

    let plan = state.reply_plan.clone().unwrap_or_default();
    let has_delays = plan.messages.iter().skip(1).any(|m| m.delay_seconds > 0.0);

    let segments = if plan.messages.len() >= 2 && has_delays {
        // Structured plan: the search already shaped it.
        plan.messages.clone()
    } else {
        let text = plan.concatenated_text();
        if text.is_empty() {
            Vec::new()
        } else {
            match llm_split(invoker, state, &text, config, cancel).await {
                Ok(segments) if !segments.is_empty() => segments,
                Ok(_) => rule_split_segments(state, &text, config),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    state.record_error("process", e);
                    rule_split_segments(state, &text, config)
                }
            }
        }
    };

    state.final_segments = segments;
    state.final_response = state
        .final_segments
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    Ok(())
}

fn rule_split_segments(state: &TurnState, text: &str, config: &ProcessConfig) -> Vec<SegmentDraft> {
    let tendency = fragmentation_tendency(
        &state.bot_big_five,
        &state.relationship_state,
        &state.mood_state,
    );
    let threshold = split_threshold_bytes(tendency);
    let pieces = rule_split(text, threshold, config.min_bubble_length);
    assign_delays(pieces, config.typing_rate, state.mood_state.busyness)
}

async fn llm_split(
    invoker: &dyn Invoker,
    state: &TurnState,
    text: &str,
    config: &ProcessConfig,
    cancel: &CancellationToken,
) -> Result<Vec<SegmentDraft>, InvokerError> {
    let prompt = ChatPrompt::new(
        format!(
            "Split one chat reply into at most {} natural message bubbles with \
             realistic send delays in seconds (first is always 0). Keep every \
             word, change nothing, merge nothing new in.",
            config.max_messages,
        ),
        format!("Reply to split:\n{}", text),
    );
    let schema = json!({
        "type": "object",
        "properties": {
            "segments": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "delay_seconds": {"type": "number"}
                },
                "required": ["content"]
            }}
        },
        "required": ["segments"]
    });

    let value =
        invoke_with_retry(invoker, Role::Processor, &prompt, Some(&schema), cancel).await?;
    let segments = value
        .get("segments")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let content = item
                        .get("content")
                        .and_then(|v| v.as_str())
                        .map(str::trim)
                        .filter(|t| !t.is_empty())?;
                    let delay = item
                        .get("delay_seconds")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0)
                        .max(0.0);
                    Some(SegmentDraft {
                        content: content.to_string(),
                        delay_seconds: delay,
                        action: if delay > 0.0 {
                            SegmentAction::Typing
                        } else {
                            SegmentAction::Idle
                        },
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Ok(segments)
}

/// Final validation: clamp the bubble count, fix a too-short opener, purge
/// empties, and always land the first bubble immediately. Macro-delayed
/// turns skip all of this.
pub fn final_validate(state: &mut TurnState, config: &ProcessConfig) {
    if state.is_macro_delay {
        return;
    }

    let mut segments: Vec<SegmentDraft> = state
        .final_segments
        .drain(..)
        .filter(|s| !s.content.trim().is_empty())
        .collect();

    // Over the limit: fold the tail into the last allowed bubble.
    while segments.len() > config.max_messages && segments.len() >= 2 {
        let tail = segments.pop().expect("len checked");
        let last = segments.last_mut().expect("len checked");
        last.content = format!("{} {}", last.content.trim(), tail.content.trim());
    }

    // Opener too short: merge the first two.
    if segments.len() >= 2
        && segments[0].content.trim().chars().count() < config.min_first_len
    {
        let second = segments.remove(1);
        segments[0].content =
            format!("{}{}", segments[0].content.trim(), second.content.trim());
    }

    if segments.is_empty() {
        segments.push(SegmentDraft::plain(APOLOGY_FALLBACK));
    }

    if let Some(first) = segments.first_mut() {
        first.delay_seconds = 0.0;
        first.action = SegmentAction::Idle;
    }

    state.final_response = segments
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    state.final_segments = segments;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::SeedableRng;
    use crate::test_support::sample_turn_state;

    #[test]
    fn chatty_close_bot_splits_after_the_second_sentence() {
        // extraversion 0.8, closeness 0.6, arousal 0.4 -> tendency 0.64,
        // threshold round(45 - 40*0.64) = 19 bytes.
        let big5 = BotBigFive {
            extraversion: 0.8,
            ..Default::default()
        };
        let rel = RelationshipState {
            closeness: 0.6,
            ..Default::default()
        };
        let mood = MoodState {
            arousal: 0.4,
            ..Default::default()
        };
        let tendency = fragmentation_tendency(&big5, &rel, &mood);
        assert!((tendency - 0.64).abs() < 1e-9);
        let threshold = split_threshold_bytes(tendency);
        assert_eq!(threshold, 19);

        let pieces = rule_split("嗯。今天有点累。你还好吗？", threshold, 5);
        assert_eq!(pieces, vec!["嗯。今天有点累。", "你还好吗？"]);
    }

    #[test]
    fn newlines_always_break() {
        let pieces = rule_split("第一行在这里\n第二行也在", 60, 5);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn all_short_fragments_collapse_into_one() {
        let pieces = rule_split("嗯。", 5, 5);
        assert_eq!(pieces, vec!["嗯。"]);
    }

    #[test]
    fn threshold_clamps_to_declared_range() {
        assert_eq!(split_threshold_bytes(0.0), 45);
        assert_eq!(split_threshold_bytes(1.0), 5);
        assert_eq!(split_threshold_bytes(-5.0), 60);
    }

    #[test]
    fn delays_start_at_zero_and_scale_with_length() {
        let segments = assign_delays(
            vec!["第一条消息哦".to_string(), "第二条比较长一点的消息".to_string()],
            0.2,
            0.0,
        );
        assert_eq!(segments[0].delay_seconds, 0.0);
        assert_eq!(segments[0].action, SegmentAction::Idle);
        assert!((segments[1].delay_seconds - 2.2).abs() < 1e-6);
        assert_eq!(segments[1].action, SegmentAction::Typing);
    }

    #[test]
    fn busyness_compresses_delays() {
        let relaxed = assign_delays(vec!["a".into(), "这条要打很久很久".into()], 0.2, 0.0);
        let busy = assign_delays(vec!["a".into(), "这条要打很久很久".into()], 0.2, 0.9);
        assert!(busy[1].delay_seconds < relaxed[1].delay_seconds);
    }

    #[test]
    fn macro_delay_fires_in_avoiding_with_low_roll() {
        // StepRng yields 0 forever -> gen::<f64>() == 0.0 < 0.8.
        let mut rng = StepRng::new(0, 0);
        let secs = macro_delay_decision(RelationshipStage::Avoiding, 0.1, &mut rng)
            .expect("macro delay");
        assert!((MACRO_DELAY_MIN_SECS..=MACRO_DELAY_MAX_SECS).contains(&secs));
    }

    #[test]
    fn macro_delay_never_fires_in_ordinary_stages_at_low_busyness() {
        let mut rng = StepRng::new(0, 0);
        assert!(macro_delay_decision(RelationshipStage::Experimenting, 0.3, &mut rng).is_none());
    }

    #[test]
    fn extreme_busyness_forces_macro_delay_anywhere() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        assert!(macro_delay_decision(RelationshipStage::Experimenting, 0.9, &mut rng).is_some());
    }

    #[test]
    fn validator_merges_overflow_and_short_openers() {
        let mut state = sample_turn_state("hi");
        state.final_segments = vec![
            SegmentDraft::plain("嗯。"),
            SegmentDraft::plain("今天有点累但还行啦"),
            SegmentDraft::plain("你呢最近"),
            SegmentDraft::plain("忙不忙"),
        ];
        let config = ProcessConfig {
            max_messages: 3,
            min_first_len: 5,
            ..Default::default()
        };
        final_validate(&mut state, &config);

        assert!(state.final_segments.len() <= 3);
        assert!(state.final_segments[0].content.chars().count() >= 5);
        assert_eq!(state.final_segments[0].delay_seconds, 0.0);
        assert!(state.final_segments.iter().all(|s| !s.content.is_empty()));
    }

    #[test]
    fn validator_apologizes_when_nothing_survives() {
        let mut state = sample_turn_state("hi");
        state.final_segments = vec![SegmentDraft::plain("   ")];
        final_validate(&mut state, &ProcessConfig::default());
        assert_eq!(state.final_segments.len(), 1);
        assert_eq!(state.final_segments[0].content, APOLOGY_FALLBACK);
    }

    #[test]
    fn validator_leaves_macro_delay_turns_alone() {
        let mut state = sample_turn_state("hi");
        state.is_macro_delay = true;
        state.macro_delay_seconds = Some(3600.0);
        final_validate(&mut state, &ProcessConfig::default());
        assert!(state.final_segments.is_empty());
    }
}
