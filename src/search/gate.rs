//! Rule-based accept/reject for candidate plans, plus the fast heuristic
//! scorers blended into the aggregate. Candidates rejected here are never
//! shown to the soft scorer.

use crate::search::requirements::{
    count_words, Requirements, ASSISTANT_PHRASES, IMMERSION_BREAK_PHRASES,
    UNREQUESTED_ADVICE_MARKERS, WORD_BUDGET_SLACK,
};
use crate::state::ReplyPlan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    pub id: &'static str,
    pub detail: String,
}

/// Run every structural rule. Empty result means the candidate may proceed
/// to the LLM gates.
pub fn hard_gate(plan: &ReplyPlan, req: &Requirements) -> Vec<GateFailure> {
    let mut fails = Vec::new();

    if plan.messages.is_empty() {
        fails.push(GateFailure {
            id: "empty_plan",
            detail: "plan has no messages".to_string(),
        });
        return fails;
    }

    if plan.messages.len() > req.max_messages {
        fails.push(GateFailure {
            id: "too_many_messages",
            detail: format!("{} > {}", plan.messages.len(), req.max_messages),
        });
    }

    for (i, msg) in plan.messages.iter().enumerate() {
        let text = msg.content.trim();
        if text.is_empty() {
            fails.push(GateFailure {
                id: "empty_message",
                detail: format!("message {} is empty", i + 1),
            });
        }
        if text.chars().count() > req.max_message_len {
            fails.push(GateFailure {
                id: "message_too_long",
                detail: format!("message {} exceeds {} chars", i + 1, req.max_message_len),
            });
        }
    }

    let first_len = plan
        .messages
        .first()
        .map(|m| m.content.trim().chars().count())
        .unwrap_or(0);
    if plan.messages.len() > 1 && first_len < req.min_first_len {
        fails.push(GateFailure {
            id: "first_too_short",
            detail: format!("{} < {}", first_len, req.min_first_len),
        });
    }

    let total_words: usize = plan
        .messages
        .iter()
        .map(|m| count_words(&m.content))
        .sum();
    let word_limit = req.word_budget as usize + WORD_BUDGET_SLACK;
    if total_words > word_limit {
        fails.push(GateFailure {
            id: "over_word_budget",
            detail: format!("{} words > {}", total_words, word_limit),
        });
    }

    let joined = plan.concatenated_text();
    if let Some(phrase) = find_forbidden(&joined, req.user_asks_advice) {
        fails.push(GateFailure {
            id: "forbidden_phrase",
            detail: phrase.to_string(),
        });
    }

    fails
}

fn find_forbidden(text: &str, user_asks_advice: bool) -> Option<&'static str> {
    for phrase in IMMERSION_BREAK_PHRASES {
        if text.contains(phrase) {
            return Some(phrase);
        }
    }
    for phrase in ASSISTANT_PHRASES {
        if text.contains(phrase) {
            return Some(phrase);
        }
    }
    if !user_asks_advice {
        for phrase in UNREQUESTED_ADVICE_MARKERS {
            if text.contains(phrase) {
                return Some(phrase);
            }
        }
    }
    None
}

/// Cheap shape/length score in [0, 1]; blended with the soft score so a
/// plan that hugs its budget edges out a sprawling one at equal judge score.
pub fn heuristic_score(plan: &ReplyPlan, req: &Requirements) -> f64 {
    if plan.messages.is_empty() {
        return 0.0;
    }

    let total_words: usize = plan
        .messages
        .iter()
        .map(|m| count_words(&m.content))
        .sum();
    let budget = req.word_budget.max(1) as f64;
    // Sweet spot around 70% of the budget.
    let length_fit = 1.0 - ((total_words as f64 - 0.7 * budget).abs() / budget).min(1.0);

    let count_ok = plan.messages.len() <= req.max_messages;
    let first_ok = plan.messages.len() == 1
        || plan
            .messages
            .first()
            .map(|m| m.content.trim().chars().count() >= req.min_first_len)
            .unwrap_or(false);
    let shape_fit = match (count_ok, first_ok) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    };

    (0.6 * length_fit + 0.4 * shape_fit).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RelationshipStage, SegmentDraft};

    fn req() -> Requirements {
        Requirements {
            max_messages: 3,
            min_first_len: 8,
            max_message_len: 220,
            word_budget: 40,
            task_budget_max: 2,
            stage: RelationshipStage::Experimenting,
            user_asks_advice: false,
            tasks: Vec::new(),
        }
    }

    fn plan(messages: &[&str]) -> ReplyPlan {
        ReplyPlan {
            messages: messages.iter().map(|m| SegmentDraft::plain(*m)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_reasonable_plan() {
        let p = plan(&["今天跑去江边走了一圈，风特别舒服", "你那边呢？"]);
        assert!(hard_gate(&p, &req()).is_empty());
    }

    #[test]
    fn rejects_empty_and_oversized_plans() {
        assert_eq!(hard_gate(&plan(&[]), &req())[0].id, "empty_plan");

        let p = plan(&["一二三四五六七八九", "二", "三", "四"]);
        assert!(hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "too_many_messages"));
    }

    #[test]
    fn rejects_short_first_message_in_multi_bubble_plans() {
        let p = plan(&["嗯。", "其实我今天过得还不错啦"]);
        assert!(hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "first_too_short"));

        // A lone short message is allowed.
        let p = plan(&["嗯。"]);
        assert!(!hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "first_too_short"));
    }

    #[test]
    fn rejects_immersion_breaking_phrases() {
        let p = plan(&["根据我的设定我不太会生气哦这句话足够长了"]);
        assert!(hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "forbidden_phrase"));
    }

    #[test]
    fn rejects_unrequested_advice_but_allows_requested() {
        let p = plan(&["建议你先把简历改一改再投出去会更好"]);
        assert!(hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "forbidden_phrase"));

        let mut advice_req = req();
        advice_req.user_asks_advice = true;
        assert!(!hard_gate(&p, &advice_req)
            .iter()
            .any(|f| f.id == "forbidden_phrase"));
    }

    #[test]
    fn rejects_plans_over_word_budget_plus_slack() {
        let long = "字".repeat(60);
        let p = plan(&[long.as_str()]);
        assert!(hard_gate(&p, &req())
            .iter()
            .any(|f| f.id == "over_word_budget"));
    }

    #[test]
    fn heuristic_prefers_budget_hugging_plans() {
        let snug = plan(&["今天跑去江边走了一圈风很舒服心情都好了", "你那边天气怎么样呀"]);
        let sprawling = plan(&["嗯"]);
        assert!(heuristic_score(&snug, &req()) > heuristic_score(&sprawling, &req()));
    }
}
