//! The requirements bundle handed to the search: structural limits, budgets,
//! and the forbidden-phrase lexicons the hard gate enforces.

use serde::{Deserialize, Serialize};

use crate::config::ProcessConfig;
use crate::state::{RelationshipStage, TurnState, TurnTask};

/// Phrases that shatter immersion the instant a user reads them. Any
/// candidate containing one is rejected outright by the hard gate.
pub const IMMERSION_BREAK_PHRASES: [&str; 10] = [
    "设定", "人设", "虚拟", "虚构", "角色", "剧本", "配置", "模型", "系统", "作为一个",
];

/// Customer-service / assistant boilerplate. Same treatment.
pub const ASSISTANT_PHRASES: [&str; 12] = [
    "聊天助手",
    "智能助手",
    "客服",
    "我可以帮你",
    "我能帮你",
    "有什么可以帮",
    "为您服务",
    "随时咨询",
    "祝您使用愉快",
    "感谢您的使用",
    "解答问题",
    "提供信息",
];

/// Markers of unsolicited tutorials; only forbidden when the user did not
/// actually ask for advice.
pub const UNREQUESTED_ADVICE_MARKERS: [&str; 4] = ["建议你", "你可以试试", "步骤", "教程"];

const ADVICE_REQUEST_MARKERS: [&str; 19] = [
    "怎么", "如何", "咋", "怎样", "教我", "求教", "请教", "建议", "推荐", "该不该", "要不要",
    "能不能", "帮我", "帮忙", "指导", "步骤", "教程", "方案", "策略",
];

const GREETING_PREFIXES: [&str; 11] = [
    "hi", "hello", "hey", "你好", "您好", "嗨", "哈喽", "在吗", "早上好", "晚上好", "晚安",
];

/// Words-over-budget slack before the hard gate rejects.
pub const WORD_BUDGET_SLACK: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    pub max_messages: usize,
    pub min_first_len: usize,
    pub max_message_len: usize,
    pub word_budget: u32,
    pub task_budget_max: u32,
    pub stage: RelationshipStage,
    pub user_asks_advice: bool,
    #[serde(default)]
    pub tasks: Vec<TurnTask>,
}

impl Requirements {
    /// Compile the bundle from the enriched turn state. The message-count
    /// ceiling loosens with the word budget: tight budgets keep replies to a
    /// few bubbles, generous ones allow more fragmentation.
    pub fn compile(state: &TurnState, process: &ProcessConfig) -> Self {
        let word_budget = state.word_budget.min(60);
        let base_max = 3usize;
        let max_messages = if word_budget > 40 {
            (base_max + 1).min(process.max_messages)
        } else {
            base_max.min(process.max_messages)
        };

        Self {
            max_messages: max_messages.max(1),
            min_first_len: process.min_first_len,
            max_message_len: process.max_message_len,
            word_budget,
            task_budget_max: state.task_budget_max.min(2),
            stage: state.current_stage,
            user_asks_advice: user_asks_for_advice(&state.user_input),
            tasks: state.tasks_for_search.clone(),
        }
    }
}

/// Minimal detector for "the user explicitly wants advice/instructions".
/// Short greetings never count even when they contain a marker substring.
pub fn user_asks_for_advice(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() {
        return false;
    }
    if is_short_greeting(t) {
        return false;
    }
    let lowered = t.to_lowercase();
    ADVICE_REQUEST_MARKERS.iter().any(|m| lowered.contains(m))
}

fn is_short_greeting(text: &str) -> bool {
    if text.chars().count() > 12 {
        return false;
    }
    let lowered = text.to_lowercase();
    GREETING_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

/// Word counting that treats each CJK character as one word and whitespace
/// runs as separators for the rest.
pub fn count_words(text: &str) -> usize {
    let mut count = 0usize;
    let mut in_token = false;
    for ch in text.chars() {
        if is_cjk(ch) {
            count += 1;
            in_token = false;
        } else if ch.is_whitespace() {
            in_token = false;
        } else if !in_token {
            count += 1;
            in_token = true;
        }
    }
    count
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x3040..=0x30FF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::state::TurnState;

    #[test]
    fn word_budget_is_clamped_and_widens_max_messages() {
        let mut state = TurnState::default();
        state.word_budget = 55;
        let req = Requirements::compile(&state, &ProcessConfig::default());
        assert_eq!(req.word_budget, 55);
        assert_eq!(req.max_messages, 4);

        state.word_budget = 20;
        let req = Requirements::compile(&state, &ProcessConfig::default());
        assert_eq!(req.max_messages, 3);
    }

    #[test]
    fn advice_detection_ignores_greetings() {
        assert!(user_asks_for_advice("我该怎么和她开口？"));
        assert!(user_asks_for_advice("帮我想想周末去哪"));
        assert!(!user_asks_for_advice("你好"));
        assert!(!user_asks_for_advice("晚安"));
        assert!(!user_asks_for_advice("嗯嗯"));
    }

    #[test]
    fn cjk_characters_count_as_words() {
        assert_eq!(count_words("你好呀"), 3);
        assert_eq!(count_words("hello world"), 2);
        assert_eq!(count_words("今天 OK 吗"), 4);
        assert_eq!(count_words(""), 0);
    }
}
