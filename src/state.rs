//! The shared turn state threaded through every graph stage.
//!
//! Fields are grouped the way the pipeline consumes them: identity (who the
//! bot is), perception (who the bot thinks the user is), physics
//! (relationship + mood), memory, and per-turn IO. Every numeric field is
//! clamped to its declared range on write; stages return partial updates and
//! the executor merges them field-by-field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-turn cap on how far any single relationship dimension may move.
pub const RELATIONSHIP_DELTA_CAP: f64 = 0.30;

/// Tail window kept in `chat_buffer` before persistence.
pub const CHAT_BUFFER_WINDOW: usize = 100;

pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

pub fn clamp_signed(x: f64) -> f64 {
    x.clamp(-1.0, 1.0)
}

// ==========================================
// Identity
// ==========================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotBasicInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub occupation: String,
    #[serde(default)]
    pub speaking_style: String,
}

/// Big-five baseline, each in [-1, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BotBigFive {
    pub openness: f64,
    pub conscientiousness: f64,
    pub extraversion: f64,
    pub agreeableness: f64,
    pub neuroticism: f64,
}

impl Default for BotBigFive {
    fn default() -> Self {
        Self {
            openness: 0.0,
            conscientiousness: 0.0,
            extraversion: 0.0,
            agreeableness: 0.0,
            neuroticism: 0.0,
        }
    }
}

impl BotBigFive {
    pub fn clamped(mut self) -> Self {
        self.openness = clamp_signed(self.openness);
        self.conscientiousness = clamp_signed(self.conscientiousness);
        self.extraversion = clamp_signed(self.extraversion);
        self.agreeableness = clamp_signed(self.agreeableness);
        self.neuroticism = clamp_signed(self.neuroticism);
        self
    }
}

/// Loosely structured persona so hobbies, lore and quirks can grow without
/// schema churn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotPersona {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub collections: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub lore: HashMap<String, String>,
}

// ==========================================
// Perception
// ==========================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserBasicInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
}

impl UserBasicInfo {
    /// Fill-in-missing merge: declared facts never get overwritten, only
    /// absent fields are populated.
    pub fn fill_missing_from(&mut self, other: &UserBasicInfo) {
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        if self.nickname.is_none() {
            self.nickname = other.nickname.clone();
        }
        if self.gender.is_none() {
            self.gender = other.gender.clone();
        }
        if self.age_group.is_none() {
            self.age_group = other.age_group.clone();
        }
        if self.location.is_none() {
            self.location = other.location.clone();
        }
        if self.occupation.is_none() {
            self.occupation = other.occupation.clone();
        }
    }
}

// ==========================================
// Physics
// ==========================================

/// Six-dimension relationship model, each in [0, 1]. Per-bot-per-user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RelationshipState {
    pub closeness: f64,
    pub trust: f64,
    pub liking: f64,
    pub respect: f64,
    pub warmth: f64,
    pub power: f64,
}

impl Default for RelationshipState {
    fn default() -> Self {
        Self {
            closeness: 0.3,
            trust: 0.3,
            liking: 0.3,
            respect: 0.3,
            warmth: 0.3,
            power: 0.5,
        }
    }
}

pub const RELATIONSHIP_DIMS: [&str; 6] =
    ["closeness", "trust", "liking", "respect", "warmth", "power"];

impl RelationshipState {
    pub fn clamped(mut self) -> Self {
        self.closeness = clamp01(self.closeness);
        self.trust = clamp01(self.trust);
        self.liking = clamp01(self.liking);
        self.respect = clamp01(self.respect);
        self.warmth = clamp01(self.warmth);
        self.power = clamp01(self.power);
        self
    }

    pub fn get(&self, dim: &str) -> f64 {
        match dim {
            "closeness" => self.closeness,
            "trust" => self.trust,
            "liking" => self.liking,
            "respect" => self.respect,
            "warmth" => self.warmth,
            "power" => self.power,
            _ => 0.0,
        }
    }

    fn get_mut(&mut self, dim: &str) -> Option<&mut f64> {
        match dim {
            "closeness" => Some(&mut self.closeness),
            "trust" => Some(&mut self.trust),
            "liking" => Some(&mut self.liking),
            "respect" => Some(&mut self.respect),
            "warmth" => Some(&mut self.warmth),
            "power" => Some(&mut self.power),
            _ => None,
        }
    }

    /// Apply per-dimension deltas, capping each at `RELATIONSHIP_DELTA_CAP`
    /// absolute and clamping the result to [0, 1]. Returns the deltas that
    /// were actually applied.
    pub fn apply_deltas(&mut self, deltas: &HashMap<String, f64>) -> HashMap<String, f64> {
        let mut applied = HashMap::new();
        for dim in RELATIONSHIP_DIMS {
            let Some(raw) = deltas.get(dim) else { continue };
            let capped = raw.clamp(-RELATIONSHIP_DELTA_CAP, RELATIONSHIP_DELTA_CAP);
            if let Some(slot) = self.get_mut(dim) {
                let before = *slot;
                *slot = clamp01(before + capped);
                applied.insert(dim.to_string(), *slot - before);
            }
        }
        applied
    }
}

/// PAD mood plus busyness. Per-bot, shared across users of that bot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MoodState {
    pub pleasure: f64,
    pub arousal: f64,
    pub dominance: f64,
    pub busyness: f64,
}

impl Default for MoodState {
    fn default() -> Self {
        Self {
            pleasure: 0.0,
            arousal: 0.0,
            dominance: 0.0,
            busyness: 0.0,
        }
    }
}

impl MoodState {
    pub fn clamped(mut self) -> Self {
        self.pleasure = clamp_signed(self.pleasure);
        self.arousal = clamp_signed(self.arousal);
        self.dominance = clamp_signed(self.dominance);
        self.busyness = clamp01(self.busyness);
        self
    }
}

// ==========================================
// Relationship stages
// ==========================================

/// Knapp-style relationship trajectory, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    Initiating,
    Experimenting,
    Intensifying,
    Integrating,
    Bonding,
    Differentiating,
    Circumscribing,
    Stagnating,
    Avoiding,
    Terminating,
}

impl Default for RelationshipStage {
    fn default() -> Self {
        RelationshipStage::Initiating
    }
}

pub const STAGE_ORDER: [RelationshipStage; 10] = [
    RelationshipStage::Initiating,
    RelationshipStage::Experimenting,
    RelationshipStage::Intensifying,
    RelationshipStage::Integrating,
    RelationshipStage::Bonding,
    RelationshipStage::Differentiating,
    RelationshipStage::Circumscribing,
    RelationshipStage::Stagnating,
    RelationshipStage::Avoiding,
    RelationshipStage::Terminating,
];

impl RelationshipStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStage::Initiating => "initiating",
            RelationshipStage::Experimenting => "experimenting",
            RelationshipStage::Intensifying => "intensifying",
            RelationshipStage::Integrating => "integrating",
            RelationshipStage::Bonding => "bonding",
            RelationshipStage::Differentiating => "differentiating",
            RelationshipStage::Circumscribing => "circumscribing",
            RelationshipStage::Stagnating => "stagnating",
            RelationshipStage::Avoiding => "avoiding",
            RelationshipStage::Terminating => "terminating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.trim().to_ascii_lowercase())
    }

    pub fn ordinal(&self) -> usize {
        STAGE_ORDER.iter().position(|s| s == self).unwrap_or(0)
    }

    pub fn next(&self) -> Option<Self> {
        STAGE_ORDER.get(self.ordinal() + 1).copied()
    }

    pub fn prev(&self) -> Option<Self> {
        self.ordinal().checked_sub(1).and_then(|i| STAGE_ORDER.get(i).copied())
    }

    /// Stage class used to pick search budgets.
    pub fn class(&self) -> StageClass {
        match self {
            RelationshipStage::Initiating | RelationshipStage::Experimenting => StageClass::Opening,
            RelationshipStage::Intensifying | RelationshipStage::Integrating => {
                StageClass::Deepening
            }
            _ => StageClass::Later,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageClass {
    Opening,
    Deepening,
    Later,
}

/// Kind of stage movement decided by the stage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageTransitionKind {
    Stay,
    Growth,
    Decay,
    Jump,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: RelationshipStage,
    pub to: RelationshipStage,
    pub kind: StageTransitionKind,
    pub reason: String,
}

// ==========================================
// Memory
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Ai,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Ai => "ai",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ai" | "assistant" => MessageRole::Ai,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub content: String,
    pub importance: f64,
}

// ==========================================
// Turn IO
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageDirection {
    Up,
    Down,
    None,
}

impl Default for StageDirection {
    fn default() -> Self {
        StageDirection::None
    }
}

/// What Detection concluded about the current message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionOutcome {
    /// Signal scores in [0, 1]: conflict, pressure, sarcasm, expressiveness...
    #[serde(default)]
    pub scores: HashMap<String, f64>,
    #[serde(default)]
    pub brief: String,
    #[serde(default)]
    pub implied_stage: Option<RelationshipStage>,
    #[serde(default)]
    pub direction: StageDirection,
    #[serde(default)]
    pub immediate_tasks: Vec<TurnTask>,
    #[serde(default)]
    pub urgent_tasks: Vec<TurnTask>,
}

impl DetectionOutcome {
    pub fn clamped(mut self) -> Self {
        for v in self.scores.values_mut() {
            *v = clamp01(*v);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub task_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityFlags {
    #[serde(default)]
    pub is_injection_attempt: bool,
    #[serde(default)]
    pub is_ai_test: bool,
    #[serde(default)]
    pub is_user_treating_as_assistant: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub needs_security_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentAction {
    Typing,
    Idle,
}

impl Default for SegmentAction {
    fn default() -> Self {
        SegmentAction::Idle
    }
}

/// One chat bubble: text, how long to wait before showing it, and whether a
/// typing indicator runs during the wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDraft {
    pub content: String,
    #[serde(default)]
    pub delay_seconds: f64,
    #[serde(default)]
    pub action: SegmentAction,
}

impl SegmentDraft {
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            delay_seconds: 0.0,
            action: SegmentAction::Idle,
        }
    }
}

/// The structured output of the search stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPlan {
    #[serde(default)]
    pub messages: Vec<SegmentDraft>,
    #[serde(default)]
    pub attempted_task_ids: Vec<String>,
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
}

impl ReplyPlan {
    pub fn concatenated_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ==========================================
// Main turn state
// ==========================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnState {
    // Control
    pub turn_id: String,
    #[serde(default)]
    pub parent_turn_id: Option<String>,
    pub bot_id: i64,
    pub user_id: i64,
    pub external_user_id: String,

    // Identity
    #[serde(default)]
    pub bot_basic_info: BotBasicInfo,
    #[serde(default)]
    pub bot_big_five: BotBigFive,
    #[serde(default)]
    pub bot_persona: BotPersona,

    // Perception
    #[serde(default)]
    pub user_basic_info: UserBasicInfo,
    #[serde(default)]
    pub user_inferred_profile: HashMap<String, String>,

    // Physics
    #[serde(default)]
    pub relationship_state: RelationshipState,
    #[serde(default)]
    pub mood_state: MoodState,
    #[serde(default)]
    pub current_stage: RelationshipStage,
    #[serde(default)]
    pub stage_transition: Option<StageTransition>,

    // Memory
    #[serde(default)]
    pub chat_buffer: Vec<BufferedMessage>,
    #[serde(default)]
    pub conversation_summary: String,
    #[serde(default)]
    pub retrieved_memories: Vec<RetrievedMemory>,
    #[serde(default)]
    pub pending_urgent_tasks: Vec<TurnTask>,

    // Turn IO
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub user_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub security_flags: SecurityFlags,
    #[serde(default)]
    pub security_response: Option<String>,
    #[serde(default)]
    pub detection: DetectionOutcome,
    #[serde(default)]
    pub inner_monologue: String,
    #[serde(default)]
    pub selected_profile_keys: Vec<String>,
    #[serde(default)]
    pub word_budget: u32,
    #[serde(default)]
    pub task_budget_max: u32,
    #[serde(default)]
    pub tasks_for_search: Vec<TurnTask>,
    #[serde(default)]
    pub reply_plan: Option<ReplyPlan>,
    #[serde(default)]
    pub final_segments: Vec<SegmentDraft>,
    #[serde(default)]
    pub final_response: String,
    #[serde(default)]
    pub is_macro_delay: bool,
    #[serde(default)]
    pub macro_delay_seconds: Option<f64>,

    // Deltas produced by Evolve, kept for the stage manager and persistence.
    #[serde(default)]
    pub relationship_deltas_applied: HashMap<String, f64>,

    /// Absorbed stage errors; committed into the ai message metadata.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TurnState {
    pub fn set_word_budget(&mut self, budget: u32) {
        self.word_budget = budget.min(60);
    }

    pub fn set_task_budget_max(&mut self, budget: u32) {
        self.task_budget_max = budget.min(2);
    }

    /// Append to the buffer within this turn; the tail window is applied at
    /// persistence time.
    pub fn push_buffer_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.chat_buffer.push(BufferedMessage {
            role,
            content: content.into(),
            created_at: Utc::now(),
        });
    }

    pub fn buffer_tail_window(&self) -> &[BufferedMessage] {
        let len = self.chat_buffer.len();
        let start = len.saturating_sub(CHAT_BUFFER_WINDOW);
        &self.chat_buffer[start..]
    }

    pub fn record_error(&mut self, stage: &str, error: impl std::fmt::Display) {
        tracing::warn!("stage {} absorbed error: {}", stage, error);
        self.errors.push(format!("{}: {}", stage, error));
    }

    pub fn count_user_turns(&self) -> usize {
        let mut n = self
            .chat_buffer
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        if !self.user_input.trim().is_empty() {
            n = n.max(1);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_deltas_are_capped_and_clamped() {
        let mut rel = RelationshipState::default();
        let mut deltas = HashMap::new();
        deltas.insert("closeness".to_string(), 0.9);
        deltas.insert("trust".to_string(), -0.9);
        let applied = rel.apply_deltas(&deltas);

        assert!((rel.closeness - 0.6).abs() < 1e-9, "0.3 + cap 0.3");
        assert!((rel.trust - 0.0).abs() < 1e-9, "0.3 - cap 0.3");
        assert!(applied["closeness"].abs() <= RELATIONSHIP_DELTA_CAP + 1e-9);
        assert!(applied["trust"].abs() <= RELATIONSHIP_DELTA_CAP + 1e-9);
    }

    #[test]
    fn delta_application_never_leaves_unit_range() {
        let mut rel = RelationshipState {
            closeness: 0.95,
            ..Default::default()
        };
        let mut deltas = HashMap::new();
        deltas.insert("closeness".to_string(), 0.3);
        rel.apply_deltas(&deltas);
        assert!(rel.closeness <= 1.0);
    }

    #[test]
    fn stage_order_round_trips() {
        for stage in STAGE_ORDER {
            assert_eq!(RelationshipStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(
            RelationshipStage::Initiating.next(),
            Some(RelationshipStage::Experimenting)
        );
        assert_eq!(RelationshipStage::Initiating.prev(), None);
        assert_eq!(RelationshipStage::Terminating.next(), None);
    }

    #[test]
    fn stage_classes_cover_the_trajectory() {
        assert_eq!(RelationshipStage::Experimenting.class(), StageClass::Opening);
        assert_eq!(RelationshipStage::Integrating.class(), StageClass::Deepening);
        assert_eq!(RelationshipStage::Avoiding.class(), StageClass::Later);
    }

    #[test]
    fn budgets_are_clamped_on_write() {
        let mut state = TurnState::default();
        state.set_word_budget(200);
        state.set_task_budget_max(9);
        assert_eq!(state.word_budget, 60);
        assert_eq!(state.task_budget_max, 2);
    }

    #[test]
    fn buffer_tail_window_caps_at_limit() {
        let mut state = TurnState::default();
        for i in 0..(CHAT_BUFFER_WINDOW + 20) {
            state.push_buffer_message(MessageRole::User, format!("m{}", i));
        }
        assert_eq!(state.buffer_tail_window().len(), CHAT_BUFFER_WINDOW);
        assert_eq!(state.buffer_tail_window()[0].content, "m20");
    }
}
