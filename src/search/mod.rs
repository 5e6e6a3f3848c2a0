//! Candidate search over reply plans: a small rollout tree in the
//! Monte-Carlo style. Each rollout expands the most promising leaf into K
//! variants, filters them through the hard gate and the batch judge gate,
//! scores the best survivors with the soft scorer, and propagates values
//! back to the root. Early relationship stages demand at least one rollout
//! before the engine may take an early exit.

pub mod gate;
pub mod judge;
pub mod requirements;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{EarlyExitConfig, SearchConfig};
use crate::error::InvokerError;
use crate::invoker::{invoke_with_retry, ChatPrompt, Invoker, Role};
use crate::search::gate::{hard_gate, heuristic_score};
use crate::search::judge::{batch_gate, soft_score, SoftScore};
use crate::search::requirements::Requirements;
use crate::state::{ReplyPlan, SegmentAction, SegmentDraft, StageClass, TurnState};

/// UCB exploration constant.
const UCB_C: f64 = std::f64::consts::SQRT_2;

/// Blend between the judge's overall score and the fast heuristic.
const SOFT_WEIGHT: f64 = 0.8;
const HEURISTIC_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct SearchBudget {
    pub rollouts: u32,
    pub expand_k: u32,
    pub min_rollouts_before_early_exit: u32,
}

impl SearchBudget {
    pub fn for_stage(class: StageClass, config: &SearchConfig) -> Self {
        let (rollouts, expand_k, min_rollouts) = match class {
            StageClass::Opening => (4, 2, 1),
            StageClass::Deepening => (2, 1, 0),
            StageClass::Later => (3, 1, 0),
        };
        Self {
            rollouts: config.rollouts.unwrap_or(rollouts),
            expand_k: config.expand_k.unwrap_or(expand_k).max(1),
            min_rollouts_before_early_exit: min_rollouts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub plan: ReplyPlan,
    pub score: f64,
    pub soft: Option<SoftScore>,
    pub rollouts_run: u32,
    pub degenerate: bool,
}

struct PlanNode {
    plan: ReplyPlan,
    visits: u32,
    value_sum: f64,
    parent: Option<usize>,
    children: Vec<usize>,
    seq: u64,
}

struct PlanTree {
    nodes: Vec<PlanNode>,
    next_seq: u64,
}

impl PlanTree {
    fn new(root: ReplyPlan) -> Self {
        Self {
            nodes: vec![PlanNode {
                plan: root,
                visits: 0,
                value_sum: 0.0,
                parent: None,
                children: Vec::new(),
                seq: 0,
            }],
            next_seq: 1,
        }
    }

    fn add_child(&mut self, parent: usize, plan: ReplyPlan) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.nodes.len();
        self.nodes.push(PlanNode {
            plan,
            visits: 0,
            value_sum: 0.0,
            parent: Some(parent),
            children: Vec::new(),
            seq,
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    fn ucb(&self, idx: usize) -> f64 {
        let node = &self.nodes[idx];
        if node.visits == 0 {
            return f64::INFINITY;
        }
        let parent_visits = node
            .parent
            .map(|p| self.nodes[p].visits)
            .unwrap_or(node.visits)
            .max(1) as f64;
        let exploitation = node.value_sum / node.visits as f64;
        let exploration = UCB_C * (parent_visits.ln() / node.visits as f64).sqrt();
        exploitation + exploration
    }

    /// Best leaf by UCB value; ties go to the most recently inserted node.
    fn select_leaf(&self) -> usize {
        let mut best = 0usize;
        let mut best_key = (f64::NEG_INFINITY, 0u64);
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.children.is_empty() {
                continue;
            }
            let key = (self.ucb(idx), node.seq);
            if key.0 > best_key.0 || (key.0 == best_key.0 && key.1 > best_key.1) {
                best_key = key;
                best = idx;
            }
        }
        best
    }

    fn backprop(&mut self, mut idx: usize, score: f64) {
        loop {
            let node = &mut self.nodes[idx];
            node.visits += 1;
            node.value_sum += score;
            match node.parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }
    }
}

pub struct SearchEngine<'a> {
    invoker: &'a dyn Invoker,
    config: &'a SearchConfig,
    judge_limiter: &'a Semaphore,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        invoker: &'a dyn Invoker,
        config: &'a SearchConfig,
        judge_limiter: &'a Semaphore,
    ) -> Self {
        Self {
            invoker,
            config,
            judge_limiter,
        }
    }

    /// Run the search. Only cancellation escapes as an error; every other
    /// failure degrades (a lost rollout, or the degenerate fallback plan).
    pub async fn run(
        &self,
        state: &TurnState,
        req: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, InvokerError> {
        let budget = SearchBudget::for_stage(req.stage.class(), self.config);

        let root_plan = match self.plan_root(state, req, cancel).await {
            Ok(plan) => plan,
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!("root plan failed ({}); degenerate fallback", e);
                return self.degenerate_plan(state, req, cancel).await;
            }
        };

        // Root evaluation and the first expansion run concurrently; the
        // prefetched batch feeds rollout 0 or is discarded on early exit.
        let (root_eval, prefetched) = tokio::join!(
            self.score_candidate(state, &root_plan, req, cancel),
            self.plan_variants(state, req, &root_plan, budget.expand_k, cancel),
        );

        let root_eval = match root_eval {
            Ok(eval) => Some(eval),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!("root soft eval failed: {}", e);
                None
            }
        };
        let mut prefetched = match prefetched {
            Ok(plans) => Some(plans),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!("prefetch expansion failed: {}", e);
                None
            }
        };

        let mut tree = PlanTree::new(root_plan.clone());
        let mut best_plan = root_plan.clone();
        let mut best_score = 0.0f64;
        let mut best_soft: Option<SoftScore> = None;

        if let Some((aggregate, soft)) = root_eval {
            tree.backprop(0, aggregate);
            best_score = aggregate;
            best_soft = Some(soft);

            if budget.min_rollouts_before_early_exit == 0
                && passes_early_exit(&soft, aggregate, &self.config.early_exit)
            {
                tracing::debug!("early exit on root (score {:.3})", aggregate);
                return Ok(SearchOutcome {
                    plan: root_plan,
                    score: aggregate,
                    soft: Some(soft),
                    rollouts_run: 0,
                    degenerate: false,
                });
            }
        }

        let mut rollouts_run = 0u32;
        for round in 0..budget.rollouts {
            if cancel.is_cancelled() {
                return Err(InvokerError::Canceled);
            }

            let leaf = tree.select_leaf();
            let candidates = match prefetched.take() {
                Some(batch) if round == 0 => batch,
                _ => {
                    let base = tree.nodes[leaf].plan.clone();
                    match self
                        .plan_variants(state, req, &base, budget.expand_k, cancel)
                        .await
                    {
                        Ok(plans) => plans,
                        Err(e) if e.is_canceled() => return Err(e),
                        Err(e) => {
                            tracing::warn!("rollout {} expansion failed: {}", round, e);
                            rollouts_run += 1;
                            continue;
                        }
                    }
                }
            };
            rollouts_run += 1;

            let gated: Vec<ReplyPlan> = candidates
                .into_iter()
                .filter(|plan| {
                    let fails = hard_gate(plan, req);
                    if !fails.is_empty() {
                        tracing::debug!("hard gate rejected candidate: {:?}", fails[0].id);
                    }
                    fails.is_empty()
                })
                .collect();
            if gated.is_empty() {
                continue;
            }

            let verdicts = {
                let _permit = self.acquire_judge(cancel).await?;
                match batch_gate(
                    self.invoker,
                    state,
                    &gated.iter().collect::<Vec<_>>(),
                    cancel,
                )
                .await
                {
                    Ok(verdicts) => verdicts,
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => {
                        tracing::warn!("rollout {} judge gate failed: {}", round, e);
                        continue;
                    }
                }
            };

            let mut survivors: Vec<(ReplyPlan, f64)> = gated
                .into_iter()
                .zip(verdicts)
                .filter(|(_, verdict)| verdict.passes())
                .map(|(plan, _)| {
                    let heur = heuristic_score(&plan, req);
                    (plan, heur)
                })
                .collect();
            if survivors.is_empty() {
                continue;
            }
            survivors.sort_by(|a, b| b.1.total_cmp(&a.1));

            let mut round_best: Option<(usize, f64, SoftScore)> = None;
            for (i, (plan, heur)) in survivors.iter().enumerate() {
                let child = tree.add_child(leaf, plan.clone());
                if i >= self.config.soft.top_n.max(1) {
                    continue;
                }
                let scored = {
                    let _permit = self.acquire_judge(cancel).await?;
                    soft_score(self.invoker, state, plan, cancel).await
                };
                match scored {
                    Ok(soft) => {
                        let aggregate = blend(soft.overall_score, *heur);
                        if round_best
                            .as_ref()
                            .map(|(_, best, _)| aggregate > *best)
                            .unwrap_or(true)
                        {
                            round_best = Some((child, aggregate, soft));
                        }
                    }
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => tracing::warn!("soft score failed for candidate: {}", e),
                }
            }

            if let Some((child, aggregate, soft)) = round_best {
                tree.backprop(child, aggregate);
                if aggregate > best_score || best_soft.is_none() {
                    best_score = aggregate;
                    best_plan = tree.nodes[child].plan.clone();
                    best_soft = Some(soft);
                }
                if rollouts_run >= budget.min_rollouts_before_early_exit
                    && passes_early_exit(&soft, aggregate, &self.config.early_exit)
                {
                    tracing::debug!(
                        "early exit after rollout {} (score {:.3})",
                        round,
                        aggregate
                    );
                    break;
                }
            }
        }

        // Final re-evaluation stabilizes the winner's value before it is
        // trusted downstream. Below-threshold plans ship anyway.
        let final_eval = {
            let _permit = self.acquire_judge(cancel).await?;
            soft_score(self.invoker, state, &best_plan, cancel).await
        };
        match final_eval {
            Ok(soft) => {
                let heur = heuristic_score(&best_plan, req);
                let refreshed = blend(soft.overall_score, heur);
                best_score = (best_score + refreshed) / 2.0;
                best_soft = Some(soft);
            }
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => tracing::warn!("final re-evaluation failed: {}", e),
        }

        if best_score < self.config.final_score_threshold {
            tracing::warn!(
                "best plan scored {:.3}, below threshold {:.2}; returning it anyway",
                best_score,
                self.config.final_score_threshold
            );
        }

        Ok(SearchOutcome {
            plan: best_plan,
            score: best_score,
            soft: best_soft,
            rollouts_run,
            degenerate: false,
        })
    }

    async fn acquire_judge(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'a>, InvokerError> {
        // The semaphore only closes on shutdown; treat that as cancellation.
        self.judge_limiter
            .acquire()
            .await
            .map_err(|_| InvokerError::Canceled)
    }

    async fn score_candidate(
        &self,
        state: &TurnState,
        plan: &ReplyPlan,
        req: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<(f64, SoftScore), InvokerError> {
        let _permit = self.acquire_judge(cancel).await?;
        let soft = soft_score(self.invoker, state, plan, cancel).await?;
        let aggregate = blend(soft.overall_score, heuristic_score(plan, req));
        Ok((aggregate, soft))
    }

    async fn plan_root(
        &self,
        state: &TurnState,
        req: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<ReplyPlan, InvokerError> {
        let prompt = ChatPrompt::new(plan_system(state, req), plan_context(state, req));
        let value =
            invoke_with_retry(self.invoker, Role::Main, &prompt, Some(&plan_schema()), cancel)
                .await?;
        plan_from_value(&value)
            .filter(|p| !p.messages.is_empty())
            .ok_or_else(|| InvokerError::Parse("root plan missing messages".to_string()))
    }

    async fn plan_variants(
        &self,
        state: &TurnState,
        req: &Requirements,
        base: &ReplyPlan,
        k: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReplyPlan>, InvokerError> {
        let mut user = plan_context(state, req);
        user.push_str(&format!(
            "\nA draft reply already exists:\n{}\n\nProduce {} distinct improved variants. \
             Keep what works, vary tone and angle. Return JSON: {{\"plans\": [...]}}.",
            base.messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" / "),
            k,
        ));
        let prompt = ChatPrompt::new(plan_system(state, req), user);
        let schema = json!({
            "type": "object",
            "properties": {"plans": {"type": "array", "items": plan_schema()}},
            "required": ["plans"]
        });
        let value =
            invoke_with_retry(self.invoker, Role::Main, &prompt, Some(&schema), cancel).await?;

        let plans: Vec<ReplyPlan> = value
            .get("plans")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(plan_from_value).collect())
            .unwrap_or_default();
        if plans.is_empty() {
            return Err(InvokerError::Parse("no variants in response".to_string()));
        }
        Ok(plans)
    }

    /// Root unusable: one plain-text call with a reduced prompt, no search.
    async fn degenerate_plan(
        &self,
        state: &TurnState,
        req: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, InvokerError> {
        let prompt = ChatPrompt::new(
            format!(
                "You are {}. Reply in character, briefly, in the user's language.",
                state.bot_basic_info.name
            ),
            state.user_input.clone(),
        );
        let plan = match invoke_with_retry(self.invoker, Role::Main, &prompt, None, cancel).await {
            Ok(Value::String(text)) if !text.trim().is_empty() => ReplyPlan {
                messages: vec![SegmentDraft::plain(text.trim())],
                attempted_task_ids: req.tasks.iter().map(|t| t.id.clone()).collect(),
                completed_task_ids: Vec::new(),
            },
            Ok(_) => ReplyPlan::default(),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!("degenerate fallback also failed: {}", e);
                ReplyPlan::default()
            }
        };
        Ok(SearchOutcome {
            plan,
            score: 0.0,
            soft: None,
            rollouts_run: 0,
            degenerate: true,
        })
    }
}

fn blend(soft_overall: f64, heuristic: f64) -> f64 {
    (SOFT_WEIGHT * soft_overall + HEURISTIC_WEIGHT * heuristic).clamp(0.0, 1.0)
}

fn passes_early_exit(soft: &SoftScore, aggregate: f64, gates: &EarlyExitConfig) -> bool {
    soft.complete
        && aggregate >= gates.root_score
        && soft.plan_alignment >= gates.plan_alignment_min
        && soft.assistantiness <= gates.assistantiness_max
        && soft.mode_behavior_fit >= gates.mode_fit_min
}

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "messages": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": {"type": "string"},
                        "delay_seconds": {"type": "number"},
                        "action": {"type": "string", "enum": ["typing", "idle"]}
                    },
                    "required": ["content"]
                }
            },
            "attempted_task_ids": {"type": "array", "items": {"type": "string"}},
            "completed_task_ids": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["messages"]
    })
}

/// Accepts both the structured message objects and bare strings; planners
/// drift between the two.
fn plan_from_value(value: &Value) -> Option<ReplyPlan> {
    let messages_raw = value.get("messages")?.as_array()?;
    let mut messages = Vec::new();
    for item in messages_raw {
        match item {
            Value::String(s) => {
                let t = s.trim();
                if !t.is_empty() {
                    messages.push(SegmentDraft::plain(t));
                }
            }
            Value::Object(_) => {
                let content = item
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                let delay = item
                    .get("delay_seconds")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    .max(0.0);
                let action = match item.get("action").and_then(|v| v.as_str()) {
                    Some("typing") => SegmentAction::Typing,
                    _ => {
                        if delay > 0.0 {
                            SegmentAction::Typing
                        } else {
                            SegmentAction::Idle
                        }
                    }
                };
                messages.push(SegmentDraft {
                    content: content.to_string(),
                    delay_seconds: delay,
                    action,
                });
            }
            _ => {}
        }
    }
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(ReplyPlan {
        messages,
        attempted_task_ids: string_list("attempted_task_ids"),
        completed_task_ids: string_list("completed_task_ids"),
    })
}

fn plan_system(state: &TurnState, req: &Requirements) -> String {
    let mut sys = format!(
        "You are {}, {} years old, {}. Speaking style: {}. \
         You are chatting privately with someone; stay fully in character.",
        state.bot_basic_info.name,
        state.bot_basic_info.age,
        state.bot_basic_info.occupation,
        state.bot_basic_info.speaking_style,
    );
    sys.push_str(&format!(
        "\nReply as at most {} chat bubbles, first bubble at least {} chars unless it is the only one, \
         about {} words total. Never mention being an AI, a system, or any meta setup.",
        req.max_messages, req.min_first_len, req.word_budget,
    ));
    if !req.user_asks_advice {
        sys.push_str(
            "\nThe user did not ask for advice: no tips, no tutorials, no numbered steps. \
             React, relate, maybe ask one light question.",
        );
    }
    sys
}

fn plan_context(state: &TurnState, req: &Requirements) -> String {
    let mut ctx = String::new();
    ctx.push_str(&format!(
        "Relationship stage: {}. closeness={:.2} trust={:.2} warmth={:.2}\n",
        state.current_stage.as_str(),
        state.relationship_state.closeness,
        state.relationship_state.trust,
        state.relationship_state.warmth,
    ));
    ctx.push_str(&format!(
        "Mood: pleasure={:.2} arousal={:.2} busyness={:.2}\n",
        state.mood_state.pleasure, state.mood_state.arousal, state.mood_state.busyness,
    ));
    if !state.conversation_summary.trim().is_empty() {
        ctx.push_str(&format!("Summary so far: {}\n", state.conversation_summary.trim()));
    }
    if !state.retrieved_memories.is_empty() {
        ctx.push_str("Relevant memories:\n");
        for memory in state.retrieved_memories.iter().take(5) {
            ctx.push_str(&format!("- {}\n", memory.content));
        }
    }
    if !state.inner_monologue.trim().is_empty() {
        ctx.push_str(&format!("Your inner monologue: {}\n", state.inner_monologue.trim()));
    }
    if !req.tasks.is_empty() {
        ctx.push_str(&format!(
            "You may naturally work in at most {} of these (report ids in attempted_task_ids / completed_task_ids):\n",
            req.task_budget_max,
        ));
        for task in &req.tasks {
            ctx.push_str(&format!("- [{}] {}\n", task.id, task.description));
        }
    }
    let tail = state.buffer_tail_window();
    let recent = &tail[tail.len().saturating_sub(10)..];
    if !recent.is_empty() {
        ctx.push_str("Recent messages:\n");
        for msg in recent {
            ctx.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content));
        }
    }
    ctx.push_str(&format!("\nUser just said: {}\n", state.user_input.trim()));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::state::RelationshipStage;
    use crate::test_support::ScriptedInvoker;
    use std::sync::Arc;

    fn good_soft(overall: f64) -> Value {
        json!({
            "assistantiness": 0.1,
            "immersion_break": 0.05,
            "persona_consistency": 0.9,
            "relationship_fit": 0.9,
            "mode_behavior_fit": 0.9,
            "plan_alignment": 0.8,
            "overall_score": overall
        })
    }

    fn pass_gate(n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| {
                    json!({
                        "index": i,
                        "assistantiness_ok": true,
                        "identity_ok": true,
                        "immersion_ok": true
                    })
                })
                .collect(),
        )
    }

    fn state_with_stage(stage: RelationshipStage) -> TurnState {
        let mut state = TurnState::default();
        state.current_stage = stage;
        state.user_input = "你好".to_string();
        state.word_budget = 40;
        state
    }

    fn plan_value(text: &str) -> Value {
        json!({"messages": [{"content": text}]})
    }

    #[tokio::test]
    async fn initiating_stage_never_returns_root_without_a_rollout() {
        let invoker = ScriptedInvoker::new();
        // Root plan + one expansion batch.
        invoker.push(Role::Main, plan_value("刚到家，今天有点累但还挺开心的"));
        invoker.push(
            Role::Main,
            json!({"plans": [plan_value("刚回来呢，今天走了好多路不过值得"),
                             plan_value("到家啦，今天累归累心情不错")]}),
        );
        // Judge call order: root eval, rollout-0 batch gate, rollout-0 soft
        // score, final re-eval. The root eval is excellent, but the
        // opening-stage floor still requires a rollout.
        invoker.push(Role::Judge, good_soft(0.95));
        invoker.push(Role::Judge, pass_gate(2));
        invoker.push(Role::Judge, good_soft(0.9));
        invoker.push(Role::Judge, good_soft(0.9));

        let state = state_with_stage(RelationshipStage::Initiating);
        let req = Requirements::compile(&state, &ProcessConfig::default());
        let config = SearchConfig::default();
        let limiter = Arc::new(Semaphore::new(1));
        let engine = SearchEngine::new(&invoker, &config, &limiter);

        let outcome = engine
            .run(&state, &req, &CancellationToken::new())
            .await
            .expect("search");

        assert!(!outcome.degenerate);
        assert!(outcome.rollouts_run >= 1, "early stage must roll out once");
    }

    #[tokio::test]
    async fn deepening_stage_early_exits_on_a_strong_root() {
        let invoker = ScriptedInvoker::new();
        invoker.push(Role::Main, plan_value("想你了，今天过得怎么样呀"));
        invoker.set_default(
            Role::Main,
            json!({"plans": [plan_value("今天想起你好几次，忙完了吗")]}),
        );
        invoker.set_default(Role::Judge, good_soft(0.95));

        let state = state_with_stage(RelationshipStage::Intensifying);
        let req = Requirements::compile(&state, &ProcessConfig::default());
        let config = SearchConfig::default();
        let limiter = Arc::new(Semaphore::new(1));
        let engine = SearchEngine::new(&invoker, &config, &limiter);

        let outcome = engine
            .run(&state, &req, &CancellationToken::new())
            .await
            .expect("search");

        assert_eq!(outcome.rollouts_run, 0, "strong root exits before rollouts");
        assert_eq!(outcome.plan.messages[0].content, "想你了，今天过得怎么样呀");
    }

    #[tokio::test]
    async fn gate_rejected_candidates_are_never_soft_scored() {
        let invoker = ScriptedInvoker::new();
        invoker.push(Role::Main, plan_value("今天把房间收拾了一下还挺有成就感"));
        // Every expansion candidate trips the hard gate (immersion phrase),
        // so no candidate may reach the soft scorer.
        invoker.set_default(
            Role::Main,
            json!({"plans": [plan_value("按照我的设定我今天休息这句话也够长了")]}),
        );
        invoker.set_default(Role::Judge, good_soft(0.4));

        let state = state_with_stage(RelationshipStage::Initiating);
        let req = Requirements::compile(&state, &ProcessConfig::default());
        let config = SearchConfig::default();
        let limiter = Arc::new(Semaphore::new(1));
        let engine = SearchEngine::new(&invoker, &config, &limiter);

        let outcome = engine
            .run(&state, &req, &CancellationToken::new())
            .await
            .expect("search");

        // Judge calls: root eval + final re-eval only. No batch gate, no
        // candidate scoring, because the hard gate dropped everything first.
        let judge_calls = invoker.calls_for(Role::Judge);
        assert_eq!(judge_calls, 2, "judge saw only root and final re-eval");
        assert_eq!(outcome.plan.messages[0].content, "今天把房间收拾了一下还挺有成就感");
    }

    #[tokio::test]
    async fn unparseable_root_returns_degenerate_plan() {
        let invoker = ScriptedInvoker::new();
        // Root plan parse fails (no messages), then the reduced plain-text
        // fallback answers.
        invoker.push(Role::Main, json!({"messages": []}));
        invoker.push(Role::Main, Value::String("我在呢，刚才在忙".to_string()));

        let state = state_with_stage(RelationshipStage::Experimenting);
        let mut req = Requirements::compile(&state, &ProcessConfig::default());
        req.tasks = vec![crate::state::TurnTask {
            id: "t1".to_string(),
            description: "ask about their day".to_string(),
            task_type: "daily".to_string(),
        }];
        let config = SearchConfig::default();
        let limiter = Arc::new(Semaphore::new(1));
        let engine = SearchEngine::new(&invoker, &config, &limiter);

        let outcome = engine
            .run(&state, &req, &CancellationToken::new())
            .await
            .expect("search");

        assert!(outcome.degenerate);
        assert_eq!(outcome.plan.messages.len(), 1);
        // Fallback plans mark the handed-over tasks as attempted.
        assert_eq!(outcome.plan.attempted_task_ids, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn canceled_token_propagates_out_of_search() {
        let invoker = ScriptedInvoker::new().with_delay(std::time::Duration::from_secs(5));
        invoker.set_default(Role::Main, plan_value("ok"));
        let state = state_with_stage(RelationshipStage::Experimenting);
        let req = Requirements::compile(&state, &ProcessConfig::default());
        let config = SearchConfig::default();
        let limiter = Arc::new(Semaphore::new(1));
        let engine = SearchEngine::new(&invoker, &config, &limiter);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.run(&state, &req, &cancel).await;
        assert!(matches!(result, Err(InvokerError::Canceled)));
    }

    #[test]
    fn ucb_prefers_unvisited_then_most_recent() {
        let mut tree = PlanTree::new(ReplyPlan::default());
        tree.backprop(0, 0.5);
        let a = tree.add_child(0, ReplyPlan::default());
        let b = tree.add_child(0, ReplyPlan::default());
        // Both unvisited: the most recently inserted wins the tie.
        assert_eq!(tree.select_leaf(), b);
        tree.backprop(b, 0.9);
        // Now `a` is the unvisited leaf with infinite UCB.
        assert_eq!(tree.select_leaf(), a);
    }

    #[test]
    fn backprop_accumulates_to_the_root() {
        let mut tree = PlanTree::new(ReplyPlan::default());
        let child = tree.add_child(0, ReplyPlan::default());
        let grandchild = tree.add_child(child, ReplyPlan::default());
        tree.backprop(grandchild, 0.8);
        assert_eq!(tree.nodes[0].visits, 1);
        assert!((tree.nodes[0].value_sum - 0.8).abs() < 1e-9);
        assert_eq!(tree.nodes[child].visits, 1);
    }

    #[test]
    fn plan_from_value_accepts_bare_strings() {
        let plan = plan_from_value(&json!({"messages": ["你好呀", {"content": "在忙吗", "delay_seconds": 1.5}]}))
            .expect("plan");
        assert_eq!(plan.messages.len(), 2);
        assert_eq!(plan.messages[1].action, SegmentAction::Typing);
    }
}
