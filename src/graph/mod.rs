//! The per-turn graph: a fixed DAG of thirteen stages threaded by the shared
//! turn state. Stages run sequentially on one logical worker; the executor
//! checks the cancellation token before each of the interruptible stages
//! (Load through Process) and lets the tail (FinalValidate through Persist)
//! run to completion once reached. The single conditional edge sits after
//! Security: flagged turns take the in-persona deflection and skip straight
//! to the tail.

pub mod detection;
pub mod evolve;
pub mod memory;
pub mod monologue;
pub mod process;
pub mod security;
pub mod stage_manage;
pub mod task_plan;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::database::{ChatStore, MessageDraft, PersistBundle, PersistReceipt};
use crate::error::{InvokerError, TurnError};
use crate::invoker::Invoker;
use crate::search::requirements::Requirements;
use crate::search::SearchEngine;
use crate::state::{MessageRole, TurnState};
use stage_manage::StageProfileSet;

/// The thirteen stages in execution order. Indexes drive the session FSM's
/// interruptible-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Security,
    SecurityReply,
    Detection,
    Monologue,
    MemoryRetrieve,
    TaskPlan,
    Search,
    Process,
    FinalValidate,
    Evolve,
    StageManage,
    Persist,
}

impl Stage {
    pub fn index(self) -> u8 {
        match self {
            Stage::Load => 1,
            Stage::Security => 2,
            Stage::SecurityReply => 3,
            Stage::Detection => 4,
            Stage::Monologue => 5,
            Stage::MemoryRetrieve => 6,
            Stage::TaskPlan => 7,
            Stage::Search => 8,
            Stage::Process => 9,
            Stage::FinalValidate => 10,
            Stage::Evolve => 11,
            Stage::StageManage => 12,
            Stage::Persist => 13,
        }
    }

    /// Stages 1-9 may be canceled; from FinalValidate on the turn commits.
    pub fn is_interruptible(self) -> bool {
        self.index() <= Stage::Process.index()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Security => "security",
            Stage::SecurityReply => "security_reply",
            Stage::Detection => "detection",
            Stage::Monologue => "monologue",
            Stage::MemoryRetrieve => "memory_retrieve",
            Stage::TaskPlan => "task_plan",
            Stage::Search => "search",
            Stage::Process => "process",
            Stage::FinalValidate => "final_validate",
            Stage::Evolve => "evolve",
            Stage::StageManage => "stage_manage",
            Stage::Persist => "persist",
        }
    }
}

/// Index of the last interruptible stage, exported for the session FSM.
pub const LAST_INTERRUPTIBLE_STAGE: u8 = 9;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub bot_id: i64,
    pub external_user_id: String,
    pub user_input: String,
    pub turn_id: String,
    pub parent_turn_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: TurnState,
    pub receipt: PersistReceipt,
    pub user_created_at: DateTime<Utc>,
    pub ai_created_at: DateTime<Utc>,
}

pub struct GraphExecutor {
    invoker: Arc<dyn Invoker>,
    store: Arc<ChatStore>,
    config: Arc<AppConfig>,
    stage_profiles: Arc<StageProfileSet>,
    judge_limiter: Arc<Semaphore>,
}

impl GraphExecutor {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        store: Arc<ChatStore>,
        config: Arc<AppConfig>,
        stage_profiles: Arc<StageProfileSet>,
    ) -> Self {
        let judge_limiter = Arc::new(Semaphore::new(config.search.soft.max_concurrency.max(1)));
        Self {
            invoker,
            store,
            config,
            stage_profiles,
            judge_limiter,
        }
    }

    /// Run one turn. `progress` mirrors the current stage index for the
    /// session dispatcher; `cancel` supersedes the turn when tripped inside
    /// the interruptible window.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
        progress: Arc<AtomicU8>,
    ) -> Result<TurnOutcome, TurnError> {
        let mut state = TurnState::default();

        // --- Load -------------------------------------------------------
        self.enter(Stage::Load, &cancel, &progress)?;
        let context = self
            .store
            .load_turn_context(request.bot_id, &request.external_user_id)
            .map_err(|e| TurnError::Fatal(format!("load failed: {}", e)))?;

        state.turn_id = request.turn_id.clone();
        state.parent_turn_id = request.parent_turn_id.clone();
        state.bot_id = context.bot_id;
        state.user_id = context.user_id;
        state.external_user_id = request.external_user_id.clone();
        state.bot_basic_info = context.bot_basic_info;
        state.bot_big_five = context.bot_big_five;
        state.bot_persona = context.bot_persona;
        state.mood_state = context.mood_state;
        state.user_basic_info = context.user_basic_info;
        state.user_inferred_profile = context.user_inferred_profile;
        state.relationship_state = context.relationship_state;
        state.current_stage = context.current_stage;
        state.conversation_summary = context.conversation_summary;
        state.chat_buffer = context.chat_buffer;
        state.pending_urgent_tasks = context.urgent_tasks;
        state.user_input = request.user_input.clone();
        state.user_received_at = Some(request.received_at);

        // --- Security ---------------------------------------------------
        self.enter(Stage::Security, &cancel, &progress)?;
        if let Err(e) = security::classify(self.invoker.as_ref(), &mut state, &cancel).await {
            self.absorb(Stage::Security, e, &mut state)?;
        }

        if state.security_flags.needs_security_response {
            // The one conditional edge: deflect, then commit the tail.
            self.enter(Stage::SecurityReply, &cancel, &progress)?;
            if let Err(e) = security::security_reply(self.invoker.as_ref(), &mut state, &cancel).await
            {
                self.absorb(Stage::SecurityReply, e, &mut state)?;
            }
        } else {
            self.enter(Stage::Detection, &cancel, &progress)?;
            if let Err(e) = detection::run(self.invoker.as_ref(), &mut state, &cancel).await {
                self.absorb(Stage::Detection, e, &mut state)?;
                detection::fallback(&mut state);
            }

            self.enter(Stage::Monologue, &cancel, &progress)?;
            if let Err(e) = monologue::run(self.invoker.as_ref(), &mut state, &cancel).await {
                self.absorb(Stage::Monologue, e, &mut state)?;
                monologue::fallback(&mut state);
            }

            self.enter(Stage::MemoryRetrieve, &cancel, &progress)?;
            memory::retrieve(self.store.as_ref(), &mut state);

            self.enter(Stage::TaskPlan, &cancel, &progress)?;
            if let Err(e) = task_plan::run(self.invoker.as_ref(), &mut state, &cancel).await {
                self.absorb(Stage::TaskPlan, e, &mut state)?;
            }

            self.enter(Stage::Search, &cancel, &progress)?;
            let requirements = Requirements::compile(&state, &self.config.process);
            let engine =
                SearchEngine::new(self.invoker.as_ref(), &self.config.search, &self.judge_limiter);
            match engine.run(&state, &requirements, &cancel).await {
                Ok(outcome) => {
                    if outcome.degenerate {
                        state.record_error("search", "degenerate fallback plan");
                    }
                    tracing::debug!(
                        "search done: score {:.3} after {} rollouts",
                        outcome.score,
                        outcome.rollouts_run
                    );
                    state.reply_plan = Some(outcome.plan);
                }
                Err(e) => {
                    self.absorb(Stage::Search, e, &mut state)?;
                    state.reply_plan = Some(Default::default());
                }
            }

            self.enter(Stage::Process, &cancel, &progress)?;
            if let Err(e) =
                process::run(self.invoker.as_ref(), &mut state, &self.config.process, &cancel)
                    .await
            {
                self.absorb(Stage::Process, e, &mut state)?;
            }

            self.enter(Stage::FinalValidate, &cancel, &progress)?;
            process::final_validate(&mut state, &self.config.process);
        }

        // --- Tail: no cancellation checks past this point ----------------
        // The dispatcher stops tripping the token once progress leaves the
        // interruptible window; a fresh token keeps a late trip from
        // aborting invoker calls mid-commit.
        let tail_cancel = CancellationToken::new();

        self.enter(Stage::Evolve, &tail_cancel, &progress)?;
        if let Err(e) = evolve::run(
            self.invoker.as_ref(),
            &mut state,
            &self.config.search,
            &tail_cancel,
        )
        .await
        {
            state.record_error(Stage::Evolve.name(), e);
        }
        self.check_invariants(&state)?;

        self.enter(Stage::StageManage, &tail_cancel, &progress)?;
        self.stage_profiles.evaluate(&mut state);

        self.enter(Stage::Persist, &tail_cancel, &progress)?;
        let drafts = match memory::manage(self.invoker.as_ref(), &state, &tail_cancel).await {
            Ok(drafts) => drafts,
            Err(e) => {
                state.record_error("memory_manage", e);
                memory::fallback_drafts(&state)
            }
        };
        state.conversation_summary = drafts.conversation_summary.clone();

        let user_created_at = request.received_at;
        let ai_created_at = Utc::now();
        let bundle = PersistBundle {
            bot_id: state.bot_id,
            user_id: state.user_id,
            relationship_state: state.relationship_state,
            current_stage: state.current_stage,
            mood_state: state.mood_state,
            conversation_summary: drafts.conversation_summary,
            user_basic_info: state.user_basic_info.clone(),
            user_inferred_profile: state.user_inferred_profile.clone(),
            user_message: MessageDraft {
                role: MessageRole::User,
                content: state.user_input.clone(),
                metadata: json!({"turn_id": state.turn_id}),
                created_at: user_created_at,
            },
            ai_message: MessageDraft {
                role: MessageRole::Ai,
                content: ai_message_content(&state),
                metadata: ai_metadata(&state),
                created_at: ai_created_at,
            },
            transcript: drafts.transcript,
            derived_notes: drafts.derived_notes,
            consumed_urgent_task_ids: consumed_task_ids(&state),
        };

        let receipt = self
            .store
            .persist_turn(&bundle)
            .map_err(|e| TurnError::Persist(e.to_string()))?;

        tracing::info!(
            "turn {} committed ({} segments, stage {})",
            state.turn_id,
            state.final_segments.len(),
            state.current_stage.as_str()
        );

        Ok(TurnOutcome {
            state,
            receipt,
            user_created_at,
            ai_created_at,
        })
    }

    fn enter(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        progress: &AtomicU8,
    ) -> Result<(), TurnError> {
        progress.store(stage.index(), Ordering::SeqCst);
        if stage.is_interruptible() && cancel.is_cancelled() {
            tracing::debug!("turn canceled before {}", stage.name());
            return Err(TurnError::Superseded);
        }
        tracing::debug!("stage {}", stage.name());
        Ok(())
    }

    /// Stage-level error policy: cancellation supersedes the turn, anything
    /// else is recorded and the stage falls back.
    fn absorb(
        &self,
        stage: Stage,
        error: InvokerError,
        state: &mut TurnState,
    ) -> Result<(), TurnError> {
        if error.is_canceled() {
            return Err(TurnError::Superseded);
        }
        state.record_error(stage.name(), error);
        Ok(())
    }

    fn check_invariants(&self, state: &TurnState) -> Result<(), TurnError> {
        for dim in crate::state::RELATIONSHIP_DIMS {
            let v = state.relationship_state.get(dim);
            if !(0.0..=1.0).contains(&v) || !v.is_finite() {
                return Err(TurnError::Fatal(format!(
                    "relationship dimension {} out of range: {}",
                    dim, v
                )));
            }
        }
        if !stage_manage::is_known_stage(state.current_stage) {
            return Err(TurnError::Fatal("unknown relationship stage".to_string()));
        }
        Ok(())
    }
}

fn ai_message_content(state: &TurnState) -> String {
    if state.is_macro_delay {
        String::new()
    } else {
        state.final_response.clone()
    }
}

fn ai_metadata(state: &TurnState) -> serde_json::Value {
    json!({
        "turn_id": state.turn_id,
        "parent_turn_id": state.parent_turn_id,
        "errors": state.errors,
        "segments": state.final_segments.len(),
        "is_macro_delay": state.is_macro_delay,
        "macro_delay_seconds": state.macro_delay_seconds,
        "security_response": state.security_flags.needs_security_response,
        "stage_transition": state.stage_transition,
    })
}

fn consumed_task_ids(state: &TurnState) -> Vec<String> {
    let Some(plan) = state.reply_plan.as_ref() else {
        return Vec::new();
    };
    state
        .pending_urgent_tasks
        .iter()
        .filter(|t| {
            plan.attempted_task_ids.contains(&t.id) || plan.completed_task_ids.contains(&t.id)
        })
        .map(|t| t.id.clone())
        .collect()
}
