//! Session control: one dispatcher per `(user, bot)` pair serializes turns,
//! supersedes in-flight work when the user keeps typing, and queues messages
//! that arrive after a turn has passed the point of no return.
//!
//! Supersession contract: a message landing while the active turn is still
//! in stages 1-9 cancels it and restarts with the merged input
//! `old + "\n" + new`; the displaced HTTP waiter gets a `superseded` status,
//! never an error. Messages landing in the tail (stage 10+) wait their turn
//! and see the committed state. Segment emission is ordered, honors each
//! delay, and is discarded wholesale when something newer supersedes it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::TurnError;
use crate::graph::{GraphExecutor, TurnOutcome, TurnRequest, LAST_INTERRUPTIBLE_STAGE};
use crate::state::SegmentDraft;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub bot_id: i64,
    pub external_user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Superseded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub status: TurnStatus,
    pub segments: Vec<SegmentDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macro_delay_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnResponse {
    fn superseded() -> Self {
        Self {
            status: TurnStatus::Superseded,
            segments: Vec::new(),
            macro_delay_seconds: None,
            user_created_at: None,
            ai_created_at: None,
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: TurnStatus::Error,
            segments: Vec::new(),
            macro_delay_seconds: None,
            user_created_at: None,
            ai_created_at: None,
            error: Some(message),
        }
    }

    fn success(outcome: &TurnOutcome) -> Self {
        Self {
            status: TurnStatus::Success,
            segments: outcome.state.final_segments.clone(),
            macro_delay_seconds: outcome.state.macro_delay_seconds,
            user_created_at: Some(outcome.user_created_at),
            ai_created_at: Some(outcome.ai_created_at),
            error: None,
        }
    }
}

/// One delivered bubble on the push channel.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentEvent {
    pub bot_id: i64,
    pub external_user_id: String,
    pub turn_id: String,
    pub index: usize,
    pub content: String,
    pub action: crate::state::SegmentAction,
}

struct InboundMessage {
    text: String,
    received_at: DateTime<Utc>,
    respond: oneshot::Sender<TurnResponse>,
}

pub struct SessionManager {
    executor: Arc<GraphExecutor>,
    config: Arc<AppConfig>,
    sessions: Mutex<HashMap<SessionKey, mpsc::UnboundedSender<InboundMessage>>>,
    events: broadcast::Sender<SegmentEvent>,
}

impl SessionManager {
    pub fn new(executor: Arc<GraphExecutor>, config: Arc<AppConfig>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            executor,
            config,
            sessions: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SegmentEvent> {
        self.events.subscribe()
    }

    /// Hand a message to the session dispatcher; the returned receiver
    /// resolves once this message's turn settles (or is superseded).
    pub async fn submit(
        self: &Arc<Self>,
        bot_id: i64,
        external_user_id: &str,
        text: String,
    ) -> oneshot::Receiver<TurnResponse> {
        let (respond, receiver) = oneshot::channel();
        let message = InboundMessage {
            text,
            received_at: Utc::now(),
            respond,
        };
        let key = SessionKey {
            bot_id,
            external_user_id: external_user_id.to_string(),
        };

        let mut sessions = self.sessions.lock().await;
        let sender = sessions.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = Dispatcher {
                key: key.clone(),
                executor: self.executor.clone(),
                config: self.config.clone(),
                events: self.events.clone(),
            };
            tokio::spawn(dispatcher.run(rx));
            tx
        });
        if let Err(send_err) = sender.send(message) {
            // Dispatcher died; replace it and retry once.
            tracing::warn!("session dispatcher for {:?} was gone; respawning", key);
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = Dispatcher {
                key: key.clone(),
                executor: self.executor.clone(),
                config: self.config.clone(),
                events: self.events.clone(),
            };
            tokio::spawn(dispatcher.run(rx));
            let _ = tx.send(send_err.0);
            sessions.insert(key, tx);
        }
        receiver
    }
}

struct ActiveTurn {
    turn_id: String,
    user_input: String,
    received_at: DateTime<Utc>,
    cancel: CancellationToken,
    progress: Arc<AtomicU8>,
    waiter: Option<oneshot::Sender<TurnResponse>>,
    join: JoinHandle<Result<TurnOutcome, TurnError>>,
}

/// A message waiting for the active turn to finish before it may restart or
/// run: either the supersession restart, or a tail-window queue entry.
struct PendingMessage {
    text: String,
    received_at: DateTime<Utc>,
    respond: oneshot::Sender<TurnResponse>,
    parent_turn_id: Option<String>,
}

struct Dispatcher {
    key: SessionKey,
    executor: Arc<GraphExecutor>,
    config: Arc<AppConfig>,
    events: broadcast::Sender<SegmentEvent>,
}

enum Wake {
    Message(Option<InboundMessage>),
    TurnDone(Result<Result<TurnOutcome, TurnError>, tokio::task::JoinError>),
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let mut active: Option<ActiveTurn> = None;
        // Set while a supersession restart waits for the canceled worker.
        let mut restart: Option<PendingMessage> = None;
        let mut queue: VecDeque<PendingMessage> = VecDeque::new();
        let mut emitter: Option<CancellationToken> = None;
        let mut closed = false;

        loop {
            if active.is_none() {
                if let Some(pending) = restart.take().or_else(|| queue.pop_front()) {
                    active = Some(self.start_turn(pending, &mut emitter));
                    continue;
                }
                if closed {
                    break;
                }
                match rx.recv().await {
                    Some(message) => {
                        // Fresh message on an idle (or emitting) session:
                        // anything still typing out is superseded.
                        active = Some(self.start_turn(
                            PendingMessage {
                                text: message.text,
                                received_at: message.received_at,
                                respond: message.respond,
                                parent_turn_id: None,
                            },
                            &mut emitter,
                        ));
                    }
                    None => break,
                }
                continue;
            }

            let wake = {
                let turn = active.as_mut().expect("active checked above");
                tokio::select! {
                    message = rx.recv() => Wake::Message(message),
                    result = &mut turn.join => Wake::TurnDone(result),
                }
            };

            match wake {
                Wake::Message(None) => closed = true,
                Wake::Message(Some(message)) => {
                    self.on_message_during_turn(
                        message,
                        active.as_mut().expect("active"),
                        &mut restart,
                        &mut queue,
                    );
                }
                Wake::TurnDone(result) => {
                    let turn = active.take().expect("active");
                    self.on_turn_done(turn, result, &mut restart, &mut queue, &mut emitter);
                }
            }
        }
    }

    fn on_message_during_turn(
        &self,
        message: InboundMessage,
        turn: &mut ActiveTurn,
        restart: &mut Option<PendingMessage>,
        queue: &mut VecDeque<PendingMessage>,
    ) {
        let progress = turn.progress.load(Ordering::SeqCst);
        if progress <= LAST_INTERRUPTIBLE_STAGE {
            // Merge-and-restart: cancel the worker, answer the displaced
            // caller with `superseded`, and hold the new text until the
            // worker acknowledges the cancellation.
            tracing::debug!(
                "superseding turn {} at stage {} for {:?}",
                turn.turn_id,
                progress,
                self.key
            );
            turn.cancel.cancel();
            if let Some(waiter) = turn.waiter.take() {
                let _ = waiter.send(TurnResponse::superseded());
            }
            if let Some(previous) = restart.take() {
                // Two supersessions in a row: the middle caller is displaced
                // too, and its text folds into the restart.
                let _ = previous.respond.send(TurnResponse::superseded());
                *restart = Some(PendingMessage {
                    text: format!("{}\n{}", previous.text, message.text),
                    received_at: previous.received_at,
                    respond: message.respond,
                    parent_turn_id: Some(turn.turn_id.clone()),
                });
            } else {
                *restart = Some(PendingMessage {
                    text: message.text,
                    received_at: message.received_at,
                    respond: message.respond,
                    parent_turn_id: Some(turn.turn_id.clone()),
                });
            }
        } else {
            // Tail window: the turn commits; this message runs after it.
            if queue.len() >= self.config.session.queue_depth.max(1) {
                // Full inbox coalesces into the tail; the displaced tail
                // caller is answered as superseded.
                if let Some(mut tail) = queue.pop_back() {
                    let merged = format!("{}\n{}", tail.text, message.text);
                    let displaced =
                        std::mem::replace(&mut tail.respond, message.respond);
                    let _ = displaced.send(TurnResponse::superseded());
                    tail.text = merged;
                    queue.push_back(tail);
                }
            } else {
                queue.push_back(PendingMessage {
                    text: message.text,
                    received_at: message.received_at,
                    respond: message.respond,
                    parent_turn_id: None,
                });
            }
        }
    }

    fn on_turn_done(
        &self,
        turn: ActiveTurn,
        result: Result<Result<TurnOutcome, TurnError>, tokio::task::JoinError>,
        restart: &mut Option<PendingMessage>,
        queue: &mut VecDeque<PendingMessage>,
        emitter: &mut Option<CancellationToken>,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(join_err) => {
                tracing::error!("turn worker panicked: {}", join_err);
                if let Some(waiter) = turn.waiter {
                    let _ = waiter.send(TurnResponse::error("turn worker failed".to_string()));
                }
                return;
            }
        };

        match outcome {
            Ok(committed) => {
                if let Some(waiter) = turn.waiter {
                    let _ = waiter.send(TurnResponse::success(&committed));
                }
                self.spawn_emitter(&committed, emitter);
                if let Some(mut pending) = restart.take() {
                    // The cancel lost the race and the turn committed anyway:
                    // the old input is persisted, so the restart runs with
                    // only the new text.
                    pending.parent_turn_id = None;
                    queue.push_front(pending);
                }
            }
            Err(TurnError::Superseded) => {
                // The waiter was already answered at supersession time; the
                // held restart now merges the canceled turn's input.
                if let Some(waiter) = turn.waiter {
                    let _ = waiter.send(TurnResponse::superseded());
                }
                if let Some(pending) = restart.take() {
                    queue.push_front(PendingMessage {
                        text: format!("{}\n{}", turn.user_input, pending.text),
                        received_at: turn.received_at,
                        respond: pending.respond,
                        parent_turn_id: Some(turn.turn_id.clone()),
                    });
                }
            }
            Err(error) => {
                tracing::error!("turn {} failed: {}", turn.turn_id, error);
                if let Some(waiter) = turn.waiter {
                    let _ = waiter.send(TurnResponse::error(error.to_string()));
                }
                if let Some(pending) = restart.take() {
                    // Nothing was persisted; keep the merged input.
                    queue.push_front(PendingMessage {
                        text: format!("{}\n{}", turn.user_input, pending.text),
                        received_at: turn.received_at,
                        respond: pending.respond,
                        parent_turn_id: Some(turn.turn_id.clone()),
                    });
                }
            }
        }
    }

    fn start_turn(
        &self,
        pending: PendingMessage,
        emitter: &mut Option<CancellationToken>,
    ) -> ActiveTurn {
        // Any bubbles still typing out belong to an older exchange now.
        if let Some(previous) = emitter.take() {
            previous.cancel();
        }

        let turn_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let progress = Arc::new(AtomicU8::new(0));
        let request = TurnRequest {
            bot_id: self.key.bot_id,
            external_user_id: self.key.external_user_id.clone(),
            user_input: pending.text.clone(),
            turn_id: turn_id.clone(),
            parent_turn_id: pending.parent_turn_id.clone(),
            received_at: pending.received_at,
        };

        let executor = self.executor.clone();
        let worker_cancel = cancel.clone();
        let worker_progress = progress.clone();
        let join =
            tokio::spawn(
                async move { executor.run_turn(request, worker_cancel, worker_progress).await },
            );

        ActiveTurn {
            turn_id,
            user_input: pending.text,
            received_at: pending.received_at,
            cancel,
            progress,
            waiter: Some(pending.respond),
            join,
        }
    }

    /// Deliver committed segments in order, sleeping out each delay. A newer
    /// turn cancels whatever has not been emitted yet.
    fn spawn_emitter(&self, outcome: &TurnOutcome, emitter: &mut Option<CancellationToken>) {
        if let Some(previous) = emitter.take() {
            previous.cancel();
        }
        if outcome.state.final_segments.is_empty() {
            return;
        }

        let cancel = CancellationToken::new();
        *emitter = Some(cancel.clone());
        let events = self.events.clone();
        let key = self.key.clone();
        let turn_id = outcome.state.turn_id.clone();
        let segments = outcome.state.final_segments.clone();

        tokio::spawn(async move {
            for (index, segment) in segments.into_iter().enumerate() {
                if segment.delay_seconds > 0.0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs_f64(
                            segment.delay_seconds,
                        )) => {}
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                let _ = events.send(SegmentEvent {
                    bot_id: key.bot_id,
                    external_user_id: key.external_user_id.clone(),
                    turn_id: turn_id.clone(),
                    index,
                    content: segment.content,
                    action: segment.action,
                });
            }
        });
    }
}
