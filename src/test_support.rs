//! Fakes shared by unit and integration tests: a scripted invoker with
//! per-role response queues, and small state builders.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::InvokerError;
use crate::invoker::{ChatPrompt, Invoker, Role};
use crate::state::{BotBasicInfo, BotBigFive, TurnState};

/// Scripted fake: queued responses pop in call order per role; a per-role
/// default answers once the queue drains. With neither, the call fails like
/// an unparseable completion would.
pub struct ScriptedInvoker {
    queues: Mutex<HashMap<Role, VecDeque<Value>>>,
    defaults: Mutex<HashMap<Role, Value>>,
    calls: Mutex<Vec<(Role, String)>>,
    delay: Option<Duration>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Every call stalls this long first; pair with a tripped token to
    /// exercise cancellation paths.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, role: Role, response: Value) {
        self.queues
            .lock()
            .expect("queue lock")
            .entry(role)
            .or_default()
            .push_back(response);
    }

    pub fn set_default(&self, role: Role, response: Value) {
        self.defaults
            .lock()
            .expect("defaults lock")
            .insert(role, response);
    }

    pub fn calls_for(&self, role: Role) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(r, _)| *r == role)
            .count()
    }

    pub fn recorded_prompts(&self, role: Role) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(
        &self,
        role: Role,
        prompt: &ChatPrompt,
        _schema: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, InvokerError> {
        if cancel.is_cancelled() {
            return Err(InvokerError::Canceled);
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(InvokerError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.calls
            .lock()
            .expect("calls lock")
            .push((role, prompt.user.clone()));

        if let Some(next) = self
            .queues
            .lock()
            .expect("queue lock")
            .get_mut(&role)
            .and_then(|q| q.pop_front())
        {
            return Ok(next);
        }
        if let Some(default) = self.defaults.lock().expect("defaults lock").get(&role) {
            return Ok(default.clone());
        }
        Err(InvokerError::Parse(format!(
            "no scripted response for role {}",
            role.as_str()
        )))
    }
}

/// A turn state with enough identity filled in for prompt builders.
pub fn sample_turn_state(user_input: &str) -> TurnState {
    let mut state = TurnState::default();
    state.turn_id = "test-turn".to_string();
    state.bot_basic_info = BotBasicInfo {
        name: "Mika".to_string(),
        gender: "female".to_string(),
        age: 24,
        region: "Shanghai".to_string(),
        occupation: "illustrator".to_string(),
        speaking_style: "casual, a little teasing".to_string(),
    };
    state.bot_big_five = BotBigFive {
        openness: 0.4,
        conscientiousness: 0.1,
        extraversion: 0.5,
        agreeableness: 0.3,
        neuroticism: -0.2,
    };
    state.user_input = user_input.to_string();
    state.word_budget = 40;
    state.task_budget_max = 2;
    state
}
