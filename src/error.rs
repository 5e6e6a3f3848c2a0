use thiserror::Error;

/// Errors that escape a turn. Everything else (invoker timeouts, parse
/// failures, stage fallbacks) is absorbed at the stage boundary and recorded
/// on the turn state's error ledger.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("turn superseded by a newer user message")]
    Superseded,

    #[error("persist failed after retries: {0}")]
    Persist(String),

    #[error("turn state invariant violated: {0}")]
    Fatal(String),
}

/// Errors surfaced by an invoker call. The caller decides whether to retry
/// (timeouts retry once) or fall back.
#[derive(Error, Debug)]
pub enum InvokerError {
    #[error("{role} call exceeded its deadline")]
    Timeout { role: &'static str },

    #[error("invoker call canceled")]
    Canceled,

    #[error("invoker transport error: {0}")]
    Transport(String),

    #[error("invoker returned unparseable output: {0}")]
    Parse(String),
}

impl InvokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvokerError::Timeout { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, InvokerError::Canceled)
    }
}
