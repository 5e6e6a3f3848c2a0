//! rapport-backend: the turn engine behind a persona-driven chat bot.
//!
//! One user message runs a fixed thirteen-stage graph (security screen,
//! detection, monologue, memory, budget planning, candidate search, segment
//! shaping, evolution, stage management, persistence) over a shared turn
//! state. The session layer serializes turns per `(user, bot)` pair and
//! supersedes in-flight work when the user keeps typing. All model calls go
//! through the opaque `Invoker` boundary.

pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod invoker;
pub mod llm_json;
pub mod search;
pub mod server;
pub mod session;
pub mod state;
pub mod test_support;
