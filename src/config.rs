use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One LLM role endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEndpoint {
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "qwen2.5:14b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for RoleEndpoint {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Per-role call deadlines, seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerTimeouts {
    #[serde(default = "default_main_timeout")]
    pub main_secs: u64,
    #[serde(default = "default_fast_timeout")]
    pub fast_secs: u64,
    #[serde(default = "default_judge_timeout")]
    pub judge_secs: u64,
    #[serde(default = "default_processor_timeout")]
    pub processor_secs: u64,
}

fn default_main_timeout() -> u64 {
    60
}

fn default_fast_timeout() -> u64 {
    20
}

fn default_judge_timeout() -> u64 {
    20
}

fn default_processor_timeout() -> u64 {
    30
}

impl Default for InvokerTimeouts {
    fn default() -> Self {
        Self {
            main_secs: default_main_timeout(),
            fast_secs: default_fast_timeout(),
            judge_secs: default_judge_timeout(),
            processor_secs: default_processor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokerConfig {
    #[serde(default)]
    pub main: RoleEndpoint,
    #[serde(default)]
    pub fast: RoleEndpoint,
    #[serde(default)]
    pub judge: RoleEndpoint,
    #[serde(default)]
    pub processor: RoleEndpoint,
    #[serde(default)]
    pub timeout: InvokerTimeouts,
}

/// Strict early-exit gates for the search. Missing breakdown fields in the
/// soft score always block early exit regardless of these thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyExitConfig {
    #[serde(default = "default_root_score")]
    pub root_score: f64,
    #[serde(default = "default_plan_alignment_min")]
    pub plan_alignment_min: f64,
    #[serde(default = "default_assistantiness_max")]
    pub assistantiness_max: f64,
    #[serde(default = "default_mode_fit_min")]
    pub mode_fit_min: f64,
}

fn default_root_score() -> f64 {
    0.82
}

fn default_plan_alignment_min() -> f64 {
    0.6
}

fn default_assistantiness_max() -> f64 {
    0.3
}

fn default_mode_fit_min() -> f64 {
    0.55
}

impl Default for EarlyExitConfig {
    fn default() -> Self {
        Self {
            root_score: default_root_score(),
            plan_alignment_min: default_plan_alignment_min(),
            assistantiness_max: default_assistantiness_max(),
            mode_fit_min: default_mode_fit_min(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftScorerConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_soft_concurrency")]
    pub max_concurrency: usize,
}

fn default_top_n() -> usize {
    1
}

fn default_soft_concurrency() -> usize {
    1
}

impl Default for SoftScorerConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            max_concurrency: default_soft_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Override the stage-class rollout budget when set.
    #[serde(default)]
    pub rollouts: Option<u32>,
    /// Override the stage-class expansion width when set.
    #[serde(default)]
    pub expand_k: Option<u32>,
    #[serde(default)]
    pub early_exit: EarlyExitConfig,
    #[serde(default)]
    pub soft: SoftScorerConfig,
    /// Warning threshold for the final re-evaluation; never a rejection.
    #[serde(default = "default_final_score_threshold")]
    pub final_score_threshold: f64,
    /// When true, Evolve marks every task handed to the search as attempted
    /// even if the chosen plan omitted them. Default trusts structured plans.
    #[serde(default)]
    pub mark_unplanned_tasks_attempted: bool,
}

fn default_final_score_threshold() -> f64 {
    0.6
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rollouts: None,
            expand_k: None,
            early_exit: EarlyExitConfig::default(),
            soft: SoftScorerConfig::default(),
            final_score_threshold: default_final_score_threshold(),
            mark_unplanned_tasks_attempted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_min_bubble_length")]
    pub min_bubble_length: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_min_first_len")]
    pub min_first_len: usize,
    /// Seconds of simulated typing per character.
    #[serde(default = "default_typing_rate")]
    pub typing_rate: f64,
}

fn default_min_bubble_length() -> usize {
    5
}

fn default_max_messages() -> usize {
    5
}

fn default_max_message_len() -> usize {
    220
}

fn default_min_first_len() -> usize {
    8
}

fn default_typing_rate() -> f64 {
    0.2
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            min_bubble_length: default_min_bubble_length(),
            max_messages: default_max_messages(),
            max_message_len: default_max_message_len(),
            min_first_len: default_min_first_len(),
            typing_rate: default_typing_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-session inbox depth before new arrivals coalesce into the tail.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    4
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Path to the stage-profile YAML; the built-in profile set is used when
    /// the file is absent.
    #[serde(default)]
    pub stage_profiles_path: Option<String>,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_database_path() -> String {
    "rapport.db".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            stage_profiles_path: None,
            invoker: InvokerConfig::default(),
            search: SearchConfig::default(),
            process: ProcessConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `RAPPORT_CONFIG` (or `rapport.json` next to the binary),
    /// falling back to defaults when the file is missing.
    pub fn load() -> Self {
        let path =
            std::env::var("RAPPORT_CONFIG").unwrap_or_else(|_| "rapport.json".to_string());
        match Self::load_from(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Config load failed ({}); using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))
    }
}
