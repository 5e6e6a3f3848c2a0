//! Relational store with JSON columns. Reads happen once at turn start
//! (single-row lookups keyed by `(bot_id, external_id)`), writes happen once
//! at the end of Persist as a single transaction. JSON columns are always
//! replaced whole, never patched.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::state::{
    BotBasicInfo, BotBigFive, BotPersona, BufferedMessage, MessageRole, MoodState,
    RelationshipStage, RelationshipState, RetrievedMemory, TurnTask, UserBasicInfo,
    CHAT_BUFFER_WINDOW,
};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(120);

pub struct ChatStore {
    conn: Mutex<Connection>,
}

/// Everything the Load stage needs for one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub bot_id: i64,
    pub user_id: i64,
    pub bot_basic_info: BotBasicInfo,
    pub bot_big_five: BotBigFive,
    pub bot_persona: BotPersona,
    pub mood_state: MoodState,
    pub user_basic_info: UserBasicInfo,
    pub user_inferred_profile: HashMap<String, String>,
    pub relationship_state: RelationshipState,
    pub current_stage: RelationshipStage,
    pub conversation_summary: String,
    pub chat_buffer: Vec<BufferedMessage>,
    pub urgent_tasks: Vec<TurnTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptDraft {
    pub user_text: String,
    pub bot_text: String,
    #[serde(default)]
    pub entities: serde_json::Value,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub importance: f64,
    #[serde(default)]
    pub short_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedNoteDraft {
    pub note_type: String,
    pub content: String,
    #[serde(default)]
    pub importance: f64,
}

/// The whole-turn write set committed by Persist in one transaction.
#[derive(Debug, Clone)]
pub struct PersistBundle {
    pub bot_id: i64,
    pub user_id: i64,
    pub relationship_state: RelationshipState,
    pub current_stage: RelationshipStage,
    pub mood_state: MoodState,
    pub conversation_summary: String,
    pub user_basic_info: UserBasicInfo,
    pub user_inferred_profile: HashMap<String, String>,
    pub user_message: MessageDraft,
    pub ai_message: MessageDraft,
    pub transcript: TranscriptDraft,
    pub derived_notes: Vec<DerivedNoteDraft>,
    /// Urgent task ids consumed this turn; removed from the user row.
    pub consumed_urgent_task_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistReceipt {
    pub user_message_id: String,
    pub ai_message_id: String,
    pub transcript_id: String,
}

impl ChatStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                basic_info TEXT NOT NULL DEFAULT '{}',
                big_five TEXT NOT NULL DEFAULT '{}',
                persona TEXT NOT NULL DEFAULT '{}',
                mood_state TEXT NOT NULL DEFAULT '{}',
                urgent_tasks TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER NOT NULL REFERENCES bots(id),
                external_id TEXT NOT NULL,
                basic_info TEXT NOT NULL DEFAULT '{}',
                current_stage TEXT NOT NULL DEFAULT 'initiating',
                dimensions TEXT NOT NULL DEFAULT '{}',
                inferred_profile TEXT NOT NULL DEFAULT '{}',
                assets TEXT NOT NULL DEFAULT '{}',
                spt_info TEXT NOT NULL DEFAULT '{}',
                conversation_summary TEXT NOT NULL DEFAULT '',
                urgent_tasks TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                UNIQUE(bot_id, external_id)
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_user_created
                ON messages(user_id, created_at);
            CREATE TABLE IF NOT EXISTS transcripts (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                turn_index INTEGER NOT NULL,
                user_text TEXT NOT NULL,
                bot_text TEXT NOT NULL,
                entities TEXT NOT NULL DEFAULT '{}',
                topic TEXT NOT NULL DEFAULT '',
                importance REAL NOT NULL DEFAULT 0.0,
                short_context TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transcripts_user
                ON transcripts(user_id, turn_index);
            CREATE TABLE IF NOT EXISTS derived_notes (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                transcript_id TEXT NOT NULL REFERENCES transcripts(id),
                note_type TEXT NOT NULL,
                content TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL
            );",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    // ==========================================
    // Bots and users
    // ==========================================

    pub fn create_bot(
        &self,
        name: &str,
        basic_info: &BotBasicInfo,
        big_five: &BotBigFive,
        persona: &BotPersona,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO bots (name, basic_info, big_five, persona, mood_state, urgent_tasks, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6)",
            params![
                name,
                serde_json::to_string(basic_info)?,
                serde_json::to_string(big_five)?,
                serde_json::to_string(persona)?,
                serde_json::to_string(&MoodState::default())?,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert bot")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_bot_urgent_tasks(&self, bot_id: i64, tasks: &[TurnTask]) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE bots SET urgent_tasks = ?1 WHERE id = ?2",
            params![serde_json::to_string(tasks)?, bot_id],
        )
        .context("Failed to update bot urgent tasks")?;
        Ok(())
    }

    fn get_or_create_user(conn: &Connection, bot_id: i64, external_id: &str) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE bot_id = ?1 AND external_id = ?2",
                params![bot_id, external_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(id) = existing {
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO users (bot_id, external_id, created_at) VALUES (?1, ?2, ?3)",
            params![bot_id, external_id, Utc::now().to_rfc3339()],
        )
        .context("Failed to create user")?;
        Ok(conn.last_insert_rowid())
    }

    /// Single-row reads for the Load stage. Creates the user lazily on first
    /// contact with this bot.
    pub fn load_turn_context(&self, bot_id: i64, external_id: &str) -> Result<TurnContext> {
        let conn = self.lock_conn()?;
        let user_id = Self::get_or_create_user(&conn, bot_id, external_id)?;

        let (bot_basic_raw, big_five_raw, persona_raw, mood_raw, bot_urgent_raw) = conn
            .query_row(
                "SELECT basic_info, big_five, persona, mood_state, urgent_tasks
                 FROM bots WHERE id = ?1",
                params![bot_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .with_context(|| format!("Bot {} not found", bot_id))?;

        let (user_basic_raw, stage_raw, dims_raw, profile_raw, summary, user_urgent_raw) = conn
            .query_row(
                "SELECT basic_info, current_stage, dimensions, inferred_profile,
                        conversation_summary, urgent_tasks
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .context("User row missing after creation")?;

        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM messages
             WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let mut chat_buffer = stmt
            .query_map(params![user_id, CHAT_BUFFER_WINDOW as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(role, content, created_at)| BufferedMessage {
                role: MessageRole::parse(&role),
                content,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect::<Vec<_>>();
        chat_buffer.reverse();

        let mut urgent_tasks: Vec<TurnTask> =
            serde_json::from_str(&bot_urgent_raw).unwrap_or_default();
        let user_urgent: Vec<TurnTask> =
            serde_json::from_str(&user_urgent_raw).unwrap_or_default();
        urgent_tasks.extend(user_urgent);

        Ok(TurnContext {
            bot_id,
            user_id,
            bot_basic_info: serde_json::from_str(&bot_basic_raw).unwrap_or_default(),
            bot_big_five: serde_json::from_str::<BotBigFive>(&big_five_raw)
                .unwrap_or_default()
                .clamped(),
            bot_persona: serde_json::from_str(&persona_raw).unwrap_or_default(),
            mood_state: serde_json::from_str::<MoodState>(&mood_raw)
                .unwrap_or_default()
                .clamped(),
            user_basic_info: serde_json::from_str(&user_basic_raw).unwrap_or_default(),
            user_inferred_profile: serde_json::from_str(&profile_raw).unwrap_or_default(),
            relationship_state: serde_json::from_str::<RelationshipState>(&dims_raw)
                .unwrap_or_default()
                .clamped(),
            current_stage: RelationshipStage::parse(&stage_raw).unwrap_or_default(),
            conversation_summary: summary,
            chat_buffer,
            urgent_tasks,
        })
    }

    // ==========================================
    // Memory retrieval
    // ==========================================

    /// Keyword retrieval over transcripts and derived notes, ranked by
    /// importance. No LLM involved.
    pub fn search_memories(
        &self,
        user_id: i64,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<RetrievedMemory>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut results: Vec<RetrievedMemory> = Vec::new();

        for keyword in keywords.iter().take(5) {
            let pattern = format!("%{}%", keyword.replace('%', "").replace('_', ""));

            let mut stmt = conn.prepare(
                "SELECT short_context, importance FROM transcripts
                 WHERE user_id = ?1 AND (user_text LIKE ?2 OR bot_text LIKE ?2 OR topic LIKE ?2)
                 ORDER BY importance DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![user_id, pattern, limit as i64], |row| {
                    Ok(RetrievedMemory {
                        content: row.get::<_, String>(0)?,
                        importance: row.get::<_, f64>(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            results.extend(rows);

            let mut stmt = conn.prepare(
                "SELECT content, importance FROM derived_notes
                 WHERE user_id = ?1 AND content LIKE ?2
                 ORDER BY importance DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![user_id, pattern, limit as i64], |row| {
                    Ok(RetrievedMemory {
                        content: row.get::<_, String>(0)?,
                        importance: row.get::<_, f64>(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            results.extend(rows);
        }

        results.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        results.dedup_by(|a, b| a.content == b.content);
        results.truncate(limit);
        Ok(results)
    }

    // ==========================================
    // Persist
    // ==========================================

    /// Commit a turn. One transaction; retried twice with backoff before the
    /// error surfaces to the caller. The bot's mood row is only ever touched
    /// here, inside the write transaction, so concurrent sessions of the same
    /// bot cannot lose updates.
    pub fn persist_turn(&self, bundle: &PersistBundle) -> Result<PersistReceipt> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.persist_turn_once(bundle) {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    tracing::warn!(
                        "persist attempt {}/{} failed: {}",
                        attempt,
                        PERSIST_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < PERSIST_ATTEMPTS {
                        std::thread::sleep(PERSIST_BACKOFF * attempt);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("persist failed")))
    }

    fn persist_turn_once(&self, bundle: &PersistBundle) -> Result<PersistReceipt> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().context("Failed to open transaction")?;

        tx.execute(
            "UPDATE users SET basic_info = ?1, current_stage = ?2, dimensions = ?3,
                    inferred_profile = ?4, conversation_summary = ?5
             WHERE id = ?6",
            params![
                serde_json::to_string(&bundle.user_basic_info)?,
                bundle.current_stage.as_str(),
                serde_json::to_string(&bundle.relationship_state.clamped())?,
                serde_json::to_string(&bundle.user_inferred_profile)?,
                bundle.conversation_summary,
                bundle.user_id,
            ],
        )
        .context("Failed to update user row")?;

        tx.execute(
            "UPDATE bots SET mood_state = ?1 WHERE id = ?2",
            params![
                serde_json::to_string(&bundle.mood_state.clamped())?,
                bundle.bot_id,
            ],
        )
        .context("Failed to update bot mood")?;

        if !bundle.consumed_urgent_task_ids.is_empty() {
            for table in ["bots", "users"] {
                let (select, update, row_id) = if table == "bots" {
                    (
                        "SELECT urgent_tasks FROM bots WHERE id = ?1",
                        "UPDATE bots SET urgent_tasks = ?1 WHERE id = ?2",
                        bundle.bot_id,
                    )
                } else {
                    (
                        "SELECT urgent_tasks FROM users WHERE id = ?1",
                        "UPDATE users SET urgent_tasks = ?1 WHERE id = ?2",
                        bundle.user_id,
                    )
                };
                let raw: String = tx.query_row(select, params![row_id], |row| row.get(0))?;
                let tasks: Vec<TurnTask> = serde_json::from_str(&raw).unwrap_or_default();
                let remaining: Vec<TurnTask> = tasks
                    .into_iter()
                    .filter(|t| !bundle.consumed_urgent_task_ids.contains(&t.id))
                    .collect();
                tx.execute(update, params![serde_json::to_string(&remaining)?, row_id])?;
            }
        }

        let user_message_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, user_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_message_id,
                bundle.user_id,
                bundle.user_message.role.as_str(),
                bundle.user_message.content,
                bundle.user_message.metadata.to_string(),
                bundle.user_message.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert user message")?;

        let ai_message_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, user_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ai_message_id,
                bundle.user_id,
                bundle.ai_message.role.as_str(),
                bundle.ai_message.content,
                bundle.ai_message.metadata.to_string(),
                bundle.ai_message.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert ai message")?;

        let turn_index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(turn_index), 0) + 1 FROM transcripts WHERE user_id = ?1",
            params![bundle.user_id],
            |row| row.get(0),
        )?;

        let transcript_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO transcripts (id, user_id, turn_index, user_text, bot_text,
                    entities, topic, importance, short_context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                transcript_id,
                bundle.user_id,
                turn_index,
                bundle.transcript.user_text,
                bundle.transcript.bot_text,
                bundle.transcript.entities.to_string(),
                bundle.transcript.topic,
                bundle.transcript.importance.clamp(0.0, 1.0),
                bundle.transcript.short_context,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert transcript")?;

        for note in &bundle.derived_notes {
            tx.execute(
                "INSERT INTO derived_notes (id, user_id, transcript_id, note_type,
                        content, importance, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    bundle.user_id,
                    transcript_id,
                    note.note_type,
                    note.content,
                    note.importance.clamp(0.0, 1.0),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert derived note")?;
        }

        tx.commit().context("Failed to commit turn")?;

        Ok(PersistReceipt {
            user_message_id,
            ai_message_id,
            transcript_id,
        })
    }

    // ==========================================
    // Introspection (tests, tooling)
    // ==========================================

    pub fn count_messages(&self, user_id: i64) -> Result<i64> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_transcripts(&self, user_id: i64) -> Result<i64> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM transcripts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    pub fn user_id_for(&self, bot_id: i64, external_id: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id FROM users WHERE bot_id = ?1 AND external_id = ?2",
            params![bot_id, external_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }
}
