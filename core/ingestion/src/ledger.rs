use chat_grapher_schemas::{ConversationId, RunId, RunStats, Stage};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;

/// Per-conversation stage tracking so an interrupted import can resume.
///
/// Rows are keyed by `(source, conversation_key)`; the key is the source
/// conversation id, or `#<index>` for records that carry none.
pub struct IngestLedger {
    conn: Connection,
}

impl IngestLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        let ledger = Self { conn };
        ledger.init_schema()?;

        info!("Ingest ledger initialized");
        Ok(ledger)
    }

    pub fn in_memory() -> Result<Self> {
        let ledger = Self {
            conn: Connection::open_in_memory()?,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                stats_json TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_progress (
                source TEXT NOT NULL,
                conversation_key TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source, conversation_key)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_progress_run ON conversation_progress(run_id)",
            [],
        )?;

        Ok(())
    }

    pub fn begin_run(&self, run_id: &RunId, source: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (id, source, phase, started_at) VALUES (?1, ?2, 'importing', ?3)",
            params![run_id.0, source, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn finish_run(&self, stats: &RunStats) -> Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        self.conn.execute(
            "UPDATE runs SET phase = ?1, finished_at = ?2, stats_json = ?3 WHERE id = ?4",
            params![
                stats.phase.as_str(),
                stats.end_time.unwrap_or_else(Utc::now).to_rfc3339(),
                stats_json,
                stats.run_id.0
            ],
        )?;
        Ok(())
    }

    /// Record `stage` as the last completed stage for a conversation
    pub fn record_stage(
        &self,
        source: &str,
        conversation_key: &str,
        conversation_id: &ConversationId,
        run_id: &RunId,
        stage: Stage,
    ) -> Result<()> {
        debug!("{} {} -> {}", source, conversation_key, stage);
        self.conn.execute(
            "INSERT INTO conversation_progress
                (source, conversation_key, conversation_id, run_id, stage, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source, conversation_key) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                run_id = excluded.run_id,
                stage = excluded.stage,
                updated_at = excluded.updated_at",
            params![
                source,
                conversation_key,
                conversation_id.0,
                run_id.0,
                stage.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn stage_of(&self, source: &str, conversation_key: &str) -> Result<Option<Stage>> {
        let stage: Option<String> = self
            .conn
            .query_row(
                "SELECT stage FROM conversation_progress WHERE source = ?1 AND conversation_key = ?2",
                params![source, conversation_key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(stage.as_deref().and_then(Stage::parse))
    }

    pub fn is_committed(&self, source: &str, conversation_key: &str) -> Result<bool> {
        Ok(self.stage_of(source, conversation_key)? == Some(Stage::Committed))
    }

    pub fn committed_count(&self, source: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conversation_progress WHERE source = ?1 AND stage = 'committed'",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Conversations a run left before `committed`, with their last stage
    pub fn incomplete(&self, run_id: &RunId) -> Result<Vec<(String, Stage)>> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_key, stage FROM conversation_progress
             WHERE run_id = ?1 AND stage != 'committed'
             ORDER BY updated_at",
        )?;

        let rows = stmt
            .query_map(params![run_id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, stage)| Stage::parse(&stage).map(|stage| (key, stage)))
            .collect())
    }

    /// Most recently started run over `source` and its phase
    pub fn last_run(&self, source: &str) -> Result<Option<(RunId, String)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, phase FROM runs WHERE source = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![source],
                |row| Ok((RunId(row.get(0)?), row.get(1)?)),
            )
            .optional()?)
    }

    pub fn run_phase(&self, run_id: &RunId) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT phase FROM runs WHERE id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .optional()?)
    }
}
