pub mod models;


use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

/// Outcome of attempting to claim a `(episode, level)` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// New work claimed. `transcript_active` is true when another in-flight
    /// job already owns the transcription for this episode, in which case
    /// the claimer must wait on the transcript instead of re-transcribing.
    Claimed { transcript_active: bool },
    /// A non-terminal job already exists for the pair — submission is a no-op.
    AlreadyActive,
    /// The summary is already ready — nothing to do.
    AlreadyReady,
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT,
                audio_url TEXT NOT NULL UNIQUE,
                language TEXT NOT NULL DEFAULT 'en',
                feed_source TEXT NOT NULL DEFAULT 'rss',
                published_date TEXT,
                added_date TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_published
                ON episodes(published_date DESC);

            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'transcribing',
                full_text TEXT,
                segments_json TEXT,
                language TEXT,
                provider TEXT,
                duration_secs REAL,
                speaker_count INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_status ON transcripts(status);

            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                level TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                content TEXT,
                language TEXT,
                model TEXT,
                language_corrected INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                UNIQUE(episode_id, level)
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_status ON summaries(status);
        "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Episodes
    // =========================================================================

    /// Insert or update an episode keyed by its audio URL.
    /// Returns the row id and whether the episode was newly created.
    pub fn upsert_episode(
        &self,
        title: &str,
        description: Option<&str>,
        audio_url: &str,
        language: Option<&str>,
        published_date: Option<&str>,
        feed_source: &str,
    ) -> Result<(i64, bool)> {
        let conn = self.conn.lock().unwrap();

        let existing_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM episodes WHERE audio_url = ?",
                params![audio_url],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing_id {
            conn.execute(
                "UPDATE episodes SET
                    title = ?,
                    description = COALESCE(?, description),
                    published_date = COALESCE(?, published_date)
                 WHERE id = ?",
                params![title, description, published_date, id],
            )?;
            Ok((id, false))
        } else {
            conn.execute(
                "INSERT INTO episodes (title, description, audio_url, language, published_date, feed_source)
                 VALUES (?, ?, ?, COALESCE(?, 'en'), ?, ?)",
                params![title, description, audio_url, language, published_date, feed_source],
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }

    pub fn get_episode_by_id(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                "SELECT id, title, description, audio_url, language, feed_source, published_date, added_date
                 FROM episodes WHERE id = ?",
                params![id],
                |row| {
                    Ok(Episode {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                        audio_url: row.get(3)?,
                        language: row.get(4)?,
                        feed_source: row.get(5)?,
                        published_date: row.get(6)?,
                        added_date: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(episode)
    }

    /// Update the configured language for an episode (self-healing correction).
    pub fn set_episode_language(&self, episode_id: i64, language: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET language = ? WHERE id = ?",
            params![language, episode_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Job claim (dedup)
    // =========================================================================

    /// Check-then-claim for a `(episode, level)` job.
    ///
    /// Runs as a single transaction under the connection lock, so concurrent
    /// submitters observe it atomically: at most one of them gets `Claimed`
    /// while the job is non-terminal. The transcript row is written directly
    /// in `transcribing` — there is no separate `queued` write. A `ready`
    /// transcript is never clobbered here; whether it can be reused (same
    /// language) is the processing task's call.
    pub fn claim_job(
        &self,
        episode_id: i64,
        level: SummaryLevel,
        language: &str,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let summary_status: Option<String> = tx
            .query_row(
                "SELECT status FROM summaries WHERE episode_id = ? AND level = ?",
                params![episode_id, level.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match summary_status.map(SummaryStatus::from) {
            Some(SummaryStatus::Ready) => return Ok(ClaimOutcome::AlreadyReady),
            Some(s) if s.is_active() => return Ok(ClaimOutcome::AlreadyActive),
            _ => {}
        }

        let transcript_status: Option<String> = tx
            .query_row(
                "SELECT status FROM transcripts WHERE episode_id = ?",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        let transcript_status = transcript_status.map(TranscriptStatus::from);

        let transcript_active = transcript_status.map_or(false, |s| s.is_active());

        if !transcript_active && transcript_status != Some(TranscriptStatus::Ready) {
            tx.execute(
                "INSERT INTO transcripts (episode_id, status)
                 VALUES (?, 'transcribing')
                 ON CONFLICT(episode_id) DO UPDATE SET
                    status = 'transcribing',
                    error_message = NULL,
                    updated_at = datetime('now')",
                params![episode_id],
            )?;
        }

        tx.execute(
            "INSERT INTO summaries (episode_id, level, status, language)
             VALUES (?, ?, 'queued', ?)
             ON CONFLICT(episode_id, level) DO UPDATE SET
                status = 'queued',
                content = NULL,
                error_message = NULL,
                language = excluded.language,
                language_corrected = 0,
                updated_at = datetime('now')",
            params![episode_id, level.as_str(), language],
        )?;

        tx.commit()?;
        Ok(ClaimOutcome::Claimed { transcript_active })
    }

    // =========================================================================
    // Transcripts
    // =========================================================================

    pub fn get_transcript_record(&self, episode_id: i64) -> Result<Option<TranscriptRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, episode_id, status, full_text, segments_json, language, provider,
                        duration_secs, speaker_count, error_message, created_at, updated_at
                 FROM transcripts WHERE episode_id = ?",
                params![episode_id],
                map_transcript_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Create or reset the transcript row directly in `transcribing`.
    pub fn begin_transcription(&self, episode_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transcripts (episode_id, status)
             VALUES (?, 'transcribing')
             ON CONFLICT(episode_id) DO UPDATE SET
                status = 'transcribing',
                error_message = NULL,
                updated_at = datetime('now')",
            params![episode_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_transcript(
        &self,
        episode_id: i64,
        full_text: &str,
        segments_json: &str,
        language: &str,
        provider: &str,
        duration_secs: f64,
        speaker_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transcripts SET
                status = 'ready',
                full_text = ?,
                segments_json = ?,
                language = ?,
                provider = ?,
                duration_secs = ?,
                speaker_count = ?,
                error_message = NULL,
                updated_at = datetime('now')
             WHERE episode_id = ?",
            params![
                full_text,
                segments_json,
                language,
                provider,
                duration_secs,
                speaker_count,
                episode_id
            ],
        )?;
        Ok(())
    }

    pub fn fail_transcript(&self, episode_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transcripts SET status = 'failed', error_message = ?, updated_at = datetime('now')
             WHERE episode_id = ?",
            params![error, episode_id],
        )?;
        Ok(())
    }

    /// Drop a stale transcript so it can be recreated — the supersede step
    /// of language self-healing.
    pub fn delete_transcript(&self, episode_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM transcripts WHERE episode_id = ?",
            params![episode_id],
        )?;
        if deleted > 0 {
            log::info!("Superseded transcript for episode {}", episode_id);
        }
        Ok(())
    }

    // =========================================================================
    // Summaries
    // =========================================================================

    pub fn get_summary_record(
        &self,
        episode_id: i64,
        level: SummaryLevel,
    ) -> Result<Option<SummaryRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, episode_id, level, status, content, language, model,
                        language_corrected, error_message, created_at, updated_at
                 FROM summaries WHERE episode_id = ? AND level = ?",
                params![episode_id, level.as_str()],
                map_summary_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_summaries(&self, episode_id: i64) -> Result<Vec<SummaryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, level, status, content, language, model,
                    language_corrected, error_message, created_at, updated_at
             FROM summaries WHERE episode_id = ? ORDER BY level",
        )?;
        let records = stmt
            .query_map(params![episode_id], map_summary_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn mark_summarizing(&self, episode_id: i64, level: SummaryLevel) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE summaries SET status = 'summarizing', updated_at = datetime('now')
             WHERE episode_id = ? AND level = ?",
            params![episode_id, level.as_str()],
        )?;
        Ok(())
    }

    pub fn complete_summary(
        &self,
        episode_id: i64,
        level: SummaryLevel,
        content: &str,
        model: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE summaries SET
                status = 'ready',
                content = ?,
                model = ?,
                error_message = NULL,
                updated_at = datetime('now')
             WHERE episode_id = ? AND level = ?",
            params![content, model, episode_id, level.as_str()],
        )?;
        Ok(())
    }

    pub fn fail_summary(&self, episode_id: i64, level: SummaryLevel, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE summaries SET status = 'failed', error_message = ?, updated_at = datetime('now')
             WHERE episode_id = ? AND level = ?",
            params![error, episode_id, level.as_str()],
        )?;
        Ok(())
    }

    /// Record the summary's language after a correction pass and flag that
    /// the one allowed correction has been spent.
    pub fn mark_language_corrected(
        &self,
        episode_id: i64,
        level: SummaryLevel,
        language: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE summaries SET language = ?, language_corrected = 1, updated_at = datetime('now')
             WHERE episode_id = ? AND level = ?",
            params![language, episode_id, level.as_str()],
        )?;
        Ok(())
    }
}

fn map_transcript_row(row: &Row<'_>) -> rusqlite::Result<TranscriptRecord> {
    Ok(TranscriptRecord {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        status: TranscriptStatus::from(row.get::<_, String>(2)?),
        full_text: row.get(3)?,
        segments_json: row.get(4)?,
        language: row.get(5)?,
        provider: row.get(6)?,
        duration_secs: row.get(7)?,
        speaker_count: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn map_summary_row(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
    let level: String = row.get(2)?;
    Ok(SummaryRecord {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        level: level.parse().unwrap_or(SummaryLevel::Quick),
        status: SummaryStatus::from(row.get::<_, String>(3)?),
        content: row.get(4)?,
        language: row.get(5)?,
        model: row.get(6)?,
        language_corrected: row.get::<_, i64>(7)? != 0,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
