/*
 * Council Analyzer CLI - Meeting Ledger
 * Copyright (c) 2025 Council Analyzer Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;
use crate::types::{
    AgendaItem, DivergentSegment, EventStatus, Meeting, MeetingStatus, MeetingType,
    ProcessingEvent, Stage, Tier1Score, Tier2Score, ValidationRecord, WordStamp,
};

const SCHEMA: &[&str] = &[
    // Meeting discovery and metadata
    "CREATE TABLE IF NOT EXISTS meetings (
        clip_id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        meeting_date DATE,
        meeting_type TEXT NOT NULL,
        video_url TEXT,
        duration_seconds INTEGER,
        discovered_at TIMESTAMP NOT NULL,
        status TEXT NOT NULL DEFAULT 'discovered'
    )",
    // Agenda index points from the clip pages
    "CREATE TABLE IF NOT EXISTS agenda_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        clip_id INTEGER NOT NULL REFERENCES meetings(clip_id),
        item_number TEXT,
        title TEXT NOT NULL,
        start_seconds REAL NOT NULL,
        end_seconds REAL,
        presenter TEXT,
        anchor_id INTEGER
    )",
    // Primary-engine transcription results
    "CREATE TABLE IF NOT EXISTS transcripts (
        clip_id INTEGER PRIMARY KEY REFERENCES meetings(clip_id),
        full_text TEXT NOT NULL,
        word_timestamps TEXT,
        model_used TEXT,
        processing_time_seconds REAL,
        transcribed_at TIMESTAMP NOT NULL
    )",
    // Dual-model validation results
    "CREATE TABLE IF NOT EXISTS transcription_validation (
        clip_id INTEGER PRIMARY KEY REFERENCES meetings(clip_id),
        primary_text TEXT NOT NULL,
        secondary_text TEXT NOT NULL,
        merged_text TEXT NOT NULL,
        wer_score REAL NOT NULL,
        divergent_segments TEXT,
        tier1_scores TEXT,
        tier2_scores TEXT,
        validation_issues TEXT,
        validated_at TIMESTAMP NOT NULL,
        human_review_needed INTEGER NOT NULL DEFAULT 0
    )",
    // LLM analysis results, one row per (meeting, type, segment)
    "CREATE TABLE IF NOT EXISTS analysis (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        clip_id INTEGER NOT NULL REFERENCES meetings(clip_id),
        agenda_item_id INTEGER,
        analysis_type TEXT NOT NULL,
        segment_ordinal INTEGER NOT NULL,
        result TEXT NOT NULL,
        model_used TEXT,
        analyzed_at TIMESTAMP NOT NULL,
        UNIQUE(clip_id, analysis_type, segment_ordinal)
    )",
    // Append-only processing log, used for audit and retry accounting
    "CREATE TABLE IF NOT EXISTS processing_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        clip_id INTEGER NOT NULL,
        stage TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_meetings_status ON meetings(status)",
    "CREATE INDEX IF NOT EXISTS idx_meetings_date ON meetings(meeting_date)",
    "CREATE INDEX IF NOT EXISTS idx_agenda_clip ON agenda_items(clip_id)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_clip ON analysis(clip_id)",
    "CREATE INDEX IF NOT EXISTS idx_processing_log_clip ON processing_log(clip_id)",
];

/// Summary statistics for the status command and dashboards.
#[derive(Debug, Clone)]
pub struct LedgerStats {
    pub total_meetings: i64,
    pub by_status: BTreeMap<String, i64>,
    pub recent_failures: Vec<ProcessingEvent>,
}

/// The single durable store shared by every stage worker. All writes are
/// transactional; concurrent access to different clip IDs is safe.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (and create if missing) the ledger at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Fatal(format!("cannot open ledger at {}: {}", path.display(), e)))?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Open an in-memory ledger. One connection so every query sees the
    /// same database; used by tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory SQLite options")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("cannot open in-memory ledger")?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize ledger schema")?;
        }
        Ok(())
    }

    /// Insert a new meeting. Returns `false` when the clip ID already
    /// exists (first-writer-wins).
    pub async fn insert_meeting(
        &self,
        clip_id: i64,
        title: &str,
        meeting_date: Option<NaiveDate>,
        meeting_type: MeetingType,
        video_url: Option<&str>,
        duration_seconds: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO meetings
             (clip_id, title, meeting_date, meeting_type, video_url, duration_seconds, discovered_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(clip_id)
        .bind(title)
        .bind(meeting_date)
        .bind(meeting_type.as_str())
        .bind(video_url)
        .bind(duration_seconds)
        .bind(Utc::now())
        .bind(MeetingStatus::Discovered.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to insert meeting")?;

        Ok(result.rows_affected() == 1)
    }

    /// Unconditional status write. Errors if the meeting does not exist.
    pub async fn update_status(&self, clip_id: i64, status: MeetingStatus) -> Result<()> {
        let result = sqlx::query("UPDATE meetings SET status = ? WHERE clip_id = ?")
            .bind(status.as_str())
            .bind(clip_id)
            .execute(&self.pool)
            .await
            .context("Failed to update meeting status")?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::InvariantViolation(format!(
                "status update for unknown meeting {}",
                clip_id
            ))
            .into());
        }
        Ok(())
    }

    /// Compare-and-swap status transition. Returns `true` only when the
    /// meeting held `from` and now holds `to`. Stage workers use this for
    /// their `input -> -ing` flip so a stale worker cannot clobber state.
    pub async fn try_advance(
        &self,
        clip_id: i64,
        from: MeetingStatus,
        to: MeetingStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE meetings SET status = ? WHERE clip_id = ? AND status = ?")
            .bind(to.as_str())
            .bind(clip_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to advance meeting status")?;

        Ok(result.rows_affected() == 1)
    }

    /// Fill in the stream URL for an already-known meeting.
    pub async fn update_video_url(&self, clip_id: i64, video_url: &str) -> Result<()> {
        sqlx::query("UPDATE meetings SET video_url = ? WHERE clip_id = ?")
            .bind(video_url)
            .bind(clip_id)
            .execute(&self.pool)
            .await
            .context("Failed to update video URL")?;
        Ok(())
    }

    pub async fn get_meeting(&self, clip_id: i64) -> Result<Option<Meeting>> {
        let row = sqlx::query("SELECT * FROM meetings WHERE clip_id = ?")
            .bind(clip_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch meeting")?;

        row.map(meeting_from_row).transpose()
    }

    /// All meetings with the given status, newest first.
    pub async fn get_meetings_by_status(&self, status: MeetingStatus) -> Result<Vec<Meeting>> {
        let rows = sqlx::query("SELECT * FROM meetings WHERE status = ? ORDER BY meeting_date DESC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list meetings by status")?;

        rows.into_iter().map(meeting_from_row).collect()
    }

    /// The oldest meeting eligible for a stage, or `None`. Only stages with
    /// a status gate participate in `next_pending` scheduling.
    pub async fn next_pending(&self, stage: Stage) -> Result<Option<Meeting>> {
        let Some(status) = stage.input_status() else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT * FROM meetings WHERE status = ? ORDER BY meeting_date ASC LIMIT 1",
        )
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch next pending meeting")?;

        row.map(meeting_from_row).transpose()
    }

    pub async fn get_all_meetings(&self) -> Result<Vec<Meeting>> {
        let rows = sqlx::query("SELECT * FROM meetings ORDER BY meeting_date DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list meetings")?;

        rows.into_iter().map(meeting_from_row).collect()
    }

    /// Replace all agenda items for a meeting atomically.
    pub async fn insert_agenda_items(&self, clip_id: i64, items: &[NewAgendaItem]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM agenda_items WHERE clip_id = ?")
            .bind(clip_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear agenda items")?;

        for item in items {
            sqlx::query(
                "INSERT INTO agenda_items
                 (clip_id, item_number, title, start_seconds, end_seconds, presenter, anchor_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(clip_id)
            .bind(&item.item_number)
            .bind(&item.title)
            .bind(item.start_seconds)
            .bind(item.end_seconds)
            .bind(&item.presenter)
            .bind(item.anchor_id)
            .execute(&mut *tx)
            .await
            .context("Failed to insert agenda item")?;
        }

        tx.commit().await.context("Failed to commit agenda items")?;
        Ok(())
    }

    /// Agenda items for a meeting, sorted by start offset.
    pub async fn get_agenda_items(&self, clip_id: i64) -> Result<Vec<AgendaItem>> {
        let rows = sqlx::query(
            "SELECT * FROM agenda_items WHERE clip_id = ? ORDER BY start_seconds ASC",
        )
        .bind(clip_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch agenda items")?;

        rows.into_iter()
            .map(|row| {
                Ok(AgendaItem {
                    id: row.try_get("id")?,
                    clip_id: row.try_get("clip_id")?,
                    item_number: row.try_get("item_number")?,
                    title: row.try_get("title")?,
                    start_seconds: row.try_get("start_seconds")?,
                    end_seconds: row.try_get("end_seconds")?,
                    presenter: row.try_get("presenter")?,
                    anchor_id: row.try_get("anchor_id")?,
                })
            })
            .collect()
    }

    /// Upsert the primary transcript for a meeting.
    pub async fn insert_transcript(
        &self,
        clip_id: i64,
        full_text: &str,
        word_timestamps: &[WordStamp],
        model_used: &str,
        processing_time_seconds: f64,
    ) -> Result<()> {
        let words_json =
            serde_json::to_string(word_timestamps).context("Failed to serialize word timestamps")?;

        sqlx::query(
            "INSERT OR REPLACE INTO transcripts
             (clip_id, full_text, word_timestamps, model_used, processing_time_seconds, transcribed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(clip_id)
        .bind(full_text)
        .bind(words_json)
        .bind(model_used)
        .bind(processing_time_seconds)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert transcript")?;

        Ok(())
    }

    pub async fn get_transcript(&self, clip_id: i64) -> Result<Option<TranscriptRow>> {
        let row = sqlx::query("SELECT * FROM transcripts WHERE clip_id = ?")
            .bind(clip_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transcript")?;

        row.map(|row| {
            let words_json: Option<String> = row.try_get("word_timestamps")?;
            let word_timestamps = match words_json {
                Some(json) => serde_json::from_str(&json)
                    .context("Corrupt word timestamps in ledger")?,
                None => Vec::new(),
            };

            Ok(TranscriptRow {
                clip_id: row.try_get("clip_id")?,
                full_text: row.try_get("full_text")?,
                word_timestamps,
                model_used: row.try_get("model_used")?,
                processing_time_seconds: row.try_get("processing_time_seconds")?,
                transcribed_at: row.try_get("transcribed_at")?,
            })
        })
        .transpose()
    }

    /// Upsert the validation record for a meeting.
    pub async fn insert_validation(&self, record: &ValidationRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO transcription_validation
             (clip_id, primary_text, secondary_text, merged_text, wer_score,
              divergent_segments, tier1_scores, tier2_scores, validation_issues,
              validated_at, human_review_needed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.clip_id)
        .bind(&record.primary_text)
        .bind(&record.secondary_text)
        .bind(&record.merged_text)
        .bind(record.wer_score)
        .bind(serde_json::to_string(&record.divergent_segments)?)
        .bind(serde_json::to_string(&record.tier1_scores)?)
        .bind(serde_json::to_string(&record.tier2_scores)?)
        .bind(serde_json::to_string(&record.validation_issues)?)
        .bind(Utc::now())
        .bind(record.human_review_needed)
        .execute(&self.pool)
        .await
        .context("Failed to insert validation record")?;

        Ok(())
    }

    pub async fn get_validation(&self, clip_id: i64) -> Result<Option<ValidationRecord>> {
        let row = sqlx::query("SELECT * FROM transcription_validation WHERE clip_id = ?")
            .bind(clip_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch validation record")?;

        row.map(|row| {
            let divergent: Vec<DivergentSegment> =
                json_column(&row, "divergent_segments")?.unwrap_or_default();
            let tier1: BTreeMap<usize, Tier1Score> =
                json_column(&row, "tier1_scores")?.unwrap_or_default();
            let tier2: BTreeMap<usize, Tier2Score> =
                json_column(&row, "tier2_scores")?.unwrap_or_default();
            let issues: Vec<String> = json_column(&row, "validation_issues")?.unwrap_or_default();

            Ok(ValidationRecord {
                clip_id: row.try_get("clip_id")?,
                primary_text: row.try_get("primary_text")?,
                secondary_text: row.try_get("secondary_text")?,
                merged_text: row.try_get("merged_text")?,
                wer_score: row.try_get("wer_score")?,
                divergent_segments: divergent,
                tier1_scores: tier1,
                tier2_scores: tier2,
                validation_issues: issues,
                human_review_needed: row.try_get("human_review_needed")?,
            })
        })
        .transpose()
    }

    /// Upsert one analysis result, keyed by (meeting, type, segment).
    pub async fn insert_analysis(
        &self,
        clip_id: i64,
        analysis_type: &str,
        segment_ordinal: i64,
        agenda_item_id: Option<i64>,
        result: &serde_json::Value,
        model_used: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO analysis
             (clip_id, agenda_item_id, analysis_type, segment_ordinal, result, model_used, analyzed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(clip_id)
        .bind(agenda_item_id)
        .bind(analysis_type)
        .bind(segment_ordinal)
        .bind(serde_json::to_string(result)?)
        .bind(model_used)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert analysis result")?;

        Ok(())
    }

    pub async fn count_analyses(&self, clip_id: i64, analysis_type: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM analysis WHERE clip_id = ? AND analysis_type = ?",
        )
        .bind(clip_id)
        .bind(analysis_type)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count analyses")?;

        Ok(row.try_get("n")?)
    }

    /// Append one processing event.
    pub async fn log_event(
        &self,
        clip_id: i64,
        stage: Stage,
        status: EventStatus,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO processing_log (clip_id, stage, status, message, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(clip_id)
        .bind(stage.as_str())
        .bind(status.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to log processing event")?;

        Ok(())
    }

    /// Count of `failed` events for a (meeting, stage) pair. Derived, never
    /// stored; the continuous supervisor gates re-enqueueing on this.
    pub async fn retry_count(&self, clip_id: i64, stage: Stage) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM processing_log
             WHERE clip_id = ? AND stage = ? AND status = 'failed'",
        )
        .bind(clip_id)
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count retries")?;

        Ok(row.try_get("n")?)
    }

    /// Counts by status plus the last failed events.
    pub async fn stats(&self) -> Result<LedgerStats> {
        let mut by_status = BTreeMap::new();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM meetings GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to count meetings by status")?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            by_status.insert(status, count);
        }

        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM meetings")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count meetings")?
            .try_get("n")?;

        let failure_rows = sqlx::query(
            "SELECT * FROM processing_log WHERE status = 'failed'
             ORDER BY created_at DESC, id DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent failures")?;

        let recent_failures = failure_rows
            .into_iter()
            .map(|row| {
                Ok(ProcessingEvent {
                    id: row.try_get("id")?,
                    clip_id: row.try_get("clip_id")?,
                    stage: row.try_get("stage")?,
                    status: row.try_get("status")?,
                    message: row.try_get("message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LedgerStats {
            total_meetings: total,
            by_status,
            recent_failures,
        })
    }
}

/// Agenda item payload for insertion (IDs are assigned by the ledger).
#[derive(Debug, Clone)]
pub struct NewAgendaItem {
    pub item_number: Option<String>,
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: Option<f64>,
    pub presenter: Option<String>,
    pub anchor_id: Option<i64>,
}

/// The transcript row as stored in the ledger (primary engine only).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscriptRow {
    pub clip_id: i64,
    pub full_text: String,
    pub word_timestamps: Vec<WordStamp>,
    pub model_used: Option<String>,
    pub processing_time_seconds: Option<f64>,
    pub transcribed_at: DateTime<Utc>,
}

fn meeting_from_row(row: SqliteRow) -> Result<Meeting> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<MeetingStatus>()
        .map_err(PipelineError::InvariantViolation)?;

    let type_raw: String = row.try_get("meeting_type")?;
    let meeting_type = type_raw
        .parse::<MeetingType>()
        .map_err(PipelineError::InvariantViolation)?;

    Ok(Meeting {
        clip_id: row.try_get("clip_id")?,
        title: row.try_get("title")?,
        meeting_date: row.try_get("meeting_date")?,
        meeting_type,
        video_url: row.try_get("video_url")?,
        duration_seconds: row.try_get("duration_seconds")?,
        status,
        discovered_at: row.try_get("discovered_at")?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(json) => Ok(Some(
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt JSON in ledger column {}", column))?,
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisType;

    async fn seeded_ledger() -> Ledger {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .insert_meeting(
                100,
                "6/1/21 City Council",
                NaiveDate::from_ymd_opt(2021, 6, 1),
                MeetingType::CityCouncil,
                Some("https://example.test/stream/100.m3u8"),
                Some(5400),
            )
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn insert_meeting_is_first_writer_wins() {
        let ledger = seeded_ledger().await;
        let inserted = ledger
            .insert_meeting(100, "duplicate", None, MeetingType::SpecialMeeting, None, None)
            .await
            .unwrap();
        assert!(!inserted);

        let meeting = ledger.get_meeting(100).await.unwrap().unwrap();
        assert_eq!(meeting.title, "6/1/21 City Council");
        assert_eq!(meeting.status, MeetingStatus::Discovered);
    }

    #[tokio::test]
    async fn update_status_on_unknown_meeting_errors() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let err = ledger.update_status(999, MeetingStatus::Downloaded).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn try_advance_is_a_compare_and_swap() {
        let ledger = seeded_ledger().await;

        let advanced = ledger
            .try_advance(100, MeetingStatus::Discovered, MeetingStatus::Downloading)
            .await
            .unwrap();
        assert!(advanced);

        // Second attempt observes the new status and must fail.
        let advanced_again = ledger
            .try_advance(100, MeetingStatus::Discovered, MeetingStatus::Downloading)
            .await
            .unwrap();
        assert!(!advanced_again);

        let meeting = ledger.get_meeting(100).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Downloading);
    }

    #[tokio::test]
    async fn next_pending_returns_oldest_by_date() {
        let ledger = seeded_ledger().await;
        ledger
            .insert_meeting(
                101,
                "1/5/21 City Council",
                NaiveDate::from_ymd_opt(2021, 1, 5),
                MeetingType::CityCouncil,
                Some("https://example.test/stream/101.m3u8"),
                None,
            )
            .await
            .unwrap();

        let next = ledger.next_pending(Stage::Download).await.unwrap().unwrap();
        assert_eq!(next.clip_id, 101);

        // Diarize has no status gate and never schedules via next_pending.
        assert!(ledger.next_pending(Stage::Diarize).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn agenda_items_are_replaced_atomically_and_sorted() {
        let ledger = seeded_ledger().await;

        let first = vec![NewAgendaItem {
            item_number: Some("1".to_string()),
            title: "Call to Order".to_string(),
            start_seconds: 0.0,
            end_seconds: Some(120.0),
            presenter: None,
            anchor_id: Some(11),
        }];
        ledger.insert_agenda_items(100, &first).await.unwrap();

        let replacement = vec![
            NewAgendaItem {
                item_number: Some("2".to_string()),
                title: "Consent Agenda".to_string(),
                start_seconds: 120.0,
                end_seconds: Some(600.0),
                presenter: Some("City Clerk".to_string()),
                anchor_id: Some(12),
            },
            NewAgendaItem {
                item_number: Some("1".to_string()),
                title: "Call to Order".to_string(),
                start_seconds: 0.0,
                end_seconds: Some(120.0),
                presenter: None,
                anchor_id: Some(11),
            },
        ];
        ledger.insert_agenda_items(100, &replacement).await.unwrap();

        let items = ledger.get_agenda_items(100).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Call to Order");
        assert_eq!(items[1].presenter.as_deref(), Some("City Clerk"));
        assert!(items[0].start_seconds < items[1].start_seconds);
    }

    #[tokio::test]
    async fn transcript_round_trips_with_word_timestamps() {
        let ledger = seeded_ledger().await;
        let words = vec![
            WordStamp { word: "good".to_string(), start: 0.0, end: 0.4 },
            WordStamp { word: "evening".to_string(), start: 0.4, end: 1.0 },
        ];

        ledger
            .insert_transcript(100, "good evening", &words, "dual:large-v3+medium", 42.5)
            .await
            .unwrap();

        let row = ledger.get_transcript(100).await.unwrap().unwrap();
        assert_eq!(row.full_text, "good evening");
        assert_eq!(row.word_timestamps.len(), 2);
        assert_eq!(row.word_timestamps[1].word, "evening");

        // Upsert on the natural key
        ledger
            .insert_transcript(100, "good evening everyone", &words, "large-v3", 40.0)
            .await
            .unwrap();
        let row = ledger.get_transcript(100).await.unwrap().unwrap();
        assert_eq!(row.full_text, "good evening everyone");
    }

    #[tokio::test]
    async fn validation_record_round_trips() {
        let ledger = seeded_ledger().await;
        let mut tier1 = BTreeMap::new();
        tier1.insert(
            0usize,
            Tier1Score { score: 85, issues: vec![], needs_deep_review: false },
        );

        let record = ValidationRecord {
            clip_id: 100,
            primary_text: "aye the motion passes".to_string(),
            secondary_text: "aye the motion passes".to_string(),
            merged_text: "aye the motion passes".to_string(),
            wer_score: 0.0,
            divergent_segments: vec![],
            tier1_scores: tier1,
            tier2_scores: BTreeMap::new(),
            validation_issues: vec![],
            human_review_needed: false,
        };
        ledger.insert_validation(&record).await.unwrap();

        let loaded = ledger.get_validation(100).await.unwrap().unwrap();
        assert_eq!(loaded.wer_score, 0.0);
        assert!(!loaded.human_review_needed);
        assert_eq!(loaded.tier1_scores.get(&0).unwrap().score, 85);
    }

    #[tokio::test]
    async fn analysis_upserts_on_natural_key() {
        let ledger = seeded_ledger().await;
        let result = serde_json::json!({"summary": ["first pass"]});
        ledger
            .insert_analysis(100, AnalysisType::Summary.as_str(), 0, None, &result, "qwen2.5vl:72b")
            .await
            .unwrap();

        let replacement = serde_json::json!({"summary": ["second pass"]});
        ledger
            .insert_analysis(100, AnalysisType::Summary.as_str(), 0, None, &replacement, "qwen2.5vl:72b")
            .await
            .unwrap();

        assert_eq!(
            ledger.count_analyses(100, AnalysisType::Summary.as_str()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn retry_count_derives_from_failed_events() {
        let ledger = seeded_ledger().await;
        ledger
            .log_event(100, Stage::Diarize, EventStatus::Started, "starting")
            .await
            .unwrap();
        ledger
            .log_event(100, Stage::Diarize, EventStatus::Failed, "diarizer timeout")
            .await
            .unwrap();
        ledger
            .log_event(100, Stage::Diarize, EventStatus::Failed, "diarizer timeout")
            .await
            .unwrap();
        ledger
            .log_event(100, Stage::Download, EventStatus::Failed, "no stream URL")
            .await
            .unwrap();

        assert_eq!(ledger.retry_count(100, Stage::Diarize).await.unwrap(), 2);
        assert_eq!(ledger.retry_count(100, Stage::Download).await.unwrap(), 1);
        assert_eq!(ledger.retry_count(100, Stage::Analyze).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stats_counts_by_status_and_surfaces_failures() {
        let ledger = seeded_ledger().await;
        ledger
            .insert_meeting(101, "1/5/21 Planning Commission", NaiveDate::from_ymd_opt(2021, 1, 5), MeetingType::PlanningCommission, None, None)
            .await
            .unwrap();
        ledger.update_status(101, MeetingStatus::Failed).await.unwrap();
        ledger
            .log_event(101, Stage::Download, EventStatus::Failed, "no stream URL")
            .await
            .unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total_meetings, 2);
        assert_eq!(stats.by_status.get("discovered"), Some(&1));
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.recent_failures.len(), 1);
        assert!(!stats.recent_failures[0].message.is_empty());
    }
}
