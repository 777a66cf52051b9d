//! Delivery log: durable record of per-recipient outcomes and job summaries.
//!
//! Writes are best effort from the engine's point of view: a failing log never
//! fails a dispatch.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::types::{ChannelFamily, DeliveryOutcome};

use crate::job::DispatchReport;

/// One finished job as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub session_id: String,
    pub owner_user_id: String,
    pub family: String,
    pub state: String,
    pub total_messages: u32,
    pub sent_messages: u32,
    pub failed_messages: u32,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

pub trait DeliveryLog: Send + Sync {
    fn record_outcome(&self, session_id: &str, outcome: &DeliveryOutcome) -> Result<()>;
    fn record_job(&self, owner_user_id: &str, family: ChannelFamily, report: &DispatchReport) -> Result<()>;
    fn outcomes(&self, session_id: &str) -> Result<Vec<DeliveryOutcome>>;
    fn job(&self, session_id: &str) -> Result<Option<JobSummary>>;
    fn recent_jobs(&self, owner_user_id: &str, limit: usize) -> Result<Vec<JobSummary>>;
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> ZapflowError + '_ {
    move |e| ZapflowError::Database(format!("{context}: {e}"))
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite delivery log.
pub struct SqliteDeliveryLog {
    conn: Mutex<Connection>,
}

impl SqliteDeliveryLog {
    /// Open or create the database, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let log = Self { conn: Mutex::new(conn) };
        log.migrate()?;
        Ok(log)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ZapflowError::Database(format!("lock: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS dispatch_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                address TEXT NOT NULL,
                channel_id TEXT,
                success INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_session ON dispatch_outcomes(session_id);

            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                session_id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                family TEXT NOT NULL,
                state TEXT NOT NULL,
                total_messages INTEGER NOT NULL,
                sent_messages INTEGER NOT NULL,
                failed_messages INTEGER NOT NULL,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON dispatch_jobs(owner_user_id);
            ",
        )
        .map_err(db_err("migration"))
    }

    fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobSummary> {
        Ok(JobSummary {
            session_id: row.get(0)?,
            owner_user_id: row.get(1)?,
            family: row.get(2)?,
            state: row.get(3)?,
            total_messages: row.get(4)?,
            sent_messages: row.get(5)?,
            failed_messages: row.get(6)?,
            error: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }
}

const JOB_COLUMNS: &str = "session_id, owner_user_id, family, state, total_messages, \
     sent_messages, failed_messages, error, started_at, finished_at";

impl DeliveryLog for SqliteDeliveryLog {
    fn record_outcome(&self, session_id: &str, outcome: &DeliveryOutcome) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dispatch_outcomes (session_id, address, channel_id, success, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                outcome.address,
                outcome.channel_used,
                outcome.success,
                outcome.error_message,
                outcome.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err("insert outcome"))?;
        Ok(())
    }

    fn record_job(&self, owner_user_id: &str, family: ChannelFamily, report: &DispatchReport) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO dispatch_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                report.session_id,
                owner_user_id,
                family.as_str(),
                report.state.as_str(),
                report.total_messages,
                report.sent_messages,
                report.failed_messages,
                report.error.map(|e| e.as_str()),
                report.started_at.to_rfc3339(),
                report.finished_at.to_rfc3339(),
            ],
        )
        .map_err(db_err("insert job"))?;
        Ok(())
    }

    fn outcomes(&self, session_id: &str) -> Result<Vec<DeliveryOutcome>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT address, channel_id, success, error_message, created_at
                 FROM dispatch_outcomes WHERE session_id = ?1 ORDER BY id",
            )
            .map_err(db_err("prepare"))?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let created: String = row.get(4)?;
                Ok(DeliveryOutcome {
                    address: row.get(0)?,
                    channel_used: row.get(1)?,
                    success: row.get(2)?,
                    error_message: row.get(3)?,
                    timestamp: parse_ts(&created),
                })
            })
            .map_err(db_err("query outcomes"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("read outcomes"))
    }

    fn job(&self, session_id: &str) -> Result<Option<JobSummary>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE session_id = ?1"),
            params![session_id],
            Self::summary_from_row,
        )
        .optional()
        .map_err(db_err("query job"))
    }

    fn recent_jobs(&self, owner_user_id: &str, limit: usize) -> Result<Vec<JobSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE owner_user_id = ?1
                 ORDER BY finished_at DESC LIMIT ?2"
            ))
            .map_err(db_err("prepare"))?;
        let rows = stmt
            .query_map(params![owner_user_id, limit as i64], Self::summary_from_row)
            .map_err(db_err("query jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err("read jobs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DispatchErrorKind, JobState};

    fn report(session_id: &str, state: JobState) -> DispatchReport {
        DispatchReport {
            session_id: session_id.into(),
            state,
            total_messages: 3,
            sent_messages: 2,
            failed_messages: 1,
            error: None,
            warnings: vec![],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn outcomes_keep_insertion_order() {
        let log = SqliteDeliveryLog::open_in_memory().unwrap();
        log.record_outcome("s1", &DeliveryOutcome::sent("5511911112222", "w1")).unwrap();
        log.record_outcome("s1", &DeliveryOutcome::failed("abc", None, "invalid recipient"))
            .unwrap();
        log.record_outcome("s2", &DeliveryOutcome::sent("5511933334444", "w2")).unwrap();

        let outcomes = log.outcomes("s1").unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].channel_used.as_deref(), Some("w1"));
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].error_message.as_deref(), Some("invalid recipient"));
        assert!(log.outcomes("nope").unwrap().is_empty());
    }

    #[test]
    fn job_summary_roundtrip_and_replace() {
        let log = SqliteDeliveryLog::open_in_memory().unwrap();
        assert!(log.job("s1").unwrap().is_none());

        log.record_job("u1", ChannelFamily::Waha, &report("s1", JobState::PartiallyFailed))
            .unwrap();
        let mut failed = report("s1", JobState::Failed);
        failed.error = Some(DispatchErrorKind::NoChannelAvailable);
        log.record_job("u1", ChannelFamily::Waha, &failed).unwrap();

        let job = log.job("s1").unwrap().unwrap();
        assert_eq!(job.state, "failed");
        assert_eq!(job.family, "waha");
        assert_eq!(job.error.as_deref(), Some("no_channel_available"));
        assert_eq!((job.total_messages, job.sent_messages, job.failed_messages), (3, 2, 1));
    }

    #[test]
    fn recent_jobs_by_owner() {
        let log = SqliteDeliveryLog::open_in_memory().unwrap();
        log.record_job("u1", ChannelFamily::Telegram, &report("a", JobState::Completed))
            .unwrap();
        log.record_job("u1", ChannelFamily::Telegram, &report("b", JobState::Completed))
            .unwrap();
        log.record_job("u2", ChannelFamily::Evolution, &report("c", JobState::Completed))
            .unwrap();
        assert_eq!(log.recent_jobs("u1", 10).unwrap().len(), 2);
        assert_eq!(log.recent_jobs("u1", 1).unwrap().len(), 1);
        assert!(log.recent_jobs("u3", 10).unwrap().is_empty());
    }
}
