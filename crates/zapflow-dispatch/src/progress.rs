//! Progress Tracker: per-session counters polled by the dashboard.
//!
//! The engine only talks to the [`ProgressStore`] trait. [`InMemoryProgressStore`]
//! serves single-process deployments; a horizontally scaled deployment plugs in
//! a shared key-value backed implementation of the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use zapflow_core::error::{Result, ZapflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Sending,
    Success,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Sending)
    }
}

/// Who is being messaged right now. Cleared once the recipient is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRecipient {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub session_id: String,
    pub total_messages: u32,
    pub sent_messages: u32,
    pub failed_messages: u32,
    pub progress_percent: u8,
    pub status: ProgressStatus,
    pub current_recipient: Option<CurrentRecipient>,
    pub start_time: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Human-readable bucket, filled in on read.
    #[serde(default)]
    pub estimated_time_remaining: String,
    #[serde(default)]
    pub estimated_remaining_ms: Option<u64>,
}

impl ProgressRecord {
    pub fn new(session_id: &str, total_messages: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            total_messages,
            sent_messages: 0,
            failed_messages: 0,
            progress_percent: 0,
            status: ProgressStatus::Sending,
            current_recipient: None,
            start_time: Utc::now(),
            finished_at: None,
            error_message: None,
            estimated_time_remaining: String::new(),
            estimated_remaining_ms: None,
        }
    }

    pub fn processed(&self) -> u32 {
        self.sent_messages + self.failed_messages
    }

    fn recompute_percent(&mut self) {
        self.progress_percent = percent(self.processed(), self.total_messages);
    }

    fn count(&mut self, sent: bool) -> Result<()> {
        if self.processed() >= self.total_messages {
            return Err(ZapflowError::Progress(format!(
                "session {} already accounted for all {} messages",
                self.session_id, self.total_messages
            )));
        }
        if sent {
            self.sent_messages += 1;
        } else {
            self.failed_messages += 1;
        }
        self.current_recipient = None;
        self.recompute_percent();
        Ok(())
    }

    fn terminate(&mut self, status: ProgressStatus, reason: Option<String>) {
        self.status = status;
        self.current_recipient = None;
        self.finished_at = Some(Utc::now());
        if reason.is_some() {
            self.error_message = reason;
        }
    }

    /// Fill the derived ETA fields as of `now`.
    pub fn with_estimate(mut self, now: DateTime<Utc>) -> Self {
        let done = self.processed() >= self.total_messages;
        self.estimated_remaining_ms = if done {
            Some(0)
        } else {
            estimate_remaining_ms(self.processed(), self.total_messages, self.start_time, now)
        };
        self.estimated_time_remaining = format_remaining(self.estimated_remaining_ms, done);
        self
    }
}

/// `round(100 * processed / total)`, 0 when there is nothing to send.
pub fn percent(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Average time per processed message, extrapolated to what is left.
pub fn estimate_remaining_ms(processed: u32, total: u32, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    if processed == 0 {
        return None;
    }
    let elapsed = (now - start).num_milliseconds().max(0) as u64;
    let per_message = elapsed / processed as u64;
    Some(per_message * total.saturating_sub(processed) as u64)
}

pub fn format_remaining(remaining_ms: Option<u64>, done: bool) -> String {
    if done {
        return "Concluído".into();
    }
    match remaining_ms {
        None => "Calculando...".into(),
        Some(ms) if ms < 60_000 => "Menos de 1 minuto".into(),
        Some(ms) => {
            let minutes = ms.div_ceil(60_000);
            if minutes == 1 {
                "1 minuto".into()
            } else {
                format!("{minutes} minutos")
            }
        }
    }
}

/// Keyed progress storage. Writes for one session arrive in order from one
/// job; each counter update must be atomic per key.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn start(&self, session_id: &str, total_messages: u32) -> Result<()>;
    async fn update_current(&self, session_id: &str, current: Option<CurrentRecipient>) -> Result<()>;
    async fn mark_sent(&self, session_id: &str) -> Result<()>;
    async fn mark_failed(&self, session_id: &str) -> Result<()>;
    async fn finish(&self, session_id: &str) -> Result<()>;
    async fn mark_error(&self, session_id: &str, reason: Option<String>) -> Result<()>;
    /// Remove the record. Absent sessions are fine.
    async fn clear(&self, session_id: &str) -> Result<()>;
    /// `None` for unknown or not-yet-started sessions.
    async fn read(&self, session_id: &str) -> Result<Option<ProgressRecord>>;
    /// Drop terminal records finished more than `ttl` ago; returns how many.
    async fn evict_expired(&self, ttl: Duration) -> Result<usize>;
}

/// Process-local progress store.
#[derive(Default)]
pub struct InMemoryProgressStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_record<F>(&self, session_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ProgressRecord) -> Result<()>,
    {
        let mut records = self.records.write().await;
        match records.get_mut(session_id) {
            Some(record) => f(record),
            None => {
                tracing::debug!("Progress update for unknown session {}", session_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn start(&self, session_id: &str, total_messages: u32) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(session_id.to_string(), ProgressRecord::new(session_id, total_messages));
        tracing::debug!("📊 Progress started: {} ({} messages)", session_id, total_messages);
        Ok(())
    }

    async fn update_current(&self, session_id: &str, current: Option<CurrentRecipient>) -> Result<()> {
        self.with_record(session_id, |r| {
            r.current_recipient = current;
            Ok(())
        })
        .await
    }

    async fn mark_sent(&self, session_id: &str) -> Result<()> {
        self.with_record(session_id, |r| r.count(true)).await
    }

    async fn mark_failed(&self, session_id: &str) -> Result<()> {
        self.with_record(session_id, |r| r.count(false)).await
    }

    async fn finish(&self, session_id: &str) -> Result<()> {
        self.with_record(session_id, |r| {
            r.terminate(ProgressStatus::Success, None);
            Ok(())
        })
        .await
    }

    async fn mark_error(&self, session_id: &str, reason: Option<String>) -> Result<()> {
        self.with_record(session_id, |r| {
            r.terminate(ProgressStatus::Error, reason);
            Ok(())
        })
        .await
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.records.write().await.remove(session_id);
        Ok(())
    }

    async fn read(&self, session_id: &str) -> Result<Option<ProgressRecord>> {
        let records = self.records.read().await;
        Ok(records.get(session_id).cloned().map(|r| r.with_estimate(Utc::now())))
    }

    async fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.finished_at.is_some_and(|f| f < cutoff)));
        Ok(before - records.len())
    }
}

/// Spawn the background sweeper evicting stale terminal records.
/// A zero TTL disables eviction and nothing is spawned.
pub fn spawn_progress_sweeper(
    store: Arc<dyn ProgressStore>,
    ttl_secs: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if ttl_secs == 0 {
        return None;
    }
    let ttl = Duration::from_secs(ttl_secs);
    let every = Duration::from_secs((ttl_secs / 4).clamp(1, 300));
    Some(tokio::spawn(async move {
        tracing::info!("🧹 Progress sweeper started (ttl {}s)", ttl_secs);
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.evict_expired(ttl).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("🧹 Evicted {} finished progress record(s)", n),
                Err(e) => tracing::warn!("⚠️ Progress sweep failed: {e}"),
            }
        }
    }))
}
