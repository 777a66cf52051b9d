//! Dispatch jobs: what to send, to whom, through which channels, and the
//! report that comes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::types::ChannelFamily;

use crate::balancer::Strategy;
use crate::humanizer::PacingConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    /// Phone number, WhatsApp JID, Telegram chat id or `@username`.
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Pre-resolved text that replaces the job's variant for this recipient.
    #[serde(default)]
    pub message: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            message: None,
        }
    }

    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
            message: None,
        }
    }
}

/// How the engine picks a channel for each recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChannelPolicy {
    /// Always the same channel (it must still be connected).
    #[serde(rename_all = "camelCase")]
    Single { channel_id: String },
    /// Balance across the owner's connected channels of the job's family.
    Balanced {
        #[serde(default)]
        strategy: Strategy,
    },
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        ChannelPolicy::Balanced {
            strategy: Strategy::default(),
        }
    }
}

/// Upper bound for `baseDelayMs` and `jitterMs`.
pub const MAX_PACING_DELAY_MS: u64 = 60 * 60 * 1000;

fn default_variant_count() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    #[serde(default)]
    pub session_id: String,
    pub owner_user_id: String,
    pub family: ChannelFamily,
    pub recipients: Vec<Recipient>,
    /// Message template; may hold `{{name}}` placeholders.
    pub message: String,
    /// How many distinct variants to ask the variator for. 1 disables variation.
    #[serde(default = "default_variant_count")]
    pub variant_count: usize,
    #[serde(default)]
    pub channel_policy: ChannelPolicy,
    #[serde(default)]
    pub pacing: Option<PacingConfig>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        owner_user_id: impl Into<String>,
        family: ChannelFamily,
        message: impl Into<String>,
        recipients: Vec<Recipient>,
    ) -> Self {
        Self {
            session_id: new_session_id(),
            owner_user_id: owner_user_id.into(),
            family,
            recipients,
            message: message.into(),
            variant_count: 1,
            channel_policy: ChannelPolicy::default(),
            pacing: None,
            created_at: Utc::now(),
        }
    }

    pub fn total(&self) -> u32 {
        self.recipients.len().min(u32::MAX as usize) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(ZapflowError::InvalidJob("no recipients".into()));
        }
        if self.owner_user_id.trim().is_empty() {
            return Err(ZapflowError::InvalidJob("missing ownerUserId".into()));
        }
        let has_text = !self.message.trim().is_empty();
        let all_custom = self.recipients.iter().all(|r| r.message.is_some());
        if !has_text && !all_custom {
            return Err(ZapflowError::InvalidJob("empty message".into()));
        }
        if let ChannelPolicy::Single { channel_id } = &self.channel_policy
            && channel_id.trim().is_empty()
        {
            return Err(ZapflowError::InvalidJob("empty channelId".into()));
        }
        if let Some(pacing) = &self.pacing
            && (pacing.base_delay_ms > MAX_PACING_DELAY_MS || pacing.jitter_ms > MAX_PACING_DELAY_MS)
        {
            return Err(ZapflowError::InvalidJob(format!(
                "pacing delays are capped at {MAX_PACING_DELAY_MS} ms"
            )));
        }
        Ok(())
    }
}

pub fn new_session_id() -> String {
    format!("dispatch_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::PartiallyFailed => "partially_failed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    /// Fatal: the job stops.
    NoChannelAvailable,
    InvalidRecipient,
    GatewaySendError,
    /// Non-fatal: the template went out unmodified.
    VariatorUnavailable,
}

impl DispatchErrorKind {
    pub fn classify(err: &ZapflowError) -> Self {
        match err {
            ZapflowError::InvalidRecipient(_) => DispatchErrorKind::InvalidRecipient,
            ZapflowError::NoChannelAvailable => DispatchErrorKind::NoChannelAvailable,
            ZapflowError::Variator(_) => DispatchErrorKind::VariatorUnavailable,
            _ => DispatchErrorKind::GatewaySendError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorKind::NoChannelAvailable => "no_channel_available",
            DispatchErrorKind::InvalidRecipient => "invalid_recipient",
            DispatchErrorKind::GatewaySendError => "gateway_send_error",
            DispatchErrorKind::VariatorUnavailable => "variator_unavailable",
        }
    }
}

/// Final summary of a job. Counts are always present, whatever the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub session_id: String,
    pub state: JobState,
    pub total_messages: u32,
    pub sent_messages: u32,
    pub failed_messages: u32,
    /// Set when the job stopped early.
    pub error: Option<DispatchErrorKind>,
    /// Non-fatal degradations (e.g. `variator_unavailable`).
    pub warnings: Vec<DispatchErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchReport {
    pub fn processed(&self) -> u32 {
        self.sent_messages + self.failed_messages
    }
}

/// Replace `{{name}}` and `{{nome}}` with the recipient's name. Without a
/// name the placeholder collapses and surrounding whitespace is tidied.
pub fn render_template(text: &str, name: Option<&str>) -> String {
    if !text.contains("{{name}}") && !text.contains("{{nome}}") {
        return text.to_string();
    }
    let name = name.map(str::trim).unwrap_or("");
    let rendered = text.replace("{{name}}", name).replace("{{nome}}", name);
    if !name.is_empty() {
        return rendered;
    }
    rendered
        .lines()
        .map(|line| {
            let mut collapsed = line.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" ");
            for punct in [",", "!", "?", "."] {
                collapsed = collapsed.replace(&format!(" {punct}"), punct);
            }
            collapsed
        })
        .collect::<Vec<_>>()
        .join("\n")
}
