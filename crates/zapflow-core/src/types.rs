//! Shared data model: channels, connection states and delivery outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend family a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFamily {
    /// A WAHA (WhatsApp HTTP API) session.
    Waha,
    /// An Evolution API instance.
    Evolution,
    /// A Telegram bot.
    Telegram,
}

impl ChannelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelFamily::Waha => "waha",
            ChannelFamily::Evolution => "evolution",
            ChannelFamily::Telegram => "telegram",
        }
    }

    /// Whether recipients on this family are phone numbers.
    pub fn is_phone_based(&self) -> bool {
        matches!(self, ChannelFamily::Waha | ChannelFamily::Evolution)
    }
}

impl std::fmt::Display for ChannelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waha" | "whatsapp" => Ok(ChannelFamily::Waha),
            "evolution" | "evolution_api" => Ok(ChannelFamily::Evolution),
            "telegram" => Ok(ChannelFamily::Telegram),
            other => Err(format!("unknown channel family: {other}")),
        }
    }
}

/// Live connectivity state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// Only connected channels may be selected for sending.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where and how to reach a channel's backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    /// Base URL of the backend (WAHA/Evolution server, or Telegram API base).
    pub base_url: String,
    /// `X-Api-Key` for WAHA, `apikey` for Evolution, bot token for Telegram.
    #[serde(default, skip_serializing)]
    pub credential: String,
    /// Backend-side name: WAHA session name or Evolution instance name.
    #[serde(default)]
    pub remote_name: String,
}

/// A sending endpoint snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub family: ChannelFamily,
    pub display_name: String,
    pub owner_user_id: String,
    pub endpoint: ChannelEndpoint,
    pub connection_state: ConnectionState,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Monotonic count of messages delivered through this channel.
    pub total_sent: u64,
}

impl Channel {
    pub fn new(
        channel_id: impl Into<String>,
        family: ChannelFamily,
        display_name: impl Into<String>,
        owner_user_id: impl Into<String>,
        endpoint: ChannelEndpoint,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            family,
            display_name: display_name.into(),
            owner_user_id: owner_user_id.into(),
            endpoint,
            connection_state: ConnectionState::Connecting,
            last_seen_at: None,
            total_sent: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state.is_usable()
    }

    /// Builder-style state override, handy when assembling fixtures.
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    pub fn with_total_sent(mut self, total_sent: u64) -> Self {
        self.total_sent = total_sent;
        self
    }
}

/// Per-recipient result of a dispatch step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub address: String,
    pub channel_used: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryOutcome {
    pub fn sent(address: &str, channel_id: &str) -> Self {
        Self {
            address: address.to_string(),
            channel_used: Some(channel_id.to_string()),
            success: true,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(address: &str, channel_id: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            channel_used: channel_id.map(String::from),
            success: false,
            error_message: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}
