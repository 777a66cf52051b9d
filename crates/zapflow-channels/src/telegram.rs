//! Telegram Bot gateway: `getMe` probe + `sendMessage` via Bot API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::traits::Gateway;
use zapflow_core::types::{Channel, ChannelFamily, ConnectionState};

use crate::address::telegram_target;

/// Telegram Bot gateway implementation.
pub struct TelegramGateway {
    client: reqwest::Client,
}

impl TelegramGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: crate::http_client(timeout),
        }
    }

    fn api_url(channel: &Channel, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            channel.endpoint.base_url.trim_end_matches('/'),
            channel.endpoint.credential,
            method
        )
    }

    /// Get bot info.
    pub async fn get_me(&self, channel: &Channel) -> Result<TelegramUser> {
        let response = self
            .client
            .get(Self::api_url(channel, "getMe"))
            .send()
            .await
            .map_err(|e| ZapflowError::Channel(format!("getMe failed: {e}")))?;
        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| ZapflowError::Channel(format!("Invalid getMe response: {e}")))?;
        if !body.ok {
            return Err(ZapflowError::Channel(format!(
                "getMe rejected: {}",
                body.description.unwrap_or_default()
            )));
        }
        body.result
            .ok_or_else(|| ZapflowError::Channel("No bot info".into()))
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Telegram
    }

    async fn check_health(&self, channel: &Channel) -> ConnectionState {
        match self.get_me(channel).await {
            Ok(me) => {
                tracing::debug!(
                    "Telegram bot {}: @{}",
                    channel.channel_id,
                    me.username.as_deref().unwrap_or("unknown")
                );
                ConnectionState::Connected
            }
            Err(e) => {
                tracing::debug!("Telegram probe failed for {}: {e}", channel.channel_id);
                ConnectionState::Disconnected
            }
        }
    }

    async fn send_text(&self, channel: &Channel, recipient: &str, text: &str) -> Result<Option<String>> {
        let target = telegram_target(recipient)?;
        let body = serde_json::json!({
            "chat_id": target.to_json(),
            "text": text,
        });

        let response = self
            .client
            .post(Self::api_url(channel, "sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ZapflowError::GatewaySend(format!("sendMessage failed: {e}")))?;

        let status = response.status();
        let result: TelegramApiResponse<TelegramMessage> = response
            .json()
            .await
            .map_err(|e| ZapflowError::GatewaySend(format!("Invalid send response ({status}): {e}")))?;

        if !result.ok {
            return Err(ZapflowError::GatewaySend(format!(
                "Send failed: {}",
                result.description.unwrap_or_default()
            )));
        }
        Ok(result.result.map(|m| m.message_id.to_string()))
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}
