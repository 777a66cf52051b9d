//! WAHA (WhatsApp HTTP API) session gateway.
//!
//! Each channel is one WAHA session on a self-hosted server. Authentication
//! uses the `X-Api-Key` header; health comes from the session `status` field.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::traits::Gateway;
use zapflow_core::types::{Channel, ChannelFamily, ConnectionState};

use crate::address::waha_chat_id;

/// Session status as reported by `GET /api/sessions/{session}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WahaSessionStatus {
    Starting,
    ScanQrCode,
    Working,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl From<WahaSessionStatus> for ConnectionState {
    fn from(status: WahaSessionStatus) -> Self {
        match status {
            WahaSessionStatus::Working => ConnectionState::Connected,
            WahaSessionStatus::Starting | WahaSessionStatus::ScanQrCode => ConnectionState::Connecting,
            WahaSessionStatus::Failed => ConnectionState::Error,
            WahaSessionStatus::Stopped | WahaSessionStatus::Unknown => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WahaSession {
    status: WahaSessionStatus,
}

/// WAHA gateway implementation.
pub struct WahaGateway {
    client: reqwest::Client,
}

impl WahaGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: crate::http_client(timeout),
        }
    }

    fn url(channel: &Channel, segments: &[&str]) -> Result<reqwest::Url> {
        crate::endpoint_url(&channel.endpoint.base_url, segments)
    }

    fn authorize(&self, req: reqwest::RequestBuilder, channel: &Channel) -> reqwest::RequestBuilder {
        if channel.endpoint.credential.is_empty() {
            req
        } else {
            req.header("X-Api-Key", &channel.endpoint.credential)
        }
    }
}

#[async_trait]
impl Gateway for WahaGateway {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Waha
    }

    async fn check_health(&self, channel: &Channel) -> ConnectionState {
        let url = match Self::url(channel, &["api", "sessions", channel.endpoint.remote_name.as_str()]) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("WAHA probe skipped for {}: {e}", channel.channel_id);
                return ConnectionState::Error;
            }
        };
        let response = match self.authorize(self.client.get(url), channel).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("WAHA probe failed for {}: {e}", channel.channel_id);
                return ConnectionState::Error;
            }
        };

        if !response.status().is_success() {
            tracing::debug!("WAHA probe {} → HTTP {}", channel.channel_id, response.status());
            return ConnectionState::Disconnected;
        }

        match response.json::<WahaSession>().await {
            Ok(session) => session.status.into(),
            Err(e) => {
                tracing::debug!("WAHA probe {}: unreadable session payload: {e}", channel.channel_id);
                ConnectionState::Disconnected
            }
        }
    }

    async fn send_text(&self, channel: &Channel, recipient: &str, text: &str) -> Result<Option<String>> {
        let chat_id = waha_chat_id(recipient)?;
        let body = serde_json::json!({
            "session": channel.endpoint.remote_name,
            "chatId": chat_id,
            "text": text,
        });

        let url = Self::url(channel, &["api", "sendText"])?;
        let response = self
            .authorize(self.client.post(url), channel)
            .json(&body)
            .send()
            .await
            .map_err(|e| ZapflowError::GatewaySend(format!("WAHA request failed: {e}")))?;

        let status = response.status();
        let payload = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ZapflowError::GatewaySend(format!("WAHA API error {status}: {payload}")));
        }

        // `id` is either a plain string or `{ "_serialized": "..." }` depending on the engine.
        let result: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
        let msg_id = result["id"]["_serialized"]
            .as_str()
            .or_else(|| result["id"].as_str())
            .map(String::from);

        tracing::debug!("WAHA message sent via {}: {:?} → {}", channel.channel_id, msg_id, chat_id);
        Ok(msg_id)
    }

    async fn reconnect(&self, channel: &Channel) -> Result<()> {
        let url = Self::url(channel, &["api", "sessions", channel.endpoint.remote_name.as_str(), "start"])?;
        let response = self
            .authorize(self.client.post(url), channel)
            .send()
            .await
            .map_err(|e| ZapflowError::Channel(format!("WAHA session start failed: {e}")))?;

        // 422 means the session is already running.
        let status = response.status();
        if status.is_success() || status.as_u16() == 422 {
            tracing::info!("WAHA session '{}' start requested", channel.endpoint.remote_name);
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ZapflowError::Channel(format!("WAHA session start error {status}: {text}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use zapflow_core::types::ChannelEndpoint;

    fn channel(base_url: String) -> Channel {
        Channel::new(
            "waha-1",
            ChannelFamily::Waha,
            "Main",
            "u1",
            ChannelEndpoint {
                base_url,
                credential: "waha-key".into(),
                remote_name: "default".into(),
            },
        )
    }

    #[tokio::test]
    async fn working_session_is_connected() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/sessions/default").header("X-Api-Key", "waha-key");
                then.status(200).json_body(serde_json::json!({"name": "default", "status": "WORKING"}));
            })
            .await;

        let gw = WahaGateway::new(Duration::from_secs(5));
        assert_eq!(gw.check_health(&channel(server.base_url())).await, ConnectionState::Connected);
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn qr_pending_and_missing_sessions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/sessions/default");
                then.status(200).json_body(serde_json::json!({"name": "default", "status": "SCAN_QR_CODE"}));
            })
            .await;
        let gw = WahaGateway::new(Duration::from_secs(5));
        assert_eq!(gw.check_health(&channel(server.base_url())).await, ConnectionState::Connecting);

        let missing = MockServer::start_async().await;
        missing
            .mock_async(|when, then| {
                when.method(GET).path("/api/sessions/default");
                then.status(404);
            })
            .await;
        assert_eq!(gw.check_health(&channel(missing.base_url())).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_server_is_error() {
        let gw = WahaGateway::new(Duration::from_millis(500));
        let state = gw.check_health(&channel("http://127.0.0.1:9".into())).await;
        assert_eq!(state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn send_text_posts_chat_id() {
        let server = MockServer::start_async().await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/sendText")
                    .header("X-Api-Key", "waha-key")
                    .body_includes("\"chatId\":\"5511999998888@c.us\"")
                    .body_includes("\"session\":\"default\"");
                then.status(201)
                    .json_body(serde_json::json!({"id": {"_serialized": "true_5511999998888@c.us_ABC"}}));
            })
            .await;

        let gw = WahaGateway::new(Duration::from_secs(5));
        let id = gw
            .send_text(&channel(server.base_url()), "+55 11 99999-8888", "Olá")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("true_5511999998888@c.us_ABC"));
        send.assert_async().await;
    }

    #[tokio::test]
    async fn send_text_surfaces_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/sendText");
                then.status(500).body("session not ready");
            })
            .await;

        let gw = WahaGateway::new(Duration::from_secs(5));
        let err = gw
            .send_text(&channel(server.base_url()), "5511999998888", "Olá")
            .await
            .unwrap_err();
        assert!(matches!(err, ZapflowError::GatewaySend(_)));
        assert!(err.to_string().contains("session not ready"));
    }

    #[tokio::test]
    async fn invalid_recipient_never_hits_the_backend() {
        let gw = WahaGateway::new(Duration::from_secs(5));
        let err = gw
            .send_text(&channel("http://127.0.0.1:9".into()), "12", "Olá")
            .await
            .unwrap_err();
        assert!(matches!(err, ZapflowError::InvalidRecipient(_)));
    }
}
