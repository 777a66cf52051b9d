//! Evolution API instance gateway.
//!
//! Evolution reports connectivity in several shapes depending on the server
//! version and endpoint: `{instance: {state}}`, a flat `{state}`, or
//! `{connectionStatus}`. All of them are folded into [`EvolutionState`] here so
//! nothing above this module sniffs fields.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::traits::Gateway;
use zapflow_core::types::{Channel, ChannelFamily, ConnectionState};

use crate::address::normalize_phone;

#[derive(Debug, Deserialize)]
struct InstanceState {
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "connectionStatus")]
    connection_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConnectionStateResponse {
    Nested { instance: InstanceState },
    Flat(InstanceState),
}

impl ConnectionStateResponse {
    fn raw_state(&self) -> Option<&str> {
        let inner = match self {
            ConnectionStateResponse::Nested { instance } => instance,
            ConnectionStateResponse::Flat(flat) => flat,
        };
        inner.state.as_deref().or(inner.connection_status.as_deref())
    }
}

/// Normalized Evolution connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionState {
    Open,
    Connecting,
    Close,
    Unknown,
}

impl EvolutionState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "open" | "connected" => EvolutionState::Open,
            "connecting" => EvolutionState::Connecting,
            "close" | "closed" | "disconnected" => EvolutionState::Close,
            _ => EvolutionState::Unknown,
        }
    }
}

impl From<EvolutionState> for ConnectionState {
    fn from(state: EvolutionState) -> Self {
        match state {
            EvolutionState::Open => ConnectionState::Connected,
            EvolutionState::Connecting => ConnectionState::Connecting,
            EvolutionState::Close | EvolutionState::Unknown => ConnectionState::Disconnected,
        }
    }
}

/// Evolution API gateway implementation.
pub struct EvolutionGateway {
    client: reqwest::Client,
}

impl EvolutionGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: crate::http_client(timeout),
        }
    }

    /// `{base}/{group}/{action}/{instance}`.
    fn url(channel: &Channel, group: &str, action: &str) -> Result<reqwest::Url> {
        crate::endpoint_url(&channel.endpoint.base_url, &[group, action, channel.endpoint.remote_name.as_str()])
    }

    /// Parse any of the known connection-state payloads.
    pub fn parse_state(payload: &serde_json::Value) -> EvolutionState {
        serde_json::from_value::<ConnectionStateResponse>(payload.clone())
            .ok()
            .and_then(|r| r.raw_state().map(EvolutionState::parse))
            .unwrap_or(EvolutionState::Unknown)
    }
}

#[async_trait]
impl Gateway for EvolutionGateway {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Evolution
    }

    async fn check_health(&self, channel: &Channel) -> ConnectionState {
        let url = match Self::url(channel, "instance", "connectionState") {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("Evolution probe skipped for {}: {e}", channel.channel_id);
                return ConnectionState::Error;
            }
        };
        let response = match self
            .client
            .get(url)
            .header("apikey", &channel.endpoint.credential)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Evolution probe failed for {}: {e}", channel.channel_id);
                return ConnectionState::Error;
            }
        };

        if !response.status().is_success() {
            tracing::debug!("Evolution probe {} → HTTP {}", channel.channel_id, response.status());
            return ConnectionState::Disconnected;
        }

        match response.json::<serde_json::Value>().await {
            Ok(payload) => Self::parse_state(&payload).into(),
            Err(_) => ConnectionState::Disconnected,
        }
    }

    async fn send_text(&self, channel: &Channel, recipient: &str, text: &str) -> Result<Option<String>> {
        let number = normalize_phone(recipient)?;
        let body = serde_json::json!({
            "number": number,
            "text": text,
        });

        let url = Self::url(channel, "message", "sendText")?;
        let response = self
            .client
            .post(url)
            .header("apikey", &channel.endpoint.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| ZapflowError::GatewaySend(format!("Evolution request failed: {e}")))?;

        let status = response.status();
        let payload = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ZapflowError::GatewaySend(format!(
                "Evolution API error {status}: {payload}"
            )));
        }

        let result: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
        let msg_id = result["key"]["id"].as_str().map(String::from);
        tracing::debug!("Evolution message sent via {}: {:?} → {}", channel.channel_id, msg_id, number);
        Ok(msg_id)
    }

    async fn reconnect(&self, channel: &Channel) -> Result<()> {
        let url = Self::url(channel, "instance", "connect")?;
        let response = self
            .client
            .get(url)
            .header("apikey", &channel.endpoint.credential)
            .send()
            .await
            .map_err(|e| ZapflowError::Channel(format!("Evolution connect failed: {e}")))?;

        if response.status().is_success() {
            tracing::info!("Evolution instance '{}' connect requested", channel.endpoint.remote_name);
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(ZapflowError::Channel(format!("Evolution connect error {status}: {text}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use zapflow_core::types::ChannelEndpoint;

    fn channel(base_url: String) -> Channel {
        Channel::new(
            "evo-1",
            ChannelFamily::Evolution,
            "Vendas",
            "u1",
            ChannelEndpoint {
                base_url,
                credential: "evo-key".into(),
                remote_name: "vendas".into(),
            },
        )
    }

    #[test]
    fn all_response_shapes_parse() {
        assert_eq!(
            EvolutionGateway::parse_state(&json!({"instance": {"instanceName": "vendas", "state": "open"}})),
            EvolutionState::Open
        );
        assert_eq!(EvolutionGateway::parse_state(&json!({"state": "connecting"})), EvolutionState::Connecting);
        assert_eq!(
            EvolutionGateway::parse_state(&json!({"connectionStatus": "close"})),
            EvolutionState::Close
        );
        assert_eq!(EvolutionGateway::parse_state(&json!({"unexpected": true})), EvolutionState::Unknown);
        assert_eq!(EvolutionGateway::parse_state(&json!("open")), EvolutionState::Unknown);
    }

    #[tokio::test]
    async fn open_instance_is_connected() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/instance/connectionState/vendas")
                    .header("apikey", "evo-key");
                then.status(200).json_body(json!({"instance": {"instanceName": "vendas", "state": "open"}}));
            })
            .await;

        let gw = EvolutionGateway::new(Duration::from_secs(5));
        assert_eq!(gw.check_health(&channel(server.base_url())).await, ConnectionState::Connected);
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_probe_is_disconnected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/instance/connectionState/vendas");
                then.status(401).json_body(json!({"error": "Unauthorized"}));
            })
            .await;

        let gw = EvolutionGateway::new(Duration::from_secs(5));
        assert_eq!(gw.check_health(&channel(server.base_url())).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_text_uses_digits_only() {
        let server = MockServer::start_async().await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/message/sendText/vendas")
                    .header("apikey", "evo-key")
                    .body_includes("\"number\":\"5511988887777\"");
                then.status(201).json_body(json!({"key": {"id": "3EB0ABC"}, "status": "PENDING"}));
            })
            .await;

        let gw = EvolutionGateway::new(Duration::from_secs(5));
        let id = gw
            .send_text(&channel(server.base_url()), "+55 11 98888-7777", "Oi")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("3EB0ABC"));
        send.assert_async().await;
    }

    #[tokio::test]
    async fn reconnect_calls_connect_endpoint() {
        let server = MockServer::start_async().await;
        let connect = server
            .mock_async(|when, then| {
                when.method(GET).path("/instance/connect/vendas");
                then.status(200).json_body(json!({"pairingCode": null, "code": "2@abc"}));
            })
            .await;

        let gw = EvolutionGateway::new(Duration::from_secs(5));
        gw.reconnect(&channel(server.base_url())).await.unwrap();
        connect.assert_async().await;
    }
}
