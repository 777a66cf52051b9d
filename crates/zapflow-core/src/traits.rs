//! Gateway adapter trait: one implementation per backend family.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Channel, ChannelFamily, ConnectionState};

/// Translates "send text to recipient via channel" into a backend's HTTP contract.
///
/// Implementations normalize recipient addresses themselves and bound every
/// request with their own timeout; the dispatch engine applies none.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Family this adapter serves.
    fn family(&self) -> ChannelFamily;

    /// Probe the backend. Never fails: any error is reported as a non-connected state.
    async fn check_health(&self, channel: &Channel) -> ConnectionState;

    /// Send one text message. Returns the backend message id when one is reported.
    async fn send_text(&self, channel: &Channel, recipient: &str, text: &str) -> Result<Option<String>>;

    /// Ask the backend to (re)establish the session. Stateless backends succeed trivially.
    async fn reconnect(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }
}
