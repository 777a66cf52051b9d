//! Channel Registry: known sending channels and their live connectivity.
//!
//! Channels that fail a probe, or rack up too many consecutive send failures,
//! drop out of selection. Nothing is blacklisted for good: the next probe that
//! sees the backend healthy restores `connected`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use zapflow_core::error::{Result, ZapflowError};
use zapflow_core::traits::Gateway;
use zapflow_core::types::{Channel, ChannelFamily, ConnectionState};

use crate::gateways::Gateways;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    state: ConnectionState,
    last_seen_at: Option<DateTime<Utc>>,
}

/// Per-channel live state. Counters are atomics so concurrent jobs sharing a
/// channel keep `total_sent` exact.
struct ChannelSlot {
    channel: Channel,
    liveness: Mutex<Liveness>,
    total_sent: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl ChannelSlot {
    fn new(channel: Channel) -> Self {
        let liveness = Liveness {
            state: channel.connection_state,
            last_seen_at: channel.last_seen_at,
        };
        let total_sent = AtomicU64::new(channel.total_sent);
        Self {
            channel,
            liveness: Mutex::new(liveness),
            total_sent,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn liveness(&self) -> Liveness {
        *self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState, seen: bool) {
        let mut live = self.liveness.lock().unwrap_or_else(PoisonError::into_inner);
        live.state = state;
        if seen {
            live.last_seen_at = Some(Utc::now());
        }
    }

    fn mark_seen(&self) {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner).last_seen_at = Some(Utc::now());
    }

    fn snapshot(&self) -> Channel {
        let live = self.liveness();
        let mut channel = self.channel.clone();
        channel.connection_state = live.state;
        channel.last_seen_at = live.last_seen_at;
        channel.total_sent = self.total_sent.load(Ordering::Relaxed);
        channel
    }
}

/// Registry of sending channels keyed by `channel_id`.
pub struct ChannelRegistry {
    slots: RwLock<HashMap<String, Arc<ChannelSlot>>>,
    gateways: Gateways,
    max_consecutive_failures: u32,
}

impl ChannelRegistry {
    pub fn new(gateways: Gateways, max_consecutive_failures: u32) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            gateways,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// Register or replace a channel.
    pub fn register(&self, channel: Channel) {
        tracing::info!(
            "📡 Channel registered: {} ({}, owner={})",
            channel.channel_id,
            channel.family,
            channel.owner_user_id
        );
        let id = channel.channel_id.clone();
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(ChannelSlot::new(channel)));
    }

    fn slot(&self, channel_id: &str) -> Option<Arc<ChannelSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<ChannelSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, channel_id: &str) -> Option<Channel> {
        self.slot(channel_id).map(|s| s.snapshot())
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots filtered by owner and family, ordered by id.
    pub fn list(&self, owner_user_id: Option<&str>, family: Option<ChannelFamily>) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .all_slots()
            .iter()
            .map(|s| s.snapshot())
            .filter(|c| owner_user_id.is_none_or(|o| c.owner_user_id == o))
            .filter(|c| family.is_none_or(|f| c.family == f))
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    /// Connected channels of one family belonging to `owner_user_id`.
    pub fn list_eligible(&self, owner_user_id: &str, family: ChannelFamily) -> Vec<Channel> {
        self.list(Some(owner_user_id), Some(family))
            .into_iter()
            .filter(Channel::is_connected)
            .collect()
    }

    pub fn gateway(&self, family: ChannelFamily) -> Option<Arc<dyn Gateway>> {
        self.gateways.get(family)
    }

    /// Force a state (manual override, or a state learned out of band).
    pub fn set_state(&self, channel_id: &str, state: ConnectionState) -> Result<()> {
        let slot = self
            .slot(channel_id)
            .ok_or_else(|| ZapflowError::ChannelNotFound(channel_id.to_string()))?;
        slot.set_state(state, state.is_usable());
        if state.is_usable() {
            slot.consecutive_failures.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Probe one channel through its adapter and store the result.
    ///
    /// Probe problems never surface as errors: a missing adapter or a failed
    /// probe simply leaves the channel unusable. Only an unknown id is an error.
    pub async fn refresh_health(&self, channel_id: &str) -> Result<ConnectionState> {
        let slot = self
            .slot(channel_id)
            .ok_or_else(|| ZapflowError::ChannelNotFound(channel_id.to_string()))?;
        Ok(self.probe_slot(&slot).await)
    }

    async fn probe_slot(&self, slot: &ChannelSlot) -> ConnectionState {
        let snapshot = slot.snapshot();
        let previous = snapshot.connection_state;
        let state = match self.gateways.get(snapshot.family) {
            Some(gw) => gw.check_health(&snapshot).await,
            None => {
                tracing::warn!("⚠️ No gateway for family {} (channel {})", snapshot.family, snapshot.channel_id);
                ConnectionState::Error
            }
        };

        slot.set_state(state, state.is_usable());
        if state.is_usable() {
            slot.consecutive_failures.store(0, Ordering::Relaxed);
        }
        if state != previous {
            tracing::info!("🔌 Channel {}: {} → {}", snapshot.channel_id, previous, state);
        }
        state
    }

    /// Probe every registered channel, one after another.
    pub async fn refresh_all(&self) -> Vec<(String, ConnectionState)> {
        let mut results = Vec::new();
        for slot in self.all_slots() {
            let state = self.probe_slot(&slot).await;
            results.push((slot.channel.channel_id.clone(), state));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Ask the backend to re-establish the session; the channel goes to
    /// `connecting` until the next probe confirms it.
    pub async fn reconnect(&self, channel_id: &str) -> Result<()> {
        let slot = self
            .slot(channel_id)
            .ok_or_else(|| ZapflowError::ChannelNotFound(channel_id.to_string()))?;
        let snapshot = slot.snapshot();
        let gw = self
            .gateways
            .get(snapshot.family)
            .ok_or_else(|| ZapflowError::Channel(format!("no gateway for {}", snapshot.family)))?;
        gw.reconnect(&snapshot).await?;
        slot.set_state(ConnectionState::Connecting, false);
        Ok(())
    }

    /// Count `messages` delivered through a channel and clear its failure streak.
    pub fn record_success(&self, channel_id: &str, messages: u64) {
        if let Some(slot) = self.slot(channel_id) {
            slot.total_sent.fetch_add(messages, Ordering::Relaxed);
            slot.consecutive_failures.store(0, Ordering::Relaxed);
            slot.mark_seen();
        }
    }

    /// Count a send failure; too many in a row demote the channel to `error`.
    pub fn record_failure(&self, channel_id: &str) {
        let Some(slot) = self.slot(channel_id) else {
            return;
        };
        let failures = slot.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_consecutive_failures && slot.liveness().state.is_usable() {
            slot.set_state(ConnectionState::Error, false);
            tracing::warn!(
                "⚠️ Channel {} demoted after {} consecutive failures",
                channel_id,
                failures
            );
        }
    }
}

/// Spawn the background health monitor: probes every channel each `interval_secs`.
pub fn spawn_health_monitor(
    registry: Arc<ChannelRegistry>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("🩺 Channel health monitor started (every {}s)", interval_secs);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            let results = registry.refresh_all().await;
            let connected = results.iter().filter(|(_, s)| s.is_usable()).count();
            tracing::debug!("🩺 Health sweep: {}/{} channels connected", connected, results.len());
        }
    })
}
