//! Load Balancer: picks the channel that handles the next recipient.
//!
//! Selection is a pure function of the channel set, the strategy, the wall
//! clock second and an RNG, so every strategy is reproducible in tests.
//!
//! `RoundRobin` rotates on `floor(now_secs) mod count` over channels sorted by
//! name. Calls within the same second therefore return the same channel; at
//! one send per second or slower this spreads evenly, faster bursts do not.

use rand::Rng;
use serde::{Deserialize, Serialize};
use zapflow_core::types::Channel;

/// Channel selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::LeastLoaded => write!(f, "least_loaded"),
            Strategy::Random => write!(f, "random"),
        }
    }
}

/// Select among the connected channels. `None` means no capacity, not a defect.
pub fn select_channel_at<R: Rng + ?Sized>(
    channels: &[Channel],
    strategy: Strategy,
    now_secs: i64,
    rng: &mut R,
) -> Option<Channel> {
    let eligible: Vec<&Channel> = channels.iter().filter(|c| c.is_connected()).collect();
    if eligible.is_empty() {
        return None;
    }

    let picked = match strategy {
        Strategy::RoundRobin => {
            let mut sorted = eligible;
            sorted.sort_by(|a, b| {
                a.display_name
                    .cmp(&b.display_name)
                    .then_with(|| a.channel_id.cmp(&b.channel_id))
            });
            let idx = now_secs.rem_euclid(sorted.len() as i64) as usize;
            sorted[idx]
        }
        // `min_by_key` keeps the first of equal minimums.
        Strategy::LeastLoaded => eligible.into_iter().min_by_key(|c| c.total_sent)?,
        Strategy::Random => eligible[rng.gen_range(0..eligible.len())],
    };
    Some(picked.clone())
}

/// Select using the current wall clock and the thread RNG.
pub fn select_channel(channels: &[Channel], strategy: Strategy) -> Option<Channel> {
    let now = chrono::Utc::now().timestamp();
    select_channel_at(channels, strategy, now, &mut rand::thread_rng())
}
