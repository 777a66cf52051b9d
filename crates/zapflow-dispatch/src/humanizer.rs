//! Humanizer / Pacer: plans the steps and delays for one recipient.
//!
//! Planning is pure: it returns what to send and how long to wait before each
//! message. Waiting is the engine's job.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use zapflow_core::config::DispatchConfig;

/// Per-job pacing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacingConfig {
    #[serde(default)]
    pub humanize: bool,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

impl PacingConfig {
    pub fn from_defaults(config: &DispatchConfig) -> Self {
        Self {
            humanize: false,
            base_delay_ms: config.base_delay_ms,
            jitter_ms: config.jitter_ms,
        }
    }

    /// No waiting at all.
    pub fn immediate() -> Self {
        Self {
            humanize: false,
            base_delay_ms: 0,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Greeting,
    Intermediate,
    Payload,
}

/// One message to send after waiting `delay_before_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub kind: StepKind,
    pub text: String,
    pub delay_before_ms: u64,
}

/// Uniform integer in `[min, max]`; `min` when the range is empty or inverted.
pub fn calculate_delay<R: Rng + ?Sized>(min: u64, max: u64, rng: &mut R) -> u64 {
    if min >= max {
        return min;
    }
    rng.gen_range(min..=max)
}

#[derive(Debug, Clone)]
pub struct Humanizer {
    greetings: Vec<String>,
    fillers: Vec<String>,
    step_delay_min_ms: u64,
    step_delay_max_ms: u64,
}

impl Humanizer {
    pub fn new(greetings: Vec<String>, fillers: Vec<String>, step_delay_min_ms: u64, step_delay_max_ms: u64) -> Self {
        Self {
            greetings,
            fillers,
            step_delay_min_ms,
            step_delay_max_ms,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.greetings.clone(),
            config.fillers.clone(),
            config.step_delay_min_ms,
            config.step_delay_max_ms,
        )
    }

    /// Plan using the thread RNG.
    pub fn plan_steps(&self, message: &str, pacing: &PacingConfig) -> Vec<Step> {
        self.plan_steps_with(message, pacing, &mut rand::thread_rng())
    }

    /// Without humanization: one payload step after `base + jitter`.
    /// With it: greeting, filler, payload; the greeting carries the
    /// inter-recipient delay and the later steps a typing-cadence delay.
    /// An empty phrase list skips that step.
    pub fn plan_steps_with<R: Rng + ?Sized>(&self, message: &str, pacing: &PacingConfig, rng: &mut R) -> Vec<Step> {
        let lead_delay = pacing.base_delay_ms.saturating_add(calculate_delay(0, pacing.jitter_ms, rng));

        if !pacing.humanize {
            return vec![Step {
                kind: StepKind::Payload,
                text: message.to_string(),
                delay_before_ms: lead_delay,
            }];
        }

        let mut steps = Vec::with_capacity(3);
        if let Some(greeting) = self.greetings.choose(rng) {
            steps.push(Step {
                kind: StepKind::Greeting,
                text: greeting.clone(),
                delay_before_ms: lead_delay,
            });
        }
        if let Some(filler) = self.fillers.choose(rng) {
            steps.push(Step {
                kind: StepKind::Intermediate,
                text: filler.clone(),
                delay_before_ms: self.step_delay(steps.is_empty(), lead_delay, rng),
            });
        }
        let delay = self.step_delay(steps.is_empty(), lead_delay, rng);
        steps.push(Step {
            kind: StepKind::Payload,
            text: message.to_string(),
            delay_before_ms: delay,
        });
        steps
    }

    fn step_delay<R: Rng + ?Sized>(&self, first: bool, lead_delay: u64, rng: &mut R) -> u64 {
        if first {
            lead_delay
        } else {
            calculate_delay(self.step_delay_min_ms, self.step_delay_max_ms, rng)
        }
    }
}

impl Default for Humanizer {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}
