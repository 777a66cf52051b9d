//! # Zapflow Dispatch
//! Bulk-send core: channel selection, humanized pacing, message variation,
//! progress tracking and the per-job dispatch loop.

pub mod balancer;
pub mod cancel;
pub mod engine;
pub mod history;
pub mod humanizer;
pub mod job;
pub mod progress;
pub mod variator;

pub use balancer::{Strategy, select_channel};
pub use cancel::{CancelToken, CancellationRegistry};
pub use engine::DispatchEngine;
pub use history::{DeliveryLog, SqliteDeliveryLog};
pub use humanizer::{Humanizer, PacingConfig};
pub use job::{ChannelPolicy, DispatchErrorKind, DispatchJob, DispatchReport, JobState, Recipient};
pub use progress::{InMemoryProgressStore, ProgressRecord, ProgressStore, spawn_progress_sweeper};
pub use variator::{HttpVariator, SynonymVariator, Variator};
