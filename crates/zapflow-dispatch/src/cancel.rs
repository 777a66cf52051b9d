//! Out-of-band stop signals, polled by the engine between recipients.
//!
//! An entry lives from submission until the job reaches a terminal state, so
//! the registry doubles as the set of live session ids and their state.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::job::JobState;

/// Shared flag for one running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct LiveJob {
    token: CancelToken,
    state: JobState,
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    jobs: Mutex<HashMap<String, LiveJob>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `session_id` for a new job in `Pending`. `None` while another
    /// job still holds the id.
    pub fn claim(&self, session_id: &str) -> Option<CancelToken> {
        match self.lock().entry(session_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancelToken::default();
                slot.insert(LiveJob {
                    token: token.clone(),
                    state: JobState::Pending,
                });
                Some(token)
            }
        }
    }

    pub fn set_state(&self, session_id: &str, state: JobState) {
        if let Some(job) = self.lock().get_mut(session_id) {
            job.state = state;
        }
    }

    /// State of a live job; `None` once it has been released.
    pub fn state(&self, session_id: &str) -> Option<JobState> {
        self.lock().get(session_id).map(|job| job.state)
    }

    /// Raise the stop flag. Returns false if no job holds the id.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(job) => {
                job.token.cancel();
                tracing::info!("🛑 Stop requested for {}", session_id);
                true
            }
            None => false,
        }
    }

    /// Forget a finished job.
    pub fn release(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }
}

/// Releases the claimed id when dropped, including on unwind.
pub(crate) struct ClaimGuard {
    registry: Arc<CancellationRegistry>,
    session_id: String,
}

impl ClaimGuard {
    pub(crate) fn new(registry: Arc<CancellationRegistry>, session_id: String) -> Self {
        Self { registry, session_id }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session_id);
    }
}
