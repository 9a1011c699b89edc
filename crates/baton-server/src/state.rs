use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use baton_core::{BatonError, Result};

/// Finished or abandoned entries are dropped after this long.
const STALE_AFTER: Duration = Duration::from_secs(1800);

/// Tracked state of one in-flight request.
#[derive(Debug)]
pub struct RequestState {
    pub created_at: Instant,
    kill_switch: AtomicBool,
    finalized: AtomicBool,
}

impl RequestState {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            kill_switch: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        }
    }

    /// Polled at safe points: between contexts, workflow steps, and
    /// tool-loop rounds.
    pub fn killed(&self) -> bool {
        self.kill_switch.load(Ordering::Relaxed)
    }

    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Relaxed);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }
}

/// In-flight request tracking keyed `(user_id, request_id)`. Creation is
/// exclusive — replaying a live request id fails.
#[derive(Default)]
pub struct RequestRegistry {
    entries: DashMap<(String, String), Arc<RequestState>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: &str, request_id: &str) -> Result<Arc<RequestState>> {
        let key = (user_id.to_string(), request_id.to_string());
        let state = Arc::new(RequestState::new());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BatonError::InvalidRequest(
                format!("request id {request_id} is already in flight"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(state)
            }
        }
    }

    /// Flip the kill switch for a request. Returns whether it was found.
    pub fn set_kill_switch(&self, user_id: &str, request_id: &str, value: bool) -> bool {
        let key = (user_id.to_string(), request_id.to_string());
        match self.entries.get(&key) {
            Some(state) => {
                info!(user = %user_id, request = %request_id, value, "kill switch set");
                state.kill_switch.store(value, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove a completed request.
    pub fn remove(&self, user_id: &str, request_id: &str) {
        self.entries
            .remove(&(user_id.to_string(), request_id.to_string()));
    }

    /// Drop stale entries. Run from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, state| now.duration_since(state.created_at) < STALE_AFTER);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
