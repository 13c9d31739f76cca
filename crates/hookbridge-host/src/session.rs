//! Per-invocation sessions.
//!
//! Every hook invocation (and every CLI `call`) runs inside one [`Session`].
//! Transactions are owned by the session that opened them; a handle presented
//! from any other session is rejected.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Identity and counters of one invocation.
#[derive(Debug)]
pub struct Session {
    id: String,
    opened_at: DateTime<Utc>,
    calls: AtomicU64,
}

impl Session {
    /// Start a session with a fresh UUIDv7 id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            opened_at: Utc::now(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Count one dispatched host call.
    pub fn record_call(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Host calls dispatched so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_have_distinct_ids() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn call_counter() {
        let s = Session::new();
        assert_eq!(s.record_call(), 1);
        assert_eq!(s.record_call(), 2);
        assert_eq!(s.calls(), 2);
    }
}
