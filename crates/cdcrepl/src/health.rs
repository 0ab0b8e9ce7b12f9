//! # Replicator health
//!
//! State and counters shared between the replication task and its handle.
//! The task is the only writer; `ok()` and friends read without blocking it.

use crate::position::Gtid;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle of the replication task. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplicatorState {
    Connecting = 0,
    Streaming = 1,
    Recovering = 2,
    Stopped = 3,
}

impl ReplicatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Streaming,
            2 => Self::Recovering,
            _ => Self::Stopped,
        }
    }

    /// Liveness: everything except `Stopped`.
    pub fn is_live(self) -> bool {
        self != Self::Stopped
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Recovering => "recovering",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug)]
pub(crate) struct SharedStatus {
    state: AtomicU8,
    position: RwLock<Option<Gtid>>,
    last_error: Mutex<Option<String>>,
    transactions: AtomicU64,
    rows: AtomicU64,
    reconnects: AtomicU64,
    schema_refreshes: AtomicU64,
    started: Instant,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ReplicatorState::Connecting as u8),
            position: RwLock::new(None),
            last_error: Mutex::new(None),
            transactions: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            schema_refreshes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> ReplicatorState {
        ReplicatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the previous state. Once `Stopped`, stays `Stopped`.
    pub fn set_state(&self, next: ReplicatorState) -> ReplicatorState {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != ReplicatorState::Stopped as u8).then_some(next as u8)
            })
            .unwrap_or_else(|cur| cur);
        ReplicatorState::from_u8(prev)
    }

    pub fn position(&self) -> Option<Gtid> {
        *self.position.read()
    }

    pub fn publish_position(&self, gtid: Gtid) {
        *self.position.write() = Some(gtid);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn record_commit(&self, rows: usize) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_refresh(&self) {
        self.schema_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state(),
            position: self.position(),
            last_error: self.last_error(),
            transactions: self.transactions.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            schema_refreshes: self.schema_refreshes.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}

/// Point-in-time view of the replicator.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: ReplicatorState,
    /// Last durably committed position
    pub position: Option<Gtid>,
    pub last_error: Option<String>,
    /// Transactions committed to the sink (empty ones included)
    pub transactions: u64,
    pub rows: u64,
    pub reconnects: u64,
    pub schema_refreshes: u64,
    pub uptime: Duration,
}

impl HealthSnapshot {
    pub fn is_ok(&self) -> bool {
        self.state.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let status = SharedStatus::new();
        let snap = status.snapshot();
        assert_eq!(snap.state, ReplicatorState::Connecting);
        assert!(snap.is_ok());
        assert!(snap.position.is_none());
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn test_stopped_is_terminal() {
        let status = SharedStatus::new();
        assert_eq!(
            status.set_state(ReplicatorState::Streaming),
            ReplicatorState::Connecting
        );
        status.set_state(ReplicatorState::Stopped);
        assert_eq!(
            status.set_state(ReplicatorState::Connecting),
            ReplicatorState::Stopped
        );
        assert_eq!(status.state(), ReplicatorState::Stopped);
        assert!(!status.snapshot().is_ok());
    }

    #[test]
    fn test_counters_and_position() {
        let status = SharedStatus::new();
        status.record_commit(3);
        status.record_commit(0);
        status.record_reconnect();
        status.publish_position(Gtid::new(0, 1, 9));
        status.set_error("boom");

        let snap = status.snapshot();
        assert_eq!(snap.transactions, 2);
        assert_eq!(snap.rows, 3);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.position, Some(Gtid::new(0, 1, 9)));
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ReplicatorState::Recovering.to_string(), "recovering");
    }
}
