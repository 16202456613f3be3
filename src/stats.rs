//! Engine-wide observability counters, grounded on the teacher crate's
//! `RouterHandle::get_stats()` snapshot pattern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time snapshot of engine activity, returned by
/// [`crate::Engine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub commands_sent: u64,
    pub acks_received: u64,
    pub naks_received: u64,
    pub notifications_dispatched: u64,
    pub notifications_dropped: u64,
    pub sequence_gaps: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    commands_sent: AtomicU64,
    acks_received: AtomicU64,
    naks_received: AtomicU64,
    reconnects: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nak(&self) {
        self.naks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        notifications_dispatched: u64,
        notifications_dropped: u64,
        sequence_gaps: u64,
    ) -> EngineStats {
        EngineStats {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            naks_received: self.naks_received.load(Ordering::Relaxed),
            notifications_dispatched,
            notifications_dropped,
            sequence_gaps,
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
